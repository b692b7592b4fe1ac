//! Ordered, in-memory key store and the shared handle readers go through.

use std::sync::{Arc, PoisonError, RwLock};

use error_stack::Report;

use crate::error::JwksError;

use super::keys::{KeyRecord, KeyState};

/// Ordered sequence of key records. Insertion order is significant: the last
/// record appended is the newest.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    records: Vec<KeyRecord>,
}

impl KeyStore {
    #[must_use]
    pub fn new(records: Vec<KeyRecord>) -> Self {
        Self { records }
    }

    pub fn append(&mut self, record: KeyRecord) {
        self.records.push(record);
    }

    /// Removes the record with `kid`, returning it, or `None` if absent.
    pub fn remove(&mut self, kid: &str) -> Option<KeyRecord> {
        let index = self.records.iter().position(|r| r.kid == kid)?;
        Some(self.records.remove(index))
    }

    #[must_use]
    pub fn all(&self) -> &[KeyRecord] {
        &self.records
    }

    #[must_use]
    pub fn find_by_id(&self, kid: &str) -> Option<&KeyRecord> {
        self.records.iter().find(|r| r.kid == kid)
    }

    /// Like [`Self::find_by_id`], but a miss is a [`JwksError::KeyNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::KeyNotFound`] if no record carries `kid`.
    pub fn get(&self, kid: &str) -> Result<&KeyRecord, Report<JwksError>> {
        self.find_by_id(kid).ok_or_else(|| {
            Report::new(JwksError::KeyNotFound {
                kid: kid.to_string(),
            })
        })
    }

    pub fn find_by_id_mut(&mut self, kid: &str) -> Option<&mut KeyRecord> {
        self.records.iter_mut().find(|r| r.kid == kid)
    }

    #[must_use]
    pub fn contains(&self, kid: &str) -> bool {
        self.find_by_id(kid).is_some()
    }

    /// The key new tokens are signed with: the newest signing-capable record.
    #[must_use]
    pub fn signing_key(&self) -> Option<&KeyRecord> {
        self.records.iter().rev().find(|r| r.is_signing_capable())
    }

    pub fn in_state(&self, state: KeyState) -> impl Iterator<Item = &KeyRecord> {
        self.records.iter().filter(move |r| r.state == state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn kids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.kid.clone()).collect()
    }
}

/// Last fully persisted view of the key store, shared by every reader.
///
/// Writers replace the whole view at once; readers clone the `Arc` and keep a
/// consistent snapshot for as long as they hold it.
#[derive(Debug, Default)]
pub struct SharedKeyStore {
    current: RwLock<Arc<KeyStore>>,
}

impl SharedKeyStore {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<KeyStore> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn publish(&self, store: KeyStore) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_signing::keys::KeyAlgorithm;
    use crate::test_support::tests::test_now;

    fn record(state: KeyState) -> KeyRecord {
        let mut record = KeyRecord::generate(KeyAlgorithm::EdDsa, test_now())
            .expect("should generate key");
        record.state = state;
        record
    }

    #[test]
    fn test_append_preserves_order() {
        let mut store = KeyStore::default();
        let a = record(KeyState::Retiring);
        let b = record(KeyState::Active);
        let kids = vec![a.kid.clone(), b.kid.clone()];

        store.append(a);
        store.append(b);

        assert_eq!(store.kids(), kids);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_missing_returns_none() {
        let mut store = KeyStore::new(vec![record(KeyState::Active)]);

        assert!(store.remove("missing").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing_is_key_not_found() {
        let store = KeyStore::new(vec![record(KeyState::Active)]);

        let err = store.get("missing").expect_err("should miss");

        assert!(matches!(
            err.current_context(),
            JwksError::KeyNotFound { kid } if kid == "missing"
        ));
        assert_eq!(store.get(&store.kids()[0]).map(|r| r.state).ok(), Some(KeyState::Active));
    }

    #[test]
    fn test_remove_present() {
        let target = record(KeyState::Retiring);
        let kid = target.kid.clone();
        let mut store = KeyStore::new(vec![target, record(KeyState::Active)]);

        let removed = store.remove(&kid).expect("should remove record");

        assert_eq!(removed.kid, kid);
        assert!(!store.contains(&kid));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_signing_key_prefers_newest_active() {
        let retiring = record(KeyState::Retiring);
        let older_active = record(KeyState::Active);
        let newer_active = record(KeyState::Active);
        let pending = record(KeyState::Pending);
        let expected = newer_active.kid.clone();

        let store = KeyStore::new(vec![retiring, older_active, newer_active, pending]);

        assert_eq!(
            store.signing_key().map(|r| r.kid.clone()),
            Some(expected)
        );
    }

    #[test]
    fn test_signing_key_none_without_active() {
        let store = KeyStore::new(vec![record(KeyState::Retiring), record(KeyState::Pending)]);

        assert!(store.signing_key().is_none());
    }

    #[test]
    fn test_shared_snapshot_is_stable_across_publish() {
        let shared = SharedKeyStore::empty();
        shared.publish(KeyStore::new(vec![record(KeyState::Active)]));

        let before = shared.snapshot();
        shared.publish(KeyStore::default());

        assert_eq!(before.len(), 1);
        assert!(shared.snapshot().is_empty());
    }
}

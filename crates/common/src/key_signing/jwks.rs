//! JSON Web Key Set publication.
//!
//! The published set is a public-only projection of every record in the
//! store, including pending and retiring keys, so tokens signed by a key
//! that was just superseded keep verifying until the key is deleted.

use jose_jwk::JwkSet;

use super::store::KeyStore;

/// Public key set for `store`. Never carries private material.
#[must_use]
pub fn public_key_set(store: &KeyStore) -> JwkSet {
    JwkSet {
        keys: store.all().iter().map(|record| record.public_jwk()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_signing::keys::{KeyAlgorithm, KeyRecord, KeyState};
    use crate::test_support::tests::test_now;

    fn store_with_states(states: &[KeyState]) -> KeyStore {
        KeyStore::new(
            states
                .iter()
                .map(|state| {
                    let mut record = KeyRecord::generate(KeyAlgorithm::EdDsa, test_now())
                        .expect("should generate key");
                    record.state = *state;
                    record
                })
                .collect(),
        )
    }

    #[test]
    fn test_public_key_set_includes_every_state() {
        let store = store_with_states(&[KeyState::Retiring, KeyState::Active, KeyState::Pending]);

        let set = public_key_set(&store);

        let kids: Vec<_> = set
            .keys
            .iter()
            .filter_map(|jwk| jwk.prm.kid.clone())
            .collect();
        assert_eq!(kids, store.kids());
    }

    #[test]
    fn test_public_key_set_json_has_no_private_material() {
        let store = store_with_states(&[KeyState::Active]);

        let json = serde_json::to_value(public_key_set(&store)).expect("should serialize");
        let key = &json["keys"][0];

        assert_eq!(key["kty"], "OKP");
        assert_eq!(key["crv"], "Ed25519");
        assert_eq!(key["alg"], "EdDSA");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["kid"], store.kids()[0]);
        assert!(key["x"].is_string());
        assert!(key.get("d").is_none());
    }

    #[test]
    fn test_empty_store_publishes_empty_set() {
        let json = serde_json::to_string(&public_key_set(&KeyStore::default()))
            .expect("should serialize");

        assert_eq!(json, r#"{"keys":[]}"#);
    }
}

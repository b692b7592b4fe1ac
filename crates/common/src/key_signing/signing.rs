//! Token signing with the current signing key.
//!
//! Tokens are compact JWS strings carrying `{alg, typ, kid}` in the header and
//! `{sub, iat, exp}` as claims.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::EncodePrivateKey;
use error_stack::{Report, ResultExt};
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::JwksError;
use crate::settings::TokenSettings;

use super::keys::KeyRecord;
use super::store::SharedKeyStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kid: String,
    pub claims: TokenClaims,
}

pub struct TokenSigner {
    keys: Arc<SharedKeyStore>,
    settings: TokenSettings,
}

impl TokenSigner {
    #[must_use]
    pub fn new(keys: Arc<SharedKeyStore>, settings: TokenSettings) -> Self {
        Self { keys, settings }
    }

    /// Signs a fresh token valid from `now` for the configured validity.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::NoSigningKeyAvailable`] if the store holds no
    /// active signing key, or [`JwksError::Signing`] if the token could not be
    /// encoded.
    pub fn issue_token(&self, now: DateTime<Utc>) -> Result<IssuedToken, Report<JwksError>> {
        let store = self.keys.snapshot();
        let record = store
            .signing_key()
            .ok_or_else(|| Report::new(JwksError::NoSigningKeyAvailable))?;

        let iat = now.timestamp();
        let validity = i64::try_from(self.settings.validity_secs).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            sub: self.settings.subject.clone(),
            iat,
            exp: iat.saturating_add(validity),
        };

        let mut header = Header::new(record.algorithm.jwt());
        header.kid = Some(record.kid.clone());

        let token = jsonwebtoken::encode(&header, &claims, &encoding_key(record)?)
            .change_context(JwksError::Signing {
                message: format!("Failed to sign token with kid {}", record.kid),
            })?;

        log::debug!("Issued token for {} signed with kid {}", claims.sub, record.kid);

        Ok(IssuedToken {
            token,
            kid: record.kid.clone(),
            claims,
        })
    }
}

fn encoding_key(record: &KeyRecord) -> Result<EncodingKey, Report<JwksError>> {
    let der = record.signing_key().to_pkcs8_der().map_err(|e| {
        Report::new(JwksError::Signing {
            message: format!("Failed to encode key {} as PKCS#8: {e}", record.kid),
        })
    })?;
    Ok(EncodingKey::from_ed_der(der.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_signing::keys::KeyState;
    use crate::test_support::tests::{bootstrapped_manager, create_test_settings, test_now};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use ed25519_dalek::{Signature, Verifier};
    use jsonwebtoken::Algorithm;

    fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> T {
        let bytes = URL_SAFE_NO_PAD
            .decode(segment)
            .expect("should decode segment");
        serde_json::from_slice(&bytes).expect("should parse segment")
    }

    #[tokio::test]
    async fn test_issue_token_structure() {
        let (manager, _) = bootstrapped_manager().await;
        let signer = TokenSigner::new(Arc::clone(manager.keys()), create_test_settings().token);

        let issued = signer.issue_token(test_now()).expect("should issue token");
        let parts: Vec<&str> = issued.token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = jsonwebtoken::decode_header(&issued.token).expect("should decode header");
        assert_eq!(header.alg, Algorithm::EdDSA);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.kid.as_deref(), Some(issued.kid.as_str()));

        let raw_header: serde_json::Value = decode_segment(parts[0]);
        assert_eq!(raw_header["alg"], "EdDSA");

        let claims: TokenClaims = decode_segment(parts[1]);
        assert_eq!(claims.sub, "test-subject");
        assert_eq!(claims.iat, test_now().timestamp());
        assert_eq!(claims.exp, test_now().timestamp() + 60);
        assert_eq!(claims, issued.claims);
    }

    #[tokio::test]
    async fn test_signature_verifies_with_active_key() {
        let (manager, _) = bootstrapped_manager().await;
        let signer = TokenSigner::new(Arc::clone(manager.keys()), create_test_settings().token);

        let issued = signer.issue_token(test_now()).expect("should issue token");
        let (signing_input, signature_b64) = issued
            .token
            .rsplit_once('.')
            .expect("should have signature segment");
        let signature_bytes: [u8; 64] = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .expect("should decode signature")
            .try_into()
            .expect("should be 64 bytes");

        let store = manager.keys().snapshot();
        let record = store
            .find_by_id(&issued.kid)
            .expect("should find signing record");
        assert_eq!(record.state, KeyState::Active);
        assert!(record
            .keypair
            .verifying_key
            .verify(
                signing_input.as_bytes(),
                &Signature::from_bytes(&signature_bytes)
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_issue_token_uses_new_key_after_rotation() {
        let (manager, _) = bootstrapped_manager().await;
        let signer = TokenSigner::new(Arc::clone(manager.keys()), create_test_settings().token);

        let before = signer.issue_token(test_now()).expect("should issue token");
        let rotation = manager.rotate(test_now()).await.expect("should rotate");
        let after = signer.issue_token(test_now()).expect("should issue token");

        assert_eq!(after.kid, rotation.new_kid);
        assert_ne!(before.kid, after.kid);
    }

    #[test]
    fn test_issue_token_without_signing_key() {
        let signer = TokenSigner::new(
            Arc::new(SharedKeyStore::empty()),
            create_test_settings().token,
        );

        let err = signer
            .issue_token(test_now())
            .expect_err("should fail without key");
        assert!(matches!(
            err.current_context(),
            JwksError::NoSigningKeyAvailable
        ));
    }
}

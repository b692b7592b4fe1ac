//! Key records and key material.
//!
//! A [`KeyRecord`] is one Ed25519 key pair plus the metadata the lifecycle
//! manager needs: identifier, algorithm, usage and lifecycle state. Private
//! material never leaves this module except through the snapshot codec.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use error_stack::{Report, ResultExt};
use jose_jwk::{
    jose_jwa::{Algorithm, Signing},
    Class, Jwk, Key, Okp, OkpCurves, Parameters,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::JwksError;

/// Signing algorithm tag carried by every record and token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl KeyAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EdDsa => "EdDSA",
        }
    }

    #[must_use]
    pub fn jwa(self) -> Algorithm {
        match self {
            Self::EdDsa => Algorithm::Signing(Signing::EdDsa),
        }
    }

    /// Algorithm as named in JWT headers.
    #[must_use]
    pub fn jwt(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::EdDsa => jsonwebtoken::Algorithm::EdDSA,
        }
    }
}

/// Purpose tag. Only signing keys exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Sig,
}

/// Lifecycle state. A deleted key is simply absent from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    /// Generated, not yet used for signing.
    Pending,
    /// The key new tokens are signed with.
    Active,
    /// Superseded; still published so outstanding tokens verify.
    Retiring,
}

#[derive(Clone)]
pub struct Keypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Keypair {
    /// Generates a key pair from the operating system's RNG.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::KeyGeneration`] if the RNG cannot supply a seed.
    pub fn generate() -> Result<Self, Report<JwksError>> {
        Self::generate_with(&mut OsRng)
    }

    /// Generates a key pair from `rng`.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::KeyGeneration`] if `rng` cannot supply a seed.
    pub fn generate_with<R: RngCore>(rng: &mut R) -> Result<Self, Report<JwksError>> {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        rng.try_fill_bytes(&mut seed)
            .change_context(JwksError::KeyGeneration {
                message: "RNG could not supply a seed".into(),
            })?;

        Ok(Self::from_seed(&seed))
    }

    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Public-only JWK for this key pair.
    #[must_use]
    pub fn get_jwk(&self, kid: String, algorithm: KeyAlgorithm) -> Jwk {
        let public_key_bytes = self.verifying_key.as_bytes();

        let okp = Okp {
            crv: OkpCurves::Ed25519,
            x: public_key_bytes.to_vec().into(),
            d: None, // No private key in JWK (public only)
        };

        Jwk {
            key: Key::Okp(okp),
            prm: Parameters {
                kid: Some(kid),
                alg: Some(algorithm.jwa()),
                cls: Some(Class::Signing),
                ..Default::default()
            },
        }
    }

    /// RFC 7638 thumbprint of the public key, base64url encoded.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        // Required members in lexicographic order, no whitespace.
        let canonical = format!(
            r#"{{"crv":"Ed25519","kty":"OKP","x":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field(
                "verifying_key",
                &URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes()),
            )
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub kid: String,
    pub algorithm: KeyAlgorithm,
    pub usage: KeyUsage,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    /// Deletion time, set once the key is retiring.
    pub retire_at: Option<DateTime<Utc>>,
    pub keypair: Keypair,
}

impl KeyRecord {
    /// Generates a fresh `Pending` signing key.
    ///
    /// # Errors
    ///
    /// Returns [`JwksError::KeyGeneration`] if no key material can be drawn.
    pub fn generate(
        algorithm: KeyAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<Self, Report<JwksError>> {
        let keypair = match algorithm {
            KeyAlgorithm::EdDsa => Keypair::generate()?,
        };

        Ok(Self {
            kid: keypair.thumbprint(),
            algorithm,
            usage: KeyUsage::Sig,
            state: KeyState::Pending,
            created_at: now,
            retire_at: None,
            keypair,
        })
    }

    #[must_use]
    pub fn is_signing_capable(&self) -> bool {
        self.usage == KeyUsage::Sig && self.state == KeyState::Active
    }

    pub fn promote(&mut self) {
        self.state = KeyState::Active;
        self.retire_at = None;
    }

    pub fn retire(&mut self, delete_at: DateTime<Utc>) {
        self.state = KeyState::Retiring;
        self.retire_at = Some(delete_at);
    }

    #[must_use]
    pub fn public_jwk(&self) -> Jwk {
        self.keypair.get_jwk(self.kid.clone(), self.algorithm)
    }

    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.keypair.signing_key
    }
}

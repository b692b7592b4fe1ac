//! Token verification against a published key set.
//!
//! The verifier never holds private material. It resolves a token's `kid`
//! through a [`KeyResolver`], which caches the public keys of the last key set
//! it fetched and refreshes once per cache miss. Verification outcomes are
//! data ([`VerificationResult`]), not errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use derive_more::Display;
use ed25519_dalek::PUBLIC_KEY_LENGTH;
use error_stack::{Report, ResultExt};
use jose_jwk::{
    jose_jwa::{Algorithm, Signing},
    Jwk, JwkSet, Key, OkpCurves,
};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{DecodingKey, Validation};
use moka::future::Cache;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use url::Url;

use crate::error::JwksError;
use crate::settings::VerifierSettings;

use super::jwks::public_key_set;
use super::keys::KeyAlgorithm;
use super::signing::TokenClaims;
use super::store::SharedKeyStore;

const MAX_CACHED_KEYS: u64 = 1_000;
const MAX_TRACKED_REFRESHES: u64 = 64;

/// Where the verifier gets the issuer's public key set from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch_key_set(&self) -> Result<JwkSet, Report<JwksError>>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// Fetches the discovery document over HTTP.
pub struct HttpKeySetSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpKeySetSource {
    /// # Errors
    ///
    /// Returns [`JwksError::Configuration`] if `url` is not a valid URL or the
    /// HTTP client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, Report<JwksError>> {
        let url = Url::parse(url).change_context(JwksError::Configuration {
            message: format!("Invalid key set URL {url}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(JwksError::Configuration {
                message: "Failed to build HTTP client".into(),
            })?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch_key_set(&self) -> Result<JwkSet, Report<JwksError>> {
        let fetch_error = || JwksError::KeySetFetch {
            message: format!("GET {}", self.url),
        };

        self.client
            .get(self.url.clone())
            .send()
            .await
            .change_context_lazy(fetch_error)?
            .error_for_status()
            .change_context_lazy(fetch_error)?
            .json::<JwkSet>()
            .await
            .change_context_lazy(fetch_error)
            .attach("while decoding the key set")
    }

    fn location(&self) -> String {
        self.url.to_string()
    }
}

/// Reads the issuer's current key set in-process.
pub struct PublisherKeySource {
    keys: Arc<SharedKeyStore>,
}

impl PublisherKeySource {
    #[must_use]
    pub fn new(keys: Arc<SharedKeyStore>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeySetSource for PublisherKeySource {
    async fn fetch_key_set(&self) -> Result<JwkSet, Report<JwksError>> {
        Ok(public_key_set(&self.keys.snapshot()))
    }

    fn location(&self) -> String {
        "in-process".to_string()
    }
}

/// Why a key could not be resolved.
#[derive(Debug)]
pub enum ResolveError {
    UnknownKid,
    Unavailable(String),
}

/// Resolves a `kid` to a public key, refreshing the key set on a miss.
///
/// Refreshes are numbered in the order they start. A miss joins a refresh
/// that is already running; if that one does not yield the kid, the miss
/// runs the next refresh, which began after the miss and so sees any key
/// published before it. Concurrent callers of the same refresh share one
/// fetch.
pub struct KeyResolver {
    source: Arc<dyn KeySetSource>,
    keys: Cache<String, DecodingKey>,
    refreshes: Cache<u64, usize>,
    started: AtomicU64,
    settled: AtomicU64,
    applied: AtomicU64,
}

impl KeyResolver {
    #[must_use]
    pub fn new(source: Arc<dyn KeySetSource>, max_age: Duration) -> Self {
        Self {
            source,
            keys: Cache::builder()
                .max_capacity(MAX_CACHED_KEYS)
                .time_to_live(max_age)
                .build(),
            refreshes: Cache::builder().max_capacity(MAX_TRACKED_REFRESHES).build(),
            started: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Resolves `kid`, refreshing the key set when it is not cached.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownKid`] if the kid is absent after a
    /// refresh, or [`ResolveError::Unavailable`] if the refresh failed.
    pub async fn resolve(&self, kid: &str) -> Result<DecodingKey, ResolveError> {
        if let Some(key) = self.keys.get(kid).await {
            return Ok(key);
        }

        let latest = self.started.load(Ordering::Acquire);
        if latest > self.settled.load(Ordering::Acquire) {
            self.join_refresh(latest).await?;
            if let Some(key) = self.keys.get(kid).await {
                return Ok(key);
            }
        }

        self.join_refresh(latest + 1).await?;
        self.keys.get(kid).await.ok_or(ResolveError::UnknownKid)
    }

    async fn join_refresh(&self, number: u64) -> Result<usize, ResolveError> {
        self.refreshes
            .try_get_with(number, self.refresh(number))
            .await
            .map_err(|e| ResolveError::Unavailable(e.current_context().to_string()))
    }

    async fn refresh(&self, number: u64) -> Result<usize, Report<JwksError>> {
        self.started.fetch_max(number, Ordering::AcqRel);
        let result = self.fetch_and_apply(number).await;
        self.settled.fetch_max(number, Ordering::AcqRel);
        result
    }

    /// Fetches the key set and replaces the cache with it.
    async fn fetch_and_apply(&self, number: u64) -> Result<usize, Report<JwksError>> {
        let set = match self.source.fetch_key_set().await {
            Ok(set) => set,
            Err(e) => {
                log::warn!(
                    "Failed to refresh key set from {}: {e:?}",
                    self.source.location()
                );
                return Err(e);
            }
        };
        let entries: Vec<(String, DecodingKey)> =
            set.keys.iter().filter_map(decoding_key).collect();
        let count = entries.len();

        // A newer refresh already replaced the cache.
        if self.applied.fetch_max(number, Ordering::AcqRel) > number {
            log::debug!("Discarding key set from refresh {number}, a newer one is applied");
            return Ok(count);
        }

        self.keys.invalidate_all();
        for (kid, key) in entries {
            self.keys.insert(kid, key).await;
        }
        log::debug!("Refreshed {count} keys from {}", self.source.location());

        Ok(count)
    }
}

/// Public key of `jwk` when it is an Ed25519 signing key with a kid.
fn decoding_key(jwk: &Jwk) -> Option<(String, DecodingKey)> {
    let kid = jwk.prm.kid.clone()?;
    if jwk
        .prm
        .alg
        .as_ref()
        .is_some_and(|alg| *alg != Algorithm::Signing(Signing::EdDsa))
    {
        log::debug!("Skipping key {kid} with unsupported algorithm");
        return None;
    }
    let Key::Okp(okp) = &jwk.key else {
        log::debug!("Skipping non-OKP key {kid}");
        return None;
    };
    if okp.crv != OkpCurves::Ed25519 || okp.x.len() != PUBLIC_KEY_LENGTH {
        log::debug!("Skipping key {kid}: not an Ed25519 public key");
        return None;
    }

    match DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(&okp.x[..])) {
        Ok(key) => Some((kid, key)),
        Err(e) => {
            log::debug!("Skipping key {kid}: {e}");
            None
        }
    }
}

/// Reason a token failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum VerifyError {
    #[display("{message}")]
    TokenMalformed { message: String },
    #[display("no key with kid {kid}")]
    UnknownKeyIdentifier { kid: String },
    #[display("{message}")]
    SignatureInvalid { message: String },
    #[display("token expired at {expired_at}")]
    TokenExpired { expired_at: DateTime<Utc> },
    #[display("key set unavailable: {message}")]
    KeySetUnavailable { message: String },
}

impl VerifyError {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TokenMalformed { .. } => "TokenMalformedError",
            Self::UnknownKeyIdentifier { .. } => "UnknownKeyIdentifier",
            Self::SignatureInvalid { .. } => "SignatureInvalidError",
            Self::TokenExpired { .. } => "TokenExpiredError",
            Self::KeySetUnavailable { .. } => "KeySetUnavailable",
        }
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::TokenMalformed {
            message: message.into(),
        }
    }

    /// Maps a decoding failure. Expiry is normally checked by the caller
    /// against its own clock, so `now` only stands in for a library verdict.
    fn from_jwt(error: &JwtError, now: DateTime<Utc>) -> Self {
        match error.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::InvalidKeyFormat => Self::SignatureInvalid {
                message: error.to_string(),
            },
            ErrorKind::ExpiredSignature => Self::TokenExpired { expired_at: now },
            _ => Self::malformed(error.to_string()),
        }
    }
}

impl Serialize for VerifyError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("VerifyError", 2)?;
        state.serialize_field("name", self.name())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub jwt: Option<TokenClaims>,
    pub kid: Option<String>,
    pub verified: bool,
    pub error: Option<VerifyError>,
}

impl VerificationResult {
    fn verified(claims: TokenClaims, kid: String) -> Self {
        Self {
            jwt: Some(claims),
            kid: Some(kid),
            verified: true,
            error: None,
        }
    }

    fn rejected(kid: Option<String>, error: VerifyError) -> Self {
        Self {
            jwt: None,
            kid,
            verified: false,
            error: Some(error),
        }
    }
}

pub struct TokenVerifier {
    resolver: KeyResolver,
    validation: Validation,
    leeway_secs: i64,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(resolver: KeyResolver, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(KeyAlgorithm::EdDsa.jwt());
        // Expiry is checked against the caller's clock in `check`.
        validation.validate_exp = false;

        Self {
            resolver,
            validation,
            leeway_secs: i64::try_from(leeway_secs).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub fn from_settings(source: Arc<dyn KeySetSource>, settings: &VerifierSettings) -> Self {
        Self::new(
            KeyResolver::new(source, settings.cache_max_age()),
            settings.leeway_secs,
        )
    }

    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub async fn verify(&self, token: &str) -> VerificationResult {
        self.verify_at(token, Utc::now()).await
    }

    pub async fn verify_at(&self, token: &str, now: DateTime<Utc>) -> VerificationResult {
        let result = self.check(token, now).await;
        match &result.error {
            None => log::debug!("Verified token with kid {:?}", result.kid),
            Some(e) => log::info!("Rejected token with kid {:?}: {}", result.kid, e.name()),
        }
        result
    }

    async fn check(&self, token: &str, now: DateTime<Utc>) -> VerificationResult {
        if token.split('.').count() != 3 {
            return VerificationResult::rejected(
                None,
                VerifyError::malformed("token must have three segments"),
            );
        }

        let header = match jsonwebtoken::decode_header(token) {
            Ok(header) => header,
            Err(e) => {
                return VerificationResult::rejected(
                    None,
                    VerifyError::malformed(format!("invalid token header: {e}")),
                )
            }
        };
        let Some(kid) = header.kid else {
            return VerificationResult::rejected(
                None,
                VerifyError::malformed("token header has no kid"),
            );
        };
        let reject = |error| VerificationResult::rejected(Some(kid.clone()), error);

        let key = match self.resolver.resolve(&kid).await {
            Ok(key) => key,
            Err(ResolveError::UnknownKid) => {
                return reject(VerifyError::UnknownKeyIdentifier { kid: kid.clone() })
            }
            Err(ResolveError::Unavailable(message)) => {
                return reject(VerifyError::KeySetUnavailable { message })
            }
        };

        if !self.validation.algorithms.contains(&header.alg) {
            return reject(VerifyError::SignatureInvalid {
                message: format!("unsupported algorithm {:?}", header.alg),
            });
        }

        let claims = match jsonwebtoken::decode::<TokenClaims>(token, &key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => return reject(VerifyError::from_jwt(&e, now)),
        };

        if now.timestamp() >= claims.exp.saturating_add(self.leeway_secs) {
            let expired_at = DateTime::from_timestamp(claims.exp, 0).unwrap_or(now);
            return reject(VerifyError::TokenExpired { expired_at });
        }

        VerificationResult::verified(claims, kid)
    }
}

//! Error types for the key rotation service.
//!
//! Every fallible operation returns `Report<JwksError>` from `error-stack`, so
//! callers can add context with `change_context` and `attach` while keeping a
//! single, matchable error enum at the top of the report. Verification
//! failures are not errors in this sense; see
//! [`crate::key_signing::verify::VerifyError`].

use derive_more::Display;
use http::StatusCode;

/// Errors raised by the issuer, the key store and the verifier plumbing.
#[derive(Debug, Display)]
pub enum JwksError {
    /// Settings could not be loaded or failed validation.
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// The snapshot resource does not exist.
    #[display("Key store snapshot not found at {path}")]
    StoreMissing { path: String },

    /// The snapshot resource exists but is not a well-formed key store.
    #[display("Key store snapshot is corrupt: {message}")]
    StoreCorrupt { message: String },

    /// Reading or writing the snapshot resource failed.
    #[display("Key store I/O error: {message}")]
    StoreIo { message: String },

    /// No record carries the requested key identifier.
    #[display("Key not found: {kid}")]
    KeyNotFound { kid: String },

    /// The store holds no key that may sign new tokens.
    #[display("No signing key available")]
    NoSigningKeyAvailable,

    /// A new key pair could not be created.
    #[display("Key generation failed: {message}")]
    KeyGeneration { message: String },

    /// Building or signing a token failed.
    #[display("Token signing failed: {message}")]
    Signing { message: String },

    /// The published key set could not be fetched or decoded.
    #[display("Key set fetch failed: {message}")]
    KeySetFetch { message: String },

    /// The caller sent a request the service cannot act on.
    #[display("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl core::error::Error for JwksError {}

/// Maps an error onto the HTTP response the service returns for it.
pub trait IntoHttpResponse {
    /// Status code for the response.
    fn status_code(&self) -> StatusCode;

    /// Message safe to show to the caller.
    fn user_message(&self) -> String;
}

impl IntoHttpResponse for JwksError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::KeyNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoSigningKeyAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::KeySetFetch { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::StoreMissing { .. }
            | Self::StoreCorrupt { .. }
            | Self::StoreIo { .. }
            | Self::KeyGeneration { .. }
            | Self::Signing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn user_message(&self) -> String {
        match self {
            // Store paths and internal details stay in the logs.
            Self::StoreMissing { .. } | Self::StoreCorrupt { .. } | Self::StoreIo { .. } => {
                "Key store unavailable".to_string()
            }
            Self::Configuration { .. } => "Service misconfigured".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            JwksError::InvalidRequest {
                message: "missing token".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            JwksError::NoSigningKeyAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            JwksError::StoreIo {
                message: "disk full".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_user_message_hides_store_details() {
        let err = JwksError::StoreMissing {
            path: "/var/lib/keys.json".into(),
        };
        assert_eq!(err.user_message(), "Key store unavailable");
        assert!(err.to_string().contains("/var/lib/keys.json"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", JwksError::KeyNotFound { kid: "abc".into() }),
            "Key not found: abc"
        );
        assert_eq!(
            format!(
                "{}",
                JwksError::KeyGeneration {
                    message: "rng unavailable".into()
                }
            ),
            "Key generation failed: rng unavailable"
        );
        assert_eq!(
            format!("{}", JwksError::NoSigningKeyAvailable),
            "No signing key available"
        );
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::JwksError;
use crate::key_signing::KeyAlgorithm;

pub const ENVIRONMENT_VARIABLE_PREFIX: &str = "JWKS_ROTATOR";
pub const ENVIRONMENT_VARIABLE_SEPARATOR: &str = "__";

/// Configuration shipped with the binaries, used when no `--config` is given.
pub const DEFAULT_SETTINGS_TOML: &str = include_str!("../../../jwks-rotator.toml");

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct IssuerSettings {
    pub bind_address: SocketAddr,
    pub snapshot_path: PathBuf,
    /// Exposes `POST /admin/keys/rotate` when set.
    #[serde(default)]
    pub admin_rotation_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct KeySettings {
    pub algorithm: KeyAlgorithm,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RotationSettings {
    #[validate(range(min = 1, max = 86400))]
    pub interval_secs: u64,
    #[validate(range(min = 1, max = 604800))]
    pub retirement_window_secs: u64,
    /// Fire rotations on multiples of the interval since the Unix epoch,
    /// the way a `*/2 * * * *` cron entry would.
    #[serde(default = "default_align_to_wall_clock")]
    pub align_to_wall_clock: bool,
    #[serde(default = "default_unhealthy_after_failures")]
    #[validate(range(min = 1))]
    pub unhealthy_after_failures: u64,
    #[serde(default = "default_max_keys")]
    #[validate(range(min = 2))]
    pub max_keys: usize,
}

impl RotationSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn retirement_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retirement_window_secs).unwrap_or(i64::MAX))
    }
}

fn default_align_to_wall_clock() -> bool {
    true
}

fn default_unhealthy_after_failures() -> u64 {
    3
}

fn default_max_keys() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TokenSettings {
    #[validate(range(min = 1, max = 86400))]
    pub validity_secs: u64,
    #[validate(length(min = 1))]
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VerifierSettings {
    pub bind_address: SocketAddr,
    #[validate(url)]
    pub jwks_url: String,
    #[validate(range(min = 1, max = 60000))]
    pub fetch_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub cache_max_age_secs: u64,
    #[serde(default)]
    pub leeway_secs: u64,
}

impl VerifierSettings {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    #[must_use]
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingSettings {
    #[validate(length(min = 1))]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub issuer: IssuerSettings,
    #[validate(nested)]
    pub keys: KeySettings,
    #[validate(nested)]
    pub rotation: RotationSettings,
    #[validate(nested)]
    pub token: TokenSettings,
    #[validate(nested)]
    pub verifier: VerifierSettings,
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Loads settings from `path`, or from the embedded defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the settings are invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, Report<JwksError>> {
        match path {
            Some(path) => {
                let toml_str = std::fs::read_to_string(path).change_context(
                    JwksError::Configuration {
                        message: format!("Failed to read settings file {}", path.display()),
                    },
                )?;
                Self::from_toml(&toml_str)
            }
            None => Self::from_toml(DEFAULT_SETTINGS_TOML),
        }
    }

    /// Parses settings from TOML, applying `JWKS_ROTATOR__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed, a required field is missing,
    /// or validation fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<JwksError>> {
        let environment = Environment::default()
            .prefix(ENVIRONMENT_VARIABLE_PREFIX)
            .separator(ENVIRONMENT_VARIABLE_SEPARATOR)
            .try_parsing(true);

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let settings: Self = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize())
            .change_context(JwksError::Configuration {
                message: "Failed to parse settings".to_string(),
            })?;

        settings
            .validate()
            .change_context(JwksError::Configuration {
                message: "Settings validation failed".to_string(),
            })?;
        settings.check_windows()?;

        Ok(settings)
    }

    /// Tokens must stay verifiable for their whole lifetime, so a key may not
    /// be deleted sooner than the longest token it signed expires.
    fn check_windows(&self) -> Result<(), Report<JwksError>> {
        if self.rotation.retirement_window_secs < self.token.validity_secs {
            return Err(Report::new(JwksError::Configuration {
                message: format!(
                    "rotation.retirement_window_secs ({}) must be at least token.validity_secs ({})",
                    self.rotation.retirement_window_secs, self.token.validity_secs
                ),
            }));
        }
        Ok(())
    }
}

use std::str::FromStr;

use error_stack::{Report, ResultExt};
use log::LevelFilter;

use crate::error::JwksError;
use crate::settings::LoggingSettings;

/// Parses the configured level name (`error` through `trace`, or `off`).
///
/// # Errors
///
/// Returns [`JwksError::Configuration`] for an unknown level name.
pub fn parse_level(level: &str) -> Result<LevelFilter, Report<JwksError>> {
    LevelFilter::from_str(level.trim()).change_context(JwksError::Configuration {
        message: format!("Invalid log level: {level}"),
    })
}

/// Initialize logging for the application.
/// Should be called once at the start of main().
///
/// # Errors
///
/// Returns an error if the level is invalid or a logger is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), Report<JwksError>> {
    let level = parse_level(&settings.level)?;

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}  {} {} {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .change_context(JwksError::Configuration {
            message: "Failed to initialize logger".into(),
        })
}

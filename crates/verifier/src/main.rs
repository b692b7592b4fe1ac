//! JWKS verifier.
//!
//! Verifies tokens against the key set the issuer publishes, caching public
//! keys by kid.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use error_stack::{Report, ResultExt};

use jwks_rotator_common::error::JwksError;
use jwks_rotator_common::key_signing::{
    verifier_router, HttpKeySetSource, TokenVerifier, VerifierState,
};
use jwks_rotator_common::logging::init_logging;
use jwks_rotator_common::settings::Settings;

#[derive(Parser)]
#[command(name = "jwks-verifier")]
#[command(about = "Verifies tokens against the issuer's published JWKS")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file (defaults to the embedded settings)
    #[arg(long, short, env = "JWKS_ROTATOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Verifier stopped: {e:?}");
            #[allow(clippy::print_stderr)]
            {
                eprintln!("Error: {e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Report<JwksError>> {
    let settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.logging)?;
    log::info!("Settings {settings:?}");

    let source =
        HttpKeySetSource::new(&settings.verifier.jwks_url, settings.verifier.fetch_timeout())?;
    log::info!("Resolving keys from {}", settings.verifier.jwks_url);
    let verifier = Arc::new(TokenVerifier::from_settings(
        Arc::new(source),
        &settings.verifier,
    ));
    let router = verifier_router(VerifierState { verifier });

    let addr = settings.verifier.bind_address;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .change_context(JwksError::Configuration {
            message: format!("Failed to bind {addr}"),
        })?;
    log::info!("Verifier listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .change_context(JwksError::Configuration {
            message: "HTTP server failed".into(),
        })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

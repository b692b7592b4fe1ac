//! JWKS issuer.
//!
//! Bootstraps the key store from its snapshot, rotates keys on a fixed
//! interval, deletes retired keys when their window ends and serves the
//! public key set and signed tokens over HTTP.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use error_stack::{Report, ResultExt};

use jwks_rotator_common::error::JwksError;
use jwks_rotator_common::key_signing::{
    issuer_router, BootstrapOutcome, FileSnapshotStore, IssuerState, KeyLifecycleManager,
    KeyScheduler, SharedKeyStore, TokenSigner,
};
use jwks_rotator_common::logging::init_logging;
use jwks_rotator_common::settings::Settings;

#[derive(Parser)]
#[command(name = "jwks-issuer")]
#[command(about = "Issues tokens signed with rotating keys and publishes the JWKS")]
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
            log::error!("Issuer stopped: {e:?}");
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

    let snapshot = Arc::new(FileSnapshotStore::new(&settings.issuer.snapshot_path));
    let keys = Arc::new(SharedKeyStore::empty());
    let manager = Arc::new(
        KeyLifecycleManager::new(snapshot, Arc::clone(&keys), settings.rotation.clone())
            .with_algorithm(settings.keys.algorithm),
    );

    let outcome = manager
        .bootstrap(Utc::now())
        .await
        .attach("while bootstrapping the key store")?;

    let scheduler = Arc::new(KeyScheduler::new(Arc::clone(&manager)));
    if let BootstrapOutcome::Resumed {
        pending_retirements,
        ..
    } = &outcome
    {
        let armed = scheduler.arm_pending(pending_retirements);
        log::info!("Re-armed {armed} deletions from the snapshot");
    }
    scheduler.start_rotation();

    let state = IssuerState {
        manager,
        scheduler: Arc::clone(&scheduler),
        signer: Arc::new(TokenSigner::new(keys, settings.token.clone())),
    };
    let router = issuer_router(state, settings.issuer.admin_rotation_enabled);

    let addr = settings.issuer.bind_address;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .change_context(JwksError::Configuration {
            message: format!("Failed to bind {addr}"),
        })?;
    log::info!("Issuer listening on http://{addr}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .change_context(JwksError::Configuration {
            message: "HTTP server failed".into(),
        });

    scheduler.shutdown().await;
    log::info!("Issuer stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

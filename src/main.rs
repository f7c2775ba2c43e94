use std::fs::OpenOptions;
use std::sync::Arc;

use clap::Parser;
use fs2::FileExt;

use pipe_watchtower::config::Config;
use pipe_watchtower::dispute::DisputeExecutor;
use pipe_watchtower::signer::SignerBackend;
use pipe_watchtower::store::Store;
use pipe_watchtower::verifier::Verifier;
use pipe_watchtower::watchtower::Watchtower;
use pipe_watchtower::http;

#[derive(Parser, Debug)]
#[command(name = "pipe-watchtower", version, about = "Watchtower and co-signer service for Stackflow-style payment-channel pipes")]
struct Args {
    /// Validate configuration and exit without starting the HTTP server.
    #[arg(long)]
    config_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = Config::from_env()?;

    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        db_file = %cfg.db_file.display(),
        network = %cfg.network,
        watched_contracts = cfg.watched_contracts.len(),
        watched_principals = cfg.watched_principals.len(),
        verifier_mode = ?cfg.verifier_mode,
        dispute_executor_mode = ?cfg.dispute_executor_mode,
        signer_mode = ?cfg.signer_mode,
        "watchtower starting"
    );

    if args.config_check {
        tracing::info!("config check ok");
        return Ok(());
    }

    if let Some(parent) = cfg.db_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("failed to create db directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: lock alongside the state file. Prevents two
    // watchtowers mutating the same sqlite file concurrently outside the
    // process-local mutex.
    let lock_path = cfg.db_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| anyhow::anyhow!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| anyhow::anyhow!("watchtower already running or lock unavailable ({}): {e}", lock_path.display()))?;
    let _lock_guard = lock_file;

    let store = Arc::new(Store::load(&cfg.db_file, cfg.max_recent_events)?);
    let cfg = Arc::new(cfg);
    let verifier = Verifier::from_config(&cfg);
    let dispute_executor = DisputeExecutor::from_config(&cfg);
    let signer = Arc::new(SignerBackend::from_config(&cfg));

    let watchtower = Arc::new(Watchtower::new(store, cfg.clone(), verifier, dispute_executor));

    let state = http::AppState { watchtower, signer };
    let app = http::router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to install ctrl-c handler"),
    }
}

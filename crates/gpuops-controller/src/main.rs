//! GPUOPS Controller
//!
//! Central billing and enforcement server for the cluster: accepts agent
//! metric reports, debits balances, and serves the admin and registry APIs.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use gpuops_controller::config::ControllerConfig;
use gpuops_controller::server::{AppState, build_router};
use gpuops_controller::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "gpuops-controller")]
#[command(version, about = "GPUOPS controller - usage billing and enforcement")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "GPUOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address; overrides the config file.
    #[arg(long, env = "GPUOPS_ADDR")]
    addr: Option<SocketAddr>,

    /// SQLite database file; overrides the config file.
    #[arg(long, env = "GPUOPS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "GPUOPS_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    gpuops_core::tracing_init::init_tracing("gpuops_controller=info", args.log_json);

    let mut config = ControllerConfig::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.database_path = Some(db_path);
    }
    let addr: SocketAddr = match args.addr {
        Some(addr) => addr,
        None => config.listen_addr.parse()?,
    };

    if config.agent_token.is_empty() {
        tracing::warn!("agent_token is empty; all agent requests will be rejected");
    }
    if config.dry_run {
        info!("dry-run enabled: costs are computed but balances are not debited");
    }

    let db = Database::open(&config.database_path()).await?;
    let state = AppState::new(db, config);
    let app = build_router(state);

    info!(version = env!("CARGO_PKG_VERSION"), addr = %addr, "Starting gpuops-controller");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Received shutdown signal");
}

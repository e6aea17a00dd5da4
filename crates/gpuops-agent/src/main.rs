//! GPUOPS Node Agent
//!
//! Samples local resource consumption on a fixed tick, reports it to the
//! controller, and executes the enforcement actions handed back. A second,
//! faster ticker polls the controller's outbox so operator actions land
//! within about a second.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use gpuops_agent::client::ControllerClient;
use gpuops_agent::collector::Collector;
use gpuops_agent::executor::Executor;
use gpuops_core::Action;

#[derive(Parser, Debug)]
#[command(name = "gpuops-agent")]
#[command(version, about = "GPUOPS node agent - usage sampling and enforcement")]
struct Args {
    /// Node identifier; defaults to the hostname.
    #[arg(long, env = "GPUOPS_NODE_ID")]
    node_id: Option<String>,

    /// Controller base URL, e.g. "http://controller:8080".
    #[arg(long, env = "GPUOPS_CONTROLLER_URL")]
    controller_url: String,

    /// Shared agent token presented in X-Agent-Token.
    #[arg(long, env = "GPUOPS_AGENT_TOKEN")]
    agent_token: String,

    /// Sample/report interval in seconds.
    #[arg(long, default_value_t = 60, env = "GPUOPS_INTERVAL_SECONDS")]
    interval_seconds: u64,

    /// Operator-action poll interval in seconds.
    #[arg(long, default_value_t = 1, env = "GPUOPS_ACTION_POLL_SECONDS")]
    action_poll_seconds: u64,

    /// Agent state directory.
    #[arg(long, default_value = "/var/lib/gpu-node-agent", env = "GPUOPS_STATE_DIR")]
    state_dir: PathBuf,

    /// Drop CPU-only processes below this percentage before transmission.
    #[arg(long, default_value_t = 1.0, env = "GPUOPS_CPU_MIN_PERCENT")]
    cpu_min_percent: f64,

    /// Output logs as JSON.
    #[arg(long, env = "GPUOPS_LOG_JSON")]
    log_json: bool,
}

const COLLECT_TIMEOUT: Duration = Duration::from_secs(20);
const REPORT_TIMEOUT: Duration = Duration::from_secs(15);
const ACTION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(900);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    gpuops_core::tracing_init::init_tracing("gpuops_agent=info", args.log_json);

    let node_id = match args.node_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => nix::unistd::gethostname()?.to_string_lossy().into_owned(),
    };
    if args.controller_url.trim().is_empty() {
        anyhow::bail!("controller URL must not be empty");
    }
    if args.agent_token.trim().is_empty() {
        anyhow::bail!("agent token must not be empty");
    }
    std::fs::create_dir_all(&args.state_dir).ok();

    let interval = Duration::from_secs(args.interval_seconds.max(1));
    let action_poll = Duration::from_secs(args.action_poll_seconds.max(1));
    let poll_timeout = action_poll.min(MAX_POLL_TIMEOUT);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = node_id.as_str(),
        controller = args.controller_url.as_str(),
        interval_secs = interval.as_secs(),
        action_poll_secs = action_poll.as_secs(),
        "Starting gpuops-agent"
    );

    let client = ControllerClient::new(&args.controller_url, &args.agent_token, &node_id);
    let mut collector = Collector::new(node_id.clone(), args.cpu_min_percent);
    let executor = Executor::new();

    let mut report_timer = tokio::time::interval(interval);
    let mut action_timer = tokio::time::interval(action_poll);

    loop {
        tokio::select! {
            _ = report_timer.tick() => {
                if let Err(e) = report_tick(&client, &mut collector, &executor, interval).await {
                    warn!(error = %e, "report tick failed");
                }
            }
            _ = action_timer.tick() => {
                if let Err(e) = action_tick(&client, &executor, poll_timeout).await {
                    // Expected to fail transiently; the next poll retries.
                    tracing::debug!(error = %e, "action poll failed");
                }
            }
            _ = shutdown_signal() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!("Agent stopped");
    Ok(())
}

async fn report_tick(
    client: &ControllerClient,
    collector: &mut Collector,
    executor: &Executor,
    interval: Duration,
) -> anyhow::Result<()> {
    let report = tokio::time::timeout(
        COLLECT_TIMEOUT,
        collector.collect(interval.as_secs() as i64),
    )
    .await
    .map_err(|_| anyhow::anyhow!("sample collection timed out"))?;

    let response = client.report(&report, REPORT_TIMEOUT).await?;
    execute_actions(executor, &response.actions).await;
    Ok(())
}

async fn action_tick(
    client: &ControllerClient,
    executor: &Executor,
    poll_timeout: Duration,
) -> anyhow::Result<()> {
    let response = client.fetch_actions(poll_timeout).await?;
    execute_actions(executor, &response.actions).await;
    Ok(())
}

async fn execute_actions(executor: &Executor, actions: &[Action]) {
    for action in actions {
        let result = tokio::time::timeout(ACTION_TIMEOUT, executor.execute(action)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(kind = action.kind(), error = %e, "action failed"),
            Err(_) => warn!(kind = action.kind(), "action timed out"),
        }
    }
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
}

//! Unit agent - runs one unit's charm.
//!
//! Without a cluster to talk to, the agent runs against an in-memory state
//! store seeded from a JSON file. It exits with status 0 once the unit is
//! dead or the agent is stopped, and 1 on error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uniter::{Agent, AgentConfig, UnitName};
use uniter_charm::HttpFetcher;
use uniter_state::{MemoryState, StateSeed};

/// Unit agent - keeps a charm deployed and runs its hooks.
#[derive(Parser, Debug)]
#[command(name = "unit-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The unit to run, e.g. `wordpress/0`.
    #[arg(long, env = "UNITER_UNIT")]
    unit: UnitName,

    /// Directory holding the charm and the agent's state.
    #[arg(long, env = "UNITER_DATA_DIR")]
    data_dir: PathBuf,

    /// JSON file describing charms, units and relations.
    #[arg(long, env = "UNITER_STATE_FILE")]
    state_file: PathBuf,

    /// Socket path handed to hooks.
    #[arg(long, env = "UNITER_AGENT_SOCKET")]
    agent_socket: Option<PathBuf>,

    /// Seconds a hook gets to exit after SIGTERM on shutdown.
    #[arg(long, env = "UNITER_HOOK_KILL_GRACE", default_value_t = 5)]
    hook_kill_grace: u64,

    /// Seconds between presence pings.
    #[arg(long, env = "UNITER_PING_INTERVAL", default_value_t = 30)]
    ping_interval: u64,
}

impl Args {
    fn config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(&self.data_dir, self.unit.clone());
        config.agent_socket.clone_from(&self.agent_socket);
        config.hook_kill_grace_seconds = self.hook_kill_grace;
        config.ping_interval_seconds = self.ping_interval;
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,uniter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(exit) => {
            tracing::info!(unit = %args.unit, exit = ?exit, "Unit agent exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(unit = %args.unit, error = %e, "Unit agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<uniter::Exit, Box<dyn std::error::Error>> {
    let seed = StateSeed::from_json_file(&args.state_file)?;
    let store = Arc::new(MemoryState::from_seed(&seed));
    let fetcher = Arc::new(HttpFetcher::new()?);
    tracing::info!(
        unit = %args.unit,
        data_dir = %args.data_dir.display(),
        state_file = %args.state_file.display(),
        "Starting unit agent"
    );

    let agent = Agent::start(args.config(), store, fetcher).await?;
    let mut terminate = signal(SignalKind::terminate())?;
    let stop = agent.stop_handle();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
        stop.stop();
    });

    Ok(agent.wait().await?)
}

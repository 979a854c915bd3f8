//! fleetd: the GPU VM fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - State store (redb)
//! - Lifecycle engine + retry pipeline
//! - Region resolver
//! - Health monitor
//! - Metrics aggregator
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/vmfleet
//! fleetd check-config --config fleet.toml
//! fleetd metrics --data-dir /var/lib/vmfleet --prometheus
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmfleet_core::FleetConfig;
use vmfleet_orchestrator::Orchestrator;
use vmfleet_state::StateStore;

const DEFAULT_FILTER: &str = "info,fleetd=debug,vmfleet=debug";
const DB_FILE: &str = "fleet.redb";

#[derive(Parser)]
#[command(name = "fleetd", about = "GPU VM fleet daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Run {
        /// Fleet configuration (TOML). Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/vmfleet")]
        data_dir: PathBuf,

        /// Keep all state in memory; nothing survives a restart.
        #[arg(long)]
        in_memory: bool,
    },
    /// Validate a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print persisted metrics snapshots, newest first.
    Metrics {
        #[arg(long, default_value = "/var/lib/vmfleet")]
        data_dir: PathBuf,

        #[arg(long, default_value = "1")]
        limit: usize,

        /// Prometheus text instead of JSON (latest snapshot only).
        #[arg(long)]
        prometheus: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            in_memory,
        } => run(config.as_deref(), &data_dir, in_memory).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Metrics {
            data_dir,
            limit,
            prometheus,
        } => print_metrics(&data_dir, limit, prometheus),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let config = FleetConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(config_path: Option<&Path>, data_dir: &Path, in_memory: bool) -> anyhow::Result<()> {
    info!("fleetd starting");

    let config = load_config(config_path)?;
    let store = if in_memory {
        info!("using in-memory state store");
        StateStore::open_in_memory()?
    } else {
        open_store(data_dir)?
    };

    let orchestrator = Orchestrator::builder(config, store).build()?;
    info!(
        regions = orchestrator.regions().len(),
        vms = orchestrator.list_vms()?.len(),
        "orchestrator initialized"
    );

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = orchestrator.start(shutdown_rx);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    orchestrator.shutdown().await;

    info!("fleetd stopped");
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn print_metrics(data_dir: &Path, limit: usize, prometheus: bool) -> anyhow::Result<()> {
    let store = StateStore::open(&data_dir.join(DB_FILE))?;
    if prometheus {
        match store.latest_metrics()? {
            Some(snapshot) => print!("{}", vmfleet_metrics::render_prometheus(&snapshot)),
            None => anyhow::bail!("no metrics snapshots in {}", data_dir.display()),
        }
    } else {
        let snapshots = store.list_metrics(limit)?;
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from(["fleetd", "run", "--in-memory", "--log-json"]);
        assert!(cli.log_json);
        match cli.command {
            Command::Run { config, in_memory, .. } => {
                assert!(config.is_none());
                assert!(in_memory);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn example_config_is_valid() {
        let config = FleetConfig::from_toml_str(include_str!("../fleet.example.toml")).unwrap();
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.templates, FleetConfig::default().templates);
    }
}

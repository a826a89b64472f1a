//! poolgridd — the poolgrid daemon.
//!
//! Single binary that assembles every poolgrid manager:
//! - Connection pool manager (per-pool warm-up, acquire, eviction)
//! - Health monitor
//! - Leak detector
//! - Query diagnostics
//!
//! # Usage
//!
//! ```text
//! poolgridd init --pool primary --endpoint https://db.example.com --api-key anon
//! poolgridd check --config poolgrid.toml
//! poolgridd simulate --config poolgrid.toml --duration 30 --failure-rate 0.05
//! ```

mod backend;
mod simulate;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use poolgrid_core::PoolgridConfig;
use poolgrid_diagnostics::DiagnosticsConfig;
use poolgrid_health::HealthConfig;
use poolgrid_leak::LeakConfig;
use poolgrid_pool::PoolConfig;

use crate::simulate::SimulateOptions;

const DEFAULT_FILTER: &str = "info,poolgrid=debug";

#[derive(Parser)]
#[command(name = "poolgridd", about = "poolgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter poolgrid.toml with a single pool.
    Init {
        #[arg(long, default_value = "poolgrid.toml")]
        output: PathBuf,

        #[arg(long, default_value = "primary")]
        pool: String,

        #[arg(long)]
        endpoint: String,

        #[arg(long)]
        api_key: String,
    },

    /// Load and validate every section of a config file.
    Check {
        #[arg(long, default_value = "poolgrid.toml")]
        config: PathBuf,
    },

    /// Run a synthetic workload against an in-process simulated backend.
    Simulate {
        #[arg(long, default_value = "poolgrid.toml")]
        config: PathBuf,

        /// Workload length in seconds.
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Share of connects, probes and queries that fail (0.0 to 1.0).
        #[arg(long, default_value = "0.05")]
        failure_rate: f64,

        /// Concurrent workload tasks.
        #[arg(long, default_value = "4")]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Init {
            output,
            pool,
            endpoint,
            api_key,
        } => init(&output, &pool, &endpoint, &api_key),
        Command::Check { config } => check(&config),
        Command::Simulate {
            config,
            duration,
            failure_rate,
            workers,
        } => {
            anyhow::ensure!(
                (0.0..=1.0).contains(&failure_rate),
                "--failure-rate must be between 0 and 1, got {failure_rate}"
            );
            let config = load(&config)?;
            let options = SimulateOptions {
                duration: Duration::from_secs(duration),
                failure_rate,
                workers,
            };
            let report = simulate::run(config, options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load(path: &Path) -> anyhow::Result<PoolgridConfig> {
    PoolgridConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn init(output: &Path, pool: &str, endpoint: &str, api_key: &str) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = PoolgridConfig::scaffold(pool, endpoint, api_key);
    std::fs::write(output, config.to_toml_string()?)?;
    info!(path = %output.display(), pool, "config written");
    Ok(())
}

/// Validate every section; prints one line per pool.
fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let lines = validate(&config)?;
    for line in &lines {
        println!("{line}");
    }
    info!(path = %path.display(), pools = config.pools.len(), "config ok");
    Ok(())
}

fn validate(config: &PoolgridConfig) -> anyhow::Result<Vec<String>> {
    anyhow::ensure!(!config.pools.is_empty(), "no pools configured");

    HealthConfig::from_section(&config.health.clone().unwrap_or_default())
        .context("[health]")?;
    LeakConfig::from_section(&config.leak.clone().unwrap_or_default()).context("[leak]")?;
    DiagnosticsConfig::from_section(&config.diagnostics.clone().unwrap_or_default())
        .context("[diagnostics]")?;

    let mut lines = Vec::new();
    for (id, section) in &config.pools {
        let pool = PoolConfig::from_section(id, section)
            .with_context(|| format!("[pools.{id}]"))?;
        lines.push(format!(
            "pool {id}: min={} max={} acquire_timeout={:?} endpoint={}",
            pool.min, pool.max, pool.acquire_timeout, pool.connection.endpoint
        ));
    }
    Ok(lines)
}

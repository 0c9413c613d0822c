use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use conncache::CacheConfig;
use conncache::config::{self, Logging};
use humantime::parse_duration;
use serde::Deserialize;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Runs concurrent workloads against a connection cache with simulated connections.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Run the full tracing machinery, discarding its output.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to a local sink.
    #[arg(long)]
    metrics: bool,
}

/// The stresstest configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    logging: Logging,
    cache: CacheConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads: WorkloadsConfig =
        config::from_path(&cli.workloads).context("failed to load workloads")?;
    let config: Config = config::get(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    let logging_config = logging::Config {
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    let guard = logging::init(logging_config, &config.logging)?;
    if let Some(udp_sink) = guard.udp_sink {
        runtime.spawn(udp_sink);
    }

    let result = runtime.block_on(perform_stresstest(config.cache, workloads, cli.duration));
    if let Err(ref err) = result {
        conncache::logging::ensure_log_error(err);
    }

    result
}

use std::time::Duration;

use conncache::{Connection, ConnectionDriver};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of concurrent callers.
    pub concurrency: usize,
    /// Number of distinct connections the callers cycle through.
    pub keys: usize,
    /// How long opening a single connection takes.
    #[serde(with = "humantime_serde", default)]
    pub open_latency: Duration,
    /// How long each caller holds on to its lease.
    #[serde(with = "humantime_serde", default)]
    pub hold: Duration,
}

/// Describes a simulated connection.
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    pub key: String,
    pub open_latency: Duration,
}

impl SimulatedConfig {
    /// The config of the `n`-th key of workload `workload`.
    pub fn new(workload: usize, n: usize, open_latency: Duration) -> Self {
        Self {
            key: format!("workload-{workload}/key-{n}"),
            open_latency,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedConnection;

impl Connection for SimulatedConnection {
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// A driver whose connections take a configurable time to open, and nothing else.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

impl ConnectionDriver for SimulatedDriver {
    type Config = SimulatedConfig;
    type Connection = SimulatedConnection;

    fn cache_key(&self, config: &SimulatedConfig) -> String {
        config.key.clone()
    }

    fn open(
        &self,
        config: &SimulatedConfig,
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<SimulatedConnection>> {
        let latency = config.open_latency;
        async move {
            tokio::select! {
                _ = tokio::time::sleep(latency) => Ok(SimulatedConnection),
                _ = token.cancelled() => anyhow::bail!("opening was cancelled"),
            }
        }
        .boxed()
    }
}

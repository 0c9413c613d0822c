//! Helpers for testing the connection cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`MockDriver`] to open connections. Its behavior is controlled per connection through
//!    [`MockConfig`], and it records every open, close and hanging report for later assertions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use conncache::{CacheConfig, Connection, ConnectionDriver};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `conncache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("conncache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A cache config with short timeouts, suitable for tests.
pub fn cache_config(idle_capacity: usize) -> CacheConfig {
    CacheConfig {
        idle_capacity,
        open_timeout: Duration::from_secs(5),
        close_timeout: Duration::from_secs(5),
        hanging_check_interval: Duration::from_secs(60),
    }
}

/// Describes a mock connection, and how opening and closing it behaves.
#[derive(Clone, Debug, Default)]
pub struct MockConfig {
    /// The cache key.
    pub name: String,
    pub open_delay: Duration,
    pub close_delay: Duration,
    /// Opening fails after `open_delay`.
    pub fail_open: bool,
    /// Opening panics after `open_delay`.
    pub panic_open: bool,
    /// Closing fails after `close_delay`.
    pub fail_close: bool,
    /// Closing panics after `close_delay`.
    pub panic_close: bool,
    /// Opening keeps going after its token is cancelled, and eventually succeeds.
    pub ignore_cancellation: bool,
}

impl MockConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn panic_open(mut self) -> Self {
        self.panic_open = true;
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn panic_close(mut self) -> Self {
        self.panic_close = true;
        self
    }

    pub fn ignore_cancellation(mut self) -> Self {
        self.ignore_cancellation = true;
        self
    }
}

#[derive(Debug, Default)]
struct Stats {
    next_id: AtomicU64,
    /// Open attempts per key.
    opens: Mutex<BTreeMap<String, usize>>,
    /// Close calls per key.
    closes: Mutex<BTreeMap<String, usize>>,
    /// Keys reported as hanging, along with whether they were opening.
    hanging: Mutex<Vec<(String, bool)>>,
}

fn increment(counts: &Mutex<BTreeMap<String, usize>>, key: &str) {
    *counts.lock().unwrap().entry(key.to_owned()).or_default() += 1;
}

/// A connection opened by the [`MockDriver`].
#[derive(Debug)]
pub struct MockConnection {
    /// Unique across all connections opened by the same driver.
    pub id: u64,
    pub name: String,
    closed: AtomicBool,
    close_delay: Duration,
    fail_close: bool,
    panic_close: bool,
    stats: Arc<Stats>,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        async move {
            tokio::time::sleep(self.close_delay).await;
            increment(&self.stats.closes, &self.name);
            if self.panic_close {
                panic!("closing {} panicked", self.name);
            }
            if self.closed.swap(true, Ordering::SeqCst) {
                bail!("connection {} closed twice", self.id);
            }
            if self.fail_close {
                bail!("failed to close {}", self.name);
            }
            Ok(())
        }
        .boxed()
    }
}

/// A driver opening [`MockConnection`]s, which records everything that happens to them.
#[derive(Clone, Debug, Default)]
pub struct MockDriver {
    stats: Arc<Stats>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of times opening `name` was attempted.
    pub fn opens(&self, name: &str) -> usize {
        self.stats.opens.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// The number of times a connection for `name` was closed.
    pub fn closes(&self, name: &str) -> usize {
        self.stats.closes.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.stats.opens.lock().unwrap().values().sum()
    }

    pub fn total_closes(&self) -> usize {
        self.stats.closes.lock().unwrap().values().sum()
    }

    /// All hanging reports so far, as `(name, opening)`.
    pub fn hanging(&self) -> Vec<(String, bool)> {
        self.stats.hanging.lock().unwrap().clone()
    }
}

impl ConnectionDriver for MockDriver {
    type Config = MockConfig;
    type Connection = MockConnection;

    fn cache_key(&self, config: &MockConfig) -> String {
        config.name.clone()
    }

    fn open(
        &self,
        config: &MockConfig,
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<MockConnection>> {
        let config = config.clone();
        let stats = Arc::clone(&self.stats);

        async move {
            increment(&stats.opens, &config.name);

            if config.ignore_cancellation {
                tokio::time::sleep(config.open_delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(config.open_delay) => {}
                    _ = token.cancelled() => bail!("opening {} was cancelled", config.name),
                }
            }

            if config.panic_open {
                panic!("opening {} panicked", config.name);
            }
            if config.fail_open {
                bail!("failed to open {}", config.name);
            }

            Ok(MockConnection {
                id: stats.next_id.fetch_add(1, Ordering::SeqCst),
                name: config.name,
                closed: AtomicBool::new(false),
                close_delay: config.close_delay,
                fail_close: config.fail_close,
                panic_close: config.panic_close,
                stats,
            })
        }
        .boxed()
    }

    fn on_hanging(&self, config: &MockConfig, opening: bool) {
        tracing::warn!(name = %config.name, opening, "connection is hanging");
        self.stats
            .hanging
            .lock()
            .unwrap()
            .push((config.name.clone(), opening));
    }
}

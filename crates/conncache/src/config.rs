use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Tuning of a [`ConnectionCache`](crate::ConnectionCache).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of unreferenced, open connections kept around.
    ///
    /// When more connections become idle, the least recently used one is closed.
    pub idle_capacity: usize,

    /// Upper bound on opening a single connection.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    /// Duration after which a close still in progress is reported as hanging.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,

    /// How often the cache checks for hanging opens and closes.
    #[serde(with = "humantime_serde")]
    pub hanging_check_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_capacity: 100,
            open_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(300),
            hanging_check_interval: Duration::from_secs(60),
        }
    }
}

/// Parses a YAML configuration, rejecting empty input.
pub fn from_reader<T: DeserializeOwned>(mut reader: impl io::Read) -> Result<T> {
    let mut config = String::new();
    reader
        .read_to_string(&mut config)
        .context("failed reading config file")?;
    if config.trim().is_empty() {
        anyhow::bail!("config file empty");
    }
    serde_yaml::from_str(&config).context("failed to parse config YAML")
}

/// Loads a YAML configuration file.
pub fn from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open config file {}", path.display()))?;
    from_reader(file)
}

/// Loads a YAML configuration file, or the defaults if no path is given.
pub fn get<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(path) => from_path(path),
        None => Ok(T::default()),
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
}

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

const MIB: u64 = 1024 * 1024;

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
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "lazyload".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Budget of the in-memory artifact cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Upper limit in bytes. Reaching it triggers an eviction.
    pub budget: u64,

    /// The size in bytes an eviction shrinks the cache to.
    ///
    /// Defaults to the budget minus 4 MiB, or minus a fifth of the budget for budgets below
    /// 20 MiB.
    pub low_watermark: Option<u64>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            budget: 10 * MIB,
            low_watermark: None,
        }
    }
}

impl MemoryCacheConfig {
    pub fn upper_limit(&self) -> u64 {
        self.budget
    }

    pub fn lower_limit(&self) -> u64 {
        match self.low_watermark {
            Some(low) => low.min(self.budget),
            None => self.budget - (4 * MIB).min(self.budget / 5),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// The in-memory tier.
    pub memory: MemoryCacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory in which fetched artifacts are stored. Created if it does not exist.
    pub storage_dir: PathBuf,

    /// Configuration of the cache tiers.
    pub caches: CacheConfigs,

    /// The maximum number of concurrently running download workers.
    pub max_download_workers: usize,

    /// The timeout for establishing a connection in a download.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a single download may take, including all retries.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// How often a failed download is attempted before giving up.
    pub download_attempts: usize,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_dir: env::temp_dir().join("lazyload"),
            caches: CacheConfigs::default(),
            max_download_workers: 5,
            connect_timeout: Duration::from_secs(1),
            max_download_timeout: Duration::from_secs(60),
            download_attempts: 3,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        Ok(match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        })
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed to read config file")?;

        // check for empty files explicitly
        // see https://github.com/dtolnay/serde-yaml/issues/86
        if config.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(E::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

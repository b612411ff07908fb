use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

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
    /// The log level for mediacache.
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "mediacache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where media and the probe endpoint live.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the media store.
    ///
    /// Media is downloaded from `{base_url}/studies/{study_id}/media/{media_id}/download`.
    pub base_url: Url,

    /// Extra headers sent with every request, for instance `Authorization`.
    pub headers: BTreeMap<String, String>,

    /// Path of a small, low-latency endpoint relative to `base_url`, used by the connection probe.
    pub probe_path: String,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum duration of a single media download.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The maximum duration of a single probe round trip.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://127.0.0.1:8042/api/").expect("static URL is valid"),
            headers: BTreeMap::new(),
            probe_path: "ping".to_owned(),
            connect_timeout: Duration::from_secs(2),
            max_download_timeout: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Tuning of the in-memory media cache.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaCacheConfig {
    /// Capacity ceiling of resident bytes.
    ///
    /// Defaults to `512 MiB`.
    pub capacity_bytes: u64,

    /// Maximum age of an entry, measured from its creation.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Fraction of `capacity_bytes` above which eviction kicks in.
    pub cleanup_threshold: f64,

    /// Fraction of `capacity_bytes` that eviction brings usage down to.
    pub target_threshold: f64,

    /// How often the janitor sweeps expired entries.
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,

    /// Number of most recent lookups the rolling hit rate is computed over.
    pub hit_rate_window: usize,
}

impl Default for MediaCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
            ttl: Duration::from_secs(30 * 60),
            cleanup_threshold: 0.8,
            target_threshold: 0.6,
            janitor_interval: Duration::from_secs(5 * 60),
            hit_rate_window: 100,
        }
    }
}

impl MediaCacheConfig {
    /// Resident bytes above which capacity-triggered eviction runs.
    pub fn cleanup_bytes(&self) -> u64 {
        (self.capacity_bytes as f64 * self.cleanup_threshold) as u64
    }

    /// Resident bytes that eviction brings usage down to.
    pub fn target_bytes(&self) -> u64 {
        (self.capacity_bytes as f64 * self.target_threshold) as u64
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            cleanup_threshold,
            target_threshold,
            ..
        } = *self;
        anyhow::ensure!(
            0.0 < target_threshold
                && target_threshold < cleanup_threshold
                && cleanup_threshold <= 1.0,
            "expected 0 < target_threshold ({target_threshold}) \
             < cleanup_threshold ({cleanup_threshold}) <= 1"
        );
        anyhow::ensure!(self.hit_rate_window > 0, "hit_rate_window must not be 0");
        Ok(())
    }
}

/// Tuning of the connection probe.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// How long a measurement is reused before the connection is probed again.
    #[serde(with = "humantime_serde")]
    pub validity: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The remote media store.
    pub remote: RemoteConfig,

    /// The in-memory media cache.
    pub cache: MediaCacheConfig,

    /// The connection probe.
    pub probe: ProbeConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values that cannot work together.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate().context("invalid cache configuration")
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
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
            _ => Err(de::Error::unknown_variant(
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

//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use mediacache_service::advisor::{LoadingAdvisor, MediaKind};
use mediacache_service::caching::{CacheKey, MediaCache};
use mediacache_service::config::Config;
use mediacache_service::download::{DownloadProgress, HttpFetcher, ProgressFn};
use mediacache_service::handles::BlobRegistry;
use mediacache_service::metrics;
use mediacache_service::probe::{ConnectionProbe, HttpProbeTarget};

use crate::logging;

/// Mediacache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch media through a fresh cache and print the cache statistics.
    Fetch {
        /// The study the media belongs to.
        #[arg(long)]
        study: String,

        /// The media to fetch.
        #[arg(long)]
        media: String,

        /// How many times to resolve the media. All but the first are served from memory.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Measure the connection to the media store.
    Probe,

    /// Decide how a resource should be loaded on the current connection.
    Advise {
        /// The size of the resource in bytes.
        #[arg(long)]
        size: u64,

        /// The kind of media.
        #[arg(long, value_enum)]
        kind: KindArg,

        /// The resource is outside the viewport.
        #[arg(long)]
        offscreen: bool,

        /// The cache hit rate to assume, between 0 and 1.
        #[arg(long, default_value_t = 0.0)]
        hit_rate: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Image,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Image => MediaKind::Image,
            KindArg::Video => MediaKind::Video,
        }
    }
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "mediacache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads are running yet, the runtime is only created below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let output = match command {
        Command::Fetch {
            study,
            media,
            repeat,
        } => fetch(&config, CacheKey::new(study, media), repeat).await?,
        Command::Probe => probe(&config).await?,
        Command::Advise {
            size,
            kind,
            offscreen,
            hit_rate,
        } => advise(&config, size, kind.into(), !offscreen, hit_rate).await?,
    };

    println!("{output}");
    Ok(())
}

async fn fetch(config: &Config, key: CacheKey, repeat: u32) -> Result<String> {
    let fetcher =
        HttpFetcher::from_config(&config.remote).context("failed to create the client")?;
    let cache = MediaCache::new(config.cache, Arc::new(fetcher), BlobRegistry::new());

    let on_progress: ProgressFn = Arc::new(|progress: DownloadProgress| {
        tracing::trace!(loaded = progress.loaded, total = ?progress.total, "Download progress");
    });

    for _ in 0..repeat.max(1) {
        let handle = cache
            .resolve(key.clone(), Some(on_progress.clone()))
            .await
            .with_context(|| format!("failed to fetch {key}"))?;
        tracing::info!(%handle, "Resolved {}", key);
    }

    serde_json::to_string_pretty(&cache.stats()).context("failed to serialize cache stats")
}

fn connection_probe(config: &Config) -> Result<ConnectionProbe> {
    let target =
        HttpProbeTarget::from_config(&config.remote).context("failed to create the probe")?;
    tracing::debug!("Probing `{}`", target.url());
    Ok(ConnectionProbe::new(Arc::new(target), config.probe))
}

async fn probe(config: &Config) -> Result<String> {
    let measurement = connection_probe(config)?.measure().await;
    serde_json::to_string_pretty(&measurement).context("failed to serialize the measurement")
}

async fn advise(
    config: &Config,
    size: u64,
    kind: MediaKind,
    in_viewport: bool,
    hit_rate: f64,
) -> Result<String> {
    let advisor = LoadingAdvisor::new(Arc::new(connection_probe(config)?));
    advisor.update_cache_hit_rate(hit_rate);

    let decision = advisor.decide(size, kind, in_viewport).await;
    serde_json::to_string_pretty(&decision).context("failed to serialize the decision")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use mediacache_test::{MediaServer, setup};

    use super::*;

    fn config_for(server: &MediaServer) -> Config {
        let mut config = Config::default();
        config.remote.base_url = server.url("/api/");
        config
    }

    #[test]
    fn test_parse_cli() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "mediacache",
            "advise",
            "--size",
            "1000",
            "--kind",
            "video",
            "--offscreen",
            "-c",
            "mediacache.yml",
        ])
        .unwrap();
        assert_eq!(cli.config(), Some(Path::new("mediacache.yml")));
        assert!(matches!(
            cli.command,
            Command::Advise {
                size: 1000,
                kind: KindArg::Video,
                offscreen: true,
                ..
            }
        ));

        assert!(Cli::try_parse_from(["mediacache", "advise", "--kind", "audio"]).is_err());
    }

    #[tokio::test]
    async fn test_fetch_repeated() {
        setup();

        let server = MediaServer::new();
        server.add_media("s1", "m1", vec![0; 100]);

        let output = fetch(&config_for(&server), CacheKey::new("s1", "m1"), 3)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(stats["used_bytes"], 100);
        assert_eq!(stats["item_count"], 1);
        assert_eq!(server.downloads(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        setup();

        let server = MediaServer::new();
        let result = fetch(&config_for(&server), CacheKey::new("s1", "m1"), 1).await;
        let error = result.unwrap_err();
        assert_eq!(error.to_string(), "failed to fetch s1/m1");
    }

    #[tokio::test]
    async fn test_advise() {
        setup();

        let server = MediaServer::new();
        let output = advise(&config_for(&server), 500 * 1024 * 1024, MediaKind::Video, true, 0.0)
            .await
            .unwrap();
        let decision: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(decision["use_streaming"], true);
        assert_eq!(server.pings(), 1);
    }
}

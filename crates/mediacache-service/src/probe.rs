//! Measures the quality of the connection to the remote store.
//!
//! A measurement is one small round trip whose latency and payload size give a rough bandwidth
//! estimate. Measurements are reused for a validity window, and probing never fails: on any
//! error a fixed default measurement is reported instead.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{ProbeConfig, RemoteConfig};
use crate::utils::http::{DownloadTimeouts, create_client, header_map};

/// Payload size assumed when the probe endpoint does not announce a `Content-Length`.
const ASSUMED_PROBE_BYTES: u64 = 1024;

/// Coarse classification of the connection bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    /// Below 1 Mbps.
    Slow,
    /// From 1 up to 5 Mbps.
    Medium,
    /// 5 Mbps and above.
    Fast,
}

impl SpeedTier {
    pub fn from_bandwidth(mbps: f64) -> Self {
        if mbps >= 5.0 {
            Self::Fast
        } else if mbps >= 1.0 {
            Self::Medium
        } else {
            Self::Slow
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Slow => "slow",
            Self::Medium => "medium",
            Self::Fast => "fast",
        }
    }
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one connection probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionMeasurement {
    pub speed_tier: SpeedTier,
    pub estimated_bandwidth_mbps: f64,
    pub rtt_ms: u64,
    #[serde(skip)]
    pub measured_at: Instant,
}

impl ConnectionMeasurement {
    /// The measurement reported when probing fails.
    pub fn fallback(measured_at: Instant) -> Self {
        Self {
            speed_tier: SpeedTier::Medium,
            estimated_bandwidth_mbps: 2.0,
            rtt_ms: 100,
            measured_at,
        }
    }

    /// Derives a measurement from a round trip transferring `bytes` in `elapsed`.
    pub fn from_round_trip(bytes: u64, elapsed: Duration, measured_at: Instant) -> Self {
        let secs = elapsed.max(Duration::from_millis(1)).as_secs_f64();
        let estimated_bandwidth_mbps = bytes as f64 * 8.0 / secs / 1_000_000.0;
        Self {
            speed_tier: SpeedTier::from_bandwidth(estimated_bandwidth_mbps),
            estimated_bandwidth_mbps,
            rtt_ms: elapsed.as_millis() as u64,
            measured_at,
        }
    }

    fn is_fresh(&self, now: Instant, validity: Duration) -> bool {
        now.saturating_duration_since(self.measured_at) < validity
    }
}

/// An error while probing. Never surfaced beyond [`ConnectionProbe`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed")]
    Request(#[from] reqwest::Error),
    #[error("probe endpoint responded with {0}")]
    Status(StatusCode),
    #[error("invalid probe url")]
    InvalidUrl,
}

/// The endpoint a [`ConnectionProbe`] round trips to.
pub trait ProbeTarget: Send + Sync + 'static {
    /// Performs one round trip and returns the announced payload size, if any.
    fn round_trip(&self) -> BoxFuture<'_, Result<Option<u64>, ProbeError>>;
}

impl fmt::Debug for dyn ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProbeTarget")
    }
}

/// Probes a small endpoint of the remote store over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProbeTarget {
    client: Client,
    url: Url,
    headers: HeaderMap,
}

impl HttpProbeTarget {
    pub fn new(client: Client, url: Url, headers: &BTreeMap<String, String>) -> Self {
        Self {
            client,
            url,
            headers: header_map(headers),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, ProbeError> {
        let client = create_client(&DownloadTimeouts::for_probe(config))?;
        let url = probe_url(&config.base_url, &config.probe_path)?;
        Ok(Self::new(client, url, &config.headers))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch(&self) -> Result<Option<u64>, ProbeError> {
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status));
        }

        let content_length = response.content_length();
        // The transfer counts towards the measurement, not only the headers.
        response.bytes().await?;
        Ok(content_length)
    }
}

impl ProbeTarget for HttpProbeTarget {
    fn round_trip(&self) -> BoxFuture<'_, Result<Option<u64>, ProbeError>> {
        Box::pin(self.fetch())
    }
}

fn probe_url(base_url: &Url, probe_path: &str) -> Result<Url, ProbeError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| ProbeError::InvalidUrl)?
        .pop_if_empty()
        .extend(probe_path.split('/').filter(|s| !s.is_empty()));
    Ok(url)
}

/// Measures the connection and reuses the result for a validity window.
///
/// Concurrent calls to [`measure`](Self::measure) never probe in parallel. Callers arriving
/// while a round trip is underway wait for it and get its result.
#[derive(Debug)]
pub struct ConnectionProbe {
    target: Arc<dyn ProbeTarget>,
    validity: Duration,
    last: Mutex<Option<ConnectionMeasurement>>,
}

impl ConnectionProbe {
    pub fn new(target: Arc<dyn ProbeTarget>, config: ProbeConfig) -> Self {
        Self {
            target,
            validity: config.validity,
            last: Mutex::new(None),
        }
    }

    /// Returns a current measurement, probing the connection if the last one is stale.
    pub async fn measure(&self) -> ConnectionMeasurement {
        // Held across the round trip so that concurrent callers share it.
        let mut last = self.last.lock().await;
        if let Some(measurement) = *last {
            if measurement.is_fresh(Instant::now(), self.validity) {
                return measurement;
            }
        }

        let measurement = self.probe().await;
        *last = Some(measurement);
        measurement
    }

    /// Discards the last measurement, so the next [`measure`](Self::measure) probes again.
    pub async fn invalidate(&self) {
        self.last.lock().await.take();
    }

    async fn probe(&self) -> ConnectionMeasurement {
        let start = Instant::now();
        let result = self.target.round_trip().await;
        let now = Instant::now();

        match result {
            Ok(content_length) => {
                let bytes = content_length.unwrap_or(ASSUMED_PROBE_BYTES);
                let measurement =
                    ConnectionMeasurement::from_round_trip(bytes, now - start, now);
                tracing::debug!(
                    tier = %measurement.speed_tier,
                    bandwidth_mbps = measurement.estimated_bandwidth_mbps,
                    rtt_ms = measurement.rtt_ms,
                    "Measured connection"
                );
                metric!(
                    timer("probe.measure") = now - start,
                    "tier" => measurement.speed_tier.as_str()
                );
                measurement
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Connection probe failed, assuming defaults"
                );
                metric!(counter("probe.failed") += 1);
                ConnectionMeasurement::fallback(now)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mediacache_test::{MediaServer, PING_BYTES, setup};

    use super::*;

    /// A target that takes `delay` to transfer `content_length` bytes.
    struct FakeTarget {
        delay: Duration,
        content_length: Option<u64>,
        fail: bool,
        round_trips: AtomicUsize,
    }

    impl FakeTarget {
        fn new(delay: Duration, content_length: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                content_length,
                fail: false,
                round_trips: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(10),
                content_length: None,
                fail: true,
                round_trips: AtomicUsize::new(0),
            })
        }

        fn round_trips(&self) -> usize {
            self.round_trips.load(Ordering::SeqCst)
        }
    }

    impl ProbeTarget for FakeTarget {
        fn round_trip(&self) -> BoxFuture<'_, Result<Option<u64>, ProbeError>> {
            Box::pin(async move {
                self.round_trips.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    return Err(ProbeError::Status(StatusCode::SERVICE_UNAVAILABLE));
                }
                Ok(self.content_length)
            })
        }
    }

    fn probe(target: &Arc<FakeTarget>) -> ConnectionProbe {
        ConnectionProbe::new(target.clone(), ProbeConfig::default())
    }

    #[test]
    fn test_speed_tiers() {
        assert_eq!(SpeedTier::from_bandwidth(0.0), SpeedTier::Slow);
        assert_eq!(SpeedTier::from_bandwidth(0.99), SpeedTier::Slow);
        assert_eq!(SpeedTier::from_bandwidth(1.0), SpeedTier::Medium);
        assert_eq!(SpeedTier::from_bandwidth(4.99), SpeedTier::Medium);
        assert_eq!(SpeedTier::from_bandwidth(5.0), SpeedTier::Fast);
        assert_eq!(SpeedTier::from_bandwidth(120.0), SpeedTier::Fast);
    }

    #[test]
    fn test_instant_round_trip() {
        let now = Instant::now();
        let measurement = ConnectionMeasurement::from_round_trip(1000, Duration::ZERO, now);
        // elapsed is clamped to 1ms
        assert!((measurement.estimated_bandwidth_mbps - 8.0).abs() < 1e-9);
        assert_eq!(measurement.speed_tier, SpeedTier::Fast);
        assert_eq!(measurement.rtt_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure() {
        let target = FakeTarget::new(Duration::from_millis(100), Some(125_000));
        let probe = probe(&target);

        let measurement = probe.measure().await;
        assert_eq!(measurement.speed_tier, SpeedTier::Fast);
        assert_eq!(measurement.rtt_ms, 100);
        assert!((measurement.estimated_bandwidth_mbps - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_content_length() {
        let target = FakeTarget::new(Duration::from_secs(1), None);
        let probe = probe(&target);

        let measurement = probe.measure().await;
        assert!((measurement.estimated_bandwidth_mbps - 0.008192).abs() < 1e-9);
        assert_eq!(measurement.speed_tier, SpeedTier::Slow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_within_validity() {
        let target = FakeTarget::new(Duration::from_millis(100), Some(125_000));
        let probe = probe(&target);

        let first = probe.measure().await;
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(probe.measure().await, first);
        assert_eq!(target.round_trips(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = probe.measure().await;
        assert_ne!(second.measured_at, first.measured_at);
        assert_eq!(target.round_trips(), 2);

        probe.invalidate().await;
        probe.measure().await;
        assert_eq!(target.round_trips(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_measure() {
        let target = FakeTarget::new(Duration::from_millis(300), Some(50_000));
        let probe = probe(&target);

        let (a, b, c) = futures::join!(probe.measure(), probe.measure(), probe.measure());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(target.round_trips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back() {
        let target = FakeTarget::failing();
        let probe = probe(&target);

        let measurement = probe.measure().await;
        assert_eq!(measurement.speed_tier, SpeedTier::Medium);
        assert_eq!(measurement.estimated_bandwidth_mbps, 2.0);
        assert_eq!(measurement.rtt_ms, 100);

        // the fallback is reused like any other measurement
        probe.measure().await;
        assert_eq!(target.round_trips(), 1);
    }

    #[test]
    fn test_probe_url() {
        let base = Url::parse("https://pacs.example.com/api/").unwrap();
        assert_eq!(
            probe_url(&base, "ping").unwrap().as_str(),
            "https://pacs.example.com/api/ping"
        );
        assert_eq!(
            probe_url(&base, "/health/ping").unwrap().as_str(),
            "https://pacs.example.com/api/health/ping"
        );
    }

    #[tokio::test]
    async fn test_http_probe() {
        setup();

        let server = MediaServer::new();
        let config = RemoteConfig {
            base_url: server.url("/api/"),
            ..Default::default()
        };
        let target = HttpProbeTarget::from_config(&config).unwrap();
        assert_eq!(target.round_trip().await.unwrap(), Some(PING_BYTES));
        assert_eq!(server.pings(), 1);

        let probe = ConnectionProbe::new(Arc::new(target), ProbeConfig::default());
        let measurement = probe.measure().await;
        assert!(measurement.estimated_bandwidth_mbps > 0.0);
        assert_eq!(server.pings(), 2);
    }

    #[tokio::test]
    async fn test_http_probe_unavailable() {
        setup();

        let server = MediaServer::new();
        server.fail_with(StatusCode::SERVICE_UNAVAILABLE);
        let target = HttpProbeTarget::new(Client::new(), server.url("/api/ping"), &BTreeMap::new());

        let result = target.round_trip().await;
        assert!(matches!(
            result,
            Err(ProbeError::Status(StatusCode::SERVICE_UNAVAILABLE))
        ));
    }
}

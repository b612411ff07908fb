//! Decides how a media resource should be loaded given the current connection quality.
//!
//! The decision itself is a pure function of a [`ConnectionMeasurement`], the cache hit rate and
//! a [`ResourceDescriptor`]. [`LoadingAdvisor`] wires it up with a live [`ConnectionProbe`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::probe::{ConnectionMeasurement, ConnectionProbe, SpeedTier};

const MIB: u64 = 1024 * 1024;

/// Videos below this size may be cached in full on a fast connection.
const SMALL_VIDEO_BYTES: u64 = 50 * MIB;
/// Videos above this size are always streamed.
const LARGE_VIDEO_BYTES: u64 = 100 * MIB;
/// Images below this size are cached when the hit rate is good.
const SMALL_IMAGE_BYTES: u64 = 2 * MIB;

const HIGH_LATENCY_RTT_MS: u64 = 1000;
const VIDEO_CACHE_HIT_RATE: f64 = 0.7;
const IMAGE_CACHE_HIT_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classifies a MIME type, like `image/jpeg` or `video/mp4`.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let (kind, _) = content_type.split_once('/')?;
        match kind.trim().to_ascii_lowercase().as_str() {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl From<SpeedTier> for QualityTier {
    fn from(tier: SpeedTier) -> Self {
        match tier {
            SpeedTier::Slow => Self::Low,
            SpeedTier::Medium => Self::Medium,
            SpeedTier::Fast => Self::High,
        }
    }
}

/// How eagerly a resource is loaded ahead of playback or display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStrategy {
    None,
    Metadata,
    Auto,
}

/// The resource a decision is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub size_bytes: u64,
    pub kind: MediaKind,
    pub in_viewport: bool,
}

/// How to load one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadingDecision {
    pub use_streaming: bool,
    pub quality: QualityTier,
    pub chunk_size_kb: u32,
    pub preload: PreloadStrategy,
    /// Which rule produced this decision.
    pub reason: &'static str,
}

fn chunk_size_kb(tier: SpeedTier) -> u32 {
    match tier {
        SpeedTier::Slow => 256,
        SpeedTier::Medium => 512,
        SpeedTier::Fast => 1024,
    }
}

fn viewport_preload(in_viewport: bool) -> PreloadStrategy {
    if in_viewport {
        PreloadStrategy::Metadata
    } else {
        PreloadStrategy::None
    }
}

/// Decides how to load `resource`.
///
/// Deterministic: the same inputs always yield the same decision. `hit_rate` is clamped to
/// `[0, 1]`. Resources outside the viewport are never preloaded with [`PreloadStrategy::Auto`].
pub fn decide_with(
    measurement: &ConnectionMeasurement,
    hit_rate: f64,
    resource: &ResourceDescriptor,
) -> LoadingDecision {
    let hit_rate = clamp_hit_rate(hit_rate);
    let tier = measurement.speed_tier;
    let size = resource.size_bytes;

    let mut decision = match resource.kind {
        MediaKind::Video => {
            if tier == SpeedTier::Slow || measurement.rtt_ms > HIGH_LATENCY_RTT_MS {
                LoadingDecision {
                    use_streaming: true,
                    quality: QualityTier::Low,
                    chunk_size_kb: chunk_size_kb(SpeedTier::Slow),
                    preload: PreloadStrategy::None,
                    reason: "slow or high latency connection, streaming at low quality",
                }
            } else if tier == SpeedTier::Fast
                && size < SMALL_VIDEO_BYTES
                && hit_rate > VIDEO_CACHE_HIT_RATE
            {
                LoadingDecision {
                    use_streaming: false,
                    quality: QualityTier::High,
                    chunk_size_kb: chunk_size_kb(SpeedTier::Fast),
                    preload: PreloadStrategy::Auto,
                    reason: "fast connection and small video with good hit rate, caching in full",
                }
            } else if size > LARGE_VIDEO_BYTES {
                LoadingDecision {
                    use_streaming: true,
                    quality: tier.into(),
                    chunk_size_kb: chunk_size_kb(tier),
                    preload: viewport_preload(resource.in_viewport),
                    reason: "large video, streaming",
                }
            } else {
                LoadingDecision {
                    use_streaming: true,
                    quality: tier.into(),
                    chunk_size_kb: chunk_size_kb(tier),
                    preload: viewport_preload(resource.in_viewport),
                    reason: "streaming at connection quality",
                }
            }
        }
        MediaKind::Image => {
            if size < SMALL_IMAGE_BYTES && hit_rate > IMAGE_CACHE_HIT_RATE {
                LoadingDecision {
                    use_streaming: false,
                    quality: tier.into(),
                    chunk_size_kb: chunk_size_kb(tier),
                    preload: PreloadStrategy::Auto,
                    reason: "small image with good hit rate, caching in full",
                }
            } else if tier == SpeedTier::Slow {
                LoadingDecision {
                    use_streaming: true,
                    quality: QualityTier::Low,
                    chunk_size_kb: chunk_size_kb(SpeedTier::Slow),
                    preload: PreloadStrategy::None,
                    reason: "slow connection, progressive low quality load",
                }
            } else {
                LoadingDecision {
                    use_streaming: false,
                    quality: tier.into(),
                    chunk_size_kb: chunk_size_kb(tier),
                    preload: PreloadStrategy::Auto,
                    reason: "loading in full at connection quality",
                }
            }
        }
    };

    if decision.preload == PreloadStrategy::Auto && !resource.in_viewport {
        decision.preload = PreloadStrategy::None;
    }
    decision
}

fn clamp_hit_rate(rate: f64) -> f64 {
    if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) }
}

/// Produces [`LoadingDecision`]s from live connection measurements.
#[derive(Debug)]
pub struct LoadingAdvisor {
    probe: Arc<ConnectionProbe>,
    hit_rate: Mutex<f64>,
}

impl LoadingAdvisor {
    pub fn new(probe: Arc<ConnectionProbe>) -> Self {
        Self {
            probe,
            hit_rate: Mutex::new(0.0),
        }
    }

    pub fn probe(&self) -> &ConnectionProbe {
        &self.probe
    }

    /// Sets the cache hit rate used by later decisions, typically
    /// [`MediaCache::hit_rate`](crate::caching::MediaCache::hit_rate).
    pub fn update_cache_hit_rate(&self, rate: f64) {
        *self.hit_rate.lock() = clamp_hit_rate(rate);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        *self.hit_rate.lock()
    }

    pub async fn decide(
        &self,
        size_bytes: u64,
        kind: MediaKind,
        in_viewport: bool,
    ) -> LoadingDecision {
        let measurement = self.probe.measure().await;
        let resource = ResourceDescriptor {
            size_bytes,
            kind,
            in_viewport,
        };
        let decision = decide_with(&measurement, self.cache_hit_rate(), &resource);

        tracing::trace!(?resource, ?decision, "Decided loading strategy");
        metric!(
            counter("advisor.decision") += 1,
            "kind" => kind.as_str(),
            "streaming" => if decision.use_streaming { "true" } else { "false" },
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::time::Instant;

    use crate::config::ProbeConfig;
    use crate::probe::{ProbeError, ProbeTarget};

    use super::*;

    fn measurement(speed_tier: SpeedTier, rtt_ms: u64) -> ConnectionMeasurement {
        let estimated_bandwidth_mbps = match speed_tier {
            SpeedTier::Slow => 0.5,
            SpeedTier::Medium => 2.0,
            SpeedTier::Fast => 20.0,
        };
        ConnectionMeasurement {
            speed_tier,
            estimated_bandwidth_mbps,
            rtt_ms,
            measured_at: Instant::now(),
        }
    }

    fn video(size_bytes: u64, in_viewport: bool) -> ResourceDescriptor {
        ResourceDescriptor {
            size_bytes,
            kind: MediaKind::Video,
            in_viewport,
        }
    }

    fn image(size_bytes: u64, in_viewport: bool) -> ResourceDescriptor {
        ResourceDescriptor {
            size_bytes,
            kind: MediaKind::Image,
            in_viewport,
        }
    }

    #[test]
    fn test_small_video_fast_connection() {
        let fast = measurement(SpeedTier::Fast, 40);

        let decision = decide_with(&fast, 0.8, &video(10_000_000, true));
        insta::assert_debug_snapshot!(decision, @r###"
        LoadingDecision {
            use_streaming: false,
            quality: High,
            chunk_size_kb: 1024,
            preload: Auto,
            reason: "fast connection and small video with good hit rate, caching in full",
        }
        "###);

        // same decision every time
        assert_eq!(decide_with(&fast, 0.8, &video(10_000_000, true)), decision);

        let offscreen = decide_with(&fast, 0.8, &video(10_000_000, false));
        assert!(!offscreen.use_streaming);
        assert_eq!(offscreen.quality, QualityTier::High);
        assert_eq!(offscreen.preload, PreloadStrategy::None);
    }

    #[test]
    fn test_slow_video() {
        let decision = decide_with(&measurement(SpeedTier::Slow, 80), 1.0, &video(1_000, true));
        insta::assert_debug_snapshot!(decision, @r###"
        LoadingDecision {
            use_streaming: true,
            quality: Low,
            chunk_size_kb: 256,
            preload: None,
            reason: "slow or high latency connection, streaming at low quality",
        }
        "###);

        // a fast link with high latency is treated the same
        let laggy = decide_with(&measurement(SpeedTier::Fast, 1500), 1.0, &video(1_000, true));
        assert_eq!(laggy, decision);
    }

    #[test]
    fn test_large_video_always_streams() {
        let decision = decide_with(
            &measurement(SpeedTier::Fast, 20),
            1.0,
            &video(200 * MIB, true),
        );
        insta::assert_debug_snapshot!(decision, @r###"
        LoadingDecision {
            use_streaming: true,
            quality: High,
            chunk_size_kb: 1024,
            preload: Metadata,
            reason: "large video, streaming",
        }
        "###);

        let medium = decide_with(
            &measurement(SpeedTier::Medium, 20),
            1.0,
            &video(200 * MIB, false),
        );
        assert!(medium.use_streaming);
        assert_eq!(medium.quality, QualityTier::Medium);
        assert_eq!(medium.chunk_size_kb, 512);
        assert_eq!(medium.preload, PreloadStrategy::None);
    }

    #[test]
    fn test_video_otherwise_streams_by_tier() {
        // fast, but the hit rate is too low to cache
        let decision = decide_with(&measurement(SpeedTier::Fast, 20), 0.7, &video(MIB, true));
        insta::assert_debug_snapshot!(decision, @r###"
        LoadingDecision {
            use_streaming: true,
            quality: High,
            chunk_size_kb: 1024,
            preload: Metadata,
            reason: "streaming at connection quality",
        }
        "###);

        let medium = decide_with(&measurement(SpeedTier::Medium, 20), 1.0, &video(MIB, false));
        assert!(medium.use_streaming);
        assert_eq!(medium.quality, QualityTier::Medium);
        assert_eq!(medium.preload, PreloadStrategy::None);
    }

    #[test]
    fn test_images() {
        let medium = measurement(SpeedTier::Medium, 50);

        let cached = decide_with(&medium, 0.6, &image(MIB, true));
        insta::assert_debug_snapshot!(cached, @r###"
        LoadingDecision {
            use_streaming: false,
            quality: Medium,
            chunk_size_kb: 512,
            preload: Auto,
            reason: "small image with good hit rate, caching in full",
        }
        "###);

        let offscreen = decide_with(&medium, 0.6, &image(MIB, false));
        assert_eq!(offscreen.preload, PreloadStrategy::None);

        let slow = decide_with(&measurement(SpeedTier::Slow, 50), 0.1, &image(5 * MIB, true));
        insta::assert_debug_snapshot!(slow, @r###"
        LoadingDecision {
            use_streaming: true,
            quality: Low,
            chunk_size_kb: 256,
            preload: None,
            reason: "slow connection, progressive low quality load",
        }
        "###);

        let large = decide_with(&medium, 0.9, &image(5 * MIB, false));
        assert!(!large.use_streaming);
        assert_eq!(large.quality, QualityTier::Medium);
        assert_eq!(large.preload, PreloadStrategy::None);
    }

    #[test]
    fn test_hit_rate_clamped() {
        let fast = measurement(SpeedTier::Fast, 10);
        let resource = video(MIB, true);
        assert_eq!(
            decide_with(&fast, 7.0, &resource),
            decide_with(&fast, 1.0, &resource)
        );
        assert_eq!(
            decide_with(&fast, f64::NAN, &resource),
            decide_with(&fast, 0.0, &resource)
        );
        assert_eq!(
            decide_with(&fast, -3.0, &resource),
            decide_with(&fast, 0.0, &resource)
        );
    }

    #[test]
    fn test_media_kind_from_content_type() {
        assert_eq!(MediaKind::from_content_type("image/jpeg"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_content_type("Video/MP4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_content_type("application/dicom"), None);
        assert_eq!(MediaKind::from_content_type("image"), None);
    }

    struct FixedTarget;

    impl ProbeTarget for FixedTarget {
        fn round_trip(&self) -> BoxFuture<'_, Result<Option<u64>, ProbeError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Some(250_000))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisor() {
        let probe = ConnectionProbe::new(Arc::new(FixedTarget), ProbeConfig::default());
        let advisor = LoadingAdvisor::new(Arc::new(probe));
        assert_eq!(advisor.cache_hit_rate(), 0.0);

        // 20 Mbps, but nothing is cached yet
        let decision = advisor.decide(10_000_000, MediaKind::Video, true).await;
        assert!(decision.use_streaming);

        advisor.update_cache_hit_rate(0.8);
        let decision = advisor.decide(10_000_000, MediaKind::Video, true).await;
        assert!(!decision.use_streaming);
        assert_eq!(decision.quality, QualityTier::High);
        assert_eq!(decision.preload, PreloadStrategy::Auto);

        advisor.update_cache_hit_rate(f64::NAN);
        assert_eq!(advisor.cache_hit_rate(), 0.0);
    }
}

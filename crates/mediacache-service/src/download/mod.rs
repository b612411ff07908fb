//! The contract between the media cache and whatever transfers media bytes.
//!
//! The cache does not retry; every [`FetchError`] is surfaced verbatim to the caller of
//! [`MediaCache::resolve`](crate::caching::MediaCache::resolve) and to every caller that was
//! deduplicated onto the same fetch.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::caching::CacheKey;

mod http;

pub use self::http::HttpFetcher;

/// An error that happens when fetching media from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The media no longer exists server-side.
    #[error("not found")]
    NotFound,
    /// The session is invalid or lacks permission to read the media.
    ///
    /// The attached string contains the remote store's response.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The transfer did not finish in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The transfer failed, like connection loss, DNS resolution, or a 5xx server response.
    #[error("network error: {0}")]
    NetworkError(String),
    /// The media was invalidated while it was being fetched, so the result was discarded.
    #[error("invalidated while fetching")]
    Invalidated,
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    pub(crate) fn network_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::NetworkError(error_string)
    }

    /// A short, static tag for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Unauthorized(_) => "unauthorized",
            Self::Timeout(_) => "timeout",
            Self::NetworkError(_) => "network",
            Self::Invalidated => "invalidated",
            Self::InternalError => "internal",
        }
    }
}

/// Progress of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes received so far.
    pub loaded: u64,
    /// Total size as announced by the remote store, if known.
    pub total: Option<u64>,
}

/// Callback receiving [`DownloadProgress`] updates.
pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Transfers the bytes of one media item.
pub trait MediaFetcher: Send + Sync + 'static {
    /// Downloads the media identified by `key`.
    ///
    /// Fails with [`FetchError::NotFound`] if the media no longer exists,
    /// [`FetchError::Unauthorized`] if the session is invalid, and
    /// [`FetchError::NetworkError`] for transport failures.
    fn download<'a>(
        &'a self,
        key: &'a CacheKey,
        on_progress: Option<ProgressFn>,
    ) -> BoxFuture<'a, Result<Bytes, FetchError>>;
}

impl fmt::Debug for dyn MediaFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediaFetcher")
    }
}

//! Support to download media over HTTP.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, Url};

use crate::caching::CacheKey;
use crate::config::RemoteConfig;
use crate::utils::http::{DownloadTimeouts, create_client, header_map};

use super::{DownloadProgress, FetchError, MediaFetcher, ProgressFn};

/// Upper bound for pre-allocating the receive buffer from an announced `Content-Length`.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::network_error(&err)
    }
}

/// Fetcher implementation that downloads media from the remote store over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    pub fn new(
        client: Client,
        base_url: Url,
        headers: &BTreeMap<String, String>,
        timeouts: DownloadTimeouts,
    ) -> Self {
        Self {
            client,
            base_url,
            headers: header_map(headers),
            timeouts,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> reqwest::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Self::new(
            client,
            config.base_url.clone(),
            &config.headers,
            timeouts,
        ))
    }

    /// The download URL of the media identified by `key`.
    pub fn media_url(&self, key: &CacheKey) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InternalError)?
            .pop_if_empty()
            .extend([
                "studies",
                key.study_id(),
                "media",
                key.media_id(),
                "download",
            ]);
        Ok(url)
    }

    fn convert_err(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeouts.max_download)
        } else {
            err.into()
        }
    }

    async fn fetch(
        &self,
        key: &CacheKey,
        on_progress: Option<ProgressFn>,
    ) -> Result<Bytes, FetchError> {
        let url = self.media_url(key)?;
        tracing::debug!("Fetching media from `{}`", url);

        let mut response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| self.convert_err(e))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let details = response.text().await.unwrap_or_default();
                let details = match details.trim() {
                    "" => status.to_string(),
                    details => format!("{status}: {details}"),
                };
                return Err(FetchError::Unauthorized(details));
            }
            status if !status.is_success() => {
                return Err(FetchError::NetworkError(status.to_string()));
            }
            _ => {}
        }

        let total = response.content_length();
        let capacity = total.unwrap_or(0).min(MAX_PREALLOCATION) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);
        while let Some(chunk) = response.chunk().await.map_err(|e| self.convert_err(e))? {
            buffer.extend_from_slice(&chunk);
            if let Some(on_progress) = &on_progress {
                on_progress(DownloadProgress {
                    loaded: buffer.len() as u64,
                    total,
                });
            }
        }

        Ok(buffer.freeze())
    }
}

impl MediaFetcher for HttpFetcher {
    fn download<'a>(
        &'a self,
        key: &'a CacheKey,
        on_progress: Option<ProgressFn>,
    ) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        Box::pin(self.fetch(key, on_progress))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    use mediacache_test::{MediaServer, setup};

    fn fetcher(server: &MediaServer) -> HttpFetcher {
        HttpFetcher::new(
            Client::new(),
            server.url("/api/"),
            &BTreeMap::new(),
            Default::default(),
        )
    }

    #[test]
    fn test_media_url() {
        let fetcher = HttpFetcher::new(
            Client::new(),
            "https://pacs.example.com/api".parse().unwrap(),
            &BTreeMap::new(),
            Default::default(),
        );
        let key = CacheKey::new("1.2.840", "frame 1");
        assert_eq!(
            fetcher.media_url(&key).unwrap().as_str(),
            "https://pacs.example.com/api/studies/1.2.840/media/frame%201/download"
        );
    }

    #[tokio::test]
    async fn test_download_media() {
        setup();

        let server = MediaServer::new();
        server.add_media("s1", "m1", b"hello world\n".to_vec());

        let progress = Arc::new(Mutex::new(vec![]));
        let on_progress: ProgressFn = {
            let progress = Arc::clone(&progress);
            Arc::new(move |p: DownloadProgress| progress.lock().unwrap().push(p))
        };

        let fetcher = fetcher(&server);
        let bytes = fetcher
            .download(&CacheKey::new("s1", "m1"), Some(on_progress))
            .await
            .unwrap();

        assert_eq!(&bytes[..], b"hello world\n");
        let progress = progress.lock().unwrap();
        assert_eq!(
            progress.last(),
            Some(&DownloadProgress {
                loaded: 12,
                total: Some(12)
            })
        );
    }

    #[tokio::test]
    async fn test_download_media_missing() {
        setup();

        let server = MediaServer::new();
        let fetcher = fetcher(&server);
        let result = fetcher
            .download(&CacheKey::new("s1", "i-do-not-exist"), None)
            .await;

        assert_eq!(result, Err(FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_download_removed_media() {
        setup();

        let server = MediaServer::new();
        server.add_media("s1", "m1", b"pixels".to_vec());

        let fetcher = fetcher(&server);
        let key = CacheKey::new("s1", "m1");
        assert!(fetcher.download(&key, None).await.is_ok());

        server.remove_media("s1", "m1");
        assert_eq!(fetcher.download(&key, None).await, Err(FetchError::NotFound));
        assert_eq!(server.downloads(), 2);
    }

    #[tokio::test]
    async fn test_download_media_unauthorized() {
        setup();

        let server = MediaServer::new();
        server.require_token("secret");

        let fetcher = fetcher(&server);
        let result = fetcher.download(&CacheKey::new("s1", "m1"), None).await;
        assert!(matches!(result, Err(FetchError::Unauthorized(_))));

        server.add_media("s1", "m1", b"pixels".to_vec());
        let headers = BTreeMap::from([("Authorization".to_owned(), "Bearer secret".to_owned())]);
        let fetcher = HttpFetcher::new(
            Client::new(),
            server.url("/api/"),
            &headers,
            Default::default(),
        );
        let result = fetcher.download(&CacheKey::new("s1", "m1"), None).await;
        assert_eq!(result.unwrap(), Bytes::from_static(b"pixels"));
    }

    #[tokio::test]
    async fn test_download_server_error() {
        setup();

        let server = MediaServer::new();
        server.fail_with(StatusCode::BAD_GATEWAY);

        let fetcher = fetcher(&server);
        let result = fetcher.download(&CacheKey::new("s1", "m1"), None).await;
        assert_eq!(
            result,
            Err(FetchError::NetworkError("502 Bad Gateway".into()))
        );
    }
}

//! Helpers for testing the media cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`MediaServer`], make sure that the server is held until all requests to
//!    the server have been made. The server stops serving when dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// The size of the payload served by the ping endpoint.
pub const PING_BYTES: u64 = 2048;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `mediacache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("mediacache_service=trace,mediacache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct MediaState {
    media: Mutex<HashMap<(String, String), Vec<u8>>>,
    token: Mutex<Option<String>>,
    failure: Mutex<Option<StatusCode>>,
    downloads: AtomicUsize,
    pings: AtomicUsize,
}

impl MediaState {
    /// Returns the response to send instead of the requested resource, if any.
    fn reject(&self, headers: &HeaderMap) -> Option<Response> {
        if let Some(status) = *self.failure.lock().unwrap() {
            return Some(status.into_response());
        }

        let token = self.token.lock().unwrap();
        if let Some(token) = token.as_deref() {
            let expected = format!("Bearer {token}");
            let provided = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok());
            if provided != Some(expected.as_str()) {
                return Some((StatusCode::UNAUTHORIZED, "invalid token").into_response());
            }
        }

        None
    }
}

async fn download(
    State(state): State<Arc<MediaState>>,
    Path((study, media)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.reject(&headers) {
        return response;
    }

    let payload = state.media.lock().unwrap().get(&(study, media)).cloned();
    match payload {
        Some(payload) => payload.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ping(State(state): State<Arc<MediaState>>, headers: HeaderMap) -> Response {
    state.pings.fetch_add(1, Ordering::SeqCst);
    if let Some(response) = state.reject(&headers) {
        return response;
    }
    vec![b'.'; PING_BYTES as usize].into_response()
}

/// A media store serving in-memory payloads under `/api`.
///
/// Media is served from `/api/studies/{study}/media/{media}/download`, and `/api/ping` serves
/// [`PING_BYTES`] bytes for connection probes.
#[derive(Debug)]
pub struct MediaServer {
    server: Server,
    state: Arc<MediaState>,
}

impl MediaServer {
    pub fn new() -> Self {
        let state = Arc::new(MediaState::default());

        let router = Router::new()
            .route("/api/studies/:study/media/:media/download", get(download))
            .route("/api/ping", get(ping))
            .with_state(state.clone());

        let server = Server::with_router(router);
        Self { server, state }
    }

    /// Serves `payload` as the media `media` of study `study`.
    pub fn add_media(&self, study: &str, media: &str, payload: Vec<u8>) {
        self.state
            .media
            .lock()
            .unwrap()
            .insert((study.to_owned(), media.to_owned()), payload);
    }

    /// Stops serving the given media, as if it was deleted.
    pub fn remove_media(&self, study: &str, media: &str) {
        self.state
            .media
            .lock()
            .unwrap()
            .remove(&(study.to_owned(), media.to_owned()));
    }

    /// Requires every request to carry `Authorization: Bearer {token}`.
    pub fn require_token(&self, token: &str) {
        *self.state.token.lock().unwrap() = Some(token.to_owned());
    }

    /// Responds to every request with `status`.
    pub fn fail_with(&self, status: StatusCode) {
        *self.state.failure.lock().unwrap() = Some(status);
    }

    /// The number of media download requests received so far.
    pub fn downloads(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }

    /// The number of ping requests received so far.
    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for MediaServer {
    fn default() -> Self {
        Self::new()
    }
}

pub mod cache;
pub mod channels;
pub mod fetcher;
pub mod manager;
pub mod metrics;
pub mod mpegts;
pub mod ring;
pub mod vfs;
pub mod webdav;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::cache::FileCache;
use crate::channels::Catalogue;
use crate::manager::{Admission, Feed, SessionState, StreamManager};

pub struct AppState {
    catalogue: RwLock<Arc<Catalogue>>,
    pub(crate) manager: StreamManager,
    pub(crate) cache: FileCache,
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
}

impl AppState {
    pub fn new(
        catalogue: Catalogue,
        manager: StreamManager,
        cache: FileCache,
        client: reqwest::Client,
        base_url: String,
    ) -> Self {
        Self {
            catalogue: RwLock::new(Arc::new(catalogue)),
            manager,
            cache,
            client,
            base_url,
        }
    }

    pub(crate) async fn catalogue(&self) -> Arc<Catalogue> {
        Arc::clone(&*self.catalogue.read().await)
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    /// Swaps in a freshly loaded catalogue. Running sessions keep their old
    /// channel snapshots; new requests see the new set.
    pub async fn replace_catalogue(&self, catalogue: Catalogue) {
        let mut slot = self.catalogue.write().await;
        *slot = Arc::new(catalogue);
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/m3u/{name}", get(m3u_handler))
        .route("/stream/{id}", get(stream_handler))
        .route("/api/", post(api_handler))
        .route("/metrics", get(metrics_handler))
        .route("/dav", any(webdav::dav_root_handler))
        .route("/dav/", any(webdav::dav_root_handler))
        .route("/dav/{*path}", any(webdav::dav_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// Fetches the playlist sources, returning the raw texts. Plain paths are
/// read from disk, anything else goes through HTTP.
pub async fn fetch_playlist_sources(
    client: &reqwest::Client,
    urls: &[String],
) -> Vec<(String, anyhow::Result<String>)> {
    let mut out = Vec::with_capacity(urls.len());
    for url in urls {
        let text = if url.starts_with("http://") || url.starts_with("https://") {
            fetch_remote_playlist(client, url).await
        } else {
            tokio::fs::read_to_string(url)
                .await
                .map_err(anyhow::Error::from)
        };
        out.push((url.clone(), text));
    }
    out
}

async fn fetch_remote_playlist(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("playlist fetch returned {}", resp.status());
    }
    Ok(resp.text().await?)
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method, uri, user_agent
    );
    axum::response::Response::builder()
        .status(404)
        .body(Body::from("Not found"))
        .unwrap()
}

async fn m3u_handler(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !name.ends_with(".m3u") {
        return axum::response::Response::builder()
            .status(404)
            .body(Body::from("Not found"))
            .unwrap();
    }

    let catalogue = state.catalogue().await;
    let body = catalogue.build_m3u(&state.base_url);
    info!(
        "Serving playlist: name={} channels={}",
        name,
        catalogue.channels().len()
    );
    axum::response::Response::builder()
        .header("Content-Type", "audio/x-mpegurl")
        .header("Cache-Control", "no-cache")
        .body(Body::from(body))
        .unwrap()
}

async fn metrics_handler() -> impl IntoResponse {
    axum::response::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap()
}

#[derive(Deserialize)]
struct ApiCommand {
    cmd: String,
}

/// JSON command endpoint. The strict Content-Type check doubles as CSRF
/// mitigation: browsers can't send `application/json` cross-origin without
/// a preflight.
async fn api_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("application/json")
    {
        return axum::response::Response::builder()
            .status(415)
            .body(Body::from("Content-Type must be application/json"))
            .unwrap();
    }

    let command: ApiCommand = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            return axum::response::Response::builder()
                .status(400)
                .body(Body::from(format!("Invalid command: {e}")))
                .unwrap();
        }
    };

    match command.cmd.as_str() {
        "status" => {
            let catalogue = state.catalogue().await;
            let status = state
                .manager
                .status(|channel_id| catalogue.binding(channel_id))
                .await;
            let payload = serde_json::json!({
                "tuners": {
                    "active": status.tuners_active,
                    "available": status.tuners_available,
                },
                "streams": { "active": status.streams_active },
                "connections": { "active": status.connections_active },
            });
            axum::response::Response::builder()
                .header("Content-Type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap()
        }
        other => axum::response::Response::builder()
            .status(400)
            .body(Body::from(format!("Unknown command: {other}")))
            .unwrap(),
    }
}

/// Keeps the client guard alive for the lifetime of the response body and
/// logs per-client bandwidth every few seconds.
struct GuardedStream {
    _guard: manager::ClientGuard,
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
    channel_id: String,
    last_log_time: std::time::Instant,
    bytes_since_last_log: usize,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= std::time::Duration::from_secs(5) {
                let bytes = self.bytes_since_last_log;
                let secs = elapsed.as_secs_f64();
                let rate_kb = (bytes as f64 / secs) / 1024.0;
                info!(
                    "Stream bandwidth: channel_id={} rate={:.2} KB/s",
                    self.channel_id, rate_kb
                );
                self.last_log_time = std::time::Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

async fn stream_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");

    let catalogue = state.catalogue().await;
    let Some(channel) = catalogue.get(&id) else {
        info!("HTTP stream request for unknown channel: id={}", id);
        return axum::response::Response::builder()
            .status(404)
            .body(Body::from("Channel not found"))
            .unwrap();
    };

    info!(
        "HTTP stream request: id={} name=\"{}\" url={} UA=\"{}\"",
        id, channel.name, channel.url, user_agent
    );

    let binding = catalogue.binding(&id);
    let handle = match state.manager.admit(channel, &binding).await {
        Admission::Granted(handle) => handle,
        Admission::NoFreeTuner => {
            return axum::response::Response::builder()
                .status(503)
                .header("Cache-Control", "no-store")
                .body(Body::from("No free tuner"))
                .unwrap();
        }
    };

    // Hold the response until the session either produces its first packet
    // or dies trying; failures before the first byte surface as 502.
    let mut state_rx = handle.state_rx.clone();
    let session_state = match state_rx.wait_for(|s| *s != SessionState::Starting).await {
        Ok(s) => *s,
        Err(_) => SessionState::Closed,
    };
    if session_state == SessionState::Closed {
        warn!("Upstream failed before first byte: id={}", id);
        return axum::response::Response::builder()
            .status(502)
            .header("Cache-Control", "no-store")
            .body(Body::from("Upstream failed"))
            .unwrap();
    }

    let handle = *handle;
    let inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>> = match handle.feed {
        Feed::Ring { ring, cursor } => {
            // One ring packet per body frame keeps the write path flushing
            // at packet granularity.
            Box::pin(futures::stream::unfold(
                (ring, cursor),
                |(ring, mut cursor)| async move {
                    match ring.read(&mut cursor).await {
                        ring::RingRead::Packet(packet) => {
                            Some((Ok::<_, io::Error>(packet), (ring, cursor)))
                        }
                        ring::RingRead::Closed => None,
                    }
                },
            ))
        }
        Feed::Direct(rx) => Box::pin(ReceiverStream::new(rx).map(Ok::<_, io::Error>)),
    };

    let guarded = GuardedStream {
        _guard: handle.guard,
        inner,
        channel_id: handle.channel_id,
        last_log_time: std::time::Instant::now(),
        bytes_since_last_log: 0,
    };

    axum::response::Response::builder()
        .header("Content-Type", "video/mpeg")
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded))
        .unwrap()
}

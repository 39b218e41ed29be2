use std::time::Duration;

use bytes::Bytes;
use reqwest::{header, redirect, Client, Response, StatusCode};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics::UPSTREAM_RETRIES;

/// Upstream providers love redirect chains; anything deeper than this is
/// treated as broken.
pub const REDIRECT_CAP: usize = 10;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How an upstream fetch ended, minus the clean-EOF case (which is `Ok`).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(StatusCode),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transport failures and bad statuses are worth another attempt;
    /// cancellation never is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Status(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Shared upstream HTTP client. Invalid certificates are tolerated because
/// IPTV origins routinely sit behind self-signed front-ends.
pub fn build_client(user_agent: &str, connect_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .redirect(redirect::Policy::limited(REDIRECT_CAP))
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(true)
        .build()
}

async fn attempt(
    client: &Client,
    url: &str,
    user_agent: Option<&str>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Response, FetchError> {
    let mut request = client.get(url);
    if let Some(ua) = user_agent {
        request = request.header(header::USER_AGENT, ua);
    }

    let response = tokio::select! {
        _ = stop_rx.wait_for(|stop| *stop) => return Err(FetchError::Cancelled),
        resp = request.send() => resp?,
    };

    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }
    Ok(response)
}

/// Opens the upstream stream, applying the retry policy to transport errors
/// and non-2xx statuses. The stop signal is honoured between and during
/// attempts.
pub async fn open_stream(
    client: &Client,
    channel_id: &str,
    url: &str,
    user_agent: Option<&str>,
    retry: &RetryPolicy,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Response, FetchError> {
    let max_attempts = if retry.enabled {
        retry.max_retries.saturating_add(1)
    } else {
        1
    };

    let mut attempt_no = 0u32;
    loop {
        attempt_no += 1;
        match attempt(client, url, user_agent, stop_rx).await {
            Ok(response) => {
                debug!(
                    "Upstream connected: channel={} url={} attempt={}",
                    channel_id, url, attempt_no
                );
                return Ok(response);
            }
            Err(err) if err.is_retryable() && attempt_no < max_attempts => {
                warn!(
                    "Upstream attempt failed, retrying: channel={} attempt={}/{} err={}",
                    channel_id, attempt_no, max_attempts, err
                );
                UPSTREAM_RETRIES.with_label_values(&[channel_id]).inc();
                tokio::select! {
                    _ = stop_rx.wait_for(|stop| *stop) => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(retry.delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Reads the next body chunk, racing against the session's stop signal so
/// the upstream socket is released promptly on teardown. `Ok(None)` is a
/// clean upstream EOF.
pub async fn next_chunk(
    response: &mut Response,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Option<Bytes>, FetchError> {
    tokio::select! {
        _ = stop_rx.wait_for(|stop| *stop) => Err(FetchError::Cancelled),
        chunk = response.chunk() => Ok(chunk?),
    }
}

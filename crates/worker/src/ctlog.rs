//! CT v1 `get-entries` client.
//!
//! One pooled HTTP/2 client per configured proxy, rotated per request.
//! Transient failures (429, 5xx, timeouts, undecodable bodies) retry
//! with full-jitter exponential backoff; any other 4xx is permanent
//! and fails the range.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng as _;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;
const MAX_IDLE_PER_HOST: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum CtFetchError {
    #[error("ct log returned http {0} for {1}")]
    Permanent(StatusCode, String),
    #[error("retry budget exhausted ({0})")]
    Exhausted(String),
    #[error("invalid get-entries url: {0}")]
    Url(String),
}

/// One undecoded entry as returned by the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntry {
    pub leaf_input: String,
    #[serde(default)]
    pub extra_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<RawEntry>,
}

pub struct CtLogClient {
    clients: Vec<reqwest::Client>,
    next: AtomicUsize,
    retry_cap: u32,
}

impl CtLogClient {
    pub fn new(proxies: &[String], timeout: Duration, retry_cap: u32) -> anyhow::Result<Self> {
        let mut clients = Vec::new();
        if proxies.is_empty() {
            clients.push(build_client(None, timeout)?);
        } else {
            for proxy in proxies {
                clients.push(build_client(Some(proxy), timeout)?);
            }
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            retry_cap,
        })
    }

    fn client(&self) -> &reqwest::Client {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    /// Fetch `[start, end]` (inclusive, per the CT v1 API). The log
    /// may return fewer entries than requested.
    pub async fn get_entries(
        &self,
        log_url: &Url,
        start: u64,
        end: u64,
    ) -> Result<Vec<RawEntry>, CtFetchError> {
        let url = log_url
            .join("ct/v1/get-entries")
            .map_err(|err| CtFetchError::Url(err.to_string()))?;

        let mut attempt = 0u32;
        loop {
            let res = self
                .client()
                .get(url.clone())
                .query(&[("start", start), ("end", end)])
                .send()
                .await;

            let last_err = match res {
                Ok(res) if res.status().is_success() => match res.json::<GetEntriesResponse>().await
                {
                    Ok(body) => return Ok(body.entries),
                    Err(err) => format!("decode get-entries body: {err}"),
                },
                Ok(res)
                    if res.status() == StatusCode::TOO_MANY_REQUESTS
                        || res.status().is_server_error() =>
                {
                    format!("http {}", res.status())
                }
                Ok(res) => return Err(CtFetchError::Permanent(res.status(), url.to_string())),
                Err(err) => format!("{err}"),
            };

            attempt += 1;
            if attempt > self.retry_cap {
                return Err(CtFetchError::Exhausted(last_err));
            }
            let delay = backoff_with_jitter(attempt);
            debug!(
                %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient fetch failure, retrying: {last_err}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn build_client(proxy: Option<&str>, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Full jitter: uniform over `[0, min(cap, base * 2^(attempt-1))]`.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ceil_ms = BACKOFF_CAP_MS.min(BACKOFF_BASE_MS.saturating_mul(1u64 << exp));
    Duration::from_millis(rand::rng().random_range(0..=ceil_ms))
}

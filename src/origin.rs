// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream origin: HTTP transport, bounded retries and the shared breaker.
//!
//! One [`Origin`] is built per process and handed to every source fetcher as an
//! `Arc<Origin>`, so all fetches share the same connection pool and the same
//! circuit.
//!
//! ```text
//! SourceFetcher ──▶ Origin::fetch
//!                     └─ CircuitBreaker::execute
//!                          └─ RetryingClient::fetch
//!                               └─ HttpTransport::send (reqwest)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::RetryingClient;

const USER_AGENT: &str = concat!("catalog-sync/", env!("CARGO_PKG_VERSION"));

/// A complete origin response, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub url: String,
    pub status: u16,
    /// Header names are stored lower-case.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl OriginResponse {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
}

impl FetchOptions {
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// One HTTP attempt, no retries.
///
/// Any status is an `Ok`; only a failure to get a response at all is an `Err`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, url: &str, options: &FetchOptions) -> Result<OriginResponse, SyncError>;
}

/// Production transport on a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with a hard per-attempt timeout and a capped idle pool.
    pub fn new(timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Client(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, url: &str, options: &FetchOptions) -> Result<OriginResponse, SyncError> {
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            warn!(
                url,
                error = %e,
                is_connect = e.is_connect(),
                is_timeout = e.is_timeout(),
                "HTTP request failed"
            );
            SyncError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| SyncError::Transport {
            url: url.to_string(),
            message: format!("reading body: {}", e),
        })?;

        debug!(url, status, bytes = body.len(), "HTTP response received");
        Ok(OriginResponse {
            url: url.to_string(),
            status,
            headers,
            body,
        })
    }
}

/// Transport that replays a fixed script of outcomes, for tests and demos.
///
/// Each call consumes the next entry; once only one entry is left it is
/// replayed forever. `Err(message)` entries become [`SyncError::Transport`].
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<OriginResponse, String>>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<OriginResponse, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails at the connection level.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![Err(message.into())])
    }

    /// Number of `send` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs requested so far, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, url: &str, _options: &FetchOptions) -> Result<OriginResponse, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(url.to_string());

        let next = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        match next {
            Some(Ok(mut response)) => {
                response.url = url.to_string();
                Ok(response)
            }
            Some(Err(message)) => Err(SyncError::Transport {
                url: url.to_string(),
                message,
            }),
            None => Err(SyncError::Transport {
                url: url.to_string(),
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// The shared origin client: bounded retries behind one circuit breaker.
pub struct Origin {
    client: RetryingClient,
    breaker: Arc<CircuitBreaker>,
}

impl Origin {
    pub fn new(client: RetryingClient, breaker: Arc<CircuitBreaker>) -> Self {
        Self { client, breaker }
    }

    /// Fetch `url` through the breaker. The whole retry sequence counts as one
    /// breaker call.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<OriginResponse, SyncError> {
        self.breaker
            .execute(|| self.client.fetch(url, options))
            .await
            .map_err(SyncError::from)
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Clear breaker state between tests.
    pub fn reset(&self) {
        self.breaker.reset();
    }
}

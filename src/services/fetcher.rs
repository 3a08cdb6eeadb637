// src/services/fetcher.rs

//! Source fetcher.
//!
//! Retrieves a source's document through a [`FetchTarget`], retrying
//! transient failures with backoff, rate-limiting requests per domain, and
//! turning the payload into normalized text with the source's parser.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{FetchError, Result};
use crate::models::{FetcherConfig, RawContent, RegulatorySource};
use crate::services::parser::ParserRegistry;
use crate::utils::http::create_async_client;
use crate::utils::rate_limit_key;
use crate::utils::retry::{RetryError, RetryPolicy};
use crate::utils::text;

/// Retrieves the raw payload behind a target reference.
#[async_trait]
pub trait FetchTarget: Send + Sync {
    async fn retrieve(&self, target: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// Told about every transient failure that will be retried.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, attempt: u32, error: FetchError, delay: Duration);
}

/// Observer that ignores retries.
pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn on_retry(&self, _attempt: u32, _error: FetchError, _delay: Duration) {}
}

/// HTTP(S) fetch target.
pub struct HttpTarget {
    client: Client,
    timeout: Duration,
}

impl HttpTarget {
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            timeout: config.attempt_timeout(),
        })
    }

    fn map_transport_error(&self, error: reqwest::Error) -> FetchError {
        if error.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if error.is_builder() {
            FetchError::MalformedTarget(error.to_string())
        } else if let Some(status) = error.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Connection(error.to_string())
        }
    }
}

#[async_trait]
impl FetchTarget for HttpTarget {
    async fn retrieve(&self, target: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let url = Url::parse(target.trim())
            .map_err(|_| FetchError::MalformedTarget(target.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::MalformedTarget(target.to_string()));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        Ok(bytes.to_vec())
    }
}

/// Fetches sources with retry, timeout and per-domain rate limiting.
pub struct Fetcher {
    target: std::sync::Arc<dyn FetchTarget>,
    parsers: ParserRegistry,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl Fetcher {
    pub fn new(
        config: &FetcherConfig,
        target: std::sync::Arc<dyn FetchTarget>,
        parsers: ParserRegistry,
    ) -> Self {
        let limiter = Quota::with_period(Duration::from_millis(config.min_request_interval_ms))
            .map(RateLimiter::keyed);
        Self {
            target,
            parsers,
            policy: RetryPolicy::for_fetcher(config),
            attempt_timeout: config.attempt_timeout(),
            limiter,
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Fetch and normalize a source's content.
    ///
    /// Cancellation is honored between attempts, during backoff and while an
    /// attempt is waiting on the network.
    pub async fn fetch(
        &self,
        source: &RegulatorySource,
        cancel: &CancellationToken,
        observer: &dyn RetryObserver,
    ) -> std::result::Result<RawContent, FetchError> {
        if source.target.trim().is_empty() {
            return Err(FetchError::MalformedTarget(source.target.clone()));
        }
        let parser = self
            .parsers
            .get(&source.parser)
            .ok_or_else(|| FetchError::Parse(format!("unknown parser '{}'", source.parser)))?;
        let key = rate_limit_key(&source.target);

        let outcome = self
            .policy
            .run(
                cancel,
                FetchError::is_transient,
                |attempt, error: &FetchError, delay| {
                    log::warn!(
                        "Fetch of '{}' failed on attempt {}: {}. Retrying in {:?}",
                        source.id,
                        attempt,
                        error,
                        delay
                    );
                    observer.on_retry(attempt, error.clone(), delay)
                },
                |attempt| {
                    let key = &key;
                    async move {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(FetchError::Cancelled),
                            result = self.attempt(&source.target, key) => {
                                result.map(|raw| (raw, attempt))
                            }
                        }
                    }
                },
            )
            .await;
        self.forget_idle_domains();

        let (raw, attempts) = match outcome {
            Ok(value) => value,
            Err(RetryError::Exhausted { error, attempts }) => {
                log::error!(
                    "Fetch of '{}' gave up after {} attempts: {}",
                    source.id,
                    attempts,
                    error
                );
                return Err(error);
            }
            Err(RetryError::Permanent { error, .. }) => return Err(error),
            Err(RetryError::Cancelled { .. }) => return Err(FetchError::Cancelled),
        };

        let parsed = parser.parse(&raw)?;
        Ok(RawContent {
            raw,
            text: text::normalize(&parsed),
            fetched_at: Utc::now(),
            attempts,
        })
    }

    /// Drop limiter state for domains whose quota has fully replenished.
    fn forget_idle_domains(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    async fn attempt(&self, target: &str, key: &String) -> std::result::Result<Vec<u8>, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_key_ready(key).await;
        }
        match tokio::time::timeout(self.attempt_timeout, self.target.retrieve(target)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.attempt_timeout)),
        }
    }
}

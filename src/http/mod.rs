// HTTP plumbing shared by the embedding and completion clients
// Blocking JSON POST with classified failures and exponential backoff


use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use crate::{RagError, Result};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Attempt ceiling and backoff base for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt` (1-based)
    #[inline]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Authenticated JSON endpoint client
#[derive(Debug, Clone)]
pub struct JsonService {
    agent: ureq::Agent,
    api_key: Option<String>,
    retry: RetryPolicy,
}

/// Outcome of a single attempt, before retry bookkeeping
enum Attempt {
    Retry(RagError),
    Fail(RagError),
}

impl JsonService {
    #[inline]
    pub fn new(timeout: Duration, api_key: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            agent: build_agent(timeout),
            api_key,
            retry,
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// POST `body` to `url`, retrying 429/5xx/transport failures with exponential backoff
    ///
    /// 401/403 map to [`RagError::Auth`], 404 to [`RagError::NotFound`] and other 4xx to
    /// [`RagError::InvalidRequest`]; none of those are retried. Exhausting the attempt
    /// ceiling yields [`RagError::TransientService`].
    #[inline]
    pub fn post_json(&self, url: &Url, body: &str) -> Result<String> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!("HTTP request attempt {}/{} to {}", attempt, attempts, url);

            match self.send_once(url, body) {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response_text);
                }
                Err(Attempt::Fail(error)) => {
                    warn!("Non-retryable error from {}: {}", url, error);
                    return Err(error);
                }
                Err(Attempt::Retry(error)) => {
                    warn!("{}, attempt {}/{}", error, attempt, attempts);
                    last_error = Some(error);

                    if attempt < attempts {
                        let delay = self.retry.delay_after(attempt);
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All {} attempts failed for request to {}", attempts, url);
        Err(last_error.unwrap_or_else(|| RagError::TransientService {
            status: None,
            message: "request failed after retries".to_string(),
        }))
    }

    fn send_once(&self, url: &Url, body: &str) -> std::result::Result<String, Attempt> {
        let mut request = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        request
            .send(body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(classify_error)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

fn classify_error(error: ureq::Error) -> Attempt {
    match error {
        ureq::Error::StatusCode(status) => classify_status(status),
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => Attempt::Retry(RagError::TransientService {
            status: None,
            message: format!("transport error: {}", error),
        }),
        other => Attempt::Fail(RagError::InvalidRequest(other.to_string())),
    }
}

fn classify_status(status: u16) -> Attempt {
    match status {
        401 | 403 => Attempt::Fail(RagError::Auth(format!(
            "HTTP {status}, check the configured API key"
        ))),
        404 => Attempt::Fail(RagError::NotFound(
            "HTTP 404, check the configured base URL".to_string(),
        )),
        429 => Attempt::Retry(RagError::TransientService {
            status: Some(status),
            message: "rate limited".to_string(),
        }),
        500.. => Attempt::Retry(RagError::TransientService {
            status: Some(status),
            message: "server error".to_string(),
        }),
        _ => Attempt::Fail(RagError::InvalidRequest(format!(
            "HTTP {status}, request rejected"
        ))),
    }
}

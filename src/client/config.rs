//! Client configuration.
//!
//! Everything here is non-secret and `serde`-friendly, so hosts can load it
//! from their own JSON or TOML settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::response::ResponseFormat;

/// Path appended to the base URL when no other is configured.
pub const DEFAULT_ENDPOINT_PATH: &str = "/openai/v1/chat/completions";

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay before the first retry. Doubles on every further retry.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// Upper bound for a single backoff delay.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Settings fixed for the lifetime of a [`SecureClient`](super::SecureClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Appended verbatim to the base URL to form the request URL.
    pub endpoint_path: String,
    /// Used by calls that do not pass their own options.
    pub options: CompletionOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            options: CompletionOptions::default(),
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionOptions {
    /// Per-attempt limit, serialized as milliseconds. `None` waits forever.
    #[serde(with = "duration_millis")]
    pub timeout: Option<Duration>,
    /// Extra attempts after a retryable failure.
    pub retries: u32,
    /// Delay before the first retry, in milliseconds. `None` retries at once.
    #[serde(with = "duration_millis")]
    pub retry_backoff: Option<Duration>,
    pub response_format: ResponseFormat,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            retries: 0,
            retry_backoff: Some(DEFAULT_RETRY_BACKOFF),
            response_format: ResponseFormat::Raw,
        }
    }
}

impl CompletionOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Option<Duration>) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Delay to wait after the `attempt`-th failed attempt (1-based).
    ///
    /// # Arguments
    ///
    /// * `attempt` - Number of the attempt that just failed.
    ///
    /// # Returns
    ///
    /// * `retry_backoff` doubled once per earlier retry, capped at ten
    ///   seconds, or `None` when backoff is disabled.
    pub fn backoff_for(&self, attempt: u32) -> Option<Duration> {
        let base = self.retry_backoff.filter(|d| !d.is_zero())?;
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        Some(base.saturating_mul(factor).min(MAX_RETRY_BACKOFF))
    }

    pub fn with_response_format(mut self, response_format: ResponseFormat) -> Self {
        self.response_format = response_format;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
                serializer.serialize_some(&millis)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

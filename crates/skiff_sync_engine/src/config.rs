//! Configuration for the sync engine.

use serde_json::{Map, Value};
use std::time::Duration;

/// Options for [`crate::SyncDatabase::connect`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Reconnect delays after a failed or closed stream.
    pub retry: RetryConfig,
    /// Delay before retrying a failed upload.
    pub upload_retry_delay: Duration,
    /// Quiet period after a local write before uploading starts.
    pub crud_upload_throttle: Duration,
    /// How long to wait for the cross-process sync lock per attempt.
    pub lock_timeout: Duration,
    /// A stream with no line for this long is considered dead.
    pub stream_idle_timeout: Duration,
    /// Credentials are refreshed this long before they expire.
    pub credentials_refresh_margin: Duration,
    /// Client parameters sent with every sync request.
    pub params: Map<String, Value>,
    /// Whether the service should also sync default streams.
    pub include_default_streams: bool,
}

impl SyncOptions {
    /// Creates options with default values.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            upload_retry_delay: Duration::from_secs(5),
            crud_upload_throttle: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
            credentials_refresh_margin: Duration::from_secs(30),
            params: Map::new(),
            include_default_streams: true,
        }
    }

    /// Sets a fixed delay between reconnect attempts.
    pub fn with_connection_retry_delay(mut self, delay: Duration) -> Self {
        self.retry = RetryConfig::fixed(delay);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the upload retry delay.
    pub fn with_upload_retry_delay(mut self, delay: Duration) -> Self {
        self.upload_retry_delay = delay;
        self
    }

    /// Sets the upload throttle.
    pub fn with_crud_upload_throttle(mut self, throttle: Duration) -> Self {
        self.crud_upload_throttle = throttle;
        self
    }

    /// Sets the cross-process lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the stream idle timeout.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Sets the credentials refresh margin.
    pub fn with_credentials_refresh_margin(mut self, margin: Duration) -> Self {
        self.credentials_refresh_margin = margin;
        self
    }

    /// Sets a client parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets whether default streams are synced.
    pub fn with_default_streams(mut self, include: bool) -> Self {
        self.include_default_streams = include;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Delays between reconnect attempts.
///
/// The default is a fixed five second delay. A multiplier above 1.0 turns
/// it into exponential backoff capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a fixed-delay configuration.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates an exponential backoff configuration.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets whether jitter is added.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    ///
    /// Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

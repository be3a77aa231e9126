use std::{future::Future, time::Duration};

use reqwest::header::HeaderMap;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Header used by FoD to announce when the current rate-limit window resets.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";

/// Delay schedule between throttled attempts. `attempt` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay every time.
    Fixed(Duration),
    /// `base * attempt`.
    Linear(Duration),
    /// `base * 2^(attempt - 1)`, doubling at most 16 times.
    Exponential(Duration),
}

impl Backoff {
    /// Delay after the throttled `attempt`. Attempt 0 counts as 1.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let backoff = Backoff::Exponential(Duration::from_millis(100));
    /// assert_eq!(backoff.delay(3), Duration::from_millis(400));
    /// ```
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(d) => d.saturating_mul(attempt),
            Backoff::Exponential(d) => d.saturating_mul(1u32 << (attempt - 1).min(16)),
        }
    }
}

/// Retries requests the server throttled.
///
/// The policy holds configuration only. Every [`execute`](Self::execute) call
/// keeps its own attempt counter, so one policy is shared by all tasks of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    max_delay: Duration,
    honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential(DEFAULT_BASE_DELAY),
            max_delay: DEFAULT_MAX_DELAY,
            honor_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default cap and server hints honored.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - total attempts per call, the first one included.
    ///   Zero is raised to one.
    /// * `backoff` - schedule used when the server gives no usable hint.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            ..Self::default()
        }
    }

    /// Upper bound for any single wait, hint or schedule.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// When disabled, server hints are ignored and only the backoff applies.
    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// A server hint wins when it does not exceed the configured maximum;
    /// otherwise the backoff schedule applies, capped at the maximum.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) if self.honor_retry_after && hint <= self.max_delay => hint,
            _ => self.backoff.delay(attempt).min(self.max_delay),
        }
    }

    /// Runs `request` until it stops being rate limited.
    ///
    /// `request` receives the 1-based attempt number and must build a fresh
    /// request each time.
    ///
    /// # Errors
    ///
    /// Any error other than [`Error::RateLimited`] is returned as is, without
    /// retrying. After `max_attempts` throttled attempts the result is
    /// [`Error::RateLimitExceeded`].
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(10)));
    /// let body = policy
    ///     .execute(|attempt| async move {
    ///         debug!(attempt, "fetching");
    ///         conn.send("releases", &[]).await?.text().await.map_err(Error::from)
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<T, F, Fut>(&self, mut request: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match request(attempt).await {
                Err(Error::RateLimited { retry_after }) => {
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, "giving up, still rate limited");
                        return Err(Error::RateLimitExceeded { attempts: attempt });
                    }

                    let delay = self.delay_for(attempt, retry_after);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Reads the server's back-off hint from `Retry-After` or
/// `X-Rate-Limit-Reset`, both in seconds.
///
/// `Retry-After` wins when both are present. HTTP dates are not understood and
/// yield `None`.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    [reqwest::header::RETRY_AFTER.as_str(), RATE_LIMIT_RESET_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

//! Progressive-timeout retry loop for one logical chat-completion call.
//!
//! Each attempt runs under its own timeout, shrinking with the attempt number.
//! Failures are categorized; retryable ones back off exponentially with
//! jitter. After a timeout on any attempt past the first, an optional fallback
//! generator is invoked once and its payload replaces the original for every
//! remaining attempt.

use super::errors::{categorize_error, sanitize_error_message, ApiError, ErrorCategory};
use prbot_adapters::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

/// Per-attempt share of the base timeout. The last entry repeats.
pub const TIMEOUT_MULTIPLIERS: [f64; 4] = [1.0, 0.67, 0.5, 0.33];

/// No attempt gets less than this.
pub const MIN_ATTEMPT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_timeout_ms: settings.base_timeout_ms,
            base_delay_ms: settings.base_delay_ms,
            max_jitter_ms: settings.max_jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// Timeout of attempt `attempt` (0-based).
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(TIMEOUT_MULTIPLIERS.len() - 1);
        let ms = (self.base_timeout_ms as f64 * TIMEOUT_MULTIPLIERS[idx]).floor() as u64;
        Duration::from_millis(ms.max(MIN_ATTEMPT_TIMEOUT_MS))
    }

    /// Backoff before the attempt following `attempt`, excluding jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        self.base_backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// Result of a logical call, however many attempts it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub used_fallback: bool,
    pub error: Option<ApiError>,
}

/// Replacement payload used after a timeout, plus an optional observer told
/// which attempt triggered the switch.
pub struct Fallback<'a, P> {
    generate: Box<dyn FnOnce() -> P + Send + 'a>,
    observer: Option<Box<dyn FnMut(u32) + Send + 'a>>,
}

impl<'a, P> Fallback<'a, P> {
    pub fn new(generate: impl FnOnce() -> P + Send + 'a) -> Self {
        Self {
            generate: Box::new(generate),
            observer: None,
        }
    }

    pub fn on_escalate(mut self, observer: impl FnMut(u32) + Send + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }
}

/// Drive `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget runs out. `call` receives the current payload and the attempt
/// number.
pub async fn run_with_retry<'a, P, T, F, Fut>(
    policy: &RetryPolicy,
    payload: P,
    mut fallback: Option<Fallback<'a, P>>,
    mut call: F,
) -> RetryOutcome<T>
where
    P: Clone,
    F: FnMut(P, u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let mut current = payload;
    let mut used_fallback = false;
    let mut attempt: u32 = 0;

    loop {
        let timeout = policy.attempt_timeout(attempt);
        let result = match tokio::time::timeout(timeout, call(current.clone(), attempt)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "attempt {} timed out after {} ms",
                attempt + 1,
                timeout.as_millis()
            )),
        };

        let err = match result {
            Ok(data) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, used_fallback, "call succeeded after retry");
                }
                return RetryOutcome {
                    success: true,
                    data: Some(data),
                    used_fallback,
                    error: None,
                };
            }
            Err(err) => err,
        };

        let raw = format!("{:#}", err);
        let category = categorize_error(&raw);
        let message = sanitize_error_message(&raw);
        tracing::warn!(
            attempt = attempt + 1,
            category = category.as_str(),
            error = %message,
            "chat completion attempt failed"
        );

        if category == ErrorCategory::Timeout && attempt >= 1 && !used_fallback {
            if let Some(Fallback { generate, observer }) = fallback.take() {
                current = generate();
                used_fallback = true;
                tracing::info!(attempt = attempt + 1, "switching to fallback prompt");
                if let Some(mut observer) = observer {
                    observer(attempt);
                }
            }
        }

        if !category.is_retryable() || attempt >= policy.max_retries {
            return RetryOutcome {
                success: false,
                data: None,
                used_fallback,
                error: Some(ApiError {
                    category,
                    message,
                    retryable: category.is_retryable(),
                    attempts: attempt + 1,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                }),
            };
        }

        let delay = policy.backoff_with_jitter(attempt);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

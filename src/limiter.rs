//! Per-provider rate limiting with retry and capped exponential backoff.
//!
//! Each provider gets an independent lane. A lane is serial: concurrent
//! `run_step` callers on the same provider queue FIFO behind a mutex, and the
//! pacing gap (`min_delay`) is enforced between consecutive sends. Only
//! `Transient` failures are retried; backoff for the n-th failed attempt is
//! `min(backoff_base * 2^n, backoff_cap)` plus up to 250 ms of jitter.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::ProviderError;
use crate::provider::ProviderKind;

/// Successful step result plus how many attempts it took.
#[derive(Debug)]
pub struct StepOutput<T> {
    pub value: T,
    pub attempts: u32,
}

/// Pacing state for one provider. `last_sent_at` lives inside the gate so it
/// is only ever touched by the caller currently holding the lane.
struct Lane {
    gate: Mutex<Option<Instant>>,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    lanes: DashMap<ProviderKind, Arc<Lane>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            lanes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    fn lane(&self, provider: ProviderKind) -> Arc<Lane> {
        self.lanes
            .entry(provider)
            .or_insert_with(|| {
                Arc::new(Lane {
                    gate: Mutex::new(None),
                })
            })
            .clone()
    }

    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exp = self
            .cfg
            .backoff_base
            .saturating_mul(2u32.saturating_pow(failed_attempt));
        let capped = exp.min(self.cfg.backoff_cap);
        let jitter_ms = rand::rng().random_range(0..=250);
        capped + Duration::from_millis(jitter_ms)
    }

    /// Execute `step` under the provider's lane: wait for the pacing permit,
    /// run, and retry transient failures within the configured budget.
    ///
    /// The lane is held for the whole call, including backoff sleeps, so one
    /// caller's retries never interleave with another caller on the same
    /// provider. Cancellation is honored at every suspension point.
    pub async fn run_step<T, F, Fut>(
        &self,
        provider: ProviderKind,
        label: &str,
        cancel: &CancellationToken,
        mut step: F,
    ) -> Result<StepOutput<T>, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let lane = self.lane(provider);
        let mut last_sent = tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            guard = lane.gate.lock() => guard,
        };

        let max_retries = self.cfg.max_retries;
        let mut attempt_log: Vec<String> = Vec::new();

        for attempt in 0..=max_retries {
            // Pacing permit: sleep until min_delay has passed since the last send.
            if let Some(last) = *last_sent {
                let ready_at = last + self.cfg.min_delay;
                tokio::select! {
                    () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    () = sleep_until(ready_at) => {}
                }
            }
            *last_sent = Some(Instant::now());

            let result = tokio::select! {
                () = cancel.cancelled() => Err(ProviderError::Cancelled),
                r = step() => r,
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(provider = %provider, label, attempts = attempt + 1,
                            "step succeeded after retry");
                    }
                    return Ok(StepOutput {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(provider = %provider, label,
                        attempt = attempt + 1, max = max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient step failure, backing off: {e}");
                    attempt_log.push(format!("attempt {}/{}: {e}", attempt + 1, max_retries + 1));
                    tokio::select! {
                        () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        () = sleep(delay) => {}
                    }
                }
                Err(e) => {
                    // Non-retryable, or the retry budget is spent.
                    if e.is_retryable() {
                        tracing::warn!(provider = %provider, label,
                            attempts = max_retries + 1, "retry budget exhausted: {e}");
                    }
                    return Err(annotate(e, &attempt_log));
                }
            }
        }

        unreachable!("run_step loop always returns within the attempt budget")
    }
}

/// Fold prior retry attempts into the propagated error's message.
fn annotate(err: ProviderError, attempt_log: &[String]) -> ProviderError {
    if attempt_log.is_empty() {
        return err;
    }
    let history = attempt_log.join("; ");
    match err {
        ProviderError::Transient(msg) => {
            ProviderError::Transient(format!("{msg} (after {history})"))
        }
        ProviderError::Fatal(msg) => ProviderError::Fatal(format!("{msg} (after {history})")),
        ProviderError::NotImplemented(msg) => {
            ProviderError::NotImplemented(format!("{msg} (after {history})"))
        }
        other => other,
    }
}

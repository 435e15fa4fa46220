//! Token-bucket quota limiter for rate-limited capabilities.
//!
//! An empty bucket is waited on with exponential backoff, bounded by a total
//! wait budget. Running out of budget is reported as
//! [`CurriculaError::QuotaExhausted`] so the router can downgrade the tier
//! instead of retrying forever.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use curricula_shared::{CurriculaError, Result};

/// Result of a non-blocking acquire.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: u32,
    /// Tokens per second.
    refill_rate: f64,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            tokens: f64::from(max_tokens),
            last_refill: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(f64::from(self.max_tokens));
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// One capability's quota.
#[derive(Debug)]
pub struct QuotaLimiter {
    name: &'static str,
    bucket: Mutex<TokenBucket>,
    backoff_initial: Duration,
    max_wait: Duration,
}

impl QuotaLimiter {
    pub fn new(
        name: &'static str,
        rate_per_sec: f64,
        burst: u32,
        backoff_initial: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            name,
            bucket: Mutex::new(TokenBucket::new(burst, rate_per_sec)),
            backoff_initial,
            max_wait,
        }
    }

    pub fn try_acquire(&self) -> QuotaResult {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        if bucket.try_consume() {
            QuotaResult::Allowed {
                remaining: bucket.tokens as u32,
            }
        } else {
            QuotaResult::Limited {
                retry_after: bucket.time_until_available(),
            }
        }
    }

    /// Wait for a token, backing off exponentially, for at most the wait budget.
    pub async fn acquire(&self) -> Result<()> {
        let mut waited = Duration::ZERO;
        let mut backoff = self.backoff_initial;
        loop {
            match self.try_acquire() {
                QuotaResult::Allowed { .. } => return Ok(()),
                QuotaResult::Limited { retry_after } => {
                    if waited >= self.max_wait {
                        tracing::warn!(
                            capability = self.name,
                            waited_ms = waited.as_millis() as u64,
                            "quota exhausted"
                        );
                        return Err(CurriculaError::QuotaExhausted(self.name.to_string()));
                    }
                    let delay = backoff
                        .max(retry_after)
                        .max(Duration::from_millis(1))
                        .min(self.max_wait - waited);
                    tracing::debug!(
                        capability = self.name,
                        delay_ms = delay.as_millis() as u64,
                        "quota limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
}

//! Reconnect pacing for the polling loop
//!
//! The helper only decides how long to wait and keeps counters; the caller
//! sleeps so the wait can race the shutdown token.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReconnectError {
    #[error("Reconnect budget of {0} attempts used up")]
    MaxAttemptsExceeded(u32),

    #[error("Connect failed: {0}")]
    ConnectionFailed(String),
}

/// How a device is re-dialled after losing its link
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failures allowed before giving up; 0 retries forever
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 1.0 keeps every wait at `initial_delay`
    pub backoff_multiplier: f64,
    /// Spread each wait by up to ±25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::every(Duration::from_secs(10))
    }
}

impl ReconnectPolicy {
    /// Retry forever, one polling interval apart
    pub fn every(interval: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: interval,
            max_delay: interval.max(Duration::from_secs(60)),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self.max_delay = max_delay.max(self.initial_delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after `failures` consecutive failed attempts, before jitter
    fn base_delay(&self, failures: u32) -> Duration {
        let steps = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(steps);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_connected: Option<Instant>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    /// Failed attempts since the last success
    failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    pub fn current_attempt(&self) -> u32 {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.failures >= self.policy.max_attempts
    }

    /// Run one connect attempt and record the outcome
    pub async fn execute_reconnect<F, Fut, E>(&mut self, connect: F) -> Result<(), ReconnectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if self.is_exhausted() {
            return Err(ReconnectError::MaxAttemptsExceeded(self.policy.max_attempts));
        }

        self.stats.attempts += 1;
        let started = Instant::now();
        match connect().await {
            Ok(()) => {
                if self.failures > 0 {
                    info!(
                        "Link restored after {} failed attempt(s), took {:?}",
                        self.failures,
                        started.elapsed()
                    );
                }
                self.failures = 0;
                self.stats.successes += 1;
                self.stats.last_connected = Some(Instant::now());
                self.stats.last_error = None;
                Ok(())
            },
            Err(e) => {
                self.failures += 1;
                self.stats.failures += 1;
                let message = e.to_string();
                warn!("Connect attempt {} failed: {}", self.failures, message);
                self.stats.last_error = Some(message.clone());
                Err(ReconnectError::ConnectionFailed(message))
            },
        }
    }

    /// Wait before the next attempt; `None` once a bounded policy is used up
    pub fn next_delay(&self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.policy.base_delay(self.failures);
        if !self.policy.jitter {
            return Some(delay);
        }
        let spread = delay.as_secs_f64() * 0.25;
        if spread <= 0.0 {
            return Some(delay);
        }
        let jittered = delay.as_secs_f64() + rand::thread_rng().gen_range(-spread..spread);
        debug!("Jittered reconnect delay {:.3}s", jittered);
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }
}

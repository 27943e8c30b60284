//! Per-provider circuit breaker.
//!
//! Tracks consecutive failures per provider name; after
//! [`FAILURE_THRESHOLD`] failures the provider enters a cooldown during
//! which [`CircuitBreaker::check`] fails fast. Any success resets the
//! counter. State is in-memory only — a cold start always allows one
//! attempt per provider.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{QmdError, Result};

/// Consecutive failures before the circuit opens.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
struct ProviderHealth {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

pub struct CircuitBreaker {
    cooldown: Duration,
    states: Mutex<HashMap<String, ProviderHealth>>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Gate an outbound call. During cooldown this fails fast with
    /// [`QmdError::ProviderCoolingDown`]; once the cooldown elapses the
    /// next call is attempted again (half-open).
    pub fn check(&self, provider: &str) -> Result<()> {
        let mut states = self.states.lock();
        let health = states.entry(provider.to_string()).or_default();
        if let Some(until) = health.cooldown_until {
            let now = Instant::now();
            if now < until {
                return Err(QmdError::ProviderCoolingDown {
                    provider: provider.to_string(),
                    remaining_secs: (until - now).as_secs().max(1),
                });
            }
            health.cooldown_until = None;
        }
        Ok(())
    }

    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.lock();
        let health = states.entry(provider.to_string()).or_default();
        health.consecutive_failures = 0;
        health.cooldown_until = None;
    }

    pub fn record_failure(&self, provider: &str) {
        let mut states = self.states.lock();
        let health = states.entry(provider.to_string()).or_default();
        health.consecutive_failures += 1;
        if health.consecutive_failures >= FAILURE_THRESHOLD {
            health.cooldown_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                provider,
                failures = health.consecutive_failures,
                "circuit opened, cooling down"
            );
        }
    }

    /// Whether the provider is currently cooling down (status output).
    pub fn is_open(&self, provider: &str) -> bool {
        self.check(provider).is_err()
    }
}

//! Circuit breakers for provider calls.
//!
//! Each (capability, provider) pair gets its own breaker. A breaker opens
//! after a run of consecutive failures, rejects calls for a cooldown
//! period, then lets exactly one trial request through. The trial's result
//! decides whether the circuit closes again or reopens for another
//! cooldown.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use fable_models::{Capability, ProviderId};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable circuit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// A single trial request is probing recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking the breaker for permission to call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Circuit closed, call normally
    Allowed,
    /// Circuit half-open, this call is the single recovery trial
    Trial,
    /// Circuit open, skip this candidate
    Rejected,
}

enum Inner {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { trial_started_at: Instant },
}

/// Circuit breaker for one (capability, provider) pair.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<Inner>>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::Closed { failures: 0 })),
            config,
        }
    }

    /// Ask for permission to call the provider.
    ///
    /// State transitions happen at acquire time: an open circuit whose
    /// cooldown has elapsed moves to half-open and hands this caller the
    /// trial slot. While a trial is in flight every other caller is
    /// rejected; a trial older than one cooldown is presumed lost and its
    /// slot is handed out again.
    pub fn try_acquire(&self) -> Acquire {
        let mut inner = self.inner.write().unwrap();
        match *inner {
            Inner::Closed { .. } => Acquire::Allowed,
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.cooldown {
                    *inner = Inner::HalfOpen {
                        trial_started_at: Instant::now(),
                    };
                    Acquire::Trial
                } else {
                    Acquire::Rejected
                }
            }
            Inner::HalfOpen { trial_started_at } => {
                if trial_started_at.elapsed() >= self.config.cooldown {
                    *inner = Inner::HalfOpen {
                        trial_started_at: Instant::now(),
                    };
                    Acquire::Trial
                } else {
                    Acquire::Rejected
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit and resets the
    /// failure run.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::Closed { failures: 0 };
    }

    /// Record a failed call.
    ///
    /// In the closed state this extends the failure run and opens the
    /// circuit at the threshold. A failed trial reopens immediately and
    /// restarts the cooldown.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Current state for monitoring.
    pub fn state(&self) -> CircuitState {
        match *self.inner.read().unwrap() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

/// Registry of breakers keyed by (capability, provider).
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: RwLock<HashMap<(Capability, ProviderId), CircuitBreaker>>,
}

impl CircuitRegistry {
    /// Create an empty registry; breakers are created on first use.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for a (capability, provider) pair.
    ///
    /// Clones share state, so the returned handle observes and records
    /// the same circuit as every other caller.
    pub fn breaker(&self, capability: Capability, provider: &ProviderId) -> CircuitBreaker {
        {
            let breakers = self.breakers.read().unwrap();
            if let Some(breaker) = breakers.get(&(capability, provider.clone())) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry((capability, provider.clone()))
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()))
            .clone()
    }

    /// Snapshot of all breaker states for monitoring.
    pub fn states(&self) -> Vec<(Capability, ProviderId, CircuitState)> {
        let breakers = self.breakers.read().unwrap();
        breakers
            .iter()
            .map(|((capability, provider), breaker)| (*capability, provider.clone(), breaker.state()))
            .collect()
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

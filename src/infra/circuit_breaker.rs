//! Circuit breaker for the tax-authority endpoint
//!
//! While the authority is down, submissions fail fast instead of each
//! waiting out the full transport timeout. A fast failure is still recorded
//! as an `error` outcome and redriven by the recovery engine.
//!
//! # States
//!
//! - **Closed**: submissions pass through, consecutive failures are counted
//! - **Open**: submissions are refused until the cooldown elapses
//! - **HalfOpen**: one probe submission at a time decides whether to close

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cooldown after the first opening; doubles on each reopening
    pub open_timeout: Duration,
    pub max_open_timeout: Duration,
    /// Successful probes needed to close again
    pub probe_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            max_open_timeout: Duration::from_secs(900),
            probe_successes: 1,
        }
    }
}

/// Whether one submission may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the single half-open probe
    Probe,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug)]
enum Phase {
    Closed {
        failures: u32,
    },
    Open {
        since: Instant,
        cooldown: Duration,
        /// Openings since the circuit was last closed
        openings: u32,
    },
    HalfOpen {
        /// Start of the outstanding probe; a probe older than `open_timeout`
        /// counts as abandoned
        probe_since: Option<Instant>,
        successes: u32,
        openings: u32,
    },
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    phase: Mutex<Phase>,
    rejected: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
            rejected: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        let mut phase = self.phase.lock().await;
        self.cool_down(&mut phase);
        match *phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Decide whether a submission may go out, reserving the probe slot
    /// when half-open.
    pub async fn admit(&self) -> Admission {
        let mut phase = self.phase.lock().await;
        self.cool_down(&mut phase);
        let admission = match &mut *phase {
            Phase::Closed { .. } => Admission::Allowed,
            Phase::Open {
                since, cooldown, ..
            } => Admission::Rejected {
                retry_after: cooldown.saturating_sub(since.elapsed()),
            },
            Phase::HalfOpen { probe_since, .. }
                if probe_since.map_or(true, |since| since.elapsed() >= self.config.open_timeout) =>
            {
                *probe_since = Some(Instant::now());
                Admission::Probe
            }
            Phase::HalfOpen { .. } => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
        };
        if !admission.is_allowed() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        admission
    }

    /// The endpoint answered, whatever the verdict.
    pub async fn on_success(&self) {
        let mut phase = self.phase.lock().await;
        match &mut *phase {
            Phase::Closed { failures } => *failures = 0,
            Phase::HalfOpen {
                probe_since,
                successes,
                ..
            } => {
                *successes += 1;
                *probe_since = None;
                if *successes >= self.config.probe_successes.max(1) {
                    info!(circuit = %self.name, "Circuit breaker closed");
                    *phase = Phase::Closed { failures: 0 };
                }
            }
            Phase::Open { .. } => {}
        }
    }

    /// The endpoint was unreachable, timed out or failed server-side.
    pub async fn on_failure(&self) {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    self.open(&mut phase, 1, failures);
                } else {
                    *phase = Phase::Closed { failures };
                }
            }
            Phase::HalfOpen { openings, .. } => self.open(&mut phase, openings + 1, 1),
            Phase::Open { .. } => {}
        }
    }

    /// Submissions refused while open or while a probe was out
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }

    fn cool_down(&self, phase: &mut Phase) {
        if let Phase::Open {
            since,
            cooldown,
            openings,
        } = *phase
        {
            if since.elapsed() >= cooldown {
                info!(circuit = %self.name, "Circuit breaker half-open, probing endpoint");
                *phase = Phase::HalfOpen {
                    probe_since: None,
                    successes: 0,
                    openings,
                };
            }
        }
    }

    fn open(&self, phase: &mut Phase, openings: u32, failures: u32) {
        let factor = 2u32.saturating_pow(openings.saturating_sub(1).min(16));
        let cooldown = self
            .config
            .open_timeout
            .saturating_mul(factor)
            .min(self.config.max_open_timeout);

        warn!(
            circuit = %self.name,
            failures,
            openings,
            cooldown_secs = cooldown.as_secs(),
            "Circuit breaker opened"
        );
        *phase = Phase::Open {
            since: Instant::now(),
            cooldown,
            openings,
        };
        self.times_opened.fetch_add(1, Ordering::Relaxed);
    }
}

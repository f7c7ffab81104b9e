//! Short-horizon retry with jittered exponential backoff
//!
//! Covers in-request contention only: chain-head compare-and-swap conflicts
//! and transient database errors. Failed authority submissions are redriven
//! by the recovery engine on a much longer horizon.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

/// SQLSTATE and SQLite result codes worth another attempt
const TRANSIENT_DB_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "5",     // SQLITE_BUSY
    "6",     // SQLITE_LOCKED
    "262",   // SQLITE_LOCKED_SHAREDCACHE
    "517",   // SQLITE_BUSY_SNAPSHOT
];

/// Postgres classes: connection exception, operator intervention
const TRANSIENT_DB_CLASSES: &[&str] = &["08", "57"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Attempts after the first one
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of each delay drawn at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Backoff {
    /// Another writer appended between reading the head and the CAS.
    pub const fn chain_append() -> Self {
        Self {
            retries: 8,
            base: Duration::from_millis(5),
            cap: Duration::from_millis(250),
            jitter: 0.5,
        }
    }

    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }

    pub fn without_jitter(self) -> Self {
        Self {
            jitter: 0.0,
            ..self
        }
    }

    /// Delay before retry number `retry` (0 for the first retry). The
    /// unjittered part doubles each time up to `cap`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(retry.min(20)))
            .min(self.cap);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }
        let fixed = ceiling.mul_f64(1.0 - jitter);
        let random = ceiling.mul_f64(jitter * rand::thread_rng().gen::<f64>());
        fixed + random
    }
}

/// Outcome of [`retry_with_backoff`]
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    /// 1 when the first attempt settled it
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T, E> Retried<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Run `operation` until it succeeds, fails with an error `transient`
/// rejects, or the backoff runs out of retries.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    backoff: Backoff,
    mut operation: F,
    transient: P,
) -> Retried<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempts = 0;
    let result = loop {
        attempts += 1;
        match operation().await {
            Err(err) if attempts <= backoff.retries && transient(&err) => {
                let delay = backoff.delay(attempts - 1);
                debug!(attempts, delay_ms = delay.as_millis() as u64, "Transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            settled => break settled,
        }
    };
    Retried {
        result,
        attempts,
        elapsed: started.elapsed(),
    }
}

/// Whether a database error is contention or a dropped connection rather
/// than a problem with the statement itself.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            TRANSIENT_DB_CODES.contains(&&*code)
                || TRANSIENT_DB_CLASSES
                    .iter()
                    .any(|class| code.starts_with(*class))
        }),
        _ => false,
    }
}

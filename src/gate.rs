//! Process-wide error budget.
//!
//! The gate is shared between the pipeline and the database client's
//! completion callbacks, which run on other threads. All state is atomic so
//! concurrent failures are never lost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::domain::ResponseStatus;

/// Why the gate stopped ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTrip {
    /// More tolerable failures than the ceiling allows.
    BudgetExhausted,
    /// A response that can never be tolerated.
    FatalStatus,
}

#[derive(Debug)]
pub struct ErrorGate {
    failures: AtomicU64,
    /// `None` means unlimited.
    ceiling: Option<u64>,
    fatal: AtomicBool,
    /// Cancelled the first time the gate trips.
    halted: CancellationToken,
}

impl ErrorGate {
    /// A ceiling of zero or below never trips on count alone.
    pub fn new(max_errors: i64) -> Self {
        Self {
            failures: AtomicU64::new(0),
            ceiling: u64::try_from(max_errors).ok().filter(|max| *max > 0),
            fatal: AtomicBool::new(false),
            halted: CancellationToken::new(),
        }
    }

    /// Counts a failed row. Returns true when the pipeline must stop.
    pub fn record_failure(&self, status: ResponseStatus) -> bool {
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let fatal = status.is_fatal();
        if fatal {
            self.fatal.store(true, Ordering::Release);
        }
        let stop = fatal || self.exceeds(count);
        if stop {
            error!(failures = count, %status, fatal, "Error gate tripped, loader will stop");
            self.halted.cancel();
        }
        stop
    }

    /// Resolves once the gate has tripped, immediately if it already has.
    pub async fn tripped(&self) {
        self.halted.cancelled().await
    }

    /// Non-mutating check, safe to call from any thread.
    pub fn has_reached_limit(&self) -> bool {
        self.trip().is_some()
    }

    pub fn trip(&self) -> Option<GateTrip> {
        if self.fatal.load(Ordering::Acquire) {
            Some(GateTrip::FatalStatus)
        } else if self.exceeds(self.failures.load(Ordering::Acquire)) {
            Some(GateTrip::BudgetExhausted)
        } else {
            None
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    fn exceeds(&self, count: u64) -> bool {
        self.ceiling.is_some_and(|ceiling| count > ceiling)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn tolerable_failures_trip_only_past_the_ceiling() {
        let gate = ErrorGate::new(2);
        assert!(!gate.record_failure(ResponseStatus::GracefulFailure));
        assert!(!gate.record_failure(ResponseStatus::UserAbort));
        assert!(!gate.has_reached_limit());

        assert!(gate.record_failure(ResponseStatus::GracefulFailure));
        assert_eq!(gate.trip(), Some(GateTrip::BudgetExhausted));
        assert_eq!(gate.failures(), 3);
    }

    #[test]
    fn fatal_status_trips_regardless_of_budget() {
        let gate = ErrorGate::new(100);
        assert!(gate.record_failure(ResponseStatus::ConnectionLost));
        assert_eq!(gate.trip(), Some(GateTrip::FatalStatus));
        assert_eq!(gate.failures(), 1);
    }

    #[tokio::test]
    async fn trip_wakes_waiters_on_other_threads() {
        let gate = Arc::new(ErrorGate::new(1));
        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.tripped().await }
        });

        let recorder = Arc::clone(&gate);
        thread::spawn(move || {
            recorder.record_failure(ResponseStatus::GracefulFailure);
            recorder.record_failure(ResponseStatus::GracefulFailure);
        })
        .join()
        .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
        // already tripped: resolves at once
        gate.tripped().await;
    }

    #[test]
    fn non_positive_ceiling_is_unlimited() {
        for max in [0, -5] {
            let gate = ErrorGate::new(max);
            assert_eq!(gate.ceiling(), None);
            for _ in 0..1_000 {
                assert!(!gate.record_failure(ResponseStatus::GracefulFailure));
            }
            assert!(!gate.has_reached_limit());
        }
    }

    #[test]
    fn concurrent_failures_are_never_lost() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 500;
        let ceiling = THREADS * PER_THREAD - 1;
        let gate = Arc::new(ErrorGate::new(ceiling as i64));

        let tripped: u64 = (0..THREADS)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .filter(|_| gate.record_failure(ResponseStatus::GracefulFailure))
                        .count() as u64
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();

        assert_eq!(gate.failures(), THREADS * PER_THREAD);
        // exactly one increment crossed the ceiling
        assert_eq!(tripped, 1);
        assert!(gate.has_reached_limit());
    }

    #[test]
    fn limit_is_reached_exactly_past_the_ceiling() {
        let gate = Arc::new(ErrorGate::new(50));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.record_failure(ResponseStatus::UserAbort))
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
        assert!(!gate.has_reached_limit());

        assert!(gate.record_failure(ResponseStatus::UserAbort));
        assert!(gate.has_reached_limit());
    }
}

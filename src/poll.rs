/*
src/poll.rs

every waiting loop in the crate (download progress, peer list rounds, alert queue) goes through BoundedPoll.
a loop ends when the step breaks, the attempt ceiling is hit, the caller cancels, or the run deadline passes.
*/

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source for polling loops, so tests can run simulated seconds.
pub trait Pacer {
    /// monotonic time since the pacer was created
    fn elapsed(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct RealPacer {
    start: Instant,
}

impl RealPacer {
    pub fn new() -> RealPacer {
        RealPacer {
            start: Instant::now(),
        }
    }
}

impl Default for RealPacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer for RealPacer {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Cooperative stop signal, checked between polling iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a run may still spend: a cancel token and an optional point on the
/// pacer's timeline after which every loop gives up.
#[derive(Debug, Clone, Default)]
pub struct Budget {
    pub cancel: CancelToken,
    pub until: Option<Duration>,
}

impl Budget {
    pub fn unlimited() -> Budget {
        Budget::default()
    }

    /// budget ending `limit` from now on `pacer`'s timeline
    pub fn with_deadline(cancel: CancelToken, pacer: &dyn Pacer, limit: Option<Duration>) -> Budget {
        Budget {
            cancel,
            until: limit.map(|limit| pacer.elapsed() + limit),
        }
    }

    pub fn interrupted<T>(&self, pacer: &dyn Pacer) -> Option<PollOutcome<T>> {
        if self.cancel.is_cancelled() {
            return Some(PollOutcome::Cancelled);
        }
        match self.until {
            Some(until) if pacer.elapsed() >= until => Some(PollOutcome::DeadlineExceeded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Done(T),
    /// the attempt ceiling was reached without the step finishing
    Exhausted,
    Cancelled,
    DeadlineExceeded,
}

impl<T> PollOutcome<T> {
    pub fn done(self) -> Option<T> {
        match self {
            PollOutcome::Done(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundedPoll {
    pub interval: Duration,
    /// None polls until the step, the cancel token, or the deadline ends it
    pub max_attempts: Option<usize>,
}

impl BoundedPoll {
    pub fn new(interval: Duration, max_attempts: usize) -> BoundedPoll {
        BoundedPoll {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn unbounded(interval: Duration) -> BoundedPoll {
        BoundedPoll {
            interval,
            max_attempts: None,
        }
    }

    /// Calls `step` with the attempt number, sleeping `interval` between
    /// attempts. No sleep follows the last attempt.
    pub fn run<T>(
        &self,
        pacer: &dyn Pacer,
        budget: &Budget,
        mut step: impl FnMut(usize) -> ControlFlow<T>,
    ) -> PollOutcome<T> {
        let mut attempt = 0;
        loop {
            if let Some(outcome) = budget.interrupted(pacer) {
                return outcome;
            }
            if let ControlFlow::Break(value) = step(attempt) {
                return PollOutcome::Done(value);
            }
            attempt += 1;
            if matches!(self.max_attempts, Some(max) if attempt >= max) {
                return PollOutcome::Exhausted;
            }
            pacer.sleep(self.interval);
        }
    }
}

#[cfg(test)]
pub(crate) use manual::ManualPacer;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_attempt_ceiling() {
        let pacer = ManualPacer::new();
        let mut calls = 0;
        let outcome: PollOutcome<()> =
            BoundedPoll::new(Duration::from_secs(1), 10).run(&pacer, &Budget::unlimited(), |_| {
                calls += 1;
                ControlFlow::Continue(())
            });
        assert_eq!(outcome, PollOutcome::Exhausted);
        assert_eq!(calls, 10);
        assert_eq!(pacer.sleeps.get(), 9);
    }

    #[test]
    fn returns_step_value() {
        let pacer = ManualPacer::new();
        let outcome = BoundedPoll::new(Duration::from_secs(1), 10)
            .run(&pacer, &Budget::unlimited(), |attempt| {
                if attempt == 3 {
                    ControlFlow::Break(attempt * 2)
                } else {
                    ControlFlow::Continue(())
                }
            });
        assert_eq!(outcome, PollOutcome::Done(6));
        assert_eq!(pacer.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn cancel_is_seen_between_iterations() {
        let pacer = ManualPacer::new();
        let budget = Budget::unlimited();
        let outcome: PollOutcome<()> = BoundedPoll::unbounded(Duration::from_secs(1))
            .run(&pacer, &budget, |attempt| {
                if attempt == 2 {
                    budget.cancel.cancel();
                }
                ControlFlow::Continue(())
            });
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(pacer.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn deadline_ends_unbounded_poll() {
        let pacer = ManualPacer::new();
        let budget = Budget::with_deadline(CancelToken::new(), &pacer, Some(Duration::from_secs(5)));
        let outcome: PollOutcome<()> = BoundedPoll::unbounded(Duration::from_secs(2))
            .run(&pacer, &budget, |_| ControlFlow::Continue(()));
        assert_eq!(outcome, PollOutcome::DeadlineExceeded);
        assert_eq!(pacer.elapsed(), Duration::from_secs(6));
    }
}

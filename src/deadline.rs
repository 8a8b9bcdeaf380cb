//! Absolute deadlines, optionally ceiled to whole seconds.
//!
//! Many requests with long timeouts would otherwise each arm a timer for a
//! slightly different instant. Timeouts at or above the ceiling threshold are
//! rounded up to the next whole second (measured from the scheduler's anchor),
//! so they share wakeups with their neighbours.

use std::future::Future;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::Instant;

/// Timeouts shorter than this are scheduled precisely.
pub const DEFAULT_CEIL_THRESHOLD: Duration = Duration::from_secs(5);

/// The longest wait a deadline will schedule. Longer timeouts saturate here
/// instead of overflowing the clock.
pub const MAX_WAIT: Duration = Duration::from_secs(86400 * 365 * 30);

/// An absolute wake time derived from a requested duration.
///
/// `wake_at >= now + min(requested, MAX_WAIT)`, with equality only when no
/// ceiling was applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Deadline {
    requested: Duration,
    wake_at: Instant,
}

impl Deadline {
    /// The duration this deadline was scheduled for.
    pub fn requested(&self) -> Duration {
        self.requested
    }

    pub fn wake_at(&self) -> Instant {
        self.wake_at
    }

    /// Time left before the deadline, zero once expired.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.wake_at.saturating_duration_since(now)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.wake_at
    }

    /// Runs `fut` until completion or until the deadline passes.
    pub async fn timeout<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(self.wake_at, fut).await
    }
}

/// Bounds `fut` by `deadline`, if there is one.
pub(crate) async fn within<F: Future>(
    deadline: Option<&Deadline>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    match deadline {
        Some(deadline) => deadline.timeout(fut).await,
        None => Ok(fut.await),
    }
}

/// Turns requested durations into [Deadline]s.
#[derive(Clone, Debug)]
pub struct DeadlineScheduler {
    anchor: Instant,
    ceil_threshold: Duration,
}

impl Default for DeadlineScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CEIL_THRESHOLD)
    }
}

impl DeadlineScheduler {
    /// Creates a scheduler whose whole-second grid starts now.
    pub fn new(ceil_threshold: Duration) -> Self {
        Self::with_anchor(Instant::now(), ceil_threshold)
    }

    /// Creates a scheduler whose whole-second grid starts at `anchor`.
    pub fn with_anchor(anchor: Instant, ceil_threshold: Duration) -> Self {
        Self {
            anchor,
            ceil_threshold,
        }
    }

    pub fn ceil_threshold(&self) -> Duration {
        self.ceil_threshold
    }

    /// Schedules `duration` from the current time.
    ///
    /// Returns `None` if no deadline should be applied.
    pub fn schedule(&self, duration: Option<Duration>) -> Option<Deadline> {
        self.schedule_at(Instant::now(), duration)
    }

    /// Schedules `duration` from `now`.
    ///
    /// - `None` or zero: no deadline.
    /// - Below the ceiling threshold: exactly `now + duration`.
    /// - Otherwise: the first whole second after the anchor which is strictly
    ///   later than `now + duration`.
    ///
    /// Durations longer than [MAX_WAIT] are scheduled as [MAX_WAIT].
    pub fn schedule_at(&self, now: Instant, duration: Option<Duration>) -> Option<Deadline> {
        let requested = duration.filter(|d| !d.is_zero())?;

        let exact = now + requested.min(MAX_WAIT);
        if requested < self.ceil_threshold {
            return Some(Deadline {
                requested,
                wake_at: exact,
            });
        }

        let since_anchor = exact.saturating_duration_since(self.anchor);
        let next_second = Duration::from_secs(since_anchor.as_secs().saturating_add(1));
        let wake_at = self.anchor.checked_add(next_second).unwrap_or(exact);
        Some(Deadline { requested, wake_at })
    }
}

//! Timeouts for executions.
//!
//! A timeout is not a primitive of its own: it is a cancellation source
//! whose timer cancels it after a duration. An execution that outlives its
//! timeout therefore resolves exactly like a cancelled one, with the
//! timeout recorded as the cancellation reason.

use std::time::{Duration, Instant};

use crate::cancellation::{CancellationSource, CancellationToken, Timer};

/// A timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Start the timer beneath `parent`.
    ///
    /// The returned guard's token is cancelled when the timer fires or when
    /// `parent` is cancelled, whichever comes first.
    pub fn arm(&self, parent: &CancellationToken) -> TimeoutGuard {
        let source = CancellationSource::with_parent(parent.clone());
        let timer = source.cancel_after(self.duration);
        TimeoutGuard {
            source,
            deadline: Deadline::after(self.duration),
            _timer: timer,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::new(duration)
    }
}

/// An armed timeout.
///
/// Dropping the guard stops its timer thread.
#[derive(Debug)]
pub struct TimeoutGuard {
    source: CancellationSource,
    deadline: Deadline,
    _timer: Timer,
}

impl TimeoutGuard {
    pub fn token(&self) -> CancellationToken {
        self.source.token()
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_expired()
    }
}

/// A point in time by which an execution must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    pub fn instant(&self) -> Instant {
        self.instant
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.instant
    }

    /// Time left, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.instant.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_remaining() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() <= Duration::from_secs(60));

        let past = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(past.is_expired());
        assert_eq!(past.remaining(), None);
    }

    #[test]
    fn test_armed_timeout_cancels_token() {
        let parent = CancellationToken::none();
        let guard = Timeout::from_millis(5).arm(&parent);
        let token = guard.token();
        let limit = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() && Instant::now() < limit {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(token.is_cancelled());
        assert!(guard.is_expired());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation_reaches_timeout_token() {
        let parent = CancellationSource::new();
        let guard = Timeout::new(Duration::from_secs(3600)).arm(&parent.token());
        parent.cancel();
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn test_dropped_guard_leaves_token_uncancelled() {
        let guard = Timeout::from_millis(10).arm(&CancellationToken::none());
        let token = guard.token();
        drop(guard);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!token.is_cancelled());
    }
}

//! Cooperative cancellation of executions.
//!
//! A suspended execution waits on a handler completion that may never
//! come. Cancelling its token resolves the execution with a distinct
//! `Cancelled` error and closes the pending continuation, so a handler that
//! completes late cannot resume an instance already considered finished.
//!
//! - `CancellationToken`: read-only view, cheap to clone, checked by the host loop
//! - `CancellationSource`: owns the ability to cancel its tokens
//!
//! Tokens form a hierarchy: a child is cancelled when its parent is.
//! Wakers registered on a token are woken when it, or any ancestor, is
//! cancelled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

static TOKEN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct CancellationState {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
    reason: Mutex<Option<String>>,
    cancelled_at: Mutex<Option<Instant>>,
    wakers: Mutex<Vec<Waker>>,
}

impl CancellationState {
    fn new(parent: Option<CancellationToken>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            parent,
            reason: Mutex::new(None),
            cancelled_at: Mutex::new(None),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self, reason: Option<String>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.reason.lock() = reason;
        *self.cancelled_at.lock() = Some(Instant::now());
        let wakers = std::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

/// A token that can be checked for cancellation.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    id: u64,
    state: Arc<CancellationState>,
}

impl CancellationToken {
    fn with_state(parent: Option<CancellationToken>) -> Self {
        Self {
            id: TOKEN_ID_COUNTER.fetch_add(1, Ordering::SeqCst),
            state: Arc::new(CancellationState::new(parent)),
        }
    }

    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self::with_state(None)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.state.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// The reason given by whichever token in the chain was cancelled.
    pub fn reason(&self) -> Option<String> {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return self.state.reason.lock().clone();
        }
        self.state.parent.as_ref().and_then(|p| p.reason())
    }

    pub fn cancelled_at(&self) -> Option<Instant> {
        *self.state.cancelled_at.lock()
    }

    /// Create a child token, cancelled together with this one.
    pub fn child(&self) -> CancellationToken {
        Self::with_state(Some(self.clone()))
    }

    pub fn check(&self) -> Result<(), CancellationError> {
        if self.is_cancelled() {
            Err(CancellationError {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }

    /// Wake `waker` once this token (or an ancestor) is cancelled.
    ///
    /// If cancellation already happened the waker is woken immediately.
    pub fn register_waker(&self, waker: &Waker) {
        {
            let mut wakers = self.state.wakers.lock();
            if !self.state.cancelled.load(Ordering::SeqCst) {
                if !wakers.iter().any(|w| w.will_wake(waker)) {
                    wakers.push(waker.clone());
                }
            } else {
                drop(wakers);
                waker.wake_by_ref();
                return;
            }
        }
        if let Some(parent) = &self.state.parent {
            parent.register_waker(waker);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}

/// Creates and controls cancellation tokens.
#[derive(Debug)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::with_state(None),
        }
    }

    /// Tokens from this source are also cancelled when `parent` is.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            token: CancellationToken::with_state(Some(parent)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_with_reason(None);
    }

    pub fn cancel_with_reason(&self, reason: Option<String>) {
        self.token.state.cancel(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel after a delay.
    ///
    /// The timer thread holds only a weak reference, so an execution that
    /// finishes first is not kept alive by its timer. Dropping the returned
    /// [`Timer`] stops the thread before the delay elapses.
    pub fn cancel_after(&self, delay: Duration) -> Timer {
        let state = Arc::downgrade(&self.token.state);
        let signal = Arc::new(TimerSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        // `None` when the delay is too large to represent; such a timer only stops.
        let deadline = Instant::now().checked_add(delay);
        let spawned = std::thread::Builder::new()
            .name("wisp-timeout".to_string())
            .spawn(move || {
                let mut stopped = thread_signal.stopped.lock();
                while !*stopped {
                    match deadline {
                        Some(deadline) => {
                            if thread_signal.condvar.wait_until(&mut stopped, deadline).timed_out() {
                                break;
                            }
                        }
                        None => thread_signal.condvar.wait(&mut stopped),
                    }
                }
                if *stopped {
                    return;
                }
                drop(stopped);
                if let Some(state) = state.upgrade() {
                    state.cancel(Some(format!("timed out after {:?}", delay)));
                }
            });
        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, ?delay, "failed to start timeout thread");
                None
            }
        };
        Timer { signal, thread }
    }
}

#[derive(Debug)]
struct TimerSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

/// A running [`CancellationSource::cancel_after`] timer.
///
/// Dropping it wakes the timer thread and joins it.
#[derive(Debug)]
#[must_use = "dropping a Timer stops it"]
pub struct Timer {
    signal: Arc<TimerSignal>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    /// Stop the timer without cancelling.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.condvar.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("timeout thread panicked");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when an operation is cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation cancelled{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
pub struct CancellationError {
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_with_reason() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(token.check().is_ok());
        source.cancel_with_reason(Some("shutdown".to_string()));
        assert!(token.is_cancelled());
        assert_eq!(
            token.check(),
            Err(CancellationError {
                reason: Some("shutdown".to_string())
            })
        );
        assert!(token.cancelled_at().is_some());
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancellationSource::new();
        let child = CancellationSource::with_parent(parent.token());
        let grandchild = child.token().child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationSource::new();
        let child = CancellationSource::with_parent(parent.token());
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_registered_waker_fires_once() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let source = CancellationSource::new();
        source.token().register_waker(&waker);
        source.token().register_waker(&waker);
        source.cancel();
        source.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Registering after cancellation wakes immediately.
        source.token().register_waker(&waker);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parent_cancellation_wakes_child_waiters() {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let parent = CancellationSource::new();
        let child = parent.token().child();
        child.register_waker(&waker);
        parent.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_after() {
        let source = CancellationSource::new();
        let _timer = source.cancel_after(Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !source.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(source.is_cancelled());
        assert!(source.token().reason().unwrap().starts_with("timed out"));
    }

    #[test]
    fn test_stopped_timer_never_cancels() {
        let source = CancellationSource::new();
        let timer = source.cancel_after(Duration::from_millis(20));
        timer.stop();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!source.is_cancelled());
    }

    #[test]
    fn test_dropping_timer_returns_promptly() {
        let source = CancellationSource::new();
        let started = Instant::now();
        drop(source.cancel_after(Duration::from_secs(3600)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!source.is_cancelled());
    }
}

//! Host-side continuation handles.
//!
//! When the binary returns a Request, the host loop keeps the engine-side
//! continuation to itself and hands the handler a [`Resumer`]: a one-shot,
//! thread-safe ticket to complete the request. The handler may use it
//! synchronously, move it to another thread and use it later, or drop it.
//!
//! ## One-shot enforcement
//!
//! Each request gets its own [`CompletionSlot`]. The first `resume` fills
//! the slot; any later `resume` (from the same ticket or a clone) poisons
//! the whole execution, which then ends with `DoubleResume`. Dropping every
//! ticket of a slot without resuming marks it abandoned, which ends the
//! execution with `MissingTailResume`. Once an execution has finished, for
//! any reason, resuming returns [`ResumeError::Finished`] and has no effect.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Waker;

use parking_lot::Mutex;

use crate::error::ResumeError;
use crate::value::HostValue;

/// Unique identifier of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationId(u64);

impl ContinuationId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_CONTINUATION_ID: AtomicU64 = AtomicU64::new(1);

fn next_continuation_id() -> ContinuationId {
    ContinuationId(NEXT_CONTINUATION_ID.fetch_add(1, Ordering::Relaxed))
}

/// State shared by every slot of one execution.
#[derive(Debug, Default)]
pub(crate) struct ExecutionSignal {
    inner: Mutex<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    waker: Option<Waker>,
    finished: bool,
    violation: Option<String>,
}

impl ExecutionSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut inner = self.inner.lock();
        match &inner.waker {
            Some(existing) if existing.will_wake(waker) => {}
            _ => inner.waker = Some(waker.clone()),
        }
    }

    /// Mark the execution finished; later completions are rejected.
    pub(crate) fn finish(&self) {
        let mut inner = self.inner.lock();
        inner.finished = true;
        inner.waker = None;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Take the label of an operation that was resumed twice, if any.
    pub(crate) fn take_violation(&self) -> Option<String> {
        self.inner.lock().violation.take()
    }

    fn poison(&self, label: &str) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.violation.get_or_insert_with(|| label.to_string());
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake(&self) {
        let waker = self.inner.lock().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[derive(Debug)]
enum Phase {
    Waiting,
    Resumed(HostValue),
    Taken,
    Poisoned,
}

/// What the host loop finds when it checks a slot.
#[derive(Debug, PartialEq)]
pub(crate) enum Completion {
    Pending,
    Resumed(HostValue),
    Abandoned,
}

/// Completion state of one request.
#[derive(Debug)]
pub(crate) struct CompletionSlot {
    id: ContinuationId,
    label: String,
    signal: Arc<ExecutionSignal>,
    phase: Mutex<Phase>,
    live_tickets: AtomicUsize,
}

impl CompletionSlot {
    pub(crate) fn new(label: &str, signal: Arc<ExecutionSignal>) -> Arc<Self> {
        Arc::new(Self {
            id: next_continuation_id(),
            label: label.to_string(),
            signal,
            phase: Mutex::new(Phase::Waiting),
            live_tickets: AtomicUsize::new(0),
        })
    }

    /// Create a ticket for this slot.
    pub(crate) fn resumer(self: &Arc<Self>) -> Resumer {
        self.live_tickets.fetch_add(1, Ordering::SeqCst);
        Resumer {
            slot: Arc::clone(self),
        }
    }

    pub(crate) fn complete(&self, value: HostValue) -> Result<(), ResumeError> {
        if self.signal.is_finished() {
            return Err(ResumeError::Finished);
        }
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Waiting => {
                *phase = Phase::Resumed(value);
                drop(phase);
                self.signal.wake();
                Ok(())
            }
            Phase::Resumed(_) | Phase::Taken => {
                *phase = Phase::Poisoned;
                drop(phase);
                tracing::debug!(label = %self.label, id = self.id.as_u64(), "continuation resumed twice");
                self.signal.poison(&self.label);
                Err(ResumeError::AlreadyResumed)
            }
            Phase::Poisoned => Err(ResumeError::AlreadyResumed),
        }
    }

    /// Check the slot, taking the resume value if present.
    pub(crate) fn take(&self) -> Completion {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Taken) {
            Phase::Resumed(value) => Completion::Resumed(value),
            Phase::Waiting => {
                *phase = Phase::Waiting;
                if self.live_tickets.load(Ordering::SeqCst) == 0 {
                    Completion::Abandoned
                } else {
                    Completion::Pending
                }
            }
            other => {
                *phase = other;
                Completion::Pending
            }
        }
    }
}

/// A one-shot ticket to resume a suspended request.
///
/// Cloning yields another ticket for the same request; only one `resume`
/// across all clones may succeed.
#[derive(Debug)]
pub struct Resumer {
    slot: Arc<CompletionSlot>,
}

impl Resumer {
    pub fn id(&self) -> ContinuationId {
        self.slot.id
    }

    /// Resume the suspended computation with `value`.
    pub fn resume(&self, value: impl Into<HostValue>) -> Result<(), ResumeError> {
        self.slot.complete(value.into())
    }
}

impl Clone for Resumer {
    fn clone(&self) -> Self {
        self.slot.resumer()
    }
}

impl Drop for Resumer {
    fn drop(&mut self) {
        if self.slot.live_tickets.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last ticket gone: let the loop notice an abandoned request.
            self.slot.signal.wake();
        }
    }
}

//! Cooperative Scheduling
//!
//! The digest engine is fully synchronous, but two of its entry points
//! defer work to "the next turn": `eval_async` schedules a fallback cycle
//! when nothing else would trigger one, and `apply_async` coalesces a
//! burst of external triggers into one future cycle. Both only need a
//! primitive with two properties:
//!
//! 1. Single-shot submission: a task runs no earlier than the next
//!    scheduler turn, exactly once.
//!
//! 2. Cancellation: a still-queued task can be removed, exactly once.
//!    A synchronous digest uses this to preempt a pending coalesced
//!    flush so the work runs inline instead of later.
//!
//! The [`Scheduler`] trait is that seam, and [`EventLoop`] is the
//! provided implementation: a plain FIFO queue the host drives with
//! `run_until_idle`. There is no timing involved; "no earlier than the
//! next turn" is the whole contract.

mod event_loop;

pub use event_loop::EventLoop;

use std::sync::atomic::{AtomicU64, Ordering};

/// A single-shot unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Unique identifier for a scheduled task.
///
/// Handed out at submission and used to cancel the task while it is
/// still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate a new unique task ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-shot, cancellable task submission.
pub trait Scheduler {
    /// Queue a task to run on a future scheduler turn.
    fn schedule(&self, task: Task) -> TaskId;

    /// Remove a still-queued task. Returns whether anything was removed;
    /// a task that already ran (or was already cancelled) yields `false`.
    fn cancel(&self, id: TaskId) -> bool;
}

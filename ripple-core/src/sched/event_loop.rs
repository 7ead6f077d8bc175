//! Event Loop
//!
//! A minimal cooperative scheduler: tasks are queued FIFO and run when
//! the host calls [`EventLoop::run_until_idle`] (or steps with
//! [`EventLoop::run_one`]). Tasks scheduled by a running task join the
//! back of the queue and execute in the same drain, which is exactly the
//! "next macrotask" shape the scope's deferred entry points rely on.

use std::cell::RefCell;
use std::collections::VecDeque;

use super::{Scheduler, Task, TaskId};

/// A FIFO, single-threaded task queue.
pub struct EventLoop {
    queue: RefCell<VecDeque<QueuedTask>>,
}

struct QueuedTask {
    id: TaskId,
    task: Task,
}

impl EventLoop {
    /// Create an empty event loop.
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Whether the queue is empty.
    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Run the task at the front of the queue, if any.
    ///
    /// The queue is released before the task executes, so a task may
    /// schedule or cancel other tasks freely.
    pub fn run_one(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        match next {
            Some(entry) => {
                (entry.task)();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks scheduled
    /// while draining. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, task: Task) -> TaskId {
        let id = TaskId::new();
        self.queue.borrow_mut().push_back(QueuedTask { id, task });
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut queue = self.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|queued| queued.id != id);
        queue.len() != before
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

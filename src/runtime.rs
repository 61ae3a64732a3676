//! Executor-local cooperative task runtime.
//!
//! The runtime polls task containers from a FIFO queue, one at a time, so
//! `poll` is never re-entered for the same container. A task that reports
//! [`PollOutcome::Blocked`] is parked only if it wins the `try_block` claim;
//! a wake that raced the poll makes the claim fail and the container goes
//! back on the queue, so wakes are never lost.
//!
//! Runnable-state protocol (one atomic per container):
//!
//! - `RUNNABLE`: owned by the queue or being polled right now.
//! - `BLOCKED`: parked; owned by the event source holding its [`TaskHandle`].
//! - `AWAKING`: a wake arrived while the container was runnable; the next
//!   `try_block` must fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

const RUNNABLE: u8 = 0;
const BLOCKED: u8 = 1;
const AWAKING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Task completed; the container is dropped.
    Ready,
    /// Cooperative yield; the container is re-enqueued.
    Pending,
    /// No progress possible until an external wake.
    Blocked,
    /// Task failed; the container is dropped. The error itself is owned by
    /// the task.
    Errored,
}

/// A unit of cooperatively scheduled work.
pub trait CooperativeTask: Send {
    fn poll(&mut self) -> PollOutcome;
}

/// Wraps a task with its runnable state. Created by [`Runtime::submit`],
/// destroyed when `poll` returns `Ready` or `Errored`.
pub struct TaskContainer {
    state: AtomicU8,
    task: Mutex<Box<dyn CooperativeTask>>,
}

impl TaskContainer {
    fn new(task: Box<dyn CooperativeTask>) -> Self {
        Self {
            state: AtomicU8::new(RUNNABLE),
            task: Mutex::new(task),
        }
    }

    fn poll(&self) -> PollOutcome {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        task.poll()
    }

    /// Claim the blocked slot. Fails iff a wake arrived since the current
    /// poll started (state moved to `AWAKING`).
    fn try_block(&self) -> bool {
        self.state
            .compare_exchange(RUNNABLE, BLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reset to runnable. Called before every poll, which also clears a
    /// leftover `AWAKING` mark once the task got its extra poll.
    fn set_runnable(&self) {
        self.state.store(RUNNABLE, Ordering::Release);
    }
}

#[derive(Default)]
struct TaskQueue {
    inner: Mutex<VecDeque<Arc<TaskContainer>>>,
}

impl TaskQueue {
    fn pop(&self) -> Option<Arc<TaskContainer>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn push(&self, task: Arc<TaskContainer>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
    }
}

/// Wake side of a task. Owned by whatever event source will unblock it.
#[derive(Clone)]
pub struct TaskHandle {
    container: Arc<TaskContainer>,
    queue: Arc<TaskQueue>,
}

impl TaskHandle {
    /// Wake the task. A parked task is re-enqueued; a task currently
    /// runnable (queued or mid-poll) is marked so the pending `try_block`
    /// claim fails and the runtime re-enqueues it instead of parking.
    pub fn wake(&self) {
        loop {
            match self.container.state.compare_exchange(
                BLOCKED,
                RUNNABLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.queue.push(self.container.clone());
                    return;
                }
                Err(RUNNABLE) => {
                    if self
                        .container
                        .state
                        .compare_exchange(RUNNABLE, AWAKING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // State changed between the two exchanges; retry.
                }
                Err(_) => return, // already AWAKING, an earlier wake marked it
            }
        }
    }
}

/// Single-threaded cooperative poller.
pub struct Runtime {
    queue: Arc<TaskQueue>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TaskQueue::default()),
        }
    }

    /// Add a task in the runnable state to the back of the queue. The
    /// returned handle wakes the task after it blocks.
    pub fn submit(&self, task: Box<dyn CooperativeTask>) -> TaskHandle {
        let container = Arc::new(TaskContainer::new(task));
        let handle = TaskHandle {
            container: container.clone(),
            queue: self.queue.clone(),
        };
        self.queue.push(container);
        handle
    }

    /// Poll tasks until `shutdown` fires. Cancellation abandons whatever is
    /// still queued; nothing is drained.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let Some(task) = self.queue.pop() else {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                continue;
            };
            task.set_runnable();
            match task.poll() {
                PollOutcome::Ready | PollOutcome::Errored => {}
                PollOutcome::Blocked => {
                    if !task.try_block() {
                        // A wake raced the poll; keep the task runnable.
                        self.queue.push(task);
                    }
                }
                PollOutcome::Pending => {
                    self.queue.push(task);
                }
            }
        }
    }
}

//! Task records and the pool queue.
//!
//! A [`Task`] is one admitted request, owned by value as it moves through
//! queueing, forwarding, and retries. Throttle requeue and retry requeue are
//! the same operation: [`TaskQueue::resubmit_after`] re-materializes the
//! task (same identity, fresh delay timer) at the back of the queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::http::request::ProxyRequest;
use crate::http::response::ResponseHandle;

/// One admitted proxy request.
#[derive(Debug)]
pub struct Task {
    pub request: ProxyRequest,
    /// Consumed exactly once. Absent for blind (fire-and-forget) tasks.
    pub handle: Option<ResponseHandle>,
    /// Remaining retry budget; decremented only on retryable failure.
    pub retries: u32,
    /// Opaque identifier for blind tasks, scoped by pool name.
    pub queue_id: Option<String>,
    pub enqueued_at: Instant,
}

impl Task {
    pub fn new(request: ProxyRequest, handle: Option<ResponseHandle>, retries: u32) -> Self {
        Self {
            request,
            handle,
            retries,
            queue_id: None,
            enqueued_at: Instant::now(),
        }
    }
}

/// Unbounded task queue shared by a pool's worker slots.
///
/// Depth is bounded at admission time by the pool's queue-depth ceiling, so
/// the channel itself never needs to apply backpressure.
#[derive(Debug)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue at the back of the queue.
    pub fn push(&self, task: Task) {
        // The receiver lives as long as the queue itself.
        let _ = self.tx.send(task);
    }

    /// Dequeue the next task. Workers share one receiver; the mutex hands
    /// tasks to whichever worker gets there first.
    pub async fn pop(&self) -> Option<Task> {
        self.rx.lock().await.recv().await
    }

    /// Resubmit this exact task after a delay. Shared by the throttle and
    /// retry paths.
    pub fn resubmit_after(self: &Arc<Self>, task: Task, delay: Duration) {
        if delay.is_zero() {
            self.push(task);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(task);
        });
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

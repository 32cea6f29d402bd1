//! Serial executor for all stream state and delegate callbacks.
//!
//! A [`WorkerQueue`] is a single spawned task draining an unbounded channel
//! of closures in FIFO order. Everything that touches stream state runs
//! here; transport and credentials callbacks arriving on foreign threads
//! must re-dispatch themselves before touching anything.
//!
//! A task-local marker identifies the queue a task is running on, which is
//! what makes [`WorkerQueue::dispatch_async`] able to fail fast on direct
//! re-entry and [`WorkerQueue::verify_is_current_queue`] usable as a
//! precondition at the top of state-sensitive methods.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a single-threaded FIFO executor.
///
/// Cheap to clone; the executor task exits once every handle is dropped and
/// the backlog has drained.
#[derive(Clone)]
pub struct WorkerQueue {
    id: u64,
    tx: mpsc::UnboundedSender<Task>,
}

impl WorkerQueue {
    /// Spawns the executor task on the current tokio runtime.
    pub fn new() -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        tokio::spawn(CURRENT_QUEUE.scope(id, async move {
            while let Some(task) = rx.recv().await {
                task();
            }
            trace!(queue_id = id, "worker queue drained, executor exiting");
        }));

        Self { id, tx }
    }

    /// True when the caller is executing inside one of this queue's tasks.
    pub fn is_current_queue(&self) -> bool {
        CURRENT_QUEUE
            .try_with(|current| *current == self.id)
            .unwrap_or(false)
    }

    /// Asserts the caller is on this queue.
    pub fn verify_is_current_queue(&self) {
        assert!(
            self.is_current_queue(),
            "expected to be running on worker queue {}",
            self.id
        );
    }

    /// Enqueues `task` to run after everything already queued.
    ///
    /// # Panics
    /// Panics when called from a task already running on this queue; such
    /// callers must use [`dispatch_async_allowing_same_queue`]
    /// (WorkerQueue::dispatch_async_allowing_same_queue) to make the
    /// re-entrancy explicit.
    pub fn dispatch_async(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) {
        assert!(
            !self.is_current_queue(),
            "dispatch_async re-entered worker queue {}",
            self.id
        );
        self.enqueue(Box::new(task));
    }

    /// Enqueues `task`, tolerating calls made from this queue itself.
    ///
    /// The task is still appended to the backlog; it never runs
    /// synchronously inside the caller.
    pub fn dispatch_async_allowing_same_queue(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) {
        self.enqueue(Box::new(task));
    }

    /// Enqueues `task` after `delay`. The returned handle cancels it; a
    /// cancelled task is a no-op even if the timer already fired and the
    /// task is sitting in the backlog.
    pub fn dispatch_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> DelayedTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let queue = self.clone();
        let timer_flag = Arc::clone(&cancelled);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timer_flag.load(Ordering::Acquire) {
                return;
            }
            let run_flag = Arc::clone(&timer_flag);
            queue.dispatch_async_allowing_same_queue(move || {
                if !run_flag.load(Ordering::Acquire) {
                    task();
                }
            });
        });

        DelayedTask { cancelled, handle }
    }

    fn enqueue(
        &self,
        task: Task,
    ) {
        if self.tx.send(task).is_err() {
            warn!(queue_id = self.id, "task dropped, worker queue executor is gone");
        }
    }
}

impl Default for WorkerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WorkerQueue").field("id", &self.id).finish()
    }
}

/// Cancellation handle for a task scheduled with
/// [`WorkerQueue::dispatch_after`].
#[derive(Debug)]
pub struct DelayedTask {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DelayedTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }
}

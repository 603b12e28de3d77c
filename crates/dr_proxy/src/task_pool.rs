use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

pub const DEFAULT_TASK_POOL_SIZE: usize = 1024;
pub const DEFAULT_TASK_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Bounded, self-recycling worker pool for short dispatch callbacks.
///
/// `submit` hands the task to an idle worker over a rendezvous channel,
/// spawns a new worker while below capacity, and otherwise blocks until a
/// worker frees up: capacity is a ceiling, not a growable queue. Idle
/// workers wait `idle_timeout` for the next task, then terminate and free
/// their slot.
pub struct TaskPool {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    live: Arc<AtomicUsize>,
    capacity: usize,
    idle_timeout: Duration,
}

impl TaskPool {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_TASK_POOL_SIZE
        } else {
            capacity
        };
        let idle_timeout = if idle_timeout.is_zero() {
            DEFAULT_TASK_POOL_IDLE_TIMEOUT
        } else {
            idle_timeout
        };

        // Rendezvous channel: a send succeeds only by handing the task
        // directly to a waiting worker.
        let (tx, rx) = flume::bounded(0);
        Self {
            tx,
            rx,
            live: Arc::new(AtomicUsize::new(0)),
            capacity,
            idle_timeout,
        }
    }

    pub fn submit(&self, task: Task) {
        let task = match self.tx.try_send(task) {
            Ok(()) => return,
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task,
        };

        if self.try_claim_slot() {
            self.spawn_worker(task);
            return;
        }

        // At capacity with no idle worker: block until one picks it up.
        let _ = self.tx.send(task);
    }

    pub fn worker_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    fn try_claim_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .is_ok()
    }

    fn spawn_worker(&self, first_task: Task) {
        let rx = self.rx.clone();
        let live = Arc::clone(&self.live);
        let idle_timeout = self.idle_timeout;
        std::thread::spawn(move || {
            first_task();
            loop {
                match rx.recv_timeout(idle_timeout) {
                    Ok(task) => task(),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            live.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::JudgeError;
use crate::task::JudgeTask;

/// Producer side of the shared task queue. Pushing waits while the queue
/// is full.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<JudgeTask>,
}

impl WorkQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<JudgeTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn push(&self, task: JudgeTask) -> Result<(), JudgeError> {
        self.tx
            .send(task)
            .await
            .map_err(|_| JudgeError::system("worker pool has shut down"))
    }
}

/// Fixed set of workers draining the queue, one task at a time each.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` workers. The pool stops once every
    /// [`WorkQueue`] handle is dropped and the queue is drained.
    pub fn start(concurrency: usize, capacity: usize) -> (WorkQueue, Self) {
        let (queue, rx) = WorkQueue::bounded(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..concurrency.max(1))
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&rx))))
            .collect();
        (queue, Self { workers })
    }

    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(worker: usize, rx: Arc<Mutex<mpsc::Receiver<JudgeTask>>>) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(task) = next else {
            debug!(worker, "task queue closed, worker exiting");
            return;
        };
        let rid = task.rid().to_string();
        // A panicking task must not take the worker down with it.
        if let Err(e) = tokio::spawn(task.handle()).await {
            error!(worker, rid = %rid, "judge task panicked: {e}");
        }
    }
}

//! FIFO queue of pending executions shared by every supervisor.
//!
//! One unbounded mpsc channel; the receiver sits behind a fair async mutex so
//! any number of idle supervisors can wait on it and the first in line gets
//! the next job.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::instance::Job;

#[derive(Clone)]
pub(crate) struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    closed: CancellationToken,
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closed: CancellationToken::new(),
        }
    }

    /// Appends a job. Hands it back if the queue is closed.
    pub fn push(&self, job: Job) -> Result<(), Job> {
        if self.closed.is_cancelled() {
            return Err(job);
        }
        self.sender.send(job).map_err(|e| e.0)
    }

    /// Waits for the next job. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Job> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            job = async { self.receiver.lock().await.recv().await } => job,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the queue and fails every job still in it with `reason`.
    ///
    /// Returns how many jobs were rejected.
    pub async fn close(&self, reason: fn() -> String) -> usize {
        self.closed.cancel();
        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut rejected = 0;
        while let Ok(job) = receiver.try_recv() {
            job.reject(reason());
            rejected += 1;
        }
        rejected
    }
}

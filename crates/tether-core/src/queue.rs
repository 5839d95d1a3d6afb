//! Serialized work queue.
//!
//! Each broker subsystem owns one [`WorkQueue`]: an unbounded channel
//! drained by a single spawned task, so posted jobs run one at a time in
//! arrival order. Death notifications, deferred completions, and restart
//! delays all go through here instead of mutating state on the thread that
//! observed the event.
//!
//! Requires a tokio runtime; construct queues from within one.

use tokio::sync::mpsc;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-consumer job queue with FIFO execution.
pub struct WorkQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Creates a queue and spawns its drain task on the current runtime.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!(queue = name, "work queue drained and closed");
        });
        Self { name, tx }
    }

    /// Posts a job. Jobs run in post order on the queue's drain task.
    ///
    /// Posting after the runtime shut down drops the job; there is nothing
    /// left to run it against.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            trace!(queue = self.name, "dropping job posted to closed queue");
        }
    }

    /// Queue name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let queue = WorkQueue::new("test");
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            queue.post(move || log.lock().unwrap().push(i));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_posts_from_many_threads_all_run() {
        let queue = Arc::new(WorkQueue::new("test"));
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let hits = Arc::clone(&hits);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    let hits = Arc::clone(&hits);
                    queue.post(move || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }
}

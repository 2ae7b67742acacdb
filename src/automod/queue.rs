//! Per-guild execution queue
//!
//! Jobs run one at a time in the order they were added. A job is only
//! started after the previous one finished, awaits included, which is what
//! keeps evaluation of one guild from racing against itself.

use crate::automod::error::{AutomodError, AutomodResult};
use poise::serenity_prelude::GuildId;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum QueueMessage {
    Run { generation: u64, job: Job },
    Shutdown,
}

/// FIFO, single-flight job runner owned by one guild engine
pub struct ExecutionQueue {
    guild_id: GuildId,
    tx: mpsc::UnboundedSender<QueueMessage>,
    /// Jobs added before the current generation are discarded
    generation: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl ExecutionQueue {
    /// Create the queue and spawn its worker
    #[must_use]
    pub fn new(guild_id: GuildId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        tokio::spawn(worker(guild_id, rx, Arc::clone(&generation)));
        Self {
            guild_id,
            tx,
            generation,
            closed: AtomicBool::new(false),
        }
    }

    /// Append a job
    ///
    /// # Errors
    /// `QueueClosed` once the queue was shut down.
    pub fn add<F>(&self, job: F) -> AutomodResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(AutomodError::QueueClosed);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.tx
            .send(QueueMessage::Run {
                generation,
                job: Box::pin(job),
            })
            .map_err(|_| AutomodError::QueueClosed)
    }

    /// Append a job and wait for its output
    ///
    /// # Errors
    /// `QueueClosed` if the queue is shut down, or the job is cleared or
    /// panics before producing a value.
    pub async fn run<F, T>(&self, job: F) -> AutomodResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.add(async move {
            let _ = tx.send(job.await);
        })?;
        rx.await.map_err(|_| AutomodError::QueueClosed)
    }

    /// Discard every job that has not started yet
    pub fn clear(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(guild_id = %self.guild_id, generation, "Execution queue cleared");
    }

    /// Discard pending jobs and stop the worker after the in-flight one
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear();
        let _ = self.tx.send(QueueMessage::Shutdown);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(
    guild_id: GuildId,
    mut rx: mpsc::UnboundedReceiver<QueueMessage>,
    generation: Arc<AtomicU64>,
) {
    debug!(guild_id = %guild_id, "Execution queue worker started");

    while let Some(message) = rx.recv().await {
        match message {
            QueueMessage::Run {
                generation: added_in,
                job,
            } => {
                if added_in < generation.load(Ordering::SeqCst) {
                    continue;
                }
                // A panicking job must not take the worker down with it
                if let Err(e) = tokio::spawn(job).await {
                    error!(guild_id = %guild_id, error = %e, "Execution queue job panicked");
                }
            }
            QueueMessage::Shutdown => break,
        }
    }

    info!(guild_id = %guild_id, "Execution queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn queue() -> ExecutionQueue {
        ExecutionQueue::new(GuildId::new(1))
    }

    #[tokio::test]
    async fn test_jobs_run_in_order_one_at_a_time() {
        let queue = queue();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (index, delay) in [(1, 30), (2, 0), (3, 10)] {
            let log = Arc::clone(&log);
            queue
                .add(async move {
                    log.lock().unwrap().push(format!("start {index}"));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    log.lock().unwrap().push(format!("end {index}"));
                })
                .unwrap();
        }
        queue.run(async {}).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let queue = queue();
        assert_eq!(queue.run(async { 6 * 7 }).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_clear_discards_pending_jobs() {
        let queue = queue();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));

        queue
            .add(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        let flag = Arc::clone(&ran);
        queue
            .add(async move { flag.store(true, Ordering::SeqCst) })
            .unwrap();

        started_rx.await.unwrap();
        queue.clear();
        let _ = release_tx.send(());
        queue.run(async {}).await.unwrap();

        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let queue = queue();
        queue.add(async { panic!("job failure") }).unwrap();
        assert_eq!(queue.run(async { "alive" }).await.unwrap(), "alive");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let queue = queue();
        queue.shutdown();
        assert!(queue.is_closed());
        assert!(matches!(queue.add(async {}), Err(AutomodError::QueueClosed)));
        assert!(matches!(
            queue.run(async { 1 }).await,
            Err(AutomodError::QueueClosed)
        ));
    }
}

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Bounded set of concurrently running tasks that report into a shared result channel.
///
/// Admission is FIFO: [`WorkerPool::spawn`] waits for a free slot before starting the task.
/// A task keeps its slot until its result has been handed to the channel, so a slow consumer
/// throttles the producer instead of piling up results in memory. Dropping the pool detaches
/// the tasks that are still running, they finish on their own.
pub struct WorkerPool<T> {
    permits: Arc<tokio::sync::Semaphore>,
    tasks: tokio::task::JoinSet<()>,
    results: mpsc::Sender<T>,
    size: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(size: usize, results: mpsc::Sender<T>) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(size)),
            tasks: tokio::task::JoinSet::new(),
            results,
            size,
        }
    }

    /// One worker per core, keeping one core for the producer and the aggregator.
    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|cores| cores.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub async fn spawn<F>(&mut self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("worker pool is closed")?;
        self.reap()?;
        let results = self.results.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            if results.send(result).await.is_err() {
                tracing::debug!("result dropped, nobody is listening anymore");
            }
            drop(permit);
        });
        Ok(())
    }

    fn reap(&mut self) -> Result<()> {
        while let Some(res) = self.tasks.try_join_next() {
            res.context("worker task failed")?;
        }
        Ok(())
    }

    /// Waits for every spawned task; the result channel closes once the pool is gone.
    pub async fn join(mut self) -> Result<()> {
        while let Some(res) = self.tasks.join_next().await {
            res.context("worker task failed")?;
        }
        Ok(())
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!("detaching {} running task(s)", self.tasks.len());
        }
        self.tasks.detach_all();
    }
}

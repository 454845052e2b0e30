use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backend::Backend;
use crate::error::Error;
use crate::pool::WorkerPool;
use crate::reporter::Reporter;
use crate::resume::ResumeFilter;
use crate::session::DataReader;
use crate::transfer::TransferUnit;

/// Outcome of one dispatched unit, `seq` is its position in dispatch order.
#[derive(Debug)]
pub struct TaskResult {
    pub seq: u64,
    pub unit: TransferUnit,
    /// Bytes read from the source before the transfer finished or failed.
    pub streamed: u64,
    pub result: Result<(), Error>,
}

/// Streams the task log and transfers every unit a previous run did not complete.
pub struct Executor<B> {
    backend: Arc<B>,
    reporter: Arc<Reporter>,
    throttle: Arc<throttle::Throttle>,
    pool_size: usize,
}

async fn transfer_unit<B: Backend>(
    backend: &B,
    reporter: &Reporter,
    throttle: &throttle::Throttle,
    unit: &TransferUnit,
    streamed: Arc<AtomicU64>,
) -> Result<(), Error> {
    let _open_files = throttle.open_file_permit().await;
    reporter.set_caption(unit.source_url());
    let (reader, size) = backend
        .get_source(unit.source_url())
        .await
        .map_err(|error| Error::new(error, [unit.source_url()]))?;
    reporter.dispatched(unit);
    throttle.io_tokens(size).await;
    let reader = reporter.wrap(reader, streamed);
    let targets = unit.target_urls();
    let result = backend.put_targets(&targets, size, reader).await;
    result.map_err(|error| Error::new(error, targets))
}

#[instrument(skip(backend, reporter, throttle, unit), fields(source = unit.source_url()))]
async fn transfer<B: Backend>(
    backend: Arc<B>,
    reporter: Arc<Reporter>,
    throttle: Arc<throttle::Throttle>,
    seq: u64,
    unit: TransferUnit,
) -> TaskResult {
    let streamed = Arc::new(AtomicU64::new(0));
    let result =
        transfer_unit(backend.as_ref(), &reporter, &throttle, &unit, streamed.clone()).await;
    if let Err(error) = &result {
        tracing::debug!("transfer failed: {error}");
    }
    TaskResult {
        seq,
        unit,
        streamed: streamed.load(Ordering::Relaxed),
        result,
    }
}

impl<B: Backend> Executor<B> {
    pub fn new(
        backend: Arc<B>,
        reporter: Arc<Reporter>,
        throttle: Arc<throttle::Throttle>,
        pool_size: usize,
    ) -> Self {
        Self {
            backend,
            reporter,
            throttle,
            pool_size,
        }
    }

    /// Replays units up to `last_copied`, dispatches the rest and waits for them.
    ///
    /// Returns as soon as `stop` fires, tasks already running are left to finish on their own.
    /// The result channel closes once every dispatched task has reported.
    pub async fn run(
        &self,
        mut reader: DataReader,
        last_copied: &str,
        results: mpsc::Sender<TaskResult>,
        stop: CancellationToken,
    ) -> Result<()> {
        let mut filter = ResumeFilter::new(last_copied);
        let mut pool = WorkerPool::new(self.pool_size, results);
        tracing::debug!("dispatching through {} worker(s)", pool.size());
        let mut seq = 0u64;
        loop {
            let unit = tokio::select! {
                biased;
                () = stop.cancelled() => {
                    tracing::info!("dispatch stopped after {seq} unit(s)");
                    return Ok(());
                }
                unit = reader.next_unit() => unit?,
            };
            let Some(unit) = unit else {
                break;
            };
            if filter.is_copied(unit.source_url()) {
                self.reporter.replay(unit.size());
                continue;
            }
            let task = transfer(
                self.backend.clone(),
                self.reporter.clone(),
                self.throttle.clone(),
                seq,
                unit,
            );
            let stopped = tokio::select! {
                biased;
                () = stop.cancelled() => true,
                spawned = pool.spawn(task) => {
                    spawned?;
                    false
                }
            };
            if stopped {
                tracing::info!(
                    "dispatch stopped after {seq} unit(s), {} still in flight",
                    pool.in_flight()
                );
                return Ok(());
            }
            seq += 1;
        }
        if !filter.found() {
            return Err(anyhow!(
                "checkpoint {last_copied:?} not found in task log, the session is inconsistent"
            ));
        }
        tracing::debug!("dispatched {seq} unit(s), waiting for them to finish");
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                tracing::info!("stopped while waiting for dispatched transfers");
                Ok(())
            }
            joined = pool.join() => joined,
        }
    }
}

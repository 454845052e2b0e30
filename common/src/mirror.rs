use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::aggregator::{Outcome, aggregate};
use crate::backend::Backend;
use crate::config::OutputConfig;
use crate::executor::Executor;
use crate::pool::WorkerPool;
use crate::prepare::{PrepareOutcome, prepare_session};
use crate::reporter::Reporter;
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    pub output: OutputConfig,
    /// Concurrent transfers, defaults to one per core minus one.
    pub max_jobs: Option<usize>,
}

impl Settings {
    pub fn pool_size(&self) -> usize {
        self.max_jobs
            .filter(|jobs| *jobs > 0)
            .unwrap_or_else(WorkerPool::<()>::default_size)
    }
}

async fn execute<B: Backend>(
    session: &mut Session,
    backend: Arc<B>,
    throttle: Arc<throttle::Throttle>,
    settings: &Settings,
    interrupt: &CancellationToken,
) -> Result<Outcome> {
    let total_bytes = u64::try_from(session.header.total_bytes).unwrap_or(0);
    let total_objects = u64::try_from(session.header.total_objects).unwrap_or(0);
    let reporter = Arc::new(Reporter::new(&settings.output, total_bytes, total_objects));
    let pool_size = settings.pool_size();
    tracing::info!("mirroring {total_objects} object(s) with {pool_size} worker(s)");
    let executor = Executor::new(backend, reporter.clone(), throttle, pool_size);
    let reader = session.data_reader().await?;
    let last_copied = session.header.last_copied.clone();
    let stop = interrupt.child_token();
    let (results_tx, results_rx) = mpsc::channel(pool_size * 2);
    let executed = async {
        let executed = executor.run(reader, &last_copied, results_tx, stop.clone()).await;
        if executed.is_err() {
            stop.cancel();
        }
        executed
    };
    let aggregated = async {
        let aggregated = aggregate(session, &reporter, results_rx, interrupt, &stop).await;
        if aggregated.is_err() {
            stop.cancel();
        }
        aggregated
    };
    let (executed, aggregated) = tokio::join!(executed, aggregated);
    let outcome = aggregated?;
    reporter.finish();
    match (executed, outcome) {
        (Err(error), _) => {
            session.close().await?;
            Ok(Outcome::Failed(error))
        }
        (Ok(()), Outcome::Completed(summary)) => {
            session.delete().await?;
            Ok(Outcome::Completed(summary))
        }
        (Ok(()), outcome) => Ok(outcome),
    }
}

async fn run_session<B: Backend>(
    session: &mut Session,
    backend: Arc<B>,
    throttle: Arc<throttle::Throttle>,
    settings: &Settings,
    interrupt: &CancellationToken,
) -> Result<Outcome> {
    if session.has_data().await? {
        tracing::info!(
            "resuming session {} from {:?}",
            session.id(),
            session.header.last_copied
        );
    } else {
        let prepared =
            prepare_session(session, backend.clone(), &throttle, &settings.output, interrupt)
                .await?;
        if prepared == PrepareOutcome::Interrupted {
            return Ok(Outcome::Interrupted { resumable: false });
        }
    }
    execute(session, backend, throttle, settings, interrupt).await
}

/// Runs a session to completion, preparing its task log first when there is none.
///
/// The session is deleted once every unit was processed. On a fatal error or an interrupt it
/// is saved with its checkpoint and can be resumed later.
#[instrument(skip_all, fields(session = session.id()))]
pub async fn mirror<B: Backend>(
    mut session: Session,
    backend: Arc<B>,
    throttle: Arc<throttle::Throttle>,
    settings: &Settings,
    interrupt: CancellationToken,
) -> Result<Outcome> {
    let replenish = {
        let throttle = throttle.clone();
        tokio::spawn(async move { throttle.run_replenish().await })
    };
    let outcome = run_session(&mut session, backend, throttle, settings, &interrupt).await;
    replenish.abort();
    outcome
}

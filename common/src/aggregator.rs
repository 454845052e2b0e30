use anyhow::Result;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::ErrorClass;
use crate::executor::TaskResult;
use crate::progress::Summary;
use crate::reporter::Reporter;
use crate::session::Session;

#[derive(Debug)]
pub enum Outcome {
    /// Every unit was processed, the session can be deleted.
    Completed(Summary),
    /// A run-fatal error stopped the run, the session was saved for a resume.
    Failed(anyhow::Error),
    /// The run was interrupted; `resumable` is false when nothing was left to resume.
    Interrupted { resumable: bool },
}

/// Tracks which dispatched units are resolved and how far the checkpoint may advance.
///
/// Results arrive in completion order. The checkpoint only moves past a unit once every unit
/// dispatched before it is resolved, so it never skips over a transfer still in flight.
#[derive(Debug, Default)]
pub struct Watermark {
    next: u64,
    resolved: BTreeMap<u64, Option<String>>,
}

impl Watermark {
    /// Records the resolution of unit `seq`; `marker` is its source URL when it succeeded.
    ///
    /// Returns the new checkpoint when the contiguous resolved prefix gained a success.
    pub fn resolve(&mut self, seq: u64, marker: Option<String>) -> Option<String> {
        self.resolved.insert(seq, marker);
        let mut advanced = None;
        while let Some(marker) = self.resolved.remove(&self.next) {
            self.next += 1;
            if marker.is_some() {
                advanced = marker;
            }
        }
        advanced
    }

    /// Units resolved out of order, waiting for an earlier one.
    pub fn pending(&self) -> usize {
        self.resolved.len()
    }
}

async fn checkpoint(session: &mut Session, marker: Option<String>) -> Result<()> {
    if let Some(marker) = marker {
        tracing::trace!("checkpoint at {marker:?}");
        session.header.last_copied = marker;
        session.save().await?;
    }
    Ok(())
}

/// Single consumer of transfer results: persists checkpoints and applies the error policy.
///
/// Cancels `stop` when the run must end early. An `interrupt` or a `stop` raised elsewhere
/// closes the session and yields [`Outcome::Interrupted`].
#[instrument(skip_all, fields(session = session.id()))]
pub async fn aggregate(
    session: &mut Session,
    reporter: &Reporter,
    mut results: mpsc::Receiver<TaskResult>,
    interrupt: &CancellationToken,
    stop: &CancellationToken,
) -> Result<Outcome> {
    let mut watermark = Watermark::default();
    loop {
        let result = tokio::select! {
            biased;
            () = interrupt.cancelled() => {
                tracing::info!("interrupted, {} result(s) resolved out of order", watermark.pending());
                stop.cancel();
                session.close().await?;
                return Ok(Outcome::Interrupted { resumable: true });
            }
            () = stop.cancelled() => {
                session.close().await?;
                return Ok(Outcome::Interrupted { resumable: true });
            }
            result = results.recv() => result,
        };
        let Some(TaskResult {
            seq,
            unit,
            streamed,
            result,
        }) = result
        else {
            break;
        };
        match result {
            Ok(()) => {
                reporter.mirrored(unit.size());
                let marker = watermark.resolve(seq, Some(unit.source_url().to_string()));
                checkpoint(session, marker).await?;
            }
            Err(error) => {
                reporter.failed(unit.size(), streamed);
                reporter.error(&error);
                match error.class() {
                    ErrorClass::Skip => {
                        let marker = watermark.resolve(seq, None);
                        checkpoint(session, marker).await?;
                    }
                    ErrorClass::Fatal => {
                        tracing::error!("stopping on fatal error: {error}");
                        stop.cancel();
                        session.close().await?;
                        return Ok(Outcome::Failed(error.into()));
                    }
                }
            }
        }
    }
    Ok(Outcome::Completed(reporter.finish()))
}

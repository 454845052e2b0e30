//! Turns the source tree into the session task log.
//!
//! [`prepare_mirror_urls`] walks the source and maps every object onto its target URLs.
//! [`prepare_session`] drains that stream into the task log and commits the totals to the
//! session header. Preparation runs at most once per session: a header with the `Prepared`
//! flag and an existing log make later runs go straight to execution.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backend::{Backend, SourceEntry};
use crate::config::OutputConfig;
use crate::error::{ClientError, Error};
use crate::reporter::ScanIndicator;
use crate::session::Session;
use crate::transfer::TransferUnit;

const PREPARE_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    Prepared,
    /// Preparation was interrupted and the session was discarded.
    Interrupted,
}

async fn to_unit<B: Backend>(
    backend: &B,
    targets: &[String],
    entry: SourceEntry,
    force: bool,
) -> Result<TransferUnit, Error> {
    let target_urls: Vec<String> = targets
        .iter()
        .map(|target| backend.join(target, &entry.relative))
        .collect();
    if !force {
        for url in &target_urls {
            let exists = backend
                .exists(url)
                .await
                .map_err(|error| Error::new(error, [url.as_str()]))?;
            if exists {
                return Err(Error::new(
                    ClientError::TargetExists { path: url.clone() },
                    [entry.url],
                ));
            }
        }
    }
    Ok(TransferUnit::new(entry.url, entry.size, target_urls))
}

/// Lazily enumerates `source` into transfer units, one per object, in walk order.
///
/// Objects that cannot be mirrored are reported as errors in place of their unit. The
/// enumeration stops early when the receiver is dropped.
pub fn prepare_mirror_urls<B: Backend>(
    backend: Arc<B>,
    source: String,
    targets: Vec<String>,
    force: bool,
) -> mpsc::Receiver<Result<TransferUnit, Error>> {
    let (units_tx, units_rx) = mpsc::channel(PREPARE_QUEUE);
    tokio::spawn(async move {
        let (entries_tx, mut entries_rx) = mpsc::channel(PREPARE_QUEUE);
        let walk = backend.walk(&source, entries_tx);
        let map = {
            let backend = backend.clone();
            let source = source.clone();
            async move {
                while let Some(entry) = entries_rx.recv().await {
                    let item = match entry {
                        Ok(entry) => to_unit(backend.as_ref(), &targets, entry, force).await,
                        Err(error) => Err(Error::new(error, [source.as_str()])),
                    };
                    if units_tx.send(item).await.is_err() {
                        tracing::debug!("units receiver dropped, stopping enumeration");
                        break;
                    }
                }
            }
        };
        tokio::join!(walk, map);
    });
    units_rx
}

/// Writes the task log; `None` when interrupted.
async fn write_log(
    session: &Session,
    mut units: mpsc::Receiver<Result<TransferUnit, Error>>,
    throttle: &throttle::Throttle,
    scan: &ScanIndicator,
    interrupt: &CancellationToken,
) -> Result<Option<(u64, u64)>> {
    let mut writer = session.data_writer().await?;
    let (mut bytes, mut objects) = (0u64, 0u64);
    loop {
        let next = async {
            throttle.ops_token().await;
            units.recv().await
        };
        let item = tokio::select! {
            biased;
            () = interrupt.cancelled() => return Ok(None),
            item = next => item,
        };
        match item {
            None => break,
            Some(Ok(unit)) => {
                writer.append(&unit).await?;
                bytes += unit.size();
                objects += 1;
                scan.inc();
            }
            Some(Err(error)) => {
                tracing::warn!("skipping {error}");
                scan.error(&error);
            }
        }
    }
    writer.finish().await?;
    Ok(Some((bytes, objects)))
}

/// Materializes the task log of a fresh session and commits its totals.
///
/// The session is deleted when preparation is interrupted or fails, there is nothing to resume.
#[instrument(skip_all, fields(session = session.id()))]
pub async fn prepare_session<B: Backend>(
    session: &mut Session,
    backend: Arc<B>,
    throttle: &throttle::Throttle,
    output: &OutputConfig,
    interrupt: &CancellationToken,
) -> Result<PrepareOutcome> {
    let source = session
        .header
        .source()
        .ok_or_else(|| anyhow!("session {} has no source", session.id()))?
        .to_string();
    let targets = session.header.targets().to_vec();
    if targets.is_empty() {
        return Err(anyhow!("session {} has no targets", session.id()));
    }
    let force = session.header.flag("force");
    tracing::info!("preparing {source:?} -> {targets:?}");
    let units = prepare_mirror_urls(backend, source, targets, force);
    let scan = ScanIndicator::new(output);
    let written = write_log(session, units, throttle, &scan, interrupt).await;
    scan.finish();
    match written {
        Ok(Some((bytes, objects))) => {
            session.header.total_bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
            session.header.total_objects = i64::try_from(objects).unwrap_or(i64::MAX);
            session.header.prepared = true;
            session
                .save()
                .await
                .context("failed committing the prepared session")?;
            tracing::info!("prepared {objects} object(s), {bytes} byte(s)");
            Ok(PrepareOutcome::Prepared)
        }
        Ok(None) => {
            tracing::info!("preparation interrupted, discarding session");
            session.delete().await?;
            Ok(PrepareOutcome::Interrupted)
        }
        Err(error) => {
            if let Err(delete_error) = session.delete().await {
                tracing::error!("failed discarding session: {delete_error:#}");
            }
            Err(error)
        }
    }
}

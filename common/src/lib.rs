//! Common library for the `mirror` tool
//!
//! This crate implements resumable mirroring of a tree of objects from one source into one or
//! more targets. A run is organized around a persistent [`Session`]:
//!
//! 1. **Preparation** - the source is walked once and every object becomes a [`TransferUnit`] in
//!    the session's append-only task log, together with the total byte and object counts
//! 2. **Execution** - the task log is streamed in order; units covered by the session checkpoint
//!    are replayed for accounting only, the remaining ones are transferred by a bounded pool of
//!    workers
//! 3. **Aggregation** - a single consumer collects the worker results, persists the checkpoint
//!    after every success and decides whether the run continues
//!
//! # Failure handling
//!
//! Well-known filesystem conditions (missing paths, broken symlinks, insufficient permissions,
//! existing targets without `--force`) are reported and skipped. Any other error stops the run,
//! saves the session and reports [`Outcome::Failed`]. An interrupt (SIGINT or SIGTERM) saves the
//! session the same way. A saved session continues where it left off with `mirror --resume ID`.
//!
//! # Checkpoints
//!
//! The checkpoint is the source URL of the last unit known to be mirrored. Workers complete in
//! any order, so the checkpoint only advances over a contiguous prefix of dispatched units: a
//! transfer still in flight is never skipped by a resume. Units that completed after such a gap
//! are transferred again on resume, which overwrites the targets with identical content.
//!
//! # Output
//!
//! The [`OutputMode`] selects between an interactive progress bar, JSON lines and plain text.
//! Every run ends with one accounting line: `Total: X, Transferred: Y, Speed: Z/s`.

use anyhow::Context;
use tokio_util::sync::CancellationToken;

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod message;
pub mod mirror;
pub mod pool;
pub mod prepare;
pub mod progress;
pub mod reporter;
pub mod resume;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use aggregator::Outcome;
pub use backend::{Backend, FsBackend};
pub use config::{OutputConfig, OutputMode, RuntimeConfig, ThrottleConfig};
pub use error::{ClientError, Error, ErrorClass};
pub use mirror::{Settings as MirrorSettings, mirror};
pub use progress::Summary;
pub use session::{Session, SessionHeader, default_session_dir};
pub use transfer::TransferUnit;

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    let initialized = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if let Err(error) = initialized {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// Returns a token that is cancelled on SIGINT or SIGTERM; must be called within a runtime.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(error) => {
                    tracing::error!("cannot install SIGTERM handler: {error}");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                    return;
                }
            };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(error) = res {
                    tracing::error!("cannot listen for SIGINT: {error}");
                    return;
                }
                tracing::info!("received SIGINT");
            }
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
        cancel.cancel();
    });
    token
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed to create the tokio runtime")
}

/// Sets up logging and the runtime, then runs `func` to completion.
///
/// Errors are logged and turned into `None`, callers exit with a failure status then.
pub fn run<Fut, T>(
    output: &OutputConfig,
    runtime: &RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(output);
    let runtime = match build_runtime(runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::debug!("run failed: {:#}", error);
            eprintln!("mirror: {error:#}");
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!("run failed: {:#}", error);
            eprintln!("mirror: {error:#}");
            None
        }
    }
}

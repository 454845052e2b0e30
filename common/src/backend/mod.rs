//! Storage backends the mirror engine reads from and writes to.
//!
//! The engine only needs four capabilities from a storage location: stream an object out,
//! stream one object into several targets at once, enumerate a tree and test for existence.
//! [`FsBackend`] implements them for the local filesystem; object stores plug in through the
//! same [`Backend`] trait.

use std::future::Future;
use tokio::sync::mpsc;

use crate::error::ClientError;

mod fs;

pub use fs::FsBackend;

pub type BoxedRead = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// A leaf object found while walking a source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub url: String,
    /// Path of the object below the walked root, `/` separated.
    pub relative: String,
    pub size: u64,
}

pub trait Backend: Send + Sync + 'static {
    /// Opens `url` for reading, returns the stream and the number of bytes it will yield.
    fn get_source(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(BoxedRead, u64), ClientError>> + Send;

    /// Writes `size` bytes read from `reader` into every URL in `urls`, replacing existing
    /// content.
    fn put_targets(
        &self,
        urls: &[String],
        size: u64,
        reader: BoxedRead,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Sends every leaf object under `root` in a deterministic order. Per-entry failures are
    /// sent as errors and the walk continues. Returns early once the receiver is dropped.
    fn walk(
        &self,
        root: &str,
        entries: mpsc::Sender<Result<SourceEntry, ClientError>>,
    ) -> impl Future<Output = ()> + Send;

    fn exists(&self, url: &str) -> impl Future<Output = Result<bool, ClientError>> + Send;

    /// URL of `relative` under the target root `root`.
    fn join(&self, root: &str, relative: &str) -> String;
}

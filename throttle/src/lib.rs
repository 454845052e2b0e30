//! Resource throttling for mirror sessions
//!
//! A [`Throttle`] bundles three independent limits that the mirror engine consults while it
//! enumerates and transfers objects:
//!
//! 1. **Open files** - caps the number of transfers holding source/target handles at once
//! 2. **Operations** - caps the number of enumerated entries per second
//! 3. **I/O operations** - caps transferred chunks per second, where an object of `size` bytes
//!    costs `⌈size / chunk_size⌉` tokens
//!
//! Each limit is a token bucket; a limit configured as `0` is disabled and never blocks.
//! Operation and I/O buckets are refilled by [`Throttle::run_replenish`], which is expected to
//! be spawned for the lifetime of a session:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let throttle = Arc::new(throttle::Throttle::new(&throttle::Settings {
//!     max_open_files: 256,
//!     ops_per_second: 1000,
//!     iops_per_second: 0,
//!     chunk_size: 0,
//! }));
//! let replenish = {
//!     let throttle = throttle.clone();
//!     tokio::spawn(async move { throttle.run_replenish().await })
//! };
//! throttle.ops_token().await;
//! let _guard = throttle.open_file_permit().await;
//! // open files here - the permit is released when the guard is dropped
//! replenish.abort();
//! # }
//! ```
//!
//! # Replenishment
//!
//! Buckets are refilled ten times per second when the configured rate allows it, otherwise a
//! single token is added every `1s / rate`. Rates that are not a multiple of ten are rounded
//! down to the nearest achievable rate.

mod semaphore;

pub use semaphore::Semaphore;

/// Limits applied to a single session, `0` disables the corresponding limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub max_open_files: usize,
    pub ops_per_second: usize,
    pub iops_per_second: usize,
    pub chunk_size: u64,
}

#[derive(Debug)]
pub struct Throttle {
    open_files: Semaphore,
    ops: Semaphore,
    iops: Semaphore,
    ops_per_second: usize,
    iops_per_second: usize,
    chunk_size: u64,
}

pub struct OpenFileGuard<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        let per_second = u32::try_from(per_second.max(1)).unwrap_or(1);
        (1, std::time::Duration::from_secs(1) / per_second)
    }
}

/// Number of tokens an object of `size` bytes costs when moved in `chunk_size` pieces.
pub fn io_tokens_for(chunk_size: u64, size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, size) - 1) / chunk_size
}

impl Throttle {
    pub fn new(settings: &Settings) -> Self {
        let iops_per_second = if settings.chunk_size == 0 {
            if settings.iops_per_second > 0 {
                tracing::warn!("iops throttle ignored, chunk size is not set");
            }
            0
        } else {
            settings.iops_per_second
        };
        Self {
            open_files: Semaphore::new(settings.max_open_files),
            ops: Semaphore::new(replenish_burst(settings.ops_per_second)),
            iops: Semaphore::new(replenish_burst(iops_per_second)),
            ops_per_second: settings.ops_per_second,
            iops_per_second,
            chunk_size: settings.chunk_size,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&Settings::default())
    }

    pub async fn open_file_permit(&self) -> OpenFileGuard<'_> {
        OpenFileGuard {
            _permit: self.open_files.acquire().await,
        }
    }

    pub async fn ops_token(&self) {
        self.ops.consume().await;
    }

    pub async fn io_tokens(&self, size: u64) {
        let tokens = io_tokens_for(self.chunk_size, size);
        if tokens == 0 {
            return;
        }
        match u32::try_from(tokens) {
            Ok(tokens) => self.iops.consume_many(tokens).await,
            Err(_) => tracing::error!(
                "chunk size: {} is too small to limit throughput for objects this big, size: {}",
                self.chunk_size,
                size,
            ),
        }
    }

    /// Refills the operation and I/O buckets, never returns while any of them is enabled.
    pub async fn run_replenish(&self) {
        let ops = async {
            if self.ops.is_enabled() {
                let (tokens, interval) = replenish_schedule(self.ops_per_second);
                self.ops.run_replenish(tokens, interval).await;
            }
        };
        let iops = async {
            if self.iops.is_enabled() {
                let (tokens, interval) = replenish_schedule(self.iops_per_second);
                self.iops.run_replenish(tokens, interval).await;
            }
        };
        tokio::join!(ops, iops);
    }
}

fn replenish_burst(per_second: usize) -> usize {
    if per_second == 0 {
        return 0;
    }
    replenish_schedule(per_second).0
}

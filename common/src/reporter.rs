use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::AsyncRead;

use crate::backend::BoxedRead;
use crate::config::{OutputConfig, OutputMode};
use crate::error::Error;
use crate::message::{ErrorMessage, Message, MirrorMessage, StatMessage};
use crate::progress::{Progress, Summary};
use crate::transfer::TransferUnit;

const BAR_TEMPLATE: &str =
    "{msg:30!} {wide_bar} {bytes}/{total_bytes} {binary_bytes_per_sec} eta {eta}";
const SCAN_TEMPLATE: &str = "{spinner} {msg} {pos} objects";
const REFRESH_HZ: u8 = 5;

fn print(
    bar: Option<&indicatif::ProgressBar>,
    mode: OutputMode,
    message: &impl Message,
    to_stderr: bool,
) {
    let line = message.render(mode);
    let emit = || {
        if to_stderr && !mode.is_json() {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    };
    match bar {
        Some(bar) => bar.suspend(emit),
        None => emit(),
    }
}

/// Renders the events of one session run and keeps its byte and object accounting.
///
/// In progress mode the bar is sized to the session totals. Bytes advance the bar as they are
/// read from the source, replayed units advance it all at once and failed units shrink it.
pub struct Reporter {
    mode: OutputMode,
    progress: Arc<Progress>,
    bar: Option<indicatif::ProgressBar>,
    total_bytes: u64,
    total_objects: u64,
    finished: std::sync::OnceLock<Summary>,
}

impl Reporter {
    pub fn new(output: &OutputConfig, total_bytes: u64, total_objects: u64) -> Self {
        let bar = (output.mode == OutputMode::Progress).then(|| {
            let style = indicatif::ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
            indicatif::ProgressBar::with_draw_target(
                Some(total_bytes),
                indicatif::ProgressDrawTarget::stderr_with_hz(REFRESH_HZ),
            )
            .with_style(style)
        });
        Self {
            mode: output.mode,
            progress: Arc::new(Progress::new()),
            bar,
            total_bytes,
            total_objects,
            finished: std::sync::OnceLock::new(),
        }
    }

    /// Accounts for a unit a previous run already mirrored.
    pub fn replay(&self, size: u64) {
        self.progress.objects_replayed.inc();
        self.progress.bytes_replayed.add(size);
        if let Some(bar) = &self.bar {
            bar.inc(size);
        }
    }

    pub fn set_caption(&self, url: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(url.to_string());
        }
    }

    pub fn dispatched(&self, unit: &TransferUnit) {
        if self.mode != OutputMode::Progress {
            print(None, self.mode, &MirrorMessage::new(unit), false);
        }
    }

    /// Wraps a source stream so the bytes read from it feed the transferred count and the bar.
    ///
    /// `streamed` additionally counts the bytes of this one stream.
    pub fn wrap(&self, reader: BoxedRead, streamed: Arc<AtomicU64>) -> BoxedRead {
        Box::new(ProgressReader {
            inner: reader,
            progress: self.progress.clone(),
            bar: self.bar.clone(),
            streamed,
        })
    }

    pub fn mirrored(&self, size: u64) {
        self.progress.objects_mirrored.inc();
        self.progress.bytes_mirrored.add(size);
    }

    /// Accounts for a failed unit that streamed `streamed` of its `size` bytes before failing.
    ///
    /// Streamed bytes already advanced the bar, only the remainder is taken off its length.
    pub fn failed(&self, size: u64, streamed: u64) {
        self.progress.objects_failed.inc();
        if let Some(bar) = &self.bar {
            let length = bar.length().unwrap_or(0);
            bar.set_length(length.saturating_sub(size.saturating_sub(streamed)));
        }
    }

    pub fn error(&self, error: &Error) {
        print(self.bar.as_ref(), self.mode, &ErrorMessage::new(error), true);
    }

    pub fn summary(&self) -> Summary {
        Summary {
            total_bytes: self.total_bytes,
            total_objects: self.total_objects,
            bytes_transferred: self.progress.bytes_streamed.get(),
            bytes_mirrored: self.progress.bytes_mirrored.get(),
            objects_mirrored: self.progress.objects_mirrored.get(),
            bytes_replayed: self.progress.bytes_replayed.get(),
            objects_replayed: self.progress.objects_replayed.get(),
            objects_failed: self.progress.objects_failed.get(),
            elapsed: self.progress.get_duration(),
        }
    }

    /// Clears the bar and prints the accounting line, only the first call has any effect.
    pub fn finish(&self) -> Summary {
        *self.finished.get_or_init(|| {
            if let Some(bar) = &self.bar {
                bar.finish_and_clear();
            }
            let summary = self.summary();
            print(None, self.mode, &StatMessage::new(&summary), false);
            summary
        })
    }
}

/// Spinner shown while the source tree is enumerated.
pub struct ScanIndicator {
    mode: OutputMode,
    bar: Option<indicatif::ProgressBar>,
}

impl ScanIndicator {
    pub fn new(output: &OutputConfig) -> Self {
        let bar = (output.mode == OutputMode::Progress).then(|| {
            let style = indicatif::ProgressStyle::with_template(SCAN_TEMPLATE)
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner());
            let bar = indicatif::ProgressBar::with_draw_target(
                None,
                indicatif::ProgressDrawTarget::stderr_with_hz(REFRESH_HZ),
            )
            .with_style(style)
            .with_message("Scanning");
            bar.enable_steady_tick(std::time::Duration::from_millis(100));
            bar
        });
        Self {
            mode: output.mode,
            bar,
        }
    }

    pub fn inc(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn error(&self, error: &Error) {
        print(self.bar.as_ref(), self.mode, &ErrorMessage::new(error), true);
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ScanIndicator {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Source stream proxy counting the bytes that pass through it.
struct ProgressReader {
    inner: BoxedRead,
    progress: Arc<Progress>,
    bar: Option<indicatif::ProgressBar>,
    streamed: Arc<AtomicU64>,
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                self.progress.bytes_streamed.add(read);
                self.streamed.fetch_add(read, Ordering::Relaxed);
                if let Some(bar) = &self.bar {
                    bar.inc(read);
                }
            }
        }
        poll
    }
}

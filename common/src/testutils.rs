use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::backend::{Backend, BoxedRead, SourceEntry};
use crate::config::{OutputConfig, OutputMode};
use crate::error::ClientError;
use crate::session::{Session, SessionHeader};

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    Ok(tmp_dir)
}

pub fn quiet_output() -> OutputConfig {
    OutputConfig {
        mode: OutputMode::Quiet,
        ..Default::default()
    }
}

/// Fresh session mirroring `src` of a [`FakeBackend`] into `targets`.
pub async fn test_session(dir: &Path, targets: &[&str], force: bool) -> anyhow::Result<Session> {
    let mut args = vec!["src".to_string()];
    args.extend(targets.iter().map(|target| target.to_string()));
    let header = SessionHeader::new(
        "mirror",
        args,
        BTreeMap::from([("force".to_string(), force)]),
        "/",
    );
    Session::create(dir, header).await
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Fails with a skip-class error
    NotFound,
    /// Fails with a run-fatal error
    Fatal,
}

impl Failure {
    fn error(self, url: &str) -> ClientError {
        match self {
            Failure::NotFound => ClientError::PathNotFound {
                path: url.to_string(),
            },
            Failure::Fatal => ClientError::Other(anyhow::anyhow!("simulated fatal failure")),
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    broken: BTreeSet<String>,
    failures: HashMap<String, Failure>,
    gates: HashMap<String, Arc<tokio::sync::Notify>>,
    puts: Vec<String>,
}

/// In-memory backend; objects are keyed by URL, `/` separates path components.
///
/// Failures are attached to source or target URLs. A gated source blocks its transfer until
/// the gate is opened, which lets tests control completion order.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
    delay: Option<std::time::Duration>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBackend {
    /// Backend holding `src/<name>` objects of the given sizes.
    pub fn with_source(objects: &[(&str, usize)]) -> Self {
        let backend = Self::default();
        for (name, size) in objects {
            backend.insert(&format!("src/{name}"), &vec![b'x'; *size]);
        }
        backend
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, url: &str, content: &[u8]) {
        self.state().objects.insert(url.to_string(), content.to_vec());
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.state().objects.get(url).cloned()
    }

    /// Reports `url` as a broken symlink while walking.
    pub fn break_link(&self, url: &str) {
        self.state().broken.insert(url.to_string());
    }

    pub fn fail(&self, url: &str, failure: Failure) {
        self.state().failures.insert(url.to_string(), failure);
    }

    /// Holds transfers of `url` until the returned gate is notified.
    pub fn gate(&self, url: &str) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        self.state().gates.insert(url.to_string(), gate.clone());
        gate
    }

    /// Releases transfers held by [`FakeBackend::gate`] and stops gating `url`.
    pub fn open(&self, url: &str) {
        if let Some(gate) = self.state().gates.remove(url) {
            gate.notify_waiters();
        }
    }

    /// Source URLs of completed transfers, in completion order.
    pub fn puts(&self) -> Vec<String> {
        self.state().puts.clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn clear_failure(&self, url: &str) {
        self.state().failures.remove(url);
    }

    async fn store(
        &self,
        urls: &[String],
        size: u64,
        mut reader: BoxedRead,
    ) -> Result<(), ClientError> {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|error| ClientError::Other(error.into()))?;
        // the source of a target URL is its first path component replaced by `src`
        let source = urls
            .first()
            .and_then(|url| url.split_once('/'))
            .map(|(_, rest)| format!("src/{rest}"))
            .unwrap_or_default();
        let gate = self.state().gates.get(&source).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        for url in urls {
            self.check(url)?;
        }
        if content.len() as u64 != size {
            return Err(ClientError::Other(anyhow::anyhow!("short read")));
        }
        let mut state = self.state();
        for url in urls {
            state.objects.insert(url.clone(), content.clone());
        }
        state.puts.push(source);
        Ok(())
    }

    fn check(&self, url: &str) -> Result<(), ClientError> {
        match self.state().failures.get(url) {
            Some(failure) => Err(failure.error(url)),
            None => Ok(()),
        }
    }
}

impl Backend for FakeBackend {
    async fn get_source(&self, url: &str) -> Result<(BoxedRead, u64), ClientError> {
        self.check(url)?;
        let content = self.get(url).ok_or_else(|| ClientError::PathNotFound {
            path: url.to_string(),
        })?;
        let size = content.len() as u64;
        Ok((Box::new(std::io::Cursor::new(content)), size))
    }

    async fn put_targets(
        &self,
        urls: &[String],
        size: u64,
        reader: BoxedRead,
    ) -> Result<(), ClientError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.store(urls, size, reader).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn walk(&self, root: &str, entries: mpsc::Sender<Result<SourceEntry, ClientError>>) {
        let prefix = format!("{root}/");
        let listing: Vec<Result<SourceEntry, ClientError>> = {
            let state = self.state();
            let urls: BTreeSet<&String> = state.objects.keys().chain(state.broken.iter()).collect();
            urls.into_iter()
                .filter_map(|url| {
                    let relative = url.strip_prefix(&prefix)?;
                    Some(if state.broken.contains(url) {
                        Err(ClientError::BrokenSymlink { path: url.clone() })
                    } else {
                        Ok(SourceEntry {
                            url: url.clone(),
                            relative: relative.to_string(),
                            size: state.objects[url].len() as u64,
                        })
                    })
                })
                .collect()
        };
        for item in listing {
            if entries.send(item).await.is_err() {
                return;
            }
        }
    }

    async fn exists(&self, url: &str) -> Result<bool, ClientError> {
        Ok(self.state().objects.contains_key(url))
    }

    fn join(&self, root: &str, relative: &str) -> String {
        format!("{root}/{relative}")
    }
}

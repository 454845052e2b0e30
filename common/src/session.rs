//! Durable session state: a JSON header plus an append-only NDJSON task log.
//!
//! A session lives in a per-user directory as two files, `<id>.json` (the [`SessionHeader`]) and
//! `<id>.data` (one [`TransferUnit`] per line). The header is rewritten atomically on every
//! checkpoint: the new content goes to a temporary file which is fsynced and renamed over the
//! old one, so a crash at any point leaves either the previous or the next checkpoint on disk.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::transfer::TransferUnit;

pub const SESSION_VERSION: &str = "1";
pub const SESSION_DIR_ENV: &str = "MIRROR_SESSION_DIR";

const HEADER_EXT: &str = "json";
const DATA_EXT: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionHeader {
    pub version: String,
    pub when: chrono::DateTime<chrono::Utc>,
    pub command_type: String,
    /// Source first, followed by every target.
    pub command_args: Vec<String>,
    pub command_bool_flags: BTreeMap<String, bool>,
    pub total_bytes: i64,
    pub total_objects: i64,
    /// Source URL of the last unit covered by the checkpoint, empty before the first one.
    pub last_copied: String,
    pub root_path: String,
    /// Set once preparation committed the totals, a log without it is incomplete.
    #[serde(default)]
    pub prepared: bool,
}

impl SessionHeader {
    pub fn new(
        command_type: &str,
        command_args: Vec<String>,
        command_bool_flags: BTreeMap<String, bool>,
        root_path: impl Into<String>,
    ) -> Self {
        Self {
            version: SESSION_VERSION.to_string(),
            when: chrono::Utc::now(),
            command_type: command_type.to_string(),
            command_args,
            command_bool_flags,
            total_bytes: 0,
            total_objects: 0,
            last_copied: String::new(),
            root_path: root_path.into(),
            prepared: false,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.command_args.first().map(String::as_str)
    }

    pub fn targets(&self) -> &[String] {
        self.command_args.get(1..).unwrap_or_default()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.command_bool_flags.get(name).copied().unwrap_or(false)
    }
}

/// Resolves the session directory: `MIRROR_SESSION_DIR` first, then `$HOME/.mirror/session`.
pub fn default_session_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(SESSION_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .ok_or_else(|| anyhow!("cannot locate the session directory, HOME is not set"))?;
    Ok(PathBuf::from(home).join(".mirror").join("session"))
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("invalid session id {id:?}"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct Session {
    id: String,
    dir: PathBuf,
    pub header: SessionHeader,
}

impl Session {
    /// Creates a session with a fresh id and persists its header right away.
    pub async fn create(dir: &Path, header: SessionHeader) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create session directory {dir:?}"))?;
        let session = Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            dir: dir.to_owned(),
            header,
        };
        session.save().await?;
        tracing::info!("created session {}", session.id);
        Ok(session)
    }

    pub async fn load(dir: &Path, id: &str) -> Result<Self> {
        validate_id(id)?;
        let path = dir.join(format!("{id}.{HEADER_EXT}"));
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(anyhow!("session {id} not found in {dir:?}"));
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot read session header {path:?}"));
            }
        };
        let header = serde_json::from_slice(&content)
            .with_context(|| format!("cannot parse session header {path:?}"))?;
        Ok(Self {
            id: id.to_string(),
            dir: dir.to_owned(),
            header,
        })
    }

    /// All sessions found in `dir`, oldest first. Unreadable headers are logged and skipped.
    pub async fn list(dir: &Path) -> Result<Vec<Session>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("cannot read session directory {dir:?}"));
            }
        };
        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("cannot read session directory {dir:?}"))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(HEADER_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Self::load(dir, id).await {
                Ok(session) => sessions.push(session),
                Err(error) => tracing::warn!("skipping session {path:?}: {error:#}"),
            }
        }
        sessions.sort_by(|a, b| a.header.when.cmp(&b.header.when).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn header_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{HEADER_EXT}", self.id))
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{DATA_EXT}", self.id))
    }

    /// True when a complete task log exists and preparation can be skipped.
    pub async fn has_data(&self) -> Result<bool> {
        if !self.header.prepared {
            return Ok(false);
        }
        let path = self.data_path();
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("cannot access task log {path:?}"))
    }

    /// Opens the task log for appending, discarding whatever a previous attempt left behind.
    pub async fn data_writer(&self) -> Result<DataWriter> {
        let path = self.data_path();
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot create task log {path:?}"))?;
        Ok(DataWriter {
            writer: tokio::io::BufWriter::new(file),
            path,
        })
    }

    pub async fn data_reader(&self) -> Result<DataReader> {
        let path = self.data_path();
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("cannot open task log {path:?}"))?;
        Ok(DataReader {
            lines: tokio::io::BufReader::new(file).lines(),
            line: 0,
            path,
        })
    }

    /// Durably persists the header.
    pub async fn save(&self) -> Result<()> {
        let path = self.header_path();
        let tmp_path = self.dir.join(format!("{}.{HEADER_EXT}.tmp", self.id));
        let content = serde_json::to_vec_pretty(&self.header)
            .with_context(|| format!("cannot serialize session header {path:?}"))?;
        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .with_context(|| format!("cannot create {tmp_path:?}"))?;
            file.write_all(&content)
                .await
                .with_context(|| format!("cannot write {tmp_path:?}"))?;
            file.sync_all()
                .await
                .with_context(|| format!("cannot sync {tmp_path:?}"))?;
        }
        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("cannot replace session header {path:?}"))?;
        Ok(())
    }

    /// Removes the header and the task log.
    pub async fn delete(&self) -> Result<()> {
        for path in [self.header_path(), self.data_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(error).with_context(|| format!("cannot remove {path:?}"));
                }
            }
        }
        tracing::info!("deleted session {}", self.id);
        Ok(())
    }

    /// Persists the header and leaves the session on disk for a later resume.
    pub async fn close(&self) -> Result<()> {
        self.save().await?;
        tracing::info!(
            "session {} closed, last copied: {:?}",
            self.id,
            self.header.last_copied
        );
        Ok(())
    }
}

pub struct DataWriter {
    writer: tokio::io::BufWriter<tokio::fs::File>,
    path: PathBuf,
}

impl DataWriter {
    pub async fn append(&mut self, unit: &TransferUnit) -> Result<()> {
        if unit.is_empty() {
            return Err(anyhow!("refusing to log an empty transfer unit: {unit:?}"));
        }
        let mut row = serde_json::to_vec(unit)
            .with_context(|| format!("cannot serialize {:?}", unit.source_url()))?;
        row.push(b'\n');
        self.writer
            .write_all(&row)
            .await
            .with_context(|| format!("cannot append to task log {:?}", self.path))
    }

    /// Flushes buffered rows and syncs the log to disk.
    pub async fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .await
            .with_context(|| format!("cannot flush task log {:?}", self.path))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .with_context(|| format!("cannot sync task log {:?}", self.path))
    }
}

pub struct DataReader {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>,
    line: usize,
    path: PathBuf,
}

impl DataReader {
    /// Next unit in log order, `None` at the end of the log.
    pub async fn next_unit(&mut self) -> Result<Option<TransferUnit>> {
        loop {
            let Some(row) = self
                .lines
                .next_line()
                .await
                .with_context(|| format!("cannot read task log {:?}", self.path))?
            else {
                return Ok(None);
            };
            self.line += 1;
            if row.trim().is_empty() {
                continue;
            }
            let unit = serde_json::from_str(&row)
                .with_context(|| format!("corrupted task log {:?} at line {}", self.path, self.line))?;
            return Ok(Some(unit));
        }
    }
}

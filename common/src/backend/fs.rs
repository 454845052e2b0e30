use anyhow::anyhow;
use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::instrument;

use super::{Backend, BoxedRead, SourceEntry};
use crate::error::ClientError;

const COPY_BUFFER_SIZE: usize = 128 * 1024;

type EntrySender = mpsc::Sender<Result<SourceEntry, ClientError>>;

/// Local filesystem backend, URLs are plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsBackend;

enum Child {
    Object(u64),
    Directory,
    Ignored,
}

fn path_to_url(path: &Path) -> Result<String, ClientError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::Other(anyhow!("path {path:?} is not valid UTF-8")))
}

#[instrument]
async fn classify(path: &Path) -> Result<Child, ClientError> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .map_err(|error| ClientError::from_io(path, error))?;
    let metadata = if metadata.is_symlink() {
        match tokio::fs::metadata(path).await {
            Ok(target) => {
                if target.is_dir() {
                    tracing::warn!("not descending into symlinked directory {path:?}");
                    return Ok(Child::Ignored);
                }
                target
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClientError::BrokenSymlink {
                    path: path.display().to_string(),
                });
            }
            Err(error) => return Err(ClientError::from_io(path, error)),
        }
    } else {
        metadata
    };
    if metadata.is_dir() {
        Ok(Child::Directory)
    } else if metadata.is_file() {
        Ok(Child::Object(metadata.len()))
    } else {
        tracing::debug!("skipping special file {path:?}");
        Ok(Child::Ignored)
    }
}

/// Returns false once the receiving side is gone.
#[async_recursion]
async fn walk_dir(dir: &Path, relative: &Path, entries: &EntrySender) -> bool {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(error) => {
            return entries
                .send(Err(ClientError::from_io(dir, error)))
                .await
                .is_ok();
        }
    };
    let mut children = Vec::new();
    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => children.push(entry.file_name()),
            Ok(None) => break,
            Err(error) => {
                if entries
                    .send(Err(ClientError::from_io(dir, error)))
                    .await
                    .is_err()
                {
                    return false;
                }
                break;
            }
        }
    }
    children.sort();
    for name in children {
        let path = dir.join(&name);
        let relative = relative.join(&name);
        let item = match classify(&path).await {
            Ok(Child::Directory) => {
                if !walk_dir(&path, &relative, entries).await {
                    return false;
                }
                continue;
            }
            Ok(Child::Ignored) => continue,
            Ok(Child::Object(size)) => path_to_url(&path).and_then(|url| {
                Ok(SourceEntry {
                    url,
                    relative: path_to_url(&relative)?,
                    size,
                })
            }),
            Err(error) => Err(error),
        };
        if entries.send(item).await.is_err() {
            return false;
        }
    }
    true
}

impl Backend for FsBackend {
    async fn get_source(&self, url: &str) -> Result<(BoxedRead, u64), ClientError> {
        let path = Path::new(url);
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|error| ClientError::from_io(path, error))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|error| ClientError::from_io(path, error))?;
        if metadata.is_dir() {
            return Err(ClientError::Other(anyhow!("{path:?} is a directory")));
        }
        Ok((Box::new(file), metadata.len()))
    }

    async fn put_targets(
        &self,
        urls: &[String],
        size: u64,
        mut reader: BoxedRead,
    ) -> Result<(), ClientError> {
        let mut files = Vec::with_capacity(urls.len());
        for url in urls {
            let path = PathBuf::from(url);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| ClientError::from_io(parent, error))?;
            }
            let file = tokio::fs::File::create(&path)
                .await
                .map_err(|error| ClientError::from_io(&path, error))?;
            files.push((path, file));
        }
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let read = reader.read(&mut buffer).await.map_err(|error| {
                ClientError::Other(anyhow::Error::new(error).context("failed reading source"))
            })?;
            if read == 0 {
                break;
            }
            for (path, file) in &mut files {
                file.write_all(&buffer[..read])
                    .await
                    .map_err(|error| ClientError::from_io(path, error))?;
            }
            copied += read as u64;
        }
        for (path, file) in &mut files {
            file.flush()
                .await
                .map_err(|error| ClientError::from_io(path, error))?;
        }
        if copied != size {
            return Err(ClientError::Other(anyhow!(
                "source changed during transfer, expected {size} bytes but read {copied}"
            )));
        }
        Ok(())
    }

    async fn walk(&self, root: &str, entries: EntrySender) {
        let root_path = Path::new(root);
        let metadata = match tokio::fs::metadata(root_path).await {
            Ok(metadata) => metadata,
            Err(error) => {
                let _ = entries
                    .send(Err(ClientError::from_io(root_path, error)))
                    .await;
                return;
            }
        };
        if metadata.is_dir() {
            walk_dir(root_path, Path::new(""), &entries).await;
            return;
        }
        // a single object mirrors under its own name
        let relative = root_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let _ = entries
            .send(Ok(SourceEntry {
                url: root.to_string(),
                relative,
                size: metadata.len(),
            }))
            .await;
    }

    async fn exists(&self, url: &str) -> Result<bool, ClientError> {
        let path = Path::new(url);
        tokio::fs::try_exists(path)
            .await
            .map_err(|error| ClientError::from_io(path, error))
    }

    fn join(&self, root: &str, relative: &str) -> String {
        Path::new(root).join(relative).to_string_lossy().to_string()
    }
}

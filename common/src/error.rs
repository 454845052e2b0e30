//! Error taxonomy shared by backends, the preparation pipeline and the status aggregator.
//!
//! Backends report failures as [`ClientError`], a closed set of variants. Anything that is not
//! one of the well-known filesystem conditions is carried as [`ClientError::Other`] and ends the
//! run. Errors leaving a transfer task are wrapped into [`Error`] together with the URL(s) they
//! concern, so every message the user sees names the offending object.

/// What the aggregator does with a failed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Report the failure and keep mirroring the remaining units.
    Skip,
    /// Stop the run and preserve the session for a later resume.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broken symlink {path:?}")]
    BrokenSymlink { path: String },
    #[error("too many levels of symbolic links at {path:?}")]
    TooManyLevelsSymlink { path: String },
    #[error("path {path:?} not found")]
    PathNotFound { path: String },
    #[error("insufficient permissions to access {path:?}")]
    PathInsufficientPermission { path: String },
    #[error("target {path:?} already exists, use --force to overwrite")]
    TargetExists { path: String },
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BrokenSymlink { .. }
            | Self::TooManyLevelsSymlink { .. }
            | Self::PathNotFound { .. }
            | Self::PathInsufficientPermission { .. }
            | Self::TargetExists { .. } => ErrorClass::Skip,
            Self::Other(_) => ErrorClass::Fatal,
        }
    }

    /// Maps an I/O failure on `path` onto the taxonomy.
    pub fn from_io(path: &std::path::Path, error: std::io::Error) -> Self {
        let display = path.display().to_string();
        if error.raw_os_error() == Some(libc::ELOOP) {
            return Self::TooManyLevelsSymlink { path: display };
        }
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::PathNotFound { path: display },
            std::io::ErrorKind::PermissionDenied => {
                Self::PathInsufficientPermission { path: display }
            }
            _ => Self::Other(
                anyhow::Error::new(error).context(format!("failed accessing {display:?}")),
            ),
        }
    }
}

/// A [`ClientError`] traced to the URL(s) it happened on.
#[derive(Debug, thiserror::Error)]
#[error("{}: {source}", .urls.join(", "))]
pub struct Error {
    pub urls: Vec<String>,
    #[source]
    pub source: ClientError,
}

impl Error {
    #[must_use]
    pub fn new<I, S>(source: ClientError, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.source.class()
    }
}

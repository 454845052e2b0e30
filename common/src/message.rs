//! User facing events, each renders either as a text line or as a single JSON object.

use serde::Serialize;

use crate::config::OutputMode;
use crate::error::Error;
use crate::transfer::TransferUnit;

pub trait Message: Serialize + std::fmt::Display {
    fn render(&self, mode: OutputMode) -> String {
        if !mode.is_json() {
            return self.to_string();
        }
        serde_json::to_string(self).unwrap_or_else(|error| {
            serde_json::json!({"status": "error", "error": error.to_string()}).to_string()
        })
    }
}

/// Printed when a unit is handed to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorMessage {
    pub status: &'static str,
    pub source: String,
    pub targets: Vec<String>,
}

impl MirrorMessage {
    pub fn new(unit: &TransferUnit) -> Self {
        Self {
            status: "success",
            source: unit.source_url().to_string(),
            targets: unit.target_urls(),
        }
    }
}

impl std::fmt::Display for MirrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "‘{}’ -> ‘[{}]’", self.source, self.targets.join(", "))
    }
}

impl Message for MirrorMessage {}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub status: &'static str,
    pub urls: Vec<String>,
    pub error: String,
    pub fatal: bool,
}

impl ErrorMessage {
    pub fn new(error: &Error) -> Self {
        Self {
            status: "error",
            urls: error.urls.clone(),
            error: error.source.to_string(),
            fatal: error.class() == crate::error::ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "mirror: {}: {}", self.urls.join(", "), self.error)
    }
}

impl Message for ErrorMessage {}

/// The terminal accounting line of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StatMessage {
    pub status: &'static str,
    pub total: u64,
    pub transferred: u64,
    pub speed: f64,
}

impl StatMessage {
    pub fn new(summary: &crate::progress::Summary) -> Self {
        Self {
            status: "success",
            total: summary.total_bytes,
            transferred: summary.bytes_transferred,
            speed: summary.speed(),
        }
    }
}

impl std::fmt::Display for StatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Total: {}, Transferred: {}, Speed: {}/s",
            bytesize::ByteSize(self.total),
            bytesize::ByteSize(self.transferred),
            bytesize::ByteSize(self.speed as u64)
        )
    }
}

impl Message for StatMessage {}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContent {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Size")]
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetContent {
    #[serde(rename = "URL")]
    pub url: String,
}

/// One row of the session task log: copy a single source object to every target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferUnit {
    pub source_content: SourceContent,
    pub target_contents: Vec<TargetContent>,
}

impl TransferUnit {
    pub fn new<I, S>(source_url: impl Into<String>, size: u64, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_content: SourceContent {
                url: source_url.into(),
                size: i64::try_from(size).unwrap_or(i64::MAX),
            },
            target_contents: targets
                .into_iter()
                .map(|url| TargetContent { url: url.into() })
                .collect(),
        }
    }

    /// Units without a source or without targets are never written to the log.
    pub fn is_empty(&self) -> bool {
        self.source_content.url.is_empty() || self.target_contents.is_empty()
    }

    pub fn source_url(&self) -> &str {
        &self.source_content.url
    }

    pub fn size(&self) -> u64 {
        u64::try_from(self.source_content.size).unwrap_or(0)
    }

    pub fn target_urls(&self) -> Vec<String> {
        self.target_contents
            .iter()
            .map(|target| target.url.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_row_format() -> anyhow::Result<()> {
        let unit = TransferUnit::new("photos/2014/a.jpg", 42, ["backup/a.jpg", "archive/a.jpg"]);
        let row: serde_json::Value = serde_json::to_value(&unit)?;
        assert_eq!(
            row,
            serde_json::json!({
                "SourceContent": {"URL": "photos/2014/a.jpg", "Size": 42},
                "TargetContents": [{"URL": "backup/a.jpg"}, {"URL": "archive/a.jpg"}],
            })
        );
        Ok(())
    }

    #[test]
    fn empty_units() {
        assert!(TransferUnit::new("", 1, ["t"]).is_empty());
        assert!(TransferUnit::new("s", 1, Vec::<String>::new()).is_empty());
        assert!(!TransferUnit::new("s", 0, ["t"]).is_empty());
    }

    #[test]
    fn negative_size_reads_as_zero() {
        let mut unit = TransferUnit::new("s", 1, ["t"]);
        unit.source_content.size = -5;
        assert_eq!(unit.size(), 0);
    }
}

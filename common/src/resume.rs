/// Decides which units of the task log were applied by a previous run.
///
/// Units are checked in log order. Everything up to and including the unit whose source URL
/// matches the checkpoint is considered copied, everything after it is pending.
#[derive(Debug, Clone)]
pub struct ResumeFilter {
    last_copied: Option<String>,
    found: bool,
}

impl ResumeFilter {
    pub fn new(last_copied: &str) -> Self {
        Self {
            last_copied: (!last_copied.is_empty()).then(|| last_copied.to_string()),
            found: false,
        }
    }

    pub fn is_copied(&mut self, source_url: &str) -> bool {
        if self.found {
            return false;
        }
        match &self.last_copied {
            None => false,
            Some(last_copied) => {
                self.found = last_copied == source_url;
                true
            }
        }
    }

    /// False when a checkpoint was set but no unit matched it yet.
    pub fn found(&self) -> bool {
        self.last_copied.is_none() || self.found
    }
}

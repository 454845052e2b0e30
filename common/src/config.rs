//! Configuration types for runtime and execution settings

/// How per-object events and the final accounting line are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Interactive progress bar on stderr
    #[default]
    Progress,
    /// One JSON object per line on stdout
    Json,
    /// Plain text lines, no progress bar
    Quiet,
}

impl OutputMode {
    pub fn is_json(self) -> bool {
        self == Self::Json
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    pub mode: OutputMode,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Log filter derived from the verbosity, `RUST_LOG` takes precedence when set.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 if self.mode == OutputMode::Quiet => "off",
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None = bounded only by the worker pool)
    pub max_open_files: Option<usize>,
    /// Operations per second throttle (0 = no throttle)
    pub ops_throttle: usize,
    /// I/O operations per second throttle (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size for I/O operations (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("--chunk-size must be specified when using --iops-throttle".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> throttle::Settings {
        throttle::Settings {
            max_open_files: self.max_open_files.unwrap_or(0),
            ops_per_second: self.ops_throttle,
            iops_per_second: self.iops_throttle,
            chunk_size: self.chunk_size,
        }
    }
}

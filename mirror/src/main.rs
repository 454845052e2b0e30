use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mirror",
    version,
    about = "Mirror a directory tree into one or more targets, resumable after interruption",
    long_about = "`mirror` copies every file below SOURCE into each TARGET. Progress is recorded \
in a session so an interrupted or failed run can continue where it stopped.

EXAMPLES:
    # Mirror a directory into two backups
    mirror /data /backup/data /archive/data

    # Continue a session that was interrupted
    mirror --resume 5b1f0c4a9e2d4f7c8a6b3e1d0f9c2a7b

    # Show sessions that can be resumed
    mirror --list-sessions"
)]
struct Args {
    // Mirror options
    /// Overwrite files that already exist in a target
    #[arg(long, help_heading = "Mirror options")]
    force: bool,

    /// Number of concurrent transfers, defaults to the number of cores minus one
    #[arg(long, value_name = "N", help_heading = "Mirror options")]
    max_jobs: Option<usize>,

    // Sessions
    /// Resume a previously interrupted session
    #[arg(
        long,
        value_name = "SESSION_ID",
        conflicts_with_all = ["list_sessions", "clear_session", "force"],
        help_heading = "Sessions"
    )]
    resume: Option<String>,

    /// List sessions that can be resumed
    #[arg(long, conflicts_with = "clear_session", help_heading = "Sessions")]
    list_sessions: bool,

    /// Remove a saved session, `all` removes every session
    #[arg(long, value_name = "SESSION_ID", help_heading = "Sessions")]
    clear_session: Option<String>,

    /// Directory holding session files
    ///
    /// Defaults to $MIRROR_SESSION_DIR when set, otherwise to $HOME/.mirror/session.
    #[arg(long, value_name = "PATH", help_heading = "Sessions")]
    session_dir: Option<PathBuf>,

    // Progress & output
    /// Print one JSON object per line instead of a progress bar
    #[arg(long, conflicts_with = "quiet", help_heading = "Progress & output")]
    json: bool,

    /// Print plain text lines instead of a progress bar
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    // Performance & throttling
    /// Maximum number of open files, 0 or unspecified means no limit beyond --max-jobs
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of scanned objects per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of I/O operations per second, 0 means no throttle
    ///
    /// I/O is calculated based on provided chunk size -- number of I/O operations for a file is calculated as:
    /// ((file size - 1) / chunk size) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size used to calculate number of I/O per file
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --iops-throttle.
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path followed by one or more target paths
    #[arg(value_name = "PATH")]
    paths: Vec<String>,
}

impl Args {
    fn output(&self) -> common::OutputConfig {
        let mode = if self.json {
            common::OutputMode::Json
        } else if self.quiet {
            common::OutputMode::Quiet
        } else {
            common::OutputMode::Progress
        };
        common::OutputConfig {
            mode,
            verbose: self.verbose,
            print_summary: self.summary || self.verbose > 0,
        }
    }
}

fn resume_hint(id: &str) -> String {
    format!("session {id} safely terminated, to resume run `mirror --resume {id}`")
}

/// Points at `mirror --resume` only when the failed session is still on disk.
async fn hint_if_kept(error: anyhow::Error, dir: &Path, id: &str) -> anyhow::Error {
    match common::Session::load(dir, id).await {
        Ok(_) => error.context(resume_hint(id)),
        Err(_) => error,
    }
}

fn trim_separator(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Checks source and targets of a new session, returns them as absolute paths.
async fn validate_paths(paths: &[String]) -> Result<Vec<String>> {
    if paths.len() < 2 {
        return Err(anyhow!(
            "expected a source and at least one target, see `mirror --help`"
        ));
    }
    if let Some(url) = paths.iter().find(|path| path.contains("://")) {
        return Err(anyhow!("{url:?} is not a local path, only local paths are supported"));
    }
    let mut absolute = Vec::with_capacity(paths.len());
    for path in paths {
        let path = std::path::absolute(trim_separator(path))
            .with_context(|| format!("cannot resolve {path:?}"))?;
        absolute.push(path.to_string_lossy().to_string());
    }
    let source = &absolute[0];
    tokio::fs::metadata(source)
        .await
        .with_context(|| format!("cannot access source {source:?}"))?;
    let mut seen = std::collections::HashSet::new();
    for target in &absolute[1..] {
        if !seen.insert(target.as_str()) {
            return Err(anyhow!("target {target:?} is given more than once"));
        }
        if target == source || Path::new(target).starts_with(source) {
            return Err(anyhow!("target {target:?} overlaps the source {source:?}"));
        }
    }
    Ok(absolute)
}

fn print_sessions(sessions: &[common::Session], json: bool) {
    for session in sessions {
        let header = &session.header;
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "status": "success",
                    "sessionId": session.id(),
                    "time": header.when.to_rfc3339(),
                    "source": header.source(),
                    "targets": header.targets(),
                    "prepared": header.prepared,
                })
            );
        } else {
            println!(
                "{}  {}  {} -> {}{}",
                session.id(),
                header.when.format("%Y-%m-%d %H:%M:%S %Z"),
                header.source().unwrap_or_default(),
                header.targets().join(", "),
                if header.prepared { "" } else { "  (not prepared)" },
            );
        }
    }
}

async fn clear_sessions(dir: &Path, id: &str) -> Result<()> {
    let sessions = if id == "all" {
        common::Session::list(dir).await?
    } else {
        vec![common::Session::load(dir, id).await?]
    };
    for session in sessions {
        session.delete().await?;
        println!("session {} cleared", session.id());
    }
    Ok(())
}

#[instrument]
async fn async_main(args: Args) -> Result<()> {
    let output = args.output();
    let session_dir = match &args.session_dir {
        Some(dir) => dir.clone(),
        None => common::default_session_dir()?,
    };
    if args.list_sessions {
        let sessions = common::Session::list(&session_dir).await?;
        print_sessions(&sessions, output.mode.is_json());
        return Ok(());
    }
    if let Some(id) = &args.clear_session {
        return clear_sessions(&session_dir, id).await;
    }
    let throttle_config = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size.0,
    };
    throttle_config.validate().map_err(|error| anyhow!(error))?;
    let session = match &args.resume {
        Some(id) => {
            if !args.paths.is_empty() {
                return Err(anyhow!("paths cannot be given together with --resume"));
            }
            let session = common::Session::load(&session_dir, id).await?;
            if session.header.command_type != "mirror" {
                return Err(anyhow!(
                    "session {id} belongs to `{}`, not `mirror`",
                    session.header.command_type
                ));
            }
            session
        }
        None => {
            let paths = validate_paths(&args.paths).await?;
            let root_path = std::env::current_dir()
                .map(|dir| dir.to_string_lossy().to_string())
                .unwrap_or_default();
            let header = common::SessionHeader::new(
                "mirror",
                paths,
                BTreeMap::from([("force".to_string(), args.force)]),
                root_path,
            );
            common::Session::create(&session_dir, header).await?
        }
    };
    let id = session.id().to_string();
    let settings = common::MirrorSettings {
        output,
        max_jobs: args.max_jobs,
    };
    let throttle = Arc::new(throttle::Throttle::new(&throttle_config.settings()));
    let outcome = common::mirror(
        session,
        Arc::new(common::FsBackend),
        throttle,
        &settings,
        common::interrupt_token(),
    )
    .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(error) => return Err(hint_if_kept(error, &session_dir, &id).await),
    };
    match outcome {
        common::Outcome::Completed(summary) => {
            if output.print_summary && !output.mode.is_json() {
                println!("{summary}");
            }
            Ok(())
        }
        common::Outcome::Failed(error) => {
            eprintln!("mirror: {error:#}");
            Err(anyhow!(resume_hint(&id)))
        }
        common::Outcome::Interrupted { resumable: true } => Err(anyhow!(resume_hint(&id))),
        common::Outcome::Interrupted { resumable: false } => Err(anyhow!(
            "interrupted while scanning the source, session {id} discarded"
        )),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let output = args.output();
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let res = common::run(&output, &runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

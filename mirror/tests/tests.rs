use predicates::prelude::PredicateBooleanExt;

#[test]
fn check_mirror_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("mirror").unwrap();
    cmd.arg("--help").assert().success();
}

struct TestEnv {
    tmp: tempfile::TempDir,
}

impl TestEnv {
    /// src
    /// |- a.txt
    /// |- sub
    ///    |- b.txt
    ///    |- deeper
    ///       |- c.txt
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("sub").join("deeper")).unwrap();
        std::fs::write(src.join("a.txt"), "alpha").unwrap();
        std::fs::write(src.join("sub").join("b.txt"), "bravo").unwrap();
        std::fs::write(src.join("sub").join("deeper").join("c.txt"), "charlie").unwrap();
        Self { tmp }
    }

    fn path(&self, name: &str) -> String {
        self.tmp.path().join(name).to_str().unwrap().to_string()
    }

    fn sessions(&self) -> String {
        self.path("sessions")
    }

    fn session_count(&self) -> usize {
        std::fs::read_dir(self.sessions())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn session_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.sessions()) else {
            return vec![];
        };
        entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .map(|path| path.file_stem().unwrap().to_str().unwrap().to_string())
            .collect()
    }

    fn is_prepared(&self) -> bool {
        self.session_ids().iter().any(|id| {
            std::fs::read(format!("{}/{id}.json", self.sessions()))
                .ok()
                .and_then(|content| serde_json::from_slice::<serde_json::Value>(&content).ok())
                .is_some_and(|header| header["Prepared"] == true)
        })
    }

    fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("mirror").unwrap();
        cmd.args(["--session-dir", &self.sessions()]);
        cmd
    }
}

fn read(path: &str) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn test_mirror_into_two_targets() {
    let env = TestEnv::new();
    env.command()
        .args(["--quiet", &env.path("src"), &env.path("t1"), &env.path("t2")])
        .assert()
        .success()
        .stdout(predicates::str::contains("Total:"));
    for target in ["t1", "t2"] {
        let root = env.path(target);
        assert_eq!(read(&format!("{root}/a.txt")), "alpha");
        assert_eq!(read(&format!("{root}/sub/b.txt")), "bravo");
        assert_eq!(read(&format!("{root}/sub/deeper/c.txt")), "charlie");
    }
    assert_eq!(env.session_count(), 0);
}

#[test]
fn test_mirror_single_file() {
    let env = TestEnv::new();
    let source = format!("{}/a.txt", env.path("src"));
    env.command()
        .args(["--quiet", &source, &env.path("t1")])
        .assert()
        .success();
    assert_eq!(read(&format!("{}/a.txt", env.path("t1"))), "alpha");
}

#[test]
fn test_json_output_lines_parse() {
    let env = TestEnv::new();
    let output = env
        .command()
        .args(["--json", &env.path("src"), &env.path("t1")])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    // three transfers and the closing accounting line
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|line| line["status"] == "success"));
    let stat = lines.last().unwrap();
    assert_eq!(stat["total"], 17);
    assert_eq!(stat["transferred"], 17);
    let sources: Vec<&str> = lines[..3]
        .iter()
        .map(|line| line["source"].as_str().unwrap())
        .collect();
    assert!(sources.iter().any(|source| source.ends_with("/sub/deeper/c.txt")));
}

#[test]
fn test_existing_target_requires_force() {
    let env = TestEnv::new();
    std::fs::create_dir(env.path("t1")).unwrap();
    std::fs::write(format!("{}/a.txt", env.path("t1")), "old").unwrap();
    env.command()
        .args(["--quiet", &env.path("src"), &env.path("t1")])
        .assert()
        .success()
        .stderr(predicates::str::contains("a.txt"));
    assert_eq!(read(&format!("{}/a.txt", env.path("t1"))), "old");
    assert_eq!(read(&format!("{}/sub/b.txt", env.path("t1"))), "bravo");
    env.command()
        .args(["--quiet", "--force", &env.path("src"), &env.path("t1")])
        .assert()
        .success()
        .stderr(predicates::str::contains("a.txt").not());
    assert_eq!(read(&format!("{}/a.txt", env.path("t1"))), "alpha");
}

#[test]
fn test_summary_is_printed() {
    let env = TestEnv::new();
    env.command()
        .args(["--quiet", "--summary", &env.path("src"), &env.path("t1")])
        .assert()
        .success()
        .stdout(predicates::str::contains("objects mirrored"));
}

#[test]
fn test_missing_source_fails() {
    let env = TestEnv::new();
    env.command()
        .args(["--quiet", &env.path("nope"), &env.path("t1")])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot access source"));
    assert_eq!(env.session_count(), 0);
}

#[test]
fn test_target_inside_source_fails() {
    let env = TestEnv::new();
    let nested = format!("{}/nested", env.path("src"));
    env.command()
        .args(["--quiet", &env.path("src"), &nested])
        .assert()
        .failure()
        .stderr(predicates::str::contains("overlaps"));
}

#[test]
fn test_remote_urls_are_rejected() {
    let env = TestEnv::new();
    env.command()
        .args(["--quiet", &env.path("src"), "s3://bucket/backup"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("only local paths"));
}

#[test]
fn test_iops_throttle_requires_chunk_size() {
    let env = TestEnv::new();
    env.command()
        .args([
            "--quiet",
            "--iops-throttle",
            "10",
            &env.path("src"),
            &env.path("t1"),
        ])
        .assert()
        .failure();
}

#[test]
fn test_throttled_mirror_completes() {
    let env = TestEnv::new();
    env.command()
        .args([
            "--quiet",
            "--ops-throttle",
            "1000",
            "--iops-throttle",
            "1000",
            "--chunk-size",
            "1KiB",
            "--max-open-files",
            "2",
            "--max-jobs",
            "2",
            &env.path("src"),
            &env.path("t1"),
        ])
        .assert()
        .success();
    assert_eq!(read(&format!("{}/sub/deeper/c.txt", env.path("t1"))), "charlie");
}

#[test]
fn test_list_sessions_empty() {
    let env = TestEnv::new();
    env.command()
        .arg("--list-sessions")
        .assert()
        .success()
        .stdout(predicates::str::is_empty());
}

#[test]
fn test_resume_unknown_session() {
    let env = TestEnv::new();
    env.command()
        .args(["--resume", "0123456789abcdef"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not found"));
}

#[test]
fn test_resume_rejects_bad_id() {
    let env = TestEnv::new();
    env.command()
        .args(["--resume", "../escape"])
        .assert()
        .failure();
}

#[test]
fn test_clear_all_sessions_on_empty_dir() {
    let env = TestEnv::new();
    env.command()
        .args(["--clear-session", "all"])
        .assert()
        .success();
}

#[test]
fn test_sigterm_keeps_session_for_resume() {
    let env = TestEnv::new();
    let source = env.path("slow");
    std::fs::create_dir(&source).unwrap();
    for i in 0..40 {
        std::fs::write(format!("{source}/{i:02}.txt"), "x").unwrap();
    }
    let target = env.path("t1");
    // one byte chunks at two I/O operations per second keep the run going for ~20s
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("mirror"))
        .args([
            "--session-dir",
            &env.sessions(),
            "--quiet",
            "--max-jobs",
            "1",
            "--iops-throttle",
            "2",
            "--chunk-size",
            "1",
            &source,
            &target,
        ])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while !(env.is_prepared() && std::path::Path::new(&format!("{target}/00.txt")).exists()) {
        assert!(
            std::time::Instant::now() < deadline,
            "mirror never started transferring"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    let killed = std::process::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(killed.success());
    let status = child.wait().unwrap();
    assert!(!status.success());
    assert_eq!(status.code(), Some(1));
    let ids = env.session_ids();
    assert_eq!(ids.len(), 1);
    assert!(std::path::Path::new(&format!("{}/{}.data", env.sessions(), ids[0])).exists());
    let copied = std::fs::read_dir(&target).unwrap().count();
    assert!(copied < 40, "all {copied} objects copied before the interrupt");
    env.command()
        .args(["--quiet", "--resume", &ids[0]])
        .assert()
        .success();
    for i in 0..40 {
        assert_eq!(read(&format!("{target}/{i:02}.txt")), "x");
    }
    assert_eq!(env.session_count(), 0);
}

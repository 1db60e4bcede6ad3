//! Test executor contract and the pytest-shaped default
//!
//! The engine treats the test runner as a black box that takes an optional
//! set of target files and returns exit code plus captured output. Anything
//! whose failure lines the parser understands will do.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Captured result of one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecOutput {
    /// Combined stdout + stderr, the form the parser consumes.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Black-box test runner.
pub trait TestExecutor {
    /// Run the suite. An empty target list means the full suite; a
    /// non-empty list restricts the run when `supports_targets` is true.
    fn run(&self, targets: &[PathBuf]) -> Result<ExecOutput>;

    /// Whether restricted runs are meaningful for this executor.
    fn supports_targets(&self) -> bool {
        false
    }
}

/// Runs pytest against the project, with a wall-clock budget per invocation.
pub struct PytestExecutor {
    project_root: PathBuf,
    timeout: Duration,
}

impl PytestExecutor {
    pub fn new(project_root: PathBuf, timeout: Duration) -> Self {
        Self {
            project_root,
            timeout,
        }
    }
}

impl TestExecutor for PytestExecutor {
    fn run(&self, targets: &[PathBuf]) -> Result<ExecOutput> {
        let mut cmd = Command::new("pytest");
        cmd.current_dir(&self.project_root)
            .arg("--tb=short")
            .arg("-q")
            .arg("--disable-warnings");
        if targets.is_empty() {
            cmd.arg("tests");
        } else {
            for target in targets {
                cmd.arg(target);
            }
        }
        info!("running pytest ({} targets)", targets.len());
        run_with_timeout(cmd, self.timeout)
    }

    fn supports_targets(&self) -> bool {
        true
    }
}

/// Spawn the command, drain its pipes on threads, and kill it if the
/// deadline passes. A timed-out run reports exit code -1.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<ExecOutput> {
    let start = Instant::now();
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_handle = std::thread::spawn(move || drain(stdout_pipe));
    let stderr_handle = std::thread::spawn(move || drain(stderr_pipe));

    let deadline = start + timeout;
    let mut timed_out = false;
    let exit_code = loop {
        match child.try_wait()? {
            Some(status) => break status.code().unwrap_or(-1),
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    let _ = child.wait();
                    break -1;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let duration_ms = start.elapsed().as_millis() as u64;
    debug!("executor finished: exit={} in {}ms", exit_code, duration_ms);

    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        timed_out,
    })
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let mut bytes = Vec::new();
        if pipe.read_to_end(&mut bytes).is_ok() {
            buf = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    buf
}

/// Detect whether a project looks like it has a pytest-style test suite.
pub fn has_test_suite(project_root: &Path) -> bool {
    project_root.join("tests").is_dir()
        || project_root.join("pyproject.toml").exists()
        || project_root.join("setup.py").exists()
}

//! External compiler backend.
//!
//! Runs `<program> rule-set compile <input.json> --output <output.srs>` in a
//! scratch directory that is removed on every exit path. The child is killed
//! when the compile timeout elapses or the run is cancelled.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::error::CompileError;

const INPUT_FILE: &str = "ruleset.json";
const OUTPUT_FILE: &str = "ruleset.srs";
const STDERR_FILE: &str = "stderr.log";

/// Longest stderr excerpt kept in an error.
const MAX_DETAIL_LEN: usize = 2048;

/// An external rule-set compiler executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCompiler {
    program: PathBuf,
    timeout: Duration,
    scratch_dir: Option<PathBuf>,
}

impl ExternalCompiler {
    /// Create a compiler with a 60s timeout using the system temp directory.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(60),
            scratch_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create scratch directories under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Compile an IR document, returning the output bytes verbatim.
    pub fn compile(&self, ir_json: &str, cancel: &CancelToken) -> Result<Vec<u8>, CompileError> {
        if cancel.is_cancelled() {
            return Err(CompileError::Cancelled);
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("srsforge-");
        let scratch = match &self.scratch_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        let input = scratch.path().join(INPUT_FILE);
        let output = scratch.path().join(OUTPUT_FILE);
        let stderr_path = scratch.path().join(STDERR_FILE);
        fs::write(&input, ir_json)?;
        let stderr_file = File::create(&stderr_path)?;

        log::debug!(
            "running {} rule-set compile {:?} --output {:?}",
            self.program.display(),
            input,
            output
        );
        let mut child = Command::new(&self.program)
            .arg("rule-set")
            .arg("compile")
            .arg(&input)
            .arg("--output")
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| CompileError::ExternalCompilerFailed {
                detail: format!("failed to launch {}: {}", self.program.display(), e),
                exit_code: None,
            })?;

        let started = Instant::now();
        let status = loop {
            let polled = child.try_wait();
            if let Some(status) = reap_on_error(&mut child, polled)? {
                break status;
            }
            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(CompileError::Cancelled);
            }
            if started.elapsed() >= self.timeout {
                terminate(&mut child);
                return Err(CompileError::Timeout {
                    after: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                format!("{} exited with {}", self.program.display(), status)
            } else {
                truncate(stderr, MAX_DETAIL_LEN)
            };
            return Err(CompileError::ExternalCompilerFailed {
                detail,
                exit_code: status.code(),
            });
        }

        fs::read(&output).map_err(|e| CompileError::ExternalCompilerFailed {
            detail: format!("compiler produced no output: {}", e),
            exit_code: status.code(),
        })
    }
}

/// Kill and reap the child before an error leaves the polling loop.
fn reap_on_error<T>(child: &mut Child, result: io::Result<T>) -> io::Result<T> {
    if let Err(e) = &result {
        log::warn!("lost track of compiler process: {}", e);
        terminate(child);
    }
    result
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("failed to kill compiler process: {}", e);
    }
    let _ = child.wait();
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

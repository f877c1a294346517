//! Running external commands.
//!
//! Build steps and smoke tests never spawn processes directly; they go through
//! a [`ProcessRunner`] so the pipeline can be driven by a recording fake in
//! tests. Only the exit code and captured output are interpreted.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// One command invocation. The child sees exactly `env`, nothing inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub workdir: PathBuf,
  pub env: BTreeMap<String, String>,
  pub timeout: Option<Duration>,
}

impl ProcessRequest {
  /// The command line as a single string, for messages.
  pub fn display_command(&self) -> String {
    let mut words = vec![self.program.display().to_string()];
    words.extend(self.args.iter().cloned());
    shell_words::join(words)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
  /// `None` when the process was killed by a signal or timed out.
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
  pub timed_out: bool,
}

impl ProcessOutput {
  pub fn success(&self) -> bool {
    !self.timed_out && self.exit_code == Some(0)
  }
}

/// Executes process requests.
///
/// `io::Error` means the process could not be run at all; a non-zero exit is
/// a successful execution reported through [`ProcessOutput`].
pub trait ProcessRunner: Send + Sync {
  fn execute(&self, request: ProcessRequest) -> impl Future<Output = io::Result<ProcessOutput>> + Send;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
  async fn execute(&self, request: ProcessRequest) -> io::Result<ProcessOutput> {
    debug!(command = %request.display_command(), workdir = %request.workdir.display(), "spawning process");

    let mut command = Command::new(&request.program);
    command
      .args(&request.args)
      .current_dir(&request.workdir)
      .env_clear()
      .envs(&request.env)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    let child = command.spawn()?;
    let output = match request.timeout {
      Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
          // dropping the wait future drops the child, which kills it
          warn!(command = %request.display_command(), timeout = ?limit, "process timed out");
          return Ok(ProcessOutput {
            timed_out: true,
            ..Default::default()
          });
        }
      },
      None => child.wait_with_output().await?,
    };

    let result = ProcessOutput {
      exit_code: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      timed_out: false,
    };
    debug!(exit_code = ?result.exit_code, "process finished");
    Ok(result)
  }
}

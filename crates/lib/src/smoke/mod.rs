//! Post-install smoke test.
//!
//! Runs the recipe's test command against the installed files and matches
//! its standard output against the expected pattern.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::{PREFIX_ENV, SOURCE_DATE_EPOCH};
use crate::process::{ProcessRequest, ProcessRunner};
use crate::recipe::Recipe;

/// Upper bound on a smoke-test run.
pub const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected output matching '{expected_pattern}', got: {}", summarize(.actual_output))]
pub struct TestFailure {
  pub expected_pattern: String,
  /// Captured stdout, or a description of why no output was produced.
  pub actual_output: String,
}

fn summarize(output: &str) -> String {
  let trimmed = output.trim();
  if trimmed.is_empty() {
    "(no output)".to_string()
  } else {
    trimmed.to_string()
  }
}

/// Run the smoke test of `recipe` against files installed under `installed_root`.
pub async fn run_test<R: ProcessRunner>(recipe: &Recipe, installed_root: &Path, runner: &R) -> Result<(), TestFailure> {
  let expected_pattern = recipe.expanded_test_pattern();
  let failure = |actual_output: String| TestFailure {
    expected_pattern: expected_pattern.clone(),
    actual_output,
  };

  let pattern = Regex::new(&expected_pattern).map_err(|e| failure(format!("invalid pattern: {}", e)))?;

  let (program, args) = match recipe.test.argv.split_first() {
    Some((program, args)) => (installed_root.join(program), args.to_vec()),
    None => return Err(failure("empty test command".to_string())),
  };

  let request = ProcessRequest {
    program,
    args,
    workdir: installed_root.to_path_buf(),
    env: test_env(installed_root),
    timeout: Some(SMOKE_TEST_TIMEOUT),
  };
  info!(recipe = %recipe.name, command = %recipe.test.command, "running smoke test");

  let output = runner.execute(request).await.map_err(|e| failure(format!("could not run test command: {}", e)))?;

  if output.timed_out {
    return Err(failure(format!("timed out after {:?}", SMOKE_TEST_TIMEOUT)));
  }
  if output.exit_code != Some(0) {
    debug!(exit_code = ?output.exit_code, stderr = %output.stderr, "smoke test command failed");
    let code = output.exit_code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
    return Err(failure(format!("exited with {}: {}", code, output.stdout.trim())));
  }

  if pattern.is_match(&output.stdout) {
    info!(recipe = %recipe.name, "smoke test passed");
    Ok(())
  } else {
    warn!(recipe = %recipe.name, pattern = %expected_pattern, "smoke test output did not match");
    Err(failure(output.stdout))
  }
}

fn test_env(installed_root: &Path) -> BTreeMap<String, String> {
  let bin = installed_root.join("bin");
  let host_path = std::env::var_os("PATH").unwrap_or_default();
  let path = std::env::join_paths(std::iter::once(bin).chain(std::env::split_paths(&host_path)))
    .map(|p| p.to_string_lossy().into_owned())
    .unwrap_or_default();

  BTreeMap::from([
    ("PATH".to_string(), path),
    ("HOME".to_string(), home_for_test(installed_root)),
    ("LANG".to_string(), "C".to_string()),
    ("LC_ALL".to_string(), "C".to_string()),
    ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string()),
    (PREFIX_ENV.to_string(), installed_root.display().to_string()),
  ])
}

fn home_for_test(installed_root: &Path) -> String {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| installed_root.to_path_buf())
    .display()
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::process::ProcessOutput;
  use crate::process::testutil::{RecordingRunner, failed_output, ok_output};
  use crate::recipe::testutil::wheel_recipe;
  use std::io;

  #[tokio::test]
  async fn matching_output_passes() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| Ok(ok_output("wheel-3box 0.2.1\n")));

    run_test(&recipe, Path::new("/opt/kiln"), &runner).await.unwrap();

    let call = &runner.calls()[0];
    assert_eq!(call.request.program, PathBuf::from("/opt/kiln/bin/wheel"));
    assert_eq!(call.request.args, vec!["--version"]);
    assert_eq!(call.request.env["KILN_PREFIX"], "/opt/kiln");
    assert!(call.request.env["PATH"].starts_with("/opt/kiln/bin"));
  }

  #[tokio::test]
  async fn wrong_version_fails_with_output() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| Ok(ok_output("wheel-3box 0.2.0\n")));

    let err = run_test(&recipe, Path::new("/opt/kiln"), &runner).await.unwrap_err();

    assert_eq!(err.expected_pattern, r"wheel-3box 0\.2\.1");
    assert_eq!(err.actual_output, "wheel-3box 0.2.0\n");
  }

  #[tokio::test]
  async fn version_dots_are_literal() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| Ok(ok_output("wheel-3box 0x2y1")));

    assert!(run_test(&recipe, Path::new("/p"), &runner).await.is_err());
  }

  #[tokio::test]
  async fn non_zero_exit_fails_even_when_output_matches() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| {
      Ok(ProcessOutput {
        stdout: "wheel-3box 0.2.1\n".to_string(),
        ..failed_output(1, "")
      })
    });

    let err = run_test(&recipe, Path::new("/p"), &runner).await.unwrap_err();
    assert_eq!(err.actual_output, "exited with code 1: wheel-3box 0.2.1");
  }

  #[tokio::test]
  async fn missing_binary_is_a_failure() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| Err(io::Error::from(io::ErrorKind::NotFound)));

    let err = run_test(&recipe, Path::new("/p"), &runner).await.unwrap_err();
    assert!(err.actual_output.starts_with("could not run test command"));
  }

  #[tokio::test]
  async fn timeout_is_a_failure() {
    let recipe = wheel_recipe();
    let runner = RecordingRunner::new(|_| {
      Ok(ProcessOutput {
        timed_out: true,
        ..Default::default()
      })
    });

    let err = run_test(&recipe, Path::new("/p"), &runner).await.unwrap_err();
    assert!(err.actual_output.starts_with("timed out"));
  }

  #[test]
  fn failure_message_mentions_empty_output() {
    let failure = TestFailure {
      expected_pattern: "x".to_string(),
      actual_output: "  \n".to_string(),
    };
    assert_eq!(failure.to_string(), "expected output matching 'x', got: (no output)");
  }
}

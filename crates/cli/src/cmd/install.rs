//! Implementation of the `kiln install` command.

use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;

use kiln_lib::config::Config;
use kiln_lib::pipeline::PipelineOutcome;

use super::{EXIT_UNVERIFIED, build_pipeline, runtime};
use crate::output::{format_duration, print_stat, print_success, print_warning};

/// Run the whole pipeline for `name`.
///
/// A failing smoke test leaves the files installed and exits with a distinct status.
pub fn cmd_install(config: &Config, name: &str) -> Result<ExitCode> {
  let start = Instant::now();
  let pipeline = build_pipeline(config)?;

  let outcome = runtime()?.block_on(pipeline.install_test_pipeline(name))?;
  let version = pipeline
    .registry()
    .get_recipe(name)
    .map(|r| r.version.clone())
    .unwrap_or_default();
  let report = outcome.report();

  match &outcome {
    PipelineOutcome::Installed(_) => print_success(&format!("Installed {} {}", name, version)),
    PipelineOutcome::InstalledUnverified { .. } => {
      print_warning(&format!("Installed {} {}, but its smoke test failed", name, version))
    }
  }
  print_stat("Prefix", &report.target.display().to_string());
  print_stat("Files", &report.files.len().to_string());
  if report.replaced > 0 {
    print_stat("Replaced", &report.replaced.to_string());
  }
  if !report.removed.is_empty() {
    print_stat("Removed", &report.removed.len().to_string());
  }
  print_stat("Duration", &format_duration(start.elapsed()));

  match outcome {
    PipelineOutcome::Installed(_) => Ok(ExitCode::SUCCESS),
    PipelineOutcome::InstalledUnverified { failure, .. } => {
      print_stat("Expected", &failure.expected_pattern);
      print_stat("Got", failure.actual_output.trim());
      Ok(ExitCode::from(EXIT_UNVERIFIED))
    }
  }
}

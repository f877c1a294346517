//! Implementation of the `kiln test` command.

use std::process::ExitCode;

use anyhow::Result;

use kiln_lib::config::Config;

use super::{build_pipeline, runtime};
use crate::output::print_success;

pub fn cmd_test(config: &Config, name: &str) -> Result<ExitCode> {
  let pipeline = build_pipeline(config)?;
  runtime()?.block_on(pipeline.test_installed(name))?;
  print_success(&format!("{} passed its smoke test", name));
  Ok(ExitCode::SUCCESS)
}

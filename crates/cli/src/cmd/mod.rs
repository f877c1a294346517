mod info;
mod install;
mod list;
mod test;

use std::sync::Arc;

use anyhow::{Context, Result};

use kiln_lib::config::Config;
use kiln_lib::fetch::ArtifactFetcher;
use kiln_lib::pipeline::{Pipeline, PipelineError, Stage};
use kiln_lib::platform::paths;
use kiln_lib::process::SystemRunner;
use kiln_lib::receipt::ReceiptStore;
use kiln_lib::recipe::{RecipeError, RecipeRegistry};

pub use info::cmd_info;
pub use install::cmd_install;
pub use list::cmd_list;
pub use test::cmd_test;

/// Exit status when the smoke test fails after a completed install.
pub const EXIT_UNVERIFIED: u8 = 8;

pub fn load_registry(config: &Config) -> Result<RecipeRegistry> {
  RecipeRegistry::load_dir(&config.recipes_dir)
    .with_context(|| format!("Failed to load recipes from {}", config.recipes_dir.display()))
}

pub fn receipt_store() -> ReceiptStore {
  ReceiptStore::new(paths::receipts_dir())
}

pub fn build_pipeline(config: &Config) -> Result<Pipeline<SystemRunner>> {
  let registry = load_registry(config)?;
  let fetcher =
    ArtifactFetcher::new(config.fetch.clone(), paths::downloads_dir()).context("Failed to create HTTP client")?;

  Ok(Pipeline::new(
    registry,
    fetcher,
    Arc::new(SystemRunner),
    config.build.clone(),
    config.prefix.clone(),
  ))
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// Map a failure onto the documented exit statuses.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
  if let Some(failed) = err.downcast_ref::<PipelineError>() {
    return stage_exit_code(failed.stage);
  }
  if err.downcast_ref::<RecipeError>().is_some() {
    return 2;
  }
  1
}

fn stage_exit_code(stage: Stage) -> u8 {
  match stage {
    Stage::Resolve => 2,
    Stage::Dependencies => 3,
    Stage::Fetch => 4,
    Stage::Verify => 5,
    Stage::Build => 6,
    Stage::Install => 7,
    Stage::Test => EXIT_UNVERIFIED,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kiln_lib::pipeline::StageError;

  #[test]
  fn every_stage_has_its_own_code() {
    let stages = [
      Stage::Resolve,
      Stage::Dependencies,
      Stage::Fetch,
      Stage::Verify,
      Stage::Build,
      Stage::Install,
      Stage::Test,
    ];
    let codes: Vec<u8> = stages.iter().map(|s| stage_exit_code(*s)).collect();
    assert_eq!(codes, vec![2, 3, 4, 5, 6, 7, 8]);
  }

  #[test]
  fn pipeline_errors_map_through_context() {
    let err = anyhow::Error::new(PipelineError {
      recipe: "wheel".to_string(),
      stage: Stage::Verify,
      source: StageError::Recipe(RecipeError::NotFound("wheel".to_string())),
    })
    .context("install failed");

    assert_eq!(exit_code_for(&err), 5);
  }

  #[test]
  fn recipe_errors_are_not_found() {
    let err = anyhow::Error::new(RecipeError::NotFound("nope".to_string()));
    assert_eq!(exit_code_for(&err), 2);
    assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
  }
}

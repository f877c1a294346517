//! Recipes: declarative descriptions of how to fetch, build, install and test
//! one package.
//!
//! Recipe files are read by [`lua`], checked by [`validate`] and served by
//! [`RecipeRegistry`]. A [`Recipe`] is immutable once validated.

mod lua;
mod registry;
mod types;
mod validate;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use lua::{load_recipe_file, load_recipe_str};
pub use registry::RecipeRegistry;
pub use types::{
  Dependency, DependencyDef, DependencyRole, InstallDef, InstallEntry, Recipe, RecipeDef, SmokeTest, Step, StepDef,
};
pub use validate::{ValidationError, validate, version_from_url};

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("recipe not found: {0}")]
  NotFound(String),

  #[error("failed to read recipe {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to evaluate recipe {path}: {message}")]
  Eval { path: PathBuf, message: String },

  #[error("recipe file {path} declares name '{name}'")]
  NameMismatch { path: PathBuf, name: String },

  #[error("failed to list recipes in {path}: {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid recipe {path}: {source}")]
  InvalidFile {
    path: PathBuf,
    #[source]
    source: ValidationError,
  },

  #[error(transparent)]
  Invalid(#[from] ValidationError),
}

#[cfg(test)]
pub mod testutil {
  use super::*;

  pub const WHEEL_SHA256: &str = "4025dc804f1e1d98852c555049f314bb74f20f0a6ff60cdee15470e85ebb2dc9";

  /// The wheel recipe as a definition, before validation.
  pub fn wheel_def() -> RecipeDef {
    RecipeDef {
      name: Some("wheel".to_string()),
      desc: Some("ComposeDB and Ceramic Setup Tool".to_string()),
      homepage: Some("https://ceramic.network/".to_string()),
      url: Some("https://github.com/ceramicstudio/wheel/archive/refs/tags/v0.2.1.tar.gz".to_string()),
      sha256: Some(WHEEL_SHA256.to_string()),
      license: Some("MIT AND Apache-2.0".to_string()),
      version: None,
      head: Some("https://github.com/ceramicstudio/wheel.git".to_string()),
      depends_on: vec![
        DependencyDef::build("curl"),
        DependencyDef::build("jq"),
        DependencyDef::runtime("node"),
      ],
      steps: vec![StepDef::new("./wheel.sh"), StepDef::new("./wheel")],
      install: vec![InstallDef {
        from: "wheel".to_string(),
        to: "bin/wheel".to_string(),
      }],
      deparallelize: true,
      test_command: Some("bin/wheel --version".to_string()),
      test_expected_pattern: Some("wheel-3box {version}".to_string()),
    }
  }

  pub fn wheel_recipe() -> Recipe {
    validate(&wheel_def()).unwrap()
  }
}

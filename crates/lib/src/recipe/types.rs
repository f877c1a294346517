use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use semver::VersionReq;
use serde::{Deserialize, Serialize};

use crate::verify::Sha256Digest;

/// Whether a dependency is needed only while building or also at run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyRole {
  Build,
  #[default]
  Runtime,
}

impl DependencyRole {
  pub fn as_str(self) -> &'static str {
    match self {
      DependencyRole::Build => "build",
      DependencyRole::Runtime => "runtime",
    }
  }
}

impl fmt::Display for DependencyRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Unvalidated recipe fields as read from a recipe file.
///
/// Every field is optional here so that [`validate`](super::validate) can
/// report exactly which required field is absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeDef {
  pub name: Option<String>,
  pub desc: Option<String>,
  pub homepage: Option<String>,
  pub url: Option<String>,
  pub sha256: Option<String>,
  pub license: Option<String>,
  pub version: Option<String>,
  pub head: Option<String>,
  pub depends_on: Vec<DependencyDef>,
  pub steps: Vec<StepDef>,
  pub install: Vec<InstallDef>,
  pub deparallelize: bool,
  pub test_command: Option<String>,
  pub test_expected_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDef {
  pub name: String,
  pub version: Option<String>,
  pub role: DependencyRole,
}

impl DependencyDef {
  pub fn runtime(name: &str) -> Self {
    Self {
      name: name.to_string(),
      version: None,
      role: DependencyRole::Runtime,
    }
  }

  pub fn build(name: &str) -> Self {
    Self {
      name: name.to_string(),
      version: None,
      role: DependencyRole::Build,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDef {
  pub name: Option<String>,
  pub run: String,
  pub env: BTreeMap<String, String>,
  /// `None` means "after the previous step".
  pub needs: Option<Vec<String>>,
}

impl StepDef {
  pub fn new(run: &str) -> Self {
    Self {
      run: run.to_string(),
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallDef {
  pub from: String,
  pub to: String,
}

/// A dependency of a validated recipe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dependency {
  pub name: String,
  #[serde(serialize_with = "serialize_req")]
  pub version: Option<VersionReq>,
  pub role: DependencyRole,
}

impl fmt::Display for Dependency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.version {
      Some(req) => write!(f, "{} {} ({})", self.name, req, self.role),
      None => write!(f, "{} ({})", self.name, self.role),
    }
  }
}

fn serialize_req<S: serde::Serializer>(req: &Option<VersionReq>, s: S) -> Result<S::Ok, S::Error> {
  match req {
    Some(req) => s.serialize_some(&req.to_string()),
    None => s.serialize_none(),
  }
}

/// One external build command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
  pub name: String,
  /// The command line as written in the recipe.
  pub run: String,
  pub program: String,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
  /// Indices of steps that must finish first.
  pub needs: Vec<usize>,
}

/// A path produced by the build and where it lands in the prefix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallEntry {
  /// Relative to the build's source directory.
  pub from: PathBuf,
  /// Relative to the install target.
  pub to: PathBuf,
}

/// Post-install check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmokeTest {
  pub command: String,
  pub argv: Vec<String>,
  /// Pattern as written, before `{version}` expansion.
  pub expect: String,
}

/// A validated, immutable recipe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipe {
  pub name: String,
  pub desc: Option<String>,
  pub homepage: Option<String>,
  pub url: String,
  pub sha256: Sha256Digest,
  pub license: Option<String>,
  pub version: String,
  pub head: Option<String>,
  pub dependencies: Vec<Dependency>,
  pub steps: Vec<Step>,
  pub install: Vec<InstallEntry>,
  pub deparallelize: bool,
  pub test: SmokeTest,
}

impl Recipe {
  pub fn build_dependencies(&self) -> impl Iterator<Item = &Dependency> {
    self.dependencies.iter().filter(|d| d.role == DependencyRole::Build)
  }

  pub fn runtime_dependencies(&self) -> impl Iterator<Item = &Dependency> {
    self.dependencies.iter().filter(|d| d.role == DependencyRole::Runtime)
  }

  /// File name the source archive is stored under.
  pub fn archive_filename(&self) -> String {
    let stem = crate::fetch::url_to_filename(&self.url);
    if stem.starts_with(&self.name) {
      stem
    } else {
      format!("{}-{}", self.name, stem)
    }
  }

  /// The smoke-test pattern with `{version}` replaced by the escaped version.
  pub fn expanded_test_pattern(&self) -> String {
    self.test.expect.replace("{version}", &regex::escape(&self.version))
  }
}

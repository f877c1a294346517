//! Dependency presence checks.
//!
//! Each declared dependency is checked against a [`PackageIndex`]. All missing
//! entries are collected and reported together so they can be fixed in one
//! pass.

use std::fmt;
use std::path::PathBuf;

use semver::{Version, VersionReq};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::receipt::ReceiptStore;
use crate::recipe::{Dependency, Recipe};

/// Answers whether a package is available.
pub trait PackageIndex {
  fn is_installed(&self, name: &str, version: Option<&VersionReq>) -> bool;
}

/// Packages kiln installed itself, per their receipts.
pub struct ReceiptIndex {
  store: ReceiptStore,
}

impl ReceiptIndex {
  pub fn new(store: ReceiptStore) -> Self {
    Self { store }
  }
}

impl PackageIndex for ReceiptIndex {
  fn is_installed(&self, name: &str, version: Option<&VersionReq>) -> bool {
    let receipt = match self.store.load(name) {
      Ok(Some(r)) => r,
      Ok(None) => return false,
      Err(e) => {
        warn!(name = %name, error = %e, "ignoring unreadable receipt");
        return false;
      }
    };

    match version {
      None => true,
      Some(req) => match parse_lenient_version(&receipt.version) {
        Some(v) => req.matches(&v),
        None => {
          debug!(name = %name, version = %receipt.version, "installed version is not comparable");
          false
        }
      },
    }
  }
}

/// Executables reachable through a search path.
///
/// A bare executable says nothing about its version, so constrained
/// dependencies are never satisfied here.
pub struct PathIndex {
  search_path: Option<String>,
}

impl PathIndex {
  /// Search the process `PATH`.
  pub fn from_env() -> Self {
    Self { search_path: None }
  }

  /// Search an explicit `PATH`-style list.
  pub fn with_search_path(path: impl Into<String>) -> Self {
    Self {
      search_path: Some(path.into()),
    }
  }

  fn find(&self, name: &str) -> Option<PathBuf> {
    match &self.search_path {
      Some(path) => {
        let cwd = std::env::current_dir().ok()?;
        which::which_in(name, Some(path), cwd).ok()
      }
      None => which::which(name).ok(),
    }
  }
}

impl PackageIndex for PathIndex {
  fn is_installed(&self, name: &str, version: Option<&VersionReq>) -> bool {
    if version.is_some() {
      return false;
    }
    self.find(name).is_some()
  }
}

/// Tries each index in turn; the first one that reports the package wins.
#[derive(Default)]
pub struct ChainIndex {
  indexes: Vec<Box<dyn PackageIndex + Send + Sync>>,
}

impl ChainIndex {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, index: impl PackageIndex + Send + Sync + 'static) -> Self {
    self.indexes.push(Box::new(index));
    self
  }
}

impl PackageIndex for ChainIndex {
  fn is_installed(&self, name: &str, version: Option<&VersionReq>) -> bool {
    self.indexes.iter().any(|i| i.is_installed(name, version))
  }
}

/// Every dependency that could not be found, in declaration order.
#[derive(Debug, Clone, PartialEq, Error)]
pub struct MissingDependencies {
  pub recipe: String,
  pub missing: Vec<Dependency>,
}

impl fmt::Display for MissingDependencies {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let list: Vec<String> = self.missing.iter().map(|d| d.to_string()).collect();
    write!(
      f,
      "{} has {} missing dependenc{}: {}",
      self.recipe,
      self.missing.len(),
      if self.missing.len() == 1 { "y" } else { "ies" },
      list.join(", ")
    )
  }
}

/// Check every declared dependency of `recipe`, build and runtime alike.
pub fn ensure_dependencies(recipe: &Recipe, index: &dyn PackageIndex) -> Result<(), MissingDependencies> {
  let missing: Vec<Dependency> = recipe
    .dependencies
    .iter()
    .filter(|dep| {
      let present = index.is_installed(&dep.name, dep.version.as_ref());
      debug!(dependency = %dep, present, "checked dependency");
      !present
    })
    .cloned()
    .collect();

  if missing.is_empty() {
    info!(recipe = %recipe.name, count = recipe.dependencies.len(), "dependencies satisfied");
    Ok(())
  } else {
    Err(MissingDependencies {
      recipe: recipe.name.clone(),
      missing,
    })
  }
}

/// Parse `1`, `1.2` or `1.2.3[-pre]` as semver, padding missing components with zero.
pub fn parse_lenient_version(raw: &str) -> Option<Version> {
  let raw = raw.trim().trim_start_matches('v');
  if let Ok(v) = Version::parse(raw) {
    return Some(v);
  }
  let (core, rest) = match raw.find(['-', '+']) {
    Some(i) => raw.split_at(i),
    None => (raw, ""),
  };
  let mut parts: Vec<&str> = core.split('.').collect();
  if parts.is_empty() || parts.len() > 3 {
    return None;
  }
  while parts.len() < 3 {
    parts.push("0");
  }
  Version::parse(&format!("{}{}", parts.join("."), rest)).ok()
}

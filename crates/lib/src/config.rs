//! Layered configuration.
//!
//! Resolution order, later layers winning:
//!
//! 1. Built-in defaults
//! 2. `kiln.toml` in the config directory (or the file named by `KILN_CONFIG`)
//! 3. `KILN_PREFIX` / `KILN_RECIPES`
//! 4. CLI flags (applied by the caller on the returned [`Config`])
//!
//! # Example
//!
//! ```toml
//! recipes_dir = "/srv/recipes"
//! prefix = "/opt/kiln"
//! jobs = 4
//!
//! [fetch]
//! timeout_secs = 120
//! max_attempts = 3
//! initial_backoff_ms = 500
//!
//! [build]
//! timeout_secs = 1800
//! path = "/usr/local/bin:/usr/bin:/bin"
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::build::BuildConfig;
use crate::consts::{CONFIG_ENV, CONFIG_FILENAME, PREFIX_ENV, RECIPES_ENV};
use crate::fetch::FetchConfig;
use crate::platform::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid config {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid config {path}: {message}")]
  Invalid { path: PathBuf, message: String },
}

/// On-disk shape of `kiln.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
  recipes_dir: Option<PathBuf>,
  prefix: Option<PathBuf>,
  jobs: Option<usize>,
  fetch: FetchSection,
  build: BuildSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FetchSection {
  timeout_secs: Option<u64>,
  max_attempts: Option<u32>,
  initial_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BuildSection {
  timeout_secs: Option<u64>,
  path: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// Directory holding `<name>.lua` recipes.
  pub recipes_dir: PathBuf,
  /// Install target.
  pub prefix: PathBuf,
  pub fetch: FetchConfig,
  pub build: BuildConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      recipes_dir: paths::default_recipes_dir(),
      prefix: paths::default_prefix(),
      fetch: FetchConfig::default(),
      build: BuildConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from the default location and the environment.
  ///
  /// A missing default config file is not an error; a missing file named
  /// explicitly through `KILN_CONFIG` is.
  pub fn load() -> Result<Self, ConfigError> {
    let (path, explicit) = match std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
      Some(p) => (PathBuf::from(p), true),
      None => (paths::config_dir().join(CONFIG_FILENAME), false),
    };

    let mut config = if explicit || path.exists() {
      Self::from_file(&path)?
    } else {
      debug!(path = %path.display(), "no config file, using defaults");
      Self::default()
    };

    config.apply_env();
    Ok(config)
  }

  /// Load defaults overlaid with a single config file, without consulting the environment.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml(&content, path)
  }

  fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
    let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    let invalid = |message: &str| ConfigError::Invalid {
      path: path.to_path_buf(),
      message: message.to_string(),
    };

    let mut config = Self::default();

    if let Some(dir) = file.recipes_dir {
      config.recipes_dir = dir;
    }
    if let Some(prefix) = file.prefix {
      config.prefix = prefix;
    }
    if let Some(jobs) = file.jobs {
      if jobs == 0 {
        return Err(invalid("jobs must be at least 1"));
      }
      config.build.jobs = jobs;
    }

    if let Some(secs) = file.fetch.timeout_secs {
      config.fetch.timeout = Duration::from_secs(secs);
    }
    if let Some(attempts) = file.fetch.max_attempts {
      if attempts == 0 {
        return Err(invalid("fetch.max_attempts must be at least 1"));
      }
      config.fetch.max_attempts = attempts;
    }
    if let Some(ms) = file.fetch.initial_backoff_ms {
      config.fetch.initial_backoff = Duration::from_millis(ms);
    }

    if let Some(secs) = file.build.timeout_secs {
      config.build.timeout = Some(Duration::from_secs(secs));
    }
    if file.build.path.is_some() {
      config.build.path = file.build.path;
    }

    Ok(config)
  }

  fn apply_env(&mut self) {
    if let Some(prefix) = std::env::var_os(PREFIX_ENV).filter(|v| !v.is_empty()) {
      self.prefix = PathBuf::from(prefix);
    }
    if let Some(dir) = std::env::var_os(RECIPES_ENV).filter(|v| !v.is_empty()) {
      self.recipes_dir = PathBuf::from(dir);
    }
  }
}

//! Filesystem locations used by kiln.
//!
//! Follows the XDG base directory conventions on Unix and the `%APPDATA%` /
//! `%LOCALAPPDATA%` conventions on Windows. `KILN_ROOT` relocates everything
//! kiln owns (receipts, build sandboxes, the default prefix).

use std::path::PathBuf;

use crate::consts::{APP_NAME, ROOT_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  env_path("USERPROFILE").unwrap_or_else(std::env::temp_dir)
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  env_path("HOME").unwrap_or_else(std::env::temp_dir)
}

/// Returns the directory for configuration files for the application
#[cfg(windows)]
pub fn config_dir() -> PathBuf {
  env_path("APPDATA").unwrap_or_else(home_dir).join(APP_NAME)
}

/// Returns the directory for configuration files for the application
#[cfg(not(windows))]
pub fn config_dir() -> PathBuf {
  env_path("XDG_CONFIG_HOME")
    .unwrap_or_else(|| home_dir().join(".config"))
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  env_path("APPDATA").unwrap_or_else(home_dir).join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  env_path("XDG_DATA_HOME")
    .unwrap_or_else(|| home_dir().join(".local").join("share"))
    .join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  env_path("LOCALAPPDATA")
    .unwrap_or_else(home_dir)
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  env_path("XDG_CACHE_HOME")
    .unwrap_or_else(|| home_dir().join(".cache"))
    .join(APP_NAME)
}

/// Root of kiln-owned state. `KILN_ROOT` wins over the data directory.
pub fn root_dir() -> PathBuf {
  env_path(ROOT_ENV).unwrap_or_else(data_dir)
}

/// Verified source archives.
pub fn downloads_dir() -> PathBuf {
  cache_dir().join("downloads")
}

/// Parent of the per-run build sandboxes.
pub fn builds_dir() -> PathBuf {
  root_dir().join("build")
}

/// Install receipts, one JSON file per recipe.
pub fn receipts_dir() -> PathBuf {
  root_dir().join("receipts")
}

/// Install locks, one file per target directory.
pub fn locks_dir() -> PathBuf {
  root_dir().join("locks")
}

/// Prefix used when neither config nor environment names one.
pub fn default_prefix() -> PathBuf {
  root_dir().join("prefix")
}

/// Recipe directory used when neither config nor environment names one.
pub fn default_recipes_dir() -> PathBuf {
  config_dir().join("recipes")
}

fn env_path(var: &str) -> Option<PathBuf> {
  std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
#[cfg(not(windows))]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn xdg_config_home_takes_precedence() {
    temp_env::with_vars(
      [
        ("XDG_CONFIG_HOME", Some("/custom/config")),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(config_dir(), PathBuf::from("/custom/config").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_fallback_to_home_directories() {
    temp_env::with_vars(
      [
        ("XDG_CONFIG_HOME", None::<&str>),
        ("XDG_DATA_HOME", None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(config_dir(), PathBuf::from("/home/user/.config/kiln"));
        assert_eq!(data_dir(), PathBuf::from("/home/user/.local/share/kiln"));
        assert_eq!(cache_dir(), PathBuf::from("/home/user/.cache/kiln"));
      },
    );
  }

  #[test]
  #[serial]
  fn kiln_root_relocates_owned_state() {
    temp_env::with_vars([(ROOT_ENV, Some("/opt/kiln")), ("XDG_DATA_HOME", Some("/data"))], || {
      assert_eq!(root_dir(), PathBuf::from("/opt/kiln"));
      assert_eq!(receipts_dir(), PathBuf::from("/opt/kiln/receipts"));
      assert_eq!(builds_dir(), PathBuf::from("/opt/kiln/build"));
      assert_eq!(locks_dir(), PathBuf::from("/opt/kiln/locks"));
      assert_eq!(default_prefix(), PathBuf::from("/opt/kiln/prefix"));
    });
  }

  #[test]
  #[serial]
  fn empty_root_env_is_ignored() {
    temp_env::with_vars([(ROOT_ENV, Some("")), ("XDG_DATA_HOME", Some("/data"))], || {
      assert_eq!(root_dir(), PathBuf::from("/data/kiln"));
    });
  }
}

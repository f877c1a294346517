//! Install receipts.
//!
//! A receipt records what an install put into the prefix, so that a later
//! install of the same recipe may replace those files and dependency checks
//! can see which recipes are present.
//!
//! # Storage Layout
//!
//! ```text
//! <root>/receipts/
//! └── wheel.json
//! ```
//!
//! ```json
//! {
//!   "name": "wheel",
//!   "version": "0.2.1",
//!   "prefix": "/home/user/.local/share/kiln/prefix",
//!   "files": ["bin/wheel"],
//!   "installed_at_unix": 1760745600
//! }
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
  pub name: String,
  pub version: String,
  pub prefix: PathBuf,
  /// Paths relative to `prefix`.
  pub files: Vec<PathBuf>,
  pub installed_at_unix: u64,
}

impl InstallReceipt {
  pub fn new(name: &str, version: &str, prefix: &Path, files: Vec<PathBuf>) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      prefix: prefix.to_path_buf(),
      files,
      installed_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }
}

#[derive(Debug, Error)]
pub enum ReceiptError {
  #[error("failed to read receipt {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse receipt {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write receipt {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize receipt: {0}")]
  Serialize(#[source] serde_json::Error),
}

/// Directory of receipts.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
  dir: PathBuf,
  #[cfg(test)]
  fail_saves: bool,
}

impl ReceiptStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      #[cfg(test)]
      fail_saves: false,
    }
  }

  #[cfg(test)]
  pub(crate) fn failing_saves(mut self) -> Self {
    self.fail_saves = true;
    self
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn path_for(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{}.json", name))
  }

  /// Load the receipt for `name`, or `None` if it was never installed.
  pub fn load(&self, name: &str) -> Result<Option<InstallReceipt>, ReceiptError> {
    let path = self.path_for(name);
    let content = match fs::read_to_string(&path) {
      Ok(c) => c,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(name = %name, "no receipt");
        return Ok(None);
      }
      Err(source) => return Err(ReceiptError::Read { path, source }),
    };
    let receipt = serde_json::from_str(&content).map_err(|source| ReceiptError::Parse { path, source })?;
    Ok(Some(receipt))
  }

  /// Write a receipt atomically (unique temp file, then rename).
  pub fn save(&self, receipt: &InstallReceipt) -> Result<(), ReceiptError> {
    let path = self.path_for(&receipt.name);
    let write_err = |source| ReceiptError::Write {
      path: path.clone(),
      source,
    };

    #[cfg(test)]
    if self.fail_saves {
      return Err(write_err(io::Error::other("injected failure")));
    }

    fs::create_dir_all(&self.dir).map_err(write_err)?;
    let content = serde_json::to_string_pretty(receipt).map_err(ReceiptError::Serialize)?;
    let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err)?;
    temp.write_all(content.as_bytes()).map_err(write_err)?;
    temp.persist(&path).map_err(|e| write_err(e.error))?;

    info!(name = %receipt.name, version = %receipt.version, files = receipt.files.len(), "receipt saved");
    Ok(())
  }
}

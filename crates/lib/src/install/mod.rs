//! Placing build outputs into the install target.
//!
//! An install is all-or-nothing. Every destination is checked for conflicts
//! before anything is written. Each file is copied to a temporary sibling and
//! renamed into place; a file being replaced is first moved into a backup
//! directory. Files a previous install of the same recipe wrote, and this one
//! no longer does, are moved into the backups too. If any step fails, or the
//! caller rolls back an [`InstallTransaction`], the applied operations are
//! undone in reverse order, so the target is left exactly as it was. A target
//! directory created by the install is removed again.
//!
//! Installs into the same target are serialized by [`PrefixLock`], which
//! lives under the locks directory rather than in the target.

mod lock;

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::build::InstallManifest;
use crate::platform::paths;

pub use lock::{LockMetadata, PrefixLock, PrefixLockError};

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("permission denied writing {path}: {source}")]
  PermissionDenied {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} already exists and {reason}", .path.display())]
  PathConflict { path: PathBuf, reason: String },

  #[error("failed to install {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Lock(#[from] PrefixLockError),
}

impl InstallError {
  fn from_io(path: &Path, source: io::Error) -> Self {
    if source.kind() == io::ErrorKind::PermissionDenied {
      InstallError::PermissionDenied {
        path: path.to_path_buf(),
        source,
      }
    } else {
      InstallError::Io {
        path: path.to_path_buf(),
        source,
      }
    }
  }
}

/// What an install wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub target: PathBuf,
  /// Every file and symlink written, relative to `target`, in install order.
  pub files: Vec<PathBuf>,
  /// How many of `files` replaced a previous file.
  pub replaced: usize,
  /// Files of the previous install that this one no longer provides.
  pub removed: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
  Dir,
  File,
  Symlink,
}

#[derive(Debug)]
struct PlannedItem {
  source: PathBuf,
  /// Relative to the target.
  dest: PathBuf,
  kind: ItemKind,
}

/// Undo record for one applied operation.
#[derive(Debug)]
enum Applied {
  CreatedDir(PathBuf),
  CreatedFile(PathBuf),
  /// `dest` was moved to `backup`, and possibly replaced.
  MovedAside { dest: PathBuf, backup: PathBuf },
}

/// Installs into one target directory.
#[derive(Debug, Clone)]
pub struct Installer {
  target: PathBuf,
  lock_dir: PathBuf,
  command: String,
  #[cfg(test)]
  fail_on: Option<PathBuf>,
}

impl Installer {
  pub fn new(target: impl Into<PathBuf>) -> Self {
    Self {
      target: target.into(),
      lock_dir: paths::locks_dir(),
      command: "kiln install".to_string(),
      #[cfg(test)]
      fail_on: None,
    }
  }

  /// Command recorded in the lock metadata.
  pub fn with_command(mut self, command: impl Into<String>) -> Self {
    self.command = command.into();
    self
  }

  pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.lock_dir = dir.into();
    self
  }

  /// Copy every manifest entry into the target and commit.
  ///
  /// `owned` lists target-relative paths a previous install of the same
  /// recipe wrote; only those may be replaced.
  pub fn install(&self, manifest: &InstallManifest, owned: &HashSet<PathBuf>) -> Result<InstallReport, InstallError> {
    Ok(self.begin(manifest, owned)?.commit())
  }

  /// Apply every manifest entry but keep the means to undo it.
  ///
  /// The target stays locked until the returned transaction is committed or
  /// rolled back. Dropping it without committing rolls back.
  pub fn begin(&self, manifest: &InstallManifest, owned: &HashSet<PathBuf>) -> Result<InstallTransaction, InstallError> {
    let lock = PrefixLock::acquire(&self.lock_dir, &self.target, &self.command)?;

    let plan = plan(manifest)?;
    self.check_conflicts(&plan, owned)?;

    let mut created = Vec::new();
    create_dirs(&self.target, &mut created)?;

    let mut tx = InstallTransaction {
      report: InstallReport {
        target: self.target.clone(),
        ..InstallReport::default()
      },
      created,
      applied: Vec::new(),
      backups: None,
      committed: false,
      _lock: lock,
    };

    let backups = tempfile::Builder::new()
      .prefix(".kiln-backup-")
      .tempdir_in(&self.target)
      .map_err(|e| InstallError::from_io(&self.target, e))?;
    tx.backups = Some(backups);

    for (idx, item) in plan.iter().enumerate() {
      if let Err(e) = self.apply(idx, item, &mut tx) {
        warn!(path = %item.dest.display(), error = %e, "install failed, rolling back");
        return Err(e);
      }
    }

    let written: HashSet<&Path> = plan.iter().map(|item| item.dest.as_path()).collect();
    let mut stale: Vec<&PathBuf> = owned
      .iter()
      .filter(|path| !written.contains(path.as_path()) && is_relative_inside(path))
      .collect();
    stale.sort();
    for (idx, rel) in stale.into_iter().enumerate() {
      if let Err(e) = tx.remove_stale(idx, rel) {
        warn!(path = %rel.display(), error = %e, "removing stale file failed, rolling back");
        return Err(e);
      }
    }

    Ok(tx)
  }

  fn check_conflicts(&self, plan: &[PlannedItem], owned: &HashSet<PathBuf>) -> Result<(), InstallError> {
    let mut seen = HashSet::new();
    let conflict = |path: &Path, reason: &str| InstallError::PathConflict {
      path: self.target.join(path),
      reason: reason.to_string(),
    };

    for item in plan {
      if item.kind != ItemKind::Dir && !seen.insert(item.dest.clone()) {
        return Err(conflict(item.dest.as_path(), "is listed twice in the install manifest"));
      }

      // every existing ancestor must be a directory, or a symlink to one
      let mut ancestor = PathBuf::new();
      let mut parents = item.dest.components().peekable();
      while let Some(component) = parents.next() {
        if parents.peek().is_none() {
          break;
        }
        ancestor.push(component);
        if let Ok(meta) = fs::metadata(self.target.join(&ancestor))
          && !meta.is_dir()
        {
          return Err(conflict(ancestor.as_path(), "is not a directory"));
        }
      }

      let dest = self.target.join(&item.dest);
      let Ok(existing) = fs::symlink_metadata(&dest) else {
        continue;
      };
      match item.kind {
        ItemKind::Dir if !existing.is_dir() && !fs::metadata(&dest).is_ok_and(|m| m.is_dir()) => {
          return Err(conflict(item.dest.as_path(), "is not a directory"));
        }
        ItemKind::Dir => {}
        _ if existing.is_dir() => return Err(conflict(item.dest.as_path(), "is a directory")),
        _ if !owned.contains(&item.dest) => return Err(conflict(item.dest.as_path(), "is not owned by this recipe")),
        _ => {}
      }
    }
    Ok(())
  }

  fn apply(&self, idx: usize, item: &PlannedItem, tx: &mut InstallTransaction) -> Result<(), InstallError> {
    let dest = self.target.join(&item.dest);

    if item.kind == ItemKind::Dir {
      return create_dirs(&dest, &mut tx.applied);
    }
    if let Some(parent) = dest.parent() {
      create_dirs(parent, &mut tx.applied)?;
    }

    #[cfg(test)]
    if self.fail_on.as_deref() == Some(item.dest.as_path()) {
      return Err(InstallError::from_io(&dest, io::Error::other("injected failure")));
    }

    let staged = stage(item, &dest).map_err(|e| InstallError::from_io(&dest, e))?;

    let replaced = fs::symlink_metadata(&dest).is_ok();
    if replaced {
      tx.move_aside(&dest, &format!("replaced-{idx}"))?;
    }

    staged.persist(&dest).map_err(|e| InstallError::from_io(&dest, e.error))?;
    if !replaced {
      tx.applied.push(Applied::CreatedFile(dest.clone()));
    }

    debug!(from = %item.source.display(), to = %dest.display(), replaced, "installed file");
    tx.report.files.push(item.dest.clone());
    if replaced {
      tx.report.replaced += 1;
    }
    Ok(())
  }
}

/// Applied but not yet committed install; holds the target lock.
#[derive(Debug)]
pub struct InstallTransaction {
  report: InstallReport,
  /// Directories created for the target itself, undone last.
  created: Vec<Applied>,
  applied: Vec<Applied>,
  backups: Option<TempDir>,
  committed: bool,
  _lock: PrefixLock,
}

impl InstallTransaction {
  pub fn report(&self) -> &InstallReport {
    &self.report
  }

  /// Keep the installed files and discard the backups.
  pub fn commit(mut self) -> InstallReport {
    self.committed = true;
    if let Some(backups) = self.backups.take()
      && let Err(e) = backups.close()
    {
      warn!(error = %e, "failed to remove install backups");
    }
    info!(
      prefix = %self.report.target.display(),
      files = self.report.files.len(),
      replaced = self.report.replaced,
      removed = self.report.removed.len(),
      "installed"
    );
    std::mem::take(&mut self.report)
  }

  /// Undo everything and restore the target.
  pub fn rollback(mut self) {
    self.undo();
  }

  fn move_aside(&mut self, dest: &Path, name: &str) -> Result<(), InstallError> {
    let Some(backups) = &self.backups else {
      return Err(InstallError::from_io(dest, io::Error::other("no backup directory")));
    };
    let backup = backups.path().join(name);
    fs::rename(dest, &backup).map_err(|e| InstallError::from_io(dest, e))?;
    self.applied.push(Applied::MovedAside {
      dest: dest.to_path_buf(),
      backup,
    });
    Ok(())
  }

  fn remove_stale(&mut self, idx: usize, rel: &Path) -> Result<(), InstallError> {
    let dest = self.report.target.join(rel);
    match fs::symlink_metadata(&dest) {
      Ok(meta) if !meta.is_dir() => {
        self.move_aside(&dest, &format!("stale-{idx}"))?;
        debug!(path = %dest.display(), "removed stale file");
        self.report.removed.push(rel.to_path_buf());
      }
      _ => {}
    }
    Ok(())
  }

  fn undo(&mut self) {
    if self.applied.is_empty() && self.created.is_empty() && self.backups.is_none() {
      return;
    }
    warn!(prefix = %self.report.target.display(), "rolling back install");
    rollback(std::mem::take(&mut self.applied));
    if let Some(backups) = self.backups.take()
      && let Err(e) = backups.close()
    {
      warn!(error = %e, "failed to remove install backups");
    }
    rollback(std::mem::take(&mut self.created));
  }
}

impl Drop for InstallTransaction {
  fn drop(&mut self) {
    if !self.committed {
      self.undo();
    }
  }
}

/// Install `manifest` into `target_dir`; see [`Installer::install`].
pub fn install(
  manifest: &InstallManifest,
  target_dir: &Path,
  owned: &HashSet<PathBuf>,
) -> Result<InstallReport, InstallError> {
  Installer::new(target_dir).install(manifest, owned)
}

/// Expand directory sources into their contents.
fn plan(manifest: &InstallManifest) -> Result<Vec<PlannedItem>, InstallError> {
  let mut items = Vec::new();

  for entry in manifest.entries() {
    let meta = fs::symlink_metadata(&entry.source).map_err(|e| InstallError::from_io(&entry.source, e))?;

    if !meta.is_dir() {
      items.push(PlannedItem {
        source: entry.source.clone(),
        dest: entry.dest.clone(),
        kind: kind_of(&meta),
      });
      continue;
    }

    for walked in WalkDir::new(&entry.source).sort_by_file_name() {
      let walked = walked.map_err(|e| {
        let path = e.path().unwrap_or(&entry.source).to_path_buf();
        InstallError::from_io(&path, e.into())
      })?;
      let rel = walked.path().strip_prefix(&entry.source).unwrap_or(walked.path());
      let dest = if rel.as_os_str().is_empty() {
        entry.dest.clone()
      } else {
        entry.dest.join(rel)
      };
      let meta = walked.path().symlink_metadata().map_err(|e| InstallError::from_io(walked.path(), e))?;
      items.push(PlannedItem {
        source: walked.path().to_path_buf(),
        dest,
        kind: kind_of(&meta),
      });
    }
  }

  debug_assert!(items.iter().all(|i| is_relative_inside(&i.dest)));
  Ok(items)
}

fn kind_of(meta: &fs::Metadata) -> ItemKind {
  if meta.is_dir() {
    ItemKind::Dir
  } else if meta.file_type().is_symlink() {
    ItemKind::Symlink
  } else {
    ItemKind::File
  }
}

fn is_relative_inside(path: &Path) -> bool {
  path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Create `dir` and any missing ancestors, recording each one created.
fn create_dirs(dir: &Path, applied: &mut Vec<Applied>) -> Result<(), InstallError> {
  let mut missing = Vec::new();
  let mut current = Some(dir);
  while let Some(path) = current {
    if fs::symlink_metadata(path).is_ok() {
      break;
    }
    missing.push(path.to_path_buf());
    current = path.parent();
  }

  for path in missing.into_iter().rev() {
    fs::create_dir(&path).map_err(|e| InstallError::from_io(&path, e))?;
    applied.push(Applied::CreatedDir(path));
  }
  Ok(())
}

/// Write the new content next to `dest` so the final step is a rename.
fn stage(item: &PlannedItem, dest: &Path) -> io::Result<tempfile::TempPath> {
  let parent = dest.parent().unwrap_or(Path::new("."));
  let temp = tempfile::Builder::new().prefix(".kiln-").tempfile_in(parent)?;
  let temp_path = temp.into_temp_path();

  match item.kind {
    ItemKind::Symlink => {
      let link_target = fs::read_link(&item.source)?;
      fs::remove_file(&temp_path)?;
      make_symlink(&link_target, &temp_path)?;
    }
    _ => {
      fs::copy(&item.source, &temp_path)?;
      let perms = fs::metadata(&item.source)?.permissions();
      fs::set_permissions(&temp_path, perms)?;
    }
  }
  Ok(temp_path)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::windows::fs::symlink_file(target, link)
}

fn rollback(applied: Vec<Applied>) {
  for op in applied.into_iter().rev() {
    let result = match &op {
      Applied::CreatedFile(path) => fs::remove_file(path),
      Applied::MovedAside { dest, backup } => {
        let _ = fs::remove_file(dest);
        fs::rename(backup, dest)
      }
      Applied::CreatedDir(path) => fs::remove_dir(path),
    };
    if let Err(e) = result {
      warn!(op = ?op, error = %e, "rollback step failed");
    }
  }
}

//! Exclusive lock on an install target.
//!
//! The lock is an advisory `flock` (`LockFileEx` on Windows) on a file under
//! the locks directory, named after a hash of the target path, so the target
//! itself is never touched by locking. The holder writes JSON metadata into the
//! file so a waiting process can say who it is waiting for.
//!
//! Acquiring blocks until the current holder releases the lock.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::LOCK_EXTENSION;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub target: PathBuf,
}

#[derive(Debug, Error)]
pub enum PrefixLockError {
  #[error("failed to open lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock {path}: {source}")]
  Acquire {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Held for the duration of an install; released when dropped.
#[derive(Debug)]
pub struct PrefixLock {
  file: File,
  lock_path: PathBuf,
}

impl PrefixLock {
  /// Lock `target`, waiting for any other holder to finish.
  pub fn acquire(lock_dir: &Path, target: &Path, command: &str) -> Result<Self, PrefixLockError> {
    let lock_path = lock_path_for(lock_dir, target);
    let open_err = |source| PrefixLockError::Open {
      path: lock_path.clone(),
      source,
    };

    fs::create_dir_all(lock_dir).map_err(open_err)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(open_err)?;

    if try_lock_exclusive(&file).is_err() {
      match read_holder(&lock_path) {
        Some(holder) => info!(
          prefix = %target.display(),
          pid = holder.pid,
          command = %holder.command,
          "waiting for another install to finish"
        ),
        None => info!(prefix = %target.display(), "waiting for another install to finish"),
      }
      lock_exclusive(&file).map_err(|source| PrefixLockError::Acquire {
        path: lock_path.clone(),
        source,
      })?;
    }

    write_metadata(&file, command, target)?;
    debug!(path = %lock_path.display(), "acquired install lock");

    Ok(PrefixLock { file, lock_path })
  }

  /// Read the metadata through the held handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

/// `<lock_dir>/<first 16 hex of sha256(absolute target)>.lock`
fn lock_path_for(lock_dir: &Path, target: &Path) -> PathBuf {
  let absolute = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
  let digest = Sha256::digest(absolute.as_os_str().as_encoded_bytes());
  let name = hex::encode(digest);
  lock_dir.join(&name[..16]).with_extension(LOCK_EXTENSION)
}

fn write_metadata(file: &File, command: &str, target: &Path) -> Result<(), PrefixLockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    target: target.to_path_buf(),
  };

  file.set_len(0).map_err(PrefixLockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| PrefixLockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(PrefixLockError::WriteMetadata)?;
  Ok(())
}

fn read_holder(lock_path: &Path) -> Option<LockMetadata> {
  let contents = fs::read_to_string(lock_path).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::NonBlockingLockExclusive)
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::LockExclusive)
}

#[cfg(unix)]
fn flock(file: &File, operation: rustix::fs::FlockOperation) -> io::Result<()> {
  use std::os::unix::io::AsFd;

  rustix::fs::flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

  lock_file_ex(file, LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK)
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK;

  lock_file_ex(file, LOCKFILE_EXCLUSIVE_LOCK)
}

#[cfg(windows)]
fn lock_file_ex(file: &File, flags: u32) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::LockFileEx;

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is plain data and valid when zeroed; the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::time::Duration;
  use tempfile::TempDir;

  #[test]
  fn writes_metadata_outside_the_target() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("prefix");
    let locks = temp.path().join("locks");

    let lock = PrefixLock::acquire(&locks, &target, "kiln install wheel").unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.command, "kiln install wheel");
    assert_eq!(metadata.pid, std::process::id());
    assert_eq!(metadata.target, target);
    assert!(lock.lock_path().starts_with(&locks));
    assert!(!target.exists());
  }

  #[test]
  fn each_target_has_its_own_lock_file() {
    let locks = Path::new("/locks");
    let a = lock_path_for(locks, Path::new("/opt/a"));
    let b = lock_path_for(locks, Path::new("/opt/b"));

    assert_ne!(a, b);
    assert_eq!(a, lock_path_for(locks, Path::new("/opt/a")));
    assert_eq!(a.extension().unwrap(), LOCK_EXTENSION);
  }

  #[cfg(unix)]
  #[test]
  fn second_holder_waits_for_release() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("prefix");
    let locks = temp.path().join("locks");
    let held = PrefixLock::acquire(&locks, &target, "kiln install wheel").unwrap();
    assert_eq!(read_holder(held.lock_path()).unwrap().command, "kiln install wheel");

    let (tx, rx) = mpsc::channel();
    let waiter = {
      let (locks, target) = (locks.clone(), target.clone());
      std::thread::spawn(move || {
        let lock = PrefixLock::acquire(&locks, &target, "kiln install other").unwrap();
        tx.send(()).unwrap();
        lock.read_metadata().unwrap().command
      })
    };

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    drop(held);
    assert_eq!(waiter.join().unwrap(), "kiln install other");
  }

  #[test]
  fn released_on_drop() {
    let temp = TempDir::new().unwrap();
    let target = temp.path().join("prefix");
    {
      let _lock = PrefixLock::acquire(temp.path(), &target, "first").unwrap();
    }
    let lock = PrefixLock::acquire(temp.path(), &target, "second").unwrap();
    assert_eq!(lock.read_metadata().unwrap().command, "second");
  }
}

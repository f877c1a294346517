//! Unpacking verified source archives.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, trace};

use super::BuildError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack `archive_path` into `dest` and return the directory the build runs in.
///
/// Gzip-compressed and plain tar archives are accepted. Entries that would
/// land outside `dest` abort the extraction. When the archive holds a single
/// top-level directory, that directory is returned.
pub(crate) fn extract_source(archive_path: &Path, dest: &Path) -> Result<PathBuf, BuildError> {
  let fail = |message: String| BuildError::Extract {
    archive: archive_path.to_path_buf(),
    message,
  };

  std::fs::create_dir_all(dest).map_err(|e| fail(format!("cannot create {}: {}", dest.display(), e)))?;

  let mut file = File::open(archive_path).map_err(|e| fail(e.to_string()))?;
  let gzipped = is_gzip(&mut file).map_err(|e| fail(e.to_string()))?;
  let reader = BufReader::new(file);

  let count = if gzipped {
    unpack(Archive::new(GzDecoder::new(reader)), dest)
  } else {
    unpack(Archive::new(reader), dest)
  }
  .map_err(fail)?;

  let root = source_root(dest).map_err(|e| fail(e.to_string()))?;
  debug!(
    archive = %archive_path.display(),
    entries = count,
    root = %root.display(),
    "extracted source"
  );
  Ok(root)
}

fn is_gzip(file: &mut File) -> io::Result<bool> {
  let mut magic = [0u8; 2];
  let n = file.read(&mut magic)?;
  file.seek(SeekFrom::Start(0))?;
  Ok(n == 2 && magic == GZIP_MAGIC)
}

fn unpack<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<usize, String> {
  archive.set_preserve_permissions(true);
  archive.set_overwrite(true);

  let mut count = 0;
  for entry in archive.entries().map_err(|e| e.to_string())? {
    let mut entry = entry.map_err(|e| e.to_string())?;
    let path = entry.path().map_err(|e| e.to_string())?.into_owned();

    if !is_contained(&path) {
      return Err(format!("entry '{}' escapes the extraction directory", path.display()));
    }
    trace!(entry = %path.display(), "unpacking");

    let unpacked = entry.unpack_in(dest).map_err(|e| format!("{}: {}", path.display(), e))?;
    if !unpacked {
      return Err(format!("entry '{}' escapes the extraction directory", path.display()));
    }
    count += 1;
  }
  Ok(count)
}

fn is_contained(path: &Path) -> bool {
  path
    .components()
    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// The single top-level directory of an extracted tree, or `dest` itself.
fn source_root(dest: &Path) -> io::Result<PathBuf> {
  let mut entries = std::fs::read_dir(dest)?.collect::<Result<Vec<_>, _>>()?;
  if entries.len() == 1 && entries[0].file_type()?.is_dir() {
    return Ok(entries.remove(0).path());
  }
  Ok(dest.to_path_buf())
}

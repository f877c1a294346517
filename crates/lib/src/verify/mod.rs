//! Integrity verification of fetched artifacts.
//!
//! This module provides:
//! - `Sha256Digest`: a parsed 256-bit digest (exactly 64 hex characters)
//! - `hash_file()`: streaming SHA-256 of a file
//! - `verify()`: full-length digest comparison, deleting the artifact on mismatch
//! - `VerifiedArtifact`: the only artifact type the build stage accepts

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::SHA256_HEX_LEN;
use crate::fetch::FetchedArtifact;

/// Why a digest string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestParseError {
  #[error("expected {expected} hex characters, got {actual}")]
  Length { expected: usize, actual: usize },

  #[error("invalid hex character {ch:?} at position {position}")]
  NonHex { ch: char, position: usize },
}

/// A SHA-256 digest.
///
/// Parsing accepts upper- or lowercase hex and normalizes to lowercase on display.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256Digest([u8; 32]);

impl Sha256Digest {
  pub fn from_bytes(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }

  /// Compare against another digest without exiting at the first differing byte.
  pub fn matches(&self, other: &Sha256Digest) -> bool {
    let diff = self
      .0
      .iter()
      .zip(other.0.iter())
      .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
  }
}

impl FromStr for Sha256Digest {
  type Err = DigestParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() != SHA256_HEX_LEN {
      return Err(DigestParseError::Length {
        expected: SHA256_HEX_LEN,
        actual: s.chars().count(),
      });
    }
    if let Some((position, ch)) = s.char_indices().find(|(_, c)| !c.is_ascii_hexdigit()) {
      return Err(DigestParseError::NonHex { ch, position });
    }

    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes).map_err(|_| DigestParseError::Length {
      expected: SHA256_HEX_LEN,
      actual: s.len(),
    })?;
    Ok(Self(bytes))
  }
}

impl fmt::Display for Sha256Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for Sha256Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Sha256Digest({})", self.to_hex())
  }
}

impl Serialize for Sha256Digest {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

/// Incremental hasher used while streaming downloads.
#[derive(Default)]
pub struct DigestWriter {
  hasher: Sha256,
  len: u64,
}

impl DigestWriter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update(&mut self, chunk: &[u8]) {
    self.hasher.update(chunk);
    self.len += chunk.len() as u64;
  }

  pub fn bytes_written(&self) -> u64 {
    self.len
  }

  pub fn finish(self) -> Sha256Digest {
    Sha256Digest(self.hasher.finalize().into())
  }
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> io::Result<Sha256Digest> {
  let mut file = fs::File::open(path)?;
  let mut writer = DigestWriter::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    writer.update(&buffer[..bytes_read]);
  }

  Ok(writer.finish())
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> Sha256Digest {
  Sha256Digest(Sha256::digest(data).into())
}

#[derive(Debug, Error)]
pub enum IntegrityError {
  #[error("checksum mismatch for {url}: expected {expected}, got {actual} (artifact deleted)")]
  Mismatch {
    url: String,
    expected: Sha256Digest,
    actual: Sha256Digest,
  },

  #[error("failed to read artifact {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// An artifact whose bytes hashed to the recipe's expected digest.
///
/// Only [`verify`] constructs this type.
#[derive(Debug)]
pub struct VerifiedArtifact {
  url: String,
  path: PathBuf,
  len: u64,
  digest: Sha256Digest,
}

impl VerifiedArtifact {
  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Size in bytes.
  pub fn size(&self) -> u64 {
    self.len
  }

  pub fn digest(&self) -> &Sha256Digest {
    &self.digest
  }

  /// Move the verified file to its final location, replacing any previous file there.
  pub fn promote(self, dest: &Path) -> io::Result<VerifiedArtifact> {
    if self.path == dest {
      return Ok(self);
    }
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::rename(&self.path, dest)?;
    debug!(from = %self.path.display(), to = %dest.display(), "promoted verified artifact");
    Ok(VerifiedArtifact {
      path: dest.to_path_buf(),
      ..self
    })
  }

  /// Re-verify a file that was promoted by an earlier run.
  ///
  /// Returns `Ok(None)` when the file is absent or its contents no longer match.
  pub fn from_cache(url: &str, path: &Path, expected: &Sha256Digest) -> io::Result<Option<VerifiedArtifact>> {
    if !path.is_file() {
      return Ok(None);
    }
    let actual = hash_file(path)?;
    if !actual.matches(expected) {
      debug!(path = %path.display(), expected = %expected, actual = %actual, "cached artifact is stale");
      return Ok(None);
    }
    Ok(Some(VerifiedArtifact {
      url: url.to_string(),
      path: path.to_path_buf(),
      len: fs::metadata(path)?.len(),
      digest: actual,
    }))
  }
}

/// Verify a fetched artifact against the expected digest.
///
/// The digest is recomputed over the whole file on disk rather than trusting
/// the value computed while streaming. On mismatch (or if the file cannot be
/// read) the artifact file is removed before the error is returned.
pub fn verify(artifact: FetchedArtifact, expected: &Sha256Digest) -> Result<VerifiedArtifact, IntegrityError> {
  let actual = match hash_file(&artifact.path) {
    Ok(digest) => digest,
    Err(source) => {
      discard(&artifact.path);
      return Err(IntegrityError::Read {
        path: artifact.path,
        source,
      });
    }
  };

  if !actual.matches(expected) {
    warn!(url = %artifact.url, expected = %expected, actual = %actual, "checksum mismatch");
    discard(&artifact.path);
    return Err(IntegrityError::Mismatch {
      url: artifact.url,
      expected: *expected,
      actual,
    });
  }

  info!(url = %artifact.url, digest = %actual, "checksum verified");
  Ok(VerifiedArtifact {
    url: artifact.url,
    path: artifact.path,
    len: artifact.len,
    digest: actual,
  })
}

fn discard(path: &Path) {
  if let Err(e) = fs::remove_file(path)
    && e.kind() != io::ErrorKind::NotFound
  {
    warn!(path = %path.display(), error = %e, "failed to delete unverified artifact");
  }
}

//! Source artifact download.
//!
//! Downloads go to a uniquely named `.part` file inside the downloads
//! directory and are hashed while streaming. The final artifact path is never
//! written here; only a [`VerifiedArtifact`](crate::verify::VerifiedArtifact)
//! can be promoted to it.
//!
//! Transient failures (connect errors, timeouts, HTTP 5xx/408/429) are retried
//! with exponential backoff up to `max_attempts`. A 404/410 or any other 4xx
//! fails immediately.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::verify::{DigestWriter, Sha256Digest, hash_bytes};

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
  /// Upper bound for one attempt, connect through last body byte.
  pub timeout: Duration,
  /// Total attempts including the first.
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles for each further attempt.
  pub initial_backoff: Duration,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(300),
      max_attempts: 3,
      initial_backoff: Duration::from_millis(500),
    }
  }
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("timed out fetching {url} after {attempts} attempt(s)")]
  Timeout { url: String, attempts: u32 },

  #[error("not found: {url} ({status})")]
  NotFound { url: String, status: String },

  #[error("network failure fetching {url} after {attempts} attempt(s): {message}")]
  NetworkFailure { url: String, attempts: u32, message: String },

  #[error("unsupported source URL {url}: {message}")]
  InvalidUrl { url: String, message: String },

  #[error("failed to create HTTP client: {0}")]
  Client(String),

  #[error("failed to write download of {url}: {source}")]
  Io {
    url: String,
    #[source]
    source: io::Error,
  },
}

impl FetchError {
  /// Whether this error came from a condition a retry could have fixed.
  pub fn is_transient(&self) -> bool {
    matches!(self, FetchError::Timeout { .. } | FetchError::NetworkFailure { .. })
  }
}

/// A downloaded, not yet verified, source archive.
#[derive(Debug)]
pub struct FetchedArtifact {
  pub url: String,
  pub path: PathBuf,
  pub len: u64,
  /// Digest computed while streaming.
  pub digest: Sha256Digest,
  /// Attempts it took, including the successful one.
  pub attempts: u32,
}

/// Outcome of a single attempt, before it is mapped onto [`FetchError`].
#[derive(Debug)]
enum AttemptError {
  Timeout,
  Transient(String),
  NotFound(String),
  Rejected(String),
  Io(io::Error),
}

impl AttemptError {
  fn is_transient(&self) -> bool {
    matches!(self, AttemptError::Timeout | AttemptError::Transient(_))
  }

  fn into_fetch_error(self, url: &str, attempts: u32) -> FetchError {
    let url = url.to_string();
    match self {
      AttemptError::Timeout => FetchError::Timeout { url, attempts },
      AttemptError::Transient(message) | AttemptError::Rejected(message) => FetchError::NetworkFailure {
        url,
        attempts,
        message,
      },
      AttemptError::NotFound(status) => FetchError::NotFound { url, status },
      AttemptError::Io(source) => FetchError::Io { url, source },
    }
  }
}

impl std::fmt::Display for AttemptError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      AttemptError::Timeout => write!(f, "timed out"),
      AttemptError::Transient(m) | AttemptError::Rejected(m) => write!(f, "{}", m),
      AttemptError::NotFound(status) => write!(f, "not found ({})", status),
      AttemptError::Io(e) => write!(f, "{}", e),
    }
  }
}

fn classify_reqwest(e: reqwest::Error) -> AttemptError {
  if e.is_timeout() {
    AttemptError::Timeout
  } else if e.is_builder() {
    AttemptError::Rejected(e.to_string())
  } else {
    AttemptError::Transient(e.to_string())
  }
}

fn classify_status(status: StatusCode) -> Option<AttemptError> {
  if status.is_success() {
    None
  } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
    Some(AttemptError::NotFound(format!("HTTP {}", status)))
  } else if status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
  {
    Some(AttemptError::Transient(format!("HTTP {}", status)))
  } else {
    Some(AttemptError::Rejected(format!("HTTP {}", status)))
  }
}

/// Downloads source archives into a staging directory.
pub struct ArtifactFetcher {
  client: reqwest::Client,
  config: FetchConfig,
  downloads_dir: PathBuf,
}

impl ArtifactFetcher {
  pub fn new(config: FetchConfig, downloads_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
      .connect_timeout(config.timeout)
      .build()
      .map_err(|e| FetchError::Client(e.to_string()))?;

    Ok(Self {
      client,
      config,
      downloads_dir: downloads_dir.into(),
    })
  }

  pub fn downloads_dir(&self) -> &Path {
    &self.downloads_dir
  }

  /// Download `url` into a fresh `.part` file.
  ///
  /// The partial file is removed on every failure path.
  pub async fn fetch(&self, url: &str) -> Result<FetchedArtifact, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
      url: url.to_string(),
      message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https" | "file") {
      return Err(FetchError::InvalidUrl {
        url: url.to_string(),
        message: format!("scheme '{}' is not supported", parsed.scheme()),
      });
    }

    info!(url = %url, "fetching URL");

    let part_path = self.part_path(url).await.map_err(|source| FetchError::Io {
      url: url.to_string(),
      source,
    })?;

    let mut attempt = 0;
    loop {
      attempt += 1;
      let result = match parsed.scheme() {
        "file" => self.attempt_file(&parsed, &part_path).await,
        _ => self.attempt_http(&parsed, &part_path).await,
      };

      match result {
        Ok(writer) => {
          let len = writer.bytes_written();
          info!(url = %url, size = len, attempts = attempt, "download complete");
          return Ok(FetchedArtifact {
            url: url.to_string(),
            path: part_path,
            len,
            digest: writer.finish(),
            attempts: attempt,
          });
        }
        Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
          let delay = self.backoff(attempt);
          warn!(
            url = %url,
            attempt = attempt,
            error = %err,
            retry_in = ?delay,
            "fetch attempt failed, retrying"
          );
          tokio::time::sleep(delay).await;
        }
        Err(err) => {
          remove_partial(&part_path).await;
          return Err(err.into_fetch_error(url, attempt));
        }
      }
    }
  }

  fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    self.config.initial_backoff.saturating_mul(factor)
  }

  /// Reserve a unique staging path next to where the final artifact will live.
  async fn part_path(&self, url: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(&self.downloads_dir).await?;
    let prefix = format!(".{}.", url_to_filename(url));
    let (_file, path) = tempfile::Builder::new()
      .prefix(&prefix)
      .suffix(".part")
      .tempfile_in(&self.downloads_dir)?
      .keep()?;
    Ok(path)
  }

  async fn attempt_http(&self, url: &Url, dest: &Path) -> Result<DigestWriter, AttemptError> {
    let mut response = self
      .client
      .get(url.clone())
      .timeout(self.config.timeout)
      .send()
      .await
      .map_err(classify_reqwest)?;

    if let Some(err) = classify_status(response.status()) {
      return Err(err);
    }

    let mut file = fs::File::create(dest).await.map_err(AttemptError::Io)?;
    let mut writer = DigestWriter::new();

    while let Some(chunk) = response.chunk().await.map_err(classify_reqwest)? {
      writer.update(&chunk);
      file.write_all(&chunk).await.map_err(AttemptError::Io)?;
    }

    file.flush().await.map_err(AttemptError::Io)?;
    file.sync_all().await.map_err(AttemptError::Io)?;
    Ok(writer)
  }

  async fn attempt_file(&self, url: &Url, dest: &Path) -> Result<DigestWriter, AttemptError> {
    let source = url
      .to_file_path()
      .map_err(|_| AttemptError::Rejected(format!("not a local path: {}", url)))?;

    let mut input = match fs::File::open(&source).await {
      Ok(f) => f,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(AttemptError::NotFound(format!("no such file {}", source.display())));
      }
      Err(e) => return Err(AttemptError::Io(e)),
    };

    let mut output = fs::File::create(dest).await.map_err(AttemptError::Io)?;
    let mut writer = DigestWriter::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
      let n = input.read(&mut buffer).await.map_err(AttemptError::Io)?;
      if n == 0 {
        break;
      }
      writer.update(&buffer[..n]);
      output.write_all(&buffer[..n]).await.map_err(AttemptError::Io)?;
    }

    output.flush().await.map_err(AttemptError::Io)?;
    debug!(path = %source.display(), "copied local source");
    Ok(writer)
  }
}

async fn remove_partial(path: &Path) {
  if let Err(e) = fs::remove_file(path).await
    && e.kind() != io::ErrorKind::NotFound
  {
    warn!(path = %path.display(), error = %e, "failed to remove partial download");
  }
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to hash of URL
/// if no suitable filename can be extracted.
pub fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split(['?', '#']).next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  format!("download_{}", &hash_bytes(url.as_bytes()).to_hex()[..16])
}

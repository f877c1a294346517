//! Build execution.
//!
//! A build unpacks a verified source archive into a private workdir and runs
//! the recipe's steps in it through a [`ProcessRunner`]. Steps are scheduled
//! as DAG waves (see [`plan`]); within a wave they run concurrently up to the
//! worker limit. A recipe flagged `deparallelize`, or a worker limit of one,
//! gets a single-worker queue that runs steps strictly one after another.
//!
//! # Workdir Layout
//!
//! ```text
//! <workdir>/
//! ├── src/        # extracted archive; the build runs in its single top-level dir
//! ├── home/       # HOME for build steps
//! └── tmp/        # TMPDIR/TMP/TEMP for build steps
//! ```
//!
//! # Step Environment
//!
//! Steps start from an empty environment and receive only:
//!
//! - `PATH` (configured, or the host's)
//! - `HOME`, `TMPDIR`, `TMP`, `TEMP` pointing into the workdir
//! - `LANG=C`, `LC_ALL=C`, `SOURCE_DATE_EPOCH`
//! - `KILN_PREFIX`, `KILN_JOBS`, `MAKEFLAGS=-j<workers>`
//! - the step's own `env` entries

mod extract;
pub mod plan;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::consts::{DEFAULT_BUILD_TIMEOUT_SECS, JOBS_ENV, PREFIX_ENV, SOURCE_DATE_EPOCH};
use crate::process::{ProcessRequest, ProcessRunner};
use crate::recipe::{Recipe, Step};
use crate::verify::VerifiedArtifact;

pub use plan::{StepCycle, step_waves};

/// Captured stderr kept in errors, from the end of the output.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
  /// Maximum number of steps running at once.
  pub jobs: usize,
  /// Limit for each individual step.
  pub timeout: Option<Duration>,
  /// `PATH` given to steps; the host `PATH` when unset.
  pub path: Option<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      timeout: Some(Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECS)),
      path: None,
    }
  }
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("step '{step}' failed: `{command}` exited with {}: {stderr}", describe_exit(.code))]
  ExitNonZero {
    step: String,
    command: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("step '{step}' timed out after {after:?}: `{command}`")]
  Timeout {
    step: String,
    command: String,
    after: Duration,
  },

  #[error("step '{step}' could not start `{command}`: {source}")]
  Spawn {
    step: String,
    command: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to extract {archive}: {message}")]
  Extract { archive: PathBuf, message: String },

  #[error("build did not produce '{}'", .path.display())]
  MissingOutput { path: PathBuf },

  #[error("recipe {recipe}: build steps form a dependency cycle")]
  Cycle { recipe: String },

  #[error("failed to prepare build directory {path}: {source}")]
  Workdir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("build task failed: {0}")]
  Task(String),
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(c) => format!("code {}", c),
    None => "no exit code (killed by signal)".to_string(),
  }
}

/// One file or directory to place into the install target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
  /// Absolute path inside the build tree.
  pub source: PathBuf,
  /// Relative to the install target.
  pub dest: PathBuf,
}

/// What a successful build hands to the installer, in recipe order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallManifest {
  entries: Vec<ManifestEntry>,
}

impl InstallManifest {
  pub fn new(entries: Vec<ManifestEntry>) -> Self {
    Self { entries }
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }
}

/// Runs recipe builds.
pub struct BuildExecutor<R> {
  runner: Arc<R>,
  config: BuildConfig,
  prefix: PathBuf,
}

impl<R: ProcessRunner + 'static> BuildExecutor<R> {
  /// `prefix` is only exported to steps; nothing is written there.
  pub fn new(runner: Arc<R>, config: BuildConfig, prefix: impl Into<PathBuf>) -> Self {
    Self {
      runner,
      config,
      prefix: prefix.into(),
    }
  }

  /// Number of steps allowed to run at once for `recipe`.
  pub fn workers(&self, recipe: &Recipe) -> usize {
    if recipe.deparallelize { 1 } else { self.config.jobs.max(1) }
  }

  /// Extract `artifact` under `workdir`, run every step, and collect the install manifest.
  pub async fn run_build(
    &self,
    recipe: &Recipe,
    artifact: &VerifiedArtifact,
    workdir: &Path,
  ) -> Result<InstallManifest, BuildError> {
    let workers = self.workers(recipe);
    info!(
      recipe = %recipe.name,
      steps = recipe.steps.len(),
      workers,
      "starting build"
    );

    for dir in ["home", "tmp"] {
      let path = workdir.join(dir);
      tokio::fs::create_dir_all(&path)
        .await
        .map_err(|source| BuildError::Workdir { path, source })?;
    }

    let archive = artifact.path().to_path_buf();
    let src_dir = workdir.join("src");
    let src_root = tokio::task::spawn_blocking(move || extract::extract_source(&archive, &src_dir))
      .await
      .map_err(|e| BuildError::Task(e.to_string()))??;

    let waves = step_waves(&recipe.steps).map_err(|_| BuildError::Cycle {
      recipe: recipe.name.clone(),
    })?;
    let env = self.base_env(workdir, workers);
    let requests: Vec<ProcessRequest> = recipe
      .steps
      .iter()
      .map(|step| self.request_for(step, &src_root, &env))
      .collect();

    if workers == 1 {
      for idx in waves.into_iter().flatten() {
        run_step(self.runner.as_ref(), &recipe.steps[idx].name, requests[idx].clone()).await?;
      }
    } else {
      let semaphore = Arc::new(Semaphore::new(workers));
      for (wave_idx, wave) in waves.into_iter().enumerate() {
        debug!(wave = wave_idx, steps = wave.len(), "running wave");
        self
          .run_wave(&recipe.steps, &requests, &wave, Arc::clone(&semaphore))
          .await?;
      }
    }

    let mut entries = Vec::with_capacity(recipe.install.len());
    for item in &recipe.install {
      let source = src_root.join(&item.from);
      if tokio::fs::symlink_metadata(&source).await.is_err() {
        return Err(BuildError::MissingOutput {
          path: item.from.clone(),
        });
      }
      entries.push(ManifestEntry {
        source,
        dest: item.to.clone(),
      });
    }

    info!(recipe = %recipe.name, outputs = entries.len(), "build finished");
    Ok(InstallManifest::new(entries))
  }

  async fn run_wave(
    &self,
    steps: &[Step],
    requests: &[ProcessRequest],
    wave: &[usize],
    semaphore: Arc<Semaphore>,
  ) -> Result<(), BuildError> {
    let mut join_set = JoinSet::new();

    for &idx in wave {
      let runner = Arc::clone(&self.runner);
      let semaphore = Arc::clone(&semaphore);
      let name = steps[idx].name.clone();
      let request = requests[idx].clone();

      join_set.spawn(async move {
        let _permit = semaphore
          .acquire_owned()
          .await
          .map_err(|e| BuildError::Task(e.to_string()))?;
        run_step(runner.as_ref(), &name, request).await
      });
    }

    while let Some(joined) = join_set.join_next().await {
      let result = match joined {
        Ok(result) => result,
        Err(e) => {
          error!(error = %e, "build step task panicked");
          Err(BuildError::Task(e.to_string()))
        }
      };
      if let Err(e) = result {
        join_set.abort_all();
        return Err(e);
      }
    }

    Ok(())
  }

  fn base_env(&self, workdir: &Path, workers: usize) -> BTreeMap<String, String> {
    let path = self
      .config
      .path
      .clone()
      .or_else(|| std::env::var("PATH").ok())
      .unwrap_or_default();
    let tmp = workdir.join("tmp").display().to_string();

    BTreeMap::from([
      ("PATH".to_string(), path),
      ("HOME".to_string(), workdir.join("home").display().to_string()),
      ("TMPDIR".to_string(), tmp.clone()),
      ("TMP".to_string(), tmp.clone()),
      ("TEMP".to_string(), tmp),
      ("LANG".to_string(), "C".to_string()),
      ("LC_ALL".to_string(), "C".to_string()),
      ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string()),
      (PREFIX_ENV.to_string(), self.prefix.display().to_string()),
      (JOBS_ENV.to_string(), workers.to_string()),
      ("MAKEFLAGS".to_string(), format!("-j{}", workers)),
    ])
  }

  fn request_for(&self, step: &Step, src_root: &Path, base_env: &BTreeMap<String, String>) -> ProcessRequest {
    let mut env = base_env.clone();
    env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    ProcessRequest {
      program: resolve_program(&step.program, src_root),
      args: step.args.clone(),
      workdir: src_root.to_path_buf(),
      env,
      timeout: self.config.timeout,
    }
  }
}

/// `./wheel.sh` and `scripts/build` name files in the source tree; bare names are looked up on `PATH`.
fn resolve_program(program: &str, src_root: &Path) -> PathBuf {
  let path = Path::new(program);
  if path.is_relative() && path.components().count() > 1 {
    src_root.join(path)
  } else {
    path.to_path_buf()
  }
}

async fn run_step<R: ProcessRunner>(runner: &R, name: &str, request: ProcessRequest) -> Result<(), BuildError> {
  let command = request.display_command();
  let timeout = request.timeout;
  info!(step = %name, command = %command, "running step");

  let output = runner.execute(request).await.map_err(|source| BuildError::Spawn {
    step: name.to_string(),
    command: command.clone(),
    source,
  })?;

  if output.timed_out {
    return Err(BuildError::Timeout {
      step: name.to_string(),
      command,
      after: timeout.unwrap_or_default(),
    });
  }
  if output.exit_code != Some(0) {
    debug!(step = %name, stdout = %output.stdout, "failed step stdout");
    return Err(BuildError::ExitNonZero {
      step: name.to_string(),
      command,
      code: output.exit_code,
      stderr: tail(&output.stderr, STDERR_TAIL_BYTES).trim_end().to_string(),
    });
  }

  debug!(step = %name, "step finished");
  Ok(())
}

fn tail(s: &str, max: usize) -> &str {
  if s.len() <= max {
    return s;
  }
  let mut start = s.len() - max;
  while !s.is_char_boundary(start) {
    start += 1;
  }
  &s[start..]
}

#[cfg(test)]
pub mod testutil {
  use std::fs::File;
  use std::path::{Path, PathBuf};

  use flate2::Compression;
  use flate2::write::GzEncoder;

  use crate::verify::{VerifiedArtifact, hash_file};

  /// Write a `.tar.gz` holding `(path, content, mode)` entries and return its path.
  pub fn tarball(dir: &Path, entries: &[(&str, &str, u32)]) -> PathBuf {
    let path = dir.join("source.tar.gz");
    let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content, mode) in entries {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(*mode);
      header.set_entry_type(tar::EntryType::Regular);
      builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
  }

  /// Treat a local file as already verified.
  pub fn verified(path: &Path) -> VerifiedArtifact {
    let digest = hash_file(path).unwrap();
    VerifiedArtifact::from_cache("file:///test", path, &digest).unwrap().unwrap()
  }
}

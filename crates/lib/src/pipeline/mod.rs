//! The install pipeline.
//!
//! Stages run strictly in order and each must succeed before the next begins:
//!
//! ```text
//! resolve → dependencies → fetch → verify → build → install → smoke test
//! ```
//!
//! A verified artifact is promoted into the download cache, so a later run
//! with the same checksum skips the network entirely. A failing smoke test
//! does not undo the install; it is reported as
//! [`PipelineOutcome::InstalledUnverified`].

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::build::{BuildConfig, BuildError, BuildExecutor, InstallManifest};
use crate::deps::{ChainIndex, MissingDependencies, PackageIndex, PathIndex, ReceiptIndex, ensure_dependencies};
use crate::fetch::{ArtifactFetcher, FetchError};
use crate::install::{InstallError, InstallReport, Installer};
use crate::platform::paths;
use crate::process::ProcessRunner;
use crate::receipt::{InstallReceipt, ReceiptError, ReceiptStore};
use crate::recipe::{Recipe, RecipeError, RecipeRegistry};
use crate::smoke::{self, TestFailure};
use crate::verify::{IntegrityError, VerifiedArtifact, verify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Resolve,
  Dependencies,
  Fetch,
  Verify,
  Build,
  Install,
  Test,
}

impl Stage {
  pub fn as_str(self) -> &'static str {
    match self {
      Stage::Resolve => "resolve",
      Stage::Dependencies => "dependency check",
      Stage::Fetch => "fetch",
      Stage::Verify => "verify",
      Stage::Build => "build",
      Stage::Install => "install",
      Stage::Test => "smoke test",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Error)]
pub enum StageError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Dependencies(#[from] MissingDependencies),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Integrity(#[from] IntegrityError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error(transparent)]
  Receipt(#[from] ReceiptError),

  #[error(transparent)]
  Test(#[from] TestFailure),

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },
}

/// A failed stage, with the recipe it failed for.
#[derive(Debug, Error)]
#[error("{recipe}: {stage} failed: {source}")]
pub struct PipelineError {
  pub recipe: String,
  pub stage: Stage,
  #[source]
  pub source: StageError,
}

#[derive(Debug)]
pub enum PipelineOutcome {
  /// Installed and the smoke test passed.
  Installed(InstallReport),
  /// Installed, but the smoke test failed. The files stay in place.
  InstalledUnverified { report: InstallReport, failure: TestFailure },
}

impl PipelineOutcome {
  pub fn report(&self) -> &InstallReport {
    match self {
      PipelineOutcome::Installed(report) => report,
      PipelineOutcome::InstalledUnverified { report, .. } => report,
    }
  }
}

/// Everything needed to take a recipe from name to installed files.
pub struct Pipeline<R> {
  registry: RecipeRegistry,
  fetcher: ArtifactFetcher,
  runner: Arc<R>,
  build: BuildConfig,
  prefix: PathBuf,
  builds_dir: PathBuf,
  locks_dir: PathBuf,
  receipts: ReceiptStore,
  index: Option<Box<dyn PackageIndex + Send + Sync>>,
}

impl<R: ProcessRunner + 'static> Pipeline<R> {
  /// Build sandboxes, locks and receipts default to the data root; see [`paths`].
  pub fn new(
    registry: RecipeRegistry,
    fetcher: ArtifactFetcher,
    runner: Arc<R>,
    build: BuildConfig,
    prefix: impl Into<PathBuf>,
  ) -> Self {
    Self {
      registry,
      fetcher,
      runner,
      build,
      prefix: prefix.into(),
      builds_dir: paths::builds_dir(),
      locks_dir: paths::locks_dir(),
      receipts: ReceiptStore::new(paths::receipts_dir()),
      index: None,
    }
  }

  pub fn with_builds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.builds_dir = dir.into();
    self
  }

  pub fn with_locks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.locks_dir = dir.into();
    self
  }

  pub fn with_receipts(mut self, receipts: ReceiptStore) -> Self {
    self.receipts = receipts;
    self
  }

  /// Replace the default index (receipts, then `PATH`).
  pub fn with_index(mut self, index: impl PackageIndex + Send + Sync + 'static) -> Self {
    self.index = Some(Box::new(index));
    self
  }

  pub fn registry(&self) -> &RecipeRegistry {
    &self.registry
  }

  pub fn receipts(&self) -> &ReceiptStore {
    &self.receipts
  }

  pub fn prefix(&self) -> &Path {
    &self.prefix
  }

  /// Resolve, check, fetch, verify, build, install and smoke test `name`.
  pub async fn install_test_pipeline(&self, name: &str) -> Result<PipelineOutcome, PipelineError> {
    let fail = |stage: Stage| {
      move |source: StageError| PipelineError {
        recipe: name.to_string(),
        stage,
        source,
      }
    };

    let recipe = self
      .registry
      .get_recipe(name)
      .map_err(|e| fail(Stage::Resolve)(e.into()))?;
    info!(recipe = %recipe.name, version = %recipe.version, "installing");

    self.check_dependencies(&recipe).map_err(fail(Stage::Dependencies))?;

    let artifact = self.obtain_artifact(&recipe).await?;

    // The build tree must outlive the install, which copies out of it.
    let (workdir, manifest) = self.build(&recipe, &artifact).await.map_err(fail(Stage::Build))?;
    let report = self.install(&recipe, manifest).await.map_err(fail(Stage::Install))?;
    drop(workdir);

    match smoke::run_test(&recipe, &self.prefix, self.runner.as_ref()).await {
      Ok(()) => {
        info!(recipe = %recipe.name, files = report.files.len(), "installed and verified");
        Ok(PipelineOutcome::Installed(report))
      }
      Err(failure) => {
        warn!(recipe = %recipe.name, error = %failure, "installed but verification failed");
        Ok(PipelineOutcome::InstalledUnverified { report, failure })
      }
    }
  }

  /// Re-run the smoke test of an installed recipe.
  pub async fn test_installed(&self, name: &str) -> Result<(), PipelineError> {
    let fail = |stage: Stage, source: StageError| PipelineError {
      recipe: name.to_string(),
      stage,
      source,
    };

    let recipe = self
      .registry
      .get_recipe(name)
      .map_err(|e| fail(Stage::Resolve, e.into()))?;
    smoke::run_test(&recipe, &self.prefix, self.runner.as_ref())
      .await
      .map_err(|e| fail(Stage::Test, e.into()))
  }

  fn check_dependencies(&self, recipe: &Recipe) -> Result<(), StageError> {
    match &self.index {
      Some(index) => ensure_dependencies(recipe, index.as_ref())?,
      None => {
        let index = ChainIndex::new()
          .with(ReceiptIndex::new(self.receipts.clone()))
          .with(PathIndex::from_env());
        ensure_dependencies(recipe, &index)?
      }
    }
    Ok(())
  }

  /// Cached artifact if it still verifies, otherwise fetch, verify and promote.
  async fn obtain_artifact(&self, recipe: &Recipe) -> Result<VerifiedArtifact, PipelineError> {
    let fail = |stage: Stage, source: StageError| PipelineError {
      recipe: recipe.name.clone(),
      stage,
      source,
    };
    let cache_path = self.fetcher.downloads_dir().join(recipe.archive_filename());

    match VerifiedArtifact::from_cache(&recipe.url, &cache_path, &recipe.sha256) {
      Ok(Some(cached)) => {
        info!(recipe = %recipe.name, path = %cache_path.display(), "using cached download");
        return Ok(cached);
      }
      Ok(None) => {}
      Err(e) => debug!(path = %cache_path.display(), error = %e, "ignoring unreadable cache entry"),
    }

    let fetched = self
      .fetcher
      .fetch(&recipe.url)
      .await
      .map_err(|e| fail(Stage::Fetch, e.into()))?;

    let verified = verify(fetched, &recipe.sha256).map_err(|e| fail(Stage::Verify, e.into()))?;

    verified.promote(&cache_path).map_err(|source| {
      fail(
        Stage::Verify,
        StageError::Io {
          context: format!("failed to store {}", cache_path.display()),
          source,
        },
      )
    })
  }

  async fn build(&self, recipe: &Recipe, artifact: &VerifiedArtifact) -> Result<(TempDir, InstallManifest), StageError> {
    std::fs::create_dir_all(&self.builds_dir).map_err(|source| StageError::Io {
      context: format!("failed to create {}", self.builds_dir.display()),
      source,
    })?;
    let workdir = tempfile::Builder::new()
      .prefix(&format!("{}-", recipe.name))
      .tempdir_in(&self.builds_dir)
      .map_err(|source| StageError::Io {
        context: format!("failed to create a build directory in {}", self.builds_dir.display()),
        source,
      })?;
    debug!(workdir = %workdir.path().display(), "created build directory");

    let executor = BuildExecutor::new(Arc::clone(&self.runner), self.build.clone(), &self.prefix);
    let manifest = executor.run_build(recipe, artifact, workdir.path()).await?;
    Ok((workdir, manifest))
  }

  /// Install and record the receipt as one unit: if the receipt cannot be
  /// written, the installed files are rolled back.
  async fn install(&self, recipe: &Recipe, manifest: InstallManifest) -> Result<InstallReport, StageError> {
    let owned: HashSet<PathBuf> = match self.receipts.load(&recipe.name)? {
      Some(receipt) if receipt.prefix == self.prefix => receipt.files.into_iter().collect(),
      _ => HashSet::new(),
    };

    let installer = Installer::new(&self.prefix)
      .with_lock_dir(&self.locks_dir)
      .with_command(format!("kiln install {}", recipe.name));
    let receipts = self.receipts.clone();
    let (name, version, prefix) = (recipe.name.clone(), recipe.version.clone(), self.prefix.clone());

    tokio::task::spawn_blocking(move || -> Result<InstallReport, StageError> {
      let tx = installer.begin(&manifest, &owned)?;
      let receipt = InstallReceipt::new(&name, &version, &prefix, tx.report().files.clone());
      if let Err(e) = receipts.save(&receipt) {
        warn!(recipe = %name, error = %e, "could not record the install, rolling back");
        tx.rollback();
        return Err(e.into());
      }
      Ok(tx.commit())
    })
    .await
    .map_err(|e| StageError::Io {
      context: "install task failed".to_string(),
      source: io::Error::other(e),
    })?
  }
}

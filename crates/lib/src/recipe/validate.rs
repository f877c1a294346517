use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use semver::VersionReq;
use thiserror::Error;

use super::types::{Dependency, InstallEntry, Recipe, RecipeDef, SmokeTest, Step};
use crate::build::plan::step_waves;
use crate::verify::{DigestParseError, Sha256Digest};

/// Version pattern applied to the archive name when a recipe omits `version`.
static URL_VERSION: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"v?(\d+(?:\.\d+)+)").expect("version pattern is valid"));

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
  #[error("recipe {recipe}: missing required field '{field}'")]
  MissingField { recipe: String, field: &'static str },

  #[error("recipe name '{0}' must be lowercase letters, digits, '.', '_', '+' or '-'")]
  InvalidName(String),

  #[error("recipe {recipe}: malformed sha256 '{value}': {reason}")]
  InvalidChecksum {
    recipe: String,
    value: String,
    reason: DigestParseError,
  },

  #[error("recipe {recipe}: invalid url '{url}': {message}")]
  InvalidUrl {
    recipe: String,
    url: String,
    message: String,
  },

  #[error("recipe {recipe}: cannot infer a version from '{url}', set 'version'")]
  UnknownVersion { recipe: String, url: String },

  #[error("recipe {recipe}: dependency '{dependency}' has invalid version requirement '{requirement}': {message}")]
  InvalidVersionReq {
    recipe: String,
    dependency: String,
    requirement: String,
    message: String,
  },

  #[error("recipe {recipe}: invalid command '{command}': {message}")]
  InvalidCommand {
    recipe: String,
    command: String,
    message: String,
  },

  #[error("recipe {recipe}: duplicate step name '{name}'")]
  DuplicateStep { recipe: String, name: String },

  #[error("recipe {recipe}: step '{step}' needs unknown step '{needs}'")]
  UnknownStep {
    recipe: String,
    step: String,
    needs: String,
  },

  #[error("recipe {recipe}: steps form a dependency cycle")]
  StepCycle { recipe: String },

  #[error("recipe {recipe}: path '{path}' must be relative and stay inside its directory")]
  InvalidPath { recipe: String, path: String },

  #[error("recipe {recipe}: invalid test pattern '{pattern}': {message}")]
  InvalidPattern {
    recipe: String,
    pattern: String,
    message: String,
  },
}

/// Check a recipe definition and produce the immutable [`Recipe`].
pub fn validate(def: &RecipeDef) -> Result<Recipe, ValidationError> {
  let name = required(def.name.as_deref(), "<unnamed>", "name")?.to_string();
  if !is_valid_name(&name) {
    return Err(ValidationError::InvalidName(name));
  }
  let recipe = name.as_str();

  let url = required(def.url.as_deref(), recipe, "url")?.to_string();
  let parsed = Url::parse(&url).map_err(|e| ValidationError::InvalidUrl {
    recipe: name.clone(),
    url: url.clone(),
    message: e.to_string(),
  })?;
  if !matches!(parsed.scheme(), "http" | "https" | "file") {
    return Err(ValidationError::InvalidUrl {
      recipe: name.clone(),
      url: url.clone(),
      message: format!("scheme '{}' is not supported", parsed.scheme()),
    });
  }

  let raw_sha = required(def.sha256.as_deref(), recipe, "sha256")?;
  let sha256: Sha256Digest = raw_sha.parse().map_err(|reason| ValidationError::InvalidChecksum {
    recipe: name.clone(),
    value: raw_sha.to_string(),
    reason,
  })?;

  let version = match def.version.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
    Some(v) => v.to_string(),
    None => version_from_url(&url).ok_or_else(|| ValidationError::UnknownVersion {
      recipe: name.clone(),
      url: url.clone(),
    })?,
  };

  let mut dependencies = Vec::with_capacity(def.depends_on.len());
  for dep in &def.depends_on {
    if dep.name.trim().is_empty() {
      return Err(ValidationError::MissingField {
        recipe: name.clone(),
        field: "depends_on.name",
      });
    }
    let version = match dep.version.as_deref() {
      Some(req) => Some(VersionReq::parse(req).map_err(|e| ValidationError::InvalidVersionReq {
        recipe: name.clone(),
        dependency: dep.name.clone(),
        requirement: req.to_string(),
        message: e.to_string(),
      })?),
      None => None,
    };
    dependencies.push(Dependency {
      name: dep.name.clone(),
      version,
      role: dep.role,
    });
  }

  let steps = validate_steps(def, recipe)?;

  if def.install.is_empty() {
    return Err(ValidationError::MissingField {
      recipe: name.clone(),
      field: "install",
    });
  }
  let mut install = Vec::with_capacity(def.install.len());
  for entry in &def.install {
    install.push(InstallEntry {
      from: contained_path(&entry.from, recipe)?,
      to: contained_path(&entry.to, recipe)?,
    });
  }

  let test = validate_test(def, recipe)?;

  let recipe = Recipe {
    name,
    desc: def.desc.clone(),
    homepage: def.homepage.clone(),
    url,
    sha256,
    license: def.license.clone(),
    version,
    head: def.head.clone(),
    dependencies,
    steps,
    install,
    deparallelize: def.deparallelize,
    test,
  };

  let pattern = recipe.expanded_test_pattern();
  if let Err(e) = Regex::new(&pattern) {
    return Err(ValidationError::InvalidPattern {
      recipe: recipe.name,
      pattern: recipe.test.expect,
      message: e.to_string(),
    });
  }

  Ok(recipe)
}

fn required<'a>(value: Option<&'a str>, recipe: &str, field: &'static str) -> Result<&'a str, ValidationError> {
  match value.map(str::trim) {
    Some(v) if !v.is_empty() => Ok(v),
    _ => Err(ValidationError::MissingField {
      recipe: recipe.to_string(),
      field,
    }),
  }
}

fn is_valid_name(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
    && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '+' | '-'))
}

/// Infer a version like `0.2.1` from the archive name of `url`.
pub fn version_from_url(url: &str) -> Option<String> {
  let filename = url.split(['?', '#']).next()?.rsplit('/').next()?;
  URL_VERSION
    .captures(filename)
    .and_then(|c| c.get(1))
    .map(|m| m.as_str().to_string())
}

fn validate_steps(def: &RecipeDef, recipe: &str) -> Result<Vec<Step>, ValidationError> {
  let mut by_name: HashMap<String, usize> = HashMap::new();
  let mut steps = Vec::with_capacity(def.steps.len());

  for (idx, step) in def.steps.iter().enumerate() {
    let name = step.name.clone().unwrap_or_else(|| step.run.trim().to_string());
    if by_name.insert(name.clone(), idx).is_some() {
      return Err(ValidationError::DuplicateStep {
        recipe: recipe.to_string(),
        name,
      });
    }

    let argv = split_command(&step.run, recipe)?;
    let (program, args) = argv.split_first().map(|(p, a)| (p.clone(), a.to_vec())).unwrap_or_default();

    steps.push(Step {
      name,
      run: step.run.clone(),
      program,
      args,
      env: step.env.clone(),
      needs: Vec::new(),
    });
  }

  for (idx, step) in def.steps.iter().enumerate() {
    let needs = match &step.needs {
      None if idx == 0 => Vec::new(),
      None => vec![idx - 1],
      Some(names) => {
        let mut resolved = Vec::with_capacity(names.len());
        for needed in names {
          let dep = by_name.get(needed).copied().ok_or_else(|| ValidationError::UnknownStep {
            recipe: recipe.to_string(),
            step: steps[idx].name.clone(),
            needs: needed.clone(),
          })?;
          resolved.push(dep);
        }
        resolved
      }
    };
    steps[idx].needs = needs;
  }

  if step_waves(&steps).is_err() {
    return Err(ValidationError::StepCycle {
      recipe: recipe.to_string(),
    });
  }

  Ok(steps)
}

fn validate_test(def: &RecipeDef, recipe: &str) -> Result<SmokeTest, ValidationError> {
  let command = required(def.test_command.as_deref(), recipe, "test.command")?.to_string();
  let expect = required(def.test_expected_pattern.as_deref(), recipe, "test.expect")?.to_string();

  let argv = split_command(&command, recipe)?;
  contained_path(&argv[0], recipe)?;

  Ok(SmokeTest { command, argv, expect })
}

fn split_command(command: &str, recipe: &str) -> Result<Vec<String>, ValidationError> {
  let invalid = |message: String| ValidationError::InvalidCommand {
    recipe: recipe.to_string(),
    command: command.to_string(),
    message,
  };
  let argv = shell_words::split(command).map_err(|e| invalid(e.to_string()))?;
  if argv.is_empty() {
    return Err(invalid("command is empty".to_string()));
  }
  Ok(argv)
}

/// Accept only relative paths without `..`, so joins stay under their base directory.
fn contained_path(raw: &str, recipe: &str) -> Result<PathBuf, ValidationError> {
  let path = Path::new(raw);
  let contained = !raw.trim().is_empty()
    && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    && path.components().any(|c| matches!(c, Component::Normal(_)));
  if contained {
    Ok(path.to_path_buf())
  } else {
    Err(ValidationError::InvalidPath {
      recipe: recipe.to_string(),
      path: raw.to_string(),
    })
  }
}

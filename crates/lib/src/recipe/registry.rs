use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::RecipeError;
use super::lua::load_recipe_file;
use super::types::{Recipe, RecipeDef};
use super::validate::validate;

const RECIPE_EXTENSION: &str = "lua";

/// Validated recipes by name.
#[derive(Debug, Default, Clone)]
pub struct RecipeRegistry {
  recipes: BTreeMap<String, Arc<Recipe>>,
}

impl RecipeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Load and validate every `<name>.lua` file in `dir`.
  ///
  /// A missing directory yields an empty registry. Any malformed recipe fails
  /// the whole load.
  pub fn load_dir(dir: &Path) -> Result<Self, RecipeError> {
    let mut registry = Self::new();
    let read_dir = match fs::read_dir(dir) {
      Ok(rd) => rd,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %dir.display(), "recipe directory does not exist");
        return Ok(registry);
      }
      Err(source) => {
        return Err(RecipeError::ReadDir {
          path: dir.to_path_buf(),
          source,
        });
      }
    };

    let mut files = Vec::new();
    for entry in read_dir {
      let entry = entry.map_err(|source| RecipeError::ReadDir {
        path: dir.to_path_buf(),
        source,
      })?;
      let path = entry.path();
      if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(RECIPE_EXTENSION) {
        files.push(path);
      }
    }
    files.sort();

    for path in files {
      trace!(path = %path.display(), "loading recipe file");
      let recipe = load_file(&path)?;
      registry.insert(recipe);
    }

    debug!(path = %dir.display(), count = registry.len(), "loaded recipes");
    Ok(registry)
  }

  /// Add an already validated recipe, replacing any recipe with the same name.
  pub fn insert(&mut self, recipe: Recipe) -> Arc<Recipe> {
    let recipe = Arc::new(recipe);
    self.recipes.insert(recipe.name.clone(), Arc::clone(&recipe));
    recipe
  }

  /// Validate `def` and add it.
  pub fn register(&mut self, def: &RecipeDef) -> Result<Arc<Recipe>, RecipeError> {
    Ok(self.insert(validate(def)?))
  }

  pub fn get_recipe(&self, name: &str) -> Result<Arc<Recipe>, RecipeError> {
    self
      .recipes
      .get(name)
      .cloned()
      .ok_or_else(|| RecipeError::NotFound(name.to_string()))
  }

  /// Recipe names in sorted order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.recipes.keys().map(String::as_str)
  }

  /// Recipes in name order.
  pub fn recipes(&self) -> impl Iterator<Item = &Arc<Recipe>> {
    self.recipes.values()
  }

  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }
}

fn load_file(path: &Path) -> Result<Recipe, RecipeError> {
  let def = load_recipe_file(path)?;
  let recipe = validate(&def).map_err(|source| RecipeError::InvalidFile {
    path: path.to_path_buf(),
    source,
  })?;

  let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
  if recipe.name != stem {
    return Err(RecipeError::NameMismatch {
      path: PathBuf::from(path),
      name: recipe.name,
    });
  }
  debug!(name = %recipe.name, version = %recipe.version, "loaded recipe");
  Ok(recipe)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::recipe::testutil::{WHEEL_SHA256, wheel_def};
  use tempfile::TempDir;

  fn write_recipe(dir: &Path, file: &str, name: &str) {
    let source = format!(
      r#"return {{
        name = "{name}",
        url = "https://example.com/{name}-1.0.tar.gz",
        sha256 = "{WHEEL_SHA256}",
        steps = {{ "make" }},
        install = {{ "{name}" }},
        test = {{ command = "bin/{name} --version", expect = "{{version}}" }},
      }}"#
    );
    fs::write(dir.join(file), source).unwrap();
  }

  #[test]
  fn loads_recipes_from_directory() {
    let temp = TempDir::new().unwrap();
    write_recipe(temp.path(), "zap.lua", "zap");
    write_recipe(temp.path(), "hello.lua", "hello");
    fs::write(temp.path().join("README.md"), "not a recipe").unwrap();

    let registry = RecipeRegistry::load_dir(temp.path()).unwrap();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["hello", "zap"]);

    let hello = registry.get_recipe("hello").unwrap();
    assert_eq!(hello.version, "1.0");
    assert_eq!(hello.install[0].to, PathBuf::from("bin/hello"));
  }

  #[test]
  fn unknown_name_is_not_found() {
    let registry = RecipeRegistry::new();
    assert!(matches!(registry.get_recipe("nope"), Err(RecipeError::NotFound(n)) if n == "nope"));
  }

  #[test]
  fn missing_directory_is_empty() {
    let temp = TempDir::new().unwrap();
    let registry = RecipeRegistry::load_dir(&temp.path().join("absent")).unwrap();
    assert!(registry.is_empty());
  }

  #[test]
  fn malformed_recipe_fails_load_with_path() {
    let temp = TempDir::new().unwrap();
    write_recipe(temp.path(), "good.lua", "good");
    fs::write(temp.path().join("bad.lua"), "return {").unwrap();

    let err = RecipeRegistry::load_dir(temp.path()).unwrap_err();
    assert!(matches!(&err, RecipeError::Eval { path, .. } if path.ends_with("bad.lua")));
  }

  #[test]
  fn invalid_recipe_names_its_file() {
    let temp = TempDir::new().unwrap();
    fs::write(
      temp.path().join("short.lua"),
      r#"return { name = "short", url = "https://e.com/short-1.0.tar.gz", sha256 = "abc",
        install = { "short" }, test = { command = "bin/short", expect = "x" } }"#,
    )
    .unwrap();

    let err = RecipeRegistry::load_dir(temp.path()).unwrap_err();
    assert!(err.to_string().contains("short.lua"));
    assert!(matches!(err, RecipeError::InvalidFile { .. }));
  }

  #[test]
  fn file_name_must_match_recipe_name() {
    let temp = TempDir::new().unwrap();
    write_recipe(temp.path(), "alias.lua", "real");

    assert!(matches!(
      RecipeRegistry::load_dir(temp.path()),
      Err(RecipeError::NameMismatch { name, .. }) if name == "real"
    ));
  }

  #[test]
  fn register_validates() {
    let mut registry = RecipeRegistry::new();
    let recipe = registry.register(&wheel_def()).unwrap();
    assert_eq!(recipe.name, "wheel");
    assert_eq!(registry.get_recipe("wheel").unwrap(), recipe);

    let mut bad = wheel_def();
    bad.name = Some("other".to_string());
    bad.sha256 = Some("abc".to_string());
    assert!(matches!(registry.register(&bad), Err(RecipeError::Invalid(_))));
    assert_eq!(registry.len(), 1);
  }
}

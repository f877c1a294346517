//! Reading recipe files.
//!
//! A recipe file is a Lua chunk returning a single table. The chunk runs in a
//! restricted runtime (only `table`, `string` and `math`), so a recipe can
//! compute values (`"v" .. version .. ".tar.gz"`) but cannot touch the
//! filesystem or spawn processes.
//!
//! ```lua
//! local version = "0.2.1"
//! return {
//!   name = "wheel",
//!   url = "https://github.com/ceramicstudio/wheel/archive/refs/tags/v" .. version .. ".tar.gz",
//!   sha256 = "4025dc804f1e1d98852c555049f314bb74f20f0a6ff60cdee15470e85ebb2dc9",
//!   depends_on = { { name = "curl", role = "build" }, "node" },
//!   steps = { "./wheel.sh", "./wheel" },   -- or `install_steps`
//!   install = { "wheel" },
//!   test = { command = "bin/wheel --version", expect = "wheel-3box {version}" },
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use mlua::prelude::*;

use super::RecipeError;
use super::types::{DependencyDef, DependencyRole, InstallDef, RecipeDef, StepDef};

/// Create the restricted runtime recipes are evaluated in.
fn create_runtime() -> LuaResult<Lua> {
  Lua::new_with(
    LuaStdLib::TABLE | LuaStdLib::STRING | LuaStdLib::MATH,
    LuaOptions::default(),
  )
}

/// Evaluate a recipe file and extract its fields.
pub fn load_recipe_file(path: &Path) -> Result<RecipeDef, RecipeError> {
  let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  load_recipe_str(&content, &path.display().to_string()).map_err(|source| RecipeError::Eval {
    path: path.to_path_buf(),
    message: source.to_string(),
  })
}

/// Evaluate recipe source. `chunk_name` only appears in Lua error messages.
pub fn load_recipe_str(source: &str, chunk_name: &str) -> LuaResult<RecipeDef> {
  let lua = create_runtime()?;
  let value = lua.load(source).set_name(format!("@{}", chunk_name)).eval::<LuaValue>()?;

  match value {
    LuaValue::Table(table) => parse_recipe_table(&table),
    other => Err(LuaError::external(format!(
      "recipe must return a table, got {}",
      other.type_name()
    ))),
  }
}

/// Top-level keys a recipe table may set.
const RECIPE_KEYS: &[&str] = &[
  "name",
  "desc",
  "homepage",
  "url",
  "sha256",
  "license",
  "version",
  "head",
  "deparallelize",
  "depends_on",
  "steps",
  "install_steps",
  "install",
  "test",
  "test_command",
  "test_expected_pattern",
];

fn check_keys(table: &LuaTable) -> LuaResult<()> {
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, _) = pair?;
    let name = match &key {
      LuaValue::String(s) => s.to_str()?.to_string(),
      other => {
        return Err(LuaError::external(format!(
          "recipe field names must be strings, got {}",
          other.type_name()
        )));
      }
    };
    if !RECIPE_KEYS.contains(&name.as_str()) {
      return Err(LuaError::external(format!("unknown recipe field '{}'", name)));
    }
  }
  Ok(())
}

fn parse_recipe_table(table: &LuaTable) -> LuaResult<RecipeDef> {
  check_keys(table)?;

  let mut def = RecipeDef {
    name: table.get("name")?,
    desc: table.get("desc")?,
    homepage: table.get("homepage")?,
    url: table.get("url")?,
    sha256: table.get("sha256")?,
    license: table.get("license")?,
    version: table.get("version")?,
    head: table.get("head")?,
    deparallelize: table.get::<Option<bool>>("deparallelize")?.unwrap_or(false),
    test_command: table.get("test_command")?,
    test_expected_pattern: table.get("test_expected_pattern")?,
    ..Default::default()
  };

  if let Some(deps) = table.get::<Option<LuaTable>>("depends_on")? {
    for value in deps.sequence_values::<LuaValue>() {
      def.depends_on.push(parse_dependency(value?)?);
    }
  }

  let steps = match (
    table.get::<Option<LuaTable>>("steps")?,
    table.get::<Option<LuaTable>>("install_steps")?,
  ) {
    (Some(_), Some(_)) => {
      return Err(LuaError::external("set either 'steps' or 'install_steps', not both"));
    }
    (steps, install_steps) => steps.or(install_steps),
  };
  if let Some(steps) = steps {
    for value in steps.sequence_values::<LuaValue>() {
      def.steps.push(parse_step(value?)?);
    }
  }

  if let Some(install) = table.get::<Option<LuaTable>>("install")? {
    for value in install.sequence_values::<LuaValue>() {
      def.install.push(parse_install(value?)?);
    }
  }

  if let Some(test) = table.get::<Option<LuaTable>>("test")? {
    if let Some(command) = test.get::<Option<String>>("command")? {
      def.test_command = Some(command);
    }
    if let Some(expect) = test.get::<Option<String>>("expect")? {
      def.test_expected_pattern = Some(expect);
    }
  }

  Ok(def)
}

fn parse_dependency(value: LuaValue) -> LuaResult<DependencyDef> {
  match value {
    LuaValue::String(s) => Ok(DependencyDef::runtime(&s.to_str()?)),
    LuaValue::Table(t) => {
      let name: String = t
        .get("name")
        .map_err(|_| LuaError::external("dependency requires 'name' field"))?;
      let role = match t.get::<Option<String>>("role")?.as_deref() {
        None | Some("runtime") => DependencyRole::Runtime,
        Some("build") => DependencyRole::Build,
        Some(other) => {
          return Err(LuaError::external(format!(
            "dependency '{}' has unknown role '{}' (expected 'build' or 'runtime')",
            name, other
          )));
        }
      };
      Ok(DependencyDef {
        name,
        version: t.get("version")?,
        role,
      })
    }
    other => Err(LuaError::external(format!(
      "dependency must be a string or table, got {}",
      other.type_name()
    ))),
  }
}

fn parse_step(value: LuaValue) -> LuaResult<StepDef> {
  match value {
    LuaValue::String(s) => Ok(StepDef::new(&s.to_str()?)),
    LuaValue::Table(t) => {
      let run: String = t
        .get("run")
        .map_err(|_| LuaError::external("step requires 'run' field"))?;

      let mut env = BTreeMap::new();
      if let Some(env_table) = t.get::<Option<LuaTable>>("env")? {
        for pair in env_table.pairs::<String, String>() {
          let (key, value) = pair?;
          env.insert(key, value);
        }
      }

      let needs = match t.get::<Option<LuaTable>>("needs")? {
        Some(list) => Some(list.sequence_values::<String>().collect::<LuaResult<Vec<_>>>()?),
        None => None,
      };

      Ok(StepDef {
        name: t.get("name")?,
        run,
        env,
        needs,
      })
    }
    other => Err(LuaError::external(format!(
      "step must be a string or table, got {}",
      other.type_name()
    ))),
  }
}

fn parse_install(value: LuaValue) -> LuaResult<InstallDef> {
  match value {
    // `"wheel"` installs an executable into bin/
    LuaValue::String(s) => {
      let from = s.to_str()?.to_string();
      let file_name = Path::new(&from)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| from.clone());
      Ok(InstallDef {
        to: format!("bin/{}", file_name),
        from,
      })
    }
    LuaValue::Table(t) => {
      let from: String = t
        .get("from")
        .map_err(|_| LuaError::external("install entry requires 'from' field"))?;
      let to: String = t
        .get("to")
        .map_err(|_| LuaError::external("install entry requires 'to' field"))?;
      Ok(InstallDef { from, to })
    }
    other => Err(LuaError::external(format!(
      "install entry must be a string or table, got {}",
      other.type_name()
    ))),
  }
}

use predicates::prelude::*;

use super::common::TestEnv;

const WHEEL_SHA: &str = "4025dc804f1e1d98852c555049f314bb74f20f0a6ff60cdee15470e85ebb2dc9";

fn sample_recipes() -> TestEnv {
  let env = TestEnv::new();
  env.write_wheel_recipe(
    "https://github.com/ceramicstudio/wheel/archive/refs/tags/v0.2.1.tar.gz",
    WHEEL_SHA,
    r#"head = "https://github.com/ceramicstudio/wheel.git","#,
  );
  env
}

#[test]
fn info_shows_recipe_details() {
  let env = sample_recipes();

  env
    .kiln_cmd()
    .args(["info", "wheel"])
    .assert()
    .success()
    .stdout(predicate::str::contains("wheel 0.2.1"))
    .stdout(predicate::str::contains("curl (build)"))
    .stdout(predicate::str::contains("node (runtime)"))
    .stdout(predicate::str::contains("Build mode: sequential"))
    .stdout(predicate::str::contains("Head: https://github.com/ceramicstudio/wheel.git"))
    .stdout(predicate::str::contains("Installed: no"));
}

#[test]
fn info_json_is_valid() {
  let env = sample_recipes();

  let output = env.kiln_cmd().args(["info", "wheel", "--json"]).output().unwrap();
  assert!(output.status.success());

  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value["name"], "wheel");
  assert_eq!(value["version"], "0.2.1");
  assert_eq!(value["sha256"], WHEEL_SHA);
  assert_eq!(value["deparallelize"], true);
  assert!(value["installed"].is_null());
}

#[test]
fn info_unknown_recipe_exits_2() {
  let env = sample_recipes();

  env
    .kiln_cmd()
    .args(["info", "nope"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("recipe not found: nope"));
}

#[test]
fn list_shows_every_recipe() {
  let env = sample_recipes();

  env
    .kiln_cmd()
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("wheel 0.2.1"));
}

#[test]
fn list_json_reports_install_state() {
  let env = sample_recipes();

  let output = env.kiln_cmd().args(["list", "--json"]).output().unwrap();
  assert!(output.status.success());

  let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(value[0]["name"], "wheel");
  assert!(value[0]["installed"].is_null());
}

#[test]
fn list_with_no_recipes() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("No recipes in"));
}

#[test]
fn malformed_recipe_exits_2_with_its_path() {
  let env = TestEnv::new();
  env.write_recipe(
    "broken",
    r#"return { name = "broken", url = "https://example.com/broken-1.0.tar.gz", sha256 = "abc" }"#,
  );

  env
    .kiln_cmd()
    .arg("list")
    .assert()
    .code(2)
    .stderr(predicate::str::contains("broken.lua"))
    .stderr(predicate::str::contains("malformed sha256"));
}

#[test]
fn config_file_sets_recipes_dir() {
  let env = sample_recipes();
  let config = env.temp.path().join("kiln.toml");
  std::fs::write(
    &config,
    format!("recipes_dir = '{}'\n", env.recipes_path().display()),
  )
  .unwrap();

  env
    .kiln_cmd()
    .env_remove("KILN_RECIPES")
    .env("KILN_CONFIG", &config)
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("wheel"));
}

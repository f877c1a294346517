use predicates::prelude::*;

use super::common::{TestEnv, wheel_tree};

/// An environment where every wheel dependency resolves.
fn wheel_env(version_output: &str, extra: &str) -> TestEnv {
  let env = TestEnv::new();
  for tool in ["curl", "jq", "node"] {
    env.provide_tool(tool);
  }
  let (url, sha) = env.source_archive(&wheel_tree(version_output));
  env.write_wheel_recipe(&url, &sha, extra);
  env
}

#[test]
fn install_builds_installs_and_verifies() {
  let env = wheel_env("wheel-3box 0.2.1", "");

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Installed wheel 0.2.1"))
    .stdout(predicate::str::contains("Files: 1"));

  assert!(env.installed("bin/wheel").is_file());
  let receipt = std::fs::read_to_string(env.receipt_path("wheel")).unwrap();
  assert!(receipt.contains("bin/wheel"));

  env
    .kiln_cmd()
    .args(["test", "wheel"])
    .assert()
    .success()
    .stdout(predicate::str::contains("wheel passed its smoke test"));
}

#[test]
fn reinstall_replaces_its_own_files() {
  let env = wheel_env("wheel-3box 0.2.1", "");

  env.kiln_cmd().args(["install", "wheel"]).assert().success();
  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Replaced: 1"));
}

#[test]
fn missing_dependencies_exit_3_and_list_all() {
  let env = TestEnv::new();
  env.provide_tool("jq");
  let (url, sha) = env.source_archive(&wheel_tree("wheel-3box 0.2.1"));
  env.write_wheel_recipe(&url, &sha, "");

  env
    .kiln_cmd()
    .env("PATH", env.bin_path())
    .args(["install", "wheel"])
    .assert()
    .code(3)
    .stderr(predicate::str::contains("2 missing dependencies"))
    .stderr(predicate::str::contains("curl"))
    .stderr(predicate::str::contains("node"));

  assert!(!env.installed("bin/wheel").exists());
}

#[test]
fn checksum_mismatch_exits_5_without_building() {
  let env = TestEnv::new();
  for tool in ["curl", "jq", "node"] {
    env.provide_tool(tool);
  }
  let (url, _) = env.source_archive(&wheel_tree("wheel-3box 0.2.1"));
  env.write_wheel_recipe(&url, &"0".repeat(64), "");

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .code(5)
    .stderr(predicate::str::contains("checksum mismatch"));

  assert!(!env.installed("bin/wheel").exists());
  assert!(!env.receipt_path("wheel").exists());
}

#[test]
fn failing_step_exits_6() {
  let env = TestEnv::new();
  for tool in ["curl", "jq", "node"] {
    env.provide_tool(tool);
  }
  let tree = vec![(
    "wheel-0.2.1/wheel.sh".to_string(),
    "#!/bin/sh\necho 'bootstrap failed' >&2\nexit 3\n".to_string(),
  )];
  let (url, sha) = env.source_archive(&tree);
  env.write_wheel_recipe(&url, &sha, "");

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .code(6)
    .stderr(predicate::str::contains("bootstrap failed"));

  assert!(!env.installed("bin/wheel").exists());
}

#[test]
fn smoke_test_failure_exits_8_and_keeps_files() {
  let env = wheel_env("wheel-3box 0.2.1", r#"version = "9.9.9","#);

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .code(8)
    .stderr(predicate::str::contains("smoke test failed"))
    .stdout(predicate::str::contains("Got: wheel-3box 0.2.1"));

  assert!(env.installed("bin/wheel").is_file());

  env.kiln_cmd().args(["test", "wheel"]).assert().code(8);
}

#[test]
fn unknown_recipe_exits_2() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["install", "nope"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("recipe not found: nope"));
}

#[test]
fn prefix_flag_overrides_environment() {
  let env = wheel_env("wheel-3box 0.2.1", "");
  let other = env.temp.path().join("elsewhere");

  env
    .kiln_cmd()
    .arg("--prefix")
    .arg(&other)
    .args(["install", "wheel"])
    .assert()
    .success();

  assert!(other.join("bin/wheel").is_file());
  assert!(!env.installed("bin/wheel").exists());
}

#[test]
fn unreachable_source_exits_4() {
  let env = TestEnv::new();
  for tool in ["curl", "jq", "node"] {
    env.provide_tool(tool);
  }
  let missing = env.temp.path().join("gone/wheel-0.2.1.tar.gz");
  env.write_wheel_recipe(&format!("file://{}", missing.display()), &"0".repeat(64), "");

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .code(4)
    .stderr(predicate::str::contains("fetch failed"));

  assert!(!env.installed("bin").exists());
}

#[test]
fn foreign_file_in_the_way_exits_7_and_is_kept() {
  let env = wheel_env("wheel-3box 0.2.1", "");
  std::fs::create_dir_all(env.installed("bin")).unwrap();
  std::fs::write(env.installed("bin/wheel"), "not ours").unwrap();

  env
    .kiln_cmd()
    .args(["install", "wheel"])
    .assert()
    .code(7)
    .stderr(predicate::str::contains("is not owned by this recipe"));

  assert_eq!(std::fs::read_to_string(env.installed("bin/wheel")).unwrap(), "not ours");
  let names: Vec<_> = std::fs::read_dir(env.prefix_path())
    .unwrap()
    .map(|e| e.unwrap().file_name())
    .collect();
  assert_eq!(names, vec!["bin"]);
  assert!(!env.receipt_path("wheel").exists());
}

//! Shared test helpers for CLI integration tests.

use std::fs::File;
use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// A source tree whose `wheel.sh` writes a `wheel` script printing `version_output`.
pub fn wheel_tree(version_output: &str) -> Vec<(String, String)> {
  vec![(
    "wheel-0.2.1/wheel.sh".to_string(),
    format!(
      "#!/bin/sh\nprintf '#!/bin/sh\\necho {}\\n' > wheel\nchmod +x wheel\n",
      version_output
    ),
  )]
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding recipes, kiln's state,
/// the cache and the install prefix.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  fn dir(&self, name: &str) -> PathBuf {
    let p = self.temp.path().join(name);
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn recipes_path(&self) -> PathBuf {
    self.dir("recipes")
  }

  pub fn root_path(&self) -> PathBuf {
    self.dir("kiln")
  }

  pub fn prefix_path(&self) -> PathBuf {
    self.dir("prefix")
  }

  pub fn cache_path(&self) -> PathBuf {
    self.dir("cache")
  }

  pub fn config_path(&self) -> PathBuf {
    self.dir("config")
  }

  /// Directory of stand-in executables searched for dependencies.
  pub fn bin_path(&self) -> PathBuf {
    self.dir("bin")
  }

  pub fn write_recipe(&self, name: &str, content: &str) {
    std::fs::write(self.recipes_path().join(format!("{}.lua", name)), content).unwrap();
  }

  /// Put an executable named `name` into [`bin_path`](Self::bin_path).
  #[cfg(unix)]
  pub fn provide_tool(&self, name: &str) {
    use std::os::unix::fs::PermissionsExt;

    let path = self.bin_path().join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  }

  /// Write a gzipped source archive and return its `file://` URL and SHA-256.
  pub fn source_archive(&self, files: &[(String, String)]) -> (String, String) {
    let path = self.dir("upstream").join("wheel-0.2.1.tar.gz");
    let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(0o755);
      header.set_entry_type(tar::EntryType::Regular);
      builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    let digest = hex::encode(Sha256::digest(std::fs::read(&path).unwrap()));
    (format!("file://{}", path.display()), digest)
  }

  /// Write a wheel recipe pointing at a local archive.
  pub fn write_wheel_recipe(&self, url: &str, sha256: &str, extra: &str) {
    self.write_recipe(
      "wheel",
      &format!(
        r#"
return {{
  name = "wheel",
  desc = "ComposeDB and Ceramic Setup Tool",
  url = "{url}",
  sha256 = "{sha256}",
  depends_on = {{ {{ name = "curl", role = "build" }}, {{ name = "jq", role = "build" }}, "node" }},
  deparallelize = true,
  steps = {{ "./wheel.sh", "./wheel" }},
  install = {{ {{ from = "wheel", to = "bin/wheel" }} }},
  test = {{ command = "bin/wheel --version", expect = "wheel-3box {{version}}" }},
  {extra}
}}
"#
      ),
    );
  }

  /// A kiln command isolated to this environment.
  ///
  /// `PATH` is the stand-in bin directory followed by the system directories
  /// the build scripts need.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.env("KILN_ROOT", self.root_path());
    cmd.env("KILN_RECIPES", self.recipes_path());
    cmd.env("KILN_PREFIX", self.prefix_path());
    cmd.env("XDG_CACHE_HOME", self.cache_path());
    cmd.env("XDG_CONFIG_HOME", self.config_path());
    cmd.env("LOCALAPPDATA", self.cache_path());
    cmd.env("APPDATA", self.config_path());
    cmd.env("PATH", format!("{}:/usr/bin:/bin", self.bin_path().display()));
    cmd.env_remove("KILN_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd
  }

  pub fn installed(&self, relative: &str) -> PathBuf {
    self.prefix_path().join(relative)
  }

  pub fn receipt_path(&self, name: &str) -> PathBuf {
    self.root_path().join("receipts").join(format!("{}.json", name))
  }
}

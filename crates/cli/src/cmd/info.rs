//! Implementation of the `kiln info` command.

use std::process::ExitCode;

use anyhow::Result;
use serde::Serialize;

use kiln_lib::config::Config;
use kiln_lib::receipt::InstallReceipt;
use kiln_lib::recipe::Recipe;

use super::{load_registry, receipt_store};
use crate::output::{format_unix_time, print_json, print_stat, print_success, symbols};

#[derive(Serialize)]
struct InfoOutput<'a> {
  #[serde(flatten)]
  recipe: &'a Recipe,
  installed: Option<&'a InstallReceipt>,
}

pub fn cmd_info(config: &Config, name: &str, json: bool) -> Result<ExitCode> {
  let registry = load_registry(config)?;
  let recipe = registry.get_recipe(name)?;
  let receipt = receipt_store().load(name)?;

  if json {
    print_json(&InfoOutput {
      recipe: &recipe,
      installed: receipt.as_ref(),
    })?;
    return Ok(ExitCode::SUCCESS);
  }

  print_success(&format!("{} {}", recipe.name, recipe.version));
  if let Some(desc) = &recipe.desc {
    print_stat("Description", desc);
  }
  if let Some(homepage) = &recipe.homepage {
    print_stat("Homepage", homepage);
  }
  if let Some(license) = &recipe.license {
    print_stat("License", license);
  }
  print_stat("Source", &recipe.url);
  print_stat("SHA-256", &recipe.sha256.to_hex());
  if let Some(head) = &recipe.head {
    print_stat("Head", head);
  }
  print_stat(
    "Build mode",
    if recipe.deparallelize {
      "sequential"
    } else {
      "parallel"
    },
  );

  if !recipe.dependencies.is_empty() {
    println!();
    println!("Dependencies:");
    for dep in &recipe.dependencies {
      println!("  {} {}", symbols::INFO, dep);
    }
  }

  println!();
  println!("Steps:");
  for step in &recipe.steps {
    if step.name == step.run {
      println!("  {} {}", symbols::INFO, step.run);
    } else {
      println!("  {} {}: {}", symbols::INFO, step.name, step.run);
    }
  }

  println!();
  println!("Installs:");
  for entry in &recipe.install {
    println!(
      "  {} {} {} {}",
      symbols::INFO,
      entry.from.display(),
      symbols::ARROW,
      entry.to.display()
    );
  }

  println!();
  print_stat("Test", &recipe.test.command);
  print_stat("Expect", &recipe.expanded_test_pattern());

  println!();
  match receipt {
    Some(receipt) => {
      print_stat("Installed", &format!("{} in {}", receipt.version, receipt.prefix.display()));
      print_stat("Installed at", &format_unix_time(receipt.installed_at_unix));
      print_stat("Files", &receipt.files.len().to_string());
    }
    None => print_stat("Installed", "no"),
  }

  Ok(ExitCode::SUCCESS)
}

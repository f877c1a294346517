//! Implementation of the `kiln list` command.

use std::process::ExitCode;

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use kiln_lib::config::Config;

use super::{load_registry, receipt_store};
use crate::output::{print_info, print_json, symbols};

#[derive(Serialize)]
struct ListEntry<'a> {
  name: &'a str,
  version: &'a str,
  desc: Option<&'a str>,
  installed: Option<String>,
}

pub fn cmd_list(config: &Config, json: bool) -> Result<ExitCode> {
  let registry = load_registry(config)?;
  let receipts = receipt_store();

  let mut entries = Vec::with_capacity(registry.len());
  for recipe in registry.recipes() {
    let installed = receipts.load(&recipe.name)?.map(|r| r.version);
    entries.push(ListEntry {
      name: &recipe.name,
      version: &recipe.version,
      desc: recipe.desc.as_deref(),
      installed,
    });
  }

  if json {
    print_json(&entries)?;
    return Ok(ExitCode::SUCCESS);
  }

  if entries.is_empty() {
    print_info(&format!("No recipes in {}", config.recipes_dir.display()));
    return Ok(ExitCode::SUCCESS);
  }

  for entry in &entries {
    let marker = if entry.installed.is_some() {
      symbols::SUCCESS
    } else {
      symbols::INFO
    };
    let desc = entry
      .desc
      .map(|d| format!(" {}", d.if_supports_color(Stream::Stdout, |s| s.dimmed())))
      .unwrap_or_default();
    println!("  {} {} {}{}", marker, entry.name, entry.version, desc);
  }

  Ok(ExitCode::SUCCESS)
}

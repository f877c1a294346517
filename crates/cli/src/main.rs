mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use kiln_lib::config::Config;

use crate::cmd::{cmd_info, cmd_install, cmd_list, cmd_test, exit_code_for};
use crate::output::{format_error, print_error};

/// kiln - build and install packages from recipes
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Directory holding <name>.lua recipes
  #[arg(long, global = true, value_name = "DIR")]
  recipes: Option<PathBuf>,

  /// Install target
  #[arg(long, global = true, value_name = "DIR")]
  prefix: Option<PathBuf>,

  /// Maximum concurrent build steps (recipes may force one)
  #[arg(short, long, global = true, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
  jobs: Option<u32>,

  /// Increase log output (-v info, -vv debug)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch, verify, build, install and smoke test a recipe
  Install {
    /// Recipe name
    recipe: String,
  },

  /// Re-run the smoke test of an installed recipe
  Test {
    /// Recipe name
    recipe: String,
  },

  /// Show a recipe and its install state
  Info {
    /// Recipe name
    recipe: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// List available recipes
  List {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  match run(cli) {
    Ok(code) => code,
    Err(err) => {
      print_error(&format_error(&err));
      ExitCode::from(exit_code_for(&err))
    }
  }
}

fn run(cli: Cli) -> Result<ExitCode> {
  let config = load_config(&cli)?;

  match cli.command {
    Commands::Install { recipe } => cmd_install(&config, &recipe),
    Commands::Test { recipe } => cmd_test(&config, &recipe),
    Commands::Info { recipe, json } => cmd_info(&config, &recipe, json),
    Commands::List { json } => cmd_list(&config, json),
  }
}

/// Config file and environment, then flags on top.
fn load_config(cli: &Cli) -> Result<Config> {
  let mut config = Config::load().context("Failed to load configuration")?;
  if let Some(dir) = &cli.recipes {
    config.recipes_dir = dir.clone();
  }
  if let Some(prefix) = &cli.prefix {
    config.prefix = prefix.clone();
  }
  if let Some(jobs) = cli.jobs {
    config.build.jobs = jobs as usize;
  }
  debug!(
    recipes = %config.recipes_dir.display(),
    prefix = %config.prefix.display(),
    jobs = config.build.jobs,
    "resolved configuration"
  );
  Ok(config)
}

fn init_logging(verbose: u8) {
  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    1 => EnvFilter::new("info"),
    _ => EnvFilter::new("debug"),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

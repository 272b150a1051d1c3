//! Command-line interface: `build`, `watch` and `list`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;

use crate::driver::{self, BuildOptions, BuildReport};
use crate::models::Mode;
use crate::pipeline::Pipeline;
use crate::watch::watch_and_serve;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "wasm-site-bundler")]
#[command(about = "Build WebAssembly example crates into deployable static sites")]
#[command(version)]
pub struct Cli {
  /// Project root containing the examples
  #[arg(long, global = true, default_value = ".")]
  pub root: PathBuf,

  /// Root configuration file (defaults to <root>/wasm-bundle.json)
  #[arg(long, global = true)]
  pub config: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  pub verbose: u8,

  /// Only log warnings and errors
  #[arg(short, long, global = true, conflicts_with = "verbose")]
  pub quiet: bool,

  /// Subcommand to run.
  #[command(subcommand)]
  pub command: Commands,
}

/// Target selection and build flags shared by `build` and `watch`.
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
  /// Only build these examples
  pub names: Vec<String>,

  /// Optimised build with content-hashed filenames
  #[arg(long)]
  pub release: bool,

  /// Maximum number of examples built at once
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Manifest glob relative to the root
  #[arg(long)]
  pub pattern: Option<String>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
  /// Build every example once
  Build(BuildArgs),
  /// Build, then rebuild examples as their sources change and serve their output
  Watch(BuildArgs),
  /// List discovered examples and their resolved output directories
  List {
    /// Manifest glob relative to the root
    #[arg(long)]
    pattern: Option<String>,
  },
}

impl Cli {
  /// Maximum log level selected by `-v` and `-q`.
  pub fn log_level(&self) -> tracing::Level {
    if self.quiet {
      return tracing::Level::WARN;
    }
    match self.verbose {
      0 => tracing::Level::INFO,
      1 => tracing::Level::DEBUG,
      _ => tracing::Level::TRACE,
    }
  }

  /// Driver options for a `build` or `watch` invocation.
  pub fn build_options(&self, args: &BuildArgs) -> BuildOptions {
    BuildOptions {
      root: self.root.clone(),
      config_path: self.config.clone(),
      pattern: args.pattern.clone(),
      mode: if args.release {
        Mode::Production
      } else {
        Mode::Development
      },
      jobs: args.jobs,
      only: args.names.clone(),
    }
  }
}

/// Run the parsed command. Returns `Ok(false)` when a build finished with failed targets.
pub async fn run(cli: Cli) -> Result<bool> {
  match &cli.command {
    Commands::Build(args) => build_once(&cli.build_options(args)).await,
    Commands::Watch(args) => watch_mode(&cli.build_options(args)).await,
    Commands::List { pattern } => {
      let options = BuildOptions {
        pattern: pattern.clone(),
        ..cli.build_options(&BuildArgs::default())
      };
      list(&options)
    }
  }
}

async fn build_once(options: &BuildOptions) -> Result<bool> {
  let pipeline = Pipeline::default();
  let report = tokio::select! {
    report = driver::run_build(options, &pipeline) => report.context("build could not start")?,
    signal = tokio::signal::ctrl_c() => {
      signal.context("failed to listen for ctrl-c")?;
      anyhow::bail!("interrupted");
    }
  };

  print_summary(&report);
  Ok(report.success())
}

async fn watch_mode(options: &BuildOptions) -> Result<bool> {
  let plan = driver::plan(options).context("watch could not start")?;
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let mut session = tokio::spawn(watch_and_serve(plan, Pipeline::default(), shutdown_rx));

  tokio::select! {
    finished = &mut session => finished??,
    signal = tokio::signal::ctrl_c() => {
      signal.context("failed to listen for ctrl-c")?;
      tracing::info!("shutting down");
      let _ = shutdown_tx.send(true);
      session.await??;
    }
  }
  Ok(true)
}

fn list(options: &BuildOptions) -> Result<bool> {
  let plan = driver::plan(options).context("discovery failed")?;
  for target in &plan.targets {
    println!(
      "{}\t{}\t{}",
      target.name,
      target.manifest_path.display(),
      target.output_dir.display()
    );
  }
  for rejected in &plan.rejected {
    if let Err(err) = &rejected.result {
      println!("{}\t{}\terror: {err}", rejected.name, rejected.manifest_path.display());
    }
  }
  Ok(plan.rejected.is_empty())
}

fn print_summary(report: &BuildReport) {
  let total = report.outcomes.len();
  eprintln!("built {} of {total} example(s)", report.succeeded());
  for outcome in report.failures() {
    if let Err(err) = &outcome.result {
      eprintln!(
        "  failed: {} ({}) during {}: {err}",
        outcome.name,
        outcome.manifest_path.display(),
        err.stage()
      );
    }
  }
}

//! Multi-target driver: discovery, configuration, collision checks and parallel builds.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::compile::CompileRequest;
use crate::config::ProjectConfig;
use crate::discovery::{DiscoveryOptions, discover_targets};
use crate::error::{ConfigError, DriverError, TargetError};
use crate::models::{AssemblyResult, BuildTarget, Mode};
use crate::pipeline::Pipeline;

/// Run-level options, usually taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  /// Project root holding the examples.
  pub root: PathBuf,
  /// Explicit root configuration file; defaults to the root's `wasm-bundle.json`.
  pub config_path: Option<PathBuf>,
  /// Manifest glob overriding the configured one.
  pub pattern: Option<String>,
  /// Build flavour.
  pub mode: Mode,
  /// Concurrency limit overriding the configured one.
  pub jobs: Option<usize>,
  /// Build only these examples.
  pub only: Vec<String>,
}

/// Outcome of one target's pipeline.
#[derive(Debug)]
pub struct TargetOutcome {
  /// Example name.
  pub name: String,
  /// Owning manifest.
  pub manifest_path: PathBuf,
  /// Assembled output or the error that stopped the pipeline.
  pub result: Result<AssemblyResult, TargetError>,
}

/// Aggregate result of a build over every target.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Outcomes ordered by manifest path.
  pub outcomes: Vec<TargetOutcome>,
}

impl BuildReport {
  /// Whether every target built.
  pub fn success(&self) -> bool {
    self.outcomes.iter().all(|outcome| outcome.result.is_ok())
  }

  /// Outcomes whose pipeline failed.
  pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
    self.outcomes.iter().filter(|outcome| outcome.result.is_err())
  }

  /// Number of targets that built.
  pub fn succeeded(&self) -> usize {
    self.outcomes.iter().filter(|outcome| outcome.result.is_ok()).count()
  }
}

/// Targets ready to build, plus those already failed during configuration.
#[derive(Debug)]
pub struct BuildPlan {
  /// Fully resolved targets.
  pub targets: Vec<BuildTarget>,
  /// Targets whose crate-local configuration was invalid.
  pub rejected: Vec<TargetOutcome>,
  /// Maximum number of concurrent pipelines.
  pub jobs: usize,
}

/// Discover and resolve every target, rejecting overlapping output directories.
pub fn plan(options: &BuildOptions) -> Result<BuildPlan, DriverError> {
  let config = load_config(options)?;
  let pattern = options
    .pattern
    .as_deref()
    .unwrap_or_else(|| config.manifest_pattern());

  let discovery = DiscoveryOptions {
    mode: options.mode,
    defaults: config.base_options(),
    only: options.only.clone(),
  };
  let stubs = discover_targets(&options.root, pattern, &discovery)?;

  let mut targets = Vec::with_capacity(stubs.len());
  let mut rejected = Vec::new();
  for stub in stubs {
    let name = stub.name.clone();
    let manifest_path = stub.manifest_path.clone();
    match config.resolve_target(stub) {
      Ok(target) => targets.push(target),
      Err(err) => rejected.push(TargetOutcome {
        name,
        manifest_path,
        result: Err(err.into()),
      }),
    }
  }

  check_output_ownership(&targets)?;
  check_output_collisions(&targets)?;

  Ok(BuildPlan {
    targets,
    rejected,
    jobs: effective_jobs(options.jobs.or(config.jobs)),
  })
}

fn load_config(options: &BuildOptions) -> Result<ProjectConfig, ConfigError> {
  match &options.config_path {
    Some(path) => ProjectConfig::from_path(path)?.ok_or_else(|| ConfigError::Io {
      path: path.clone(),
      source: std::io::Error::new(ErrorKind::NotFound, "configuration file not found"),
    }),
    None => ProjectConfig::discover(&options.root),
  }
}

/// Clamp a requested concurrency limit to `1..=available cores`.
pub fn effective_jobs(requested: Option<usize>) -> usize {
  let cores = std::thread::available_parallelism()
    .map(|cores| cores.get())
    .unwrap_or(1);
  requested.unwrap_or(cores).clamp(1, cores)
}

/// Fail when two targets share an output directory or one nests inside another.
pub fn check_output_collisions(targets: &[BuildTarget]) -> Result<(), DriverError> {
  let dirs: Vec<PathBuf> = targets
    .iter()
    .map(|target| normalize(&target.output_dir))
    .collect();

  for (i, first) in dirs.iter().enumerate() {
    for (j, second) in dirs.iter().enumerate().skip(i + 1) {
      if first.starts_with(second) || second.starts_with(first) {
        return Err(DriverError::OutputCollision {
          dir: if first.starts_with(second) {
            second.clone()
          } else {
            first.clone()
          },
          first: targets[i].name.clone(),
          second: targets[j].name.clone(),
        });
      }
    }
  }
  Ok(())
}

/// Fail when an output directory would hold or overwrite a crate's sources, its
/// staging directory or the compiler's partial directory.
///
/// Clean builds prune everything in the output directory they did not write, so an
/// output directory must never be a crate directory or one of its ancestors.
pub fn check_output_ownership(targets: &[BuildTarget]) -> Result<(), DriverError> {
  let owned: Vec<(&BuildTarget, PathBuf, Vec<PathBuf>)> = targets
    .iter()
    .map(|target| {
      let crate_dir = normalize(target.crate_dir());
      let request = CompileRequest::for_target(target);
      let paths = [
        request.staging_dir.clone(),
        request.partial_dir(),
        target.crate_dir().join("src"),
        target.crate_dir().join(&target.options.static_dir),
      ]
      .iter()
      .map(|path| normalize(path))
      .filter(|path| *path != crate_dir)
      .collect();
      (target, crate_dir, paths)
    })
    .collect();

  for target in targets {
    let dir = normalize(&target.output_dir);
    for (owner, crate_dir, paths) in &owned {
      let overlap = if crate_dir.starts_with(&dir) {
        Some(crate_dir)
      } else {
        paths
          .iter()
          .find(|path| path.starts_with(&dir) || dir.starts_with(path))
      };
      if let Some(path) = overlap {
        return Err(DriverError::OutputOverlapsSources {
          dir,
          target: target.name.clone(),
          path: path.clone(),
          owner: owner.name.clone(),
        });
      }
    }
  }
  Ok(())
}

fn normalize(path: &Path) -> PathBuf {
  let mut normalized = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        normalized.pop();
      }
      other => normalized.push(other.as_os_str()),
    }
  }
  normalized
}

/// Run every planned target's pipeline, at most `plan.jobs` at a time.
///
/// A failing target never stops the others; every outcome is collected.
pub async fn build_all(plan: BuildPlan, pipeline: &Pipeline) -> BuildReport {
  let semaphore = Arc::new(Semaphore::new(plan.jobs.max(1)));
  let mut tasks = JoinSet::new();
  let mut owners = HashMap::new();

  for target in plan.targets {
    let semaphore = Arc::clone(&semaphore);
    let pipeline = pipeline.clone();
    let name = target.name.clone();
    let manifest_path = target.manifest_path.clone();

    let handle = tasks.spawn(async move {
      let result = match semaphore.acquire_owned().await {
        Ok(_permit) => pipeline.run(&target).await,
        Err(err) => Err(TargetError::Task(err.to_string())),
      };
      TargetOutcome {
        name: target.name,
        manifest_path: target.manifest_path,
        result,
      }
    });
    owners.insert(handle.id(), (name, manifest_path));
  }

  let mut outcomes = plan.rejected;
  outcomes.iter().for_each(log_failure);
  while let Some(joined) = tasks.join_next().await {
    let outcome = match joined {
      Ok(outcome) => outcome,
      Err(err) => {
        let (name, manifest_path) = owners.remove(&err.id()).unwrap_or_default();
        TargetOutcome {
          name,
          manifest_path,
          result: Err(TargetError::Task(err.to_string())),
        }
      }
    };

    log_failure(&outcome);
    outcomes.push(outcome);
  }

  outcomes.sort_by(|a, b| a.manifest_path.cmp(&b.manifest_path));
  BuildReport { outcomes }
}

fn log_failure(outcome: &TargetOutcome) {
  if let Err(err) = &outcome.result {
    tracing::error!(
      example = %outcome.name,
      manifest = %outcome.manifest_path.display(),
      stage = err.stage(),
      error = %err,
      "target failed"
    );
  }
}

/// Plan and build every target once.
pub async fn run_build(
  options: &BuildOptions,
  pipeline: &Pipeline,
) -> Result<BuildReport, DriverError> {
  let plan = plan(options)?;
  tracing::info!(
    root = %options.root.display(),
    targets = plan.targets.len() + plan.rejected.len(),
    jobs = plan.jobs,
    mode = %options.mode,
    "starting build"
  );
  Ok(build_all(plan, pipeline).await)
}

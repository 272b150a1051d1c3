//! Manifest discovery: glob the project tree for example crates.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};

use crate::config::TargetOptions;
use crate::error::DiscoveryError;
use crate::models::{BuildTarget, Mode};

/// Directory names never descended into while scanning.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules"];

/// Global options stamped onto every discovered target stub.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
  /// Build flavour for every target.
  pub mode: Mode,
  /// Options inherited by every target before per-target overrides.
  pub defaults: TargetOptions,
  /// Restrict discovery to these example names; empty keeps everything.
  pub only: Vec<String>,
}

/// Compiled manifest glob anchored at a project root.
pub struct ManifestPattern {
  root: PathBuf,
  pattern: String,
  matcher: Override,
  max_depth: Option<usize>,
}

impl ManifestPattern {
  /// Compile a gitignore-style glob relative to `root`.
  pub fn new(root: &Path, pattern: &str) -> Result<Self, DiscoveryError> {
    let trimmed = pattern.trim().trim_start_matches("./");
    if trimmed.is_empty() || trimmed.starts_with('!') {
      return Err(DiscoveryError::InvalidPattern {
        pattern: pattern.to_string(),
        message: "pattern must select files".into(),
      });
    }

    let invalid = |err: ignore::Error| DiscoveryError::InvalidPattern {
      pattern: pattern.to_string(),
      message: err.to_string(),
    };
    let mut builder = OverrideBuilder::new(root);
    builder.add(trimmed).map_err(invalid)?;
    let matcher = builder.build().map_err(invalid)?;

    let max_depth = if trimmed.contains("**") {
      None
    } else {
      Some(trimmed.split('/').filter(|segment| !segment.is_empty()).count())
    };

    Ok(Self {
      root: root.to_path_buf(),
      pattern: trimmed.to_string(),
      matcher,
      max_depth,
    })
  }

  /// Pattern as compiled.
  pub fn as_str(&self) -> &str {
    &self.pattern
  }

  /// Whether `path`, a file below the root, matches the pattern.
  pub fn matches(&self, path: &Path) -> bool {
    self.matcher.matched(path, false).is_whitelist()
  }

  /// Walk the root and return every matching file, sorted by path.
  pub fn scan(&self) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !self.root.is_dir() {
      return Err(DiscoveryError::RootNotFound {
        path: self.root.clone(),
      });
    }

    let mut walker = WalkBuilder::new(&self.root);
    walker
      .standard_filters(false)
      .hidden(true)
      .max_depth(self.max_depth)
      .filter_entry(|entry| {
        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        !(is_dir
          && entry.depth() > 0
          && SKIPPED_DIRS
            .iter()
            .any(|skipped| entry.file_name() == *skipped))
      });

    let mut found = Vec::new();
    for entry in walker.build() {
      let entry = entry.map_err(|err| DiscoveryError::Walk {
        path: self.root.clone(),
        message: err.to_string(),
      })?;
      if !entry.file_type().is_some_and(|ft| ft.is_file()) {
        continue;
      }
      if self.matches(entry.path()) {
        found.push(entry.into_path());
      }
    }

    found.sort();
    Ok(found)
  }
}

/// Discover every example manifest under `root` and stamp target stubs from `options`.
///
/// An empty result is valid. The walk is repeated on every call; callers treat the
/// returned list as immutable for the rest of the run.
pub fn discover_targets(
  root: &Path,
  pattern: &str,
  options: &DiscoveryOptions,
) -> Result<Vec<BuildTarget>, DiscoveryError> {
  let manifests = ManifestPattern::new(root, pattern)?.scan()?;

  let mut targets: Vec<BuildTarget> = manifests
    .into_iter()
    .map(|manifest_path| stub_target(manifest_path, options))
    .collect();

  if !options.only.is_empty() {
    for name in &options.only {
      if !targets.iter().any(|target| &target.name == name) {
        return Err(DiscoveryError::UnknownExample { name: name.clone() });
      }
    }
    targets.retain(|target| options.only.contains(&target.name));
  }

  tracing::debug!(
    root = %root.display(),
    pattern,
    count = targets.len(),
    "discovered manifests"
  );

  Ok(targets)
}

fn stub_target(manifest_path: PathBuf, options: &DiscoveryOptions) -> BuildTarget {
  let crate_dir = manifest_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_default();
  let name = crate_dir
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_else(|| "root".to_string());

  BuildTarget {
    name,
    entry_path: None,
    output_dir: crate_dir.join(&options.defaults.output_dir),
    mode: options.mode,
    dev_server_port: options.defaults.dev_server_port,
    options: options.defaults.clone(),
    manifest_path,
  }
}

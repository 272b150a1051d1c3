//! Error taxonomy for discovery, configuration and the per-target pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to determine the set of build targets. Fatal for the whole run.
#[derive(Error, Debug)]
pub enum DiscoveryError {
  /// The glob could not be compiled.
  #[error("invalid manifest pattern '{pattern}': {message}")]
  InvalidPattern {
    /// Pattern as supplied.
    pattern: String,
    /// Matcher diagnostic.
    message: String,
  },

  /// The project root does not exist or is not a directory.
  #[error("project root not found: {path}")]
  RootNotFound {
    /// Root that was requested.
    path: PathBuf,
  },

  /// Walking the project tree failed.
  #[error("failed to scan {path}: {message}")]
  Walk {
    /// Directory being scanned.
    path: PathBuf,
    /// Walker diagnostic.
    message: String,
  },

  /// An example requested by name was not discovered.
  #[error("no example named '{name}' matches the manifest pattern")]
  UnknownExample {
    /// Requested name.
    name: String,
  },
}

/// Failure to read or parse a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The file exists but could not be read.
  #[error("failed to read {path}: {source}")]
  Io {
    /// Configuration file.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },

  /// The file is not valid configuration JSON.
  #[error("failed to parse {path}: {source}")]
  Parse {
    /// Configuration file.
    path: PathBuf,
    /// Source parse error.
    source: serde_json::Error,
  },
}

/// Failure of the compile step. Fails only the owning target.
#[derive(Error, Debug)]
pub enum CompileError {
  /// The manifest handed to the compiler does not exist.
  #[error("manifest not found: {path}")]
  ManifestNotFound {
    /// Missing manifest.
    path: PathBuf,
  },

  /// The compiler process could not be started.
  #[error("failed to run `{program}`: {source}")]
  Spawn {
    /// Program that was invoked.
    program: String,
    /// Source I/O error.
    source: std::io::Error,
  },

  /// The compiler exited unsuccessfully.
  #[error("`{program}` failed for {manifest} with {status}{}", format_diagnostics(.stderr))]
  Failed {
    /// Program that was invoked.
    program: String,
    /// Manifest being compiled.
    manifest: PathBuf,
    /// Exit status description.
    status: String,
    /// Captured error channel output.
    stderr: String,
  },

  /// The compiler succeeded without producing an expected file.
  #[error("compiler output missing: {path}")]
  MissingOutput {
    /// Expected output.
    path: PathBuf,
  },

  /// Preparing or publishing the staging directory failed.
  #[error("failed to prepare {path}: {source}")]
  Io {
    /// Path being modified.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },
}

fn format_diagnostics(stderr: &str) -> String {
  let trimmed = stderr.trim();
  if trimmed.is_empty() {
    String::new()
  } else {
    format!("\n{trimmed}")
  }
}

/// Failure of the bundling step. Fails only the owning target.
#[derive(Error, Debug)]
pub enum BundleError {
  /// The entry module does not exist.
  #[error("entry module not found: {path}")]
  EntryNotFound {
    /// Missing entry.
    path: PathBuf,
  },

  /// An import could not be resolved to a file.
  #[error("unresolved import '{specifier}' in {importer}")]
  UnresolvedImport {
    /// Module containing the import.
    importer: PathBuf,
    /// Specifier as written.
    specifier: String,
  },

  /// A non-script module was imported and no transform converted it.
  #[error("no loader handles {path}")]
  NoLoader {
    /// Module lacking a loader.
    path: PathBuf,
  },

  /// A transform rejected its input.
  #[error("{loader} failed on {path}: {message}")]
  Transform {
    /// Transform name.
    loader: &'static str,
    /// Module being transformed.
    path: PathBuf,
    /// Transform diagnostic.
    message: String,
  },

  /// The bundling options are inconsistent.
  #[error("invalid bundle configuration: {message}")]
  InvalidConfig {
    /// Description of the problem.
    message: String,
  },

  /// Reading a module failed.
  #[error("failed to read {path}: {source}")]
  Io {
    /// Module being read.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },
}

/// Failure of the assembly step. Fails only the owning target.
#[derive(Error, Debug)]
pub enum AssemblyError {
  /// A filesystem operation on the output directory failed.
  #[error("failed to write {path}: {source}")]
  Io {
    /// Path being written or removed.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },

  /// The HTML template could not be read.
  #[error("failed to read template {path}: {source}")]
  Template {
    /// Template file.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },

  /// The asset manifest could not be serialised.
  #[error("failed to serialise asset manifest: {0}")]
  Manifest(#[from] serde_json::Error),

  /// A configured output path would land outside the output directory.
  #[error("{option} '{path}' must stay inside the output directory")]
  OutsideOutput {
    /// Configuration key naming the path.
    option: &'static str,
    /// Offending relative path.
    path: String,
  },
}

/// Any failure scoped to a single target's pipeline.
#[derive(Error, Debug)]
pub enum TargetError {
  /// Per-crate configuration was invalid.
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// Compile step failed.
  #[error(transparent)]
  Compile(#[from] CompileError),
  /// Bundle step failed.
  #[error(transparent)]
  Bundle(#[from] BundleError),
  /// Assembly step failed.
  #[error(transparent)]
  Assembly(#[from] AssemblyError),
  /// The pipeline task panicked or was aborted.
  #[error("pipeline task did not complete: {0}")]
  Task(String),
}

impl TargetError {
  /// Short label of the failing stage.
  pub fn stage(&self) -> &'static str {
    match self {
      TargetError::Config(_) => "config",
      TargetError::Compile(_) => "compile",
      TargetError::Bundle(_) => "bundle",
      TargetError::Assembly(_) => "assemble",
      TargetError::Task(_) => "task",
    }
  }
}

/// Failure that prevents the driver from building anything.
#[derive(Error, Debug)]
pub enum DriverError {
  /// Targets could not be discovered.
  #[error(transparent)]
  Discovery(#[from] DiscoveryError),

  /// The root configuration is invalid.
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// Two targets would write into the same output directory.
  #[error("targets '{first}' and '{second}' both write to {dir}")]
  OutputCollision {
    /// Shared output directory.
    dir: PathBuf,
    /// First target claiming the directory.
    first: String,
    /// Second target claiming the directory.
    second: String,
  },

  /// A target's output directory covers sources or compiler output it does not own.
  #[error("output directory {dir} of '{target}' overlaps {path} of '{owner}'")]
  OutputOverlapsSources {
    /// Offending output directory.
    dir: PathBuf,
    /// Target writing into `dir`.
    target: String,
    /// Source or staging path inside or around `dir`.
    path: PathBuf,
    /// Target owning `path`.
    owner: String,
  },
}

/// Failure to set up watch mode or the development server.
#[derive(Error, Debug)]
pub enum WatchError {
  /// A filesystem listener could not be registered.
  #[error("failed to watch {path}: {source}")]
  Listener {
    /// Directory being watched.
    path: PathBuf,
    /// Source notify error.
    source: notify::Error,
  },

  /// The development server could not bind its port.
  #[error("failed to serve {dir} on port {port}: {source}")]
  Serve {
    /// Directory being served.
    dir: PathBuf,
    /// Requested port.
    port: u16,
    /// Source I/O error.
    source: std::io::Error,
  },
}

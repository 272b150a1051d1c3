//! Data structures produced while building an example target.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TargetOptions;

/// Build flavour shared by every stage of a target pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  /// Unoptimised compiler output, stable filenames and sourcemaps.
  #[default]
  Development,
  /// Optimised compiler output and content-hashed filenames.
  Production,
}

impl Mode {
  /// Lowercase label used in logs and the asset manifest.
  pub fn as_str(&self) -> &'static str {
    match self {
      Mode::Development => "development",
      Mode::Production => "production",
    }
  }
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One independent example project and everything needed to build it.
#[derive(Debug, Clone)]
pub struct BuildTarget {
  /// Example name, taken from the manifest's parent directory.
  pub name: String,
  /// Path to the compilation-unit descriptor (`Cargo.toml`).
  pub manifest_path: PathBuf,
  /// JavaScript entry module; `None` for manifest-driven targets.
  pub entry_path: Option<PathBuf>,
  /// Directory receiving the assembled site.
  pub output_dir: PathBuf,
  /// Build flavour.
  pub mode: Mode,
  /// Port of the development server, when this target is served.
  pub dev_server_port: Option<u16>,
  /// Fully merged per-target options.
  pub options: TargetOptions,
}

impl BuildTarget {
  /// Directory containing the manifest.
  pub fn crate_dir(&self) -> &Path {
    self.manifest_path.parent().unwrap_or_else(|| Path::new("."))
  }

  /// Directory the compiler publishes its output into.
  pub fn staging_dir(&self) -> PathBuf {
    self.crate_dir().join(&self.options.staging_dir)
  }
}

/// Published output of the compile step for one target.
#[derive(Debug, Clone)]
pub struct CompileArtifact {
  /// Compiled WebAssembly module.
  pub wasm_binary_path: PathBuf,
  /// JavaScript loader generated next to the binary.
  pub loader_module_path: PathBuf,
  /// Directory holding both files.
  pub staging_dir: PathBuf,
  /// Directories whose changes invalidate this artifact.
  pub source_watch_paths: Vec<PathBuf>,
}

/// Description of the web assets produced for a target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
  /// Name of the entry chunk.
  pub entry_name: String,
  /// Emitted filenames in load order; the entry module comes last.
  pub output_files: Vec<String>,
  /// Whether sourcemaps were emitted next to the script modules.
  pub sourcemap_present: bool,
  /// Content hash of the entry module in production builds.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_hash: Option<String>,
}

impl BundleManifest {
  /// Filename of the entry module.
  pub fn entry_file(&self) -> Option<&str> {
    self.output_files.last().map(String::as_str)
  }
}

/// One file produced by the bundler, held in memory until assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFile {
  /// Filename relative to the output directory.
  pub file_name: String,
  /// File contents.
  pub contents: Vec<u8>,
}

/// Complete in-memory result of the bundling step.
#[derive(Debug, Clone)]
pub struct BundleOutput {
  /// Manifest describing the emitted files.
  pub manifest: BundleManifest,
  /// Every emitted file, sourcemaps included.
  pub files: Vec<EmittedFile>,
}

/// Published state of a target's output directory after assembly.
#[derive(Debug, Clone, Default)]
pub struct AssemblyResult {
  /// Directory the site was assembled into.
  pub output_dir: PathBuf,
  /// Rendered HTML document.
  pub html_path: PathBuf,
  /// Files whose contents changed during this run.
  pub written: Vec<PathBuf>,
  /// Number of files already up to date.
  pub unchanged: usize,
  /// Static files installed from the project.
  pub static_files: Vec<PathBuf>,
  /// Stale files removed by a clean build.
  pub removed: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn manifest_serialises_in_camel_case_without_empty_hash() {
    let manifest = BundleManifest {
      entry_name: "main".into(),
      output_files: vec!["index_bg.wasm".into(), "index.js".into(), "main.js".into()],
      sourcemap_present: true,
      content_hash: None,
    };

    let json = serde_json::to_string(&manifest).unwrap();
    assert!(json.contains("\"entryName\":\"main\""));
    assert!(json.contains("\"sourcemapPresent\":true"));
    assert!(!json.contains("contentHash"));
    assert_eq!(manifest.entry_file(), Some("main.js"));
  }

  #[test]
  fn mode_round_trips_lowercase() {
    let mode: Mode = serde_json::from_str("\"production\"").unwrap();
    assert_eq!(mode, Mode::Production);
    assert_eq!(mode.to_string(), "production");
  }
}

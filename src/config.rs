//! Layered project configuration describing how each example is built.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{BuildTarget, Mode};

/// Root configuration file searched for in the project root.
pub const ROOT_CONFIG_FILE: &str = "wasm-bundle.json";

/// Per-crate configuration file searched for next to each manifest.
pub const CRATE_CONFIG_FILE: &str = "bundle.config.json";

/// Default glob locating example manifests relative to the project root.
pub const DEFAULT_MANIFEST_PATTERN: &str = "examples/*/Cargo.toml";

/// Fully merged options applied to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOptions {
  /// Output directory relative to the crate directory.
  pub output_dir: String,
  /// Prefix for every asset URL emitted into HTML.
  pub public_path: String,
  /// Development server port.
  pub dev_server_port: Option<u16>,
  /// Extra directories, relative to the crate, whose changes trigger rebuilds.
  pub watch_dirs: Vec<String>,
  /// Extra arguments passed through to the compiler.
  pub extra_args: Vec<String>,
  /// Skip TypeScript declaration output.
  pub no_typescript: bool,
  /// Remove files not produced by the current build from the output directory.
  pub clean: bool,
  /// Entry module relative to the crate; `None` picks `index.js` when present.
  pub entry: Option<String>,
  /// Chunk name of the entry module.
  pub entry_name: String,
  /// HTML template relative to the crate; `None` picks `index.html` when present.
  pub template: Option<String>,
  /// Name of the rendered HTML document.
  pub html_filename: String,
  /// Document title used when no template exists.
  pub title: Option<String>,
  /// Directory of static files copied verbatim into the output.
  pub static_dir: String,
  /// Individual static files copied into the output.
  pub static_files: Vec<String>,
  /// Filename template for the entry module.
  pub filename: Option<String>,
  /// Filename template for other script modules.
  pub chunk_filename: Option<String>,
  /// Filename template for non-script assets.
  pub asset_filename: Option<String>,
  /// Number of hex characters kept from content hashes.
  pub hash_length: usize,
  /// Emit sourcemaps in production too. Development builds always emit them.
  pub sourcemap: Option<bool>,
  /// Compiler output directory relative to the crate.
  pub staging_dir: String,
  /// Base name of the compiler's generated files.
  pub out_name: String,
  /// Bare import specifiers left untouched by the bundler.
  pub externals: Vec<String>,
  /// Compiler program.
  pub wasm_pack: String,
}

impl Default for TargetOptions {
  fn default() -> Self {
    Self {
      output_dir: "dist".into(),
      public_path: "/".into(),
      dev_server_port: None,
      watch_dirs: Vec::new(),
      extra_args: Vec::new(),
      no_typescript: true,
      clean: false,
      entry: None,
      entry_name: "main".into(),
      template: None,
      html_filename: "index.html".into(),
      title: None,
      static_dir: "static".into(),
      static_files: Vec::new(),
      filename: None,
      chunk_filename: None,
      asset_filename: None,
      hash_length: 20,
      sourcemap: None,
      staging_dir: "pkg".into(),
      out_name: "index".into(),
      externals: Vec::new(),
      wasm_pack: "wasm-pack".into(),
    }
  }
}

/// Sparse options as written in configuration files; unset fields inherit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct TargetOverrides {
  /// See [`TargetOptions::output_dir`].
  pub output_dir: Option<String>,
  /// See [`TargetOptions::public_path`].
  pub public_path: Option<String>,
  /// See [`TargetOptions::dev_server_port`].
  pub dev_server_port: Option<u16>,
  /// See [`TargetOptions::watch_dirs`].
  pub watch_dirs: Option<Vec<String>>,
  /// See [`TargetOptions::extra_args`].
  pub extra_args: Option<Vec<String>>,
  /// See [`TargetOptions::no_typescript`].
  pub no_typescript: Option<bool>,
  /// See [`TargetOptions::clean`].
  pub clean: Option<bool>,
  /// See [`TargetOptions::entry`].
  pub entry: Option<String>,
  /// See [`TargetOptions::entry_name`].
  pub entry_name: Option<String>,
  /// See [`TargetOptions::template`].
  pub template: Option<String>,
  /// See [`TargetOptions::html_filename`].
  pub html_filename: Option<String>,
  /// See [`TargetOptions::title`].
  pub title: Option<String>,
  /// See [`TargetOptions::static_dir`].
  pub static_dir: Option<String>,
  /// See [`TargetOptions::static_files`].
  pub static_files: Option<Vec<String>>,
  /// See [`TargetOptions::filename`].
  pub filename: Option<String>,
  /// See [`TargetOptions::chunk_filename`].
  pub chunk_filename: Option<String>,
  /// See [`TargetOptions::asset_filename`].
  pub asset_filename: Option<String>,
  /// See [`TargetOptions::hash_length`].
  pub hash_length: Option<usize>,
  /// See [`TargetOptions::sourcemap`].
  pub sourcemap: Option<bool>,
  /// See [`TargetOptions::staging_dir`].
  pub staging_dir: Option<String>,
  /// See [`TargetOptions::out_name`].
  pub out_name: Option<String>,
  /// See [`TargetOptions::externals`].
  pub externals: Option<Vec<String>>,
  /// See [`TargetOptions::wasm_pack`].
  pub wasm_pack: Option<String>,
}

macro_rules! merge_fields {
  ($options:ident, $overrides:ident, [$($field:ident),* $(,)?], [$($optional:ident),* $(,)?]) => {
    $(
      if let Some(value) = &$overrides.$field {
        $options.$field = value.clone();
      }
    )*
    $(
      if $overrides.$optional.is_some() {
        $options.$optional = $overrides.$optional.clone();
      }
    )*
  };
}

impl TargetOverrides {
  /// Apply every field set here on top of `options`.
  pub fn apply_to(&self, options: &mut TargetOptions) {
    let overrides = self;
    merge_fields!(
      options,
      overrides,
      [
        output_dir,
        public_path,
        watch_dirs,
        extra_args,
        no_typescript,
        clean,
        entry_name,
        html_filename,
        static_dir,
        static_files,
        hash_length,
        staging_dir,
        out_name,
        externals,
        wasm_pack,
      ],
      [
        dev_server_port,
        entry,
        template,
        title,
        filename,
        chunk_filename,
        asset_filename,
        sourcemap,
      ]
    );
  }

  /// Read overrides from a specific JSON file; a missing file yields `None`.
  pub fn from_path(path: &Path) -> Result<Option<Self>, ConfigError> {
    read_json(path)
  }
}

/// Discoverable root configuration shared by every example.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ProjectConfig {
  /// Manifest glob relative to the project root.
  pub pattern: Option<String>,
  /// Maximum number of targets built concurrently.
  pub jobs: Option<usize>,
  /// Overrides applied to every target.
  pub defaults: TargetOverrides,
  /// Overrides applied to individual targets, keyed by example name.
  pub targets: BTreeMap<String, TargetOverrides>,
}

impl ProjectConfig {
  /// Load configuration from the project root, falling back to defaults when absent.
  pub fn discover(root: &Path) -> Result<Self, ConfigError> {
    let candidate = root.join(ROOT_CONFIG_FILE);
    Ok(Self::from_path(&candidate)?.unwrap_or_default())
  }

  /// Read configuration from a specific JSON file; a missing file yields `None`.
  pub fn from_path(path: &Path) -> Result<Option<Self>, ConfigError> {
    read_json(path)
  }

  /// Manifest glob, defaulting to every example crate.
  pub fn manifest_pattern(&self) -> &str {
    self.pattern.as_deref().unwrap_or(DEFAULT_MANIFEST_PATTERN)
  }

  /// Options shared by all targets before per-target overrides.
  pub fn base_options(&self) -> TargetOptions {
    let mut options = TargetOptions::default();
    self.defaults.apply_to(&mut options);
    options
  }

  /// Merge the per-target layers onto a discovered stub and fill derived fields.
  ///
  /// Precedence, lowest first: the stub's options (built-in defaults and the root
  /// `defaults` section), the root `targets.<name>` section, then the crate-local
  /// [`CRATE_CONFIG_FILE`].
  pub fn resolve_target(&self, stub: BuildTarget) -> Result<BuildTarget, ConfigError> {
    let mut target = stub;
    if let Some(overrides) = self.targets.get(&target.name) {
      overrides.apply_to(&mut target.options);
    }

    let local = target.crate_dir().join(CRATE_CONFIG_FILE);
    if let Some(overrides) = TargetOverrides::from_path(&local)? {
      overrides.apply_to(&mut target.options);
    }

    Ok(finalize_target(target))
  }
}

/// Derive entry, output directory and server port from the merged options.
pub fn finalize_target(mut target: BuildTarget) -> BuildTarget {
  let crate_dir = target.crate_dir().to_path_buf();
  target.output_dir = crate_dir.join(&target.options.output_dir);
  target.dev_server_port = target.options.dev_server_port;
  target.entry_path = match &target.options.entry {
    Some(entry) => Some(crate_dir.join(entry)),
    None => {
      let candidate = crate_dir.join("index.js");
      candidate.is_file().then_some(candidate)
    }
  };
  target
}

impl TargetOptions {
  /// Template path, defaulting to `index.html` in the crate when present.
  pub fn template_path(&self, crate_dir: &Path) -> Option<PathBuf> {
    match &self.template {
      Some(template) => Some(crate_dir.join(template)),
      None => {
        let candidate = crate_dir.join("index.html");
        candidate.is_file().then_some(candidate)
      }
    }
  }

  /// Whether sourcemaps are emitted for the given mode.
  ///
  /// Development builds always carry them; `sourcemap` only opts production builds in.
  pub fn sourcemaps_for(&self, mode: Mode) -> bool {
    mode == Mode::Development || self.sourcemap == Some(true)
  }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, ConfigError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
    Err(err) => {
      return Err(ConfigError::Io {
        path: path.to_path_buf(),
        source: err,
      });
    }
  };

  serde_json::from_str(&content)
    .map(Some)
    .map_err(|err| ConfigError::Parse {
      path: path.to_path_buf(),
      source: err,
    })
}

//! Per-target compile step driving `wasm-pack` into a private staging directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::process::Command;

use crate::error::CompileError;
use crate::models::{BuildTarget, CompileArtifact, Mode};

/// Everything the compiler needs to build one example crate.
#[derive(Debug, Clone)]
pub struct CompileRequest {
  /// Manifest of the crate being compiled.
  pub manifest_path: PathBuf,
  /// Directory the artifact is published into.
  pub staging_dir: PathBuf,
  /// Base name of the generated files.
  pub out_name: String,
  /// Build flavour.
  pub mode: Mode,
  /// Skip TypeScript declaration output.
  pub no_typescript: bool,
  /// Extra compiler arguments.
  pub extra_args: Vec<String>,
  /// Compiler program.
  pub program: String,
  /// Directories whose changes invalidate the artifact.
  pub watch_paths: Vec<PathBuf>,
}

impl CompileRequest {
  /// Build the request for a resolved target.
  pub fn for_target(target: &BuildTarget) -> Self {
    let crate_dir = target.crate_dir();
    let mut watch_paths = vec![crate_dir.to_path_buf()];
    watch_paths.extend(
      target
        .options
        .watch_dirs
        .iter()
        .map(|dir| crate_dir.join(dir)),
    );

    Self {
      manifest_path: target.manifest_path.clone(),
      staging_dir: target.staging_dir(),
      out_name: target.options.out_name.clone(),
      mode: target.mode,
      no_typescript: target.options.no_typescript,
      extra_args: target.options.extra_args.clone(),
      program: target.options.wasm_pack.clone(),
      watch_paths,
    }
  }

  /// Directory containing the manifest.
  pub fn crate_dir(&self) -> &Path {
    self.manifest_path.parent().unwrap_or_else(|| Path::new("."))
  }

  /// Private directory the compiler writes into before publication.
  pub fn partial_dir(&self) -> PathBuf {
    let name = self
      .staging_dir
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| "pkg".to_string());
    self
      .staging_dir
      .with_file_name(format!(".{name}.partial"))
  }

  /// Loader module filename.
  pub fn loader_file_name(&self) -> String {
    format!("{}.js", self.out_name)
  }

  /// WebAssembly binary filename.
  pub fn wasm_file_name(&self) -> String {
    format!("{}_bg.wasm", self.out_name)
  }

  /// Artifact describing the published staging directory.
  pub fn artifact(&self) -> CompileArtifact {
    CompileArtifact {
      wasm_binary_path: self.staging_dir.join(self.wasm_file_name()),
      loader_module_path: self.staging_dir.join(self.loader_file_name()),
      staging_dir: self.staging_dir.clone(),
      source_watch_paths: self.watch_paths.clone(),
    }
  }
}

/// Native-to-WebAssembly compiler collaborator.
pub trait Compiler: Send + Sync {
  /// Compile the requested crate and publish its artifact.
  fn compile<'a>(
    &'a self,
    request: &'a CompileRequest,
  ) -> BoxFuture<'a, Result<CompileArtifact, CompileError>>;
}

/// `wasm-pack build --target web` as a subprocess.
#[derive(Debug, Clone, Default)]
pub struct WasmPack;

impl WasmPack {
  /// Arguments passed to the compiler for `request`, writing into `out_dir`.
  pub fn arguments(request: &CompileRequest, out_dir: &Path) -> Vec<String> {
    let mut args = vec![
      "build".to_string(),
      match request.mode {
        Mode::Development => "--dev".to_string(),
        Mode::Production => "--release".to_string(),
      },
      "--target".to_string(),
      "web".to_string(),
      "--out-name".to_string(),
      request.out_name.clone(),
      "--out-dir".to_string(),
      out_dir.to_string_lossy().into_owned(),
    ];
    if request.no_typescript {
      args.push("--no-typescript".to_string());
    }
    args.extend(request.extra_args.iter().cloned());
    args.push(request.crate_dir().to_string_lossy().into_owned());
    args
  }

  async fn run(&self, request: &CompileRequest) -> Result<CompileArtifact, CompileError> {
    if !request.manifest_path.is_file() {
      return Err(CompileError::ManifestNotFound {
        path: request.manifest_path.clone(),
      });
    }

    let partial = request.partial_dir();
    reset_dir(&partial)?;

    let args = Self::arguments(request, &partial);
    tracing::debug!(program = %request.program, ?args, "running compiler");

    let started = Instant::now();
    let output = match Command::new(&request.program)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::inherit())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .output()
      .await
    {
      Ok(output) => output,
      Err(source) => {
        discard_dir(&partial);
        return Err(CompileError::Spawn {
          program: request.program.clone(),
          source,
        });
      }
    };

    if !output.status.success() {
      discard_dir(&partial);
      return Err(CompileError::Failed {
        program: request.program.clone(),
        manifest: request.manifest_path.clone(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      });
    }

    tracing::debug!(
      manifest = %request.manifest_path.display(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "compiler finished"
    );

    publish_staging(request)
  }
}

impl Compiler for WasmPack {
  fn compile<'a>(
    &'a self,
    request: &'a CompileRequest,
  ) -> BoxFuture<'a, Result<CompileArtifact, CompileError>> {
    self.run(request).boxed()
  }
}

/// Swap a completed partial directory into place as the staging directory.
///
/// Both generated files must exist first; otherwise the partial output is discarded
/// and the previously published staging directory is left untouched.
pub fn publish_staging(request: &CompileRequest) -> Result<CompileArtifact, CompileError> {
  let partial = request.partial_dir();
  for file_name in [request.loader_file_name(), request.wasm_file_name()] {
    let produced = partial.join(&file_name);
    if !produced.is_file() {
      discard_dir(&partial);
      return Err(CompileError::MissingOutput {
        path: request.staging_dir.join(file_name),
      });
    }
  }

  match std::fs::remove_dir_all(&request.staging_dir) {
    Ok(()) => {}
    Err(err) if err.kind() == ErrorKind::NotFound => {}
    Err(source) => {
      return Err(CompileError::Io {
        path: request.staging_dir.clone(),
        source,
      });
    }
  }
  std::fs::rename(&partial, &request.staging_dir).map_err(|source| CompileError::Io {
    path: request.staging_dir.clone(),
    source,
  })?;

  Ok(request.artifact())
}

fn reset_dir(path: &Path) -> Result<(), CompileError> {
  let io_error = |source| CompileError::Io {
    path: path.to_path_buf(),
    source,
  };
  match std::fs::remove_dir_all(path) {
    Ok(()) => {}
    Err(err) if err.kind() == ErrorKind::NotFound => {}
    Err(err) => return Err(io_error(err)),
  }
  std::fs::create_dir_all(path).map_err(io_error)
}

fn discard_dir(path: &Path) {
  if let Err(err) = std::fs::remove_dir_all(path) {
    if err.kind() != ErrorKind::NotFound {
      tracing::warn!(path = %path.display(), error = %err, "failed to remove partial output");
    }
  }
}

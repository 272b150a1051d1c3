//! Compile, bundle and assemble a single target.

use std::sync::Arc;
use std::time::Instant;

use crate::assembly::assemble;
use crate::bundle::{BundleRequest, Bundler};
use crate::compile::{CompileRequest, Compiler, WasmPack};
use crate::error::TargetError;
use crate::models::{AssemblyResult, BuildTarget};

/// The per-target build pipeline, shared by one-shot builds and watch rebuilds.
#[derive(Clone)]
pub struct Pipeline {
  compiler: Arc<dyn Compiler>,
  bundler: Arc<Bundler>,
}

impl Default for Pipeline {
  fn default() -> Self {
    Self::new(Arc::new(WasmPack), Arc::new(Bundler::default()))
  }
}

impl Pipeline {
  /// Pipeline using the given collaborators.
  pub fn new(compiler: Arc<dyn Compiler>, bundler: Arc<Bundler>) -> Self {
    Self { compiler, bundler }
  }

  /// Run every stage for `target` in order; the first failing stage ends the run.
  ///
  /// Bundling and assembly run on the blocking pool. The output directory is only
  /// touched once bundling succeeded, so a failure leaves the previous site intact.
  pub async fn run(&self, target: &BuildTarget) -> Result<AssemblyResult, TargetError> {
    let started = Instant::now();
    tracing::info!(
      example = %target.name,
      manifest = %target.manifest_path.display(),
      mode = %target.mode,
      "building"
    );

    let request = CompileRequest::for_target(target);
    let artifact = self.compiler.compile(&request).await?;
    tracing::debug!(
      example = %target.name,
      staging = %artifact.staging_dir.display(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "compiled"
    );

    let bundler = Arc::clone(&self.bundler);
    let owned = target.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<AssemblyResult, TargetError> {
      let request = BundleRequest::for_target(&owned, &artifact);
      let output = bundler.bundle(&request)?;
      Ok(assemble(&owned, &output)?)
    })
    .await
    .map_err(|err| TargetError::Task(err.to_string()))??;

    tracing::info!(
      example = %target.name,
      output = %result.output_dir.display(),
      written = result.written.len(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "built"
    );
    Ok(result)
  }
}

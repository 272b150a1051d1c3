//! Watch mode: one filesystem listener and one debounced rebuild worker per target.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::compile::CompileRequest;
use crate::driver::{BuildPlan, build_all};
use crate::error::WatchError;
use crate::models::BuildTarget;
use crate::pipeline::Pipeline;
use crate::serve;

/// Quiet period after the last change before a rebuild starts.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Directory names whose contents never trigger a rebuild.
const IGNORED_DIRS: &[&str] = &["target", "node_modules"];

/// Changes collected since the last rebuild.
#[derive(Debug)]
pub struct PendingChanges {
  paths: BTreeSet<PathBuf>,
  last_change: Option<Instant>,
  debounce: Duration,
}

impl PendingChanges {
  /// Empty state with the given quiet period.
  pub fn new(debounce: Duration) -> Self {
    Self {
      paths: BTreeSet::new(),
      last_change: None,
      debounce,
    }
  }

  /// Record a changed path, restarting the quiet period.
  pub fn add(&mut self, path: PathBuf) {
    self.paths.insert(path);
    self.last_change = Some(Instant::now());
  }

  /// When the pending changes become due, if there are any.
  pub fn deadline(&self) -> Option<Instant> {
    match self.last_change {
      Some(last) if !self.paths.is_empty() => Some(last + self.debounce),
      _ => None,
    }
  }

  /// Whether changes are waiting.
  pub fn has_pending(&self) -> bool {
    !self.paths.is_empty()
  }

  /// Take every pending path and reset.
  pub fn take(&mut self) -> Vec<PathBuf> {
    self.last_change = None;
    std::mem::take(&mut self.paths).into_iter().collect()
  }
}

/// Paths owned by one target for change detection.
#[derive(Debug, Clone)]
pub struct WatchScope {
  roots: Vec<PathBuf>,
  excluded: Vec<PathBuf>,
}

impl WatchScope {
  /// Scope of `target`: its crate and extra watch directories, minus every
  /// directory the build itself writes into.
  pub fn for_target(target: &BuildTarget) -> Self {
    let request = CompileRequest::for_target(target);
    let roots = request.watch_paths.iter().map(|path| absolute(path)).collect();
    let excluded = [
      target.output_dir.clone(),
      request.staging_dir.clone(),
      request.partial_dir(),
    ]
    .iter()
    .map(|path| absolute(path))
    .collect();
    Self { roots, excluded }
  }

  /// Roots registered with the listener.
  pub fn roots(&self) -> &[PathBuf] {
    &self.roots
  }

  /// Whether a change at `path` should rebuild this target.
  pub fn is_relevant(&self, path: &Path) -> bool {
    if self.excluded.iter().any(|excluded| path.starts_with(excluded)) {
      return false;
    }

    self.roots.iter().any(|root| match path.strip_prefix(root) {
      Ok(relative) => relative.components().all(|component| match component {
        Component::Normal(name) => {
          let name = name.to_string_lossy();
          !name.starts_with('.') && !IGNORED_DIRS.contains(&name.as_ref())
        }
        _ => true,
      }),
      Err(_) => false,
    })
  }
}

fn absolute(path: &Path) -> PathBuf {
  if let Ok(canonical) = std::fs::canonicalize(path) {
    return canonical;
  }
  if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
    if let Ok(parent) = std::fs::canonicalize(parent) {
      return parent.join(name);
    }
  }
  std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Register a recursive listener over `scope`, forwarding relevant paths to `events`.
pub fn listen(
  scope: &WatchScope,
  events: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher, WatchError> {
  let filter = scope.clone();
  let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
    Ok(event) => {
      if matches!(event.kind, EventKind::Access(_)) {
        return;
      }
      for path in event.paths {
        if filter.is_relevant(&path) {
          let _ = events.send(path);
        }
      }
    }
    Err(err) => tracing::warn!(error = %err, "filesystem listener error"),
  })
  .map_err(|source| WatchError::Listener {
    path: scope.roots.first().cloned().unwrap_or_default(),
    source,
  })?;

  for root in &scope.roots {
    if !root.exists() {
      tracing::warn!(path = %root.display(), "watch directory does not exist; skipping");
      continue;
    }
    watcher
      .watch(root, RecursiveMode::Recursive)
      .map_err(|source| WatchError::Listener {
        path: root.clone(),
        source,
      })?;
  }
  Ok(watcher)
}

/// Resolve once shutdown is signalled or the signalling side is gone.
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
  loop {
    if *shutdown.borrow_and_update() {
      return;
    }
    if shutdown.changed().await.is_err() {
      return;
    }
  }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
  tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)).await;
}

/// Debounce `events` and call `rebuild` once per quiet period until shutdown.
///
/// A rebuild in progress is abandoned when shutdown is signalled.
pub async fn run_worker<F, Fut>(
  name: &str,
  mut events: mpsc::UnboundedReceiver<PathBuf>,
  mut shutdown: watch::Receiver<bool>,
  debounce: Duration,
  mut rebuild: F,
) where
  F: FnMut(Vec<PathBuf>) -> Fut,
  Fut: Future<Output = ()>,
{
  let mut pending = PendingChanges::new(debounce);
  if *shutdown.borrow() {
    return;
  }

  loop {
    let deadline = pending.deadline();
    tokio::select! {
      changed = shutdown.changed() => {
        if changed.is_err() || *shutdown.borrow() {
          break;
        }
      }
      event = events.recv() => match event {
        Some(path) => pending.add(path),
        None => break,
      },
      _ = sleep_until_deadline(deadline), if deadline.is_some() => {
        let changes = pending.take();
        tracing::info!(
          example = name,
          changes = changes.len(),
          first = %changes[0].display(),
          "change detected; rebuilding"
        );
        tokio::select! {
          _ = rebuild(changes) => {}
          _ = shutdown.changed() => break,
        }
      }
    }
  }
  tracing::debug!(example = name, "watch worker stopped");
}

/// Watch every target until shutdown, rebuilding a target with `rebuild` when a file in
/// its scope changes. Targets never trigger each other.
pub async fn watch_targets_with<F, Fut>(
  targets: Vec<BuildTarget>,
  shutdown: watch::Receiver<bool>,
  rebuild: F,
) -> Result<(), WatchError>
where
  F: Fn(BuildTarget) -> Fut + Clone + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let mut listeners = Vec::with_capacity(targets.len());
  let mut workers = JoinSet::new();

  for target in targets {
    let scope = WatchScope::for_target(&target);
    let (sender, receiver) = mpsc::unbounded_channel();
    listeners.push(listen(&scope, sender)?);
    tracing::info!(
      example = %target.name,
      roots = scope.roots().len(),
      "watching"
    );

    let shutdown = shutdown.clone();
    let rebuild = rebuild.clone();
    workers.spawn(async move {
      let name = target.name.clone();
      run_worker(&name, receiver, shutdown, DEBOUNCE, move |_changes| {
        rebuild(target.clone())
      })
      .await;
    });
  }

  while workers.join_next().await.is_some() {}
  drop(listeners);
  Ok(())
}

/// Watch every target, rebuilding through `pipeline`. A failed rebuild is logged and
/// the previous output stays in place.
pub async fn watch_targets(
  targets: Vec<BuildTarget>,
  pipeline: Pipeline,
  shutdown: watch::Receiver<bool>,
) -> Result<(), WatchError> {
  watch_targets_with(targets, shutdown, move |target: BuildTarget| {
    let pipeline = pipeline.clone();
    async move {
      if let Err(err) = pipeline.run(&target).await {
        tracing::error!(
          example = %target.name,
          manifest = %target.manifest_path.display(),
          stage = err.stage(),
          error = %err,
          "rebuild failed; keeping previous output"
        );
      }
    }
  })
  .await
}

/// Initial build, dev servers for targets with a port, then watch until shutdown.
///
/// Shutdown during the initial build drops the in-flight pipelines, which kills their
/// compiler processes.
pub async fn watch_and_serve(
  plan: BuildPlan,
  pipeline: Pipeline,
  shutdown: watch::Receiver<bool>,
) -> Result<(), WatchError> {
  let targets = plan.targets.clone();
  let report = tokio::select! {
    report = build_all(plan, &pipeline) => report,
    _ = shutdown_requested(shutdown.clone()) => {
      tracing::info!("initial build cancelled");
      return Ok(());
    }
  };
  tracing::info!(
    succeeded = report.succeeded(),
    failed = report.failures().count(),
    "initial build finished"
  );

  let mut servers = JoinSet::new();
  for target in &targets {
    let Some(port) = target.dev_server_port else {
      continue;
    };
    match serve::bind(&target.output_dir, port).await {
      Ok(listener) => {
        let name = target.name.clone();
        let server = serve::serve_listener(listener, target.output_dir.clone(), shutdown.clone());
        servers.spawn(async move {
          if let Err(err) = server.await {
            tracing::error!(example = %name, error = %err, "dev server stopped");
          }
        });
      }
      Err(err) => tracing::error!(example = %target.name, error = %err, "dev server not started"),
    }
  }

  let watched = watch_targets(targets, pipeline, shutdown).await;
  while servers.join_next().await.is_some() {}
  watched
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bundle::Bundler;
  use crate::compile::Compiler;
  use crate::config::TargetOptions;
  use crate::error::CompileError;
  use crate::models::{CompileArtifact, Mode};
  use futures_util::FutureExt;
  use futures_util::future::BoxFuture;
  use std::fs;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::tempdir;

  fn target(crate_dir: &Path) -> BuildTarget {
    fs::create_dir_all(crate_dir).unwrap();
    fs::write(crate_dir.join("Cargo.toml"), "[package]").unwrap();
    BuildTarget {
      name: crate_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned(),
      manifest_path: crate_dir.join("Cargo.toml"),
      entry_path: None,
      output_dir: crate_dir.join("dist"),
      mode: Mode::Development,
      dev_server_port: None,
      options: TargetOptions::default(),
    }
  }

  #[test]
  fn pending_changes_coalesce() {
    let mut pending = PendingChanges::new(Duration::from_millis(100));
    assert!(pending.deadline().is_none());

    pending.add(PathBuf::from("src/lib.rs"));
    pending.add(PathBuf::from("src/lib.rs"));
    pending.add(PathBuf::from("index.js"));
    assert!(pending.has_pending());
    assert!(pending.deadline().is_some());

    let changes = pending.take();
    assert_eq!(changes, vec![PathBuf::from("index.js"), PathBuf::from("src/lib.rs")]);
    assert!(!pending.has_pending());
    assert!(pending.deadline().is_none());
  }

  #[test]
  fn scope_ignores_build_outputs() {
    let temp = tempdir().unwrap();
    let crate_dir = temp.path().join("app");
    let mut target = target(&crate_dir);
    target.options.watch_dirs = vec!["../shared".into()];
    fs::create_dir_all(temp.path().join("shared")).unwrap();

    let scope = WatchScope::for_target(&target);
    let root = fs::canonicalize(&crate_dir).unwrap();
    let shared = fs::canonicalize(temp.path().join("shared")).unwrap();

    assert!(scope.is_relevant(&root.join("src/lib.rs")));
    assert!(scope.is_relevant(&root.join("index.js")));
    assert!(scope.is_relevant(&shared.join("util.rs")));
    assert!(!scope.is_relevant(&root.join("dist/main.js")));
    assert!(!scope.is_relevant(&root.join("pkg/index.js")));
    assert!(!scope.is_relevant(&root.join(".pkg.partial/index.js")));
    assert!(!scope.is_relevant(&root.join("target/debug/build.rs")));
    assert!(!scope.is_relevant(&root.join(".git/index")));
    assert!(!scope.is_relevant(&temp.path().join("elsewhere/lib.rs")));
  }

  #[tokio::test]
  async fn worker_debounces_bursts_into_one_rebuild() {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rebuilds = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&rebuilds);
    let worker = tokio::spawn(async move {
      run_worker("app", receiver, shutdown_rx, Duration::from_millis(50), move |changes| {
        assert_eq!(changes.len(), 2);
        counter.fetch_add(1, Ordering::SeqCst);
        async {}
      })
      .await;
    });

    sender.send(PathBuf::from("a.rs")).unwrap();
    sender.send(PathBuf::from("b.rs")).unwrap();
    sender.send(PathBuf::from("a.rs")).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rebuilds.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();
  }

  #[tokio::test]
  async fn worker_stops_when_events_close() {
    let (sender, receiver) = mpsc::unbounded_channel::<PathBuf>();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(sender);
    run_worker("app", receiver, shutdown_rx, DEBOUNCE, |_| async {}).await;
  }

  #[tokio::test]
  async fn change_rebuilds_only_the_owning_target() {
    let temp = tempdir().unwrap();
    let first = target(&temp.path().join("app1"));
    let second = target(&temp.path().join("app2"));
    let first_dir = first.crate_dir().to_path_buf();

    let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let recorded = Arc::clone(&counts);
    let session = tokio::spawn(watch_targets_with(
      vec![first, second],
      shutdown_rx,
      move |target: BuildTarget| {
        let recorded = Arc::clone(&recorded);
        async move {
          let slot = if target.name == "app1" { 0 } else { 1 };
          recorded[slot].fetch_add(1, Ordering::SeqCst);
        }
      },
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    fs::create_dir_all(first_dir.join("src")).unwrap();
    fs::write(first_dir.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();

    for _ in 0..50 {
      if counts[0].load(Ordering::SeqCst) > 0 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(counts[0].load(Ordering::SeqCst), 1);
    assert_eq!(counts[1].load(Ordering::SeqCst), 0);

    shutdown_tx.send(true).unwrap();
    session.await.unwrap().unwrap();
  }

  struct DropCounter(Arc<AtomicUsize>);

  impl Drop for DropCounter {
    fn drop(&mut self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  /// Compiler whose builds never finish, counting starts and cancellations.
  struct HangingCompiler {
    started: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
  }

  impl Compiler for HangingCompiler {
    fn compile<'a>(
      &'a self,
      _request: &'a CompileRequest,
    ) -> BoxFuture<'a, Result<CompileArtifact, CompileError>> {
      let started = Arc::clone(&self.started);
      let guard = DropCounter(Arc::clone(&self.cancelled));
      async move {
        let _guard = guard;
        started.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<Result<CompileArtifact, CompileError>>().await
      }
      .boxed()
    }
  }

  async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..200 {
      if counter.load(Ordering::SeqCst) == expected {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }

  #[tokio::test]
  async fn shutdown_cancels_the_initial_build() {
    let temp = tempdir().unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::new(
      Arc::new(HangingCompiler {
        started: Arc::clone(&started),
        cancelled: Arc::clone(&cancelled),
      }),
      Arc::new(Bundler::default()),
    );
    let plan = BuildPlan {
      targets: vec![
        target(&temp.path().join("app1")),
        target(&temp.path().join("app2")),
      ],
      rejected: Vec::new(),
      jobs: 2,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = tokio::spawn(watch_and_serve(plan, pipeline, shutdown_rx));

    wait_for(&started, 2).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), session)
      .await
      .expect("watch session ignored shutdown")
      .unwrap()
      .unwrap();

    wait_for(&cancelled, 2).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    assert!(!temp.path().join("app1/dist").exists());
  }

  #[tokio::test]
  async fn shutdown_signal_resolves_when_set_or_abandoned() {
    let (shutdown_tx, shutdown_rx) = watch::channel(true);
    shutdown_requested(shutdown_rx).await;
    drop(shutdown_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(shutdown_tx);
    shutdown_requested(shutdown_rx).await;
  }
}

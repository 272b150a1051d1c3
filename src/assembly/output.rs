//! Writing the assembled site: emitted files, HTML, static files and clean-build pruning.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use same_file::is_same_file;

use super::html::{asset_tags, render_document};
use crate::error::AssemblyError;
use crate::models::{AssemblyResult, BuildTarget, BundleOutput, Mode};

/// Asset manifest written next to the HTML document.
pub const ASSET_MANIFEST_FILE: &str = "asset-manifest.json";

/// Assemble `bundle` into the target's output directory.
///
/// Files whose bytes are unchanged are left alone. With `clean` set, everything in
/// the output directory this run did not produce is removed once the new files are
/// in place.
pub fn assemble(
  target: &BuildTarget,
  bundle: &BundleOutput,
) -> Result<AssemblyResult, AssemblyError> {
  let options = &target.options;
  let crate_dir = target.crate_dir();
  let output_dir = target.output_dir.as_path();

  let html_file = contained_path("htmlFilename", &options.html_filename)?;
  let static_files = options
    .static_files
    .iter()
    .map(|file| contained_path("staticFiles", file))
    .collect::<Result<Vec<_>, _>>()?;

  let template = match options.template_path(crate_dir) {
    Some(path) => Some(
      fs::read_to_string(&path).map_err(|source| AssemblyError::Template { path, source })?,
    ),
    None => None,
  };
  let title = options.title.as_deref().unwrap_or(&target.name);
  let tags = asset_tags(
    &bundle.manifest,
    &bundle.files,
    &options.public_path,
    target.mode == Mode::Production,
  );
  let html = render_document(template.as_deref(), title, &tags);

  fs::create_dir_all(output_dir).map_err(|source| AssemblyError::Io {
    path: output_dir.to_path_buf(),
    source,
  })?;

  let mut writer = OutputWriter {
    root: output_dir,
    keep: BTreeSet::new(),
    result: AssemblyResult {
      output_dir: output_dir.to_path_buf(),
      html_path: output_dir.join(html_file),
      ..AssemblyResult::default()
    },
  };

  for file in &bundle.files {
    writer.write(Path::new(&file.file_name), &file.contents)?;
  }
  writer.write(html_file, html.as_bytes())?;
  let mut manifest = serde_json::to_string_pretty(&bundle.manifest)?;
  manifest.push('\n');
  writer.write(Path::new(ASSET_MANIFEST_FILE), manifest.as_bytes())?;

  let static_dir = crate_dir.join(&options.static_dir);
  if static_dir.is_dir() {
    let mut found = Vec::new();
    collect_files(&static_dir, Path::new(""), &mut found).map_err(|source| AssemblyError::Io {
      path: static_dir.clone(),
      source,
    })?;
    for relative in found {
      writer.install(&static_dir.join(&relative), &relative)?;
    }
  }
  for relative in static_files {
    writer.install(&crate_dir.join(relative), relative)?;
  }

  if options.clean {
    let mut removed = Vec::new();
    prune_stale_tree(output_dir, Path::new(""), &writer.keep, &mut removed).map_err(|source| {
      AssemblyError::Io {
        path: output_dir.to_path_buf(),
        source,
      }
    })?;
    writer.result.removed = removed;
  }

  tracing::debug!(
    example = %target.name,
    output = %output_dir.display(),
    written = writer.result.written.len(),
    unchanged = writer.result.unchanged,
    removed = writer.result.removed.len(),
    "assembled output"
  );

  Ok(writer.result)
}

/// `path` as a relative path made only of plain names, so that joining it onto the
/// output directory stays inside it.
fn contained_path<'a>(option: &'static str, path: &'a str) -> Result<&'a Path, AssemblyError> {
  let relative = Path::new(path);
  let plain = !path.is_empty()
    && relative
      .components()
      .all(|component| matches!(component, Component::Normal(_)));
  if !plain {
    return Err(AssemblyError::OutsideOutput {
      option,
      path: path.to_string(),
    });
  }
  Ok(relative)
}

struct OutputWriter<'a> {
  root: &'a Path,
  keep: BTreeSet<PathBuf>,
  result: AssemblyResult,
}

impl OutputWriter<'_> {
  fn write(&mut self, relative: &Path, contents: &[u8]) -> Result<(), AssemblyError> {
    let destination = self.root.join(relative);
    self.keep.insert(relative.to_path_buf());
    let io_error = |source| AssemblyError::Io {
      path: destination.clone(),
      source,
    };

    match fs::read(&destination) {
      Ok(existing) if existing == contents => {
        self.result.unchanged += 1;
        return Ok(());
      }
      Ok(_) => fs::remove_file(&destination).map_err(io_error)?,
      Err(err) if err.kind() == ErrorKind::NotFound => {}
      Err(err) => return Err(io_error(err)),
    }

    if let Some(parent) = destination.parent() {
      fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(&destination, contents).map_err(io_error)?;
    self.result.written.push(destination.clone());
    Ok(())
  }

  fn install(&mut self, source: &Path, relative: &Path) -> Result<(), AssemblyError> {
    if self.keep.contains(relative) {
      tracing::warn!(
        file = %relative.display(),
        "static file shadowed by a bundle output; skipping"
      );
      return Ok(());
    }

    let destination = self.root.join(relative);
    self.keep.insert(relative.to_path_buf());
    let changed = install_static_file(source, &destination).map_err(|source| AssemblyError::Io {
      path: destination.clone(),
      source,
    })?;

    if changed {
      self.result.written.push(destination.clone());
    } else {
      self.result.unchanged += 1;
    }
    self.result.static_files.push(destination);
    Ok(())
  }
}

/// Hard-link `source` to `destination`, copying when linking is impossible.
///
/// Returns whether the destination changed.
fn install_static_file(source: &Path, destination: &Path) -> std::io::Result<bool> {
  if !source.is_file() {
    return Err(std::io::Error::new(
      ErrorKind::NotFound,
      format!("static file {} not found", source.display()),
    ));
  }

  if destination.exists() {
    if is_same_file(source, destination)? || fs::read(source)? == fs::read(destination)? {
      return Ok(false);
    }
    fs::remove_file(destination)?;
  }

  if let Some(parent) = destination.parent() {
    fs::create_dir_all(parent)?;
  }
  match fs::hard_link(source, destination) {
    Ok(()) => Ok(true),
    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
    Err(_) => fs::copy(source, destination).map(|_| true),
  }
}

fn collect_files(root: &Path, relative: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
  let mut entries = fs::read_dir(root.join(relative))?.collect::<Result<Vec<_>, _>>()?;
  entries.sort_by_key(|entry| entry.file_name());

  for entry in entries {
    let child = relative.join(entry.file_name());
    let file_type = entry.file_type()?;
    if file_type.is_dir() {
      collect_files(root, &child, found)?;
    } else if file_type.is_file() {
      found.push(child);
    }
  }
  Ok(())
}

/// Remove everything below `root` not listed in `keep`; returns whether the directory
/// at `relative` ended up with nothing worth keeping.
fn prune_stale_tree(
  root: &Path,
  relative: &Path,
  keep: &BTreeSet<PathBuf>,
  removed: &mut Vec<PathBuf>,
) -> std::io::Result<bool> {
  let current = root.join(relative);
  let entries = match fs::read_dir(&current) {
    Ok(entries) => entries,
    Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
    Err(err) => return Err(err),
  };

  let mut has_kept_descendants = false;
  for entry in entries {
    let entry = entry?;
    let child = relative.join(entry.file_name());
    let path = entry.path();

    if entry.file_type()?.is_dir() {
      if prune_stale_tree(root, &child, keep, removed)? {
        fs::remove_dir(&path)?;
        removed.push(path);
      } else {
        has_kept_descendants = true;
      }
    } else if keep.contains(&child) {
      has_kept_descendants = true;
    } else {
      fs::remove_file(&path)?;
      removed.push(path);
    }
  }

  Ok(!has_kept_descendants)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::TargetOptions;
  use crate::models::{BundleManifest, EmittedFile};
  use tempfile::tempdir;

  fn target(crate_dir: &Path, mode: Mode) -> BuildTarget {
    BuildTarget {
      name: "app".into(),
      manifest_path: crate_dir.join("Cargo.toml"),
      entry_path: None,
      output_dir: crate_dir.join("dist"),
      mode,
      dev_server_port: None,
      options: TargetOptions::default(),
    }
  }

  fn bundle() -> BundleOutput {
    BundleOutput {
      manifest: BundleManifest {
        entry_name: "main".into(),
        output_files: vec!["index_bg.wasm".into(), "index.js".into(), "main.js".into()],
        sourcemap_present: false,
        content_hash: None,
      },
      files: vec![
        EmittedFile {
          file_name: "index_bg.wasm".into(),
          contents: vec![0, 97, 115, 109],
        },
        EmittedFile {
          file_name: "index.js".into(),
          contents: b"export default function init() {}\n".to_vec(),
        },
        EmittedFile {
          file_name: "main.js".into(),
          contents: b"import init from './index.js';\ninit();\n".to_vec(),
        },
      ],
    }
  }

  #[test]
  fn writes_site_and_is_idempotent() {
    let temp = tempdir().unwrap();
    let target = target(temp.path(), Mode::Development);

    let first = assemble(&target, &bundle()).unwrap();
    assert_eq!(first.written.len(), 5);
    assert_eq!(first.html_path, temp.path().join("dist/index.html"));

    let html = fs::read_to_string(&first.html_path).unwrap();
    assert!(html.contains("<title>app</title>"));
    assert!(html.contains("<script type=\"module\" src=\"/main.js\"></script>"));

    let manifest: BundleManifest =
      serde_json::from_slice(&fs::read(temp.path().join("dist").join(ASSET_MANIFEST_FILE)).unwrap())
        .unwrap();
    assert_eq!(manifest, bundle().manifest);

    let second = assemble(&target, &bundle()).unwrap();
    assert!(second.written.is_empty());
    assert_eq!(second.unchanged, 5);
    assert_eq!(fs::read_to_string(&second.html_path).unwrap(), html);
  }

  #[test]
  fn uses_template_and_production_integrity() {
    let temp = tempdir().unwrap();
    fs::write(
      temp.path().join("index.html"),
      "<html><head><title>Demo</title></head><body></body></html>",
    )
    .unwrap();
    let target = target(temp.path(), Mode::Production);

    let result = assemble(&target, &bundle()).unwrap();
    let html = fs::read_to_string(result.html_path).unwrap();
    assert!(html.contains("<title>Demo</title>"));
    assert!(html.contains("<script type=\"module\" src=\"/main.js\" integrity=\"sha384-"));
  }

  #[test]
  fn installs_static_files_by_link_or_copy() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("static/img")).unwrap();
    fs::write(temp.path().join("static/img/logo.svg"), "<svg/>").unwrap();
    fs::write(temp.path().join("favicon.ico"), [1u8, 2, 3]).unwrap();

    let mut target = target(temp.path(), Mode::Development);
    target.options.static_files = vec!["favicon.ico".into()];

    let result = assemble(&target, &bundle()).unwrap();
    let logo = temp.path().join("dist/img/logo.svg");
    assert_eq!(result.static_files, vec![logo.clone(), temp.path().join("dist/favicon.ico")]);
    assert_eq!(fs::read_to_string(&logo).unwrap(), "<svg/>");

    let again = assemble(&target, &bundle()).unwrap();
    assert!(again.written.is_empty());
  }

  #[test]
  fn missing_static_file_fails_assembly() {
    let temp = tempdir().unwrap();
    let mut target = target(temp.path(), Mode::Development);
    target.options.static_files = vec!["missing.txt".into()];

    let err = assemble(&target, &bundle()).unwrap_err();
    assert!(matches!(err, AssemblyError::Io { .. }));
  }

  #[test]
  fn escaping_output_paths_are_rejected_before_writing() {
    let temp = tempdir().unwrap();
    let crate_dir = temp.path().join("app");
    fs::create_dir_all(&crate_dir).unwrap();
    fs::write(temp.path().join("shared.txt"), "shared").unwrap();

    let mut escaping_static = target(&crate_dir, Mode::Development);
    escaping_static.options.static_files = vec!["../shared.txt".into()];
    let mut absolute_static = target(&crate_dir, Mode::Development);
    let shared = temp.path().join("shared.txt");
    absolute_static.options.static_files = vec![shared.display().to_string()];
    let mut escaping_html = target(&crate_dir, Mode::Development);
    escaping_html.options.html_filename = "../escaped.html".into();
    let mut dotted_html = target(&crate_dir, Mode::Development);
    dotted_html.options.html_filename = "./index.html".into();

    for target in [escaping_static, absolute_static, escaping_html, dotted_html] {
      let err = assemble(&target, &bundle()).unwrap_err();
      assert!(matches!(err, AssemblyError::OutsideOutput { .. }), "{err}");
    }
    assert!(!crate_dir.join("dist").exists());
    assert!(!temp.path().join("escaped.html").exists());
  }

  #[test]
  fn nested_html_filename_is_allowed() {
    let temp = tempdir().unwrap();
    let mut target = target(temp.path(), Mode::Development);
    target.options.html_filename = "pages/index.html".into();

    let result = assemble(&target, &bundle()).unwrap();
    assert_eq!(result.html_path, temp.path().join("dist/pages/index.html"));
    assert!(result.html_path.is_file());
  }

  #[test]
  fn clean_build_prunes_only_stale_files() {
    let temp = tempdir().unwrap();
    let dist = temp.path().join("dist");
    fs::create_dir_all(dist.join("old/nested")).unwrap();
    fs::write(dist.join("old/nested/chunk.js"), "stale").unwrap();
    fs::write(dist.join("main.0123.js"), "stale").unwrap();

    let mut target = target(temp.path(), Mode::Development);
    target.options.clean = true;

    let result = assemble(&target, &bundle()).unwrap();
    assert!(dist.join("main.js").is_file());
    assert!(dist.join("index.html").is_file());
    assert!(!dist.join("main.0123.js").exists());
    assert!(!dist.join("old").exists());
    assert_eq!(result.removed.len(), 4);
  }

  #[test]
  fn without_clean_stale_files_survive() {
    let temp = tempdir().unwrap();
    let dist = temp.path().join("dist");
    fs::create_dir_all(&dist).unwrap();
    fs::write(dist.join("notes.txt"), "keep me").unwrap();

    let result = assemble(&target(temp.path(), Mode::Development), &bundle()).unwrap();
    assert!(dist.join("notes.txt").is_file());
    assert!(result.removed.is_empty());
  }

  #[test]
  fn changed_output_replaces_hard_linked_file_without_touching_source() {
    let temp = tempdir().unwrap();
    fs::create_dir_all(temp.path().join("static")).unwrap();
    fs::write(temp.path().join("static/main.js"), "from static").unwrap();
    let dist = temp.path().join("dist");
    fs::create_dir_all(&dist).unwrap();
    fs::hard_link(temp.path().join("static/main.js"), dist.join("main.js")).unwrap();

    assemble(&target(temp.path(), Mode::Development), &bundle()).unwrap();
    assert_eq!(
      fs::read_to_string(temp.path().join("static/main.js")).unwrap(),
      "from static"
    );
    assert!(fs::read_to_string(dist.join("main.js")).unwrap().contains("init();"));
  }
}

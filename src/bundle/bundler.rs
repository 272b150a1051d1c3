//! Flat ES-module bundler: hashes, names, rewrites and emits a module graph.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use super::graph::{EntrySource, ModuleGraph};
use super::naming::{
  DEFAULT_ASSET_TEMPLATE, DEFAULT_CHUNK_TEMPLATE, DEFAULT_ENTRY_TEMPLATE, FilenameTemplate,
  combined_hash, digest_hex, unique_chunk_name,
};
use super::sourcemap::{append_mapping_comment, render_sourcemap, source_name};
use super::transform::{AssetKind, AssetTransform, default_transforms};
use crate::error::BundleError;
use crate::models::{BuildTarget, BundleManifest, BundleOutput, CompileArtifact, EmittedFile, Mode};

/// Virtual filename of the bootstrap entry synthesised for manifest-driven targets.
pub const GENERATED_ENTRY_FILE: &str = "__entry__.js";

/// Longest usable content hash (hex SHA-256).
const MAX_HASH_LENGTH: usize = 64;

/// Entry module that imports the compiled loader and runs its initialiser.
pub fn bootstrap_source(loader_file: &str) -> String {
  format!("import init from \"./{loader_file}\";\n\ninit();\n")
}

/// Inputs of one bundling run.
#[derive(Debug, Clone)]
pub struct BundleRequest {
  /// Entry module.
  pub entry: EntrySource,
  /// Chunk name of the entry module.
  pub entry_name: String,
  /// Directory sourcemap `sources` are relative to.
  pub source_root: PathBuf,
  /// Build flavour.
  pub mode: Mode,
  /// Emit `.map` files next to script modules.
  pub sourcemaps: bool,
  /// Entry filename template.
  pub filename: Option<String>,
  /// Template for other script modules.
  pub chunk_filename: Option<String>,
  /// Template for raw assets.
  pub asset_filename: Option<String>,
  /// Default `[contenthash]` length.
  pub hash_length: usize,
  /// Specifiers left as written.
  pub externals: Vec<String>,
}

impl BundleRequest {
  /// Request for a resolved target whose compile step produced `artifact`.
  pub fn for_target(target: &BuildTarget, artifact: &CompileArtifact) -> Self {
    let entry = match &target.entry_path {
      Some(path) => EntrySource::File(path.clone()),
      None => {
        let loader_file = artifact
          .loader_module_path
          .file_name()
          .map(|name| name.to_string_lossy().into_owned())
          .unwrap_or_else(|| format!("{}.js", target.options.out_name));
        EntrySource::Generated {
          path: artifact.staging_dir.join(GENERATED_ENTRY_FILE),
          contents: bootstrap_source(&loader_file),
        }
      }
    };

    let options = &target.options;
    Self {
      entry,
      entry_name: options.entry_name.clone(),
      source_root: target.crate_dir().to_path_buf(),
      mode: target.mode,
      sourcemaps: options.sourcemaps_for(target.mode),
      filename: options.filename.clone(),
      chunk_filename: options.chunk_filename.clone(),
      asset_filename: options.asset_filename.clone(),
      hash_length: options.hash_length,
      externals: options.externals.clone(),
    }
  }

  fn template(&self, configured: &Option<String>, fallback: &str) -> FilenameTemplate {
    FilenameTemplate::for_mode(configured.as_deref().unwrap_or(fallback), self.mode)
  }
}

/// Module bundler holding the ordered transform list.
pub struct Bundler {
  transforms: Vec<Box<dyn AssetTransform>>,
}

impl Default for Bundler {
  fn default() -> Self {
    Self::with_transforms(default_transforms())
  }
}

impl Bundler {
  /// Bundler running `transforms` in order on every imported module.
  pub fn with_transforms(transforms: Vec<Box<dyn AssetTransform>>) -> Self {
    Self { transforms }
  }

  /// Names of the installed transforms, in application order.
  pub fn transform_names(&self) -> Vec<&'static str> {
    self.transforms.iter().map(|transform| transform.name()).collect()
  }

  /// Resolve, transform, hash and name every module reachable from the entry.
  ///
  /// Nothing touches the filesystem beyond reading sources; the result is held in
  /// memory until assembly.
  pub fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, BundleError> {
    if request.hash_length == 0 || request.hash_length > MAX_HASH_LENGTH {
      return Err(BundleError::InvalidConfig {
        message: format!(
          "hash length must be between 1 and {MAX_HASH_LENGTH}, got {}",
          request.hash_length
        ),
      });
    }

    let graph = ModuleGraph::build(&request.entry, &self.transforms, &request.externals)?;
    let count = graph.nodes.len();
    let entry_index = count - 1;

    let own: Vec<String> = graph
      .nodes
      .iter()
      .map(|node| digest_hex(&node.contents))
      .collect();
    let hashes: Vec<String> = (0..count)
      .map(|index| {
        let reachable = graph.reachable(index);
        combined_hash(&own[index], reachable.iter().map(|dep| own[*dep].as_str()))
      })
      .collect();

    let file_names = self.file_names(request, &graph, &hashes)?;
    let source_root =
      std::fs::canonicalize(&request.source_root).unwrap_or_else(|_| request.source_root.clone());

    let mut files = Vec::with_capacity(count * 2);
    let mut maps_emitted = 0usize;
    for (index, node) in graph.nodes.iter().enumerate() {
      let file_name = &file_names[index];
      let mut contents = node.contents.clone();

      if node.is_script() {
        for link in node.links.iter().rev() {
          let specifier = relative_specifier(file_name, &file_names[link.target]);
          contents.splice(link.range.clone(), specifier.into_bytes());
        }
      }

      let map = (request.sourcemaps && node.is_script() && node.source_kind == AssetKind::Script)
        .then(|| {
          let map_name = format!("{file_name}.map");
          let original = String::from_utf8_lossy(&node.contents);
          let map = render_sourcemap(
            base_name(file_name),
            &source_name(&node.path, &source_root),
            &original,
          );
          append_mapping_comment(&mut contents, base_name(&map_name));
          EmittedFile {
            file_name: map_name,
            contents: map,
          }
        });

      files.push(EmittedFile {
        file_name: file_name.clone(),
        contents,
      });
      if let Some(map) = map {
        maps_emitted += 1;
        files.push(map);
      }
    }

    let content_hash = (request.mode == Mode::Production)
      .then(|| hashes[entry_index][..request.hash_length].to_string());

    tracing::debug!(
      entry = %request.entry.path().display(),
      modules = count,
      files = files.len(),
      "bundled module graph"
    );

    Ok(BundleOutput {
      manifest: BundleManifest {
        entry_name: request.entry_name.clone(),
        output_files: file_names,
        sourcemap_present: maps_emitted > 0,
        content_hash,
      },
      files,
    })
  }

  fn file_names(
    &self,
    request: &BundleRequest,
    graph: &ModuleGraph,
    hashes: &[String],
  ) -> Result<Vec<String>, BundleError> {
    let entry_template = request.template(&request.filename, DEFAULT_ENTRY_TEMPLATE);
    let chunk_template = request.template(&request.chunk_filename, DEFAULT_CHUNK_TEMPLATE);
    let asset_template = request.template(&request.asset_filename, DEFAULT_ASSET_TEMPLATE);

    let entry_index = graph.nodes.len() - 1;
    let mut used = BTreeSet::new();
    let entry_chunk = unique_chunk_name(&request.entry_name, ".js", &mut used);

    let mut names = Vec::with_capacity(graph.nodes.len());
    let mut rendered = HashSet::new();
    for (index, node) in graph.nodes.iter().enumerate() {
      let (name, ext, template) = if index == entry_index {
        (entry_chunk.clone(), ".js".to_string(), &entry_template)
      } else if node.is_script() {
        let name = unique_chunk_name(&file_stem(&node.path), ".js", &mut used);
        (name, ".js".to_string(), &chunk_template)
      } else {
        let ext = node
          .path
          .extension()
          .map(|ext| format!(".{}", ext.to_string_lossy()))
          .unwrap_or_default();
        let name = unique_chunk_name(&file_stem(&node.path), &ext, &mut used);
        (name, ext, &asset_template)
      };

      let file_name = template.render(&name, &ext, &hashes[index], request.hash_length);
      validate_file_name(&file_name)?;
      if !rendered.insert(file_name.clone()) {
        return Err(BundleError::InvalidConfig {
          message: format!("more than one output renders to '{file_name}'"),
        });
      }
      names.push(file_name);
    }
    Ok(names)
  }
}

fn file_stem(path: &Path) -> String {
  path
    .file_stem()
    .map(|stem| stem.to_string_lossy().into_owned())
    .unwrap_or_default()
}

fn base_name(file_name: &str) -> &str {
  file_name.rsplit('/').next().unwrap_or(file_name)
}

fn validate_file_name(file_name: &str) -> Result<(), BundleError> {
  let escapes = file_name.is_empty()
    || file_name.starts_with('/')
    || file_name
      .split('/')
      .any(|segment| segment.is_empty() || segment == "." || segment == "..");
  if escapes {
    return Err(BundleError::InvalidConfig {
      message: format!("output filename '{file_name}' must stay inside the output directory"),
    });
  }
  Ok(())
}

/// Import specifier leading from the emitted file `from` to the emitted file `to`.
pub fn relative_specifier(from: &str, to: &str) -> String {
  let mut from_dirs: Vec<&str> = from.split('/').collect();
  from_dirs.pop();
  let to_parts: Vec<&str> = to.split('/').collect();
  let to_dirs = &to_parts[..to_parts.len() - 1];

  let common = from_dirs
    .iter()
    .zip(to_dirs)
    .take_while(|(a, b)| a == b)
    .count();

  let mut specifier = if common == from_dirs.len() {
    "./".to_string()
  } else {
    "../".repeat(from_dirs.len() - common)
  };
  specifier.push_str(&to_parts[common..].join("/"));
  specifier
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn write_fixture(root: &Path, wasm: &[u8]) {
    fs::create_dir_all(root.join("pkg")).unwrap();
    fs::write(
      root.join("index.js"),
      "import init from './pkg/index.js';\nimport './style.css';\n\ninit();\n",
    )
    .unwrap();
    fs::write(root.join("style.css"), "body { margin: 0; }\n").unwrap();
    fs::write(
      root.join("pkg/index.js"),
      "export default async function init() {\n  return fetch(new URL('index_bg.wasm', import.meta.url));\n}\n",
    )
    .unwrap();
    fs::write(root.join("pkg/index_bg.wasm"), wasm).unwrap();
  }

  fn request(root: &Path, mode: Mode) -> BundleRequest {
    BundleRequest {
      entry: EntrySource::File(root.join("index.js")),
      entry_name: "main".into(),
      source_root: root.to_path_buf(),
      mode,
      sourcemaps: mode == Mode::Development,
      filename: None,
      chunk_filename: None,
      asset_filename: None,
      hash_length: 20,
      externals: Vec::new(),
    }
  }

  fn file<'a>(output: &'a BundleOutput, name: &str) -> &'a str {
    let file = output
      .files
      .iter()
      .find(|file| file.file_name == name)
      .unwrap_or_else(|| panic!("missing {name}"));
    std::str::from_utf8(&file.contents).unwrap()
  }

  #[test]
  fn development_bundle_is_flat_and_mapped() {
    let temp = tempdir().unwrap();
    write_fixture(temp.path(), &[0, 97, 115, 109]);

    let output = Bundler::default()
      .bundle(&request(temp.path(), Mode::Development))
      .unwrap();

    assert_eq!(
      output.manifest.output_files,
      vec!["index_bg.wasm", "index.js", "style.js", "main.js"]
    );
    assert_eq!(output.manifest.entry_file(), Some("main.js"));
    assert!(output.manifest.sourcemap_present);
    assert_eq!(output.manifest.content_hash, None);

    let main = file(&output, "main.js");
    assert!(main.starts_with("import init from './index.js';\nimport './style.js';\n"));
    assert!(main.ends_with("//# sourceMappingURL=main.js.map\n"));
    assert!(file(&output, "index.js").contains("new URL('./index_bg.wasm', import.meta.url)"));
    assert!(!file(&output, "style.js").contains("sourceMappingURL"));

    let map: serde_json::Value =
      serde_json::from_str(file(&output, "index.js.map")).unwrap();
    assert_eq!(map["sources"][0], "pkg/index.js");
    assert_eq!(map["mappings"], "AAAA;AACA;AACA");
  }

  #[test]
  fn production_names_follow_content() {
    let temp = tempdir().unwrap();
    write_fixture(temp.path(), &[0, 97, 115, 109]);
    let bundler = Bundler::default();

    let first = bundler.bundle(&request(temp.path(), Mode::Production)).unwrap();
    let again = bundler.bundle(&request(temp.path(), Mode::Production)).unwrap();
    assert_eq!(first.manifest, again.manifest);
    assert_eq!(first.files, again.files);
    assert!(!first.manifest.sourcemap_present);

    let hash = first.manifest.content_hash.clone().unwrap();
    assert_eq!(hash.len(), 20);
    assert_eq!(first.manifest.entry_file(), Some(format!("main.{hash}.js").as_str()));

    fs::write(temp.path().join("pkg/index_bg.wasm"), [0, 97, 115, 109, 1]).unwrap();
    let changed = bundler.bundle(&request(temp.path(), Mode::Production)).unwrap();

    let before = &first.manifest.output_files;
    let after = &changed.manifest.output_files;
    assert_ne!(before[0], after[0], "wasm binary renamed");
    assert_ne!(before[1], after[1], "loader importing the binary renamed");
    assert_eq!(before[2], after[2], "unrelated stylesheet keeps its name");
    assert_ne!(before[3], after[3], "entry renamed");
    assert!(file(&changed, &after[3]).contains(&format!("'./{}'", after[1])));
  }

  #[test]
  fn generated_entry_bootstraps_the_loader() {
    let temp = tempdir().unwrap();
    let pkg = temp.path().join("pkg");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("index.js"), "export default function init() {}\n").unwrap();

    let mut request = request(temp.path(), Mode::Development);
    request.entry = EntrySource::Generated {
      path: pkg.join(GENERATED_ENTRY_FILE),
      contents: bootstrap_source("index.js"),
    };

    let output = Bundler::default().bundle(&request).unwrap();
    assert_eq!(output.manifest.output_files, vec!["index.js", "main.js"]);
    assert!(file(&output, "main.js").starts_with("import init from \"./index.js\";\n\ninit();\n"));
  }

  #[test]
  fn colliding_templates_are_rejected() {
    let temp = tempdir().unwrap();
    write_fixture(temp.path(), &[0, 97, 115, 109]);

    let mut request = request(temp.path(), Mode::Development);
    request.chunk_filename = Some("chunk.js".into());
    let err = Bundler::default().bundle(&request).err().unwrap();
    assert!(matches!(err, BundleError::InvalidConfig { .. }));
  }

  #[test]
  fn escaping_templates_are_rejected() {
    let temp = tempdir().unwrap();
    write_fixture(temp.path(), &[0, 97, 115, 109]);

    let mut request = request(temp.path(), Mode::Development);
    request.asset_filename = Some("../[name][ext]".into());
    let err = Bundler::default().bundle(&request).err().unwrap();
    assert!(matches!(err, BundleError::InvalidConfig { .. }));
  }

  #[test]
  fn nested_templates_rewrite_relative_paths() {
    let temp = tempdir().unwrap();
    write_fixture(temp.path(), &[0, 97, 115, 109]);

    let mut request = request(temp.path(), Mode::Development);
    request.chunk_filename = Some("js/[name].js".into());
    request.asset_filename = Some("assets/[name][ext]".into());
    let output = Bundler::default().bundle(&request).unwrap();

    assert!(file(&output, "js/index.js").contains("new URL('../assets/index_bg.wasm'"));
    assert!(file(&output, "main.js").contains("from './js/index.js'"));
    assert!(file(&output, "js/index.js").contains("//# sourceMappingURL=index.js.map"));
  }

  #[test]
  fn relative_specifiers() {
    assert_eq!(relative_specifier("main.js", "index_bg.wasm"), "./index_bg.wasm");
    assert_eq!(relative_specifier("js/a.js", "js/b.js"), "./b.js");
    assert_eq!(relative_specifier("js/a.js", "assets/b.wasm"), "../assets/b.wasm");
    assert_eq!(relative_specifier("main.js", "js/a.js"), "./js/a.js");
  }

  #[test]
  fn lists_transforms_in_order() {
    assert_eq!(
      Bundler::default().transform_names(),
      vec!["stylesheet-loader", "json-loader"]
    );
  }
}

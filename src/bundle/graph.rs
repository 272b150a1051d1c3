//! ES-module dependency graph: reference scanning, resolution and post-order loading.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::transform::{Asset, AssetKind, AssetTransform, apply_transforms};
use crate::error::BundleError;

/// Extensions tried, in order, after the bare specifier.
const RESOLVE_SUFFIXES: &[&str] = &[".js", ".mjs", "/index.js"];

/// URL schemes left untouched wherever they appear.
const URL_PREFIXES: &[&str] = &["http:", "https:", "data:", "blob:", "//"];

fn reference_regex() -> &'static Regex {
  static REFERENCES: OnceLock<Regex> = OnceLock::new();
  REFERENCES.get_or_init(|| {
    Regex::new(concat!(
      r#"\bimport\s*\(\s*["']([^"'\n]+)["']\s*\)"#,
      r#"|\bnew\s+URL\s*\(\s*["']([^"'\n]+)["']\s*,\s*import\.meta\.url\s*\)"#,
      r#"|\b(?:import|export)\s*(?:[\w$*{}\s,]+?\s*from\s*)?["']([^"'\n]+)["']"#,
    ))
    .expect("invalid module reference regex")
  })
}

/// How a module refers to another file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
  /// Static `import` or `export ... from`.
  Import,
  /// `import("...")` with a literal specifier.
  Dynamic,
  /// `new URL("...", import.meta.url)`; the target is emitted as a raw asset.
  AssetUrl,
}

/// One specifier found in a script module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
  /// Reference flavour.
  pub kind: ReferenceKind,
  /// Specifier text between the quotes.
  pub specifier: String,
  /// Byte range of the specifier text in the scanned source.
  pub range: Range<usize>,
}

/// Every module reference in `source`, in source order.
///
/// References inside comments and inside string, template or regex literals are
/// ignored.
pub fn scan_references(source: &str) -> Vec<Reference> {
  let masked = mask_non_code(source);
  reference_regex()
    .captures_iter(&masked)
    .filter_map(|caps| {
      let (kind, matched) = if let Some(matched) = caps.get(1) {
        (ReferenceKind::Dynamic, matched)
      } else if let Some(matched) = caps.get(2) {
        (ReferenceKind::AssetUrl, matched)
      } else {
        (ReferenceKind::Import, caps.get(3)?)
      };
      Some(Reference {
        kind,
        specifier: source.get(matched.range())?.to_string(),
        range: matched.range(),
      })
    })
    .collect()
}

/// Characters after which a `/` starts a regex literal rather than a division.
const REGEX_PRECEDERS: &[u8] = b"(,=:[!&|?{};+-*%<>~^";

/// ASCII copy of `source` with the same byte offsets: comments become spaces, the
/// bodies of string, template and regex literals become `x`, and any other non-ASCII
/// byte becomes `x`.
fn mask_non_code(source: &str) -> String {
  let bytes = source.as_bytes();
  let mut masked = bytes.to_vec();
  let mut previous = None;
  let mut index = 0;

  while index < bytes.len() {
    let byte = bytes[index];
    let next = bytes.get(index + 1).copied();
    match byte {
      b'/' if next == Some(b'/') => {
        let end = bytes[index..]
          .iter()
          .position(|&b| b == b'\n')
          .map_or(bytes.len(), |offset| index + offset);
        masked[index..end].fill(b' ');
        index = end;
      }
      b'/' if next == Some(b'*') => {
        let end = source[index + 2..]
          .find("*/")
          .map_or(bytes.len(), |offset| index + 2 + offset + 2);
        for masked_byte in &mut masked[index..end] {
          if *masked_byte != b'\n' {
            *masked_byte = b' ';
          }
        }
        index = end;
      }
      b'"' | b'\'' | b'`' => {
        let (body_end, end) = literal_end(bytes, index, byte);
        masked[index + 1..body_end].fill(b'x');
        previous = Some(byte);
        index = end;
      }
      b'/' if previous.is_none_or(|previous| REGEX_PRECEDERS.contains(&previous)) => {
        let (body_end, end) = regex_end(bytes, index);
        masked[index + 1..body_end].fill(b'x');
        previous = Some(byte);
        index = end;
      }
      _ => {
        if !byte.is_ascii() {
          masked[index] = b'x';
        } else if !byte.is_ascii_whitespace() {
          previous = Some(byte);
        }
        index += 1;
      }
    }
  }

  masked.into_iter().map(char::from).collect()
}

/// End of the literal body and of the whole literal opened by `quote` at `start`.
fn literal_end(bytes: &[u8], start: usize, quote: u8) -> (usize, usize) {
  let mut index = start + 1;
  while index < bytes.len() {
    match bytes[index] {
      b'\\' => index += 2,
      b if b == quote => return (index, index + 1),
      b'\n' if quote != b'`' => return (index, index),
      _ => index += 1,
    }
  }
  (bytes.len(), bytes.len())
}

/// End of the body and of the whole regex literal opened at `start`.
fn regex_end(bytes: &[u8], start: usize) -> (usize, usize) {
  let mut index = start + 1;
  let mut in_class = false;
  while index < bytes.len() {
    match bytes[index] {
      b'\\' => index += 2,
      b'\n' => return (index, index),
      b'[' => {
        in_class = true;
        index += 1;
      }
      b']' => {
        in_class = false;
        index += 1;
      }
      b'/' if !in_class => return (index, index + 1),
      _ => index += 1,
    }
  }
  (bytes.len(), bytes.len())
}

/// Where the entry module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
  /// A JavaScript file on disk.
  File(PathBuf),
  /// Source synthesised in memory; `path` anchors relative imports and is never read.
  Generated {
    /// Virtual location of the module.
    path: PathBuf,
    /// Module source.
    contents: String,
  },
}

impl EntrySource {
  /// Location of the entry module.
  pub fn path(&self) -> &Path {
    match self {
      EntrySource::File(path) => path,
      EntrySource::Generated { path, .. } => path,
    }
  }
}

/// Graph identity: a file imported as a module and the same file referenced as a raw
/// asset are distinct nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
  path: PathBuf,
  raw: bool,
}

/// A resolved reference from one node to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
  /// Byte range of the specifier in the node's contents.
  pub range: Range<usize>,
  /// Index of the referenced node in [`ModuleGraph::nodes`].
  pub target: usize,
}

/// One loaded module or raw asset.
#[derive(Debug, Clone)]
pub struct ModuleNode {
  /// Canonical source location.
  pub path: PathBuf,
  /// Kind before transforms ran.
  pub source_kind: AssetKind,
  /// Kind after transforms; either `Script` or `Binary`.
  pub kind: AssetKind,
  /// Transformed contents.
  pub contents: Vec<u8>,
  /// Resolved references in source order. Externals are not listed.
  pub links: Vec<Link>,
}

impl ModuleNode {
  /// Whether this node is emitted as a script module.
  pub fn is_script(&self) -> bool {
    self.kind == AssetKind::Script
  }
}

/// Modules reachable from an entry, dependencies before their importers.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
  /// Nodes in post-order; the entry module is last.
  pub nodes: Vec<ModuleNode>,
}

impl ModuleGraph {
  /// Load the entry and everything it references, transforming each module on load.
  pub fn build(
    entry: &EntrySource,
    transforms: &[Box<dyn AssetTransform>],
    externals: &[String],
  ) -> Result<Self, BundleError> {
    let mut loader = GraphLoader {
      transforms,
      externals,
      nodes: Vec::new(),
      indices: HashMap::new(),
      visiting: HashSet::new(),
      pending: Vec::new(),
    };

    let entry_key = match entry {
      EntrySource::File(path) => {
        if !path.is_file() {
          return Err(BundleError::EntryNotFound { path: path.clone() });
        }
        NodeKey {
          path: canonical(path)?,
          raw: false,
        }
      }
      EntrySource::Generated { path, .. } => NodeKey {
        path: canonical_virtual(path),
        raw: false,
      },
    };

    let generated = match entry {
      EntrySource::Generated { contents, .. } => Some(contents.as_bytes().to_vec()),
      EntrySource::File(_) => None,
    };
    loader.visit(entry_key, generated)?;
    loader.finish()
  }

  /// The entry node.
  pub fn entry(&self) -> Option<&ModuleNode> {
    self.nodes.last()
  }

  /// Indices of every node reachable from `index`, excluding itself, ordered by path.
  pub fn reachable(&self, index: usize) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = self.nodes[index]
      .links
      .iter()
      .map(|link| link.target)
      .collect();
    while let Some(next) = stack.pop() {
      if next == index || !seen.insert(next) {
        continue;
      }
      stack.extend(self.nodes[next].links.iter().map(|link| link.target));
    }

    let mut reachable: Vec<usize> = seen.into_iter().collect();
    reachable.sort_by(|a, b| {
      let (a, b) = (&self.nodes[*a], &self.nodes[*b]);
      (&a.path, a.kind).cmp(&(&b.path, b.kind))
    });
    reachable
  }
}

struct PendingNode {
  index: usize,
  links: Vec<(Range<usize>, NodeKey)>,
}

struct GraphLoader<'a> {
  transforms: &'a [Box<dyn AssetTransform>],
  externals: &'a [String],
  nodes: Vec<ModuleNode>,
  indices: HashMap<NodeKey, usize>,
  visiting: HashSet<NodeKey>,
  pending: Vec<PendingNode>,
}

impl GraphLoader<'_> {
  fn visit(&mut self, key: NodeKey, preloaded: Option<Vec<u8>>) -> Result<(), BundleError> {
    if self.indices.contains_key(&key) || self.visiting.contains(&key) {
      return Ok(());
    }

    let contents = match preloaded {
      Some(contents) => contents,
      None => std::fs::read(&key.path).map_err(|source| BundleError::Io {
        path: key.path.clone(),
        source,
      })?,
    };

    if key.raw {
      let index = self.push(ModuleNode {
        path: key.path.clone(),
        source_kind: AssetKind::from_path(&key.path),
        kind: AssetKind::Binary,
        contents,
        links: Vec::new(),
      });
      self.indices.insert(key, index);
      return Ok(());
    }

    let source_kind = AssetKind::from_path(&key.path);
    let asset = apply_transforms(self.transforms, Asset::new(key.path.clone(), contents))?;
    if asset.kind != AssetKind::Script {
      return Err(BundleError::NoLoader { path: key.path });
    }

    let text = std::str::from_utf8(&asset.contents).map_err(|err| BundleError::Io {
      path: key.path.clone(),
      source: std::io::Error::new(ErrorKind::InvalidData, err),
    })?;

    let mut links = Vec::new();
    for reference in scan_references(text) {
      if let Some(target) = self.resolve(&key.path, &reference)? {
        links.push((reference.range, target));
      }
    }

    self.visiting.insert(key.clone());
    for (_, target) in &links {
      self.visit(target.clone(), None)?;
    }
    self.visiting.remove(&key);

    let index = self.push(ModuleNode {
      path: key.path.clone(),
      source_kind,
      kind: AssetKind::Script,
      contents: asset.contents,
      links: Vec::new(),
    });
    self.indices.insert(key, index);
    self.pending.push(PendingNode { index, links });
    Ok(())
  }

  fn push(&mut self, node: ModuleNode) -> usize {
    self.nodes.push(node);
    self.nodes.len() - 1
  }

  fn resolve(
    &self,
    importer: &Path,
    reference: &Reference,
  ) -> Result<Option<NodeKey>, BundleError> {
    let specifier = reference.specifier.as_str();
    if self.externals.iter().any(|external| external == specifier)
      || URL_PREFIXES.iter().any(|prefix| specifier.starts_with(prefix))
    {
      return Ok(None);
    }

    let unresolved = || BundleError::UnresolvedImport {
      importer: importer.to_path_buf(),
      specifier: specifier.to_string(),
    };
    let base_dir = importer.parent().unwrap_or_else(|| Path::new("."));

    match reference.kind {
      ReferenceKind::AssetUrl => {
        if specifier.starts_with('/') {
          return Ok(None);
        }
        let candidate = base_dir.join(specifier);
        if !candidate.is_file() {
          return Err(unresolved());
        }
        Ok(Some(NodeKey {
          path: canonical(&candidate)?,
          raw: true,
        }))
      }
      ReferenceKind::Import | ReferenceKind::Dynamic => {
        if !(specifier.starts_with("./") || specifier.starts_with("../")) {
          return Err(unresolved());
        }
        let base = base_dir.join(specifier);
        let candidates = std::iter::once(base.clone()).chain(RESOLVE_SUFFIXES.iter().map(|suffix| {
          let mut candidate = base.clone().into_os_string();
          candidate.push(suffix);
          PathBuf::from(candidate)
        }));
        for candidate in candidates {
          if candidate.is_file() {
            return Ok(Some(NodeKey {
              path: canonical(&candidate)?,
              raw: false,
            }));
          }
        }
        Err(unresolved())
      }
    }
  }

  fn finish(mut self) -> Result<ModuleGraph, BundleError> {
    for pending in std::mem::take(&mut self.pending) {
      let mut links = Vec::with_capacity(pending.links.len());
      for (range, key) in pending.links {
        let target = *self
          .indices
          .get(&key)
          .ok_or_else(|| BundleError::NoLoader { path: key.path.clone() })?;
        links.push(Link { range, target });
      }
      self.nodes[pending.index].links = links;
    }
    Ok(ModuleGraph { nodes: self.nodes })
  }
}

fn canonical(path: &Path) -> Result<PathBuf, BundleError> {
  std::fs::canonicalize(path).map_err(|source| BundleError::Io {
    path: path.to_path_buf(),
    source,
  })
}

fn canonical_virtual(path: &Path) -> PathBuf {
  match (path.parent(), path.file_name()) {
    (Some(parent), Some(name)) => std::fs::canonicalize(parent)
      .map(|parent| parent.join(name))
      .unwrap_or_else(|_| path.to_path_buf()),
    _ => path.to_path_buf(),
  }
}

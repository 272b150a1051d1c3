//! Output filename templates, content hashes and collision-free chunk names.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::Mode;

/// Default template for the entry module.
pub const DEFAULT_ENTRY_TEMPLATE: &str = "[name].js";
/// Default template for other script modules.
pub const DEFAULT_CHUNK_TEMPLATE: &str = "[name].js";
/// Default template for non-script assets.
pub const DEFAULT_ASSET_TEMPLATE: &str = "[name][ext]";

fn hash_token() -> &'static Regex {
  static TOKEN: OnceLock<Regex> = OnceLock::new();
  TOKEN.get_or_init(|| Regex::new(r"\[contenthash(?::(\d+))?\]").expect("invalid hash token regex"))
}

fn separated_hash_token() -> &'static Regex {
  static TOKEN: OnceLock<Regex> = OnceLock::new();
  TOKEN.get_or_init(|| {
    Regex::new(r"[.\-_]?\[contenthash(?::\d+)?\]").expect("invalid separated hash token regex")
  })
}

/// Output filename pattern supporting `[name]`, `[ext]`, `[contenthash]` and `[contenthash:N]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
  pattern: String,
}

impl FilenameTemplate {
  /// Use `pattern` verbatim.
  pub fn new(pattern: impl Into<String>) -> Self {
    Self {
      pattern: pattern.into(),
    }
  }

  /// Adapt `pattern` to a build mode.
  ///
  /// Production guarantees a content hash in every filename; development strips hash
  /// tokens so filenames stay stable across rebuilds. A template named only by its
  /// hash gets `[name]` in place of the hash instead.
  pub fn for_mode(pattern: &str, mode: Mode) -> Self {
    let template = Self::new(pattern);
    match mode {
      Mode::Development if !template.has_hash() => template,
      Mode::Development => {
        let stripped = separated_hash_token().replace_all(pattern, "");
        if stripped.contains("[name]") {
          Self::new(stripped.into_owned())
        } else {
          Self::new(hash_token().replace_all(pattern, "[name]").into_owned())
        }
      }
      Mode::Production if template.has_hash() => template,
      Mode::Production => Self::new(insert_hash(pattern)),
    }
  }

  /// Whether rendering depends on file contents.
  pub fn has_hash(&self) -> bool {
    hash_token().is_match(&self.pattern)
  }

  /// Pattern as stored.
  pub fn as_str(&self) -> &str {
    &self.pattern
  }

  /// Render a filename. `ext` includes its leading dot; `hash` is the full hex digest.
  pub fn render(&self, name: &str, ext: &str, hash: &str, hash_length: usize) -> String {
    let with_hash = hash_token().replace_all(&self.pattern, |caps: &regex::Captures<'_>| {
      let length = caps
        .get(1)
        .and_then(|digits| digits.as_str().parse::<usize>().ok())
        .unwrap_or(hash_length)
        .min(hash.len());
      hash[..length].to_string()
    });
    with_hash.replace("[name]", name).replace("[ext]", ext)
  }
}

fn insert_hash(pattern: &str) -> String {
  if let Some(position) = pattern.find("[ext]") {
    return format!("{}.[contenthash]{}", &pattern[..position], &pattern[position..]);
  }

  let file_start = pattern.rfind('/').map(|index| index + 1).unwrap_or(0);
  match pattern[file_start..].rfind('.') {
    Some(dot) if dot > 0 => {
      let dot = file_start + dot;
      format!("{}.[contenthash]{}", &pattern[..dot], &pattern[dot..])
    }
    _ => format!("{pattern}.[contenthash]"),
  }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn digest_hex(bytes: &[u8]) -> String {
  format!("{:x}", Sha256::digest(bytes))
}

/// Hash of a module combined with the digests of everything it reaches.
///
/// `reachable` must be in a deterministic order so identical inputs hash identically.
pub fn combined_hash<'a>(own: &str, reachable: impl IntoIterator<Item = &'a str>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(own.as_bytes());
  for digest in reachable {
    hasher.update(b"\0");
    hasher.update(digest.as_bytes());
  }
  format!("{:x}", hasher.finalize())
}

/// Derive a filesystem-friendly chunk name, deduplicating against names already taken.
///
/// `used` holds rendered keys (`name` plus extension) so a stylesheet module and a
/// script sharing a stem do not collide.
pub fn unique_chunk_name(base: &str, ext: &str, used: &mut BTreeSet<String>) -> String {
  let mut sanitized = base
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect::<String>();

  while sanitized.contains("__") {
    sanitized = sanitized.replace("__", "_");
  }
  let sanitized = sanitized.trim_matches('.').to_string();
  let base = if sanitized.is_empty() {
    "chunk".to_string()
  } else {
    sanitized
  };

  let mut candidate = base.clone();
  let mut counter = 1;
  while used.contains(&format!("{candidate}{ext}")) {
    candidate = format!("{base}-{counter}");
    counter += 1;
  }

  used.insert(format!("{candidate}{ext}"));
  candidate
}

#[cfg(test)]
mod tests {
  use super::*;

  const HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

  #[test]
  fn renders_tokens() {
    let template = FilenameTemplate::new("[name].[contenthash:8][ext]");
    assert_eq!(template.render("index_bg", ".wasm", HASH, 20), "index_bg.01234567.wasm");

    let template = FilenameTemplate::new("[name].[contenthash].js");
    assert_eq!(template.render("app", ".js", HASH, 20), "app.0123456789abcdef0123.js");
  }

  #[test]
  fn production_inserts_missing_hash() {
    assert_eq!(
      FilenameTemplate::for_mode("bundle.js", Mode::Production).as_str(),
      "bundle.[contenthash].js"
    );
    assert_eq!(
      FilenameTemplate::for_mode("[name][ext]", Mode::Production).as_str(),
      "[name].[contenthash][ext]"
    );
    assert_eq!(
      FilenameTemplate::for_mode("assets/[name]", Mode::Production).as_str(),
      "assets/[name].[contenthash]"
    );
    assert_eq!(
      FilenameTemplate::for_mode("[name].[contenthash:8].js", Mode::Production).as_str(),
      "[name].[contenthash:8].js"
    );
  }

  #[test]
  fn development_strips_hash_tokens() {
    assert_eq!(
      FilenameTemplate::for_mode("[name].[contenthash].js", Mode::Development).as_str(),
      "[name].js"
    );
    assert_eq!(
      FilenameTemplate::for_mode("[name]-[contenthash:8][ext]", Mode::Development).as_str(),
      "[name][ext]"
    );
  }

  #[test]
  fn development_names_hash_only_templates() {
    let template = FilenameTemplate::for_mode("[contenthash].js", Mode::Development);
    assert_eq!(template.as_str(), "[name].js");
    assert_ne!(
      template.render("main", ".js", HASH, 20),
      template.render("style", ".js", HASH, 20)
    );
    assert_eq!(
      FilenameTemplate::for_mode("assets/[contenthash:8][ext]", Mode::Development).as_str(),
      "assets/[name][ext]"
    );
    assert_eq!(
      FilenameTemplate::for_mode("bundle.js", Mode::Development).as_str(),
      "bundle.js"
    );
  }

  #[test]
  fn combined_hash_depends_on_dependencies() {
    let own = digest_hex(b"import './dep.js';");
    let dep_a = digest_hex(b"export const a = 1;");
    let dep_b = digest_hex(b"export const a = 2;");

    assert_eq!(
      combined_hash(&own, [dep_a.as_str()]),
      combined_hash(&own, [dep_a.as_str()])
    );
    assert_ne!(
      combined_hash(&own, [dep_a.as_str()]),
      combined_hash(&own, [dep_b.as_str()])
    );
  }

  #[test]
  fn deduplicates_chunk_names_per_extension() {
    let mut used = BTreeSet::new();
    used.insert("main.js".to_string());

    assert_eq!(unique_chunk_name("index", ".js", &mut used), "index");
    assert_eq!(unique_chunk_name("index", ".js", &mut used), "index-1");
    assert_eq!(unique_chunk_name("index", ".wasm", &mut used), "index");
    assert_eq!(unique_chunk_name("main", ".js", &mut used), "main-1");
    assert_eq!(unique_chunk_name("my file", ".js", &mut used), "my_file");
  }
}

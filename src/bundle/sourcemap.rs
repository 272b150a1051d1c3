//! Identity line sourcemaps for development builds.

use std::path::Path;

/// VLQ mappings pairing each generated line with the same source line.
pub fn identity_mappings(line_count: usize) -> String {
  if line_count == 0 {
    return String::new();
  }
  let mut mappings = String::from("AAAA");
  for _ in 1..line_count {
    mappings.push_str(";AACA");
  }
  mappings
}

/// Sourcemap v3 document for a module emitted without changes to its line structure.
pub fn render_sourcemap(file: &str, source_name: &str, source: &str) -> Vec<u8> {
  let map = serde_json::json!({
    "version": 3,
    "file": file,
    "sources": [source_name],
    "sourcesContent": [source],
    "names": [],
    "mappings": identity_mappings(source.lines().count().max(1)),
  });
  map.to_string().into_bytes()
}

/// Name recorded under `sources`: the module path relative to `root`, `/`-separated.
pub fn source_name(path: &Path, root: &Path) -> String {
  let relative = path.strip_prefix(root).unwrap_or(path);
  relative
    .components()
    .map(|component| component.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

/// Append the trailing `sourceMappingURL` comment pointing at `map_file`.
pub fn append_mapping_comment(contents: &mut Vec<u8>, map_file: &str) {
  if !contents.ends_with(b"\n") && !contents.is_empty() {
    contents.push(b'\n');
  }
  contents.extend_from_slice(format!("//# sourceMappingURL={map_file}\n").as_bytes());
}

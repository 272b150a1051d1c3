//! HTML rendering: asset-tag injection into a template or a default document.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use sha2::{Digest, Sha384};

use crate::models::{BundleManifest, EmittedFile};

/// How the document references one emitted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
  /// The entry module, loaded with `<script type="module">`.
  EntryScript,
  /// A script module the entry imports.
  ModulePreload,
  /// A plain stylesheet.
  Stylesheet,
  /// The compiled WebAssembly binary.
  WasmPreload,
  /// Any other file fetched at runtime.
  FetchPreload,
}

/// One tag to inject into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlAsset {
  /// URL as written into the tag.
  pub url: String,
  /// Tag flavour.
  pub role: AssetRole,
  /// Subresource integrity value (`sha384-...`).
  pub integrity: Option<String>,
}

impl HtmlAsset {
  /// Render the tag.
  pub fn render(&self) -> String {
    let url = escape_attribute(&self.url);
    let integrity = self
      .integrity
      .as_deref()
      .map(|value| format!(" integrity=\"{value}\""))
      .unwrap_or_default();

    match self.role {
      AssetRole::EntryScript => {
        format!("<script type=\"module\" src=\"{url}\"{integrity}></script>")
      }
      AssetRole::ModulePreload => format!("<link rel=\"modulepreload\" href=\"{url}\"{integrity}>"),
      AssetRole::Stylesheet => format!("<link rel=\"stylesheet\" href=\"{url}\"{integrity}>"),
      AssetRole::WasmPreload => format!(
        "<link rel=\"preload\" href=\"{url}\" as=\"fetch\" type=\"application/wasm\" crossorigin{integrity}>"
      ),
      AssetRole::FetchPreload => {
        format!("<link rel=\"preload\" href=\"{url}\" as=\"fetch\" crossorigin{integrity}>")
      }
    }
  }
}

/// Tags for every output file in load order, URLs prefixed with `public_path`.
///
/// With `integrity` set, each tag carries the `sha384` digest of the emitted bytes.
pub fn asset_tags(
  manifest: &BundleManifest,
  files: &[EmittedFile],
  public_path: &str,
  integrity: bool,
) -> Vec<HtmlAsset> {
  let contents: HashMap<&str, &[u8]> = files
    .iter()
    .map(|file| (file.file_name.as_str(), file.contents.as_slice()))
    .collect();
  let entry = manifest.entry_file();

  manifest
    .output_files
    .iter()
    .map(|file_name| {
      let role = if Some(file_name.as_str()) == entry {
        AssetRole::EntryScript
      } else if file_name.ends_with(".js") || file_name.ends_with(".mjs") {
        AssetRole::ModulePreload
      } else if file_name.ends_with(".wasm") {
        AssetRole::WasmPreload
      } else if file_name.ends_with(".css") {
        AssetRole::Stylesheet
      } else {
        AssetRole::FetchPreload
      };

      HtmlAsset {
        url: public_url(public_path, file_name),
        role,
        integrity: integrity
          .then(|| contents.get(file_name.as_str()).map(|bytes| subresource_integrity(bytes)))
          .flatten(),
      }
    })
    .collect()
}

/// `sha384-<base64>` digest for an integrity attribute.
pub fn subresource_integrity(bytes: &[u8]) -> String {
  format!("sha384-{}", STANDARD.encode(Sha384::digest(bytes)))
}

/// Join a public path prefix and an output filename.
pub fn public_url(public_path: &str, file_name: &str) -> String {
  if public_path.is_empty() {
    file_name.to_string()
  } else if public_path.ends_with('/') {
    format!("{public_path}{file_name}")
  } else {
    format!("{public_path}/{file_name}")
  }
}

/// Document used when the project has no template.
pub fn default_document(title: &str) -> String {
  format!(
    "<!DOCTYPE html>\n<html lang=\"en\">\n  <head>\n    <meta charset=\"utf-8\">\n    <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n    <title>{}</title>\n  </head>\n  <body>\n  </body>\n</html>\n",
    escape_text(title)
  )
}

/// Inject `assets` into `template` (or the default document) before `</head>`.
///
/// Falls back to `</body>`, then to appending when neither closing tag exists.
pub fn render_document(template: Option<&str>, title: &str, assets: &[HtmlAsset]) -> String {
  static HEAD_CLOSE: OnceLock<Regex> = OnceLock::new();
  static BODY_CLOSE: OnceLock<Regex> = OnceLock::new();
  let head_close =
    HEAD_CLOSE.get_or_init(|| Regex::new(r"(?i)</head\s*>").expect("invalid head regex"));
  let body_close =
    BODY_CLOSE.get_or_init(|| Regex::new(r"(?i)</body\s*>").expect("invalid body regex"));

  let document = template
    .map(str::to_string)
    .unwrap_or_else(|| default_document(title));

  let mut block = String::new();
  for asset in assets {
    block.push_str("    ");
    block.push_str(&asset.render());
    block.push('\n');
  }

  let position = head_close
    .find(&document)
    .or_else(|| body_close.find(&document))
    .map(|found| found.start());

  match position {
    Some(position) => {
      let line_start = document[..position]
        .rfind('\n')
        .map(|index| index + 1)
        .unwrap_or(0);
      let insert_at = if document[line_start..position].trim().is_empty() {
        line_start
      } else {
        position
      };
      let mut rendered = String::with_capacity(document.len() + block.len());
      rendered.push_str(&document[..insert_at]);
      if insert_at == position && !block.is_empty() {
        rendered.push('\n');
      }
      rendered.push_str(&block);
      rendered.push_str(&document[insert_at..]);
      rendered
    }
    None => {
      let mut rendered = document;
      if !rendered.is_empty() && !rendered.ends_with('\n') {
        rendered.push('\n');
      }
      rendered.push_str(&block);
      rendered
    }
  }
}

fn escape_attribute(value: &str) -> String {
  value
    .replace('&', "&amp;")
    .replace('"', "&quot;")
    .replace('<', "&lt;")
}

fn escape_text(value: &str) -> String {
  value
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
}

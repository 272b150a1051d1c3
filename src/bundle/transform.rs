//! Loader plugins turning imported non-script modules into script modules.

use std::path::{Path, PathBuf};

use crate::error::BundleError;

/// Coarse classification of a module by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssetKind {
  /// JavaScript module.
  Script,
  /// CSS stylesheet.
  Stylesheet,
  /// JSON document.
  Json,
  /// Anything else, emitted byte for byte.
  Binary,
}

impl AssetKind {
  /// Classify `path` by extension.
  pub fn from_path(path: &Path) -> Self {
    let ext = path
      .extension()
      .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
      Some("js" | "mjs" | "cjs") => AssetKind::Script,
      Some("css") => AssetKind::Stylesheet,
      Some("json") => AssetKind::Json,
      _ => AssetKind::Binary,
    }
  }
}

/// A module flowing through the transform pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
  /// Source file the module was loaded from.
  pub path: PathBuf,
  /// Current kind; transforms change it as they convert the contents.
  pub kind: AssetKind,
  /// Current contents.
  pub contents: Vec<u8>,
}

impl Asset {
  /// Wrap freshly loaded contents, classifying them by extension.
  pub fn new(path: PathBuf, contents: Vec<u8>) -> Self {
    let kind = AssetKind::from_path(&path);
    Self {
      path,
      kind,
      contents,
    }
  }

  fn text(&self, loader: &'static str) -> Result<&str, BundleError> {
    std::str::from_utf8(&self.contents).map_err(|err| BundleError::Transform {
      loader,
      path: self.path.clone(),
      message: err.to_string(),
    })
  }
}

/// One step of the bundler's ordered plugin list.
pub trait AssetTransform: Send + Sync {
  /// Name used in diagnostics.
  fn name(&self) -> &'static str;

  /// Whether this transform handles `asset` in its current state.
  fn applies_to(&self, asset: &Asset) -> bool;

  /// Convert `asset`.
  fn transform(&self, asset: Asset) -> Result<Asset, BundleError>;
}

/// Run every applicable transform over `asset` in order.
pub fn apply_transforms(
  transforms: &[Box<dyn AssetTransform>],
  mut asset: Asset,
) -> Result<Asset, BundleError> {
  for transform in transforms {
    if transform.applies_to(&asset) {
      asset = transform.transform(asset)?;
    }
  }
  Ok(asset)
}

/// Transforms installed when none are configured: stylesheets, then JSON.
pub fn default_transforms() -> Vec<Box<dyn AssetTransform>> {
  vec![Box::new(StylesheetLoader), Box::new(JsonLoader)]
}

/// Turns an imported stylesheet into a module that injects a `<style>` element.
#[derive(Debug, Clone, Copy, Default)]
pub struct StylesheetLoader;

impl AssetTransform for StylesheetLoader {
  fn name(&self) -> &'static str {
    "stylesheet-loader"
  }

  fn applies_to(&self, asset: &Asset) -> bool {
    asset.kind == AssetKind::Stylesheet
  }

  fn transform(&self, asset: Asset) -> Result<Asset, BundleError> {
    let css = asset.text(self.name())?;
    let source_name = asset
      .path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();

    let encode = |value: &str| {
      serde_json::to_string(value).map_err(|err| BundleError::Transform {
        loader: "stylesheet-loader",
        path: asset.path.clone(),
        message: err.to_string(),
      })
    };
    let css_literal = encode(css)?;
    let source_literal = encode(&source_name)?;

    let module = format!(
      "const css = {css_literal};\n\
const style = document.createElement(\"style\");\n\
style.setAttribute(\"data-source\", {source_literal});\n\
style.textContent = css;\n\
document.head.appendChild(style);\n\
export default css;\n"
    );

    Ok(Asset {
      path: asset.path,
      kind: AssetKind::Script,
      contents: module.into_bytes(),
    })
  }
}

/// Turns an imported JSON document into a module exporting it as the default export.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLoader;

impl AssetTransform for JsonLoader {
  fn name(&self) -> &'static str {
    "json-loader"
  }

  fn applies_to(&self, asset: &Asset) -> bool {
    asset.kind == AssetKind::Json
  }

  fn transform(&self, asset: Asset) -> Result<Asset, BundleError> {
    let value: serde_json::Value =
      serde_json::from_slice(&asset.contents).map_err(|err| BundleError::Transform {
        loader: self.name(),
        path: asset.path.clone(),
        message: err.to_string(),
      })?;

    Ok(Asset {
      path: asset.path,
      kind: AssetKind::Script,
      contents: format!("export default {value};\n").into_bytes(),
    })
  }
}

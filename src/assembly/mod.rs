//! Output assembly: render the HTML document and publish files into the output directory.

pub mod html;
pub mod output;

pub use html::{AssetRole, HtmlAsset, asset_tags, render_document};
pub use output::{ASSET_MANIFEST_FILE, assemble};

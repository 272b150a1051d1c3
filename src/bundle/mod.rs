//! In-process asset bundling: module graph, loader transforms, hashing and naming.

pub mod bundler;
pub mod graph;
pub mod naming;
pub mod sourcemap;
pub mod transform;

pub use bundler::{BundleRequest, Bundler, GENERATED_ENTRY_FILE, bootstrap_source};
pub use graph::{EntrySource, ModuleGraph};
pub use transform::{
  Asset, AssetKind, AssetTransform, JsonLoader, StylesheetLoader, default_transforms,
};

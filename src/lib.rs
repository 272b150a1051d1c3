#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod assembly;
pub mod bundle;
pub mod cli;
pub mod compile;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod serve;
pub mod watch;

pub use bundle::{AssetTransform, BundleRequest, Bundler};
pub use compile::{CompileRequest, Compiler, WasmPack};
pub use config::{ProjectConfig, TargetOptions, TargetOverrides};
pub use driver::{BuildOptions, BuildReport, TargetOutcome};
pub use error::{
  AssemblyError, BundleError, CompileError, ConfigError, DiscoveryError, DriverError, TargetError,
  WatchError,
};
pub use models::{
  AssemblyResult, BuildTarget, BundleManifest, BundleOutput, CompileArtifact, EmittedFile, Mode,
};
pub use pipeline::Pipeline;

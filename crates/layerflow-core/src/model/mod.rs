//! モデル定義
//!
//! layerflow のマニフェストで使用されるデータモデルを定義します。

mod builder;
mod docker;
mod git;
mod import;
mod manifest;
mod stage;
mod target;

// Re-exports
pub use builder::*;
pub use docker::*;
pub use git::*;
pub use import::*;
pub use manifest::*;
pub use stage::*;
pub use target::*;

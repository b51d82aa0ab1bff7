//! layerflow のマニフェスト層
//!
//! `layerflow.kdl` をパースしてイメージ/アーティファクトのターゲット定義を生成し、
//! ビルド前に検証します。

pub mod error;
pub mod loader;
pub mod model;
pub mod parser;
pub mod validation;

pub use error::{ManifestError, Result};
pub use loader::{load_manifest, load_manifest_unchecked};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};
pub use validation::{validate_manifest, validate_target};

//! layerflow のビルドコア
//!
//! ターゲットをステージの鎖として組み立て、各ステージの入力から
//! シグネチャを計算し、`<project>-stages:<signature>` というタグを
//! キャッシュとして使いながらイメージを積み上げます。
//!
//! ```
//! use layerflow_build::hashsum;
//!
//! let signature = hashsum(["1", "alpine:3.20"]);
//! assert_eq!(signature.len(), 64);
//! ```

pub mod builder;
pub mod cache;
pub mod chain;
pub mod context;
pub mod conveyor;
pub mod error;
pub mod fingerprint;
pub mod git_artifact;
pub mod hasher;
pub mod labels;
pub mod lifecycle;
pub mod lock;
pub mod naming;
pub mod planner;
pub mod policy;
pub mod progress;
pub mod recipe;
pub mod registry;
pub mod runner;
pub mod stage;
pub mod target;
pub mod vcs;

/// シグネチャ計算の互換性バージョン
///
/// 変えるとすべてのステージのシグネチャが変わります。
pub const BUILD_CACHE_VERSION: &str = "1";

pub use builder::{BuildSummary, ChainBuilder};
pub use cache::{CacheLookup, ImageCacheResolver, ImageMetadata, RuntimeImageCache};
pub use chain::BuildStageChain;
pub use context::{BuildContext, BuildOptions};
pub use conveyor::{Conveyor, TargetOutcome};
pub use error::{BuildError, Result};
pub use fingerprint::SourceTreeFingerprint;
pub use hasher::{HashInput, hashsum};
pub use lifecycle::{GcPolicy, GcReport, ImageLifecycleManager};
pub use lock::{LockGuard, LockManager, LockMode};
pub use planner::{TargetPlan, TargetPlanner};
pub use policy::{GroupingPolicy, LoggingPolicy, StageEvent};
pub use progress::BuildProgress;
pub use registry::{Registry, RegistryClient};
pub use stage::{Stage, StageKind};
pub use target::{StageStatus, TargetBuild};
pub use vcs::{GitCli, GitCommitResolver, PatchSet, PathFilter, VersionControl};

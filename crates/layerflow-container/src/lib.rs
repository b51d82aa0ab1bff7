//! layerflow のコンテナランタイム層

pub mod auth;
pub mod docker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod runtime;

pub use auth::{BasicCredentials, RegistryAuth, registry_of};
pub use docker::DockerRuntime;
pub use error::*;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryRuntime;
pub use runtime::*;

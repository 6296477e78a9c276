//! Offline-first caching layer.
//!
//! This module provides the pieces that let the application shell run
//! without a network connection:
//! - A durable store of response snapshots, namespaced by generation
//! - Generation creation and cleanup of stale generations
//! - Warming of the bootstrap manifest at install time
//! - Stale-while-revalidate interception of outgoing reads

mod generation;
mod layer;
mod manifest;
mod policy;
mod storage;
mod traits;

pub use generation::{Generation, GenerationManager, PurgeReport};
pub use layer::Interceptor;
pub use manifest::{InstallReport, Manifest, ManifestLoader};
pub use policy::CachePolicy;
pub use storage::{NoopStorage, ResourceStore, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Request, ResponseKind, Snapshot};

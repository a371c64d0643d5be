//! Request-interception caching engine.
//!
//! This module decides, per intercepted request, how to answer it:
//! - Classifies requests into cache-first, network-first, or stale-while-revalidate
//! - Stores successful GET responses in versioned partitions (static / dynamic)
//! - Applies per-class max ages (static, dynamic, api) at read time
//! - Sweeps partitions left over from previous deployments

mod classifier;
mod expiry;
mod generation;
mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Request, Response};

//! Request interception cache for offline browsing.
//!
//! This module:
//! - Classifies each request as a page, a static asset, or a mutating request
//! - Serves pages network-first (cached copy, then offline page, as fallbacks)
//! - Serves static assets cache-first
//! - Keeps responses in versioned generations and retires old ones on activation

mod classify;
mod generation;
mod layer;
mod storage;
mod traits;

pub use generation::{ActiveGeneration, GenerationManager, InstallPolicy};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheSource, Served, SOURCE_HEADER};

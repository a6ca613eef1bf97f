//! # Caching infrastructure of the loader
//!
//! Artifacts are cached in two tiers:
//!
//! - The in-memory tier holds decoded artifacts. It is byte-budgeted: the [`MemoryCache`] tracks
//!   the size of every resident artifact in access order, and once the total reaches the
//!   configured upper limit it evicts the least recently used entries until the total is at or
//!   below the lower limit.
//! - The [`ArtifactStore`] persists the encoded artifact of every successful fetch as one file
//!   per URL below the storage directory. There is no index file and no expiry; an artifact is
//!   stored iff its file exists.
//!
//! A load goes through the in-memory tier first, then the store, and only then schedules a
//! network fetch. Evicted artifacts are reloaded from the store on their next load.
//!
//! The [`TagIndex`] maps tags to the URLs loaded under them, so that all artifacts of a tag can be
//! dropped from memory at once.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! Fetching and decoding produce a [`CacheEntry`], which is just a [`Result`] around a
//! [`CacheError`]. Errors are never cached: a failed artifact is forgotten, and the next load for
//! its URL starts from scratch.
//!
//! ### Metrics
//!
//! - `loader.memory.hit`: Loads served from memory.
//! - `loader.disk.hit`: Loads served from the store.
//! - `loader.evicted`: Number of artifacts evicted from memory.
//! - `loader.memory.size`: Gauge of the bytes held in memory.

mod cache_error;
mod memory;
mod store;
mod tags;

pub use cache_error::{CacheEntry, CacheError, LoadError};
pub use memory::MemoryCache;
pub use store::{ArtifactStore, file_name};
pub use tags::TagIndex;

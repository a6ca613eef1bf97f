//! Conversion between fetched bytes and decoded artifacts.

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError};
use crate::types::Artifact;

/// Decodes fetched or stored bytes into an [`Artifact`], and encodes artifacts for the store.
///
/// Both directions run on the blocking thread pool.
pub trait ArtifactCodec: Send + Sync + 'static {
    /// Decodes `data`, downsampling by `scale`.
    fn decode(&self, data: Bytes, scale: u32) -> CacheEntry<Artifact>;

    /// Encodes `artifact` into the bytes that are persisted in the store.
    fn encode(&self, artifact: &Artifact) -> CacheEntry<Bytes>;
}

/// A codec that keeps the fetched bytes as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ArtifactCodec for RawCodec {
    fn decode(&self, data: Bytes, scale: u32) -> CacheEntry<Artifact> {
        if data.is_empty() {
            return Err(CacheError::Malformed("empty payload".into()));
        }
        Ok(Artifact::new(data, scale))
    }

    fn encode(&self, artifact: &Artifact) -> CacheEntry<Bytes> {
        Ok(artifact.data().clone())
    }
}

use crate::types::{Artifact, Handle};

/// Applies a delivered artifact directly to the consumer behind a [`Handle`].
///
/// The sink is only used for loads without a callback. It is invoked from the loader's worker
/// tasks, so implementations that touch thread-bound state have to forward the artifact
/// themselves.
pub trait ArtifactSink: Send + Sync + 'static {
    fn apply(&self, handle: Handle, url: &str, artifact: &Artifact);
}

/// A sink that drops every artifact, for hosts that only use callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ArtifactSink for NoopSink {
    fn apply(&self, handle: Handle, url: &str, _artifact: &Artifact) {
        tracing::trace!(%handle, url, "Dropping artifact without a sink");
    }
}

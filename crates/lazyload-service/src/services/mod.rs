//! Services making up the loader.

pub mod codec;
pub mod download;
pub mod loader;
pub mod scheduler;
pub mod sink;

pub use codec::{ArtifactCodec, RawCodec};
pub use download::{DownloadService, Fetcher};
pub use loader::{Collaborators, Loader, LoaderCell, LoaderStats};
pub use sink::{ArtifactSink, NoopSink};

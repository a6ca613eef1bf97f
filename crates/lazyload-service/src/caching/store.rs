use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;

/// The on-disk tier: one file per URL below a storage directory.
///
/// There is no index. Whether an artifact is stored is decided purely by the existence of its
/// file at lookup time.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens the store, creating the storage directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path at which the artifact for `url` is stored.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root.join(file_name(url))
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.is_file()
    }

    pub async fn read(&self, path: &Path) -> io::Result<Bytes> {
        let data = tokio::fs::read(path).await?;
        Ok(Bytes::from(data))
    }

    /// Writes `data` to `path`.
    ///
    /// The data is written to a temporary file in the storage directory first and then moved
    /// into place, so a concurrent reader never observes a partially written artifact.
    pub fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut temp_file = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)?;
        io::Write::write_all(&mut temp_file, data)?;
        persist_tempfile(temp_file, path)?;
        Ok(())
    }
}

/// Converts a URL into the name of its artifact file.
///
/// Everything up to and including the scheme separator `//` is dropped, and path separators are
/// replaced with `.`, so `http://example.com/img/a.png` becomes `example.com.img.a.png`.
pub fn file_name(url: &str) -> String {
    let rest = match url.split_once("//") {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => url,
    };
    let name: String = rest
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '.',
            c => c,
        })
        .collect();

    // `.` and `..` would resolve outside of the artifact file.
    if name.chars().all(|c| c == '.') {
        format!("_{name}")
    } else {
        name
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<std::fs::File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no parent directory to persist item"))?;

    // The storage directory may be wiped by the host at any time, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create storage directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist artifact file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

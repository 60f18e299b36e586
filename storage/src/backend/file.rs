//! Filesystem storage backend.

use crate::{Store, StoreError};
use async_trait::async_trait;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use tracing::debug;

/// Filesystem store: one file per resource under a base directory.
///
/// Keys are escaped by replacing `/` with `_`, so `/0/0/3` lands in
/// `<base>/_0_0_3`. The directory and its files are created with
/// owner-only permissions; the base directory is created on the first
/// write.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn location(&self, key: &str) -> PathBuf {
        self.base.join(escape_key(key))
    }
}

fn escape_key(key: &str) -> String {
    key.replace('/', "_")
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match std::fs::read(self.location(key)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.base)?;
        let location = self.location(key);
        debug!("store put key={} file={:?} len={}", key, location, data.len());
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o700)
            .open(&location)?;
        file.write_all(data)?;
        Ok(())
    }
}

//! Keyed blob storage for provisioned LWM2M resources.
//!
//! During bootstrap the server pushes object instances to the device; each
//! resource is persisted under its canonical
//! `/<object>/<instance>/<resource>` path and read back after the finish
//! signal to assemble the operational credentials. Two backends share one
//! contract: an in-memory map for process-lifetime runs and a filesystem
//! directory for persistence across runs.
//!
//! The store is shared between the transport's inbound handlers and the
//! post-bootstrap credential reload, so every `put` must be visible to
//! later `get`s across tasks; both backends return an independent copy on
//! read so callers never alias stored bytes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;

/// Canonical path of the LWM2M server URL delivered during bootstrap.
pub const RESOURCE_LWM2M_URL: &str = "/0/0/0";
/// Canonical path of the device certificate (X.509 DER).
pub const RESOURCE_DEVICE_CERT: &str = "/0/0/3";
/// Canonical path of the LWM2M server public key.
pub const RESOURCE_SERVER_KEY: &str = "/0/0/4";
/// Canonical path of the device private key (PKCS#8 DER).
pub const RESOURCE_DEVICE_KEY: &str = "/0/0/5";

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No value stored under the requested path
    #[error("resource not found")]
    NotFound,
    /// I/O failure from the filesystem backend
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed blob storage for provisioned resources.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a copy of the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store `data` under `key`, replacing any prior value.
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// Storage backend selection
#[derive(Clone, Debug, Default)]
pub enum StoreMode {
    /// In-memory map, dropped on exit
    #[default]
    Memory,
    /// One file per resource under a base directory
    Filesystem {
        /// Base directory for resource files
        dir: PathBuf,
    },
}

/// Open the store described by `mode`.
pub fn open(mode: StoreMode) -> Arc<dyn Store> {
    match mode {
        StoreMode::Memory => Arc::new(MemoryStore::new()),
        StoreMode::Filesystem { dir } => Arc::new(FileStore::new(dir)),
    }
}

/// Canonical store key for a resource: `/<object>/<instance>/<resource>`.
pub fn resource_path(object: u16, instance: u16, resource: u16) -> String {
    format!("/{}/{}/{}", object, instance, resource)
}

//! Blob storage backends for uploaded core files.
//!
//! Two implementations behind the `Store` trait, selected by config at
//! startup: an S3-compatible object store returning presigned GET URLs,
//! and a mounted shared filesystem returning `cfs://` URIs. Upload is
//! the durability point of the pipeline; a failed upload drops the event
//! before any cleanup or notification happens.

pub mod cfs;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use coredog_common::{StorageConfig, StorageProtocol};

pub use cfs::CfsStore;
pub use s3::S3Store;

/// Errors that can occur constructing a store or uploading to it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("S3 upload failed: {0}")]
    S3Upload(String),

    #[error("failed to presign retrieval URL: {0}")]
    Presign(String),

    #[error("CFS mount path {path} is not accessible: {source}")]
    MountInaccessible {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CFS mount path {0} is not a directory")]
    MountNotADirectory(String),

    #[error("CFS mount path {path} is not writable: {source}")]
    MountNotWritable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CFS write failed for {path}: {source}")]
    CfsWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A blob storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upload the file at `path`, returning a retrieval URL.
    async fn upload(&self, path: &Path) -> Result<String, StoreError>;
}

/// Construct the configured storage backend. CFS mounts are probed for
/// writability here so a bad mount aborts the process at startup.
pub fn new_store(config: &StorageConfig) -> Result<Box<dyn Store>, StoreError> {
    match config.protocol {
        StorageProtocol::S3 => Ok(Box::new(S3Store::new(config))),
        StorageProtocol::Cfs => Ok(Box::new(CfsStore::new(
            &config.cfs_mount_path,
            &config.store_dir,
        )?)),
    }
}

/// Final path component of the upload source.
pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

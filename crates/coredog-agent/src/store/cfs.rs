//! Mounted shared-filesystem backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{file_name_of, Store, StoreError};

/// Copies core files onto a shared filesystem mount. The retrieval URL is
/// a `cfs://<destdir>/<filename>` URI understood by downstream tooling.
pub struct CfsStore {
    mount_path: PathBuf,
    store_dir: String,
}

impl CfsStore {
    /// Validate the mount point: it must exist, be a directory, and be
    /// writable. Writability is probed with a timestamped sentinel file.
    pub fn new(mount_path: &Path, store_dir: &str) -> Result<Self, StoreError> {
        let meta = std::fs::metadata(mount_path).map_err(|source| StoreError::MountInaccessible {
            path: mount_path.display().to_string(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(StoreError::MountNotADirectory(mount_path.display().to_string()));
        }

        let sentinel = mount_path.join(format!(".coredog_write_test_{}", Utc::now().timestamp()));
        std::fs::write(&sentinel, b"test").map_err(|source| StoreError::MountNotWritable {
            path: mount_path.display().to_string(),
            source,
        })?;
        let _ = std::fs::remove_file(&sentinel);

        Ok(Self {
            mount_path: mount_path.to_path_buf(),
            store_dir: store_dir.to_string(),
        })
    }
}

#[async_trait]
impl Store for CfsStore {
    async fn upload(&self, path: &Path) -> Result<String, StoreError> {
        let cfs_err = |source: std::io::Error| StoreError::CfsWrite {
            path: path.display().to_string(),
            source,
        };

        let filename = file_name_of(path);
        let dest_dir = self.mount_path.join(&self.store_dir);
        tokio::fs::create_dir_all(&dest_dir).await.map_err(cfs_err)?;

        let dest_path = dest_dir.join(&filename);
        let mut src = tokio::fs::File::open(path).await.map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut dest = tokio::fs::File::create(&dest_path).await.map_err(cfs_err)?;
        tokio::io::copy(&mut src, &mut dest).await.map_err(cfs_err)?;
        dest.sync_all().await.map_err(cfs_err)?;

        info!(dest = %dest_path.display(), "copied core file to CFS mount");

        Ok(format!("cfs://{}/{}", dest_dir.display(), filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_copies_and_returns_cfs_url() {
        let mount = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let core = source.path().join("core.sh.42");
        std::fs::write(&core, b"core bytes").unwrap();

        let store = CfsStore::new(mount.path(), "dumps").unwrap();
        let url = store.upload(&core).await.unwrap();

        let dest = mount.path().join("dumps").join("core.sh.42");
        assert_eq!(std::fs::read(&dest).unwrap(), b"core bytes");
        assert_eq!(url, format!("cfs://{}/core.sh.42", mount.path().join("dumps").display()));
    }

    #[test]
    fn test_missing_mount_rejected() {
        let err = CfsStore::new(Path::new("/nonexistent/coredog-cfs"), "dumps");
        assert!(matches!(err, Err(StoreError::MountInaccessible { .. })));
    }

    #[test]
    fn test_file_mount_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let err = CfsStore::new(&file, "dumps");
        assert!(matches!(err, Err(StoreError::MountNotADirectory(_))));
    }

    #[tokio::test]
    async fn test_write_probe_sentinel_removed() {
        let mount = tempfile::tempdir().unwrap();
        let _store = CfsStore::new(mount.path(), "dumps").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(mount.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}

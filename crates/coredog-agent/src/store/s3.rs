//! S3-compatible object store backend.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use coredog_common::StorageConfig;

use super::{file_name_of, Store, StoreError};

/// Streams core files into an S3-compatible bucket and hands back a
/// presigned GET URL with the configured lifetime.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    store_dir: String,
    presign_expire: Duration,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.s3_access_key_id.clone(),
            config.s3_secret_access_key.clone(),
            None,
            None,
            "coredog-config",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.s3_region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if !config.s3_endpoint.is_empty() {
            builder = builder.endpoint_url(&config.s3_endpoint);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.s3_bucket.clone(),
            store_dir: config.store_dir.clone(),
            presign_expire: Duration::from_secs(config.presigned_url_expire_seconds),
        }
    }

    fn object_key(&self, path: &Path) -> String {
        let filename = file_name_of(path);
        if self.store_dir.is_empty() {
            filename
        } else {
            format!("{}/{}", self.store_dir.trim_end_matches('/'), filename)
        }
    }
}

#[async_trait]
impl Store for S3Store {
    async fn upload(&self, path: &Path) -> Result<String, StoreError> {
        let key = self.object_key(path);

        let body = ByteStream::from_path(path).await.map_err(|e| StoreError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::S3Upload(e.to_string()))?;

        info!(bucket = %self.bucket, key = %key, "uploaded core file to object store");

        let presigning = PresigningConfig::expires_in(self.presign_expire)
            .map_err(|e| StoreError::Presign(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|e| StoreError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coredog_common::StorageProtocol;

    fn test_config() -> StorageConfig {
        StorageConfig {
            enabled: true,
            protocol: StorageProtocol::S3,
            s3_access_key_id: "AKIAEXAMPLE".to_string(),
            s3_secret_access_key: "secret".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_bucket: "coredumps".to_string(),
            s3_endpoint: "https://minio.internal:9000".to_string(),
            cfs_mount_path: Default::default(),
            store_dir: "dumps".to_string(),
            presigned_url_expire_seconds: 3600,
            delete_local_corefile: false,
        }
    }

    #[test]
    fn test_object_key_with_store_dir() {
        let store = S3Store::new(&test_config());
        assert_eq!(
            store.object_key(Path::new("/corefile/ns/pod/ctr/core.sh.42")),
            "dumps/core.sh.42"
        );
    }

    #[test]
    fn test_object_key_without_store_dir() {
        let mut config = test_config();
        config.store_dir = String::new();
        let store = S3Store::new(&config);
        assert_eq!(store.object_key(Path::new("/corefile/ns/pod/ctr/core.sh.42")), "core.sh.42");
    }

    #[test]
    fn test_object_key_trailing_slash_trimmed() {
        let mut config = test_config();
        config.store_dir = "dumps/".to_string();
        let store = S3Store::new(&config);
        assert_eq!(store.object_key(Path::new("/a/core.1")), "dumps/core.1");
    }
}

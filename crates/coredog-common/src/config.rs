//! Configuration for the coredog agent and webhook.
//!
//! Loaded from a YAML file (`CONFIG_PATH`, default
//! `/etc/config/coredog.yaml`) with environment variable overrides for
//! the CoreSight credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default config file location inside the agent pod.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/config/coredog.yaml";

/// Default mount root the agent watches for core files.
pub const DEFAULT_COREFILE_DIR: &str = "/corefile";

/// Default hook timeout in seconds; non-positive configured values reset
/// to this.
pub const DEFAULT_HANDLER_TIMEOUT_SECS: i64 = 300;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Blob storage settings.
    pub storage: StorageConfig,

    /// Whether local cleanup runs in gc mode.
    pub gc: bool,

    /// How gc disposes of the local file: remove or truncate.
    pub gc_type: GcType,

    /// Mount root under which core files appear.
    pub corefile_dir: PathBuf,

    /// Chat sinks for crash notifications.
    pub notice_channels: Vec<NoticeChannel>,

    /// Notification template with `{placeholder}` substitution.
    pub message_template: String,

    /// Operator-defined labels substituted into the template.
    pub message_labels: HashMap<String, String>,

    /// Telemetry (CoreSight) emission settings.
    pub coresight: CoreSightConfig,

    /// Operator-supplied hook script settings.
    pub custom_handler: CustomHandlerConfig,
}

/// Storage backend selection and credentials.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub enabled: bool,
    pub protocol: StorageProtocol,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub cfs_mount_path: PathBuf,
    pub store_dir: String,
    pub presigned_url_expire_seconds: u64,
    /// Delete (or truncate) the local core file after a successful upload.
    pub delete_local_corefile: bool,
}

/// Storage backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProtocol {
    /// S3-compatible object store.
    S3,
    /// Mounted shared filesystem.
    Cfs,
}

impl StorageProtocol {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "s3" => Some(StorageProtocol::S3),
            "cfs" => Some(StorageProtocol::Cfs),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProtocol::S3 => write!(f, "s3"),
            StorageProtocol::Cfs => write!(f, "cfs"),
        }
    }
}

/// Local-cleanup disposal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    /// Remove the file.
    Remove,
    /// Truncate the file to zero length, keeping the path.
    Truncate,
}

impl GcType {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "truncate" => GcType::Truncate,
            _ => GcType::Remove,
        }
    }
}

/// One chat notification target.
#[derive(Debug, Clone)]
pub struct NoticeChannel {
    /// Channel kind, `wechat` or `slack`; anything else is logged and
    /// skipped at dispatch time.
    pub channel: String,
    pub webhook_url: String,
    /// When non-empty, dispatch only fires for core file paths containing
    /// this keyword.
    pub keyword: String,
}

/// Telemetry bus settings.
#[derive(Debug, Clone, Default)]
pub struct CoreSightConfig {
    pub enabled: bool,
    /// HTTPS endpoint the CloudEvents envelope is POSTed to.
    pub url: String,
    /// Bearer token, duplicated in the envelope body.
    pub token: String,
}

/// Operator hook settings.
#[derive(Debug, Clone, Default)]
pub struct CustomHandlerConfig {
    pub enabled: bool,
    /// Shell fragment executed under /bin/bash per event.
    pub script: String,
    /// Hard timeout in seconds.
    pub timeout_secs: i64,
    /// Suppress the default chat notification when the hook ran.
    pub skip_default_notify: bool,
    /// Suppress telemetry emission when the hook ran.
    pub skip_coresight: bool,
}

impl Config {
    /// Load configuration from `CONFIG_PATH` (or the default path) and
    /// apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: YamlConfig = serde_yaml::from_str(content).context("failed to parse YAML config")?;
        Config::try_from(file)
    }

    /// Override CoreSight credentials from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CORESIGHT_NATS_URL") {
            if !url.is_empty() {
                self.coresight.url = url;
            }
        }
        if let Ok(token) = std::env::var("CORESIGHT_TOKEN") {
            if !token.is_empty() {
                self.coresight.token = token;
            }
        }
    }

    /// Validate settings that would otherwise only fail deep inside the
    /// pipeline. Bad storage settings abort the process at startup.
    pub fn validate(&self) -> Result<()> {
        if self.storage.enabled {
            match self.storage.protocol {
                StorageProtocol::S3 => {
                    if self.storage.s3_bucket.is_empty() {
                        bail!("StorageConfig: protocol is s3 but S3Bucket is empty");
                    }
                    // Presigning rejects zero and anything over seven days.
                    let expire = self.storage.presigned_url_expire_seconds;
                    if expire == 0 || expire > 7 * 24 * 3600 {
                        bail!(
                            "StorageConfig: PresignedURLExpireSeconds must be within 1..=604800, got {expire}"
                        );
                    }
                }
                StorageProtocol::Cfs => {
                    if self.storage.cfs_mount_path.as_os_str().is_empty() {
                        bail!("StorageConfig: protocol is cfs but CFSMountPath is empty");
                    }
                }
            }
        }
        if self.custom_handler.enabled && self.custom_handler.script.is_empty() {
            bail!("CustomHandler is enabled but script is empty");
        }
        Ok(())
    }
}

/// Host IP of the node the agent runs on, from the downward API.
pub fn host_ip() -> String {
    std::env::var("HOST_IP").unwrap_or_default().trim().to_string()
}

/// Node name, used to narrow cluster pod listings.
pub fn node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default().trim().to_string()
}

/// Cluster lookup is enabled unless `KUBE_LOOKUP` is explicitly `false`.
pub fn kube_lookup_enabled() -> bool {
    std::env::var("KUBE_LOOKUP")
        .map(|v| v.trim().to_lowercase() != "false")
        .unwrap_or(true)
}

// ============================================================================
// YAML file structure
// ============================================================================

#[derive(Debug, Deserialize, Default)]
struct YamlConfig {
    #[serde(rename = "StorageConfig", default)]
    storage: StorageYaml,
    #[serde(default)]
    gc: bool,
    #[serde(rename = "gc_type", default = "default_gc_type")]
    gc_type: String,
    #[serde(rename = "CorefileDir", default)]
    corefile_dir: String,
    #[serde(rename = "NoticeChannel", default)]
    notice_channel: Vec<NoticeChannelYaml>,
    #[serde(rename = "messageTemplate", default)]
    message_template: String,
    #[serde(rename = "messageLabels", default)]
    message_labels: HashMap<String, String>,
    #[serde(rename = "CoreSight", default)]
    coresight: CoreSightYaml,
    #[serde(rename = "CustomHandler", default)]
    custom_handler: CustomHandlerYaml,
}

fn default_gc_type() -> String {
    "rm".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StorageYaml {
    enabled: bool,
    protocol: String,
    #[serde(rename = "s3AccesskeyID")]
    s3_access_key_id: String,
    #[serde(rename = "s3SecretAccessKey")]
    s3_secret_access_key: String,
    #[serde(rename = "s3Region")]
    s3_region: String,
    #[serde(rename = "S3Bucket")]
    s3_bucket: String,
    #[serde(rename = "S3Endpoint")]
    s3_endpoint: String,
    #[serde(rename = "CFSMountPath")]
    cfs_mount_path: String,
    #[serde(rename = "StoreDir")]
    store_dir: String,
    #[serde(rename = "PresignedURLExpireSeconds")]
    presigned_url_expire_seconds: u64,
    #[serde(rename = "deleteLocalCorefile")]
    delete_local_corefile: bool,
}

impl Default for StorageYaml {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: "s3".to_string(),
            s3_access_key_id: String::new(),
            s3_secret_access_key: String::new(),
            s3_region: String::new(),
            s3_bucket: String::new(),
            s3_endpoint: String::new(),
            cfs_mount_path: String::new(),
            store_dir: String::new(),
            presigned_url_expire_seconds: 0,
            delete_local_corefile: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NoticeChannelYaml {
    chan: String,
    webhookurl: String,
    keyword: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CoreSightYaml {
    enabled: bool,
    #[serde(rename = "natsUrl")]
    nats_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CustomHandlerYaml {
    enabled: bool,
    script: String,
    timeout: i64,
    #[serde(rename = "skipDefaultNotify")]
    skip_default_notify: bool,
    #[serde(rename = "skipCoreSight")]
    skip_coresight: bool,
}

impl Default for CustomHandlerYaml {
    fn default() -> Self {
        Self {
            enabled: false,
            script: String::new(),
            timeout: DEFAULT_HANDLER_TIMEOUT_SECS,
            skip_default_notify: true,
            skip_coresight: true,
        }
    }
}

impl TryFrom<YamlConfig> for Config {
    type Error = anyhow::Error;

    fn try_from(file: YamlConfig) -> Result<Self> {
        let protocol = StorageProtocol::parse(&file.storage.protocol).with_context(|| {
            format!(
                "StorageConfig: unsupported protocol {:?} (expected s3 or cfs)",
                file.storage.protocol
            )
        })?;

        let corefile_dir = if file.corefile_dir.is_empty() {
            PathBuf::from(DEFAULT_COREFILE_DIR)
        } else {
            PathBuf::from(file.corefile_dir)
        };

        let timeout_secs = if file.custom_handler.timeout <= 0 {
            DEFAULT_HANDLER_TIMEOUT_SECS
        } else {
            file.custom_handler.timeout
        };

        Ok(Self {
            storage: StorageConfig {
                enabled: file.storage.enabled,
                protocol,
                s3_access_key_id: file.storage.s3_access_key_id,
                s3_secret_access_key: file.storage.s3_secret_access_key,
                s3_region: file.storage.s3_region,
                s3_bucket: file.storage.s3_bucket,
                s3_endpoint: file.storage.s3_endpoint,
                cfs_mount_path: PathBuf::from(file.storage.cfs_mount_path),
                store_dir: file.storage.store_dir,
                presigned_url_expire_seconds: file.storage.presigned_url_expire_seconds,
                delete_local_corefile: file.storage.delete_local_corefile,
            },
            gc: file.gc,
            gc_type: GcType::parse(&file.gc_type),
            corefile_dir,
            notice_channels: file
                .notice_channel
                .into_iter()
                .map(|c| NoticeChannel {
                    channel: c.chan,
                    webhook_url: c.webhookurl,
                    keyword: c.keyword,
                })
                .collect(),
            message_template: file.message_template,
            message_labels: file.message_labels,
            coresight: CoreSightConfig {
                enabled: file.coresight.enabled,
                url: file.coresight.nats_url,
                token: file.coresight.token,
            },
            custom_handler: CustomHandlerConfig {
                enabled: file.custom_handler.enabled,
                script: file.custom_handler.script,
                timeout_secs,
                skip_default_notify: file.custom_handler.skip_default_notify,
                skip_coresight: file.custom_handler.skip_coresight,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert!(config.storage.enabled);
        assert_eq!(config.storage.protocol, StorageProtocol::S3);
        assert!(!config.gc);
        assert_eq!(config.gc_type, GcType::Remove);
        assert_eq!(config.corefile_dir, PathBuf::from("/corefile"));
        assert!(config.notice_channels.is_empty());
        assert!(!config.coresight.enabled);
        assert!(!config.custom_handler.enabled);
        assert_eq!(config.custom_handler.timeout_secs, 300);
        assert!(config.custom_handler.skip_default_notify);
        assert!(config.custom_handler.skip_coresight);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
StorageConfig:
  enabled: true
  protocol: s3
  s3AccesskeyID: AKIAEXAMPLE
  s3SecretAccessKey: secret
  s3Region: us-east-1
  S3Bucket: coredumps
  S3Endpoint: https://minio.internal:9000
  StoreDir: dumps
  PresignedURLExpireSeconds: 3600
  deleteLocalCorefile: true
gc: true
gc_type: truncate
CorefileDir: /corefile
NoticeChannel:
  - chan: slack
    webhookurl: https://hooks.slack.com/services/T/B/X
    keyword: prod
  - chan: wechat
    webhookurl: https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=k
    keyword: ""
messageTemplate: "core dump: {corefile.filename} from {pod.name} -> {corefile.url} [{env}]"
messageLabels:
  env: production
CoreSight:
  enabled: true
  natsUrl: https://coresight.internal/events
  token: tkn
CustomHandler:
  enabled: true
  script: "echo $COREDUMP_FILE"
  timeout: 60
  skipDefaultNotify: false
  skipCoreSight: false
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.storage.s3_bucket, "coredumps");
        assert_eq!(config.storage.presigned_url_expire_seconds, 3600);
        assert!(config.storage.delete_local_corefile);
        assert!(config.gc);
        assert_eq!(config.gc_type, GcType::Truncate);
        assert_eq!(config.notice_channels.len(), 2);
        assert_eq!(config.notice_channels[0].channel, "slack");
        assert_eq!(config.notice_channels[0].keyword, "prod");
        assert_eq!(config.message_labels.get("env").unwrap(), "production");
        assert!(config.coresight.enabled);
        assert_eq!(config.coresight.url, "https://coresight.internal/events");
        assert_eq!(config.custom_handler.timeout_secs, 60);
        assert!(!config.custom_handler.skip_default_notify);
        config.validate().unwrap();
    }

    #[test]
    fn test_cfs_protocol() {
        let yaml = r#"
StorageConfig:
  protocol: cfs
  CFSMountPath: /mnt/cfs
  StoreDir: cores
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.storage.protocol, StorageProtocol::Cfs);
        assert_eq!(config.storage.cfs_mount_path, PathBuf::from("/mnt/cfs"));
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let yaml = r#"
StorageConfig:
  protocol: ftp
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_validate_s3_requires_bucket() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_handler_requires_script() {
        let yaml = r#"
StorageConfig:
  S3Bucket: b
  PresignedURLExpireSeconds: 3600
CustomHandler:
  enabled: true
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_s3_presign_bounds() {
        let yaml = r#"
StorageConfig:
  S3Bucket: b
  PresignedURLExpireSeconds: 999999999
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nonpositive_handler_timeout_resets() {
        let yaml = r#"
StorageConfig:
  S3Bucket: b
CustomHandler:
  enabled: true
  script: "true"
  timeout: -5
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.custom_handler.timeout_secs, 300);
    }

    #[test]
    fn test_gc_type_parsing() {
        assert_eq!(GcType::parse("rm"), GcType::Remove);
        assert_eq!(GcType::parse("truncate"), GcType::Truncate);
        assert_eq!(GcType::parse("anything-else"), GcType::Remove);
    }
}

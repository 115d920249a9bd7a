//! Pipeline orchestration: one iteration per settled core file.
//!
//! Steps run sequentially per event — inspect, upload, cleanup, resolve,
//! hook, notify, telemetry — which intentionally bounds the cluster-API
//! query rate. Upload is the durability point: failures before or during
//! upload drop the event with the file left on disk; everything after is
//! best-effort.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use coredog_common::{kube_lookup_enabled, Config, CoreEvent, GcType, PodIdentity};

use crate::handler::CustomHandler;
use crate::inspector::CoreInspector;
use crate::notice::Notifier;
use crate::reporter::{CoredumpUploadedData, Reporter};
use crate::resolver::PodResolver;
use crate::store::{self, Store};

/// Consumes settled paths from the watcher and drives each through the
/// capture pipeline.
pub struct Pipeline {
    config: Config,
    inspector: CoreInspector,
    store: Box<dyn Store>,
    resolver: PodResolver,
    notifier: Notifier,
    reporter: Option<Reporter>,
    handler: Option<CustomHandler>,
}

impl Pipeline {
    /// Construct every pipeline stage. Storage construction validates the
    /// backend; a bad backend aborts the process at startup.
    pub fn new(config: Config) -> Result<Self> {
        if !config.storage.enabled {
            bail!("StorageConfig.enabled is false; the agent pipeline requires a storage backend");
        }

        let store = store::new_store(&config.storage).context("failed to construct storage backend")?;

        let reporter = if config.coresight.enabled && !config.coresight.url.is_empty() {
            info!(url = %config.coresight.url, "CoreSight telemetry enabled");
            Some(Reporter::new(
                config.coresight.url.clone(),
                config.coresight.token.clone(),
            ))
        } else {
            None
        };

        let handler = if config.custom_handler.enabled {
            info!(
                timeout_secs = config.custom_handler.timeout_secs,
                skip_default_notify = config.custom_handler.skip_default_notify,
                skip_coresight = config.custom_handler.skip_coresight,
                "custom handler enabled"
            );
            Some(CustomHandler::new(
                config.custom_handler.script.clone(),
                Duration::from_secs(config.custom_handler.timeout_secs as u64),
            ))
        } else {
            None
        };

        Ok(Self {
            inspector: CoreInspector::new(),
            store,
            resolver: PodResolver::new(config.corefile_dir.clone()),
            notifier: Notifier::new(
                config.notice_channels.clone(),
                config.message_template.clone(),
                config.message_labels.clone(),
            ),
            reporter,
            handler,
            config,
        })
    }

    /// Process events until the watcher side of the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<PathBuf>) {
        while let Some(path) = events.recv().await {
            self.process(&path).await;
        }
        info!("watcher channel closed, pipeline stopped");
    }

    async fn process(&self, path: &Path) {
        // 1. Inspect. Failure to produce size, hash, or executable path
        //    skips the file entirely.
        let info = match self.inspector.parse(path).await {
            Ok(info) => info,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse core file");
                return;
            }
        };
        let event = CoreEvent {
            path: path.to_path_buf(),
            size: info.size,
            md5: info.md5,
            executable_path: info.executable_path,
            process_name: info.process_name,
            detected_at: Utc::now(),
        };

        // 2. Upload. Without a stored artifact there is nothing to report;
        //    the local file stays for later tooling.
        let url = match self.store.upload(path).await {
            Ok(url) => url,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to store core file");
                return;
            }
        };

        // 3. Local cleanup, non-fatal.
        if self.config.storage.delete_local_corefile {
            match cleanup_local(path, self.config.gc, self.config.gc_type).await {
                Ok(CleanupAction::Truncated) => info!(path = %path.display(), "truncated local core file"),
                Ok(CleanupAction::Removed) => info!(path = %path.display(), "deleted local core file"),
                Err(e) => error!(path = %path.display(), error = %e, "failed to clean up local core file"),
            }
        }

        // 4. Resolve pod attribution.
        let pod = self
            .resolver
            .resolve(path, &event.process_name, kube_lookup_enabled())
            .await;

        // 5. Hook, collecting the configured gates only when it ran.
        let mut skip_notify = false;
        let mut skip_telemetry = false;
        if let Some(handler) = &self.handler {
            if let Err(e) = handler.execute(&event, &url, &pod).await {
                error!(path = %path.display(), error = %e, "custom handler execution failed");
            }
            skip_notify = self.config.custom_handler.skip_default_notify;
            skip_telemetry = self.config.custom_handler.skip_coresight;
        }

        // 6. Chat notification.
        if !skip_notify {
            self.notifier.notify(path, &url, &pod).await;
        }

        // 7. Telemetry.
        if skip_telemetry {
            return;
        }
        self.emit_telemetry(&event, &url, &pod).await;
    }

    async fn emit_telemetry(&self, event: &CoreEvent, url: &str, pod: &PodIdentity) {
        let Some(reporter) = &self.reporter else {
            return;
        };

        if pod.legacy_path {
            warn!(
                path = %event.path.display(),
                "legacy path scheme detected; upgrade to <root>/<namespace>/<pod>/<container>/<corefile>. Skipping telemetry."
            );
            return;
        }

        let validation_errors = telemetry_validation_errors(event, pod);
        if !validation_errors.is_empty() {
            error!(
                path = %event.path.display(),
                missing = ?validation_errors,
                "skipping telemetry due to missing fields"
            );
            return;
        }

        let data = CoredumpUploadedData {
            file_url: url.to_string(),
            file_name: event.file_name(),
            executable_path: event.executable_path.clone(),
            file_size: event.size,
            md5: event.md5.clone(),
            image: pod.image.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            pod_name: pod.pod_name.clone(),
            pod_namespace: pod.namespace.clone(),
            node_ip: pod.node_ip.clone(),
        };

        if let Err(e) = reporter.report_coredump_uploaded(&data).await {
            error!(path = %event.path.display(), error = %e, "failed to report coredump telemetry");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CleanupAction {
    Removed,
    Truncated,
}

/// Dispose of the local file after a successful upload: truncate keeps
/// the path so the kernel's next dump reuses it; remove frees the name.
async fn cleanup_local(path: &Path, gc: bool, gc_type: GcType) -> std::io::Result<CleanupAction> {
    if gc && gc_type == GcType::Truncate {
        tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(CleanupAction::Truncated)
    } else {
        tokio::fs::remove_file(path).await?;
        Ok(CleanupAction::Removed)
    }
}

/// Fields that must be populated before a telemetry event may be emitted.
fn telemetry_validation_errors(event: &CoreEvent, pod: &PodIdentity) -> Vec<&'static str> {
    let mut errors = Vec::new();
    if event.executable_path.is_empty() {
        errors.push("executable_path is empty");
    }
    if event.md5.is_empty() {
        errors.push("md5 is empty");
    }
    if pod.pod_name.is_empty() {
        errors.push("pod_name is empty");
    }
    if pod.has_synthesized_name() {
        errors.push("pod_name is synthesized from admission-uid (pod not found)");
    }
    if pod.namespace.is_empty() {
        errors.push("pod_namespace is empty");
    }
    if pod.image.is_empty() {
        errors.push("image is empty");
    }
    if pod.node_ip.is_empty() {
        errors.push("node_ip is empty");
    }
    errors
}

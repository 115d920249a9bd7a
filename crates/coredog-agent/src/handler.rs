//! Operator-supplied hook execution.
//!
//! The configured shell fragment is written to a uniquely named temporary
//! file (mode 0755) and run under `/bin/bash` with the event metadata in
//! the environment. Every variable is always set, possibly empty, so
//! scripts can probe with `-z`. A hard timeout terminates the child.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use coredog_common::{host_ip, CoreEvent, PodIdentity};

/// Errors from one hook execution. All of them are logged by the caller
/// and never abort the pipeline.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("custom handler script is empty")]
    EmptyScript,

    #[error("failed to write script file: {0}")]
    WriteScript(#[source] std::io::Error),

    #[error("failed to run script: {0}")]
    Run(#[source] std::io::Error),

    #[error("script execution timed out after {0:?}")]
    TimedOut(Duration),

    #[error("script exited with {status}: {output}")]
    Failed { status: String, output: String },
}

/// Runs the operator hook for each processed core dump.
pub struct CustomHandler {
    script: String,
    timeout: Duration,
}

impl CustomHandler {
    pub fn new(script: String, timeout: Duration) -> Self {
        Self { script, timeout }
    }

    /// Execute the hook with the event's metadata as environment.
    pub async fn execute(
        &self,
        event: &CoreEvent,
        url: &str,
        pod: &PodIdentity,
    ) -> Result<(), HandlerError> {
        if self.script.is_empty() {
            return Err(HandlerError::EmptyScript);
        }

        let script_file = tempfile::Builder::new()
            .prefix("coredog-handler-")
            .suffix(".sh")
            .tempfile()
            .map_err(HandlerError::WriteScript)?;
        std::fs::write(script_file.path(), &self.script).map_err(HandlerError::WriteScript)?;
        std::fs::set_permissions(script_file.path(), std::fs::Permissions::from_mode(0o755))
            .map_err(HandlerError::WriteScript)?;

        let result = self.run_script(script_file.path(), event, url, pod).await;
        // The temporary script file is removed when `script_file` drops.
        result
    }

    async fn run_script(
        &self,
        script_path: &Path,
        event: &CoreEvent,
        url: &str,
        pod: &PodIdentity,
    ) -> Result<(), HandlerError> {
        let mut command = tokio::process::Command::new("/bin/bash");
        command
            .arg(script_path)
            .env("COREDUMP_FILE", &event.path)
            .env("COREDUMP_URL", url)
            .env("COREDUMP_FILENAME", event.file_name())
            .env("COREDUMP_MD5", &event.md5)
            .env("COREDUMP_SIZE", event.size.to_string())
            .env("COREDUMP_EXECUTABLE", &event.executable_path)
            .env("POD_NAME", &pod.pod_name)
            .env("POD_NAMESPACE", &pod.namespace)
            .env("POD_UID", &pod.pod_uid)
            .env("POD_NODE_IP", &pod.node_ip)
            .env("POD_IMAGE", &pod.image)
            .env("POD_CONTAINER", &pod.container_name)
            .env("HOST_IP", host_ip())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.map_err(HandlerError::Run)?,
            Err(_) => {
                error!(timeout = ?self.timeout, "custom handler script timed out");
                return Err(HandlerError::TimedOut(self.timeout));
            }
        };

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(HandlerError::Failed {
                status: output.status.to_string(),
                output: combined,
            });
        }

        info!(
            output = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "custom handler script executed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn sample_event() -> CoreEvent {
        CoreEvent {
            path: PathBuf::from("/corefile/ns-a/web/app/core.sh.42"),
            size: 4096,
            md5: "5eb63bbbe01eeed093cb22bb8f5acdc3".to_string(),
            executable_path: "/bin/sh".to_string(),
            process_name: "sh".to_string(),
            detected_at: Utc::now(),
        }
    }

    fn sample_pod() -> PodIdentity {
        PodIdentity {
            namespace: "ns-a".to_string(),
            pod_name: "web-7f9c".to_string(),
            pod_uid: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            container_name: "app".to_string(),
            node_ip: "10.0.0.7".to_string(),
            image: "alpine:3".to_string(),
            legacy_path: false,
        }
    }

    #[tokio::test]
    async fn test_environment_contract() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.out");
        let script = format!(
            "echo -n \"$COREDUMP_FILE|$COREDUMP_FILENAME|$COREDUMP_SIZE|$POD_NAME|$POD_NAMESPACE|$POD_CONTAINER\" > {}",
            out.display()
        );

        let handler = CustomHandler::new(script, Duration::from_secs(10));
        handler
            .execute(&sample_event(), "https://store/core.sh.42", &sample_pod())
            .await
            .unwrap();

        let captured = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            captured,
            "/corefile/ns-a/web/app/core.sh.42|core.sh.42|4096|web-7f9c|ns-a|app"
        );
    }

    #[tokio::test]
    async fn test_timeout_terminates_script() {
        let handler = CustomHandler::new("sleep 30".to_string(), Duration::from_secs(1));
        let start = std::time::Instant::now();
        let err = handler
            .execute(&sample_event(), "", &sample_pod())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::TimedOut(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let handler = CustomHandler::new("echo boom >&2; exit 3".to_string(), Duration::from_secs(10));
        let err = handler
            .execute(&sample_event(), "", &sample_pod())
            .await
            .unwrap_err();
        match err {
            HandlerError::Failed { output, .. } => assert!(output.contains("boom")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_script_rejected() {
        let handler = CustomHandler::new(String::new(), Duration::from_secs(10));
        let err = handler
            .execute(&sample_event(), "", &sample_pod())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::EmptyScript));
    }
}

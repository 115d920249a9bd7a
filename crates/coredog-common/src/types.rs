//! Domain types that travel through the crash-capture pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// One detected core dump, produced by the inspector after the watcher
/// declares a file settled. Consumed by exactly one pipeline iteration.
#[derive(Debug, Clone)]
pub struct CoreEvent {
    /// Absolute host-side path of the core file.
    pub path: PathBuf,
    /// Final settled size in bytes.
    pub size: u64,
    /// Lowercase hex MD5 of the file bytes.
    pub md5: String,
    /// Best-effort absolute path of the crashed executable.
    pub executable_path: String,
    /// Basename of `executable_path`.
    pub process_name: String,
    /// When quiescence was declared.
    pub detected_at: DateTime<Utc>,
}

impl CoreEvent {
    /// Final path component of the core file.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Attribution of a core file back to the pod that produced it.
///
/// Fields that could not be recovered stay empty. `legacy_path` marks
/// events that arrived via the deprecated `<ns>/<admission-uid>` path
/// scheme; those are excluded from telemetry emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodIdentity {
    pub namespace: String,
    pub pod_name: String,
    pub pod_uid: String,
    pub container_name: String,
    pub node_ip: String,
    pub image: String,
    pub legacy_path: bool,
}

impl PodIdentity {
    /// Human-readable pod name for chat messages.
    ///
    /// Falls back to `pod-<first 8 of uid>...` when only a UID is known,
    /// and to `unknown` when neither is.
    pub fn display_name(&self) -> String {
        if !self.pod_name.is_empty() {
            return self.pod_name.clone();
        }
        if !self.pod_uid.is_empty() {
            let prefix: String = self.pod_uid.chars().take(8).collect();
            return format!("pod-{prefix}...");
        }
        "unknown".to_string()
    }

    /// True when the pod name was synthesized from an admission-UID prefix
    /// at injection time (`pod-` + 8 hex chars), meaning resolution never
    /// found the real pod.
    pub fn has_synthesized_name(&self) -> bool {
        self.pod_name.starts_with("pod-") && self.pod_name.len() == 12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_event_file_name() {
        let event = CoreEvent {
            path: PathBuf::from("/corefile/ns-a/pod-b/ctr-c/core.sh.42"),
            size: 4096,
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            executable_path: "/bin/sh".to_string(),
            process_name: "sh".to_string(),
            detected_at: Utc::now(),
        };
        assert_eq!(event.file_name(), "core.sh.42");
    }

    #[test]
    fn test_display_name_prefers_pod_name() {
        let pod = PodIdentity {
            pod_name: "web-7f9c".to_string(),
            pod_uid: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            ..Default::default()
        };
        assert_eq!(pod.display_name(), "web-7f9c");
    }

    #[test]
    fn test_display_name_falls_back_to_uid_prefix() {
        let pod = PodIdentity {
            pod_uid: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            ..Default::default()
        };
        assert_eq!(pod.display_name(), "pod-550e8400...");
    }

    #[test]
    fn test_display_name_unknown_when_empty() {
        assert_eq!(PodIdentity::default().display_name(), "unknown");
    }

    #[test]
    fn test_display_name_short_uid() {
        let pod = PodIdentity {
            pod_uid: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(pod.display_name(), "pod-abc...");
    }

    #[test]
    fn test_synthesized_name_detection() {
        let synthesized = PodIdentity {
            pod_name: "pod-550e8400".to_string(),
            ..Default::default()
        };
        assert!(synthesized.has_synthesized_name());

        let real = PodIdentity {
            pod_name: "pod-550e8400-abc".to_string(),
            ..Default::default()
        };
        assert!(!real.has_synthesized_name());

        let unrelated = PodIdentity {
            pod_name: "web-7f9c".to_string(),
            ..Default::default()
        };
        assert!(!unrelated.has_synthesized_name());
    }
}

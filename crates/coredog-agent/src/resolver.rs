//! Pod attribution from host-side core-file paths.
//!
//! Two path schemes bind the admission mutator to this agent:
//!
//! - current: `<root>/<namespace>/<podName>/<containerName>/<corefile>` —
//!   attribution survives without any cluster lookup; the API only
//!   enriches UID, node IP, and image.
//! - legacy: `<root>/<namespace>/<admission-uid>/<corefile>` — the pod is
//!   recovered by listing the namespace (narrowed to this node) and
//!   matching the `coredog.io/admission-uid` annotation. Events from this
//!   scheme are marked and excluded from telemetry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::{debug, info, warn};
use uuid::Uuid;

use coredog_common::{node_name, PodIdentity};

/// Annotation the mutator stamps on injected pods.
pub const ADMISSION_UID_ANNOTATION: &str = "coredog.io/admission-uid";

/// How long a successful annotation→podName resolution stays cached.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Deadline for a single cluster API call.
const API_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for the whole enrichment of one event.
const ENRICH_TIMEOUT: Duration = Duration::from_secs(10);

/// What the path alone encodes about an event's origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathScheme {
    Current {
        namespace: String,
        pod_name: String,
        container_name: String,
    },
    Legacy {
        namespace: String,
        admission_uid: String,
    },
    Unrecognized,
}

/// Classify a core-file path relative to the watch root.
pub fn parse_path_scheme(root: &Path, corefile_path: &Path) -> PathScheme {
    let rel = match corefile_path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return PathScheme::Unrecognized,
    };
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    match parts.as_slice() {
        [namespace, pod_name, container_name, _corefile] => PathScheme::Current {
            namespace: namespace.clone(),
            pod_name: pod_name.clone(),
            container_name: container_name.clone(),
        },
        [namespace, admission_uid, _corefile] if is_admission_uid(admission_uid) => {
            PathScheme::Legacy {
                namespace: namespace.clone(),
                admission_uid: admission_uid.clone(),
            }
        }
        _ => PathScheme::Unrecognized,
    }
}

fn is_admission_uid(s: &str) -> bool {
    s.len() == 36 && Uuid::parse_str(s).is_ok()
}

struct CacheEntry {
    pod_name: String,
    expires_at: Instant,
}

/// Resolves pod identity for core-file paths, with a TTL cache damping
/// repeated annotation lookups for crash bursts from one pod.
pub struct PodResolver {
    root: PathBuf,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl PodResolver {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve whatever attribution the path and (optionally) the cluster
    /// API yield. Never fails; unrecoverable attributes stay empty and
    /// the orchestrator's validation gate decides what that means.
    pub async fn resolve(
        &self,
        corefile_path: &Path,
        process_name: &str,
        enable_lookup: bool,
    ) -> PodIdentity {
        match parse_path_scheme(&self.root, corefile_path) {
            PathScheme::Current {
                namespace,
                pod_name,
                container_name,
            } => {
                let mut pod = PodIdentity {
                    namespace,
                    pod_name,
                    container_name,
                    ..Default::default()
                };
                if enable_lookup {
                    if tokio::time::timeout(ENRICH_TIMEOUT, self.enrich_current(&mut pod))
                        .await
                        .is_err()
                    {
                        warn!(path = %corefile_path.display(), "pod enrichment timed out");
                    }
                }
                pod
            }
            PathScheme::Legacy {
                namespace,
                admission_uid,
            } => {
                // Keep the admission UID as the best-effort identifier; a
                // successful lookup replaces it with the real pod UID.
                let mut pod = PodIdentity {
                    namespace,
                    pod_uid: admission_uid.clone(),
                    legacy_path: true,
                    ..Default::default()
                };
                if enable_lookup {
                    if tokio::time::timeout(
                        ENRICH_TIMEOUT,
                        self.enrich_legacy(&mut pod, &admission_uid, process_name),
                    )
                    .await
                    .is_err()
                    {
                        warn!(path = %corefile_path.display(), "legacy pod enrichment timed out");
                    }
                }
                pod
            }
            PathScheme::Unrecognized => {
                warn!(path = %corefile_path.display(), "core file path matches no known scheme");
                PodIdentity::default()
            }
        }
    }

    /// Fetch the pod named in the path and fill in UID, node IP, and the
    /// image of the container the path names.
    async fn enrich_current(&self, pod: &mut PodIdentity) {
        let Some(client) = cluster_client().await else {
            return;
        };
        let api: Api<Pod> = Api::namespaced(client, &pod.namespace);

        let fetched = match tokio::time::timeout(API_CALL_TIMEOUT, api.get(&pod.pod_name)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(namespace = %pod.namespace, pod = %pod.pod_name, error = %e, "failed to get pod");
                return;
            }
            Err(_) => {
                warn!(namespace = %pod.namespace, pod = %pod.pod_name, "pod get timed out");
                return;
            }
        };

        apply_pod_metadata(pod, &fetched);
        if let Some(spec) = &fetched.spec {
            pod.image = image_for_container(spec, &pod.container_name);
        }
        info!(namespace = %pod.namespace, pod = %pod.pod_name, uid = %pod.pod_uid, "resolved pod from path scheme");
    }

    /// Recover the pod behind an admission UID via the annotation
    /// back-reference, then enrich from the pod object.
    async fn enrich_legacy(&self, pod: &mut PodIdentity, admission_uid: &str, process_name: &str) {
        let Some(client) = cluster_client().await else {
            return;
        };
        let api: Api<Pod> = Api::namespaced(client, &pod.namespace);

        let cache_key = format!("{}/{}", pod.namespace, admission_uid);
        let fetched = match self.cached_pod_name(&cache_key) {
            Some(name) => {
                debug!(namespace = %pod.namespace, pod = %name, "annotation resolution cache hit");
                match tokio::time::timeout(API_CALL_TIMEOUT, api.get(&name)).await {
                    Ok(Ok(fetched)) => Some(fetched),
                    Ok(Err(e)) => {
                        warn!(namespace = %pod.namespace, pod = %name, error = %e, "failed to get cached pod");
                        None
                    }
                    Err(_) => None,
                }
            }
            None => self.find_by_annotation(&api, &pod.namespace, admission_uid).await,
        };

        let Some(fetched) = fetched else {
            warn!(
                namespace = %pod.namespace,
                admission_uid,
                "no pod carries the admission-uid annotation (pod may have been deleted)"
            );
            return;
        };

        if let Some(name) = &fetched.metadata.name {
            pod.pod_name = name.clone();
            self.cache_pod_name(cache_key, name.clone());
        }
        apply_pod_metadata(pod, &fetched);
        if let Some(spec) = &fetched.spec {
            if let Some(matched) = spec.containers.iter().find(|c| c.name == process_name) {
                pod.container_name = matched.name.clone();
                pod.image = matched.image.clone().unwrap_or_default();
            } else {
                pod.image = heuristic_image(&spec.containers, process_name);
            }
        }
        info!(
            namespace = %pod.namespace,
            pod = %pod.pod_name,
            admission_uid,
            "resolved pod from admission-uid annotation"
        );
    }

    /// List pods on this node and match the admission-uid annotation.
    async fn find_by_annotation(
        &self,
        api: &Api<Pod>,
        namespace: &str,
        admission_uid: &str,
    ) -> Option<Pod> {
        let mut params = ListParams::default();
        let node = node_name();
        if !node.is_empty() {
            params = params.fields(&format!("spec.nodeName={node}"));
        }

        let list = match tokio::time::timeout(API_CALL_TIMEOUT, api.list(&params)).await {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                warn!(namespace, error = %e, "failed to list pods");
                return None;
            }
            Err(_) => {
                warn!(namespace, "pod list timed out");
                return None;
            }
        };

        list.items.into_iter().find(|p| {
            p.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ADMISSION_UID_ANNOTATION))
                .map(|v| v == admission_uid)
                .unwrap_or(false)
        })
    }

    fn cached_pod_name(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().ok()?;
        cache
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.pod_name.clone())
    }

    fn cache_pod_name(&self, key: String, pod_name: String) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                key,
                CacheEntry {
                    pod_name,
                    expires_at: Instant::now() + CACHE_TTL,
                },
            );
        }
    }
}

/// In-cluster client; resolution degrades to path-only attribution when
/// the cluster is unreachable.
async fn cluster_client() -> Option<Client> {
    match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "failed to create cluster client");
            None
        }
    }
}

fn apply_pod_metadata(pod: &mut PodIdentity, fetched: &Pod) {
    if let Some(uid) = &fetched.metadata.uid {
        pod.pod_uid = uid.clone();
    }
    if let Some(host_ip) = fetched.status.as_ref().and_then(|s| s.host_ip.clone()) {
        pod.node_ip = host_ip;
    }
}

/// Image of the container the current path scheme names, searched across
/// both containers and initContainers.
fn image_for_container(spec: &PodSpec, container_name: &str) -> String {
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .find(|c| c.name == container_name)
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

/// Strip registry and tag: `registry.local/team/openjdk:17` → `openjdk`.
fn image_base(image: &str) -> &str {
    let name = image.rsplit('/').next().unwrap_or(image);
    name.split(':').next().unwrap_or(name)
}

/// Well-known runtime families for executable→image guessing.
fn runtime_keywords(process_name: &str) -> Option<&'static [&'static str]> {
    if process_name == "java" {
        Some(&["java", "openjdk", "jre"])
    } else if process_name.starts_with("python") {
        Some(&["python"])
    } else if process_name == "node" || process_name == "nodejs" {
        Some(&["node"])
    } else if process_name == "go" || process_name == "golang" {
        Some(&["golang"])
    } else {
        None
    }
}

/// Best-effort executable→image mapping for legacy-scheme events, where
/// the path does not name a container. Clearly a fallback: exact name
/// match, then substring match, then runtime family, then the first
/// container's image.
fn heuristic_image(containers: &[Container], process_name: &str) -> String {
    if !process_name.is_empty() {
        if let Some(c) = containers.iter().find(|c| c.name == process_name) {
            return c.image.clone().unwrap_or_default();
        }

        for c in containers {
            let image = c.image.as_deref().unwrap_or_default();
            let base = image_base(image);
            if !base.is_empty() && (base.contains(process_name) || process_name.contains(base)) {
                return image.to_string();
            }
        }

        if let Some(keywords) = runtime_keywords(process_name) {
            for c in containers {
                let image = c.image.as_deref().unwrap_or_default();
                if keywords.iter().any(|k| image.contains(k)) {
                    return image.to_string();
                }
            }
        }
    }

    containers
        .first()
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_current_scheme() {
        let scheme = parse_path_scheme(
            Path::new("/corefile"),
            Path::new("/corefile/ns-a/pod-b/ctr-c/core.sh.42.h.1700"),
        );
        assert_eq!(
            scheme,
            PathScheme::Current {
                namespace: "ns-a".to_string(),
                pod_name: "pod-b".to_string(),
                container_name: "ctr-c".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_legacy_scheme() {
        let scheme = parse_path_scheme(
            Path::new("/corefile"),
            Path::new("/corefile/ns-x/550e8400-e29b-41d4-a716-446655440000/core.java.1"),
        );
        assert_eq!(
            scheme,
            PathScheme::Legacy {
                namespace: "ns-x".to_string(),
                admission_uid: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_three_parts_without_uid_unrecognized() {
        let scheme = parse_path_scheme(
            Path::new("/corefile"),
            Path::new("/corefile/ns-x/not-a-uuid/core.1"),
        );
        assert_eq!(scheme, PathScheme::Unrecognized);
    }

    #[test]
    fn test_parse_outside_root_unrecognized() {
        let scheme = parse_path_scheme(Path::new("/corefile"), Path::new("/tmp/ns/pod/ctr/core.1"));
        assert_eq!(scheme, PathScheme::Unrecognized);
    }

    #[test]
    fn test_parse_wrong_depth_unrecognized() {
        assert_eq!(
            parse_path_scheme(Path::new("/corefile"), Path::new("/corefile/ns/core.1")),
            PathScheme::Unrecognized
        );
        assert_eq!(
            parse_path_scheme(
                Path::new("/corefile"),
                Path::new("/corefile/ns/pod/ctr/extra/core.1")
            ),
            PathScheme::Unrecognized
        );
    }

    #[test]
    fn test_is_admission_uid() {
        assert!(is_admission_uid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_admission_uid("550e8400"));
        assert!(!is_admission_uid("zzze8400-e29b-41d4-a716-44665544zzzz"));
    }

    #[test]
    fn test_image_base() {
        assert_eq!(image_base("alpine:3"), "alpine");
        assert_eq!(image_base("registry.local/team/openjdk:17"), "openjdk");
        assert_eq!(image_base("nginx"), "nginx");
    }

    #[test]
    fn test_image_for_container_searches_init_containers() {
        let spec = PodSpec {
            containers: vec![container("app", "alpine:3")],
            init_containers: Some(vec![container("setup", "busybox:1")]),
            ..Default::default()
        };
        assert_eq!(image_for_container(&spec, "app"), "alpine:3");
        assert_eq!(image_for_container(&spec, "setup"), "busybox:1");
        assert_eq!(image_for_container(&spec, "missing"), "");
    }

    #[test]
    fn test_heuristic_exact_container_name() {
        let containers = vec![container("sidecar", "envoy:1"), container("myapp", "registry/myapp:2")];
        assert_eq!(heuristic_image(&containers, "myapp"), "registry/myapp:2");
    }

    #[test]
    fn test_heuristic_image_substring() {
        let containers = vec![container("main", "registry.local/team/myservice:1.2")];
        assert_eq!(heuristic_image(&containers, "myservice"), "registry.local/team/myservice:1.2");
    }

    #[test]
    fn test_heuristic_runtime_family() {
        let containers = vec![
            container("sidecar", "envoy:1"),
            container("app", "registry/openjdk:17"),
        ];
        assert_eq!(heuristic_image(&containers, "java"), "registry/openjdk:17");

        let containers = vec![container("worker", "python3.11-slim:latest")];
        assert_eq!(heuristic_image(&containers, "python3"), "python3.11-slim:latest");
    }

    #[test]
    fn test_heuristic_falls_back_to_first_container() {
        let containers = vec![container("a", "first:1"), container("b", "second:2")];
        assert_eq!(heuristic_image(&containers, "mystery-binary"), "first:1");
        assert_eq!(heuristic_image(&[], "mystery-binary"), "");
    }

    #[test]
    fn test_cache_expiry_is_a_miss() {
        let resolver = PodResolver::new(PathBuf::from("/corefile"));
        resolver.cache_pod_name("ns/uid-1".to_string(), "pod-one".to_string());
        assert_eq!(resolver.cached_pod_name("ns/uid-1"), Some("pod-one".to_string()));

        if let Ok(mut cache) = resolver.cache.write() {
            cache.insert(
                "ns/uid-2".to_string(),
                CacheEntry {
                    pod_name: "pod-two".to_string(),
                    expires_at: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        assert_eq!(resolver.cached_pod_name("ns/uid-2"), None);
        assert_eq!(resolver.cached_pod_name("ns/never-inserted"), None);
    }

    #[tokio::test]
    async fn test_resolve_without_lookup_keeps_path_attribution() {
        let resolver = PodResolver::new(PathBuf::from("/corefile"));

        let pod = resolver
            .resolve(Path::new("/corefile/ns-a/pod-b/ctr-c/core.1"), "sh", false)
            .await;
        assert_eq!(pod.namespace, "ns-a");
        assert_eq!(pod.pod_name, "pod-b");
        assert_eq!(pod.container_name, "ctr-c");
        assert!(pod.pod_uid.is_empty());
        assert!(!pod.legacy_path);

        let legacy = resolver
            .resolve(
                Path::new("/corefile/ns-x/550e8400-e29b-41d4-a716-446655440000/core.java.1"),
                "java",
                false,
            )
            .await;
        assert_eq!(legacy.namespace, "ns-x");
        assert!(legacy.pod_name.is_empty());
        assert_eq!(legacy.pod_uid, "550e8400-e29b-41d4-a716-446655440000");
        assert!(legacy.legacy_path);
    }
}

//! Admission mutation: JSON-Patch synthesis for core-dump collection.
//!
//! Pods opting in via `coredog.io/inject: "true"` get one hostPath volume
//! per targeted container, rooted at
//! `<pathBase>/<namespace>/<podName>/<containerName>` and mounted at the
//! pod's `coredog.io/path`. The pod is annotated with the admission
//! request UID so the legacy path scheme can be resolved back to it.
//! Injection never blocks pod creation; anything unexpected admits the
//! pod unchanged.

use k8s_openapi::api::core::v1::{HostPathVolumeSource, Pod, Volume, VolumeMount};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tracing::{error, info};

/// Opt-in annotation; must be exactly `"true"`.
pub const INJECT_ANNOTATION: &str = "coredog.io/inject";

/// Optional csv of container names to target; default is every container.
pub const CONTAINER_ANNOTATION: &str = "coredog.io/container";

/// Mandatory in-pod mount path for the core-dump volume.
pub const PATH_ANNOTATION: &str = "coredog.io/path";

/// Written back onto the pod for annotation-based resolution.
pub const ADMISSION_UID_ANNOTATION: &str = "coredog.io/admission-uid";

/// Written back onto the pod recording which containers were injected.
pub const TARGET_CONTAINERS_ANNOTATION: &str = "coredog.io/target-containers";

/// Host-side root under which per-pod dump directories materialize.
pub const PATH_BASE: &str = "/data/coredog-system/dumps";

/// Volume name prefix; the container name is appended.
const VOLUME_NAME_PREFIX: &str = "coredog-corefile";

/// Mount paths that must never be shadowed by the injected volume.
const BLACKLISTED_MOUNT_PATHS: [&str; 9] = [
    "/", "/etc", "/usr", "/bin", "/sbin", "/var", "/root", "/home", "/boot",
];

/// Handle one AdmissionReview, producing the response review.
///
/// `Err` carries the reason when the review itself is unusable (e.g. no
/// request); the caller must still admit the pod unchanged — injection
/// never blocks pod creation.
pub fn mutate_review(
    review: AdmissionReview<Pod>,
) -> Result<AdmissionReview<DynamicObject>, String> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "unusable admission review");
            return Err(e.to_string());
        }
    };

    let response = AdmissionResponse::from(&req);
    let Some(pod) = &req.object else {
        return Ok(response.into_review());
    };

    let namespace = req
        .namespace
        .clone()
        .or_else(|| pod.metadata.namespace.clone())
        .unwrap_or_default();

    let mount_path = match injection_mount_path(pod) {
        Ok(path) => path,
        Err(reason) => {
            info!(namespace = %namespace, pod = ?pod.metadata.name, reason, "skipping injection");
            return Ok(response.into_review());
        }
    };

    let ops = build_patch_ops(pod, &namespace, &req.uid, &mount_path);
    if ops.is_empty() {
        return Ok(response.into_review());
    }

    let patch: json_patch::Patch = match serde_json::from_value(Value::Array(ops)) {
        Ok(patch) => patch,
        Err(e) => {
            error!(error = %e, "failed to assemble JSON patch");
            return Ok(response.into_review());
        }
    };

    info!(
        namespace = %namespace,
        pod = ?pod.metadata.name,
        admission_uid = %req.uid,
        "injecting core-dump volume"
    );

    match response.with_patch(patch) {
        Ok(patched) => Ok(patched.into_review()),
        Err(e) => {
            error!(error = %e, "failed to attach patch to admission response");
            Ok(AdmissionResponse::from(&req).into_review())
        }
    }
}

/// Decide whether to inject, returning the validated mount path or the
/// reason for skipping.
fn injection_mount_path(pod: &Pod) -> Result<String, &'static str> {
    let Some(annotations) = &pod.metadata.annotations else {
        return Err("no annotations");
    };

    match annotations.get(INJECT_ANNOTATION) {
        None => return Err("annotation coredog.io/inject not found"),
        Some(v) if v != "true" => return Err("annotation coredog.io/inject is not 'true'"),
        Some(_) => {}
    }

    let path = annotations
        .get(PATH_ANNOTATION)
        .map(|p| p.trim())
        .unwrap_or_default();
    if path.is_empty() {
        return Err("annotation coredog.io/path is required but not set");
    }
    if is_blacklisted_mount_path(path) {
        return Err("annotation coredog.io/path points at a protected system path");
    }

    Ok(path.to_string())
}

fn is_blacklisted_mount_path(path: &str) -> bool {
    BLACKLISTED_MOUNT_PATHS
        .iter()
        .any(|dangerous| path == *dangerous || path.starts_with(&format!("{dangerous}/")))
}

/// Containers to inject: the annotation csv when present, otherwise every
/// container and initContainer.
fn target_containers(pod: &Pod) -> Vec<String> {
    if let Some(csv) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONTAINER_ANNOTATION))
    {
        if !csv.is_empty() {
            return csv
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };
    spec.containers
        .iter()
        .map(|c| c.name.clone())
        .chain(spec.init_containers.iter().flatten().map(|c| c.name.clone()))
        .collect()
}

/// Build the JSON-Patch operation list for one pod.
fn build_patch_ops(pod: &Pod, namespace: &str, admission_uid: &str, mount_path: &str) -> Vec<Value> {
    let targets = target_containers(pod);
    if targets.is_empty() {
        return Vec::new();
    }

    // The path must stay resolvable even before the pod has a name.
    let pod_name = pod
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| {
            let prefix: String = admission_uid.chars().take(8).collect();
            format!("pod-{prefix}")
        });
    let base_path = format!("{PATH_BASE}/{namespace}/{pod_name}");

    let mut ops = vec![
        json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_pointer(ADMISSION_UID_ANNOTATION)),
            "value": admission_uid,
        }),
        json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_pointer(TARGET_CONTAINERS_ANNOTATION)),
            "value": targets.join(","),
        }),
    ];

    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };
    let existing_volumes: Vec<&str> = spec
        .volumes
        .iter()
        .flatten()
        .map(|v| v.name.as_str())
        .collect();
    let mut volumes_list_empty = existing_volumes.is_empty();

    for container_name in &targets {
        let volume_name = format!("{VOLUME_NAME_PREFIX}-{container_name}");
        if existing_volumes.contains(&volume_name.as_str()) {
            continue;
        }

        let volume = Volume {
            name: volume_name,
            host_path: Some(HostPathVolumeSource {
                path: format!("{base_path}/{container_name}"),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        };
        let volume_value = serde_json::to_value(&volume).unwrap_or(Value::Null);

        if volumes_list_empty {
            ops.push(json!({"op": "add", "path": "/spec/volumes", "value": [volume_value]}));
            volumes_list_empty = false;
        } else {
            ops.push(json!({"op": "add", "path": "/spec/volumes/-", "value": volume_value}));
        }
    }

    append_mount_ops(&mut ops, &spec.containers, &targets, "containers", mount_path);
    if let Some(init_containers) = &spec.init_containers {
        append_mount_ops(&mut ops, init_containers, &targets, "initContainers", mount_path);
    }

    ops
}

fn append_mount_ops(
    ops: &mut Vec<Value>,
    containers: &[k8s_openapi::api::core::v1::Container],
    targets: &[String],
    field: &str,
    mount_path: &str,
) {
    for (i, container) in containers.iter().enumerate() {
        if !targets.contains(&container.name) {
            continue;
        }

        let volume_name = format!("{VOLUME_NAME_PREFIX}-{}", container.name);
        let already_mounted = container
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| m.name == volume_name);
        if already_mounted {
            continue;
        }

        let mount = VolumeMount {
            name: volume_name,
            mount_path: mount_path.to_string(),
            ..Default::default()
        };
        let mount_value = serde_json::to_value(&mount).unwrap_or(Value::Null);

        if container.volume_mounts.as_ref().map(|m| m.is_empty()).unwrap_or(true) {
            ops.push(json!({
                "op": "add",
                "path": format!("/spec/{field}/{i}/volumeMounts"),
                "value": [mount_value],
            }));
        } else {
            ops.push(json!({
                "op": "add",
                "path": format!("/spec/{field}/{i}/volumeMounts/-"),
                "value": mount_value,
            }));
        }
    }
}

/// JSON Pointer escaping for annotation keys containing `/`.
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pod_from_json(value: Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    fn injectable_pod() -> Pod {
        pod_from_json(json!({
            "metadata": {
                "name": "web-7f9c",
                "namespace": "ns-a",
                "annotations": {
                    "coredog.io/inject": "true",
                    "coredog.io/path": "/corefile"
                }
            },
            "spec": {
                "containers": [
                    {"name": "app", "image": "alpine:3"},
                    {"name": "sidecar", "image": "envoy:1"}
                ]
            }
        }))
    }

    #[test]
    fn test_injection_requires_annotations() {
        let pod = pod_from_json(json!({"metadata": {"name": "p"}, "spec": {"containers": []}}));
        assert_eq!(injection_mount_path(&pod), Err("no annotations"));
    }

    #[test]
    fn test_injection_requires_inject_true() {
        let mut pod = injectable_pod();
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(INJECT_ANNOTATION.to_string(), "false".to_string());
        assert!(injection_mount_path(&pod).is_err());
    }

    #[test]
    fn test_injection_requires_path() {
        let mut pod = injectable_pod();
        pod.metadata.annotations.as_mut().unwrap().remove(PATH_ANNOTATION);
        assert!(injection_mount_path(&pod).is_err());
    }

    #[test]
    fn test_injection_rejects_protected_paths() {
        for path in ["/", "/etc", "/etc/ssl", "/usr", "/var/log", "/home/user"] {
            let mut pod = injectable_pod();
            pod.metadata
                .annotations
                .as_mut()
                .unwrap()
                .insert(PATH_ANNOTATION.to_string(), path.to_string());
            assert!(injection_mount_path(&pod).is_err(), "path {path} should be rejected");
        }

        let mut pod = injectable_pod();
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(PATH_ANNOTATION.to_string(), "/data/cores".to_string());
        assert_eq!(injection_mount_path(&pod).unwrap(), "/data/cores");
    }

    #[test]
    fn test_target_containers_default_all() {
        let pod = pod_from_json(json!({
            "metadata": {"name": "p"},
            "spec": {
                "containers": [{"name": "a", "image": "x"}, {"name": "b", "image": "y"}],
                "initContainers": [{"name": "setup", "image": "z"}]
            }
        }));
        assert_eq!(target_containers(&pod), vec!["a", "b", "setup"]);
    }

    #[test]
    fn test_target_containers_from_annotation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(CONTAINER_ANNOTATION.to_string(), "app, worker".to_string());
        let mut pod = injectable_pod();
        pod.metadata.annotations.as_mut().unwrap().extend(annotations);
        assert_eq!(target_containers(&pod), vec!["app", "worker"]);
    }

    #[test]
    fn test_patch_ops_shape() {
        let pod = injectable_pod();
        let ops = build_patch_ops(&pod, "ns-a", "550e8400-e29b-41d4-a716-446655440000", "/corefile");

        assert_eq!(ops[0]["op"], "add");
        assert_eq!(ops[0]["path"], "/metadata/annotations/coredog.io~1admission-uid");
        assert_eq!(ops[0]["value"], "550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(ops[1]["path"], "/metadata/annotations/coredog.io~1target-containers");
        assert_eq!(ops[1]["value"], "app,sidecar");

        // Empty volumes list: first add creates the array, second appends.
        assert_eq!(ops[2]["path"], "/spec/volumes");
        assert_eq!(
            ops[2]["value"][0]["hostPath"]["path"],
            "/data/coredog-system/dumps/ns-a/web-7f9c/app"
        );
        assert_eq!(ops[2]["value"][0]["hostPath"]["type"], "DirectoryOrCreate");
        assert_eq!(ops[3]["path"], "/spec/volumes/-");
        assert_eq!(
            ops[3]["value"]["hostPath"]["path"],
            "/data/coredog-system/dumps/ns-a/web-7f9c/sidecar"
        );

        // One volumeMounts op per targeted container.
        assert_eq!(ops[4]["path"], "/spec/containers/0/volumeMounts");
        assert_eq!(ops[4]["value"][0]["name"], "coredog-corefile-app");
        assert_eq!(ops[4]["value"][0]["mountPath"], "/corefile");
        assert_eq!(ops[5]["path"], "/spec/containers/1/volumeMounts");
    }

    #[test]
    fn test_patch_ops_skip_untargeted_containers() {
        let mut pod = injectable_pod();
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(CONTAINER_ANNOTATION.to_string(), "app".to_string());
        let ops = build_patch_ops(&pod, "ns-a", "uid-1234-abcd", "/corefile");

        let mount_paths: Vec<&str> = ops
            .iter()
            .filter_map(|op| op["path"].as_str())
            .filter(|p| p.contains("volumeMounts"))
            .collect();
        assert_eq!(mount_paths, vec!["/spec/containers/0/volumeMounts"]);
    }

    #[test]
    fn test_patch_ops_synthesize_pod_name() {
        let mut pod = injectable_pod();
        pod.metadata.name = None;
        let ops = build_patch_ops(&pod, "ns-a", "550e8400-e29b-41d4-a716-446655440000", "/corefile");
        assert_eq!(
            ops[2]["value"][0]["hostPath"]["path"],
            "/data/coredog-system/dumps/ns-a/pod-550e8400/app"
        );
    }

    #[test]
    fn test_mutate_review_allows_and_patches() {
        let review: AdmissionReview<Pod> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "550e8400-e29b-41d4-a716-446655440000",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "ns-a",
                "name": "web-7f9c",
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {
                        "name": "web-7f9c",
                        "annotations": {
                            "coredog.io/inject": "true",
                            "coredog.io/path": "/corefile"
                        }
                    },
                    "spec": {"containers": [{"name": "app", "image": "alpine:3"}]}
                }
            }
        }))
        .unwrap();

        let result = mutate_review(review).unwrap();
        let response = result.response.unwrap();
        assert!(response.allowed);
        assert_eq!(response.uid, "550e8400-e29b-41d4-a716-446655440000");
        assert!(response.patch.is_some());
    }

    #[test]
    fn test_mutate_review_without_request_errs() {
        // The caller is responsible for admitting the pod anyway.
        let review: AdmissionReview<Pod> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        }))
        .unwrap();
        assert!(mutate_review(review).is_err());
    }

    #[test]
    fn test_mutate_review_skips_unannotated_pod() {
        let review: AdmissionReview<Pod> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "abc-123",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "ns-a",
                "name": "plain",
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "plain"},
                    "spec": {"containers": [{"name": "app", "image": "alpine:3"}]}
                }
            }
        }))
        .unwrap();

        let result = mutate_review(review).unwrap();
        let response = result.response.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_escape_pointer() {
        assert_eq!(escape_pointer("coredog.io/inject"), "coredog.io~1inject");
        assert_eq!(escape_pointer("a~b/c"), "a~0b~1c");
    }
}

use std::sync::LazyLock;

use k8s_openapi::api::{batch::v1::Job, core::v1::Toleration};
use serde_json::json;

use super::{WorkerMode, WorkerSpec, CONTAINER_NAME, DEST_MOUNT, SOURCE_MOUNT};
use crate::error::Result;

/// Tolerates every taint, so the worker can land next to node-pinned volumes.
pub(super) static DEFAULT_TOLERATIONS: LazyLock<Vec<Toleration>> = LazyLock::new(|| {
    vec![Toleration {
        operator: Some("Exists".to_owned()),
        ..Default::default()
    }]
});

fn command(mode: &WorkerMode) -> Vec<String> {
    match mode {
        WorkerMode::Sync { .. } => vec![
            "rsync".to_owned(),
            "-aHAX".to_owned(),
            "--numeric-ids".to_owned(),
            "--info=progress2".to_owned(),
            format!("{SOURCE_MOUNT}/"),
            format!("{DEST_MOUNT}/"),
        ],
        WorkerMode::Idle => vec!["sleep".to_owned(), "infinity".to_owned()],
    }
}

/// The single-pod Job running a worker.
pub(super) fn worker_job(spec: &WorkerSpec) -> Result<Job> {
    let mut volumes = vec![json!({
        "name": "source",
        "persistentVolumeClaim": { "claimName": spec.source }
    })];
    let mut volume_mounts = vec![json!({ "name": "source", "mountPath": SOURCE_MOUNT })];

    if let WorkerMode::Sync { destination } = &spec.mode {
        volumes.push(json!({
            "name": "dest",
            "persistentVolumeClaim": { "claimName": destination }
        }));
        volume_mounts.push(json!({ "name": "dest", "mountPath": DEST_MOUNT }));
    }

    let annotations = json!({
        "sidecar.istio.io/inject": "false",
        "linkerd.io/inject": "disabled"
    });

    let json_value = json!({
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": {
                "app": "pvshift"
            },
            "annotations": annotations
        },
        "spec": {
            "template": {
                "metadata": {
                    "labels": {
                        "app": "pvshift"
                    },
                    "annotations": annotations
                },
                "spec": {
                    "restartPolicy": "OnFailure",
                    "serviceAccountName": spec.service_account,
                    "tolerations": spec.tolerate_all_nodes.then(|| &*DEFAULT_TOLERATIONS),
                    "volumes": volumes,
                    "containers": [
                        {
                            "name": CONTAINER_NAME,
                            "image": spec.image,
                            "command": command(&spec.mode),
                            "volumeMounts": volume_mounts
                        }
                    ]
                }
            }
        }
    });

    Ok(serde_json::from_value(json_value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mover::MoverConfig;

    fn pod_spec(job: &Job) -> &k8s_openapi::api::core::v1::PodSpec {
        job.spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .unwrap()
    }

    #[test]
    fn sync_worker_mounts_both_claims() {
        let spec = WorkerSpec::new(
            "copy",
            "1234",
            "apps",
            "data",
            WorkerMode::Sync {
                destination: "data-copy-1".to_owned(),
            },
            &MoverConfig::default(),
        );

        let job = worker_job(&spec).unwrap();
        let pod = pod_spec(&job);

        assert_eq!(job.metadata.name.as_deref(), Some("pvshift-copy-1234"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert!(pod.tolerations.is_none());
        assert!(pod.service_account_name.is_none());

        let claims: Vec<_> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|volume| {
                volume
                    .persistent_volume_claim
                    .as_ref()
                    .unwrap()
                    .claim_name
                    .as_str()
            })
            .collect();
        assert_eq!(claims, ["data", "data-copy-1"]);

        let container = &pod.containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(container.command.as_ref().unwrap()[0], "rsync");
        let mounts: Vec<_> = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|mount| mount.mount_path.as_str())
            .collect();
        assert_eq!(mounts, [SOURCE_MOUNT, DEST_MOUNT]);
    }

    #[test]
    fn idle_worker_tolerates_everything() {
        let config = MoverConfig {
            tolerate_all_nodes: true,
            service_account: Some("mover".to_owned()),
            ..Default::default()
        };
        let spec = WorkerSpec::new("export", "1234", "apps", "data", WorkerMode::Idle, &config);

        let job = worker_job(&spec).unwrap();
        let pod = pod_spec(&job);

        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(
            pod.containers[0].command.as_deref(),
            Some(&["sleep".to_owned(), "infinity".to_owned()][..])
        );
        assert_eq!(pod.tolerations.as_deref(), Some(&DEFAULT_TOLERATIONS[..]));
        assert_eq!(pod.service_account_name.as_deref(), Some("mover"));
    }
}

//! In-memory [`ClusterApi`] for scenario tests.
//!
//! Claims bind as soon as they are created, and every Job gets one `Running` pod right away.
//! Sync workers succeed immediately unless told otherwise with [`FakeCluster::fail_job`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobCondition, JobStatus},
        core::v1::{
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod,
            PodSpec, PodStatus, VolumeResourceRequirements,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{ObjectMeta, OwnerReference},
    },
};
use kube::{core::ErrorResponse, ResourceExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    api::{ClusterApi, ExecInput, ExecOutput, LogStream},
    error::{KubeApiError, Result},
};

/// A mutating call observed by the fake, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    ClaimCreated(String),
    ClaimDeleted(String),
    JobCreated(String),
    JobDeleted(String),
    PodDeleted(String),
    Exec { pod: String, command: Vec<String> },
}

#[derive(Default)]
struct FakeState {
    claims: BTreeMap<String, PersistentVolumeClaim>,
    jobs: BTreeMap<String, Job>,
    pods: BTreeMap<String, Pod>,
    owners: HashMap<(String, String), ObjectMeta>,
    events: Vec<FakeEvent>,
    next_uid: u64,

    failing_jobs: HashMap<String, String>,
    failing_claim_deletes: HashSet<String>,
    failing_job_deletes: HashSet<String>,
    pending_claims: HashSet<String>,
    logs: Vec<String>,
    exec_stdout: Vec<u8>,
    exec_stderr: Vec<u8>,
    exec_failure: Option<String>,
    exec_stdin: Vec<u8>,
}

impl FakeState {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("fake-uid-{}", self.next_uid)
    }
}

pub struct FakeCluster {
    namespace: String,
    state: Mutex<FakeState>,
}

fn api_error(code: u16, reason: &str, message: String) -> KubeApiError {
    KubeApiError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message,
        reason: reason.to_owned(),
        code,
    }))
}

/// A claim in `namespace` requesting `storage`, with a `ReadWriteOnce` access mode.
pub fn claim(namespace: &str, name: &str, storage: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_owned(),
                    Quantity(storage.to_owned()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

impl FakeCluster {
    pub fn new(namespace: &str) -> Self {
        FakeCluster {
            namespace: namespace.to_owned(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores an already bound claim, assigning it a uid when it has none.
    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut state = self.state();
        if claim.metadata.uid.is_none() {
            claim.metadata.uid = Some(state.uid());
        }
        claim.status.get_or_insert_with(Default::default).phase = Some("Bound".to_owned());
        state.claims.insert(claim.name_any(), claim);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.state().pods.insert(pod.name_any(), pod);
    }

    /// Makes `meta` resolvable as the owner of kind `kind`.
    pub fn insert_owner(&self, kind: &str, meta: ObjectMeta) {
        let name = meta.name.clone().unwrap_or_default();
        self.state().owners.insert((kind.to_owned(), name), meta);
    }

    /// The Job named `job` is marked failed as soon as it is created.
    pub fn fail_job(&self, job: &str, reason: &str) {
        self.state()
            .failing_jobs
            .insert(job.to_owned(), reason.to_owned());
    }

    pub fn fail_claim_delete(&self, name: &str) {
        self.state().failing_claim_deletes.insert(name.to_owned());
    }

    pub fn fail_job_delete(&self, name: &str) {
        self.state().failing_job_deletes.insert(name.to_owned());
    }

    /// Claims whose name starts with `prefix` stay `Pending` once created.
    pub fn leave_claims_pending(&self, prefix: &str) {
        self.state().pending_claims.insert(prefix.to_owned());
    }

    pub fn set_logs(&self, lines: &[&str]) {
        self.state().logs = lines.iter().map(|line| (*line).to_owned()).collect();
    }

    /// What remote commands write to stdout and stderr.
    pub fn set_exec_output(&self, stdout: &[u8], stderr: &[u8]) {
        let mut state = self.state();
        state.exec_stdout = stdout.to_vec();
        state.exec_stderr = stderr.to_vec();
    }

    pub fn fail_exec(&self, reason: &str) {
        self.state().exec_failure = Some(reason.to_owned());
    }

    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(name).cloned()
    }

    pub fn claim_names(&self) -> Vec<String> {
        self.state().claims.keys().cloned().collect()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state().events.clone()
    }

    /// Every claim deletion that went through, in order.
    pub fn deleted_claims(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FakeEvent::ClaimDeleted(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FakeEvent::JobCreated(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Everything remote commands read from their stdin.
    pub fn exec_stdin(&self) -> Vec<u8> {
        self.state().exec_stdin.clone()
    }
}

fn worker_pod(job: &Job) -> Pod {
    let name = job.name_any();

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{name}-fake")),
            namespace: job.namespace(),
            labels: Some(BTreeMap::from([("job-name".to_owned(), name)])),
            ..Default::default()
        },
        spec: job
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.clone())
            .or_else(|| Some(PodSpec::default())),
        status: Some(PodStatus {
            phase: Some("Running".to_owned()),
            ..Default::default()
        }),
    }
}

fn matches_selector(pod: &Pod, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    selector.split(',').all(|requirement| {
        let Some((key, value)) = requirement.split_once('=') else {
            return false;
        };
        pod.labels().get(key.trim()).map(String::as_str) == Some(value.trim())
    })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claim(name))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut state = self.state();
        let name = claim.name_any();
        if state.claims.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("persistentvolumeclaims \"{name}\" already exists"),
            ));
        }

        let mut created = claim.clone();
        created.metadata.uid = Some(state.uid());
        let phase = if state
            .pending_claims
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
        {
            "Pending"
        } else {
            "Bound"
        };
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_owned()),
            ..Default::default()
        });

        state.claims.insert(name.clone(), created.clone());
        state.events.push(FakeEvent::ClaimCreated(name));
        Ok(created)
    }

    async fn delete_claim(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        if state.failing_claim_deletes.contains(name) {
            return Err(api_error(500, "InternalError", format!("cannot delete {name}")));
        }

        let existed = state.claims.remove(name).is_some();
        if existed {
            state.events.push(FakeEvent::ClaimDeleted(name.to_owned()));
        }
        Ok(existed)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.state();
        let name = job.name_any();
        if state.jobs.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("jobs.batch \"{name}\" already exists"),
            ));
        }

        let mut created = job.clone();
        created.metadata.uid = Some(state.uid());
        created.status = Some(match state.failing_jobs.get(&name) {
            Some(reason) => JobStatus {
                failed: Some(1),
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_owned(),
                    status: "True".to_owned(),
                    message: Some(reason.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            None => JobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
        });

        let pod = worker_pod(&created);
        state.pods.insert(pod.name_any(), pod);
        state.jobs.insert(name.clone(), created.clone());
        state.events.push(FakeEvent::JobCreated(name));
        Ok(created)
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(name).cloned())
    }

    async fn delete_job(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        if state.failing_job_deletes.contains(name) {
            return Err(api_error(500, "InternalError", format!("cannot delete {name}")));
        }

        let existed = state.jobs.remove(name).is_some();
        if existed {
            state.events.push(FakeEvent::JobDeleted(name.to_owned()));
        }
        Ok(existed)
    }

    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|pod| matches_selector(pod, label_selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        let existed = state.pods.remove(name).is_some();
        if existed {
            state.events.push(FakeEvent::PodDeleted(name.to_owned()));
        }
        Ok(existed)
    }

    async fn get_owner_meta(&self, owner: &OwnerReference) -> Result<Option<ObjectMeta>> {
        Ok(self
            .state()
            .owners
            .get(&(owner.kind.clone(), owner.name.clone()))
            .cloned())
    }

    async fn log_stream(&self, _pod: &str, _container: &str) -> Result<LogStream> {
        let mut output = self.state().logs.join("\n");
        output.push('\n');

        Ok(Box::pin(futures::io::Cursor::new(output.into_bytes())))
    }

    async fn exec(
        &self,
        pod: &str,
        _container: &str,
        command: Vec<String>,
        stdin: Option<ExecInput>,
        mut stdout: ExecOutput,
        mut stderr: ExecOutput,
    ) -> Result<()> {
        let (stdout_bytes, stderr_bytes, failure) = {
            let mut state = self.state();
            if !state.pods.contains_key(pod) {
                return Err(api_error(404, "NotFound", format!("pods \"{pod}\" not found")));
            }
            state.events.push(FakeEvent::Exec {
                pod: pod.to_owned(),
                command,
            });
            (
                state.exec_stdout.clone(),
                state.exec_stderr.clone(),
                state.exec_failure.clone(),
            )
        };

        if let Some(mut input) = stdin {
            let mut received = Vec::new();
            input.read_to_end(&mut received).await?;
            self.state().exec_stdin.extend(received);
        }

        stdout.write_all(&stdout_bytes).await?;
        stdout.flush().await?;
        stderr.write_all(&stderr_bytes).await?;
        stderr.shutdown().await?;

        match failure {
            Some(reason) => Err(KubeApiError::ExecFailed {
                pod: pod.to_owned(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

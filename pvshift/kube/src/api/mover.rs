//! Lifecycle of the ephemeral worker Job that moves data between claims.
//!
//! A worker is a single-pod Job mounting one claim at [`SOURCE_MOUNT`] and, in
//! [`WorkerMode::Sync`], a second one at [`DEST_MOUNT`]. Sync workers copy and exit, idle workers
//! sleep until they are driven through [`Mover::exec`].

use std::{sync::Arc, time::Duration};

use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::{batch::v1::Job, core::v1::Pod};
use kube::ResourceExt;
use tokio::{io::AsyncBufReadExt as _, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{
        wait::{poll_until, DEFAULT_POLL_INTERVAL},
        ClusterApi, ExecInput, ExecOutput,
    },
    error::{KubeApiError, Result},
};

mod job;

pub const CONTAINER_NAME: &str = "mover";
pub const SOURCE_MOUNT: &str = "/source";
pub const DEST_MOUNT: &str = "/dest";
pub const DEFAULT_IMAGE: &str = "docker.io/instrumentisto/rsync-ssh:alpine";

/// Operator-controlled knobs shared by every worker of a migration.
#[derive(Debug, Clone)]
pub struct MoverConfig {
    /// Needs `sh`, `tar`, `rsync` and `sleep`.
    pub image: String,
    pub tolerate_all_nodes: bool,
    pub service_account: Option<String>,
    pub poll_interval: Duration,
}

impl Default for MoverConfig {
    fn default() -> Self {
        MoverConfig {
            image: DEFAULT_IMAGE.to_owned(),
            tolerate_all_nodes: false,
            service_account: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMode {
    /// Copy the source claim into `destination`, then exit.
    Sync { destination: String },
    /// Stay up doing nothing, commands are run with [`Mover::exec`].
    Idle,
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub namespace: String,
    /// Claim mounted at [`SOURCE_MOUNT`].
    pub source: String,
    pub mode: WorkerMode,
    pub image: String,
    pub tolerate_all_nodes: bool,
    pub service_account: Option<String>,
}

impl WorkerSpec {
    /// `role` and `uid` make up the Job name, so that the workers of different stages (and of
    /// different claims) never collide.
    pub fn new(
        role: &str,
        uid: &str,
        namespace: &str,
        source: &str,
        mode: WorkerMode,
        config: &MoverConfig,
    ) -> Self {
        WorkerSpec {
            name: format!("pvshift-{role}-{uid}"),
            namespace: namespace.to_owned(),
            source: source.to_owned(),
            mode,
            image: config.image.clone(),
            tolerate_all_nodes: config.tolerate_all_nodes,
            service_account: config.service_account.clone(),
        }
    }
}

/// Receives worker output, one prefixed line at a time.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

struct LogTail {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

/// Handle over one worker Job.
pub struct Mover {
    cluster: Arc<dyn ClusterApi>,
    spec: WorkerSpec,
    poll_interval: Duration,
    cancel: CancellationToken,
    output: OutputSink,
    tail: Option<LogTail>,
}

impl Mover {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        spec: WorkerSpec,
        config: &MoverConfig,
        cancel: CancellationToken,
    ) -> Self {
        Mover {
            cluster,
            spec,
            poll_interval: config.poll_interval,
            cancel,
            output: Arc::new(|line: &str| eprintln!("{line}")),
            tail: None,
        }
    }

    /// Sends worker logs and remote stderr to `output` instead of our stderr.
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    fn selector(&self) -> String {
        format!("job-name={}", self.spec.name)
    }

    fn log_prefix(&self) -> String {
        format!("[{}]:", self.spec.name)
    }

    /// Submits the worker Job.
    #[tracing::instrument(level = "debug", skip(self), fields(job = %self.spec.name), err)]
    pub async fn start(&mut self) -> Result<Job> {
        let job = job::worker_job(&self.spec)?;
        let created = self.cluster.create_job(&job).await?;

        info!(job = %self.spec.name, mode = ?self.spec.mode, "worker job created");
        Ok(created)
    }

    /// Waits for the one pod of the Job to be running (or already done).
    ///
    /// No pods or several pods are "not yet", the pod is expected to settle before the timeout.
    pub async fn wait_for_running(&self, start_timeout: Duration) -> Result<Pod> {
        let selector = self.selector();

        poll_until(
            &format!("pod of worker `{}` to run", self.spec.name),
            self.poll_interval,
            start_timeout,
            &self.cancel,
            || async {
                let pods = self.cluster.list_pods(Some(&selector)).await?;
                let [pod] = pods.as_slice() else {
                    debug!(job = %self.spec.name, pods = pods.len(), "expected exactly one worker pod");
                    return Ok(None);
                };

                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref())
                    .unwrap_or("Unknown");

                if matches!(phase, "Running" | "Succeeded") {
                    Ok(Some(pod.clone()))
                } else {
                    debug!(job = %self.spec.name, phase, "pod not in correct state yet");
                    Ok(None)
                }
            },
        )
        .await
        .map_err(|error| KubeApiError::WorkerNotReady {
            name: self.spec.name.clone(),
            source: Box::new(error),
        })
    }

    /// Waits for the worker to run and then to complete, deleting it once it succeeded.
    ///
    /// On failure the Job is left in place, cleaning it up is up to the caller.
    pub async fn wait(&mut self, start_timeout: Duration, transfer_timeout: Duration) -> Result<()> {
        let pod = self.wait_for_running(start_timeout).await?;
        self.follow_logs(&pod);

        info!(job = %self.spec.name, timeout = ?transfer_timeout, "worker running, waiting for completion");

        poll_until(
            &format!("worker `{}` to complete", self.spec.name),
            self.poll_interval,
            transfer_timeout,
            &self.cancel,
            || async {
                let job = self
                    .cluster
                    .get_job(&self.spec.name)
                    .await?
                    .ok_or_else(|| {
                        KubeApiError::WorkerFailed(self.spec.name.clone(), "job disappeared".into())
                    })?;

                job_outcome(&job)
            },
        )
        .await?;

        debug!(job = %self.spec.name, "cleaning up successful worker");
        self.cleanup().await
    }

    /// Tails the worker's output in the background, until the stream ends or
    /// [`Mover::cleanup`] stops it.
    fn follow_logs(&mut self, pod: &Pod) {
        if self.tail.is_some() {
            return;
        }

        let stop = self.cancel.child_token();
        let handle = tokio::spawn(tail_logs(
            self.cluster.clone(),
            pod.name_any(),
            self.log_prefix(),
            self.output.clone(),
            stop.clone(),
        ));

        self.tail = Some(LogTail { handle, stop });
    }

    /// Runs `command` inside the worker's container, with remote stderr relayed line by line to
    /// the worker output.
    ///
    /// The whole stream, stdin included, has to be done within `timeout`.
    #[tracing::instrument(
        level = "debug",
        skip(self, pod, stdin, stdout),
        fields(job = %self.spec.name),
        err
    )]
    pub async fn exec(
        &self,
        pod: &Pod,
        command: Vec<String>,
        stdin: Option<ExecInput>,
        stdout: ExecOutput,
        timeout: Duration,
    ) -> Result<()> {
        let pod_name = pod.name_any();
        let (stderr_writer, stderr_reader) = tokio::io::duplex(8 * 1024);
        let relay = tokio::spawn(relay_lines(
            stderr_reader,
            self.log_prefix(),
            self.output.clone(),
        ));

        let exec = self.cluster.exec(
            &pod_name,
            CONTAINER_NAME,
            command,
            stdin,
            stdout,
            Box::new(stderr_writer),
        );

        // Once this settles the exec future, and the writer half with it, are dropped, which
        // ends the relay.
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(KubeApiError::Cancelled(format!("command in `{pod_name}`")))
            }
            result = tokio::time::timeout(timeout, exec) => match result {
                Ok(result) => result,
                Err(_) => Err(KubeApiError::Timeout {
                    what: format!("command in `{pod_name}` to finish"),
                    timeout,
                }),
            },
        };

        if let Err(error) = relay.await {
            warn!(%error, "stderr relay task failed");
        }

        result
    }

    /// Deletes the Job and whatever pods it left behind. Safe to call repeatedly.
    ///
    /// Pods are swept even when deleting the Job failed, that error is returned afterwards.
    #[tracing::instrument(level = "debug", skip(self), fields(job = %self.spec.name), err)]
    pub async fn cleanup(&mut self) -> Result<()> {
        if let Some(LogTail { handle, stop }) = self.tail.take() {
            stop.cancel();
            if let Err(error) = handle.await {
                warn!(%error, "log tail task failed");
            }
        }

        let deleted = match self.cluster.delete_job(&self.spec.name).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(job = %self.spec.name, "worker job already gone");
                Ok(())
            }
            Err(error) => {
                warn!(job = %self.spec.name, %error, "failed to delete worker job, deleting its pods anyway");
                Err(error)
            }
        };

        match self.cluster.list_pods(Some(&self.selector())).await {
            Ok(pods) => {
                for pod in pods {
                    let name = pod.name_any();
                    if let Err(error) = self.cluster.delete_pod(&name).await {
                        warn!(pod = %name, %error, "failed to delete worker pod, continuing");
                    }
                }
            }
            Err(error) => {
                warn!(%error, "failed to list worker pods, leaving them to the job controller");
            }
        }

        deleted
    }
}

/// `Some(())` once every container succeeded, an error once the Job is marked failed.
fn job_outcome(job: &Job) -> Result<Option<()>> {
    let name = job.name_any();
    let containers = job
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.len())
        .unwrap_or(1);
    let status = job.status.as_ref();

    if let Some(failed) = status
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == "Failed" && condition.status == "True")
        })
    {
        let reason = failed
            .message
            .clone()
            .or_else(|| failed.reason.clone())
            .unwrap_or_else(|| "job failed".to_owned());
        return Err(KubeApiError::WorkerFailed(name, reason));
    }

    let succeeded = status.and_then(|status| status.succeeded).unwrap_or(0);
    if usize::try_from(succeeded).unwrap_or(0) >= containers {
        Ok(Some(()))
    } else {
        debug!(
            job = %name,
            active = status.and_then(|status| status.active).unwrap_or(0),
            failed = status.and_then(|status| status.failed).unwrap_or(0),
            "worker still running"
        );
        Ok(None)
    }
}

async fn tail_logs(
    cluster: Arc<dyn ClusterApi>,
    pod: String,
    prefix: String,
    output: OutputSink,
    stop: CancellationToken,
) {
    let logs = tokio::select! {
        _ = stop.cancelled() => return,
        logs = cluster.log_stream(&pod, CONTAINER_NAME) => logs,
    };

    let logs = match logs {
        Ok(logs) => logs,
        Err(error) => {
            warn!(%pod, %error, "error opening log stream");
            return;
        }
    };

    let mut lines = logs.lines();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next() => match line {
                Some(Ok(line)) => output(&format!("{prefix} {line}")),
                Some(Err(error)) => warn!(%pod, %error, "failed to read worker logs, continuing"),
                None => {
                    debug!(%pod, "log stream complete");
                    break;
                }
            },
        }
    }
}

async fn relay_lines<R>(reader: R, prefix: String, output: OutputSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => output(&format!("{prefix} {line}")),
            Ok(None) => break,
            Err(error) => {
                debug!(%error, "stderr relay stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::batch::v1::{JobCondition, JobStatus},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use std::sync::Mutex;

    use super::*;
    use crate::fake::FakeCluster;

    fn job(status: JobStatus) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("pvshift-copy-1".to_owned()),
                ..Default::default()
            },
            spec: None,
            status: Some(status),
        }
    }

    #[test]
    fn job_outcome_follows_status() {
        assert!(matches!(job_outcome(&job(JobStatus::default())), Ok(None)));

        let succeeded = job(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(matches!(job_outcome(&succeeded), Ok(Some(()))));

        let failed = job(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_owned(),
                status: "True".to_owned(),
                reason: Some("BackoffLimitExceeded".to_owned()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(matches!(
            job_outcome(&failed),
            Err(KubeApiError::WorkerFailed(_, reason)) if reason == "BackoffLimitExceeded"
        ));
    }

    /// Captures what the worker prints.
    fn captured() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let output: OutputSink =
            Arc::new(move |line: &str| sink.lock().unwrap().push(line.to_owned()));

        (output, lines)
    }

    fn mover_with(
        cluster: &Arc<FakeCluster>,
        mode: WorkerMode,
        cancel: CancellationToken,
    ) -> (Mover, Arc<Mutex<Vec<String>>>) {
        let config = MoverConfig::default();
        let spec = WorkerSpec::new("copy", "1234", "apps", "data", mode, &config);
        let (output, lines) = captured();

        (
            Mover::new(cluster.clone(), spec, &config, cancel).with_output(output),
            lines,
        )
    }

    fn mover(cluster: &Arc<FakeCluster>, mode: WorkerMode) -> Mover {
        mover_with(cluster, mode, CancellationToken::new()).0
    }

    /// A started idle worker and its running pod.
    async fn running(
        cluster: &Arc<FakeCluster>,
        cancel: CancellationToken,
    ) -> (Mover, Pod, Arc<Mutex<Vec<String>>>) {
        let (mut mover, lines) = mover_with(cluster, WorkerMode::Idle, cancel);
        mover.start().await.unwrap();
        let pod = mover
            .wait_for_running(Duration::from_secs(5))
            .await
            .unwrap();

        (mover, pod, lines)
    }

    fn sync() -> WorkerMode {
        WorkerMode::Sync {
            destination: "data-copy-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn successful_worker_is_cleaned_up() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.set_logs(&["sending incremental file list", "done"]);
        let (mut mover, lines) = mover_with(&cluster, sync(), CancellationToken::new());

        mover.start().await.unwrap();
        mover
            .wait(Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(cluster.job_names().is_empty());
        assert!(cluster.pod_names().is_empty());
        assert!(mover.tail.is_none());

        // The tail may be stopped before it got to every line, whatever it printed is prefixed.
        for line in lines.lock().unwrap().iter() {
            assert!(line.starts_with("[pvshift-copy-1234]:"), "{line}");
        }
    }

    #[tokio::test]
    async fn failed_worker_is_left_for_the_caller() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.fail_job("pvshift-copy-1234", "BackoffLimitExceeded");
        let mut mover = mover(&cluster, sync());

        mover.start().await.unwrap();
        let result = mover
            .wait(Duration::from_secs(5), Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(KubeApiError::WorkerFailed(..))));
        assert_eq!(cluster.job_names(), ["pvshift-copy-1234"]);

        mover.cleanup().await.unwrap();
        assert!(cluster.job_names().is_empty());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        let mut mover = mover(&cluster, WorkerMode::Idle);

        mover.start().await.unwrap();
        mover.cleanup().await.unwrap();
        let after_first = cluster.events();
        mover.cleanup().await.unwrap();

        assert_eq!(cluster.events(), after_first);
        assert!(cluster.job_names().is_empty());
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test]
    async fn pods_are_swept_when_job_deletion_fails() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.fail_job_delete("pvshift-copy-1234");
        let mut mover = mover(&cluster, WorkerMode::Idle);

        mover.start().await.unwrap();
        let result = mover.cleanup().await;

        assert!(matches!(result, Err(ref error) if !error.is_not_found()));
        assert_eq!(cluster.job_names(), ["pvshift-copy-1234"]);
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pod_is_not_ready() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        let mover = mover(&cluster, WorkerMode::Idle);

        let error = mover
            .wait_for_running(Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(error, KubeApiError::WorkerNotReady { .. }));
        assert!(error.is_timeout());
    }

    #[tokio::test]
    async fn exec_pipes_stdin_and_stdout() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.set_exec_output(b"archive", b"./\n./file\n");
        let (mut mover, pod, lines) = running(&cluster, CancellationToken::new()).await;

        let (stdout, mut received) = tokio::io::duplex(64);
        mover
            .exec(
                &pod,
                vec!["tar".to_owned()],
                Some(Box::new(&b"input"[..])),
                Box::new(stdout),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let mut output = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut received, &mut output)
            .await
            .unwrap();
        assert_eq!(output, b"archive");
        assert_eq!(cluster.exec_stdin(), b"input");
        assert_eq!(
            *lines.lock().unwrap(),
            ["[pvshift-copy-1234]: ./", "[pvshift-copy-1234]: ./file"]
        );

        mover.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn failed_exec_still_relays_stderr() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.set_exec_output(b"", b"gzip: stdin: not in gzip format\n");
        cluster.fail_exec("command terminated with non-zero exit code");
        let (mover, pod, lines) = running(&cluster, CancellationToken::new()).await;

        let error = mover
            .exec(
                &pod,
                vec!["tar".to_owned()],
                None,
                Box::new(tokio::io::sink()),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, KubeApiError::ExecFailed { .. }));
        // The relay was joined before `exec` returned.
        assert_eq!(
            *lines.lock().unwrap(),
            ["[pvshift-copy-1234]: gzip: stdin: not in gzip format"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_exec_hits_its_deadline() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        let (mover, pod, _) = running(&cluster, CancellationToken::new()).await;
        // Kept alive, so stdin never reaches its end.
        let (_stalled, stdin) = tokio::io::duplex(64);
        let start = tokio::time::Instant::now();

        let error = mover
            .exec(
                &pod,
                vec!["tar".to_owned()],
                Some(Box::new(stdin)),
                Box::new(tokio::io::sink()),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, KubeApiError::Timeout { .. }));
        assert!(error.is_timeout());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancelled_exec_returns_promptly() {
        let cluster = Arc::new(FakeCluster::new("apps"));
        let cancel = CancellationToken::new();
        let (mover, pod, _) = running(&cluster, cancel.clone()).await;
        let (_stalled, stdin) = tokio::io::duplex(64);
        cancel.cancel();

        let error = tokio::time::timeout(
            Duration::from_secs(5),
            mover.exec(
                &pod,
                vec!["tar".to_owned()],
                Some(Box::new(stdin)),
                Box::new(tokio::io::sink()),
                Duration::from_secs(3600),
            ),
        )
        .await
        .expect("exec should observe cancellation")
        .unwrap_err();

        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn relay_ends_when_writer_is_dropped() {
        let (writer, reader) = tokio::io::duplex(64);
        let (output, lines) = captured();
        let relay = tokio::spawn(relay_lines(reader, "[test]:".to_owned(), output));

        drop(writer);

        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay should stop once the stream closes")
            .unwrap();
        assert!(lines.lock().unwrap().is_empty());
    }
}

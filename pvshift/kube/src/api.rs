use std::pin::Pin;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::{PersistentVolumeClaim, Pod},
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};

use crate::error::Result;

pub mod kubernetes;
pub mod mover;
pub mod wait;

/// Follow-mode log output of a container.
pub type LogStream = Pin<Box<dyn futures::AsyncBufRead + Send>>;

/// Data fed into a remote command.
pub type ExecInput = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Sink for one of the output channels of a remote command.
pub type ExecOutput = Box<dyn tokio::io::AsyncWrite + Send + Unpin>;

/// The slice of the Kubernetes API a migration needs, scoped to a single namespace.
///
/// Deletions report whether the object existed, so "already gone" is never an error.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get_claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Deletes with foreground propagation.
    async fn delete_claim(&self, name: &str) -> Result<bool>;

    async fn create_job(&self, job: &Job) -> Result<Job>;

    async fn get_job(&self, name: &str) -> Result<Option<Job>>;

    /// Deletes with background propagation, so the Job's pods go with it.
    async fn delete_job(&self, name: &str) -> Result<bool>;

    async fn list_pods(&self, label_selector: Option<&str>) -> Result<Vec<Pod>>;

    async fn delete_pod(&self, name: &str) -> Result<bool>;

    /// Fetches the metadata of whatever object `owner` points at, `None` if it is gone.
    async fn get_owner_meta(&self, owner: &OwnerReference) -> Result<Option<ObjectMeta>>;

    async fn log_stream(&self, pod: &str, container: &str) -> Result<LogStream>;

    /// Runs `command` in `container` and pumps its stdio until the remote process exits.
    ///
    /// Returns an error when the stream breaks or the process does not exit successfully.
    async fn exec(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Option<ExecInput>,
        stdout: ExecOutput,
        stderr: ExecOutput,
    ) -> Result<()>;
}

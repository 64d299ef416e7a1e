use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = KubeApiError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum KubeApiError {
    #[error("Kube failed: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to infer Kube config: {0}")]
    InferKubeConfigError(#[from] kube::config::InferConfigError),

    #[error("Failed to load Kube config: {0}")]
    KubeConfigPathError(#[from] kube::config::KubeconfigError),

    #[error("IO failed: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to build resource from template: {0}")]
    TemplateError(#[from] serde_json::Error),

    /// The remote side did not reach the awaited state in time.
    ///
    /// Distinct from [`KubeApiError::KubeError`]: the calls themselves succeeded.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("Operation was cancelled while waiting for {0}")]
    Cancelled(String),

    #[error("Worker `{name}` did not become ready: {source}")]
    WorkerNotReady {
        name: String,
        #[source]
        source: Box<KubeApiError>,
    },

    #[error("Worker `{0}` failed: {1}")]
    WorkerFailed(String, String),

    #[error("Worker `{0}` has no running pod")]
    WorkerNotStarted(String),

    #[error("Remote command in pod `{pod}` failed: {reason}")]
    ExecFailed { pod: String, reason: String },

    #[error("{kind} `{name}` is missing field `{field}`")]
    MissingField {
        kind: String,
        name: String,
        field: &'static str,
    },

    #[error("Invalid storage quantity `{0}`")]
    InvalidQuantity(String),

    #[error("Owner reference `{0}` has an invalid apiVersion")]
    InvalidOwnerReference(String),
}

impl KubeApiError {
    pub fn missing_field<R>(resource: &R, field: &'static str) -> Self
    where
        R: kube::Resource<DynamicType = ()>,
    {
        KubeApiError::MissingField {
            kind: R::kind(&()).into_owned(),
            name: resource.meta().name.clone().unwrap_or_default(),
            field,
        }
    }

    /// `true` when a poll ran out of time (as opposed to an API call failing).
    pub fn is_timeout(&self) -> bool {
        match self {
            KubeApiError::Timeout { .. } => true,
            KubeApiError::WorkerNotReady { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            KubeApiError::Cancelled(_) => true,
            KubeApiError::WorkerNotReady { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// `true` when the API answered with `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeApiError::KubeError(kube::Error::Api(response)) if response.code == 404)
    }
}

use miette::Diagnostic;
use pvshift_kube::error::KubeApiError;
use pvshift_migrator::error::MigrationError;
use thiserror::Error;

pub(crate) type CliResult<T, E = CliError> = core::result::Result<T, E>;

const KUBE_HELP: &str = "Please check that Kubernetes is configured correctly and test your \
    connection with `kubectl get pvc`.";

#[derive(Debug, Error, Diagnostic)]
pub(crate) enum CliError {
    #[error("Failed to build the async runtime: {0}")]
    RuntimeError(std::io::Error),

    #[error("Failed to create Kubernetes API client: {0}")]
    #[diagnostic(help("{KUBE_HELP}"))]
    CreateKubeApiFailed(KubeApiError),

    #[error(
        "New claims have to be in the namespace of the source (`{source_namespace}`), got \
        `{requested}`"
    )]
    #[diagnostic(help(
        "Claims can't be mounted across namespaces, drop `--new-pvc-namespace` or set it to the \
        source namespace."
    ))]
    CrossNamespace {
        source_namespace: String,
        requested: String,
    },

    #[error("Validation of claim `{claim}` failed: {source}")]
    ValidationFailed {
        claim: String,
        #[source]
        source: MigrationError,
        #[help]
        help: String,
    },

    #[error("Failed to migrate {0} of {1} claims, see the log above")]
    MigrationsFailed(usize, usize),

    #[error("Interrupted")]
    #[diagnostic(help("Resources created so far were left in place."))]
    Cancelled,
}

impl CliError {
    /// Nothing was created in the cluster yet, the help says how to get past `source`.
    pub(crate) fn validation_failed(claim: &str, source: MigrationError) -> Self {
        let hint = match &source {
            MigrationError::DestinationTooSmall { .. } => {
                "Use `--force` to accept a smaller destination, or raise `--new-pvc-size`."
            }
            MigrationError::SourceNotFound(_) => {
                "Check the claim name and the namespace (`-n`), `kubectl get pvc` lists them."
            }
            MigrationError::KubeApi(KubeApiError::InvalidQuantity(_)) => {
                "Sizes are Kubernetes quantities, like `512Mi`, `10Gi` or `1Ti`."
            }
            MigrationError::KubeApi(_) => KUBE_HELP,
            _ => "",
        };

        CliError::ValidationFailed {
            claim: claim.to_owned(),
            source,
            help: format!("Nothing was changed in the cluster. {hint}")
                .trim_end()
                .to_owned(),
        }
    }
}

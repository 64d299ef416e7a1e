use std::path::PathBuf;

use pvshift_kube::error::KubeApiError;
use thiserror::Error;

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Source claim `{0}` was not found")]
    SourceNotFound(String),

    #[error(
        "Destination capacity `{destination_size}` is smaller than the source capacity \
        `{source_size}`"
    )]
    DestinationTooSmall {
        source_size: String,
        destination_size: String,
    },

    #[error("No compatible strategy for claim `{claim}`{}", requested_suffix(.requested))]
    NoCompatibleStrategy {
        claim: String,
        requested: Option<String>,
    },

    #[error("Expected import file `{}` does not exist", .0.display())]
    ImportFileMissing(PathBuf),

    /// A step of a strategy failed, after whatever it had created was cleaned up.
    #[error("Stage {stage} ({action}) failed: {source}")]
    StageFailed {
        stage: u8,
        action: &'static str,
        #[source]
        source: KubeApiError,
    },

    #[error(transparent)]
    KubeApi(#[from] KubeApiError),

    #[error("Archive IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to move the archive into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

fn requested_suffix(requested: &Option<String>) -> String {
    requested
        .as_ref()
        .map(|requested| format!(" (requested `{requested}`)"))
        .unwrap_or_default()
}

impl MigrationError {
    /// Builds a `map_err` adapter for stage `stage`.
    pub(crate) fn stage(stage: u8, action: &'static str) -> impl FnOnce(KubeApiError) -> Self {
        move |source| MigrationError::StageFailed {
            stage,
            action,
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            MigrationError::StageFailed { source, .. } | MigrationError::KubeApi(source) => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use pvshift_kube::{
    api::mover::{Mover, WorkerMode, SOURCE_MOUNT},
    claim,
};
use pvshift_progress::{transfer::TransferProgress, Progress, ProgressTracker};
use tokio::io::BufWriter;
use tracing::{debug, info, warn};

use super::{MigrationContext, MigrationStrategy, StrategyContext};
use crate::error::{MigrationError, Result};

/// Archive file for the claim named `claim`, in `dir`.
pub(crate) fn archive_path(dir: &std::path::Path, claim: &str) -> PathBuf {
    dir.join(format!("{claim}.tar"))
}

/// Streams the content of the source claim into a local `<claim>.tar`.
pub struct Export {
    context: Arc<StrategyContext>,
}

impl Export {
    pub const IDENTIFIER: &'static str = "export";

    pub fn new(context: Arc<StrategyContext>) -> Self {
        Export { context }
    }

    fn command() -> Vec<String> {
        ["tar", "czvf", "-", "-C", SOURCE_MOUNT, "."]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn export(
        &self,
        mover: &mut Mover,
        source: &PersistentVolumeClaim,
        progress: &ProgressTracker,
    ) -> Result<PathBuf> {
        let timeout = self.context.transfer_timeout(source)?;

        mover
            .start()
            .await
            .map_err(MigrationError::stage(1, "start export worker"))?;
        let pod = mover
            .wait_for_running(self.context.timeout)
            .await
            .map_err(MigrationError::stage(1, "start export worker"))?;
        debug!("mover pod running, starting copy");

        let archive = archive_path(&self.context.archive_dir, &source.name_any());
        // Renamed into place only once the whole archive was received.
        let partial = tempfile::Builder::new()
            .prefix("pvshift-export-")
            .tempfile_in(&self.context.archive_dir)?;
        let file = tokio::fs::File::from_std(partial.as_file().try_clone()?);

        let transfer = TransferProgress::new(progress, "downloading", None);
        let result = mover
            .exec(
                &pod,
                Self::command(),
                None,
                Box::new(transfer.writer(BufWriter::new(file))),
                timeout,
            )
            .await;

        if let Err(error) = result {
            transfer.abandon();
            return Err(MigrationError::stage(2, "stream archive")(error));
        }
        transfer.finish();

        partial.persist(&archive)?;
        Ok(archive)
    }
}

#[async_trait]
impl MigrationStrategy for Export {
    fn identifier(&self) -> &'static str {
        Self::IDENTIFIER
    }

    fn description(&self) -> &'static str {
        "Export the claim content into a local tar archive."
    }

    fn compatible_with(&self, _: &MigrationContext) -> Result<()> {
        Ok(())
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(strategy = Export::IDENTIFIER, claim = %source.name_any())
    )]
    async fn run(
        &self,
        source: &PersistentVolumeClaim,
        _: &PersistentVolumeClaim,
        _: bool,
        progress: &ProgressTracker,
    ) -> Result<()> {
        warn!("This strategy assumes you've stopped all pods accessing this data.");

        let mut mover = self.context.mover(
            "export",
            claim::uid(source)?,
            &source.name_any(),
            WorkerMode::Idle,
            progress,
        );

        let mut task = progress.subtask("exporting claim");
        let result = self.export(&mut mover, source, progress).await;

        info!("Cleaning up...");
        self.context.discard(&mut mover).await;

        match result {
            Ok(archive) => {
                info!(archive = %archive.display(), "Finished copying");
                task.success(Some(&format!("exported to `{}`", archive.display())));
                Ok(())
            }
            Err(error) => {
                warn!(%error, "Failed to export");
                task.failure(None);
                Err(error)
            }
        }
    }
}

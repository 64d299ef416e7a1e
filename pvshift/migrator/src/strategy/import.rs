use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use pvshift_kube::{
    api::mover::{Mover, WorkerMode, SOURCE_MOUNT},
    claim,
};
use pvshift_progress::{transfer::TransferProgress, Progress, ProgressTracker};
use tracing::{debug, info, warn};

use super::{export::archive_path, MigrationContext, MigrationStrategy, StrategyContext};
use crate::error::{MigrationError, Result};

/// Extracts a local `<claim>.tar`, as written by [`super::Export`], into the claim.
pub struct Import {
    context: Arc<StrategyContext>,
}

impl Import {
    pub const IDENTIFIER: &'static str = "import";

    pub fn new(context: Arc<StrategyContext>) -> Self {
        Import { context }
    }

    fn command() -> Vec<String> {
        ["tar", "xzvf", "-", "-C", SOURCE_MOUNT]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn import(
        &self,
        mover: &mut Mover,
        archive: &Path,
        timeout: Duration,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let file = tokio::fs::File::open(archive).await?;
        let size = file.metadata().await?.len();

        mover
            .start()
            .await
            .map_err(MigrationError::stage(1, "start import worker"))?;
        let pod = mover
            .wait_for_running(self.context.timeout)
            .await
            .map_err(MigrationError::stage(1, "start import worker"))?;
        debug!("mover pod running, starting copy");

        let transfer = TransferProgress::new(progress, "uploading", Some(size));
        // stdout is reserved for progress output, the file listing goes with the relayed stderr.
        let result = mover
            .exec(
                &pod,
                Self::command(),
                Some(Box::new(transfer.reader(file))),
                Box::new(tokio::io::stderr()),
                timeout,
            )
            .await;

        match result {
            Ok(()) => {
                transfer.finish();
                Ok(())
            }
            Err(error) => {
                transfer.abandon();
                Err(MigrationError::stage(2, "stream archive")(error))
            }
        }
    }
}

#[async_trait]
impl MigrationStrategy for Import {
    fn identifier(&self) -> &'static str {
        Self::IDENTIFIER
    }

    fn description(&self) -> &'static str {
        "Import data into the claim from a local tar archive."
    }

    fn compatible_with(&self, context: &MigrationContext) -> Result<()> {
        let archive = archive_path(&self.context.archive_dir, &context.source.name_any());

        if archive.is_file() {
            Ok(())
        } else {
            Err(MigrationError::ImportFileMissing(archive))
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(strategy = Import::IDENTIFIER, claim = %source.name_any())
    )]
    async fn run(
        &self,
        source: &PersistentVolumeClaim,
        _: &PersistentVolumeClaim,
        _: bool,
        progress: &ProgressTracker,
    ) -> Result<()> {
        warn!("This strategy assumes you've stopped all pods accessing this data.");

        let name = source.name_any();
        let archive = archive_path(&self.context.archive_dir, &name);
        let timeout = self.context.transfer_timeout(source)?;
        let mut mover = self.context.mover(
            "import",
            claim::uid(source)?,
            &name,
            WorkerMode::Idle,
            progress,
        );

        let mut task = progress.subtask("importing archive");
        let result = self.import(&mut mover, &archive, timeout, progress).await;

        info!("Cleaning up...");
        self.context.discard(&mut mover).await;

        match result {
            Ok(()) => {
                info!(archive = %archive.display(), "Finished copying into claim");
                task.success(None);
                Ok(())
            }
            Err(error) => {
                warn!(%error, "Failed to import");
                task.failure(None);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pvshift_kube::fake::{self, FakeCluster};
    use pvshift_progress::NullProgress;

    use super::*;
    use crate::strategy::testing;

    fn setup() -> (Arc<FakeCluster>, PersistentVolumeClaim, tempfile::TempDir) {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.insert_claim(fake::claim("apps", "data", "1Gi"));
        let source = cluster.claim("data").unwrap();

        (cluster, source, tempfile::tempdir().unwrap())
    }

    fn context(source: &PersistentVolumeClaim) -> MigrationContext {
        MigrationContext {
            source: source.clone(),
            controllers: Vec::new(),
        }
    }

    #[test]
    fn requires_the_archive() {
        let (cluster, source, dir) = setup();
        let strategy = Import::new(testing::context(&cluster, dir.path()));

        assert!(matches!(
            strategy.compatible_with(&context(&source)),
            Err(MigrationError::ImportFileMissing(path)) if path == dir.path().join("data.tar")
        ));

        std::fs::write(dir.path().join("data.tar"), b"archive").unwrap();
        assert!(strategy.compatible_with(&context(&source)).is_ok());
    }

    #[tokio::test]
    async fn streams_the_archive_into_the_claim() {
        let (cluster, source, dir) = setup();
        std::fs::write(dir.path().join("data.tar"), b"archive bytes").unwrap();
        let strategy = Import::new(testing::context(&cluster, dir.path()));

        strategy
            .run(&source, &source, true, &ProgressTracker::from(NullProgress))
            .await
            .unwrap();

        assert_eq!(cluster.exec_stdin(), b"archive bytes");
        assert_eq!(cluster.created_jobs(), ["pvshift-import-fake-uid-1"]);
        assert!(cluster.events().contains(&fake::FakeEvent::Exec {
            pod: "pvshift-import-fake-uid-1-fake".to_owned(),
            command: Import::command(),
        }));
        assert!(cluster.job_names().is_empty());
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test]
    async fn worker_is_removed_when_extraction_fails() {
        let (cluster, source, dir) = setup();
        std::fs::write(dir.path().join("data.tar"), b"not gzip").unwrap();
        cluster.fail_exec("gzip: stdin: not in gzip format");
        let strategy = Import::new(testing::context(&cluster, dir.path()));

        let error = strategy
            .run(&source, &source, true, &ProgressTracker::from(NullProgress))
            .await
            .unwrap_err();

        assert!(matches!(error, MigrationError::StageFailed { stage: 2, .. }));
        assert!(cluster.job_names().is_empty());
        assert!(cluster.pod_names().is_empty());
    }
}

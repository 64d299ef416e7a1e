use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use pvshift_kube::{
    api::{
        mover::WorkerMode,
        wait::{wait_for_claim_bound, wait_for_claim_deleted},
    },
    claim,
    error::KubeApiError,
};
use pvshift_progress::{Progress, ProgressTracker};
use tracing::{debug, info, warn};

use super::{MigrationContext, MigrationStrategy, StrategyContext};
use crate::error::{MigrationError, Result};

/// Kinds that restart pods on their own, so they must be scaled down before copying.
const CONTROLLER_KINDS: [&str; 4] = ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"];

/// Copies the source into a temporary claim, replaces the source with the destination under the
/// same name, then copies the data back into it.
pub struct CopyTwiceName {
    context: Arc<StrategyContext>,
}

impl CopyTwiceName {
    pub const IDENTIFIER: &'static str = "copy-twice-name";

    pub fn new(context: Arc<StrategyContext>) -> Self {
        CopyTwiceName { context }
    }

    /// Runs a sync worker copying `source` into `destination`, removing it again if it fails.
    async fn copy(
        &self,
        role: &str,
        uid: &str,
        source: &str,
        destination: &str,
        transfer_timeout: Duration,
        progress: &ProgressTracker,
    ) -> Result<(), KubeApiError> {
        let mut mover = self.context.mover(
            role,
            uid,
            source,
            WorkerMode::Sync {
                destination: destination.to_owned(),
            },
            progress,
        );

        let result = async {
            mover.start().await?;
            mover.wait(self.context.timeout, transfer_timeout).await
        }
        .await;

        if let Err(error) = &result {
            if !error.is_cancelled() {
                self.context.discard(&mut mover).await;
            }
        }

        result
    }

    async fn delete_claim(&self, name: &str) -> Result<(), KubeApiError> {
        self.context.cluster.delete_claim(name).await?;
        wait_for_claim_deleted(
            self.context.cluster.as_ref(),
            name,
            self.context.timeout,
            &self.context.cancel,
        )
        .await
    }

    /// The actual migration. Claims pushed to `leftovers` are deleted if this fails.
    async fn stages(
        &self,
        source: &PersistentVolumeClaim,
        destination: &PersistentVolumeClaim,
        wait_for_bind: bool,
        progress: &ProgressTracker,
        leftovers: &mut Vec<String>,
    ) -> Result<()> {
        let uid = claim::uid(source)?;
        let source_name = source.name_any();
        let destination_name = destination.name_any();
        let transfer_timeout = self.context.transfer_timeout(destination)?;
        debug!(timeout = ?transfer_timeout, "set transfer timeout");

        let mut temporary = destination.clone();
        let temporary_name = format!(
            "{destination_name}-copy-{}",
            chrono::Utc::now().timestamp()
        );
        temporary.metadata.name = Some(temporary_name.clone());

        let mut stage = progress.subtask("creating temporary claim");
        debug!(stage = 1, claim = %temporary_name, "creating temporary claim");
        self.context
            .cluster
            .create_claim(&temporary)
            .await
            .map_err(MigrationError::stage(1, "create temporary claim"))?;
        stage.success(None);

        if wait_for_bind {
            let mut stage = progress.subtask("waiting for temporary claim to be bound");
            debug!(stage = 2, claim = %temporary_name, "waiting for temporary claim to be bound");
            if let Err(error) = wait_for_claim_bound(
                self.context.cluster.as_ref(),
                &temporary_name,
                self.context.timeout,
                &self.context.cancel,
            )
            .await
            {
                leftovers.push(temporary_name);
                return Err(MigrationError::stage(2, "wait for temporary claim to be bound")(
                    error,
                ));
            }
            stage.success(None);
        } else {
            debug!(stage = 2, "skipping waiting for temporary claim to be bound");
        }

        let mut stage = progress.subtask("copying data into temporary claim");
        debug!(stage = 3, from = %source_name, to = %temporary_name, "starting copy worker");
        if let Err(error) = self
            .copy(
                "copy",
                uid,
                &source_name,
                &temporary_name,
                transfer_timeout,
                progress,
            )
            .await
        {
            leftovers.push(temporary_name);
            return Err(MigrationError::stage(3, "copy into temporary claim")(error));
        }
        stage.success(None);

        // Past this point the temporary claim holds the only copy of the data.
        let mut stage = progress.subtask("deleting source claim");
        debug!(stage = 4, claim = %source_name, "deleting source claim");
        self.delete_claim(&source_name)
            .await
            .map_err(MigrationError::stage(4, "delete source claim"))?;
        stage.success(None);

        let mut stage = progress.subtask("creating destination claim");
        debug!(stage = 5, claim = %destination_name, "creating destination claim");
        self.context
            .cluster
            .create_claim(destination)
            .await
            .map_err(MigrationError::stage(5, "create destination claim"))?;
        stage.success(None);

        let mut stage = progress.subtask("copying data into destination claim");
        debug!(stage = 6, from = %temporary_name, to = %destination_name, "starting restore worker");
        if let Err(error) = self
            .copy(
                "restore",
                uid,
                &temporary_name,
                &destination_name,
                transfer_timeout,
                progress,
            )
            .await
        {
            leftovers.push(destination_name);
            return Err(MigrationError::stage(6, "copy into destination claim")(error));
        }
        stage.success(None);

        let mut stage = progress.subtask("deleting temporary claim");
        debug!(stage = 7, claim = %temporary_name, "deleting temporary claim");
        self.delete_claim(&temporary_name)
            .await
            .map_err(MigrationError::stage(7, "delete temporary claim"))?;
        stage.success(None);

        Ok(())
    }

    /// Deletes every claim in `leftovers`, independently of each other.
    async fn cleanup(&self, leftovers: &[String]) {
        info!(claims = ?leftovers, "Cleaning up...");

        for name in leftovers {
            match self.context.cluster.delete_claim(name).await {
                Ok(true) => debug!(claim = %name, "deleted leftover claim"),
                Ok(false) => debug!(claim = %name, "leftover claim already gone"),
                Err(error) => {
                    warn!(claim = %name, %error, "Error during claim cleanup, continuing")
                }
            }
        }
    }
}

#[async_trait]
impl MigrationStrategy for CopyTwiceName {
    fn identifier(&self) -> &'static str {
        Self::IDENTIFIER
    }

    fn description(&self) -> &'static str {
        "Copy the claim into a new one with the new storage class and size, delete the old claim, \
        and copy the data back under the old name."
    }

    fn compatible_with(&self, context: &MigrationContext) -> Result<()> {
        for controller in context
            .controllers
            .iter()
            .filter(|controller| CONTROLLER_KINDS.iter().any(|kind| controller.is_kind(kind)))
        {
            warn!(
                controller = %controller.owner,
                "workload is still using the claim, stop it before migrating"
            );
        }

        Ok(())
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(strategy = CopyTwiceName::IDENTIFIER, claim = %source.name_any())
    )]
    async fn run(
        &self,
        source: &PersistentVolumeClaim,
        destination: &PersistentVolumeClaim,
        wait_for_bind: bool,
        progress: &ProgressTracker,
    ) -> Result<()> {
        warn!("This strategy assumes you've stopped all pods accessing this data.");

        let mut leftovers = Vec::new();
        let result = self
            .stages(source, destination, wait_for_bind, progress, &mut leftovers)
            .await;

        match result {
            Ok(()) => {
                info!("And we're done");
                Ok(())
            }
            Err(error) if error.is_cancelled() => {
                warn!(claims = ?leftovers, "cancelled, leaving resources in place");
                Err(error)
            }
            Err(error) => {
                warn!(%error, "Failed to migrate");
                self.cleanup(&leftovers).await;
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
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        config::DestinationOverrides, destination::build_destination, strategy::testing,
    };

    /// A bound `data` claim of 1Gi, and a template moving it to the `ssd` class.
    fn setup() -> (Arc<FakeCluster>, PersistentVolumeClaim, PersistentVolumeClaim) {
        let cluster = Arc::new(FakeCluster::new("apps"));
        cluster.insert_claim(fake::claim("apps", "data", "1Gi"));
        let source = cluster.claim("data").unwrap();

        let overrides = DestinationOverrides {
            storage_class: Some("ssd".to_owned()),
            ..Default::default()
        };
        let destination = build_destination(&source, &overrides, false).unwrap();

        (cluster, source, destination)
    }

    fn temporary_claims(cluster: &FakeCluster) -> Vec<String> {
        cluster
            .claim_names()
            .into_iter()
            .filter(|name| name.starts_with("data-copy-"))
            .collect()
    }

    async fn run(
        cluster: &Arc<FakeCluster>,
        source: &PersistentVolumeClaim,
        destination: &PersistentVolumeClaim,
        wait_for_bind: bool,
    ) -> Result<()> {
        let archive_dir = std::env::temp_dir();
        let strategy = CopyTwiceName::new(testing::context(cluster, &archive_dir));

        strategy
            .run(
                source,
                destination,
                wait_for_bind,
                &ProgressTracker::from(NullProgress),
            )
            .await
    }

    #[tokio::test]
    async fn replaces_the_source_claim() {
        let (cluster, source, destination) = setup();

        run(&cluster, &source, &destination, true).await.unwrap();

        let migrated = cluster.claim("data").unwrap();
        assert_eq!(claim::storage_class(&migrated), Some("ssd"));
        assert_ne!(migrated.metadata.uid, source.metadata.uid);
        assert!(temporary_claims(&cluster).is_empty());
        assert_eq!(
            cluster.created_jobs(),
            ["pvshift-copy-fake-uid-1", "pvshift-restore-fake-uid-1"]
        );
        assert!(cluster.job_names().is_empty());
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test]
    async fn first_copy_failure_only_removes_the_temporary_claim() {
        let (cluster, source, destination) = setup();
        cluster.fail_job("pvshift-copy-fake-uid-1", "BackoffLimitExceeded");

        let error = run(&cluster, &source, &destination, true)
            .await
            .unwrap_err();

        assert!(matches!(error, MigrationError::StageFailed { stage: 3, .. }));
        let deleted = cluster.deleted_claims();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].starts_with("data-copy-"));
        assert!(temporary_claims(&cluster).is_empty());
        assert_eq!(cluster.claim("data").unwrap().metadata.uid, source.metadata.uid);
        assert!(!cluster
            .events()
            .contains(&fake::FakeEvent::ClaimCreated("data".to_owned())));
        assert!(cluster.job_names().is_empty());
    }

    #[tokio::test]
    async fn second_copy_failure_keeps_the_temporary_claim() {
        let (cluster, source, destination) = setup();
        cluster.fail_job("pvshift-restore-fake-uid-1", "BackoffLimitExceeded");

        let error = run(&cluster, &source, &destination, true)
            .await
            .unwrap_err();

        assert!(matches!(error, MigrationError::StageFailed { stage: 6, .. }));
        // The source goes away in stage 4, the destination (same name) during cleanup.
        assert_eq!(cluster.deleted_claims(), ["data", "data"]);
        assert!(cluster.claim("data").is_none());
        assert_eq!(temporary_claims(&cluster).len(), 1);
        assert!(cluster.job_names().is_empty());
    }

    #[tokio::test]
    async fn failed_source_deletion_deletes_nothing() {
        let (cluster, source, destination) = setup();
        cluster.fail_claim_delete("data");

        let error = run(&cluster, &source, &destination, true)
            .await
            .unwrap_err();

        assert!(matches!(error, MigrationError::StageFailed { stage: 4, .. }));
        assert!(cluster.deleted_claims().is_empty());
        assert_eq!(temporary_claims(&cluster).len(), 1);
        assert!(cluster.claim("data").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unbound_temporary_claim_is_removed() {
        let (cluster, source, destination) = setup();
        cluster.leave_claims_pending("data-copy-");

        let error = run(&cluster, &source, &destination, true)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            MigrationError::StageFailed { stage: 2, ref source, .. } if source.is_timeout()
        ));
        assert!(temporary_claims(&cluster).is_empty());
        assert!(cluster.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn bind_wait_can_be_skipped() {
        let (cluster, source, destination) = setup();
        cluster.leave_claims_pending("data-copy-");

        run(&cluster, &source, &destination, false).await.unwrap();

        assert_eq!(cluster.created_jobs().len(), 2);
    }

    #[rstest]
    #[case::while_binding(true, 2)]
    #[case::while_copying(false, 3)]
    #[tokio::test]
    async fn cancellation_leaves_everything_in_place(
        #[case] wait_for_bind: bool,
        #[case] expected_stage: u8,
    ) {
        let (cluster, source, destination) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let strategy = CopyTwiceName::new(testing::context_with(
            &cluster,
            &std::env::temp_dir(),
            None,
            cancel,
        ));

        let error = strategy
            .run(
                &source,
                &destination,
                wait_for_bind,
                &ProgressTracker::from(NullProgress),
            )
            .await
            .unwrap_err();

        assert!(error.is_cancelled());
        assert!(matches!(
            error,
            MigrationError::StageFailed { stage, .. } if stage == expected_stage
        ));
        assert!(cluster.deleted_claims().is_empty());
        assert_eq!(temporary_claims(&cluster).len(), 1);
        assert_eq!(cluster.claim("data").unwrap().metadata.uid, source.metadata.uid);
        if !wait_for_bind {
            assert_eq!(cluster.job_names(), ["pvshift-copy-fake-uid-1"]);
        }
    }
}

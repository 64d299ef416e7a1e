//! The ways a claim can be migrated.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use pvshift_kube::{
    api::{
        mover::{Mover, MoverConfig, WorkerMode, WorkerSpec},
        ClusterApi,
    },
    claim,
    discovery::ResolvedOwner,
    quantity::GIB,
};
use pvshift_progress::{Progress, ProgressTracker};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{config::MigrationConfig, error::Result};

mod copy_twice_name;
mod export;
mod import;

pub use copy_twice_name::CopyTwiceName;
pub use export::Export;
pub use import::Import;

/// Transfer allowance per GiB of capacity.
const SECONDS_PER_GIB: u128 = 60;

/// Identifiers of every strategy, in the order they are considered.
pub const STRATEGY_IDENTIFIERS: [&str; 3] = [
    CopyTwiceName::IDENTIFIER,
    Export::IDENTIFIER,
    Import::IDENTIFIER,
];

/// What is known about the source claim when picking a strategy.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub source: PersistentVolumeClaim,
    /// Workloads whose pods mount the source.
    pub controllers: Vec<ResolvedOwner>,
}

/// Shared by every strategy of a [`crate::migrator::Migrator`]. Nothing in here changes during a
/// run, per-run state lives in the strategies' `run`.
pub struct StrategyContext {
    pub cluster: Arc<dyn ClusterApi>,
    pub mover: MoverConfig,
    pub timeout: Duration,
    pub copy_timeout: Option<Duration>,
    pub archive_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl StrategyContext {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: &MigrationConfig,
        cancel: CancellationToken,
    ) -> Self {
        StrategyContext {
            cluster,
            mover: config.mover.clone(),
            timeout: config.timeout,
            copy_timeout: config.copy_timeout,
            archive_dir: config.archive_dir.clone(),
            cancel,
        }
    }

    /// Handle over a not yet started worker for `source`, printing through `progress`.
    pub(crate) fn mover(
        &self,
        role: &str,
        uid: &str,
        source: &str,
        mode: WorkerMode,
        progress: &ProgressTracker,
    ) -> Mover {
        let spec = WorkerSpec::new(
            role,
            uid,
            self.cluster.namespace(),
            source,
            mode,
            &self.mover,
        );

        let printer = progress.printer();

        Mover::new(self.cluster.clone(), spec, &self.mover, self.cancel.clone())
            .with_output(Arc::new(move |line: &str| printer.println(line)))
    }

    /// Deadline of one data transfer: `copy_timeout` when set, else proportional to the capacity
    /// of `claim`.
    pub(crate) fn transfer_timeout(&self, claim: &PersistentVolumeClaim) -> Result<Duration> {
        if let Some(timeout) = self.copy_timeout {
            return Ok(timeout);
        }

        let bytes = claim::requested_bytes(claim)?;
        let millis = bytes.saturating_mul(SECONDS_PER_GIB * 1000) / GIB;

        Ok(Duration::from_millis(
            u64::try_from(millis).unwrap_or(u64::MAX),
        ))
    }

    /// Best-effort removal of a worker, failures are only logged.
    pub(crate) async fn discard(&self, mover: &mut Mover) {
        if let Err(error) = mover.cleanup().await {
            warn!(job = mover.name(), %error, "Failed to clean up worker, continuing");
        }
    }
}

#[async_trait]
pub trait MigrationStrategy: Send + Sync {
    /// Stable name, as accepted by `--strategy`.
    fn identifier(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// `Ok` when the strategy can be used, or why it can't.
    fn compatible_with(&self, context: &MigrationContext) -> Result<()>;

    /// Migrates `source` into `destination`, cleaning up after itself when a stage fails.
    async fn run(
        &self,
        source: &PersistentVolumeClaim,
        destination: &PersistentVolumeClaim,
        wait_for_bind: bool,
        progress: &ProgressTracker,
    ) -> Result<()>;
}

pub enum Strategy {
    CopyTwiceName(CopyTwiceName),
    Export(Export),
    Import(Import),
}

impl Strategy {
    /// Every strategy, sharing `context`.
    pub fn all(context: Arc<StrategyContext>) -> Vec<Strategy> {
        vec![
            Strategy::CopyTwiceName(CopyTwiceName::new(context.clone())),
            Strategy::Export(Export::new(context.clone())),
            Strategy::Import(Import::new(context)),
        ]
    }

    fn inner(&self) -> &dyn MigrationStrategy {
        match self {
            Strategy::CopyTwiceName(strategy) => strategy,
            Strategy::Export(strategy) => strategy,
            Strategy::Import(strategy) => strategy,
        }
    }
}

#[async_trait]
impl MigrationStrategy for Strategy {
    fn identifier(&self) -> &'static str {
        self.inner().identifier()
    }

    fn description(&self) -> &'static str {
        self.inner().description()
    }

    fn compatible_with(&self, context: &MigrationContext) -> Result<()> {
        self.inner().compatible_with(context)
    }

    async fn run(
        &self,
        source: &PersistentVolumeClaim,
        destination: &PersistentVolumeClaim,
        wait_for_bind: bool,
        progress: &ProgressTracker,
    ) -> Result<()> {
        self.inner()
            .run(source, destination, wait_for_bind, progress)
            .await
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Strategy").field(&self.identifier()).finish()
    }
}


#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pvshift_kube::fake::{self, FakeCluster};
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    use super::testing;

    #[rstest]
    #[case(Some(Duration::from_secs(5)), "1Gi", Duration::from_secs(5))]
    #[case(None, "1Gi", Duration::from_secs(60))]
    #[case(None, "10Gi", Duration::from_secs(600))]
    #[case(None, "512Mi", Duration::from_secs(30))]
    fn transfer_timeout_scales_with_capacity(
        #[case] copy_timeout: Option<Duration>,
        #[case] size: &str,
        #[case] expected: Duration,
    ) {
        let cluster = Arc::new(FakeCluster::new("apps"));
        let context = testing::context_with(
            &cluster,
            &std::env::temp_dir(),
            copy_timeout,
            CancellationToken::new(),
        );
        let claim = fake::claim("apps", "data", size);

        assert_eq!(context.transfer_timeout(&claim).unwrap(), expected);
    }
}

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use pvshift_kube::{api::ClusterApi, claim, discovery};
use pvshift_progress::ProgressTracker;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::MigrationConfig,
    destination::build_destination,
    error::{MigrationError, Result},
    strategy::{MigrationContext, MigrationStrategy, Strategy, StrategyContext},
};

/// Outcome of [`Migrator::validate`]: everything needed to migrate one claim.
#[derive(Debug)]
pub struct Plan<'a> {
    pub source: PersistentVolumeClaim,
    pub destination: PersistentVolumeClaim,
    pub compatible: Vec<&'a Strategy>,
}

/// Migrates claims of one namespace, one at a time.
pub struct Migrator {
    cluster: Arc<dyn ClusterApi>,
    config: MigrationConfig,
    strategies: Vec<Strategy>,
}

/// The unique compatible strategy, or else the compatible one named `requested`.
fn select<'a>(compatible: &[&'a Strategy], requested: Option<&str>) -> Option<&'a Strategy> {
    if let [only] = compatible {
        debug!(identifier = only.identifier(), "Only one compatible strategy, running");
        return Some(*only);
    }

    let requested = requested?;
    compatible
        .iter()
        .find(|strategy| strategy.identifier() == requested)
        .inspect(|strategy| debug!(identifier = strategy.identifier(), "User selected strategy"))
        .copied()
}

impl Migrator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: MigrationConfig,
        cancel: CancellationToken,
    ) -> Self {
        let context = Arc::new(StrategyContext::new(cluster.clone(), &config, cancel));

        Migrator {
            cluster,
            strategies: Strategy::all(context),
            config,
        }
    }

    /// Fetches the source, builds the destination and finds out which strategies can be used.
    ///
    /// Touches nothing in the cluster. Fails when the source is missing or the destination is
    /// invalid.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn validate(&self, source_name: &str) -> Result<Plan<'_>> {
        let source = self
            .cluster
            .get_claim(source_name)
            .await?
            .ok_or_else(|| MigrationError::SourceNotFound(source_name.to_owned()))?;
        debug!(uid = ?source.metadata.uid, claim = %claim::display_name(&source), "Got source claim");

        let destination = build_destination(&source, &self.config.overrides, self.config.force)?;

        let controllers = discovery::find_controllers(self.cluster.as_ref(), &source)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "Failed to discover workloads using the claim, continuing");
                Vec::new()
            });
        for controller in &controllers {
            debug!(owner = %controller.owner, chain = ?controller.chain, "claim is in use");
        }

        let context = MigrationContext {
            source,
            controllers,
        };

        let compatible = self
            .strategies
            .iter()
            .filter(|strategy| match strategy.compatible_with(&context) {
                Ok(()) => {
                    debug!(identifier = strategy.identifier(), "{}", strategy.description());
                    true
                }
                Err(error) => {
                    info!(identifier = strategy.identifier(), %error, "Strategy not compatible");
                    false
                }
            })
            .collect();

        Ok(Plan {
            source: context.source,
            destination,
            compatible,
        })
    }

    /// Picks a strategy for `plan` and runs it. Nothing is touched when no strategy applies.
    pub async fn run(&self, plan: Plan<'_>, progress: &ProgressTracker) -> Result<()> {
        let claim = plan.source.metadata.name.clone().unwrap_or_default();

        let Some(selected) = select(&plan.compatible, self.config.strategy.as_deref()) else {
            return Err(MigrationError::NoCompatibleStrategy {
                claim,
                requested: self.config.strategy.clone(),
            });
        };

        info!(%claim, strategy = selected.identifier(), "Migrating");
        selected
            .run(
                &plan.source,
                &plan.destination,
                self.config.wait_for_bind,
                progress,
            )
            .await
    }
}

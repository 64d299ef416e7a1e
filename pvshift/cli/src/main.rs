use std::sync::Arc;

use clap::Parser;
use config::Cli;
use error::{CliError, CliResult};
use pvshift_kube::api::{
    kubernetes::{create_kube_api, KubernetesApi},
    ClusterApi,
};
use pvshift_migrator::migrator::Migrator;
use pvshift_progress::{Progress, ProgressTracker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod error;
mod logging;

/// Cancels `cancel` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                warn!(%error, "Failed to listen for SIGINT");
                return;
            }
        }
        _ = terminate => {}
    }

    warn!("Received termination signal, stopping");
    cancel.cancel();
}

async fn migrate(cli: Cli, cancel: CancellationToken) -> CliResult<()> {
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let client = create_kube_api(cli.kubeconfig.as_deref(), cli.context.clone())
        .await
        .map_err(CliError::CreateKubeApiFailed)?;
    let cluster = KubernetesApi::new(client, cli.namespace.clone());
    info!(namespace = cluster.namespace(), "Using namespace");

    // Claims can only be mounted from their own namespace, the worker needs both.
    if let Some(requested) = cli
        .new_namespace
        .as_ref()
        .filter(|requested| requested.as_str() != cluster.namespace())
    {
        return Err(CliError::CrossNamespace {
            source_namespace: cluster.namespace().to_owned(),
            requested: requested.clone(),
        });
    }

    let migrator = Migrator::new(Arc::new(cluster), cli.migration_config(), cancel);
    let mut failed = 0;

    for claim in &cli.claims {
        let mut progress = ProgressTracker::from_env(&format!("migrating `{claim}`"));

        let plan = match migrator.validate(claim).await {
            Ok(plan) => plan,
            Err(source) => {
                progress.failure(Some("validation failed"));
                return Err(CliError::validation_failed(claim, source));
            }
        };

        match migrator.run(plan, &progress).await {
            Ok(()) => progress.success(Some(&format!("migrated `{claim}`"))),
            Err(error) if error.is_cancelled() => {
                progress.failure(Some("interrupted"));
                return Err(CliError::Cancelled);
            }
            Err(error) => {
                warn!(%claim, %error, "Failed to migrate");
                progress.failure(Some(&error.to_string()));
                failed += 1;
            }
        }
    }

    if failed > 0 {
        Err(CliError::MigrationsFailed(failed, cli.claims.len()))
    } else {
        Ok(())
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing_registry(cli.debug);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::RuntimeError)?;

    rt.block_on(migrate(cli, CancellationToken::new()))
        .map_err(Into::into)
}

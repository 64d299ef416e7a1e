use std::{path::PathBuf, time::Duration};

use clap::{builder::PossibleValuesParser, Parser};
use pvshift_kube::api::mover::{MoverConfig, DEFAULT_IMAGE};
use pvshift_migrator::{
    config::{DestinationOverrides, MigrationConfig},
    strategy::STRATEGY_IDENTIFIERS,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Move data between Kubernetes PVCs on different storage classes.",
    long_about = None
)]
pub(super) struct Cli {
    /// Claims to migrate, one after the other.
    #[arg(required = true, value_name = "PVC")]
    pub(super) claims: Vec<String>,

    /// Path to the kubeconfig file to use, instead of the inferred one.
    #[arg(long, alias = "kube-config")]
    pub(super) kubeconfig: Option<String>,

    /// Kubeconfig context to use.
    #[arg(long)]
    pub(super) context: Option<String>,

    /// Namespace of the claims. Defaults to the namespace of the kubeconfig context.
    #[arg(short, long, alias = "source-namespace")]
    pub(super) namespace: Option<String>,

    /// Storage class of the new claim. The cluster default is used when empty.
    #[arg(long = "new-pvc-storage-class")]
    pub(super) new_storage_class: Option<String>,

    /// Size of the new claim (`10Gi`, `1Ti`, ...). Defaults to the size of the source.
    #[arg(long = "new-pvc-size")]
    pub(super) new_size: Option<String>,

    /// Name of the new claim. Defaults to the name of the source.
    #[arg(long = "new-pvc-name")]
    pub(super) new_name: Option<String>,

    /// Namespace of the new claim, which can only be the namespace of the source.
    #[arg(long = "new-pvc-namespace")]
    pub(super) new_namespace: Option<String>,

    /// Access modes of the new claim (`ReadWriteOnce`, `ReadWriteMany`, ...). Defaults to the
    /// access modes of the source.
    #[arg(long = "new-pvc-access-mode", value_delimiter = ',')]
    pub(super) new_access_modes: Vec<String>,

    /// Strategy to use when more than one is compatible.
    #[arg(long, value_parser = PossibleValuesParser::new(STRATEGY_IDENTIFIERS))]
    pub(super) strategy: Option<String>,

    /// Allow a new claim smaller than the source.
    #[arg(long)]
    pub(super) force: bool,

    /// Don't wait for the temporary claim to be bound before copying into it.
    #[arg(long = "skip-pvc-bind-wait")]
    pub(super) skip_bind_wait: bool,

    /// Let workers tolerate any node taint.
    #[arg(long = "tolerate-any-node")]
    pub(super) tolerate_any_node: bool,

    /// Image of the workers, it needs `tar`, `rsync` and `sleep`.
    #[arg(long, default_value = DEFAULT_IMAGE)]
    pub(super) container_image: String,

    /// Service account the workers run as.
    #[arg(long)]
    pub(super) service_account: Option<String>,

    /// Bound of worker start-up and claim binding/deletion waits (`90s`, `5m`, ...).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    pub(super) timeout: Duration,

    /// Bound of each data copy. Defaults to 60s per GiB of the new claim.
    #[arg(long, alias = "copyTimeout", value_parser = humantime::parse_duration)]
    pub(super) copy_timeout: Option<Duration>,

    /// Enable debug logging, `RUST_LOG` takes precedence.
    #[arg(long)]
    pub(super) debug: bool,
}

impl Cli {
    pub(super) fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            overrides: DestinationOverrides {
                name: self.new_name.clone(),
                storage_class: self.new_storage_class.clone(),
                size: self.new_size.clone(),
                access_modes: self.new_access_modes.clone(),
            },
            force: self.force,
            wait_for_bind: !self.skip_bind_wait,
            strategy: self.strategy.clone(),
            timeout: self.timeout,
            copy_timeout: self.copy_timeout,
            archive_dir: PathBuf::from("."),
            mover: MoverConfig {
                image: self.container_image.clone(),
                tolerate_all_nodes: self.tolerate_any_node,
                service_account: self.service_account.clone(),
                ..Default::default()
            },
        }
    }
}

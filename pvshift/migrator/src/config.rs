use std::{path::PathBuf, time::Duration};

use pvshift_kube::api::mover::MoverConfig;

/// Default bound of every wait that is not a data transfer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// What the operator asked to change about the destination claim. `None` (or empty) keeps the
/// source's value, except for the storage class, which falls back to the cluster default.
#[derive(Debug, Clone, Default)]
pub struct DestinationOverrides {
    pub name: Option<String>,
    pub storage_class: Option<String>,
    pub size: Option<String>,
    pub access_modes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub overrides: DestinationOverrides,

    /// Allow a destination smaller than the source.
    pub force: bool,

    /// Wait for the temporary claim to be bound before copying into it.
    pub wait_for_bind: bool,

    /// Strategy identifier, used when more than one strategy is compatible.
    pub strategy: Option<String>,

    /// Bound of worker start-up, claim binding and claim deletion waits.
    pub timeout: Duration,

    /// Bound of data transfers, derived from the destination capacity when unset.
    pub copy_timeout: Option<Duration>,

    /// Where archives are written to and read from.
    pub archive_dir: PathBuf,

    pub mover: MoverConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            overrides: DestinationOverrides::default(),
            force: false,
            wait_for_bind: true,
            strategy: None,
            timeout: DEFAULT_TIMEOUT,
            copy_timeout: None,
            archive_dir: PathBuf::from("."),
            mover: MoverConfig::default(),
        }
    }
}

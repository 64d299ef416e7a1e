use std::fmt::{self, Display, Formatter};

use k8s_openapi::{
    api::core::v1::PersistentVolumeClaim,
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;

use crate::{
    error::{KubeApiError, Result},
    quantity::quantity_bytes,
};

/// Binding phase of a [`PersistentVolumeClaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl ClaimPhase {
    pub fn of(claim: &PersistentVolumeClaim) -> Option<Self> {
        match claim.status.as_ref()?.phase.as_deref()? {
            "Pending" => Some(ClaimPhase::Pending),
            "Bound" => Some(ClaimPhase::Bound),
            "Lost" => Some(ClaimPhase::Lost),
            _ => None,
        }
    }
}

impl Display for ClaimPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

/// Requested storage of the claim, `.spec.resources.requests.storage`.
pub fn requested_storage(claim: &PersistentVolumeClaim) -> Result<&Quantity> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .ok_or_else(|| KubeApiError::missing_field(claim, ".spec.resources.requests.storage"))
}

pub fn requested_bytes(claim: &PersistentVolumeClaim) -> Result<u128> {
    requested_storage(claim).and_then(quantity_bytes)
}

pub fn access_modes(claim: &PersistentVolumeClaim) -> Vec<String> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.access_modes.clone())
        .unwrap_or_default()
}

pub fn storage_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.spec.as_ref()?.storage_class_name.as_deref()
}

/// `.metadata.uid`, assigned by the API server on creation.
pub fn uid(claim: &PersistentVolumeClaim) -> Result<&str> {
    claim
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| KubeApiError::missing_field(claim, ".metadata.uid"))
}

/// Short `namespace/name` used in logs.
pub fn display_name(claim: &PersistentVolumeClaim) -> String {
    match claim.namespace() {
        Some(namespace) => format!("{namespace}/{}", claim.name_any()),
        None => claim.name_any(),
    }
}

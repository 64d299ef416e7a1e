//! Finds the workloads that currently use a claim.
//!
//! The result is advisory: nothing here is allowed to fail a migration, lookups that go wrong are
//! logged and skipped.

use std::fmt::{self, Display, Formatter};

use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, Pod},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{api::ClusterApi, error::Result};

/// Identity of an object found by walking owner references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl Display for OwnerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{namespace}/{}", self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// An ancestor of a pod, with the objects between the pod and it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOwner {
    pub owner: OwnerRef,
    /// Intermediate owners, closest to the pod first. Empty for direct owners.
    pub chain: Vec<OwnerRef>,
}

impl ResolvedOwner {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.owner.kind == kind
    }
}

/// Pods in the namespace with a volume backed by `claim`.
#[tracing::instrument(level = "debug", skip_all, fields(claim = %claim.name_any()), err)]
pub async fn find_mounting_pods<C>(cluster: &C, claim: &PersistentVolumeClaim) -> Result<Vec<Pod>>
where
    C: ClusterApi + ?Sized,
{
    let claim_name = claim.name_any();

    let pods = cluster
        .list_pods(None)
        .await?
        .into_iter()
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.volumes.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|volume| volume.persistent_volume_claim.as_ref())
                .any(|source| source.claim_name == claim_name)
        })
        .collect::<Vec<_>>();

    debug!(pods = pods.len(), "found pods mounting the claim");
    Ok(pods)
}

/// Every ancestor of the object described by `meta`, following owner references up to the
/// top-level workloads.
pub async fn resolve_owners<C>(cluster: &C, meta: &ObjectMeta) -> Vec<ResolvedOwner>
where
    C: ClusterApi + ?Sized,
{
    let mut resolved = Vec::new();
    // (metadata to inspect, chain leading to it)
    let mut pending = vec![(meta.clone(), Vec::<OwnerRef>::new())];

    while let Some((current, chain)) = pending.pop() {
        for reference in current.owner_references.iter().flatten() {
            let owner = OwnerRef {
                kind: reference.kind.clone(),
                name: reference.name.clone(),
                namespace: current.namespace.clone(),
            };

            // Broken clusters can have reference cycles.
            if chain.contains(&owner) {
                warn!(%owner, "owner reference cycle, abandoning branch");
                continue;
            }

            let owner_meta = match cluster.get_owner_meta(reference).await {
                Ok(Some(owner_meta)) => owner_meta,
                Ok(None) => {
                    warn!(%owner, "owner not found, abandoning branch");
                    continue;
                }
                Err(error) => {
                    warn!(%owner, %error, "failed to resolve owner, abandoning branch");
                    continue;
                }
            };

            resolved.push(ResolvedOwner {
                owner: owner.clone(),
                chain: chain.clone(),
            });

            let mut next_chain = chain.clone();
            next_chain.push(owner);
            pending.push((owner_meta, next_chain));
        }
    }

    resolved
}

/// Owners of every pod mounting `claim`, without duplicates.
///
/// Callers pick the kinds they care about with [`ResolvedOwner::is_kind`].
#[tracing::instrument(level = "debug", skip_all, fields(claim = %claim.name_any()), err)]
pub async fn find_controllers<C>(
    cluster: &C,
    claim: &PersistentVolumeClaim,
) -> Result<Vec<ResolvedOwner>>
where
    C: ClusterApi + ?Sized,
{
    let mut controllers: Vec<ResolvedOwner> = Vec::new();

    for pod in find_mounting_pods(cluster, claim).await? {
        for owner in resolve_owners(cluster, &pod.metadata).await {
            if !controllers
                .iter()
                .any(|known| known.owner == owner.owner)
            {
                controllers.push(owner);
            }
        }
    }

    Ok(controllers)
}

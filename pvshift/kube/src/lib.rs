//! Kubernetes side of pvshift: the [`api::ClusterApi`] seam and its kube-backed implementation,
//! bounded waits, the worker lifecycle and the discovery of who uses a claim.

pub mod api;
pub mod claim;
pub mod discovery;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod quantity;

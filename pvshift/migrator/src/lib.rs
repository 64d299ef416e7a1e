//! Moves the data of a `PersistentVolumeClaim` to a claim with another storage class, size or
//! access mode.
//!
//! [`migrator::Migrator`] validates a source claim and picks one of the [`strategy::Strategy`]
//! workflows, which drive worker pods through [`pvshift_kube::api::mover`].

pub mod config;
pub mod destination;
pub mod error;
pub mod migrator;
pub mod strategy;

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{api::ObjectMeta, ResourceExt};
use pvshift_kube::{claim, quantity};
use tracing::{debug, warn};

use crate::{
    config::DestinationOverrides,
    error::{MigrationError, Result},
};

/// Desired state of the claim `source` migrates to.
///
/// Fails with [`MigrationError::DestinationTooSmall`] when the destination would be smaller than
/// the source, unless `force` is set, in which case the requested size is kept as is.
pub fn build_destination(
    source: &PersistentVolumeClaim,
    overrides: &DestinationOverrides,
    force: bool,
) -> Result<PersistentVolumeClaim> {
    let source_size = claim::requested_storage(source)?;
    let size = overrides
        .size
        .as_ref()
        .map(|size| Quantity(size.clone()))
        .unwrap_or_else(|| source_size.clone());

    let source_bytes = quantity::quantity_bytes(source_size)?;
    let destination_bytes = quantity::quantity_bytes(&size)?;

    if destination_bytes < source_bytes {
        if force {
            warn!(
                source_size = %source_size.0,
                destination_size = %size.0,
                "Destination claim is smaller than the source, ignoring because of force"
            );
        } else {
            return Err(MigrationError::DestinationTooSmall {
                source_size: source_size.0.clone(),
                destination_size: size.0,
            });
        }
    }

    let name = overrides.name.clone().unwrap_or_else(|| source.name_any());
    let access_modes = if overrides.access_modes.is_empty() {
        claim::access_modes(source)
    } else {
        overrides.access_modes.clone()
    };

    debug!(
        claim = %name,
        size = %size.0,
        storage_class = ?overrides.storage_class,
        ?access_modes,
        "built destination template"
    );

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: source.namespace(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_owned(), size)])),
                ..Default::default()
            }),
            storage_class_name: overrides.storage_class.clone(),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use pvshift_kube::fake;
    use rstest::rstest;

    use super::*;

    fn source() -> PersistentVolumeClaim {
        let mut source = fake::claim("apps", "data", "10Gi");
        if let Some(spec) = source.spec.as_mut() {
            spec.storage_class_name = Some("standard".to_owned());
        }
        source
    }

    #[test]
    fn no_overrides_keeps_the_source_shape() {
        let source = source();

        let destination =
            build_destination(&source, &DestinationOverrides::default(), false).unwrap();

        assert_eq!(destination.name_any(), "data");
        assert_eq!(destination.namespace().as_deref(), Some("apps"));
        assert_eq!(claim::requested_storage(&destination).unwrap().0, "10Gi");
        assert_eq!(claim::access_modes(&destination), claim::access_modes(&source));
        assert_eq!(claim::storage_class(&destination), None);
        assert!(destination.metadata.uid.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let overrides = DestinationOverrides {
            name: Some("data-fast".to_owned()),
            storage_class: Some("ssd".to_owned()),
            size: Some("20Gi".to_owned()),
            access_modes: vec!["ReadWriteMany".to_owned()],
        };

        let destination = build_destination(&source(), &overrides, false).unwrap();

        assert_eq!(destination.name_any(), "data-fast");
        assert_eq!(claim::requested_storage(&destination).unwrap().0, "20Gi");
        assert_eq!(claim::storage_class(&destination), Some("ssd"));
        assert_eq!(claim::access_modes(&destination), ["ReadWriteMany"]);
    }

    #[rstest]
    #[case("5Gi")]
    #[case("10G")]
    #[case("10737418239")]
    fn smaller_destination_is_rejected(#[case] size: &str) {
        let overrides = DestinationOverrides {
            size: Some(size.to_owned()),
            ..Default::default()
        };

        let result = build_destination(&source(), &overrides, false);

        assert!(matches!(
            result,
            Err(MigrationError::DestinationTooSmall { destination_size, .. }) if destination_size == size
        ));
    }

    #[rstest]
    #[case("10Gi")]
    #[case("10737418240")]
    #[case("11G")]
    fn equal_or_larger_destination_is_accepted(#[case] size: &str) {
        let overrides = DestinationOverrides {
            size: Some(size.to_owned()),
            ..Default::default()
        };

        assert!(build_destination(&source(), &overrides, false).is_ok());
    }

    #[test]
    fn force_keeps_the_smaller_size() {
        let overrides = DestinationOverrides {
            size: Some("5Gi".to_owned()),
            ..Default::default()
        };

        let destination = build_destination(&source(), &overrides, true).unwrap();

        assert_eq!(claim::requested_storage(&destination).unwrap().0, "5Gi");
    }

    #[test]
    fn invalid_size_is_a_validation_error() {
        let overrides = DestinationOverrides {
            size: Some("ten gigs".to_owned()),
            ..Default::default()
        };

        assert!(build_destination(&source(), &overrides, true).is_err());
    }
}

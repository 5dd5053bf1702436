//! Revision tracking for managed objects
//!
//! Every object the operator writes carries the [`REVISION_LABEL`] label set to
//! the cluster generation it was converged to.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label recording the generation an object was last converged to
pub const REVISION_LABEL: &str = "revision-hash";

/// Revision label value of `meta`, if any
pub fn revision_of(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(REVISION_LABEL))
        .map(String::as_str)
}

/// Label value for a generation
pub fn revision_value(generation: i64) -> String {
    generation.to_string()
}

/// True iff the deployment was last converged to `generation`.
///
/// A missing label counts as not updated.
pub fn is_updated(deployment: &Deployment, generation: i64) -> bool {
    revision_of(&deployment.metadata) == Some(revision_value(generation).as_str())
}

/// True iff the deployment is scaled to zero
pub fn is_paused(deployment: &Deployment) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .is_some_and(|replicas| replicas == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use std::collections::BTreeMap;

    fn deployment(revision: Option<&str>, replicas: Option<i32>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("orchest-api".to_string()),
                labels: revision.map(|r| {
                    BTreeMap::from([(REVISION_LABEL.to_string(), r.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_updated() {
        assert!(is_updated(&deployment(Some("3"), Some(1)), 3));
        assert!(!is_updated(&deployment(Some("2"), Some(1)), 3));
    }

    #[test]
    fn test_missing_label_is_not_updated() {
        assert!(!is_updated(&deployment(None, Some(1)), 1));
        assert!(!is_updated(&Deployment::default(), 0));
    }

    #[test]
    fn test_is_paused() {
        assert!(is_paused(&deployment(Some("1"), Some(0))));
        assert!(!is_paused(&deployment(Some("1"), Some(2))));
        // Unset replicas default to one on the server
        assert!(!is_paused(&deployment(Some("1"), None)));
        assert!(!is_paused(&Deployment::default()));
    }
}

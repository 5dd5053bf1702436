//! Create-or-converge of desired objects
//!
//! Generic objects are converged with a field-level JSON patch that only
//! touches the fields the desired object sets. Deployments and services use
//! spec replacement keyed on the revision label.

use crate::error::{OperatorError, Result, ResultExt};
use crate::resources::ManagedObject;
use crate::revision::revision_of;
use crate::store::{object_identity, StoreClient};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What an upsert had to do to converge an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The object did not exist and was created
    Created,
    /// The live object already matched
    Unchanged,
    /// A field-level patch was applied
    Patched,
    /// The spec was replaced through an update
    Replaced,
}

/// Converges desired objects against the store
#[derive(Clone)]
pub struct Upserter {
    store: Arc<dyn StoreClient>,
}

impl Upserter {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Converge one managed object with the strategy matching its kind
    pub async fn apply(&self, namespace: &str, object: &ManagedObject) -> Result<Convergence> {
        let outcome = match object {
            ManagedObject::Deployment(d) => self.upsert_deployment(namespace, d).await?,
            ManagedObject::Service(s) => self.upsert_service(namespace, s).await?,
            ManagedObject::Object(o) => self.upsert_object(o).await?,
        };
        debug!(object = %object.describe(), outcome = ?outcome, "Converged object");
        Ok(outcome)
    }

    /// Create `desired`, or patch the live copy towards it.
    ///
    /// Fields only present on the live object are left alone.
    pub async fn upsert_object(&self, desired: &DynamicObject) -> Result<Convergence> {
        let (kind, namespace, name) = object_identity(desired);
        let target = || format!("failed to upsert {} {}/{}", kind, namespace, name);

        match self.store.create_object(desired).await {
            Ok(()) => return Ok(Convergence::Created),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.context(target())),
        }

        let live = self.store.get_object(desired).await.with_context(target)?;

        let live_value = to_value(&live).with_context(target)?;
        let desired_value = to_value(desired).with_context(target)?;
        if live_value == desired_value {
            return Ok(Convergence::Unchanged);
        }

        let Some(patch) = field_patch(&live_value, &desired_value) else {
            return Ok(Convergence::Unchanged);
        };

        debug!(
            kind = %kind,
            name = %name,
            operations = patch.0.len(),
            "Patching drifted object"
        );
        self.store
            .patch_object(desired, &patch)
            .await
            .with_context(target)?;
        Ok(Convergence::Patched)
    }

    /// Create the deployment, or replace its spec and labels when the
    /// revision or the desired spec fields differ from the live copy
    pub async fn upsert_deployment(
        &self,
        namespace: &str,
        desired: &Deployment,
    ) -> Result<Convergence> {
        let name = desired.metadata.name.as_deref().unwrap_or_default();
        let target = || format!("failed to upsert Deployment {}/{}", namespace, name);

        let mut live = match self.store.get_deployment(namespace, name).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                match self.store.create_deployment(namespace, desired).await {
                    Ok(()) => return Ok(Convergence::Created),
                    Err(e) if e.is_already_exists() => self
                        .store
                        .get_deployment(namespace, name)
                        .await
                        .with_context(target)?,
                    Err(e) => return Err(e.context(target())),
                }
            }
            Err(e) => return Err(e.context(target())),
        };

        let revision_changed = revision_of(&live.metadata) != revision_of(&desired.metadata);
        let spec_changed = field_patch(
            &to_value(&live.spec).with_context(target)?,
            &to_value(&desired.spec).with_context(target)?,
        )
        .is_some();

        if !revision_changed && !spec_changed {
            return Ok(Convergence::Unchanged);
        }

        live.spec = desired.spec.clone();
        live.metadata.labels = desired.metadata.labels.clone();
        self.store
            .update_deployment(namespace, &live)
            .await
            .with_context(target)?;
        Ok(Convergence::Replaced)
    }

    /// Create the service, or replace its spec and labels on revision
    /// mismatch. Cluster IPs allocated by the server are kept.
    pub async fn upsert_service(&self, namespace: &str, desired: &Service) -> Result<Convergence> {
        let name = desired.metadata.name.as_deref().unwrap_or_default();
        let target = || format!("failed to upsert Service {}/{}", namespace, name);

        let mut live = match self.store.get_service(namespace, name).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                match self.store.create_service(namespace, desired).await {
                    Ok(()) => return Ok(Convergence::Created),
                    Err(e) if e.is_already_exists() => self
                        .store
                        .get_service(namespace, name)
                        .await
                        .with_context(target)?,
                    Err(e) => return Err(e.context(target())),
                }
            }
            Err(e) => return Err(e.context(target())),
        };

        if revision_of(&live.metadata) == revision_of(&desired.metadata) {
            return Ok(Convergence::Unchanged);
        }

        let allocated = live
            .spec
            .as_ref()
            .map(|s| (s.cluster_ip.clone(), s.cluster_ips.clone()));
        let mut spec = desired.spec.clone();
        if let (Some(spec), Some((cluster_ip, cluster_ips))) = (spec.as_mut(), allocated) {
            spec.cluster_ip = cluster_ip;
            spec.cluster_ips = cluster_ips;
        }

        live.spec = spec;
        live.metadata.labels = desired.metadata.labels.clone();
        self.store
            .update_service(namespace, &live)
            .await
            .with_context(target)?;
        Ok(Convergence::Replaced)
    }
}

fn to_value<T: Serialize>(object: &T) -> Result<Value> {
    serde_json::to_value(object).map_err(OperatorError::from)
}

/// Patch moving `live` to carry every field `desired` sets, or `None` when
/// nothing would change
fn field_patch(live: &Value, desired: &Value) -> Option<json_patch::Patch> {
    let mut merged = live.clone();
    json_patch::merge(&mut merged, desired);
    if &merged == live {
        return None;
    }
    let patch = json_patch::diff(live, &merged);
    (!patch.0.is_empty()).then_some(patch)
}

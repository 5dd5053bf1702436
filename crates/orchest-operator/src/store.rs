//! Store client abstraction
//!
//! Every read and write the reconciler performs goes through [`StoreClient`].
//! [`KubeStore`] implements it on top of the Kubernetes API; tests use the
//! generated `MockStoreClient` or an in-memory fake.

use crate::crd::{OrchestCluster, OrchestClusterStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "orchest-operator";

/// Trait abstracting the object store used by the reconciler
///
/// Lookups of missing objects fail with [`OperatorError::NotFound`] and
/// creation of existing objects fails with [`OperatorError::AlreadyExists`];
/// every other failure is a transport error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch the cluster resource
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<OrchestCluster>;

    /// Replace the status subresource of the cluster
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OrchestClusterStatus,
    ) -> Result<()>;

    /// Remove one annotation from the cluster resource
    async fn remove_cluster_annotation(&self, namespace: &str, name: &str, key: &str)
        -> Result<()>;

    /// List deployments matching a label selector
    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;

    /// Fetch a deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Create a deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Replace a deployment
    async fn update_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Set the replica count of a deployment
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Fetch a service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// Replace a service
    async fn update_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// Fetch a persistent volume claim
    async fn get_volume(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    /// Create a persistent volume claim
    async fn create_volume(&self, namespace: &str, volume: &PersistentVolumeClaim) -> Result<()>;

    /// Fetch the live copy of an arbitrary object, identified by the
    /// apiVersion, kind, namespace and name of `object`
    async fn get_object(&self, object: &DynamicObject) -> Result<DynamicObject>;

    /// Create an arbitrary object
    async fn create_object(&self, object: &DynamicObject) -> Result<()>;

    /// Apply a JSON patch to the live copy of `object`
    async fn patch_object(&self, object: &DynamicObject, patch: &json_patch::Patch)
        -> Result<()>;
}

/// Identity of a dynamic object, used for error reporting
pub fn object_identity(object: &DynamicObject) -> (String, String, String) {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_else(|| "Object".to_string());
    let namespace = object.metadata.namespace.clone().unwrap_or_default();
    let name = object.metadata.name.clone().unwrap_or_default();
    (kind, namespace, name)
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    if let Some(idx) = api_version.rfind('/') {
        (&api_version[..idx], &api_version[idx + 1..])
    } else {
        ("", api_version)
    }
}

/// Real store implementation backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, object: &DynamicObject) -> Result<(Api<DynamicObject>, String)> {
        let types = object.types.as_ref().ok_or_else(|| {
            OperatorError::InvalidConfig("object is missing apiVersion/kind".to_string())
        })?;
        let name = object.metadata.name.clone().ok_or_else(|| {
            OperatorError::InvalidConfig(format!("{} is missing metadata.name", types.kind))
        })?;

        let (group, version) = parse_api_version(&types.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let ar = ApiResource::from_gvk(&gvk);

        let api = match object.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, name))
    }
}

fn required_name<'a>(name: &'a Option<String>, kind: &str) -> Result<&'a str> {
    name.as_deref()
        .ok_or_else(|| OperatorError::InvalidConfig(format!("{} missing metadata.name", kind)))
}

#[async_trait]
impl StoreClient for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<OrchestCluster> {
        let api: Api<OrchestCluster> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, "OrchestCluster", namespace, name))
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OrchestClusterStatus,
    ) -> Result<()> {
        let api: Api<OrchestCluster> = Api::namespaced(self.client.clone(), namespace);

        debug!(name = %name, phase = %status.phase, "Updating cluster status");

        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, "OrchestCluster", namespace, name))?;

        Ok(())
    }

    async fn remove_cluster_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<()> {
        let api: Api<OrchestCluster> = Api::namespaced(self.client.clone(), namespace);

        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    key: null
                }
            }
        });

        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, "OrchestCluster", namespace, name))?;

        Ok(())
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        let list = api.list(&lp).await?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Deployment", namespace, name))
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let name = required_name(&deployment.metadata.name, "Deployment")?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Deployment", namespace, name))?;
        Ok(())
    }

    async fn update_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let name = required_name(&deployment.metadata.name, "Deployment")?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), deployment)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Deployment", namespace, name))?;
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": {
                "replicas": replicas
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_kube(e, "Deployment", namespace, name))?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Service", namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = required_name(&service.metadata.name, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Service", namespace, name))?;
        Ok(())
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = required_name(&service.metadata.name, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), service)
            .await
            .map_err(|e| OperatorError::from_kube(e, "Service", namespace, name))?;
        Ok(())
    }

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| OperatorError::from_kube(e, "PersistentVolumeClaim", namespace, name))
    }

    async fn create_volume(&self, namespace: &str, volume: &PersistentVolumeClaim) -> Result<()> {
        let name = required_name(&volume.metadata.name, "PersistentVolumeClaim")?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), volume)
            .await
            .map_err(|e| OperatorError::from_kube(e, "PersistentVolumeClaim", namespace, name))?;
        Ok(())
    }

    async fn get_object(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let (api, name) = self.dynamic_api(object)?;
        let (kind, namespace, _) = object_identity(object);
        api.get(&name)
            .await
            .map_err(|e| OperatorError::from_kube(e, &kind, &namespace, &name))
    }

    async fn create_object(&self, object: &DynamicObject) -> Result<()> {
        let (api, name) = self.dynamic_api(object)?;
        let (kind, namespace, _) = object_identity(object);
        api.create(&PostParams::default(), object)
            .await
            .map_err(|e| OperatorError::from_kube(e, &kind, &namespace, &name))?;
        Ok(())
    }

    async fn patch_object(
        &self,
        object: &DynamicObject,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let (api, name) = self.dynamic_api(object)?;
        let (kind, namespace, _) = object_identity(object);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&name, &params, &Patch::<()>::Json(patch.clone()))
            .await
            .map_err(|e| OperatorError::from_kube(e, &kind, &namespace, &name))?;
        Ok(())
    }
}

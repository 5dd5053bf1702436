//! In-memory store for reconcile scenarios in tests
//!
//! Writes are recorded as `"<operation> <name>"` strings so tests can assert
//! on the order of side effects. Reads are not recorded.

use crate::crd::{OrchestCluster, OrchestClusterStatus, OrchestPhase};
use crate::error::{OperatorError, Result};
use crate::readiness::ReadinessOracle;
use crate::revision::{revision_value, REVISION_LABEL};
use crate::store::{object_identity, StoreClient};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<Key, OrchestCluster>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    volumes: BTreeMap<Key, PersistentVolumeClaim>,
    objects: BTreeMap<(String, String, String), DynamicObject>,
    calls: Vec<String>,
    phases: Vec<OrchestPhase>,
    fail_status: bool,
    unready: HashSet<String>,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put_cluster(&self, cluster: OrchestCluster) {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.state().clusters.insert(key(&namespace, &name), cluster);
    }

    /// Current copy of the cluster named `name`
    pub fn cluster(&self, name: &str) -> OrchestCluster {
        self.state()
            .clusters
            .values()
            .find(|c| c.metadata.name.as_deref() == Some(name))
            .cloned()
            .unwrap()
    }

    /// Seed a live component deployment converged to `revision`
    pub fn put_component(&self, cluster: &OrchestCluster, name: &str, revision: i64, replicas: i32) {
        let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();

        let mut labels = cluster.spec.get_labels(&cluster_name, name);
        labels.insert(REVISION_LABEL.to_string(), revision_value(revision));

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state()
            .deployments
            .insert(key(&namespace, name), deployment);
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state()
            .deployments
            .values()
            .find(|d| d.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    /// Make every status write fail
    pub fn fail_status_updates(&self) {
        self.state().fail_status = true;
    }

    /// Keep `component` from ever reporting ready
    pub fn set_unready(&self, component: &str) {
        self.state().unready.insert(component.to_string());
    }

    /// Recorded writes, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Recorded writes of one operation, as target names
    pub fn calls_of(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{} ", operation);
        self.state()
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix))
            .map(|rest| rest.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    /// Deployments scaled to zero, in call order
    pub fn scale_calls(&self) -> Vec<String> {
        self.calls_of("scale_deployment")
    }

    /// Every phase written to the status, oldest first
    pub fn phase_history(&self) -> Vec<OrchestPhase> {
        self.state().phases.clone()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .all(|(k, v)| labels.and_then(|l| l.get(k)).map(String::as_str) == Some(v))
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl StoreClient for FakeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<OrchestCluster> {
        self.state()
            .clusters
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| OperatorError::not_found("OrchestCluster", namespace, name))
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &OrchestClusterStatus,
    ) -> Result<()> {
        let mut state = self.state();
        if state.fail_status {
            return Err(OperatorError::InvalidConfig("status writes are failing".to_string()));
        }
        let cluster = state
            .clusters
            .get_mut(&key(namespace, name))
            .ok_or_else(|| OperatorError::not_found("OrchestCluster", namespace, name))?;
        cluster.status = Some(status.clone());
        state.phases.push(status.phase);
        state
            .calls
            .push(format!("patch_cluster_status {} {}", name, status.phase));
        Ok(())
    }

    async fn remove_cluster_annotation(
        &self,
        namespace: &str,
        name: &str,
        annotation: &str,
    ) -> Result<()> {
        let mut state = self.state();
        let cluster = state
            .clusters
            .get_mut(&key(namespace, name))
            .ok_or_else(|| OperatorError::not_found("OrchestCluster", namespace, name))?;
        if let Some(annotations) = cluster.metadata.annotations.as_mut() {
            annotations.remove(annotation);
        }
        state
            .calls
            .push(format!("remove_cluster_annotation {} {}", name, annotation));
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .state()
            .deployments
            .iter()
            .filter(|((ns, _), d)| ns == namespace && matches_selector(d.metadata.labels.as_ref(), selector))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.state()
            .deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| OperatorError::not_found("Deployment", namespace, name))
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let name = name_of(&deployment.metadata);
        let mut state = self.state();
        if state.deployments.contains_key(&key(namespace, &name)) {
            return Err(OperatorError::already_exists("Deployment", namespace, &name));
        }
        state
            .deployments
            .insert(key(namespace, &name), deployment.clone());
        state.calls.push(format!("create_deployment {}", name));
        Ok(())
    }

    async fn update_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        let name = name_of(&deployment.metadata);
        let mut state = self.state();
        let live = state
            .deployments
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| OperatorError::not_found("Deployment", namespace, &name))?;
        *live = deployment.clone();
        state.calls.push(format!("update_deployment {}", name));
        Ok(())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = self.state();
        let live = state
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| OperatorError::not_found("Deployment", namespace, name))?;
        live.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        state
            .calls
            .push(format!("scale_deployment {} {}", name, replicas));
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.state()
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| OperatorError::not_found("Service", namespace, name))
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = name_of(&service.metadata);
        let mut state = self.state();
        if state.services.contains_key(&key(namespace, &name)) {
            return Err(OperatorError::already_exists("Service", namespace, &name));
        }
        state.services.insert(key(namespace, &name), service.clone());
        state.calls.push(format!("create_service {}", name));
        Ok(())
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let name = name_of(&service.metadata);
        let mut state = self.state();
        let live = state
            .services
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| OperatorError::not_found("Service", namespace, &name))?;
        *live = service.clone();
        state.calls.push(format!("update_service {}", name));
        Ok(())
    }

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.state()
            .volumes
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| OperatorError::not_found("PersistentVolumeClaim", namespace, name))
    }

    async fn create_volume(&self, namespace: &str, volume: &PersistentVolumeClaim) -> Result<()> {
        let name = name_of(&volume.metadata);
        let mut state = self.state();
        if state.volumes.contains_key(&key(namespace, &name)) {
            return Err(OperatorError::already_exists("PersistentVolumeClaim", namespace, &name));
        }
        state.volumes.insert(key(namespace, &name), volume.clone());
        state.calls.push(format!("create_volume {}", name));
        Ok(())
    }

    async fn get_object(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let (kind, namespace, name) = object_identity(object);
        self.state()
            .objects
            .get(&(kind.clone(), namespace.clone(), name.clone()))
            .cloned()
            .ok_or_else(|| OperatorError::not_found(&kind, &namespace, &name))
    }

    async fn create_object(&self, object: &DynamicObject) -> Result<()> {
        let id = object_identity(object);
        let mut state = self.state();
        if state.objects.contains_key(&id) {
            return Err(OperatorError::already_exists(&id.0, &id.1, &id.2));
        }
        state.calls.push(format!("create_object {}/{}", id.0, id.2));
        state.objects.insert(id, object.clone());
        Ok(())
    }

    async fn patch_object(
        &self,
        object: &DynamicObject,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let id = object_identity(object);
        let mut state = self.state();
        let live = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| OperatorError::not_found(&id.0, &id.1, &id.2))?;

        let mut doc = serde_json::to_value(&*live)?;
        json_patch::patch(&mut doc, &patch.0)
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;
        *live = serde_json::from_value(doc)?;
        state.calls.push(format!("patch_object {}/{}", id.0, id.2));
        Ok(())
    }
}

/// Ready once the deployment exists with a non-zero replica count
#[async_trait]
impl ReadinessOracle for FakeStore {
    async fn is_ready(&self, namespace: &str, component: &str) -> Result<bool> {
        let state = self.state();
        if state.unready.contains(component) {
            return Ok(false);
        }
        Ok(state
            .deployments
            .get(&key(namespace, component))
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.replicas)
            .is_some_and(|r| r > 0))
    }
}

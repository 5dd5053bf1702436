//! Orchest components and their deployment plan
//!
//! Each component has a [`ComponentDeployer`] that knows its manifests. The
//! [`ComponentPlan`] fixes the order in which components are brought up;
//! shutdown walks the same plan backwards.

use crate::crd::OrchestCluster;
use crate::error::{Result, ResultExt};
use crate::readiness::ReadinessWaiter;
use crate::resources::{ManagedObject, ResourceBuilder};
use crate::upsert::Upserter;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// One deployable part of an Orchest cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Database,
    RabbitMq,
    CeleryWorker,
    OrchestApi,
    AuthServer,
    Webserver,
}

impl Component {
    /// Name of the component's Deployment, Service and container
    pub fn name(self) -> &'static str {
        match self {
            Component::Database => "orchest-database",
            Component::RabbitMq => "rabbitmq-server",
            Component::CeleryWorker => "celery-worker",
            Component::OrchestApi => "orchest-api",
            Component::AuthServer => "auth-server",
            Component::Webserver => "orchest-webserver",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collaborators a deployer needs to converge its component
#[derive(Clone)]
pub struct DeployContext {
    pub upserter: Upserter,
    pub waiter: ReadinessWaiter,
}

/// Deploys a single component
#[async_trait]
pub trait ComponentDeployer: Send + Sync {
    /// Component handled by this deployer
    fn component(&self) -> Component;

    /// Desired objects of the component at `generation`
    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>>;

    /// Converge every manifest, then wait for the component to become ready
    async fn deploy(
        &self,
        ctx: &DeployContext,
        generation: i64,
        cluster: &OrchestCluster,
    ) -> Result<()> {
        let component = self.component();
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");

        for object in self.manifests(generation, cluster)? {
            ctx.upserter
                .apply(namespace, &object)
                .await
                .with_context(|| format!("failed to apply {} of {}", object.describe(), component))?;
        }

        debug!(component = %component, "Waiting for component readiness");
        ctx.waiter.wait_ready(namespace, component.name()).await?;

        info!(component = %component, generation, "Component deployed");
        Ok(())
    }
}

pub struct DatabaseDeployer;

impl ComponentDeployer for DatabaseDeployer {
    fn component(&self) -> Component {
        Component::Database
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        Ok(ResourceBuilder::new(cluster, generation)?.database_manifests())
    }
}

pub struct RabbitMqDeployer;

impl ComponentDeployer for RabbitMqDeployer {
    fn component(&self) -> Component {
        Component::RabbitMq
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        Ok(ResourceBuilder::new(cluster, generation)?.rabbitmq_manifests())
    }
}

pub struct CeleryWorkerDeployer;

impl ComponentDeployer for CeleryWorkerDeployer {
    fn component(&self) -> Component {
        Component::CeleryWorker
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        Ok(ResourceBuilder::new(cluster, generation)?.celery_worker_manifests())
    }
}

pub struct OrchestApiDeployer;

impl ComponentDeployer for OrchestApiDeployer {
    fn component(&self) -> Component {
        Component::OrchestApi
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        ResourceBuilder::new(cluster, generation)?.orchest_api_manifests()
    }
}

pub struct AuthServerDeployer;

impl ComponentDeployer for AuthServerDeployer {
    fn component(&self) -> Component {
        Component::AuthServer
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        Ok(ResourceBuilder::new(cluster, generation)?.auth_server_manifests())
    }
}

pub struct WebserverDeployer;

impl ComponentDeployer for WebserverDeployer {
    fn component(&self) -> Component {
        Component::Webserver
    }

    fn manifests(&self, generation: i64, cluster: &OrchestCluster) -> Result<Vec<ManagedObject>> {
        Ok(ResourceBuilder::new(cluster, generation)?.webserver_manifests())
    }
}

/// Immutable, ordered set of component deployers
#[derive(Clone)]
pub struct ComponentPlan {
    deployers: Vec<Arc<dyn ComponentDeployer>>,
}

impl ComponentPlan {
    /// Plan deploying `deployers` in the given order
    pub fn new(deployers: Vec<Arc<dyn ComponentDeployer>>) -> Self {
        Self { deployers }
    }

    /// The Orchest deployment order: database, broker, workers, API, auth
    /// server, web front-end
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(DatabaseDeployer),
            Arc::new(RabbitMqDeployer),
            Arc::new(CeleryWorkerDeployer),
            Arc::new(OrchestApiDeployer),
            Arc::new(AuthServerDeployer),
            Arc::new(WebserverDeployer),
        ])
    }

    /// Deployers in deployment order
    pub fn deployers(&self) -> impl DoubleEndedIterator<Item = &Arc<dyn ComponentDeployer>> {
        self.deployers.iter()
    }

    /// Deployers in shutdown order
    pub fn shutdown_order(&self) -> impl Iterator<Item = &Arc<dyn ComponentDeployer>> {
        self.deployers.iter().rev()
    }

    /// Components in deployment order
    pub fn components(&self) -> Vec<Component> {
        self.deployers.iter().map(|d| d.component()).collect()
    }
}

impl Default for ComponentPlan {
    fn default() -> Self {
        Self::standard()
    }
}

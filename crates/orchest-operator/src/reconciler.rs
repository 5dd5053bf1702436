//! Per-cluster reconciliation
//!
//! One invocation fetches the cluster, pauses it when required, ensures the
//! supporting volumes and then walks the component plan, deploying missing
//! components and redeploying stale or paused ones. Every step is safe to
//! repeat: a failed invocation is simply run again by the controller.

use crate::components::{ComponentPlan, DeployContext};
use crate::crd::{OrchestCluster, OrchestPhase};
use crate::error::{OperatorError, Result, ResultExt};
use crate::pause::{live_components, PauseController};
use crate::readiness::{ReadinessOracle, ReadinessWaiter, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL};
use crate::revision::{is_paused, is_updated};
use crate::status::{StatusRecorder, UpdatePolicy};
use crate::store::StoreClient;
use crate::upsert::Upserter;
use crate::volumes::{VolumeEnsurer, VolumeState};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

/// Namespace-qualified name of a cluster, written `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing cluster object
    pub fn from_cluster(cluster: &OrchestCluster) -> Result<Self> {
        let name = cluster
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("cluster name is required".to_string()))?;
        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Ok(Self { namespace, name })
    }
}

impl FromStr for ClusterKey {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(OperatorError::InvalidConfig(format!(
                "invalid cluster key '{}', expected namespace/name",
                s
            ))),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Runtime tunables of the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between two readiness checks
    pub poll_interval: Duration,
    /// Readiness checks per component before giving up
    pub max_retries: u32,
    /// Periodic requeue of healthy clusters
    pub requeue_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            requeue_interval: Duration::from_secs(300),
        }
    }
}

/// Converges one OrchestCluster per invocation
pub struct OrchestReconciler {
    store: Arc<dyn StoreClient>,
    recorder: StatusRecorder,
    pauser: PauseController,
    volumes: VolumeEnsurer,
    plan: ComponentPlan,
    deploy: DeployContext,
}

impl OrchestReconciler {
    pub fn new(
        store: Arc<dyn StoreClient>,
        oracle: Arc<dyn ReadinessOracle>,
        plan: ComponentPlan,
        config: &ReconcilerConfig,
    ) -> Self {
        let recorder = StatusRecorder::new(store.clone());
        Self {
            pauser: PauseController::new(store.clone(), recorder.clone(), plan.clone()),
            volumes: VolumeEnsurer::new(store.clone()),
            deploy: DeployContext {
                upserter: Upserter::new(store.clone()),
                waiter: ReadinessWaiter::new(oracle, config.poll_interval, config.max_retries),
            },
            recorder,
            plan,
            store,
        }
    }

    /// Run one reconciliation of the cluster identified by `key`.
    ///
    /// A cluster that no longer exists is not an error.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ClusterKey) -> Result<()> {
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());

        let cluster = match self.store.get_cluster(namespace, name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                debug!("Cluster no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to fetch cluster {}", key))),
        };

        let cluster = if self.pauser.should_pause(&cluster).await? {
            self.pauser
                .pause(&cluster)
                .await
                .with_context(|| format!("failed to pause the cluster {}", key))?
        } else {
            cluster
        };

        if cluster.pause_requested() {
            info!("Cluster is paused");
            return Ok(());
        }

        cluster
            .spec
            .validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;

        let generation = cluster.generation();

        for (volume, state) in self.volumes.ensure_all(&cluster, generation).await? {
            if let VolumeState::Drifted { found } = state {
                self.report_volume_drift(key, volume, found.as_deref(), generation)
                    .await;
            }
        }

        let live = live_components(self.store.as_ref(), &cluster).await?;

        for deployer in self.plan.deployers() {
            let component = deployer.component();

            match live.get(component.name()) {
                None => {
                    self.recorder
                        .record(
                            namespace,
                            name,
                            OrchestPhase::DeployingOrchest,
                            &format!("Deploying {}", component),
                            UpdatePolicy::Fatal,
                        )
                        .await?;

                    deployer
                        .deploy(&self.deploy, generation, &cluster)
                        .await
                        .with_context(|| format!("failed to deploy {} component", component))?;
                }
                Some(deployment)
                    if !is_updated(deployment, generation) || is_paused(deployment) =>
                {
                    self.recorder
                        .record(
                            namespace,
                            name,
                            OrchestPhase::Upgrading,
                            &format!("Upgrading {}", component),
                            UpdatePolicy::Fatal,
                        )
                        .await?;

                    deployer
                        .deploy(&self.deploy, generation, &cluster)
                        .await
                        .with_context(|| format!("failed to update {} component", component))?;

                    self.recorder
                        .record(
                            namespace,
                            name,
                            OrchestPhase::Upgrading,
                            &format!("Upgraded {}", component),
                            UpdatePolicy::BestEffort,
                        )
                        .await?;
                }
                Some(_) => {
                    debug!(component = %component, "Component is current");
                }
            }
        }

        self.recorder
            .record(
                namespace,
                name,
                OrchestPhase::Running,
                "Orchest is running",
                UpdatePolicy::Fatal,
            )
            .await?;

        info!(generation, "Cluster is running");
        Ok(())
    }

    async fn report_volume_drift(
        &self,
        key: &ClusterKey,
        volume: &'static str,
        found: Option<&str>,
        generation: i64,
    ) {
        let message = format!(
            "{} was created for generation {}, current generation is {}",
            volume,
            found.unwrap_or("unknown"),
            generation
        );

        // Only newly surfaced drift is counted; the message stays until it changes
        match self
            .recorder
            .annotate(&key.namespace, &key.name, &message)
            .await
        {
            Ok(false) => {
                debug!(volume = %volume, "Volume drift already reported");
            }
            Ok(true) => {
                warn!(
                    volume = %volume,
                    found = ?found,
                    expected = generation,
                    "Volume claim belongs to another generation; it is not migrated"
                );
                metrics::counter!("orchest_operator_volume_drift_total", "volume" => volume)
                    .increment(1);
            }
            Err(e) => {
                warn!(volume = %volume, error = %e, "Failed to record volume drift");
            }
        }
    }
}

//! Pause decisions and reverse-order shutdown

use crate::components::ComponentPlan;
use crate::crd::{components_selector, OrchestCluster, OrchestPhase, RESTART_ANNOTATION};
use crate::error::{OperatorError, Result, ResultExt};
use crate::revision::{is_paused, is_updated};
use crate::status::{StatusRecorder, UpdatePolicy};
use crate::store::StoreClient;
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Live component deployments of a cluster, keyed by name
pub type LiveComponents = HashMap<String, Deployment>;

/// Fetch the live component deployments of `cluster`
pub async fn live_components(
    store: &dyn StoreClient,
    cluster: &OrchestCluster,
) -> Result<LiveComponents> {
    let (namespace, name) = cluster_ref(cluster)?;
    let deployments = store
        .list_deployments(namespace, &components_selector(name))
        .await
        .with_context(|| format!("failed to list deployments of {}/{}", namespace, name))?;

    Ok(deployments
        .into_iter()
        .filter_map(|d| d.metadata.name.clone().map(|n| (n, d)))
        .collect())
}

pub(crate) fn cluster_ref(cluster: &OrchestCluster) -> Result<(&str, &str)> {
    let name = cluster
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| OperatorError::InvalidConfig("cluster name is required".to_string()))?;
    let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
    Ok((namespace, name))
}

/// Why a pause is happening, used in status messages only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCause {
    Requested,
    Restart,
    SpecChanged,
}

impl PauseCause {
    fn of(cluster: &OrchestCluster) -> Self {
        if cluster.restart_requested() {
            PauseCause::Restart
        } else if cluster.pause_requested() {
            PauseCause::Requested
        } else {
            PauseCause::SpecChanged
        }
    }
}

impl fmt::Display for PauseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseCause::Requested => f.write_str("pause requested"),
            PauseCause::Restart => f.write_str("restart requested"),
            PauseCause::SpecChanged => f.write_str("spec changed"),
        }
    }
}

/// Decides whether a cluster must be paused and performs the pause
#[derive(Clone)]
pub struct PauseController {
    store: Arc<dyn StoreClient>,
    recorder: StatusRecorder,
    plan: ComponentPlan,
}

impl PauseController {
    pub fn new(store: Arc<dyn StoreClient>, recorder: StatusRecorder, plan: ComponentPlan) -> Self {
        Self {
            store,
            recorder,
            plan,
        }
    }

    /// Whether `cluster` has to be paused before any further convergence
    pub async fn should_pause(&self, cluster: &OrchestCluster) -> Result<bool> {
        let phase = cluster.phase();

        // A previous invocation stopped half way; finish the pause first
        if phase.is_transitioning() {
            return Ok(true);
        }

        let generation = cluster.generation();
        let live = live_components(self.store.as_ref(), cluster).await?;
        if live.values().any(|d| !is_updated(d, generation)) {
            return Ok(true);
        }

        if cluster.restart_requested() {
            return Ok(true);
        }

        if phase == OrchestPhase::Paused {
            return Ok(false);
        }

        Ok(cluster.pause_requested())
    }

    /// Scale the live components down in reverse deployment order.
    ///
    /// Returns the cluster as it stands after the pause: restart annotation
    /// removed and phase `Paused`. Without live components nothing happens.
    pub async fn pause(&self, cluster: &OrchestCluster) -> Result<OrchestCluster> {
        let (namespace, name) = cluster_ref(cluster)?;
        let live = live_components(self.store.as_ref(), cluster).await?;

        let mut paused = cluster.clone();
        if live.is_empty() {
            debug!(cluster = %name, "No live components to pause");
            return Ok(paused);
        }

        let generation = cluster.generation();
        let restart = cluster.restart_requested();
        let force = restart || cluster.pause_requested();
        let cause = PauseCause::of(cluster);

        let targets: Vec<&str> = self
            .plan
            .shutdown_order()
            .map(|d| d.component().name())
            .filter(|component| {
                live.get(*component).is_some_and(|d| {
                    !is_paused(d) && (force || !is_updated(d, generation))
                })
            })
            .collect();

        if !targets.is_empty() {
            info!(cluster = %name, cause = %cause, components = ?targets, "Pausing cluster");
            self.recorder
                .record(
                    namespace,
                    name,
                    OrchestPhase::Pausing,
                    &format!("Pausing the cluster ({})", cause),
                    UpdatePolicy::Fatal,
                )
                .await?;
        }

        for component in targets {
            self.recorder
                .record(
                    namespace,
                    name,
                    OrchestPhase::Pausing,
                    &format!("Pausing {}", component),
                    UpdatePolicy::Fatal,
                )
                .await?;

            self.store
                .scale_deployment(namespace, component, 0)
                .await
                .with_context(|| format!("failed to pause {}", component))?;

            self.recorder
                .record(
                    namespace,
                    name,
                    OrchestPhase::Pausing,
                    &format!("Paused {}", component),
                    UpdatePolicy::Fatal,
                )
                .await?;
        }

        if restart {
            self.store
                .remove_cluster_annotation(namespace, name, RESTART_ANNOTATION)
                .await
                .with_context(|| "failed to remove the restart annotation".to_string())?;
            if let Some(annotations) = paused.metadata.annotations.as_mut() {
                annotations.remove(RESTART_ANNOTATION);
            }
        }

        self.recorder
            .record(
                namespace,
                name,
                OrchestPhase::Paused,
                "Paused the cluster",
                UpdatePolicy::Fatal,
            )
            .await?;

        paused
            .status
            .get_or_insert_with(Default::default)
            .phase = OrchestPhase::Paused;
        Ok(paused)
    }
}

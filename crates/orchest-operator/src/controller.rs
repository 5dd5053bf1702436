//! OrchestCluster Controller
//!
//! This module wires the [`OrchestReconciler`] into the kube-rs controller
//! runtime. It watches OrchestCluster resources and the Deployments they own,
//! and runs one reconciliation per cluster key at a time.

use crate::components::ComponentPlan;
use crate::crd::OrchestCluster;
use crate::error::{OperatorError, Result};
use crate::readiness::DeploymentReadiness;
use crate::reconciler::{ClusterKey, OrchestReconciler, ReconcilerConfig};
use crate::store::KubeStore;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller
pub struct ControllerContext {
    /// Reconciler shared by every cluster key
    pub reconciler: OrchestReconciler,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-cluster error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Requeue interval after a successful reconciliation
    pub requeue_interval: Duration,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("orchest_operator_reconciliations_total"),
            errors: metrics::counter!("orchest_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("orchest_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the OrchestCluster controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: ReconcilerConfig,
) -> Result<()> {
    let clusters: Api<OrchestCluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let deployments = match &namespace {
        Some(ns) => Api::<Deployment>::namespaced(client.clone(), ns),
        None => Api::<Deployment>::all(client.clone()),
    };

    let store = Arc::new(KubeStore::new(client));
    let oracle = Arc::new(DeploymentReadiness::new(store.clone()));

    let ctx = Arc::new(ControllerContext {
        reconciler: OrchestReconciler::new(store, oracle, ComponentPlan::standard(), &config),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
        requeue_interval: config.requeue_interval,
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_retries = config.max_retries,
        "Starting OrchestCluster controller"
    );

    Controller::new(clusters, Config::default())
        .owns(deployments, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
async fn reconcile(cluster: Arc<OrchestCluster>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = ClusterKey::from_cluster(&cluster)?;
    let result = ctx.reconciler.reconcile(&key).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(()) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&key.to_string());
            Ok(Action::requeue(ctx.requeue_interval))
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Delay before retrying a failed reconciliation.
///
/// Retryable errors back off exponentially from 30s up to 600s; errors that
/// need a spec change wait the full 600s.
pub fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    let max = Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS);
    match error.requeue_delay() {
        Some(base) => {
            // 30s → 60s → 120s → 240s → 480s → 600s (capped)
            let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
            backoff.min(max)
        }
        None => max,
    }
}

fn error_policy(
    cluster: Arc<OrchestCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = ClusterKey::from_cluster(&cluster)
        .map(|k| k.to_string())
        .unwrap_or_else(|_| cluster.name_any());
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

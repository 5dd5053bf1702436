//! # Orchest Kubernetes Operator
//!
//! Kubernetes operator that deploys and manages Orchest clusters.
//!
//! An `OrchestCluster` resource declares one Orchest installation in a
//! namespace. The operator converges it to six components, deployed in
//! dependency order, plus the volumes they share.
//!
//! ## Features
//!
//! - **Ordered deployment**: database, message broker, workers, API server,
//!   auth server and web front-end are brought up one at a time, each waiting
//!   for the previous one to become ready
//! - **Pause and resume**: `spec.orchest.pause` scales every component to
//!   zero in reverse order; clearing it brings them back
//! - **Upgrades**: a spec change bumps the generation; stale components are
//!   paused and redeployed with the new revision
//! - **Restarts**: the `orchest.io/restart` annotation cycles every component
//!   once and is removed afterwards
//! - **Drift correction**: managed objects are re-converged on every pass
//! - **Observability**: status phase and conditions on the resource,
//!   structured logs and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use orchest_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, None, ReconcilerConfig::default()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! Each reconciliation of a cluster runs these steps:
//!
//! 1. **Fetch** the cluster; a deleted cluster ends the pass
//! 2. **Pause** it when a pause, restart or spec change requires it
//! 3. **Ensure** the `userdir-pvc` and `image-builder-cache-pvc` volumes
//! 4. **Deploy** missing components and redeploy stale or paused ones, in order
//! 5. **Report** the cluster as `Running`
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`reconciler`] - Per-cluster reconciliation
//! - [`pause`] - Pause decisions and reverse-order shutdown
//! - [`components`] - Component plan and per-component deployers
//! - [`upsert`] - Create-or-converge of desired objects
//! - [`readiness`] - Bounded readiness polling
//! - [`volumes`] - Supporting volume claims
//! - [`status`] - Phase and condition bookkeeping
//! - [`revision`] - Revision labels of managed objects
//! - [`resources`] - Kubernetes resource builders
//! - [`store`] - Store client abstraction over the Kubernetes API
//! - [`controller`] - Controller runtime wiring
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: orchest.io/v1alpha1
//! kind: OrchestCluster
//! metadata:
//!   name: cluster-1
//!   namespace: orchest
//! spec:
//!   orchest:
//!     version: v2022.06.4
//!     pause: false
//!     resources:
//!       userDirVolumeSize: 50Gi
//!       builderCacheDirVolumeSize: 25Gi
//!   postgres:
//!     image: postgres:13.1
//!   rabbitmq:
//!     image: rabbitmq:3
//! ```
//!
//! ## Metrics
//!
//! - `orchest_operator_reconciliations_total` - Total reconciliation attempts
//! - `orchest_operator_reconciliation_errors_total` - Reconciliation errors
//! - `orchest_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `orchest_operator_volume_drift_total` - Newly reported volume revision drift

pub mod components;
pub mod controller;
pub mod crd;
pub mod error;
pub mod pause;
pub mod readiness;
pub mod reconciler;
pub mod resources;
pub mod revision;
pub mod status;
pub mod store;
pub mod upsert;
pub mod volumes;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::components::{Component, ComponentDeployer, ComponentPlan, DeployContext};
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::crd::{
        OrchestCluster, OrchestClusterCondition, OrchestClusterSpec, OrchestClusterStatus,
        OrchestPhase, OrchestResourcesSpec, OrchestSpec, ThirdPartySpec,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::pause::{PauseCause, PauseController};
    pub use crate::readiness::{DeploymentReadiness, ReadinessOracle, ReadinessWaiter};
    pub use crate::reconciler::{ClusterKey, OrchestReconciler, ReconcilerConfig};
    pub use crate::resources::{ManagedObject, ResourceBuilder};
    pub use crate::status::{StatusRecorder, UpdatePolicy};
    pub use crate::store::{KubeStore, StoreClient};
    pub use crate::upsert::{Convergence, Upserter};
    pub use crate::volumes::{VolumeEnsurer, VolumeState};
}

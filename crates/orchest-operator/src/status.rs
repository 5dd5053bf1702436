//! Cluster status bookkeeping

use crate::crd::OrchestPhase;
use crate::error::{OperatorError, Result};
use crate::store::StoreClient;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a failed status write affects the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// The failure aborts the reconcile
    Fatal,
    /// The failure is logged and ignored
    BestEffort,
}

/// Writes phase and condition updates to the cluster status
#[derive(Clone)]
pub struct StatusRecorder {
    store: Arc<dyn StoreClient>,
}

impl StatusRecorder {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Record `phase` with `message` on the cluster.
    ///
    /// The status is read fresh before each write; a record identical to the
    /// latest condition is not written again.
    pub async fn record(
        &self,
        namespace: &str,
        name: &str,
        phase: OrchestPhase,
        message: &str,
        policy: UpdatePolicy,
    ) -> Result<()> {
        match self.write(namespace, name, phase, message).await {
            Ok(()) => Ok(()),
            Err(e) if policy == UpdatePolicy::BestEffort => {
                warn!(
                    cluster = %name,
                    phase = %phase,
                    error = %e,
                    "Failed to record cluster status"
                );
                Ok(())
            }
            Err(e) => Err(OperatorError::StatusUpdate {
                phase: phase.to_string(),
                source: Box::new(e),
            }),
        }
    }

    /// Set a free-form message without changing the phase.
    ///
    /// Returns `false` when the cluster already carries `message`.
    pub async fn annotate(&self, namespace: &str, name: &str, message: &str) -> Result<bool> {
        let cluster = self.store.get_cluster(namespace, name).await?;
        let mut status = cluster.status.unwrap_or_default();
        if status.message.as_deref() == Some(message) {
            return Ok(false);
        }
        status.message = Some(message.to_string());
        self.store
            .patch_cluster_status(namespace, name, &status)
            .await?;
        Ok(true)
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        phase: OrchestPhase,
        message: &str,
    ) -> Result<()> {
        let cluster = self.store.get_cluster(namespace, name).await?;
        let mut status = cluster.status.unwrap_or_default();

        if !status.record(phase, message) {
            debug!(cluster = %name, phase = %phase, "Status already current");
            return Ok(());
        }

        debug!(cluster = %name, phase = %phase, message = %message, "Recording status");
        self.store.patch_cluster_status(namespace, name, &status).await
    }
}

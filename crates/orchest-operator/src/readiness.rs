//! Bounded readiness polling of deployed components

use crate::error::{OperatorError, Result};
use crate::store::StoreClient;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Default delay between two readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of readiness checks before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 30;

/// Answers whether a component is currently ready
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadinessOracle: Send + Sync {
    async fn is_ready(&self, namespace: &str, component: &str) -> Result<bool>;
}

/// Readiness derived from the status of the component's Deployment
pub struct DeploymentReadiness {
    store: Arc<dyn StoreClient>,
}

impl DeploymentReadiness {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }
}

/// True once the latest rollout of `deployment` is complete
pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);

    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
}

#[async_trait]
impl ReadinessOracle for DeploymentReadiness {
    async fn is_ready(&self, namespace: &str, component: &str) -> Result<bool> {
        let deployment = self.store.get_deployment(namespace, component).await?;
        Ok(deployment_is_ready(&deployment))
    }
}

/// Polls a [`ReadinessOracle`] with a bounded retry budget
#[derive(Clone)]
pub struct ReadinessWaiter {
    oracle: Arc<dyn ReadinessOracle>,
    interval: Duration,
    retries: u32,
}

impl ReadinessWaiter {
    pub fn new(oracle: Arc<dyn ReadinessOracle>, interval: Duration, retries: u32) -> Self {
        Self {
            oracle,
            interval,
            retries,
        }
    }

    /// Wait until `component` reports ready.
    ///
    /// The first check runs immediately; later checks follow `interval`
    /// apart. After `retries` negative checks the wait fails with
    /// [`OperatorError::ReadinessTimeout`]. Dropping the returned future
    /// abandons the wait.
    pub async fn wait_ready(&self, namespace: &str, component: &str) -> Result<()> {
        for attempt in 1..=self.retries {
            if self.oracle.is_ready(namespace, component).await? {
                info!(component = %component, attempt, "Component is ready");
                return Ok(());
            }

            debug!(
                component = %component,
                attempt,
                max_attempts = self.retries,
                "Component not ready yet"
            );

            if attempt < self.retries {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(OperatorError::ReadinessTimeout {
            component: component.to_string(),
            attempts: self.retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStoreClient;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rolled_out(replicas: i32, ready: i32, observed: i64) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("orchest-api".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(ready),
                ready_replicas: Some(ready),
                available_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_deployment_is_ready() {
        assert!(deployment_is_ready(&rolled_out(1, 1, 2)));
        assert!(!deployment_is_ready(&rolled_out(1, 0, 2)));
        // Status from an older rollout does not count
        assert!(!deployment_is_ready(&rolled_out(1, 1, 1)));
        assert!(!deployment_is_ready(&Deployment::default()));
    }

    #[tokio::test]
    async fn test_ready_on_first_poll() {
        let mut oracle = MockReadinessOracle::new();
        oracle.expect_is_ready().times(1).returning(|_, _| Ok(true));

        let waiter = ReadinessWaiter::new(Arc::new(oracle), Duration::ZERO, 30);
        waiter.wait_ready("orchest", "orchest-api").await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_after_k_polls() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let mut oracle = MockReadinessOracle::new();
        oracle.expect_is_ready().returning(move |_, _| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 4)
        });

        let waiter = ReadinessWaiter::new(Arc::new(oracle), Duration::from_millis(1), 30);
        waiter.wait_ready("orchest", "auth-server").await.unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_after_budget() {
        let mut oracle = MockReadinessOracle::new();
        oracle.expect_is_ready().times(5).returning(|_, _| Ok(false));

        let waiter = ReadinessWaiter::new(Arc::new(oracle), Duration::ZERO, 5);
        let err = waiter.wait_ready("orchest", "celery-worker").await.unwrap_err();
        match err {
            OperatorError::ReadinessTimeout {
                component,
                attempts,
            } => {
                assert_eq!(component, "celery-worker");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_oracle_error_aborts_wait() {
        let mut oracle = MockReadinessOracle::new();
        oracle
            .expect_is_ready()
            .times(1)
            .returning(|ns, name| Err(OperatorError::not_found("Deployment", ns, name)));

        let waiter = ReadinessWaiter::new(Arc::new(oracle), Duration::ZERO, 5);
        let err = waiter.wait_ready("orchest", "orchest-api").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_wait_cancels_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();

        let mut oracle = MockReadinessOracle::new();
        oracle.expect_is_ready().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        });

        let waiter = ReadinessWaiter::new(Arc::new(oracle), Duration::from_secs(1), 30);
        let result = tokio::time::timeout(
            Duration::from_millis(2500),
            waiter.wait_ready("orchest", "orchest-api"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deployment_readiness_reads_store() {
        let mut store = MockStoreClient::new();
        store
            .expect_get_deployment()
            .times(1)
            .returning(|ns, name| {
                assert_eq!((ns, name), ("orchest", "orchest-api"));
                Ok(rolled_out(1, 1, 2))
            });

        let oracle = DeploymentReadiness::new(Arc::new(store));
        assert!(oracle.is_ready("orchest", "orchest-api").await.unwrap());
    }
}

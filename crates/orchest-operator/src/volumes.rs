//! Supporting volume claims of a cluster
//!
//! Volumes are created once and never migrated. A claim created for an older
//! generation is reported as drifted and left untouched.

use crate::crd::OrchestCluster;
use crate::error::{Result, ResultExt};
use crate::resources::{ResourceBuilder, BUILDER_CACHE_VOLUME, USER_DIR_VOLUME};
use crate::revision::{revision_of, revision_value};
use crate::store::StoreClient;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of ensuring one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeState {
    Created,
    Current,
    /// The live claim carries another revision
    Drifted { found: Option<String> },
}

/// Ensures the user-dir and builder-cache volumes exist
#[derive(Clone)]
pub struct VolumeEnsurer {
    store: Arc<dyn StoreClient>,
}

impl VolumeEnsurer {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    /// Ensure both volumes; returns the name and state of each
    pub async fn ensure_all(
        &self,
        cluster: &OrchestCluster,
        generation: i64,
    ) -> Result<Vec<(&'static str, VolumeState)>> {
        let resources = &cluster.spec.orchest.resources;
        let volumes = [
            (USER_DIR_VOLUME, resources.user_dir_volume_size.as_str()),
            (
                BUILDER_CACHE_VOLUME,
                resources.builder_cache_dir_volume_size.as_str(),
            ),
        ];

        let mut states = Vec::with_capacity(volumes.len());
        for (name, size) in volumes {
            let state = self
                .ensure(cluster, generation, name, size)
                .await
                .with_context(|| format!("failed to ensure {} pvc", name))?;
            states.push((name, state));
        }
        Ok(states)
    }

    /// Ensure a single volume claim named `name` of `size`
    pub async fn ensure(
        &self,
        cluster: &OrchestCluster,
        generation: i64,
        name: &str,
        size: &str,
    ) -> Result<VolumeState> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");

        let live = match self.store.get_volume(namespace, name).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                let claim = ResourceBuilder::new(cluster, generation)?.build_volume(name, size);
                match self.store.create_volume(namespace, &claim).await {
                    Ok(()) => {
                        info!(volume = %name, size = %size, "Created volume claim");
                        return Ok(VolumeState::Created);
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(volume = %name, "Volume claim created concurrently");
                        return Ok(VolumeState::Current);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let expected = revision_value(generation);
        match revision_of(&live.metadata) {
            Some(found) if found == expected => Ok(VolumeState::Current),
            found => Ok(VolumeState::Drifted {
                found: found.map(str::to_string),
            }),
        }
    }
}

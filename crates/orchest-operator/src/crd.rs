//! Custom Resource Definitions for the Orchest Kubernetes Operator
//!
//! This module defines the `OrchestCluster` CRD that represents one Orchest
//! deployment (database, broker, workers, API, auth server and web front-end)
//! in a namespace.

use chrono::Utc;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API version of the OrchestCluster resource
pub const API_VERSION: &str = "orchest.io/v1alpha1";

/// Kind of the OrchestCluster resource
pub const KIND: &str = "OrchestCluster";

/// Annotation requesting a restart of every component
pub const RESTART_ANNOTATION: &str = "orchest.io/restart";

/// Regex for validating Kubernetes resource quantities (e.g., "10Gi", "100Mi")
static QUANTITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").unwrap());

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Validate a Kubernetes resource quantity string
fn validate_quantity(value: &str) -> Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate an optional Kubernetes name (RFC 1123 subdomain)
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 253 {
        return Err(ValidationError::new("name_too_long")
            .with_message("name exceeds 253 characters".into()));
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a container registry or image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// OrchestCluster custom resource definition
///
/// The operator watches these resources and converges the Orchest components
/// of the cluster to the declared specification.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "orchest.io",
    version = "v1alpha1",
    kind = "OrchestCluster",
    plural = "orchestclusters",
    shortname = "oc",
    namespaced,
    status = "OrchestClusterStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OrchestClusterSpec {
    /// Orchest application settings
    #[serde(default)]
    #[validate(nested)]
    pub orchest: OrchestSpec,

    /// Database settings
    #[serde(default = "default_postgres")]
    #[validate(nested)]
    pub postgres: ThirdPartySpec,

    /// Message broker settings
    #[serde(default = "default_rabbitmq")]
    #[validate(nested)]
    pub rabbitmq: ThirdPartySpec,
}

/// Settings of the Orchest-owned components
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrchestSpec {
    /// Orchest version, used as the image tag of Orchest components
    #[serde(default = "default_version")]
    #[validate(length(min = 1, max = 128, message = "version must be 1-128 characters"))]
    pub version: String,

    /// Registry hosting the Orchest images
    #[serde(default = "default_registry")]
    #[validate(custom(function = "validate_image"))]
    pub registry: String,

    /// Pause the cluster: every component is scaled to zero
    #[serde(default)]
    pub pause: Option<bool>,

    /// Storage settings
    #[serde(default)]
    #[validate(nested)]
    pub resources: OrchestResourcesSpec,
}

impl Default for OrchestSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            registry: default_registry(),
            pause: None,
            resources: OrchestResourcesSpec::default(),
        }
    }
}

/// Storage settings of the supporting volumes
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrchestResourcesSpec {
    /// Size of the user data volume
    #[serde(default = "default_user_dir_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub user_dir_volume_size: String,

    /// Size of the image builder cache volume
    #[serde(default = "default_builder_cache_size")]
    #[validate(custom(function = "validate_quantity"))]
    pub builder_cache_dir_volume_size: String,

    /// Storage class name (empty uses the cluster default)
    #[serde(default)]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub storage_class_name: Option<String>,
}

impl Default for OrchestResourcesSpec {
    fn default() -> Self {
        Self {
            user_dir_volume_size: default_user_dir_size(),
            builder_cache_dir_volume_size: default_builder_cache_size(),
            storage_class_name: None,
        }
    }
}

/// Settings of a third party component
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPartySpec {
    /// Full container image reference
    #[validate(length(min = 1, message = "image must not be empty"))]
    #[validate(custom(function = "validate_image"))]
    pub image: String,
}

/// Status of an OrchestCluster resource
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: OrchestPhase,

    /// Progress records, oldest first, at most one per phase
    #[serde(default)]
    pub conditions: Vec<OrchestClusterCondition>,

    /// Warning surfaced to the user, if any
    #[serde(default)]
    pub message: Option<String>,
}

/// Phase of the cluster lifecycle
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
pub enum OrchestPhase {
    /// Nothing has been reconciled yet
    #[default]
    Initializing,
    /// Components are being created for the first time
    DeployingOrchest,
    /// Every component is deployed and current
    Running,
    /// Components are being scaled down
    Pausing,
    /// Every live component is scaled down
    Paused,
    /// Stale or paused components are being redeployed
    Upgrading,
}

impl OrchestPhase {
    /// Phases in which a previous invocation stopped half way
    pub fn is_transitioning(self) -> bool {
        matches!(self, OrchestPhase::Upgrading | OrchestPhase::Pausing)
    }

    /// Name as stored in the status
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestPhase::Initializing => "Initializing",
            OrchestPhase::DeployingOrchest => "DeployingOrchest",
            OrchestPhase::Running => "Running",
            OrchestPhase::Pausing => "Pausing",
            OrchestPhase::Paused => "Paused",
            OrchestPhase::Upgrading => "Upgrading",
        }
    }
}

impl fmt::Display for OrchestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped progress record
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestClusterCondition {
    /// Phase this record belongs to
    #[serde(rename = "type")]
    pub condition_type: OrchestPhase,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Human-readable message
    pub message: String,

    /// Last time this record changed
    pub last_transition_time: String,
}

impl OrchestClusterStatus {
    /// Status carrying only the given phase
    pub fn with_phase(phase: OrchestPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Move the status to `phase` and record `message` under it.
    ///
    /// A previous record of the same phase is replaced and the new one is
    /// appended last. Returns false when the status already ends with the
    /// identical record, in which case nothing changes.
    pub fn record(&mut self, phase: OrchestPhase, message: &str) -> bool {
        let unchanged = self.phase == phase
            && self.conditions.last().is_some_and(|c| {
                c.condition_type == phase && c.status == "True" && c.message == message
            });
        if unchanged {
            return false;
        }

        self.phase = phase;
        self.conditions.retain(|c| c.condition_type != phase);
        self.conditions.push(OrchestClusterCondition {
            condition_type: phase,
            status: "True".to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
        });
        true
    }

    /// Latest record, if any
    pub fn last_condition(&self) -> Option<&OrchestClusterCondition> {
        self.conditions.last()
    }
}

impl OrchestCluster {
    /// Desired generation, as stamped on converged objects
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// True if the spec asks for the cluster to be paused
    pub fn pause_requested(&self) -> bool {
        self.spec.orchest.pause.unwrap_or(false)
    }

    /// True if the restart annotation is present
    pub fn restart_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(RESTART_ANNOTATION))
    }

    /// Phase reported in the status
    pub fn phase(&self) -> OrchestPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

impl OrchestClusterSpec {
    /// Image of an Orchest-owned component
    pub fn orchest_image(&self, component: &str) -> String {
        format!(
            "{}/{}:{}",
            self.orchest.registry, component, self.orchest.version
        )
    }

    /// Labels shared by every object managed for `cluster_name`
    pub fn get_labels(&self, cluster_name: &str, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(cluster_name, component);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "orchest-operator".to_string(),
        );
        labels.insert(
            "app.kubernetes.io/version".to_string(),
            self.orchest.version.clone(),
        );
        labels
    }

    /// Selector labels of one component
    pub fn get_selector_labels(
        &self,
        cluster_name: &str,
        component: &str,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            component.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            cluster_name.to_string(),
        );
        labels
    }
}

/// Label selector matching every component of `cluster_name`
pub fn components_selector(cluster_name: &str) -> String {
    format!(
        "app.kubernetes.io/part-of={},app.kubernetes.io/managed-by=orchest-operator",
        cluster_name
    )
}

// Default value functions
fn default_version() -> String {
    "v2022.06.4".to_string()
}

fn default_registry() -> String {
    "orchest".to_string()
}

fn default_user_dir_size() -> String {
    "50Gi".to_string()
}

fn default_builder_cache_size() -> String {
    "25Gi".to_string()
}

fn default_postgres() -> ThirdPartySpec {
    ThirdPartySpec {
        image: "postgres:13.1".to_string(),
    }
}

fn default_rabbitmq() -> ThirdPartySpec {
    ThirdPartySpec {
        image: "rabbitmq:3".to_string(),
    }
}

impl Default for OrchestClusterSpec {
    fn default() -> Self {
        Self {
            orchest: OrchestSpec::default(),
            postgres: default_postgres(),
            rabbitmq: default_rabbitmq(),
        }
    }
}

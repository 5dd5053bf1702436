//! Kubernetes Resource Builders
//!
//! This module generates the desired-state manifests (Deployments, Services,
//! access-control objects and volume claims) of an OrchestCluster. The
//! builders are pure: the same cluster and generation always produce the
//! same objects.

use crate::components::Component;
use crate::crd::{OrchestCluster, API_VERSION, KIND};
use crate::error::{OperatorError, Result};
use crate::revision::{revision_value, REVISION_LABEL};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde::Serialize;
use std::collections::BTreeMap;

/// Name of the user data volume claim
pub const USER_DIR_VOLUME: &str = "userdir-pvc";

/// Name of the image builder cache volume claim
pub const BUILDER_CACHE_VOLUME: &str = "image-builder-cache-pvc";

/// Mount path of the user data volume in Orchest containers
const USER_DIR_MOUNT_PATH: &str = "/userdir";

const DB_MOUNT_PATH: &str = "/userdir/.orchest/database/data";
const DB_SUB_PATH: &str = ".orchest/database/data";

const RABBITMQ_MOUNT_PATH: &str = "/var/lib/rabbitmq/mnesia";
const RABBITMQ_SUB_PATH: &str = ".orchest/rabbitmq-mnesia";

/// A desired-state object, routed to the matching upsert strategy
#[derive(Debug, Clone)]
pub enum ManagedObject {
    /// Converged by full spec replacement
    Deployment(Deployment),
    /// Converged by spec replacement on revision mismatch
    Service(Service),
    /// Converged by field-level patch
    Object(DynamicObject),
}

impl ManagedObject {
    /// Kind and name, for logging
    pub fn describe(&self) -> String {
        match self {
            ManagedObject::Deployment(d) => {
                format!("Deployment/{}", d.metadata.name.as_deref().unwrap_or("<unknown>"))
            }
            ManagedObject::Service(s) => {
                format!("Service/{}", s.metadata.name.as_deref().unwrap_or("<unknown>"))
            }
            ManagedObject::Object(o) => {
                let kind = o.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("Object");
                format!("{}/{}", kind, o.metadata.name.as_deref().unwrap_or("<unknown>"))
            }
        }
    }
}

/// Convert a typed object into its dynamic form
pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Builder for generating Kubernetes resources from an OrchestCluster
pub struct ResourceBuilder<'a> {
    cluster: &'a OrchestCluster,
    name: String,
    namespace: String,
    revision: String,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder stamping objects with `generation`
    pub fn new(cluster: &'a OrchestCluster, generation: i64) -> Result<Self> {
        let name =
            cluster.metadata.name.clone().ok_or_else(|| {
                OperatorError::InvalidConfig("cluster name is required".to_string())
            })?;

        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            cluster,
            name,
            namespace,
            revision: revision_value(generation),
        })
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.name.clone(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn labels(&self, component: &str) -> BTreeMap<String, String> {
        let mut labels = self.cluster.spec.get_labels(&self.name, component);
        labels.insert(REVISION_LABEL.to_string(), self.revision.clone());
        labels
    }

    fn metadata(&self, name: &str, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(component)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build one of the supporting volume claims
    pub fn build_volume(&self, name: &str, size: &str) -> PersistentVolumeClaim {
        let resources = self.cluster.spec.orchest.resources.clone();

        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(size.to_string()));

        let mut labels = BTreeMap::new();
        labels.insert(REVISION_LABEL.to_string(), self.revision.clone());

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: resources.storage_class_name.filter(|s| !s.is_empty()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn user_dir_volume() -> Volume {
        Volume {
            name: USER_DIR_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: USER_DIR_VOLUME.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        }
    }

    fn user_dir_mount(mount_path: &str, sub_path: Option<&str>) -> VolumeMount {
        VolumeMount {
            name: USER_DIR_VOLUME.to_string(),
            mount_path: mount_path.to_string(),
            sub_path: sub_path.map(str::to_string),
            ..Default::default()
        }
    }

    fn tcp_probe(port: i32) -> Probe {
        Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            ..Default::default()
        }
    }

    /// Environment shared by the Orchest-owned containers
    fn orchest_env(&self) -> Vec<EnvVar> {
        vec![
            EnvVar {
                name: "PYTHONUNBUFFERED".to_string(),
                value: Some("TRUE".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "ORCHEST_CLUSTER".to_string(),
                value: Some(self.name.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "ORCHEST_NAMESPACE".to_string(),
                value: Some(self.namespace.clone()),
                ..Default::default()
            },
        ]
    }

    fn container(&self, component: Component, image: String, port: Option<i32>) -> Container {
        Container {
            name: component.name().to_string(),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: port.map(|p| {
                vec![ContainerPort {
                    container_port: p,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]
            }),
            readiness_probe: port.map(Self::tcp_probe),
            ..Default::default()
        }
    }

    fn build_deployment(
        &self,
        component: Component,
        container: Container,
        recreate: bool,
        service_account: Option<String>,
    ) -> Deployment {
        let name = component.name();
        let selector_labels = self.cluster.spec.get_selector_labels(&self.name, name);

        let mut pod_labels = selector_labels.clone();
        pod_labels.insert(REVISION_LABEL.to_string(), self.revision.clone());

        Deployment {
            metadata: self.metadata(name, name),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                strategy: recreate.then(|| DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![Self::user_dir_volume()]),
                        service_account_name: service_account,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_service(&self, component: Component, port: i32) -> Service {
        let name = component.name();
        Service {
            metadata: self.metadata(name, name),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.cluster.spec.get_selector_labels(&self.name, name)),
                ports: Some(vec![ServicePort {
                    name: Some("service".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Manifests of the database
    pub fn database_manifests(&self) -> Vec<ManagedObject> {
        let component = Component::Database;
        let mut container =
            self.container(component, self.cluster.spec.postgres.image.clone(), Some(5432));
        container.env = Some(vec![
            EnvVar {
                name: "PGDATA".to_string(),
                value: Some(DB_MOUNT_PATH.to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "POSTGRES_HOST_AUTH_METHOD".to_string(),
                value: Some("trust".to_string()),
                ..Default::default()
            },
        ]);
        container.volume_mounts = Some(vec![Self::user_dir_mount(
            DB_MOUNT_PATH,
            Some(DB_SUB_PATH),
        )]);
        container.readiness_probe = Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "pg_isready".to_string(),
                    "--username".to_string(),
                    "postgres".to_string(),
                ]),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            ..Default::default()
        });

        vec![
            ManagedObject::Deployment(self.build_deployment(component, container, true, None)),
            ManagedObject::Service(self.build_service(component, 5432)),
        ]
    }

    /// Manifests of the message broker
    pub fn rabbitmq_manifests(&self) -> Vec<ManagedObject> {
        let component = Component::RabbitMq;
        let mut container =
            self.container(component, self.cluster.spec.rabbitmq.image.clone(), Some(5672));
        container.volume_mounts = Some(vec![Self::user_dir_mount(
            RABBITMQ_MOUNT_PATH,
            Some(RABBITMQ_SUB_PATH),
        )]);

        vec![
            ManagedObject::Deployment(self.build_deployment(component, container, true, None)),
            ManagedObject::Service(self.build_service(component, 5672)),
        ]
    }

    /// Manifests of the worker pool; it exposes no service
    pub fn celery_worker_manifests(&self) -> Vec<ManagedObject> {
        let component = Component::CeleryWorker;
        let mut container = self.container(
            component,
            self.cluster.spec.orchest_image(component.name()),
            None,
        );
        let mut env = self.orchest_env();
        env.push(EnvVar {
            name: "ORCHEST_API_ADDRESS".to_string(),
            value: Some(format!("{}:80", Component::OrchestApi.name())),
            ..Default::default()
        });
        container.env = Some(env);
        container.volume_mounts = Some(vec![Self::user_dir_mount(USER_DIR_MOUNT_PATH, None)]);

        vec![ManagedObject::Deployment(self.build_deployment(
            component, container, false, None,
        ))]
    }

    /// Manifests of the API server, including its access-control objects
    pub fn orchest_api_manifests(&self) -> Result<Vec<ManagedObject>> {
        let component = Component::OrchestApi;
        let name = component.name();

        let mut container =
            self.container(component, self.cluster.spec.orchest_image(name), Some(80));
        container.env = Some(self.orchest_env());
        container.volume_mounts = Some(vec![Self::user_dir_mount(USER_DIR_MOUNT_PATH, None)]);

        let service_account = ServiceAccount {
            metadata: self.metadata(name, name),
            ..Default::default()
        };

        // Cluster scoped objects cannot be owned by a namespaced resource
        let role_name = format!("{}-{}", self.namespace, name);
        let mut cluster_labels = self.labels(name);
        cluster_labels.insert(
            "app.kubernetes.io/instance".to_string(),
            format!("{}.{}", self.namespace, self.name),
        );

        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(role_name.clone()),
                labels: Some(cluster_labels.clone()),
                ..Default::default()
            },
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec![String::new(), "apps".to_string()]),
                    resources: Some(vec![
                        "pods".to_string(),
                        "pods/log".to_string(),
                        "services".to_string(),
                        "configmaps".to_string(),
                        "persistentvolumeclaims".to_string(),
                        "deployments".to_string(),
                    ]),
                    verbs: vec![
                        "get".to_string(),
                        "list".to_string(),
                        "watch".to_string(),
                        "create".to_string(),
                        "update".to_string(),
                        "patch".to_string(),
                        "delete".to_string(),
                    ],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["batch".to_string(), "argoproj.io".to_string()]),
                    resources: Some(vec!["jobs".to_string(), "workflows".to_string()]),
                    verbs: vec!["*".to_string()],
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(role_name.clone()),
                labels: Some(cluster_labels),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role_name,
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        };

        Ok(vec![
            ManagedObject::Object(to_dynamic(&service_account)?),
            ManagedObject::Object(to_dynamic(&role)?),
            ManagedObject::Object(to_dynamic(&binding)?),
            ManagedObject::Deployment(self.build_deployment(
                component,
                container,
                false,
                Some(name.to_string()),
            )),
            ManagedObject::Service(self.build_service(component, 80)),
        ])
    }

    /// Manifests of the authentication server
    pub fn auth_server_manifests(&self) -> Vec<ManagedObject> {
        self.web_component_manifests(Component::AuthServer)
    }

    /// Manifests of the web front-end
    pub fn webserver_manifests(&self) -> Vec<ManagedObject> {
        self.web_component_manifests(Component::Webserver)
    }

    fn web_component_manifests(&self, component: Component) -> Vec<ManagedObject> {
        let mut container = self.container(
            component,
            self.cluster.spec.orchest_image(component.name()),
            Some(80),
        );
        container.env = Some(self.orchest_env());
        container.volume_mounts = Some(vec![Self::user_dir_mount(USER_DIR_MOUNT_PATH, None)]);

        vec![
            ManagedObject::Deployment(self.build_deployment(component, container, false, None)),
            ManagedObject::Service(self.build_service(component, 80)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::OrchestClusterSpec;

    fn create_test_cluster(name: &str) -> OrchestCluster {
        let mut cluster = OrchestCluster::new(name, OrchestClusterSpec::default());
        cluster.metadata.namespace = Some("orchest".to_string());
        cluster.metadata.uid = Some("test-uid-123".to_string());
        cluster.metadata.generation = Some(4);
        cluster
    }

    fn deployment_of(objects: &[ManagedObject]) -> &Deployment {
        objects
            .iter()
            .find_map(|o| match o {
                ManagedObject::Deployment(d) => Some(d),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_build_database() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        let objects = builder.database_manifests();

        assert_eq!(objects.len(), 2);
        let deployment = deployment_of(&objects);
        assert_eq!(deployment.metadata.name, Some("orchest-database".to_string()));
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.strategy.as_ref().unwrap().type_,
            Some("Recreate".to_string())
        );

        let mount = &spec.template.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()[0];
        assert_eq!(mount.mount_path, DB_MOUNT_PATH);
        assert_eq!(mount.sub_path.as_deref(), Some(DB_SUB_PATH));
    }

    #[test]
    fn test_revision_label_on_objects() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();

        for object in builder.orchest_api_manifests().unwrap() {
            let meta = match &object {
                ManagedObject::Deployment(d) => &d.metadata,
                ManagedObject::Service(s) => &s.metadata,
                ManagedObject::Object(o) => &o.metadata,
            };
            let labels = meta.labels.as_ref().unwrap();
            assert_eq!(labels.get(REVISION_LABEL), Some(&"4".to_string()));
        }
    }

    #[test]
    fn test_celery_worker_has_no_service() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        let objects = builder.celery_worker_manifests();

        assert_eq!(objects.len(), 1);
        assert!(matches!(objects[0], ManagedObject::Deployment(_)));
        let container = &deployment_of(&objects).spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some(cluster.spec.orchest_image("celery-worker").as_str())
        );
    }

    #[test]
    fn test_orchest_api_rbac() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        let objects = builder.orchest_api_manifests().unwrap();

        let kinds: Vec<String> = objects.iter().map(|o| o.describe()).collect();
        assert_eq!(
            kinds,
            vec![
                "ServiceAccount/orchest-api",
                "ClusterRole/orchest-orchest-api",
                "ClusterRoleBinding/orchest-orchest-api",
                "Deployment/orchest-api",
                "Service/orchest-api",
            ]
        );

        let sa = deployment_of(&objects)
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .service_account_name
            .clone();
        assert_eq!(sa, Some("orchest-api".to_string()));
    }

    #[test]
    fn test_cluster_scoped_objects_have_no_owner() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        for object in builder.orchest_api_manifests().unwrap() {
            if let ManagedObject::Object(o) = object {
                let kind = o.types.as_ref().unwrap().kind.clone();
                if kind.starts_with("ClusterRole") {
                    assert!(o.metadata.namespace.is_none());
                    assert!(o.metadata.owner_references.is_none());
                } else {
                    assert_eq!(o.metadata.namespace.as_deref(), Some("orchest"));
                }
            }
        }
    }

    #[test]
    fn test_build_volume() {
        let mut cluster = create_test_cluster("my-cluster");
        cluster.spec.orchest.resources.storage_class_name = Some("nfs".to_string());
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        let pvc = builder.build_volume(USER_DIR_VOLUME, "10Gi");

        assert_eq!(pvc.metadata.name, Some(USER_DIR_VOLUME.to_string()));
        let spec = pvc.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name, Some("nfs".to_string()));
        assert_eq!(
            spec.access_modes,
            Some(vec!["ReadWriteMany".to_string()])
        );
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("10Gi".to_string())
        );
    }

    #[test]
    fn test_owner_references() {
        let cluster = create_test_cluster("my-cluster");
        let builder = ResourceBuilder::new(&cluster, 4).unwrap();
        let objects = builder.webserver_manifests();
        let deployment = deployment_of(&objects);

        let owner_refs = deployment.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "OrchestCluster");
        assert_eq!(owner_refs[0].name, "my-cluster");
        assert_eq!(owner_refs[0].controller, Some(true));
    }

    #[test]
    fn test_builders_are_deterministic() {
        let cluster = create_test_cluster("my-cluster");
        let first = ResourceBuilder::new(&cluster, 4).unwrap().auth_server_manifests();
        let second = ResourceBuilder::new(&cluster, 4).unwrap().auth_server_manifests();
        assert_eq!(deployment_of(&first), deployment_of(&second));
    }

    #[test]
    fn test_missing_name_rejected() {
        let mut cluster = create_test_cluster("my-cluster");
        cluster.metadata.name = None;
        assert!(ResourceBuilder::new(&cluster, 1).is_err());
    }
}

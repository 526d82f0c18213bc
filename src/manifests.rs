//! Desired state of the objects making up the search application.
//!
//! Builders only fill in the fields the differ owns plus what is needed at
//! creation time; everything else is left to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
        LocalObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
        SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec,
        VolumeResourceRequirements, Volume, VolumeMount,
    },
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject},
};
use k8s_openapi::apimachinery::pkg::{
    api::resource::Quantity,
    apis::meta::v1::{LabelSelector, ObjectMeta},
    util::intstr::IntOrString,
};

use crate::config::{Component, OperatorConfig};
use crate::config_merge::BASE_KEY;
use crate::crd::{DeploymentConfig, Search};
use crate::features::FeatureToggles;
use crate::ownership::Owner;

pub static SERVICE_ACCOUNT_NAME: &str = "search-serviceaccount";
pub static CLUSTER_ROLE_NAME: &str = "open-cluster-management:search";
pub static POSTGRES_CONFIG_NAME: &str = "search-postgres";
pub static STORAGE_NAME: &str = "search-postgres-storage";
pub static EMPTY_DIR_STORAGE: &str = "EmptyDir";
pub static DEFAULT_STORAGE_SIZE: &str = "10Gi";
pub static APP_LABEL: &str = "app";
pub static COMPONENT_LABEL: &str = "component";
pub static APP_NAME: &str = "search";
pub static DATABASE_NAME: &str = "search";

/// Secrets populated by the service CA operator from the serving-cert annotation
pub static SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

/// Base `postgresql.conf` generated by this release
pub static POSTGRES_CONF_TEMPLATE: &str = "\
ssl = 'on'
ssl_cert_file = '/sslcert/tls.crt'
ssl_key_file = '/sslcert/tls.key'
listen_addresses = '*'
max_connections = 200
shared_buffers = 1GB
effective_cache_size = 2GB
work_mem = 16MB
max_parallel_workers_per_gather = 0
statement_timeout = '60000'
";

/// Base files generated by earlier releases, used to recognise untouched installs
pub static PRIOR_POSTGRES_CONF_TEMPLATES: &[&str] = &[
    "\
ssl = 'on'
ssl_cert_file = '/sslcert/tls.crt'
ssl_key_file = '/sslcert/tls.key'
listen_addresses = '*'
max_connections = 200
shared_buffers = 64MB
effective_cache_size = 128MB
work_mem = 16MB
",
    "\
ssl = 'on'
ssl_cert_file = '/sslcert/tls.crt'
ssl_key_file = '/sslcert/tls.key'
listen_addresses = '*'
max_connections = 200
shared_buffers = 1GB
effective_cache_size = 2GB
work_mem = 16MB
max_parallel_workers_per_gather = 0
",
];

/// Everything the Search controller applies in its own namespace and at
/// cluster scope
#[derive(Clone, Debug)]
pub struct DesiredState {
    pub service_account: ServiceAccount,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub postgres_config: ConfigMap,
    pub services: Vec<Service>,
    pub deployments: Vec<Deployment>,
    pub storage: Option<PersistentVolumeClaim>,
}

impl DesiredState {
    pub fn build(
        search: &Search,
        owner: &Owner,
        config: &OperatorConfig,
        toggles: &FeatureToggles,
    ) -> Self {
        Self {
            service_account: service_account(search, owner),
            cluster_role: cluster_role(owner),
            cluster_role_binding: cluster_role_binding(owner),
            postgres_config: postgres_config(owner),
            services: [Component::Database, Component::Indexer, Component::Api]
                .into_iter()
                .map(|c| service(owner, c))
                .collect(),
            deployments: Component::ALL
                .into_iter()
                .map(|c| deployment(search, owner, config, toggles, c))
                .collect(),
            storage: storage(search, owner),
        }
    }

    /// Value of `status.storage`
    pub fn storage_name(&self) -> String {
        self.storage
            .as_ref()
            .and_then(|pvc| pvc.metadata.name.clone())
            .unwrap_or_else(|| EMPTY_DIR_STORAGE.to_string())
    }
}

fn meta(owner: &Owner, name: &str, namespaced: bool) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespaced.then(|| owner.namespace().to_string()),
        ..ObjectMeta::default()
    };
    owner.adopt(&mut meta);
    meta
}

fn selector(component: Component) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (COMPONENT_LABEL.to_string(), component.name().to_string()),
    ])
}

pub fn service_account(search: &Search, owner: &Owner) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(owner, SERVICE_ACCOUNT_NAME, true),
        automount_service_account_token: Some(true),
        image_pull_secrets: pull_secrets(search),
        ..ServiceAccount::default()
    }
}

pub fn cluster_role(owner: &Owner) -> ClusterRole {
    ClusterRole {
        metadata: meta(owner, CLUSTER_ROLE_NAME, false),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..PolicyRule::default()
            },
            PolicyRule {
                api_groups: Some(vec!["authentication.k8s.io".to_string()]),
                resources: Some(vec!["tokenreviews".to_string()]),
                verbs: vec!["create".to_string()],
                ..PolicyRule::default()
            },
            PolicyRule {
                api_groups: Some(vec!["authorization.k8s.io".to_string()]),
                resources: Some(vec![
                    "selfsubjectaccessreviews".to_string(),
                    "selfsubjectrulesreviews".to_string(),
                    "subjectaccessreviews".to_string(),
                ]),
                verbs: vec!["create".to_string()],
                ..PolicyRule::default()
            },
        ]),
        ..ClusterRole::default()
    }
}

pub fn cluster_role_binding(owner: &Owner) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(owner, CLUSTER_ROLE_NAME, false),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
            namespace: Some(owner.namespace().to_string()),
            ..Subject::default()
        }]),
    }
}

/// Database configuration with the generated base only; user settings are
/// merged in by the controller
pub fn postgres_config(owner: &Owner) -> ConfigMap {
    ConfigMap {
        metadata: meta(owner, POSTGRES_CONFIG_NAME, true),
        data: Some(BTreeMap::from([(
            BASE_KEY.to_string(),
            POSTGRES_CONF_TEMPLATE.to_string(),
        )])),
        ..ConfigMap::default()
    }
}

pub fn port(component: Component) -> Option<i32> {
    match component {
        Component::Database => Some(5432),
        Component::Indexer => Some(3010),
        Component::Api => Some(4010),
        Component::Collector => None,
    }
}

fn tls_secret(component: Component) -> String {
    format!("{}-tls", component.name())
}

/// ClusterIP service in front of a component that listens on a port
pub fn service(owner: &Owner, component: Component) -> Service {
    let mut metadata = meta(owner, component.name(), true);
    metadata.annotations = Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        tls_secret(component),
    )]));
    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector(component)),
            ports: port(component).map(|p| {
                vec![ServicePort {
                    name: Some(format!("{}-port", component.name())),
                    port: p,
                    target_port: Some(IntOrString::Int(p)),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                }]
            }),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// PVC of the database, only when storage is configured. It is labelled
/// but never owned so the data outlives the Search.
pub fn storage(search: &Search, owner: &Owner) -> Option<PersistentVolumeClaim> {
    let spec = search.spec.db_storage.as_ref()?;
    let mut metadata = ObjectMeta {
        name: Some(STORAGE_NAME.to_string()),
        namespace: Some(owner.namespace().to_string()),
        ..ObjectMeta::default()
    };
    owner.label(&mut metadata);
    let size = spec.size.clone().unwrap_or_else(|| DEFAULT_STORAGE_SIZE.to_string());
    Some(PersistentVolumeClaim {
        metadata,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: spec.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    })
}

fn pull_secrets(search: &Search) -> Option<Vec<LocalObjectReference>> {
    search.spec.image_pull_secret.as_ref().map(|name| {
        vec![LocalObjectReference {
            name: name.clone(),
        }]
    })
}

/// Requests and limits from the Search override, or the default sizing
fn resources(config: &OperatorConfig, component: Component, overrides: Option<&DeploymentConfig>) -> ResourceRequirements {
    if let Some(res) = overrides.and_then(|o| o.resources.clone()) {
        return res;
    }
    let defaults = config.defaults.get(component);
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(defaults.cpu_request.clone())),
            ("memory".to_string(), Quantity(defaults.memory_request.clone())),
        ])),
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(defaults.memory_limit.clone()),
        )])),
        ..ResourceRequirements::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn component_env(search: &Search, owner: &Owner, toggles: &FeatureToggles, component: Component) -> Vec<EnvVar> {
    let db_host = format!("{}.{}.svc", Component::Database.name(), owner.namespace());
    let db_port = port(Component::Database).unwrap_or_default().to_string();
    let mut envs = match component {
        Component::Database => vec![
            env("POSTGRESQL_DATABASE", DATABASE_NAME),
            env("POSTGRESQL_SHARED_BUFFERS", "1GB"),
        ],
        Component::Indexer => vec![
            env("DB_HOST", db_host),
            env("DB_PORT", db_port),
            env("DB_NAME", DATABASE_NAME),
        ],
        Component::Api => {
            let mut envs = vec![
                env("DB_HOST", db_host),
                env("DB_PORT", db_port),
                env("DB_NAME", DATABASE_NAME),
            ];
            envs.extend(toggles.env_flags());
            envs
        }
        Component::Collector => vec![
            env("CLUSTER_NAME", "local-cluster"),
            env(
                "AGGREGATOR_URL",
                format!(
                    "https://{}.{}.svc:{}",
                    Component::Indexer.name(),
                    owner.namespace(),
                    port(Component::Indexer).unwrap_or_default()
                ),
            ),
        ],
    };
    if let Some(user) = search.spec.deployments.get(component).and_then(|d| d.env.clone()) {
        envs.extend(user);
    }
    envs
}

// The API server fills this in when absent; setting it keeps live volumes comparable
const DEFAULT_VOLUME_MODE: i32 = 0o644;

fn volumes(search: &Search, component: Component) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if port(component).is_some() {
        volumes.push(Volume {
            name: "tls".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls_secret(component)),
                default_mode: Some(DEFAULT_VOLUME_MODE),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "tls".to_string(),
            mount_path: "/sslcert".to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }
    if component == Component::Database {
        volumes.push(Volume {
            name: "postgresql-cfg".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: POSTGRES_CONFIG_NAME.to_string(),
                default_mode: Some(DEFAULT_VOLUME_MODE),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
        mounts.push(VolumeMount {
            name: "postgresql-cfg".to_string(),
            mount_path: "/opt/app-root/src/postgresql-cfg".to_string(),
            ..VolumeMount::default()
        });
        volumes.push(match search.spec.db_storage {
            Some(_) => Volume {
                name: "postgresdb".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: STORAGE_NAME.to_string(),
                    ..PersistentVolumeClaimVolumeSource::default()
                }),
                ..Volume::default()
            },
            None => Volume {
                name: "postgresdb".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
        });
        mounts.push(VolumeMount {
            name: "postgresdb".to_string(),
            mount_path: "/var/lib/pgsql/data".to_string(),
            ..VolumeMount::default()
        });
    }
    (volumes, mounts)
}

pub fn deployment(
    search: &Search,
    owner: &Owner,
    config: &OperatorConfig,
    toggles: &FeatureToggles,
    component: Component,
) -> Deployment {
    let overrides = search.spec.deployments.get(component);
    let labels = selector(component);
    let (volumes, mounts) = volumes(search, component);
    let image = overrides
        .and_then(|o| o.image_override.clone())
        .unwrap_or_else(|| config.image(component).to_string());
    // unset leaves the count to the cluster, e.g. an autoscaler
    let replicas = overrides.and_then(|o| o.replica_count);

    let mut metadata = meta(owner, component.name(), true);
    metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    node_selector: search.spec.node_selector.clone(),
                    tolerations: search.spec.tolerations.clone(),
                    image_pull_secrets: pull_secrets(search),
                    containers: vec![Container {
                        name: component.name().to_string(),
                        image: Some(image),
                        image_pull_policy: search.spec.image_pull_policy.clone(),
                        args: overrides.and_then(|o| o.arguments.clone()),
                        env: Some(component_env(search, owner, toggles, component)),
                        resources: Some(resources(config, component, overrides)),
                        ports: port(component).map(|p| {
                            vec![ContainerPort {
                                container_port: p,
                                protocol: Some("TCP".to_string()),
                                ..ContainerPort::default()
                            }]
                        }),
                        volume_mounts: Some(mounts),
                        ..Container::default()
                    }],
                    volumes: Some(volumes),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

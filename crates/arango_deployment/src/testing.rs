//! In-memory stand-ins for the Kubernetes API and the database, for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::v1alpha::{ArangoDeployment, ArangoDeploymentSpec, MemberGroupSpec};
use crate::arangod::{ArangoClient, ClusterHealth, ServerHealth, ServerRole, ServerStatus, VersionInfo};
use crate::controllers::members::MemberRole;
use crate::platform::PlatformClient;
use crate::util::errors::StdError;

pub fn new_deployment(name: &str, namespace: &str) -> ArangoDeployment {
    ArangoDeployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ArangoDeploymentSpec {
            agents: MemberGroupSpec::new(1),
            db_servers: MemberGroupSpec::new(1),
            coordinators: MemberGroupSpec::new(1),
            ..Default::default()
        },
        status: None,
    }
}

/// Number of calls per operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calls {
    pub get_deployment: usize,
    pub replace_status: usize,
    pub create_secret: usize,
    pub create_pod: usize,
    pub delete_pod: usize,
    pub create_service: usize,
}

type Key = (String, String);
type StatusHook = Box<dyn FnOnce(&mut ArangoDeployment) + Send>;

#[derive(Default)]
struct Store {
    resource_version: u64,
    deployments: BTreeMap<Key, ArangoDeployment>,
    secrets: BTreeMap<Key, Secret>,
    pods: BTreeMap<Key, Pod>,
    services: BTreeMap<Key, Service>,
    calls: Calls,
    forbid_secret_creation: bool,
    conflict_every_status_write: bool,
    pod_deletion_pending: bool,
    before_status_write: Option<StatusHook>,
}

impl Store {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

/// Optimistic-concurrency aware fake of the Kubernetes API.
#[derive(Default)]
pub struct FakePlatform {
    store: Mutex<Store>,
}

impl FakePlatform {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    /// Stores `deployment` as if submitted by a user, returning it with uid and resourceVersion.
    pub fn insert_deployment(&self, mut deployment: ArangoDeployment) -> ArangoDeployment {
        let mut store = self.store();
        let name = deployment.name_any();
        deployment.metadata.uid = Some(format!("uid-{}", name));
        deployment.metadata.generation = Some(deployment.metadata.generation.unwrap_or(1));
        deployment.metadata.resource_version = Some(store.next_resource_version());
        let namespace = deployment.namespace().unwrap_or_default();
        store
            .deployments
            .insert(key(&namespace, &name), deployment.clone());
        deployment
    }

    /// Edits the stored deployment like a user would, bumping generation and resourceVersion.
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut ArangoDeploymentSpec)) {
        let mut store = self.store();
        let resource_version = store.next_resource_version();
        let deployment = store.deployments.get_mut(&key(namespace, name)).unwrap();
        edit(&mut deployment.spec);
        deployment.metadata.generation = Some(deployment.metadata.generation.unwrap_or(0) + 1);
        deployment.metadata.resource_version = Some(resource_version);
    }

    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut store = self.store();
        let resource_version = store.next_resource_version();
        let deployment = store.deployments.get_mut(&key(namespace, name)).unwrap();
        deployment.metadata.deletion_timestamp = Some(Time(Utc::now()));
        deployment.metadata.resource_version = Some(resource_version);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<ArangoDeployment> {
        self.store().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.store().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn insert_secret(&self, secret: Secret) {
        let namespace = secret.namespace().unwrap_or_default();
        self.store().secrets.insert(key(&namespace, &secret.name_any()), secret);
    }

    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.store()
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub fn services(&self, namespace: &str) -> Vec<Service> {
        self.store()
            .services
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, service)| service.clone())
            .collect()
    }

    pub fn calls(&self) -> Calls {
        self.store().calls.clone()
    }

    pub fn forbid_secret_creation(&self) {
        self.store().forbid_secret_creation = true;
    }

    pub fn allow_secret_creation(&self) {
        self.store().forbid_secret_creation = false;
    }

    pub fn conflict_every_status_write(&self) {
        self.store().conflict_every_status_write = true;
    }

    /// Deleted pods linger with a deletion timestamp until this is switched off again.
    pub fn set_pod_deletion_pending(&self, pending: bool) {
        let mut store = self.store();
        store.pod_deletion_pending = pending;
        if !pending {
            store.pods.retain(|_, pod| pod.metadata.deletion_timestamp.is_none());
        }
    }

    /// Runs `hook` against the stored deployment right before the next status write lands.
    ///
    /// The hook bumps the resourceVersion so the write conflicts.
    pub fn before_next_status_write(&self, hook: impl FnOnce(&mut ArangoDeployment) + Send + 'static) {
        self.store().before_status_write = Some(Box::new(hook));
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<ArangoDeployment, StdError> {
        let mut store = self.store();
        store.calls.get_deployment += 1;
        store
            .deployments
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StdError::NotFound {
                kind: "ArangoDeployment",
                name: name.to_string(),
            })
    }

    async fn replace_deployment_status(
        &self,
        namespace: &str,
        deployment: &ArangoDeployment,
    ) -> Result<ArangoDeployment, StdError> {
        let mut store = self.store();
        store.calls.replace_status += 1;
        let name = deployment.name_any();
        let conflict = || StdError::Conflict {
            kind: "ArangoDeployment",
            name: name.clone(),
        };

        if let Some(hook) = store.before_status_write.take() {
            let resource_version = store.next_resource_version();
            if let Some(stored) = store.deployments.get_mut(&key(namespace, &name)) {
                hook(stored);
                stored.metadata.resource_version = Some(resource_version);
            }
        }
        if store.conflict_every_status_write {
            return Err(conflict());
        }

        let resource_version = store.next_resource_version();
        let stored = store
            .deployments
            .get_mut(&key(namespace, &name))
            .ok_or_else(|| StdError::NotFound {
                kind: "ArangoDeployment",
                name: name.clone(),
            })?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(conflict());
        }
        stored.status = deployment.status.clone();
        stored.metadata.resource_version = Some(resource_version);
        Ok(stored.clone())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StdError> {
        self.store()
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StdError::NotFound {
                kind: "Secret",
                name: name.to_string(),
            })
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, StdError> {
        let mut store = self.store();
        store.calls.create_secret += 1;
        let name = secret.name_any();
        if store.forbid_secret_creation {
            return Err(StdError::Forbidden(format!(
                "Secret '{name}': cannot create resource \"secrets\" in namespace \"{namespace}\""
            )));
        }
        if store.secrets.contains_key(&key(namespace, &name)) {
            return Err(StdError::AlreadyExists { kind: "Secret", name });
        }
        store.secrets.insert(key(namespace, &name), secret.clone());
        Ok(secret.clone())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        self.store()
            .secrets
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StdError::NotFound {
                kind: "Secret",
                name: name.to_string(),
            })
    }

    async fn list_secrets(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>, StdError> {
        Ok(self
            .store()
            .secrets
            .iter()
            .filter(|((ns, _), secret)| ns == namespace && matches_selector(secret.labels(), label_selector))
            .map(|(_, secret)| secret.clone())
            .collect())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StdError> {
        Ok(self
            .store()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod.labels(), label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, StdError> {
        let mut store = self.store();
        store.calls.create_pod += 1;
        let name = pod.name_any();
        if store.pods.contains_key(&key(namespace, &name)) {
            return Err(StdError::AlreadyExists { kind: "Pod", name });
        }
        store.pods.insert(key(namespace, &name), pod.clone());
        Ok(pod.clone())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        let mut store = self.store();
        store.calls.delete_pod += 1;
        let not_found = || StdError::NotFound {
            kind: "Pod",
            name: name.to_string(),
        };
        if store.pod_deletion_pending {
            let pod = store.pods.get_mut(&key(namespace, name)).ok_or_else(not_found)?;
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
            return Ok(());
        }
        store.pods.remove(&key(namespace, name)).map(|_| ()).ok_or_else(not_found)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StdError> {
        self.store()
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StdError::NotFound {
                kind: "Service",
                name: name.to_string(),
            })
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, StdError> {
        let mut store = self.store();
        store.calls.create_service += 1;
        let name = service.name_any();
        if store.services.contains_key(&key(namespace, &name)) {
            return Err(StdError::AlreadyExists { kind: "Service", name });
        }
        store.services.insert(key(namespace, &name), service.clone());
        Ok(service.clone())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StdError> {
        self.store()
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StdError::NotFound {
                kind: "Service",
                name: name.to_string(),
            })
    }
}

#[derive(Default)]
struct ArangoState {
    version: Option<String>,
    degraded: Vec<ServerRole>,
}

/// Database whose members are exactly the pods stored in a [`FakePlatform`], all healthy
/// unless degraded.
pub struct FakeArango {
    platform: Arc<FakePlatform>,
    namespace: String,
    state: Mutex<ArangoState>,
}

impl FakeArango {
    pub fn new(platform: Arc<FakePlatform>, namespace: &str) -> Self {
        Self {
            platform,
            namespace: namespace.to_string(),
            state: Mutex::new(ArangoState {
                version: Some("3.12.4".to_string()),
                degraded: Vec::new(),
            }),
        }
    }

    /// Members of `role` report `BAD` from now on.
    pub fn degrade(&self, role: ServerRole) {
        self.state.lock().unwrap().degraded.push(role);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().degraded.clear();
    }

    /// `None` makes the version endpoint unreachable.
    pub fn set_version(&self, version: Option<&str>) {
        self.state.lock().unwrap().version = version.map(str::to_string);
    }

    /// Member pods with whether they are going away. Terminating members stay in the health
    /// report with status `BAD`, the way arangod keeps listing configured servers.
    fn members(&self) -> Vec<(String, MemberRole, bool)> {
        self.platform
            .pods(&self.namespace)
            .into_iter()
            .filter_map(|pod| {
                let role = MemberRole::from_label(pod.labels().get("role")?)?;
                Some((pod.name_any(), role, pod.metadata.deletion_timestamp.is_some()))
            })
            .collect()
    }
}

#[async_trait]
impl ArangoClient for FakeArango {
    async fn cluster_health(&self) -> Result<ClusterHealth, StdError> {
        let degraded = self.state.lock().unwrap().degraded.clone();
        let health = self
            .members()
            .into_iter()
            .filter_map(|(name, role, terminating)| {
                let role = match role {
                    MemberRole::Single => return None,
                    MemberRole::Agent => ServerRole::Agent,
                    MemberRole::DbServer => ServerRole::DbServer,
                    MemberRole::Coordinator => ServerRole::Coordinator,
                };
                let status = if terminating || degraded.contains(&role) {
                    ServerStatus::Bad
                } else {
                    ServerStatus::Good
                };
                Some((name, ServerHealth::new(role, status)))
            })
            .collect();
        Ok(ClusterHealth {
            cluster_id: "fake".to_string(),
            health,
        })
    }

    async fn version(&self) -> Result<VersionInfo, StdError> {
        let version = self.state.lock().unwrap().version.clone();
        match version {
            Some(version) if self.members().iter().any(|(_, _, terminating)| !terminating) => Ok(VersionInfo {
                server: "arango".to_string(),
                version,
                license: Some("community".to_string()),
            }),
            _ => Err(StdError::HttpError("connection refused".to_string())),
        }
    }
}

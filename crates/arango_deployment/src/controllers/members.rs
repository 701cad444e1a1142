//! Member pods and services of a deployment.
//!
//! Pods are named `<deployment>-<role id>-<index>` and resolve each other
//! through the headless service `<deployment>-int`.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, Pod, PodSpec, Probe, SecretVolumeSource,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, warn};

use crate::api::v1alpha::ArangoDeployment;
use crate::platform::PlatformClient;
use crate::util::errors::StdError;
use crate::util::secrets::ENCRYPTION_KEY_FIELD;

pub const ARANGOD_PORT: i32 = 8529;

const APP_LABEL: &str = "app";
const APP_NAME: &str = "arangodb";
const DEPLOYMENT_LABEL: &str = "arango_deployment";
const ROLE_LABEL: &str = "role";

const DATA_VOLUME: &str = "arangod-data";
const DATA_PATH: &str = "/data";
const ENCRYPTION_VOLUME: &str = "rocksdb-encryption";
const ENCRYPTION_PATH: &str = "/secrets/rocksdb/encryption";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemberRole {
    Single,
    Agent,
    DbServer,
    Coordinator,
}

impl MemberRole {
    /// Short id used in pod names.
    pub fn id(&self) -> &'static str {
        match self {
            MemberRole::Single => "sngl",
            MemberRole::Agent => "agnt",
            MemberRole::DbServer => "prmr",
            MemberRole::Coordinator => "crdn",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MemberRole::Single => "single",
            MemberRole::Agent => "agent",
            MemberRole::DbServer => "dbserver",
            MemberRole::Coordinator => "coordinator",
        }
    }

    pub fn from_label(label: &str) -> Option<MemberRole> {
        [
            MemberRole::Single,
            MemberRole::Agent,
            MemberRole::DbServer,
            MemberRole::Coordinator,
        ]
        .into_iter()
        .find(|role| role.label() == label)
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub fn pod_name(deployment: &str, role: MemberRole, index: u32) -> String {
    format!("{}-{}-{}", deployment, role.id(), index)
}

/// Service clients connect to: coordinators, or the single server.
pub fn client_service_name(deployment: &str) -> String {
    deployment.to_string()
}

/// Headless service giving member pods stable DNS names.
pub fn headless_service_name(deployment: &str) -> String {
    format!("{}-int", deployment)
}

pub fn service_names(deployment: &str) -> [String; 2] {
    [headless_service_name(deployment), client_service_name(deployment)]
}

/// Label selector matching every member pod of a deployment.
pub fn member_selector(deployment: &str) -> String {
    format!("{APP_LABEL}={APP_NAME},{DEPLOYMENT_LABEL}={deployment}")
}

fn labels(deployment: &str, role: Option<MemberRole>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (DEPLOYMENT_LABEL.to_string(), deployment.to_string()),
    ]);
    if let Some(role) = role {
        labels.insert(ROLE_LABEL.to_string(), role.label().to_string());
    }
    labels
}

pub fn owner_reference(deployment: &ArangoDeployment) -> Result<OwnerReference, StdError> {
    deployment.controller_owner_ref(&()).ok_or_else(|| {
        StdError::MetadataMissing(format!(
            "ArangoDeployment '{}' has no uid yet",
            deployment.name_any()
        ))
    })
}

/// Members the deployment asks for, in creation order.
pub fn desired_members(deployment: &ArangoDeployment) -> Vec<(MemberRole, u32)> {
    let spec = &deployment.spec;
    if !spec.is_cluster() {
        return vec![(MemberRole::Single, 0)];
    }
    let mut members = Vec::new();
    for (role, count) in [
        (MemberRole::Agent, spec.agents.count),
        (MemberRole::DbServer, spec.db_servers.count),
        (MemberRole::Coordinator, spec.coordinators.count),
    ] {
        members.extend((0..count).map(|index| (role, index)));
    }
    members
}

fn member_address(deployment: &str, namespace: &str, pod: &str) -> String {
    format!(
        "tcp://{}.{}.{}.svc:{}",
        pod,
        headless_service_name(deployment),
        namespace,
        ARANGOD_PORT
    )
}

fn arangod_args(deployment: &ArangoDeployment, namespace: &str, role: MemberRole, index: u32) -> Vec<String> {
    let name = deployment.name_any();
    let spec = &deployment.spec;
    let own = pod_name(&name, role, index);

    let mut args = vec![
        format!("--server.endpoint=tcp://[::]:{}", ARANGOD_PORT),
        "--server.authentication=false".to_string(),
        format!("--server.storage-engine={}", spec.storage_engine),
        format!("--database.directory={}", DATA_PATH),
    ];
    if spec.encryption_secret_name().is_some() {
        args.push(format!(
            "--rocksdb.encryption-keyfile={}/{}",
            ENCRYPTION_PATH, ENCRYPTION_KEY_FIELD
        ));
    }

    let agents: Vec<String> = (0..spec.agents.count)
        .map(|i| pod_name(&name, MemberRole::Agent, i))
        .collect();

    match role {
        MemberRole::Single => {}
        MemberRole::Agent => {
            args.push("--agency.activate=true".to_string());
            args.push(format!("--agency.size={}", spec.agents.count));
            args.push("--agency.supervision=true".to_string());
            args.push(format!(
                "--agency.my-address={}",
                member_address(&name, namespace, &own)
            ));
            for agent in agents.iter().filter(|agent| **agent != own) {
                args.push(format!(
                    "--agency.endpoint={}",
                    member_address(&name, namespace, agent)
                ));
            }
        }
        MemberRole::DbServer | MemberRole::Coordinator => {
            args.push(format!(
                "--cluster.my-address={}",
                member_address(&name, namespace, &own)
            ));
            let cluster_role = if role == MemberRole::DbServer {
                "PRIMARY"
            } else {
                "COORDINATOR"
            };
            args.push(format!("--cluster.my-role={}", cluster_role));
            for agent in &agents {
                args.push(format!(
                    "--cluster.agency-endpoint={}",
                    member_address(&name, namespace, agent)
                ));
            }
        }
    }
    args
}

pub fn build_member_pod(
    deployment: &ArangoDeployment,
    namespace: &str,
    role: MemberRole,
    index: u32,
    oref: &OwnerReference,
) -> Pod {
    let name = deployment.name_any();
    let pod_name = pod_name(&name, role, index);

    let mut volumes = vec![Volume {
        name: DATA_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: DATA_PATH.to_string(),
        ..Default::default()
    }];
    if let Some(secret) = deployment.spec.encryption_secret_name() {
        volumes.push(Volume {
            name: ENCRYPTION_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: ENCRYPTION_VOLUME.to_string(),
            mount_path: ENCRYPTION_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&name, Some(role))),
            owner_references: Some(vec![oref.clone()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(pod_name),
            subdomain: Some(headless_service_name(&name)),
            containers: vec![Container {
                name: "arangod".to_string(),
                image: Some(deployment.spec.image.clone()),
                args: Some(arangod_args(deployment, namespace, role, index)),
                ports: Some(vec![ContainerPort {
                    name: Some("server".to_string()),
                    container_port: ARANGOD_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some("/_api/version".to_string()),
                        port: IntOrString::Int(ARANGOD_PORT),
                        ..Default::default()
                    }),
                    initial_delay_seconds: Some(2),
                    period_seconds: Some(5),
                    ..Default::default()
                }),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_services(deployment: &ArangoDeployment, namespace: &str, oref: &OwnerReference) -> Vec<Service> {
    let name = deployment.name_any();
    let port = ServicePort {
        name: Some("server".to_string()),
        port: ARANGOD_PORT,
        target_port: Some(IntOrString::Int(ARANGOD_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    let client_role = if deployment.spec.is_cluster() {
        MemberRole::Coordinator
    } else {
        MemberRole::Single
    };

    let metadata = |service_name: String| ObjectMeta {
        name: Some(service_name),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(&name, None)),
        owner_references: Some(vec![oref.clone()]),
        ..Default::default()
    };

    vec![
        Service {
            metadata: metadata(headless_service_name(&name)),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                publish_not_ready_addresses: Some(true),
                selector: Some(labels(&name, None)),
                ports: Some(vec![port.clone()]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Service {
            metadata: metadata(client_service_name(&name)),
            spec: Some(ServiceSpec {
                selector: Some(labels(&name, Some(client_role))),
                ports: Some(vec![port]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Creates the services that do not exist yet.
pub async fn ensure_services<P: PlatformClient + ?Sized>(
    platform: &P,
    deployment: &ArangoDeployment,
    namespace: &str,
    oref: &OwnerReference,
) -> Result<(), StdError> {
    for service in build_services(deployment, namespace, oref) {
        let name = service.name_any();
        match platform.get_service(namespace, &name).await {
            Ok(_) => continue,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match platform.create_service(namespace, &service).await {
            Ok(_) => info!(service = %name, namespace, "Created service"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Member pods after [`ensure_member_pods`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberPods {
    /// Pods created by this call.
    pub created: Vec<String>,
    /// Desired pods running an image other than the requested one.
    pub outdated: Vec<String>,
    /// Desired pods that are being deleted.
    pub terminating: Vec<String>,
    /// Desired pods that exist, including the created ones.
    pub present: usize,
    pub desired: usize,
}

impl MemberPods {
    /// Every desired member has a pod that was neither just created nor is going away.
    pub fn settled(&self) -> bool {
        self.created.is_empty() && self.terminating.is_empty() && self.present == self.desired
    }
}

fn pod_image(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.image.as_deref())
}

/// Creates the missing member pods and reports the ones running an outdated image.
///
/// Pods beyond the desired set are left alone.
pub async fn ensure_member_pods<P: PlatformClient + ?Sized>(
    platform: &P,
    deployment: &ArangoDeployment,
    namespace: &str,
    oref: &OwnerReference,
) -> Result<MemberPods, StdError> {
    let name = deployment.name_any();
    let existing: BTreeMap<String, Pod> = platform
        .list_pods(namespace, &member_selector(&name))
        .await?
        .into_iter()
        .map(|pod| (pod.name_any(), pod))
        .collect();

    let mut members = MemberPods::default();
    let mut desired = BTreeSet::new();
    for (role, index) in desired_members(deployment) {
        let pod_name = pod_name(&name, role, index);
        desired.insert(pod_name.clone());

        members.desired += 1;

        if let Some(pod) = existing.get(&pod_name) {
            members.present += 1;
            if pod.metadata.deletion_timestamp.is_some() {
                members.terminating.push(pod_name);
            } else if pod_image(pod) != Some(deployment.spec.image.as_str()) {
                members.outdated.push(pod_name);
            }
            continue;
        }

        let pod = build_member_pod(deployment, namespace, role, index, oref);
        match platform.create_pod(namespace, &pod).await {
            Ok(_) => {
                info!(pod = %pod_name, %role, namespace, "Created member pod");
                members.created.push(pod_name);
                members.present += 1;
            }
            Err(e) if e.is_already_exists() => members.present += 1,
            Err(e) => return Err(e),
        }
    }

    for surplus in existing.keys().filter(|pod| !desired.contains(*pod)) {
        warn!(pod = %surplus, deployment = %name, "Member pod is not requested by the deployment, leaving it");
    }
    Ok(members)
}

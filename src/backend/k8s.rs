//! Claims, pods and namespaces on a Kubernetes cluster

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec as KubePodSpec, Volume, VolumeDevice,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, PostParams, PropagationPolicy};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::resource::{
    ClaimSpec, DeleteAck, PodSpec, ResourceBackend, ResourceHandle, ResourceKind,
    ResourceProvider, ResourceState,
};

/// Label put on everything created by a run
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "storage-churn";

/// Mount path of a filesystem claim inside its pod
pub const MOUNT_PATH: &str = "/var/lib/www/html";

/// Device path of a raw-block claim inside its pod
pub const BLOCK_DEVICE_PATH: &str = "/dev/rbdblock";

const VOLUME_NAME: &str = "claim";

/// `{prefix}-{uuid8}`
pub fn unique_name(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{prefix}-{suffix}")
}

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())])
}

/// Delete with background propagation; 404 means already gone
async fn delete_background<K>(api: &Api<K>, name: &str) -> Result<DeleteAck, ProviderError>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    let dp = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };

    match api.delete(name, &dp).await {
        Ok(_) => Ok(DeleteAck::Deleted),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(DeleteAck::AlreadyAbsent),
        Err(e) => Err(ProviderError::KubeError(e)),
    }
}

/// State of an object that may be mid-deletion
fn observed_state(meta: &ObjectMeta, phase: Option<&str>) -> ResourceState {
    if meta.deletion_timestamp.is_some() {
        return ResourceState::Terminating;
    }
    phase.map_or(ResourceState::Pending, ResourceState::from_phase)
}

/// Build the claim object for `spec`
pub fn claim_manifest(name: &str, spec: &ClaimSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![spec.access_mode.as_str().to_string()]),
            volume_mode: Some(spec.volume_mode.as_str().to_string()),
            storage_class_name: spec.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(spec.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a long-running pod consuming `spec.claim`
pub fn pod_manifest(name: &str, spec: &PodSpec, image: &str) -> Pod {
    let (volume_mounts, volume_devices) = if spec.raw_block {
        (
            None,
            Some(vec![VolumeDevice {
                name: VOLUME_NAME.to_string(),
                device_path: BLOCK_DEVICE_PATH.to_string(),
            }]),
        )
    } else {
        (
            Some(vec![VolumeMount {
                name: VOLUME_NAME.to_string(),
                mount_path: MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            None,
        )
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels()),
            ..Default::default()
        },
        spec: Some(KubePodSpec {
            containers: vec![Container {
                name: "workload".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "trap 'exit 0' TERM; while true; do sleep 5; done".to_string(),
                ]),
                volume_mounts,
                volume_devices,
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: spec.claim.clone(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Persistent volume claims in one namespace
#[derive(Clone)]
pub struct KubeClaimProvider {
    api: Api<PersistentVolumeClaim>,
}

impl KubeClaimProvider {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ResourceProvider<ClaimSpec> for KubeClaimProvider {
    async fn create(&self, spec: &ClaimSpec) -> Result<ResourceHandle, ProviderError> {
        let name = unique_name(&spec.name_prefix);
        self.api
            .create(&PostParams::default(), &claim_manifest(&name, spec))
            .await?;
        debug!(
            name = %name,
            interface = %spec.interface,
            access_mode = spec.access_mode.as_str(),
            volume_mode = spec.volume_mode.as_str(),
            "created claim"
        );
        Ok(ResourceHandle::new(name, spec.details(), Arc::new(self.clone())))
    }
}

#[async_trait]
impl ResourceBackend for KubeClaimProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Claim
    }

    async fn status(&self, id: &str) -> Result<ResourceState, ProviderError> {
        Ok(match self.api.get_opt(id).await? {
            Some(pvc) => observed_state(
                &pvc.metadata,
                pvc.status.as_ref().and_then(|s| s.phase.as_deref()),
            ),
            None => ResourceState::NotFound,
        })
    }

    async fn delete(&self, id: &str) -> Result<DeleteAck, ProviderError> {
        delete_background(&self.api, id).await
    }
}

/// Pods in one namespace
#[derive(Clone)]
pub struct KubePodProvider {
    api: Api<Pod>,
    image: String,
}

impl KubePodProvider {
    pub fn new(client: Client, namespace: &str, image: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            image: image.into(),
        }
    }
}

#[async_trait]
impl ResourceProvider<PodSpec> for KubePodProvider {
    async fn create(&self, spec: &PodSpec) -> Result<ResourceHandle, ProviderError> {
        let name = unique_name(&spec.name_prefix);
        self.api
            .create(&PostParams::default(), &pod_manifest(&name, spec, &self.image))
            .await?;
        debug!(name = %name, claim = %spec.claim, raw_block = spec.raw_block, "created pod");
        Ok(ResourceHandle::new(name, spec.details(), Arc::new(self.clone())))
    }
}

#[async_trait]
impl ResourceBackend for KubePodProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pod
    }

    async fn status(&self, id: &str) -> Result<ResourceState, ProviderError> {
        Ok(match self.api.get_opt(id).await? {
            Some(pod) => observed_state(
                &pod.metadata,
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            ),
            None => ResourceState::NotFound,
        })
    }

    async fn delete(&self, id: &str) -> Result<DeleteAck, ProviderError> {
        delete_background(&self.api, id).await
    }
}

/// Namespace created for one run and removed afterwards
pub struct ProjectNamespace {
    pub name: String,
    client: Client,
}

impl ProjectNamespace {
    /// Create a namespace named `{prefix}-{uuid8}`
    pub async fn create(client: Client, prefix: &str) -> Result<Self, ProviderError> {
        let name = unique_name(prefix);

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(labels()),
                ..Default::default()
            },
            ..Default::default()
        };

        let namespaces: Api<Namespace> = Api::all(client.clone());
        namespaces.create(&PostParams::default(), &ns).await?;

        info!(namespace = %name, "created project namespace");
        Ok(Self { name, client })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Start deleting the namespace and everything left in it.
    ///
    /// Does not wait for the deletion to finish.
    pub async fn cleanup(&self) -> Result<DeleteAck, ProviderError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ack = delete_background(&namespaces, &self.name).await?;
        debug!(namespace = %self.name, ?ack, "namespace deletion initiated");
        Ok(ack)
    }
}

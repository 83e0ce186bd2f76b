//! Extra disks for bare-metal nodes
//!
//! Every node of a freshly installed cluster gets one additional volume:
//! create it, wait for it to become available, attach it at a fixed device
//! path. Teardown detaches and deletes those volumes before the cluster goes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::executor::{BatchExecutor, DEFAULT_JOIN_POLL_INTERVAL, Task, TaskResult};
use crate::factory::ResourceFactory;
use crate::poller::PollSettings;
use crate::resource::{InstanceId, ResourceHandle, ResourceProvider, ResourceState, VolumeSpec};
use crate::tracker::{CleanupPolicy, LifecycleTracker};

/// Tracker group holding attached node volumes
pub const VOLUMES_GROUP: &str = "node-volumes";

/// Tag identifying which cluster a volume belongs to
pub const CLUSTER_TAG: &str = "cluster_name";

/// Volume to attach to each node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub name: String,
    pub size_gib: u32,
    /// Device path on the node, e.g. `/dev/vdb`
    pub device: String,
    pub tags: BTreeMap<String, String>,
}

impl VolumeRequest {
    pub fn for_cluster(config: &Config, cluster_name: &str) -> Self {
        Self {
            name: "disk0".to_string(),
            size_gib: config.volume_size_gib,
            device: config.volume_device.clone(),
            tags: BTreeMap::from([(CLUSTER_TAG.to_string(), cluster_name.to_string())]),
        }
    }

    fn spec(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.name.clone(),
            size_gib: self.size_gib,
            tags: self.tags.clone(),
        }
    }
}

pub struct VolumeProvisioner {
    factory: ResourceFactory<VolumeSpec>,
    executor: BatchExecutor,
    available: PollSettings,
    deleted: PollSettings,
    join_poll: Duration,
}

impl VolumeProvisioner {
    pub fn new(
        provider: Arc<dyn ResourceProvider<VolumeSpec>>,
        tracker: Arc<LifecycleTracker>,
        executor: BatchExecutor,
    ) -> Self {
        Self {
            factory: ResourceFactory::new(provider, tracker, VOLUMES_GROUP, CleanupPolicy::Deferred),
            executor,
            available: PollSettings::from_secs(300, 1),
            deleted: PollSettings::default(),
            join_poll: DEFAULT_JOIN_POLL_INTERVAL,
        }
    }

    /// Take timeouts and intervals from `config`
    pub fn with_config(mut self, config: &Config) -> Self {
        self.available = config.bound_poll();
        self.deleted = config.delete_poll();
        self.join_poll = config.join_poll_interval();
        self
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        self.factory.tracker()
    }

    /// Create, wait for and attach one volume per instance, concurrently.
    ///
    /// Results are in instance order. A volume is tracked as soon as it is
    /// created, so volumes of failed tasks are still removed by teardown.
    pub async fn provision_attached_volumes(
        &self,
        instances: &[InstanceId],
        request: &VolumeRequest,
    ) -> Vec<TaskResult<ResourceHandle>> {
        let tasks = instances
            .iter()
            .map(|instance| {
                let factory = self.factory.clone();
                let instance = instance.clone();
                let spec = request.spec();
                let device = request.device.clone();
                let available = self.available;

                Task::new(format!("volume-{instance}"), async move {
                    let volume = factory.create(&spec).await?;
                    volume
                        .wait_for_state(&ResourceState::Available, &available)
                        .await?;
                    volume.attach(&instance, &device).await?;
                    Ok::<_, Error>(volume)
                })
            })
            .collect();

        info!(instances = instances.len(), device = %request.device, "provisioning node volumes");
        self.executor.run_all(tasks, self.join_poll).await
    }

    /// Detach, delete and confirm deletion of each volume, concurrently.
    ///
    /// Confirmed volumes are no longer tracked. Volumes that could not be
    /// removed stay registered, or are registered back, for teardown.
    pub async fn detach_and_delete(&self, volumes: Vec<ResourceHandle>) -> Vec<TaskResult<String>> {
        let tasks = volumes
            .into_iter()
            .map(|volume| {
                let tracker = Arc::clone(self.tracker());
                let deleted = self.deleted;

                Task::new(format!("remove-{}", volume.id()), async move {
                    let outcome = async {
                        volume.detach().await?;
                        volume.delete().await?;
                        volume.wait_deleted(&deleted).await?;
                        Ok::<_, Error>(volume.id().to_string())
                    }
                    .await;
                    match &outcome {
                        Ok(id) => {
                            tracker.forget(VOLUMES_GROUP, id);
                        }
                        Err(e) => {
                            warn!(id = %volume.id(), error = %e, "volume removal failed");
                            tracker.register(VOLUMES_GROUP, volume);
                        }
                    }
                    outcome
                })
            })
            .collect();

        self.executor.run_all(tasks, self.join_poll).await
    }

    /// Remove every volume this provisioner still tracks
    pub async fn teardown(&self) -> Vec<TaskResult<String>> {
        let volumes = self.tracker().take(VOLUMES_GROUP);
        if volumes.is_empty() {
            return Vec::new();
        }
        info!(count = volumes.len(), "removing node volumes");
        self.detach_and_delete(volumes).await
    }
}

//! Capability view of externally managed resources
//!
//! The orchestration code only ever talks to a [`ResourceHandle`]. What sits
//! behind it (a Kubernetes claim, a pod, a cloud volume, an in-memory fake) is
//! a [`ResourceBackend`] chosen when the handle is created.

pub mod spec;

pub use spec::{AccessMode, ClaimSpec, PodSpec, StorageInterface, VolumeMode, VolumeSpec};

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{AttachError, DeleteError, Error, ProviderError, Result};
use crate::poller::{PollSettings, PollSuccess, wait_for};

/// Kind of an external resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Volume,
    Pod,
    Claim,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "Volume"),
            ResourceKind::Pod => write!(f, "Pod"),
            ResourceKind::Claim => write!(f, "Claim"),
        }
    }
}

/// Observed lifecycle state of an external resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Pending,
    Creating,
    Available,
    InUse,
    Bound,
    Running,
    Succeeded,
    Failed,
    Terminating,
    /// The external system no longer knows the resource
    NotFound,
    Other(String),
}

impl ResourceState {
    /// Parse a provider phase/status string (case-insensitive)
    pub fn from_phase(phase: &str) -> Self {
        match phase.to_ascii_lowercase().as_str() {
            "pending" => ResourceState::Pending,
            "creating" => ResourceState::Creating,
            "available" => ResourceState::Available,
            "in-use" | "inuse" => ResourceState::InUse,
            "bound" => ResourceState::Bound,
            "running" => ResourceState::Running,
            "succeeded" => ResourceState::Succeeded,
            "failed" | "error" => ResourceState::Failed,
            "terminating" | "deleting" => ResourceState::Terminating,
            "notfound" | "deleted" => ResourceState::NotFound,
            _ => ResourceState::Other(phase.to_string()),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Pending => write!(f, "Pending"),
            ResourceState::Creating => write!(f, "Creating"),
            ResourceState::Available => write!(f, "Available"),
            ResourceState::InUse => write!(f, "InUse"),
            ResourceState::Bound => write!(f, "Bound"),
            ResourceState::Running => write!(f, "Running"),
            ResourceState::Succeeded => write!(f, "Succeeded"),
            ResourceState::Failed => write!(f, "Failed"),
            ResourceState::Terminating => write!(f, "Terminating"),
            ResourceState::NotFound => write!(f, "NotFound"),
            ResourceState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Identifier of a compute instance a volume can be attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        InstanceId(s.to_string())
    }
}

/// Kind-specific facts recorded at creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDetails {
    Volume {
        size_gib: u32,
    },
    Claim {
        interface: StorageInterface,
        access_mode: AccessMode,
        volume_mode: VolumeMode,
    },
    Pod {
        /// Name of the claim the pod consumes
        claim: String,
        raw_block: bool,
    },
}

impl ResourceDetails {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDetails::Volume { .. } => ResourceKind::Volume,
            ResourceDetails::Claim { .. } => ResourceKind::Claim,
            ResourceDetails::Pod { .. } => ResourceKind::Pod,
        }
    }

    /// State a freshly created resource of this kind is expected to reach
    pub fn desired_state(&self) -> ResourceState {
        match self {
            ResourceDetails::Volume { .. } => ResourceState::Available,
            ResourceDetails::Claim { .. } => ResourceState::Bound,
            ResourceDetails::Pod { .. } => ResourceState::Running,
        }
    }
}

/// Acknowledgement of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAck {
    /// Deletion was accepted; the resource may still be terminating
    Deleted,
    /// Nothing to delete
    AlreadyAbsent,
}

/// Status, delete and attach calls against the external system.
///
/// Implementations must not cache: every `status` call is a fresh read.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn status(&self, id: &str) -> Result<ResourceState, ProviderError>;

    async fn delete(&self, id: &str) -> Result<DeleteAck, ProviderError>;

    async fn attach(
        &self,
        _id: &str,
        _target: &InstanceId,
        _mount_point: &str,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "attach",
        })
    }

    async fn detach(&self, _id: &str, _target: &InstanceId) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "detach",
        })
    }
}

/// Creates resources of one kind from a spec `S`.
#[async_trait]
pub trait ResourceProvider<S: Sync>: Send + Sync {
    async fn create(&self, spec: &S) -> Result<ResourceHandle, ProviderError>;
}

#[derive(Debug, Default)]
struct Observation {
    state: Option<ResourceState>,
    attached_to: Option<InstanceId>,
}

/// Reference to one externally managed resource.
///
/// Clones share the last observation, so a handle held by the tracker and the
/// copy used by a wait see the same `last_observed` state.
#[derive(Clone)]
pub struct ResourceHandle {
    id: String,
    details: ResourceDetails,
    desired_state: ResourceState,
    observed: Arc<Mutex<Observation>>,
    backend: Arc<dyn ResourceBackend>,
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observed = self.observation();
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("desired_state", &self.desired_state)
            .field("current_state", &observed.state)
            .field("attached_to", &observed.attached_to)
            .finish()
    }
}

impl ResourceHandle {
    pub fn new(
        id: impl Into<String>,
        details: ResourceDetails,
        backend: Arc<dyn ResourceBackend>,
    ) -> Self {
        let desired_state = details.desired_state();
        Self {
            id: id.into(),
            details,
            desired_state,
            observed: Arc::new(Mutex::new(Observation::default())),
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.details.kind()
    }

    pub fn details(&self) -> &ResourceDetails {
        &self.details
    }

    pub fn desired_state(&self) -> &ResourceState {
        &self.desired_state
    }

    /// Last state seen by a successful status read, if any
    pub fn last_observed(&self) -> Option<ResourceState> {
        self.observation().state.clone()
    }

    pub fn attached_to(&self) -> Option<InstanceId> {
        self.observation().attached_to.clone()
    }

    fn observation(&self) -> std::sync::MutexGuard<'_, Observation> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the state fresh from the external system.
    ///
    /// A not-found response is a valid observation, not an error.
    pub async fn current_state(&self) -> Result<ResourceState, ProviderError> {
        let state = match self.backend.status(&self.id).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => ResourceState::NotFound,
            Err(e) => return Err(e),
        };
        self.observation().state = Some(state.clone());
        Ok(state)
    }

    /// Delete the resource. Deleting an absent resource succeeds.
    pub async fn delete(&self) -> Result<DeleteAck, DeleteError> {
        let ack = match self.backend.delete(&self.id).await {
            Ok(ack) => ack,
            Err(e) if e.is_not_found() => DeleteAck::AlreadyAbsent,
            Err(source) => {
                return Err(DeleteError {
                    id: self.id.clone(),
                    kind: self.kind(),
                    source,
                });
            }
        };
        debug!(id = %self.id, kind = %self.kind(), ?ack, "delete issued");
        Ok(ack)
    }

    /// Poll until the resource reports `target`
    pub async fn wait_for_state(
        &self,
        target: &ResourceState,
        settings: &PollSettings,
    ) -> Result<PollSuccess> {
        let handle = self;
        wait_for(settings, move || async move {
            handle.current_state().await.map(|s| s == *target)
        })
        .await
        .map_err(|e| Error::wait(format!("{} {} to become {}", self.kind(), self.id, target), e))
    }

    /// Poll until the resource reaches the state its kind is created towards
    pub async fn wait_ready(&self, settings: &PollSettings) -> Result<PollSuccess> {
        self.wait_for_state(&self.desired_state, settings).await
    }

    /// Poll until the external system no longer knows the resource
    pub async fn wait_deleted(&self, settings: &PollSettings) -> Result<PollSuccess> {
        self.wait_for_state(&ResourceState::NotFound, settings)
            .await
    }

    /// Attach a volume to an instance at `mount_point`
    pub async fn attach(&self, target: &InstanceId, mount_point: &str) -> Result<(), AttachError> {
        let result = if self.kind() == ResourceKind::Volume {
            self.backend.attach(&self.id, target, mount_point).await
        } else {
            Err(ProviderError::Unsupported {
                kind: self.kind(),
                operation: "attach",
            })
        };

        result.map_err(|source| AttachError {
            id: self.id.clone(),
            kind: self.kind(),
            target: target.to_string(),
            source,
        })?;

        info!(id = %self.id, instance = %target, mount_point, "volume attached");
        self.observation().attached_to = Some(target.clone());
        Ok(())
    }

    /// Detach a volume from the instance it was attached to, if any
    pub async fn detach(&self) -> Result<(), AttachError> {
        let Some(target) = self.attached_to() else {
            return Ok(());
        };

        match self.backend.detach(&self.id, &target).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                return Err(AttachError {
                    id: self.id.clone(),
                    kind: self.kind(),
                    target: target.to_string(),
                    source,
                });
            }
        }

        info!(id = %self.id, instance = %target, "volume detached");
        self.observation().attached_to = None;
        Ok(())
    }
}

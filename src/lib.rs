//! Bulk resource-lifecycle orchestration
//!
//! Creates, polls and deletes externally managed resources (storage claims,
//! pods, cloud volumes) concurrently with bounded parallelism, and makes sure
//! everything a run creates is either confirmed deleted or left registered
//! for teardown.

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod factory;
pub mod poller;
pub mod resource;
pub mod scenario;
pub mod tracker;

pub use config::Config;
pub use error::{
    AttachError, CheckError, DeleteError, Error, PartialBatchFailure, PollError, ProviderError,
    Result, TimeoutError,
};
pub use executor::{BatchExecutor, Task, TaskHandle, TaskResult, TaskStatus, summarize};
pub use factory::ResourceFactory;
pub use poller::{PollSettings, PollSuccess, wait_for};
pub use resource::{
    AccessMode, ClaimSpec, DeleteAck, InstanceId, PodSpec, ResourceBackend, ResourceDetails,
    ResourceHandle, ResourceKind, ResourceProvider, ResourceState, StorageInterface, VolumeMode,
    VolumeSpec,
};
pub use scenario::{ChurnScenario, ScenarioPhase, ScenarioReport, StopHandle};
pub use tracker::{CleanupGuard, CleanupPolicy, CleanupReport, LifecycleTracker};

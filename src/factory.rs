//! Create-and-register factory
//!
//! Creating through a factory is what makes teardown reliable: the handle is
//! in the tracker before `create` returns, so even a task that fails right
//! after creating something leaves nothing untracked.

use std::sync::Arc;

use tracing::info;

use crate::error::{DeleteError, Result};
use crate::resource::{ResourceHandle, ResourceProvider};
use crate::tracker::{CleanupPolicy, LifecycleTracker};

pub struct ResourceFactory<S: Sync> {
    provider: Arc<dyn ResourceProvider<S>>,
    tracker: Arc<LifecycleTracker>,
    group: String,
}

impl<S: Sync> Clone for ResourceFactory<S> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            tracker: Arc::clone(&self.tracker),
            group: self.group.clone(),
        }
    }
}

impl<S: Sync> ResourceFactory<S> {
    /// Bind a provider to a tracker group, opening the group with `policy`
    pub fn new(
        provider: Arc<dyn ResourceProvider<S>>,
        tracker: Arc<LifecycleTracker>,
        group: impl Into<String>,
        policy: CleanupPolicy,
    ) -> Self {
        let group = group.into();
        tracker.open_group(&group, policy);
        Self {
            provider,
            tracker,
            group,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    /// Create one resource and register it before returning it
    pub async fn create(&self, spec: &S) -> Result<ResourceHandle> {
        let handle = self.provider.create(spec).await?;
        self.tracker.register(&self.group, handle.clone());
        info!(group = %self.group, id = %handle.id(), kind = %handle.kind(), "created resource");
        Ok(handle)
    }

    /// Create resources one after another, stopping at the first failure.
    ///
    /// Everything created before the failure stays registered.
    pub async fn create_many(&self, specs: &[S]) -> Result<Vec<ResourceHandle>> {
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            handles.push(self.create(spec).await?);
        }
        Ok(handles)
    }

    /// Delete everything this factory's group still tracks.
    ///
    /// Resources that are already gone count as deleted.
    pub async fn finalize(&self) -> Vec<Result<(), DeleteError>> {
        self.tracker.cleanup(&self.group).await
    }
}

//! Bookkeeping of created resources for deferred cleanup
//!
//! Every handle returned by a create call is registered here under a group id
//! before the create is reported complete. Teardown walks the groups and
//! deletes whatever is still registered, continuing past failures.
//!
//! Groups come in two flavours:
//! - [`CleanupPolicy::Immediate`] groups are owned by an explicit deletion
//!   phase of the caller. That phase [`forget`](LifecycleTracker::forget)s
//!   each resource once its deletion is confirmed, so teardown only sees the
//!   ones whose deletion failed or was never confirmed.
//! - [`CleanupPolicy::Deferred`] groups hold byproducts (claims created only to
//!   back pods, for example) and are deleted at teardown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::DeleteError;
use crate::resource::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Deleted by an explicit phase; teardown only sees what that phase could not confirm
    Immediate,
    /// Deleted at teardown
    Deferred,
}

/// One tracked group
#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub group: String,
    pub policy: CleanupPolicy,
    /// In registration order
    pub handles: Vec<ResourceHandle>,
}

/// Per-handle outcomes of cleaning up one group
#[derive(Debug)]
pub struct GroupCleanup {
    pub group: String,
    pub outcomes: Vec<Result<(), DeleteError>>,
}

/// Outcome of [`LifecycleTracker::cleanup_all`]
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// In the order groups were cleaned (most recently opened first)
    pub groups: Vec<GroupCleanup>,
}

impl CleanupReport {
    /// Number of deletes issued
    pub fn attempted(&self) -> usize {
        self.groups.iter().map(|g| g.outcomes.len()).sum()
    }

    /// Every delete that failed, in cleanup order
    pub fn failures(&self) -> impl Iterator<Item = &DeleteError> {
        self.groups
            .iter()
            .flat_map(|g| g.outcomes.iter())
            .filter_map(|o| o.as_ref().err())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// True when every delete succeeded or found the resource already gone
    pub fn is_clean(&self) -> bool {
        self.failure_count() == 0
    }
}

/// Thread-safe registry of created resources, grouped by logical operation
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    entries: Mutex<Vec<TrackerEntry>>,
}

impl LifecycleTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TrackerEntry>> {
        // A panicking registrant cannot leave a half-written entry behind, so
        // the data is still consistent after poisoning.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a group and its cleanup policy ahead of the batch that fills it.
    ///
    /// Opening an existing group keeps its handles and its original policy.
    pub fn open_group(&self, group: &str, policy: CleanupPolicy) {
        let mut entries = self.lock();
        match entries.iter().find(|e| e.group == group) {
            Some(existing) if existing.policy != policy => {
                warn!(group, existing = ?existing.policy, requested = ?policy, "group already open with a different policy");
            }
            Some(_) => {}
            None => {
                debug!(group, ?policy, "opened tracker group");
                entries.push(TrackerEntry {
                    group: group.to_string(),
                    policy,
                    handles: Vec::new(),
                });
            }
        }
    }

    /// Append a handle to a group, opening it as Deferred if needed.
    ///
    /// Registering the same resource id twice in one group is a no-op.
    pub fn register(&self, group: &str, handle: ResourceHandle) {
        let mut entries = self.lock();
        let entry = match entries.iter().position(|e| e.group == group) {
            Some(idx) => entries.get_mut(idx),
            None => {
                entries.push(TrackerEntry {
                    group: group.to_string(),
                    policy: CleanupPolicy::Deferred,
                    handles: Vec::new(),
                });
                entries.last_mut()
            }
        };
        let Some(entry) = entry else {
            return;
        };

        if entry.handles.iter().any(|h| h.id() == handle.id()) {
            debug!(group, id = %handle.id(), "resource already registered in group");
            return;
        }
        debug!(group, id = %handle.id(), kind = %handle.kind(), "registered resource");
        entry.handles.push(handle);
    }

    /// Handles currently registered in a group
    pub fn all_of(&self, group: &str) -> Vec<ResourceHandle> {
        self.lock()
            .iter()
            .find(|e| e.group == group)
            .map(|e| e.handles.clone())
            .unwrap_or_default()
    }

    /// Cleanup policy the group was opened with, if it exists
    pub fn policy_of(&self, group: &str) -> Option<CleanupPolicy> {
        self.lock()
            .iter()
            .find(|e| e.group == group)
            .map(|e| e.policy)
    }

    /// Group ids in the order they were opened
    pub fn groups(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.group.clone()).collect()
    }

    /// Total number of tracked handles across all groups
    pub fn len(&self) -> usize {
        self.lock().iter().map(|e| e.handles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a group and hand its resources to the caller.
    ///
    /// The caller becomes responsible for deleting them, and should
    /// [`register`](Self::register) back any it fails to delete.
    pub fn take(&self, group: &str) -> Vec<ResourceHandle> {
        let mut entries = self.lock();
        match entries.iter().position(|e| e.group == group) {
            Some(idx) => {
                let entry = entries.remove(idx);
                debug!(group, count = entry.handles.len(), "took tracker group");
                entry.handles
            }
            None => Vec::new(),
        }
    }

    /// Stop tracking one resource, e.g. after its deletion was confirmed
    pub fn forget(&self, group: &str, id: &str) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.group == group) else {
            return false;
        };
        let before = entry.handles.len();
        entry.handles.retain(|h| h.id() != id);
        entry.handles.len() != before
    }

    /// Delete every handle of a group, newest first, and drop the group.
    ///
    /// Individual failures do not stop the sweep; each handle's outcome is
    /// returned in deletion order.
    pub async fn cleanup(&self, group: &str) -> Vec<Result<(), DeleteError>> {
        let handles = self.take(group);
        if handles.is_empty() {
            return Vec::new();
        }

        info!(group, count = handles.len(), "cleaning up tracker group");
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles.iter().rev() {
            let outcome = handle.delete().await.map(|_| ());
            if let Err(ref e) = outcome {
                warn!(group, id = %handle.id(), error = %e, "cleanup delete failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Clean up every remaining group, most recently opened first
    pub async fn cleanup_all(&self) -> CleanupReport {
        let mut groups = self.groups();
        groups.reverse();

        let mut report = CleanupReport::default();
        for group in groups {
            let outcomes = self.cleanup(&group).await;
            if !outcomes.is_empty() {
                report.groups.push(GroupCleanup { group, outcomes });
            }
        }

        if report.attempted() > 0 {
            info!(
                attempted = report.attempted(),
                failed = report.failure_count(),
                "tracker cleanup finished"
            );
        }
        report
    }
}

/// Teardown hook for a tracker.
///
/// Call [`run`](Self::run) from the surrounding test or program's teardown.
/// If the guard is dropped without `run` being called (a panic unwinding
/// through a test, for example) the cleanup is spawned onto the current Tokio
/// runtime instead, when there is one.
pub struct CleanupGuard {
    tracker: Arc<LifecycleTracker>,
    armed: bool,
}

impl CleanupGuard {
    /// Arm a guard over `tracker`
    pub fn new(tracker: Arc<LifecycleTracker>) -> Self {
        Self {
            tracker,
            armed: true,
        }
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    /// Delete everything still tracked and disarm the guard.
    ///
    /// Resources that fail to delete are reported, not retried.
    pub async fn run(mut self) -> CleanupReport {
        self.armed = false;
        self.tracker.cleanup_all().await
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed || self.tracker.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tracker = Arc::clone(&self.tracker);
                warn!(
                    count = tracker.len(),
                    "cleanup guard dropped without running, spawning cleanup"
                );
                runtime.spawn(async move {
                    tracker.cleanup_all().await;
                });
            }
            Err(_) => {
                warn!(
                    count = self.tracker.len(),
                    "cleanup guard dropped outside a runtime, resources may leak"
                );
            }
        }
    }
}

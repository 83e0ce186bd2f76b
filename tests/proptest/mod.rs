// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for polling, tracking and claim distribution
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. A never-satisfied wait makes exactly ceil(timeout / interval) attempts
//!    and never overruns the timeout by more than one interval
//! 2. The tracker keeps exactly one entry per distinct id
//! 3. Claim distribution only uses modes the interface supports
//! 4. The scenario state machine never panics on any phase/event pair

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use storage_churn::error::{PollError, ProviderError};
use storage_churn::poller::{PollSettings, wait_for};
use storage_churn::resource::{
    ClaimSpec, DeleteAck, ResourceBackend, ResourceDetails, ResourceHandle, ResourceKind,
    ResourceState, StorageInterface,
};
use storage_churn::scenario::{
    PhaseTally, ScenarioEvent, ScenarioPhase, ScenarioStateMachine, TransitionResult,
};
use storage_churn::tracker::LifecycleTracker;

// =============================================================================
// Helpers
// =============================================================================

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

/// Backend that is never consulted; tracker tests only look at ids
struct NullBackend;

#[async_trait]
impl ResourceBackend for NullBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    async fn status(&self, _id: &str) -> Result<ResourceState, ProviderError> {
        Ok(ResourceState::Available)
    }

    async fn delete(&self, _id: &str) -> Result<DeleteAck, ProviderError> {
        Ok(DeleteAck::Deleted)
    }
}

fn volume(backend: &Arc<NullBackend>, id: &str) -> ResourceHandle {
    ResourceHandle::new(
        id,
        ResourceDetails::Volume { size_gib: 1 },
        Arc::clone(backend) as Arc<dyn ResourceBackend>,
    )
}

fn storage_interface() -> impl Strategy<Value = StorageInterface> {
    prop_oneof![
        Just(StorageInterface::CephBlockPool),
        Just(StorageInterface::CephFileSystem),
    ]
}

fn scenario_phase() -> impl Strategy<Value = ScenarioPhase> {
    prop_oneof![
        Just(ScenarioPhase::Provision1),
        Just(ScenarioPhase::AwaitBound1),
        Just(ScenarioPhase::SpawnPods1),
        Just(ScenarioPhase::AwaitRunning1),
        Just(ScenarioPhase::ProvisionWave2AndDeleteWave1),
        Just(ScenarioPhase::AwaitConvergence),
        Just(ScenarioPhase::VerifyDeletion),
        Just(ScenarioPhase::Terminal),
        Just(ScenarioPhase::Aborted),
    ]
}

fn scenario_event() -> impl Strategy<Value = ScenarioEvent> {
    prop_oneof![
        Just(ScenarioEvent::ClaimsProvisioned),
        Just(ScenarioEvent::ClaimsBound),
        Just(ScenarioEvent::PodsSpawned),
        Just(ScenarioEvent::PodsRunning),
        Just(ScenarioEvent::FanOutResolved),
        Just(ScenarioEvent::Converged),
        Just(ScenarioEvent::DeletionVerified),
        Just(ScenarioEvent::PhaseFailed),
    ]
}

fn phase_tally() -> impl Strategy<Value = PhaseTally> {
    (0usize..10, 0usize..10, 0usize..10).prop_map(|(e, r, f)| PhaseTally::new(e, r, f))
}

// =============================================================================
// Poller
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_never_true_check_attempt_count(timeout_secs in 1u64..120, interval_secs in 1u64..15) {
        let settings = PollSettings::from_secs(timeout_secs, interval_secs);
        let rt = paused_runtime();

        let err = rt
            .block_on(wait_for(&settings, || async { Ok::<_, ProviderError>(false) }))
            .unwrap_err();

        let PollError::Timeout(timeout) = err else {
            panic!("expected timeout, got {err:?}");
        };
        prop_assert_eq!(u64::from(timeout.attempts), timeout_secs.div_ceil(interval_secs));
        prop_assert!(timeout.elapsed >= settings.timeout);
        prop_assert!(timeout.elapsed <= settings.timeout + settings.interval);
    }

    #[test]
    fn prop_check_true_on_attempt_k(k in 1u32..20, interval_secs in 1u64..5) {
        // Timeout comfortably above k attempts
        let settings = PollSettings::from_secs(u64::from(k) * interval_secs + 60, interval_secs);
        let rt = paused_runtime();

        let mut calls = 0u32;
        let success = rt
            .block_on(wait_for(&settings, || {
                calls += 1;
                let done = calls >= k;
                async move { Ok::<_, ProviderError>(done) }
            }))
            .unwrap();

        prop_assert_eq!(success.attempts, k);
        prop_assert_eq!(
            success.elapsed,
            Duration::from_secs(u64::from(k - 1) * interval_secs)
        );
    }
}

// =============================================================================
// Tracker
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_register_keeps_one_entry_per_id(ids in prop::collection::vec("[a-z]{1,3}", 0..40)) {
        let backend = Arc::new(NullBackend);
        let tracker = LifecycleTracker::new();
        for id in &ids {
            tracker.register("volumes", volume(&backend, id));
        }

        let distinct: HashSet<&String> = ids.iter().collect();
        prop_assert_eq!(tracker.all_of("volumes").len(), distinct.len());
        prop_assert_eq!(tracker.len(), distinct.len());

        // Registration order is first-seen order
        let mut seen = HashSet::new();
        let first_seen: Vec<&String> = ids.iter().filter(|id| seen.insert(*id)).collect();
        let tracked: Vec<String> = tracker
            .all_of("volumes")
            .iter()
            .map(|h| h.id().to_string())
            .collect();
        prop_assert_eq!(tracked.iter().collect::<Vec<_>>(), first_seen);
    }

    #[test]
    fn prop_take_empties_group(count in 0usize..20) {
        let backend = Arc::new(NullBackend);
        let tracker = LifecycleTracker::new();
        for i in 0..count {
            tracker.register("volumes", volume(&backend, &format!("vol-{i}")));
        }

        prop_assert_eq!(tracker.take("volumes").len(), count);
        prop_assert!(tracker.all_of("volumes").is_empty());
    }
}

// =============================================================================
// Claim distribution
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_distribute_uses_supported_modes(
        interface in storage_interface(),
        count in 0usize..30,
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let specs = ClaimSpec::distribute(interface, count, "1Gi", None, &mut rng);
        let supported = interface.supported_modes();

        prop_assert_eq!(specs.len(), count);
        for spec in &specs {
            prop_assert!(supported.contains(&(spec.access_mode, spec.volume_mode)));
            prop_assert_eq!(spec.interface, interface);
        }

        let used: HashSet<_> = specs.iter().map(|s| (s.access_mode, s.volume_mode)).collect();
        prop_assert_eq!(used.len(), count.min(supported.len()));
    }

    #[test]
    fn prop_distribute_deterministic_for_seed(interface in storage_interface(), seed in any::<u64>()) {
        let first = ClaimSpec::distribute(interface, 6, "1Gi", None, &mut StdRng::seed_from_u64(seed));
        let second = ClaimSpec::distribute(interface, 6, "1Gi", None, &mut StdRng::seed_from_u64(seed));
        prop_assert_eq!(first, second);
    }
}

// =============================================================================
// State machine
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_state_machine_no_panic(
        phase in scenario_phase(),
        event in scenario_event(),
        tally in phase_tally(),
    ) {
        let sm = ScenarioStateMachine::new();
        let _ = sm.transition(&phase, event, &tally);
        let _ = sm.valid_events(&phase);
    }

    #[test]
    fn prop_terminal_phases_accept_nothing(event in scenario_event(), tally in phase_tally()) {
        let sm = ScenarioStateMachine::new();
        for phase in [ScenarioPhase::Terminal, ScenarioPhase::Aborted] {
            prop_assert!(!sm.can_transition(&phase, &event));
            let is_invalid = matches!(
                sm.transition(&phase, event, &tally),
                TransitionResult::InvalidTransition { .. }
            );
            prop_assert!(is_invalid);
        }
    }

    #[test]
    fn prop_abort_always_allowed(phase in scenario_phase(), tally in phase_tally()) {
        let sm = ScenarioStateMachine::new();
        prop_assert_eq!(
            sm.can_transition(&phase, &ScenarioEvent::PhaseFailed),
            !phase.is_terminal()
        );
        let _ = sm.transition(&phase, ScenarioEvent::PhaseFailed, &tally);
    }
}

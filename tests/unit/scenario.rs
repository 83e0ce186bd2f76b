//! Churn scenario runs against in-memory claims and pods

use std::sync::Arc;
use std::time::Duration;

use storage_churn::resource::{PodSpec, ResourceDetails};
use storage_churn::scenario::{ChurnScenario, PhaseTally, ScenarioPhase, groups};
use storage_churn::tracker::{CleanupGuard, LifecycleTracker};

use crate::common::*;

fn scenario(claims: &FakeProvider, pods: &FakeProvider) -> ChurnScenario {
    init_tracing();
    ChurnScenario::new(
        test_config(),
        Arc::new(claims.clone()),
        Arc::new(pods.clone()),
    )
}

/// Pods the scenario creates for the claims in `group`
fn pods_for(tracker: &LifecycleTracker, group: &str) -> usize {
    tracker
        .all_of(group)
        .iter()
        .map(|claim| PodSpec::for_claim(claim).len())
        .sum()
}

mod happy_path {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reaches_terminal_with_no_failures() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run().await;

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.final_phase, ScenarioPhase::Terminal);
        assert_eq!(scenario.phase(), ScenarioPhase::Terminal);
        assert_eq!(report.phases.len(), 7);
        assert_eq!(report.failure_count(), 0);
        assert!(report.cleanup.is_none());

        let fan_out = report
            .phase(ScenarioPhase::ProvisionWave2AndDeleteWave1)
            .unwrap();
        assert_eq!(fan_out.tally, PhaseTally::new(5, 5, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave1_confirmed_absent_and_wave2_live() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run().await;
        assert!(report.is_success(), "{report:?}");

        let tracker = scenario.tracker();
        assert!(tracker.all_of(groups::WAVE1_PODS).is_empty());
        assert!(tracker.all_of(groups::DELETE_CLAIMS).is_empty());

        // Three claim sets per interface up front, one more per interface during the churn
        assert_eq!(claims.created(), 8);
        // The two deletion claims are gone
        assert_eq!(claims.live().len(), 6);

        let wave1_pods = pods_for(tracker, groups::WAVE1_CLAIMS);
        let wave2_pods = pods_for(tracker, groups::WAVE2_POD_CLAIMS);
        assert!(wave1_pods >= 2);
        assert_eq!(pods.created(), wave1_pods + wave2_pods);
        assert_eq!(pods.live().len(), wave2_pods);
        assert_eq!(tracker.all_of(groups::WAVE2_PODS).len(), wave2_pods);

        let verify = report.phase(ScenarioPhase::VerifyDeletion).unwrap();
        assert_eq!(verify.tally.expected, wave1_pods + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_leaves_deferred_groups_for_teardown() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let tracker = Arc::new(LifecycleTracker::new());
        let guard = CleanupGuard::new(Arc::clone(&tracker));
        let mut scenario = scenario(&claims, &pods).with_tracker(tracker);

        let report = scenario.run().await;
        assert!(report.is_success(), "{report:?}");
        assert!(!scenario.tracker().is_empty());
        let wave2_pods = pods.live().len();

        let cleanup = guard.run().await;
        assert!(cleanup.is_clean());
        assert_eq!(cleanup.attempted(), 6 + wave2_pods);
        assert!(claims.live().is_empty());
        assert!(pods.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_cleanup_removes_everything() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run_with_cleanup().await;

        assert!(report.is_success(), "{report:?}");
        let cleanup = report.cleanup.as_ref().unwrap();
        assert!(cleanup.is_clean());
        assert!(claims.live().is_empty());
        assert!(pods.live().is_empty());
        assert!(scenario.tracker().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_same_access_modes() {
        let details = |scenario: &ChurnScenario| -> Vec<ResourceDetails> {
            scenario
                .tracker()
                .all_of(groups::WAVE1_CLAIMS)
                .iter()
                .map(|h| h.details().clone())
                .collect()
        };

        let (claims_a, pods_a) = (FakeProvider::claims(), FakeProvider::pods());
        let mut first = scenario(&claims_a, &pods_a);
        first.run().await;

        let (claims_b, pods_b) = (FakeProvider::claims(), FakeProvider::pods());
        let mut second = scenario(&claims_b, &pods_b);
        second.run().await;

        assert_eq!(details(&first), details(&second));
        assert_eq!(pods_a.created(), pods_b.created());
    }
}

mod abort_path {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pod_creation_failure_aborts_and_cleans_up() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods().rejecting_creates();
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        assert!(!report.is_success());
        let spawn = report.phase(ScenarioPhase::SpawnPods1).unwrap();
        assert!(!spawn.failures.is_empty());
        assert_eq!(spawn.failures.len(), spawn.tally.failed);
        assert!(report.phase(ScenarioPhase::AwaitRunning1).is_none());

        // Every claim created so far was deleted by teardown
        let cleanup = report.cleanup.as_ref().unwrap();
        assert_eq!(cleanup.attempted(), 6);
        assert!(cleanup.is_clean());
        assert!(claims.live().is_empty());
        assert_eq!(pods.created(), 0);
        assert!(scenario.tracker().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_never_binding_time_out() {
        init_tracing();
        let claims = FakeProvider::claims().stuck();
        let pods = FakeProvider::pods();
        let config = storage_churn::Config {
            bound_timeout_secs: 30,
            ..test_config()
        };
        let mut scenario = ChurnScenario::new(
            config,
            Arc::new(claims.clone()),
            Arc::new(pods.clone()),
        );

        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        let bound = report.phase(ScenarioPhase::AwaitBound1).unwrap();
        assert_eq!(bound.tally, PhaseTally::new(6, 6, 6));
        assert!(bound.failures.iter().all(|f| f.contains("to become Bound")));
        assert_eq!(pods.created(), 0);
        assert!(claims.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bulk_delete_blocks_convergence() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);
        pods.set_reject_deletes(true);

        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        let fan_out = report
            .phase(ScenarioPhase::ProvisionWave2AndDeleteWave1)
            .unwrap();
        assert_eq!(fan_out.tally, PhaseTally::new(5, 5, 1));
        assert!(fan_out.failures[0].starts_with("delete-pods-wave1"));
        assert!(report.phase(ScenarioPhase::AwaitConvergence).is_none());

        // Wave-1 pods stayed tracked, so teardown retried them
        let cleanup = report.cleanup.as_ref().unwrap();
        assert_eq!(cleanup.failure_count(), pods.created());
        assert!(claims.live().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_bulk_delete_keeps_every_wave1_pod_tracked() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        pods.reject_delete_of("pod-0000");
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        let fan_out = report
            .phase(ScenarioPhase::ProvisionWave2AndDeleteWave1)
            .unwrap();
        assert_eq!(fan_out.tally, PhaseTally::new(5, 5, 1));
        assert!(fan_out.failures[0].starts_with("delete-pods-wave1"));
        assert!(fan_out.failures[0].contains("pod-0000"));

        // Accepted deletes are not dropped: teardown sees the whole wave
        let wave1_pods = report.phase(ScenarioPhase::AwaitRunning1).unwrap().tally.expected;
        assert!(wave1_pods >= 2);
        let cleanup = report.cleanup.as_ref().unwrap();
        let group = |name: &str| cleanup.groups.iter().find(|g| g.group == name).unwrap();
        assert_eq!(group(groups::WAVE1_PODS).outcomes.len(), wave1_pods);
        assert_eq!(group(groups::DELETE_CLAIMS).outcomes.len(), 2);
        assert_eq!(cleanup.failure_count(), 1);

        assert_eq!(pods.live(), vec!["pod-0000".to_string()]);
        assert!(claims.live().is_empty());
        assert!(scenario.tracker().is_empty());
    }
}

mod concurrency {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_run_side_by_side() {
        init_tracing();
        let claims = FakeProvider::claims().stuck();
        let pods = FakeProvider::pods();
        let config = storage_churn::Config {
            bound_timeout_secs: 30,
            ..test_config()
        };
        let mut scenario = ChurnScenario::new(
            config,
            Arc::new(claims.clone()),
            Arc::new(pods.clone()),
        );

        let report = scenario.run().await;

        // Six claims one after another would take six timeouts
        let bound = report.phase(ScenarioPhase::AwaitBound1).unwrap();
        assert_eq!(bound.tally.expected, 6);
        assert!(bound.elapsed >= Duration::from_secs(30));
        assert!(bound.elapsed <= Duration::from_secs(33), "{:?}", bound.elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_groups_overlap() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods().with_latency(Duration::from_secs(20));
        let mut scenario = scenario(&claims, &pods);

        let report = scenario.run().await;
        assert!(report.is_success(), "{report:?}");

        let tracker = scenario.tracker();
        let wave1_pods = pods_for(tracker, groups::WAVE1_CLAIMS);
        let wave2_pods = pods_for(tracker, groups::WAVE2_POD_CLAIMS);
        assert!(wave1_pods >= 1 && wave2_pods >= 1);

        // Deleting wave 1 and creating wave 2 back to back would take the sum
        let serial = Duration::from_secs(20) * u32::try_from(wave1_pods + wave2_pods).unwrap();
        let fan_out = report
            .phase(ScenarioPhase::ProvisionWave2AndDeleteWave1)
            .unwrap();
        assert!(fan_out.elapsed < serial, "{:?} >= {serial:?}", fan_out.elapsed);
    }
}

mod stopping {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_run_creates_nothing() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);
        scenario.stop_handle().stop();

        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        assert_eq!(report.phases.len(), 1);
        let provision = report.phase(ScenarioPhase::Provision1).unwrap();
        assert!(provision.failures[0].contains("stop requested"));
        assert_eq!(claims.created(), 0);
        assert_eq!(report.cleanup.as_ref().unwrap().attempted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_run_finishes_phase_then_tears_down() {
        let claims = FakeProvider::claims();
        let pods = FakeProvider::pods();
        let mut scenario = scenario(&claims, &pods);
        let stop = scenario.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            stop.stop();
        });
        let report = scenario.run().await;

        assert_eq!(report.final_phase, ScenarioPhase::Aborted);
        let provision = report.phase(ScenarioPhase::Provision1).unwrap();
        assert!(provision.failures.is_empty(), "{provision:?}");
        let bound = report.phase(ScenarioPhase::AwaitBound1).unwrap();
        assert!(bound.failures[0].contains("stop requested"));

        // Everything the finished phase created was tracked and removed
        let cleanup = report.cleanup.as_ref().unwrap();
        assert_eq!(cleanup.attempted(), 6);
        assert!(cleanup.is_clean());
        assert!(claims.live().is_empty());
        assert_eq!(pods.created(), 0);
        assert!(scenario.tracker().is_empty());
    }
}

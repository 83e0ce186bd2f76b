//! PVC/pod churn scenario
//!
//! Creates claims and pods on both storage interfaces, then deletes the first
//! wave while the second wave is being created, and checks that the new
//! resources converge while the old ones disappear.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{PartialBatchFailure, Result};
use crate::executor::{BatchExecutor, Task, TaskResult};
use crate::factory::ResourceFactory;
use crate::resource::{
    ClaimSpec, PodSpec, ResourceHandle, ResourceKind, ResourceProvider, StorageInterface,
};
use crate::tracker::{CleanupPolicy, CleanupReport, LifecycleTracker};

use super::state_machine::{
    PhaseTally, ScenarioEvent, ScenarioPhase, ScenarioStateMachine, TransitionResult,
};

/// Tracker groups used by the scenario
pub mod groups {
    /// Claims backing the wave-1 pods
    pub const WAVE1_CLAIMS: &str = "wave1-claims";
    /// Claims created only to be deleted during the churn
    pub const DELETE_CLAIMS: &str = "wave1-delete-claims";
    /// Claims backing the wave-2 pods
    pub const WAVE2_POD_CLAIMS: &str = "wave2-pod-claims";
    pub const WAVE1_PODS: &str = "wave1-pods";
    /// Claims created during the churn
    pub const WAVE2_CLAIMS: &str = "wave2-claims";
    pub const WAVE2_PODS: &str = "wave2-pods";
}

const INTERFACES: [StorageInterface; 2] = [
    StorageInterface::CephBlockPool,
    StorageInterface::CephFileSystem,
];

const CREATE_RBD_CLAIMS: &str = "create-rbd-claims";
const CREATE_CEPHFS_CLAIMS: &str = "create-cephfs-claims";
const CREATE_WAVE2_PODS: &str = "create-pods-for-wave2";
const DELETE_WAVE1_PODS: &str = "delete-pods-wave1";
const DELETE_WAVE1_CLAIMS: &str = "delete-claims-wave1";

/// What one phase did
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: ScenarioPhase,
    pub tally: PhaseTally,
    /// `label: error` for every failed task or wait
    pub failures: Vec<String>,
    pub elapsed: Duration,
}

/// Outcome of a churn run
#[derive(Debug)]
pub struct ScenarioReport {
    pub final_phase: ScenarioPhase,
    pub phases: Vec<PhaseReport>,
    /// Set once teardown has run
    pub cleanup: Option<CleanupReport>,
}

impl ScenarioReport {
    /// Reached `Terminal` with no failed task in any phase
    pub fn is_success(&self) -> bool {
        self.final_phase == ScenarioPhase::Terminal && self.failure_count() == 0
    }

    /// Failed tasks and waits across all phases
    pub fn failure_count(&self) -> usize {
        self.phases.iter().map(|p| p.failures.len()).sum()
    }

    pub fn phase(&self, phase: ScenarioPhase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

struct PhaseOutcome {
    tally: PhaseTally,
    failures: Vec<String>,
}

impl PhaseOutcome {
    fn from_tasks<T>(results: &[TaskResult<T>]) -> Self {
        let failures: Vec<String> = results
            .iter()
            .filter_map(|r| r.error().map(|e| format!("{}: {}", r.label(), e)))
            .collect();
        Self {
            tally: PhaseTally::new(results.len(), results.len(), failures.len()),
            failures,
        }
    }

    fn from_outcomes(outcomes: Vec<(String, Result<()>)>) -> Self {
        let total = outcomes.len();
        let failures: Vec<String> = outcomes
            .into_iter()
            .filter_map(|(label, outcome)| outcome.err().map(|e| format!("{label}: {e}")))
            .collect();
        Self {
            tally: PhaseTally::new(total, total, failures.len()),
            failures,
        }
    }
}

/// Groups whose resources are deleted during the churn and confirmed after it
const DELETED_GROUPS: [&str; 2] = [groups::WAVE1_PODS, groups::DELETE_CLAIMS];

/// Requests a running scenario to stop after its current phase.
///
/// Stopping closes the scenario's executor, so queued tasks of the current
/// phase fail instead of starting. The run then aborts and tears down
/// everything it tracks before returning.
#[derive(Clone, Debug)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    executor: BatchExecutor,
}

impl StopHandle {
    /// Request a stop. Only the first call has any effect
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            warn!("stop requested, finishing current phase");
            self.executor.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

pub struct ChurnScenario {
    config: Config,
    claims: Arc<dyn ResourceProvider<ClaimSpec>>,
    pods: Arc<dyn ResourceProvider<PodSpec>>,
    tracker: Arc<LifecycleTracker>,
    executor: BatchExecutor,
    machine: ScenarioStateMachine,
    rng: StdRng,
    phase: ScenarioPhase,
    stop: StopHandle,
}

impl ChurnScenario {
    /// Build a scenario over the given claim and pod providers.
    ///
    /// The RNG is seeded from `config.seed` when set, so the access modes
    /// chosen for each claim are reproducible.
    pub fn new(
        config: Config,
        claims: Arc<dyn ResourceProvider<ClaimSpec>>,
        pods: Arc<dyn ResourceProvider<PodSpec>>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let executor = BatchExecutor::new(config.max_workers);
        Self {
            stop: StopHandle {
                stopping: Arc::new(AtomicBool::new(false)),
                executor: executor.clone(),
            },
            executor,
            tracker: Arc::new(LifecycleTracker::new()),
            machine: ScenarioStateMachine::new(),
            rng,
            phase: ScenarioPhase::Provision1,
            config,
            claims,
            pods,
        }
    }

    /// Register into an existing tracker, e.g. one owned by a [`CleanupGuard`]
    ///
    /// [`CleanupGuard`]: crate::tracker::CleanupGuard
    pub fn with_tracker(mut self, tracker: Arc<LifecycleTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    /// Current phase; `Terminal` or `Aborted` once `run` returns
    pub fn phase(&self) -> ScenarioPhase {
        self.phase
    }

    /// Handle for stopping this scenario from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run every phase, then tear down everything still tracked
    pub async fn run_with_cleanup(&mut self) -> ScenarioReport {
        let mut report = self.run().await;
        if report.cleanup.is_none() {
            report.cleanup = Some(self.tracker.cleanup_all().await);
        }
        report
    }

    /// Run phases until `Terminal` or `Aborted`.
    ///
    /// An aborted run cleans up the tracker before returning. A successful run
    /// leaves its deferred groups registered for the caller's teardown.
    pub async fn run(&mut self) -> ScenarioReport {
        let mut phases = Vec::new();
        let mut created = Vec::new();

        info!(
            claims_per_interface = self.config.claims_per_interface,
            claim_size = %self.config.claim_size,
            max_workers = self.executor.max_workers(),
            "starting churn scenario"
        );

        while !self.phase.is_terminal() {
            let phase = self.phase;
            let started = Instant::now();

            if self.stop.is_stopped() {
                let outcome = PhaseOutcome {
                    tally: PhaseTally::new(1, 1, 1),
                    failures: vec![format!("{phase}: stop requested before the phase started")],
                };
                self.advance(phase, ScenarioEvent::PhaseFailed, &outcome);
                phases.push(PhaseReport {
                    phase,
                    tally: outcome.tally,
                    failures: outcome.failures,
                    elapsed: started.elapsed(),
                });
                continue;
            }

            let (outcome, success) = match phase {
                ScenarioPhase::Provision1 => (
                    self.provision_first_wave().await,
                    ScenarioEvent::ClaimsProvisioned,
                ),
                ScenarioPhase::AwaitBound1 => {
                    let claims = [
                        groups::WAVE1_CLAIMS,
                        groups::DELETE_CLAIMS,
                        groups::WAVE2_POD_CLAIMS,
                    ]
                    .iter()
                    .flat_map(|group| self.tracker.all_of(group))
                    .collect();
                    (self.await_ready(claims).await, ScenarioEvent::ClaimsBound)
                }
                ScenarioPhase::SpawnPods1 => {
                    (self.spawn_first_wave_pods().await, ScenarioEvent::PodsSpawned)
                }
                ScenarioPhase::AwaitRunning1 => {
                    let pods = self.tracker.all_of(groups::WAVE1_PODS);
                    (self.await_ready(pods).await, ScenarioEvent::PodsRunning)
                }
                ScenarioPhase::ProvisionWave2AndDeleteWave1 => {
                    let (outcome, wave2) = self.churn().await;
                    created = wave2;
                    (outcome, ScenarioEvent::FanOutResolved)
                }
                ScenarioPhase::AwaitConvergence => {
                    let wave2 = std::mem::take(&mut created);
                    (self.await_ready(wave2).await, ScenarioEvent::Converged)
                }
                ScenarioPhase::VerifyDeletion => (
                    self.verify_deletion().await,
                    ScenarioEvent::DeletionVerified,
                ),
                ScenarioPhase::Terminal | ScenarioPhase::Aborted => break,
            };

            self.advance(phase, success, &outcome);
            phases.push(PhaseReport {
                phase,
                tally: outcome.tally,
                failures: outcome.failures,
                elapsed: started.elapsed(),
            });
        }

        let cleanup = if self.phase == ScenarioPhase::Aborted {
            Some(self.tracker.cleanup_all().await)
        } else {
            None
        };

        let report = ScenarioReport {
            final_phase: self.phase,
            phases,
            cleanup,
        };
        if report.is_success() {
            info!("churn scenario completed");
        } else {
            error!(
                phase = %report.final_phase,
                failures = report.failure_count(),
                "churn scenario failed"
            );
        }
        report
    }

    fn advance(&mut self, phase: ScenarioPhase, success: ScenarioEvent, outcome: &PhaseOutcome) {
        let event = outcome.tally.event(success);
        match self.machine.transition(&phase, event, &outcome.tally) {
            TransitionResult::Success {
                to, description, ..
            } => {
                if to == ScenarioPhase::Aborted {
                    error!(
                        phase = %phase,
                        failed = outcome.tally.failed,
                        failures = ?outcome.failures,
                        "{description}"
                    );
                } else {
                    info!(from = %phase, to = %to, "{description}");
                }
                self.phase = to;
            }
            TransitionResult::GuardFailed { reason, .. } => {
                error!(phase = %phase, %event, %reason, "phase guard failed, aborting run");
                self.phase = ScenarioPhase::Aborted;
            }
            TransitionResult::InvalidTransition { current, event } => {
                error!(phase = %current, %event, "invalid phase transition, aborting run");
                self.phase = ScenarioPhase::Aborted;
            }
        }
    }

    fn claim_factory(&self, group: &str, policy: CleanupPolicy) -> ResourceFactory<ClaimSpec> {
        ResourceFactory::new(
            Arc::clone(&self.claims),
            Arc::clone(&self.tracker),
            group,
            policy,
        )
    }

    fn pod_factory(&self, group: &str, policy: CleanupPolicy) -> ResourceFactory<PodSpec> {
        ResourceFactory::new(
            Arc::clone(&self.pods),
            Arc::clone(&self.tracker),
            group,
            policy,
        )
    }

    /// Task creating one claim set on `interface`
    fn create_claims(
        &mut self,
        label: String,
        factory: &ResourceFactory<ClaimSpec>,
        interface: StorageInterface,
    ) -> Task<Vec<ResourceHandle>> {
        let specs = ClaimSpec::distribute(
            interface,
            self.config.claims_per_interface,
            &self.config.claim_size,
            Some(self.config.storage_class(interface)),
            &mut self.rng,
        );
        let factory = factory.clone();
        Task::new(label, async move { factory.create_many(&specs).await })
    }

    async fn provision_first_wave(&mut self) -> PhaseOutcome {
        let mut tasks = Vec::new();
        for (group, policy) in [
            (groups::WAVE1_CLAIMS, CleanupPolicy::Deferred),
            (groups::DELETE_CLAIMS, CleanupPolicy::Immediate),
            (groups::WAVE2_POD_CLAIMS, CleanupPolicy::Deferred),
        ] {
            let factory = self.claim_factory(group, policy);
            for interface in INTERFACES {
                let label = format!("{group}-{}", interface.short_name());
                tasks.push(self.create_claims(label, &factory, interface));
            }
        }

        let results = self
            .executor
            .run_all(tasks, self.config.join_poll_interval())
            .await;
        PhaseOutcome::from_tasks(&results)
    }

    async fn spawn_first_wave_pods(&mut self) -> PhaseOutcome {
        let factory = self.pod_factory(groups::WAVE1_PODS, CleanupPolicy::Immediate);
        let tasks: Vec<Task<ResourceHandle>> = self
            .tracker
            .all_of(groups::WAVE1_CLAIMS)
            .iter()
            .flat_map(PodSpec::for_claim)
            .enumerate()
            .map(|(i, spec)| {
                let factory = factory.clone();
                Task::new(format!("create-pod-{}-{i}", spec.claim), async move {
                    factory.create(&spec).await
                })
            })
            .collect();

        let results = self
            .executor
            .run_all(tasks, self.config.join_poll_interval())
            .await;
        PhaseOutcome::from_tasks(&results)
    }

    /// Fan out wave-2 creation and wave-1 deletion as five concurrent groups.
    ///
    /// Returns the wave-2 claims and pods to wait on. Wave-1 resources stay
    /// tracked until their deletion is confirmed.
    async fn churn(&mut self) -> (PhaseOutcome, Vec<ResourceHandle>) {
        let claims = self.claim_factory(groups::WAVE2_CLAIMS, CleanupPolicy::Deferred);
        let pods = self.pod_factory(groups::WAVE2_PODS, CleanupPolicy::Deferred);

        let pod_specs: Vec<PodSpec> = self
            .tracker
            .all_of(groups::WAVE2_POD_CLAIMS)
            .iter()
            .flat_map(PodSpec::for_claim)
            .collect();
        let wave1_pods = self.tracker.all_of(groups::WAVE1_PODS);
        let delete_claims = self.tracker.all_of(groups::DELETE_CLAIMS);

        info!(
            new_pods = pod_specs.len(),
            pods_to_delete = wave1_pods.len(),
            claims_to_delete = delete_claims.len(),
            "starting churn: bulk create and bulk delete"
        );

        let tasks = vec![
            self.create_claims(
                CREATE_RBD_CLAIMS.to_string(),
                &claims,
                StorageInterface::CephBlockPool,
            ),
            self.create_claims(
                CREATE_CEPHFS_CLAIMS.to_string(),
                &claims,
                StorageInterface::CephFileSystem,
            ),
            Task::new(CREATE_WAVE2_PODS, async move {
                pods.create_many(&pod_specs).await
            }),
            Task::new(DELETE_WAVE1_PODS, delete_all(groups::WAVE1_PODS, wave1_pods)),
            Task::new(
                DELETE_WAVE1_CLAIMS,
                delete_all(groups::DELETE_CLAIMS, delete_claims),
            ),
        ];

        let results = self
            .executor
            .run_all(tasks, self.config.join_poll_interval())
            .await;
        let outcome = PhaseOutcome::from_tasks(&results);

        let created = results
            .into_iter()
            .filter(|r| !matches!(r.label(), DELETE_WAVE1_PODS | DELETE_WAVE1_CLAIMS))
            .filter_map(|r| r.into_result().ok())
            .flatten()
            .collect();
        (outcome, created)
    }

    /// Wait concurrently for every handle to reach its desired state
    async fn await_ready(&self, handles: Vec<ResourceHandle>) -> PhaseOutcome {
        let bound = self.config.bound_poll();
        let running = self.config.running_poll();

        let waits = handles.iter().map(|handle| {
            let settings = match handle.kind() {
                ResourceKind::Pod => &running,
                ResourceKind::Claim | ResourceKind::Volume => &bound,
            };
            async move {
                let outcome = handle.wait_ready(settings).await.map(|_| ());
                (handle.id().to_string(), outcome)
            }
        });
        PhaseOutcome::from_outcomes(join_all(waits).await)
    }

    /// Confirm wave-1 resources are gone and stop tracking the ones that are.
    ///
    /// Unconfirmed resources stay registered for teardown.
    async fn verify_deletion(&self) -> PhaseOutcome {
        let settings = self.config.delete_poll();
        let settings = &settings;

        let deleted: Vec<(&str, ResourceHandle)> = DELETED_GROUPS
            .iter()
            .flat_map(|group| self.tracker.all_of(group).into_iter().map(move |h| (*group, h)))
            .collect();

        let waits = deleted
            .iter()
            .map(|(_, handle)| async move { handle.wait_deleted(settings).await });
        let results = join_all(waits).await;

        let mut outcomes = Vec::with_capacity(deleted.len());
        for ((group, handle), result) in deleted.into_iter().zip(results) {
            match &result {
                Ok(_) => {
                    self.tracker.forget(group, handle.id());
                }
                Err(e) => {
                    warn!(group, id = %handle.id(), error = %e, "deletion not confirmed, keeping for teardown");
                }
            }
            outcomes.push((handle.id().to_string(), result.map(|_| ())));
        }
        PhaseOutcome::from_outcomes(outcomes)
    }
}

/// Issue a delete for every handle, continuing past failures.
///
/// Returns the handles whose delete was accepted. All handles stay tracked
/// by the caller until their deletion is confirmed.
async fn delete_all(
    group: &'static str,
    handles: Vec<ResourceHandle>,
) -> Result<Vec<ResourceHandle>> {
    let total = handles.len();
    let mut deleted = Vec::with_capacity(total);
    let mut failed = Vec::new();

    for handle in handles {
        match handle.delete().await {
            Ok(_) => deleted.push(handle),
            Err(e) => {
                warn!(group, id = %handle.id(), error = %e, "delete failed, left for teardown");
                failed.push(handle.id().to_string());
            }
        }
    }

    if failed.is_empty() {
        info!(group, count = total, "bulk delete issued");
        Ok(deleted)
    } else {
        Err(PartialBatchFailure { total, failed }.into())
    }
}

//! Phase state machine for the churn scenario
//!
//! Phases advance only through the transition table below. Every success
//! transition is guarded by the outcome of the phase that just ran, so a
//! phase with a failed or unresolved task can only move to `Aborted`.

use std::fmt;

/// Number of task groups fanned out by `ProvisionWave2AndDeleteWave1`
pub const FAN_OUT_GROUPS: usize = 5;

/// Phases of a churn run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioPhase {
    /// Create the first claim sets
    Provision1,
    AwaitBound1,
    /// Create pods on the wave-1 claims
    SpawnPods1,
    AwaitRunning1,
    /// Create wave-2 claims and pods while deleting wave 1
    ProvisionWave2AndDeleteWave1,
    /// Wait for wave 2 to be bound and running
    AwaitConvergence,
    /// Confirm wave 1 is gone
    VerifyDeletion,
    Terminal,
    Aborted,
}

impl ScenarioPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioPhase::Terminal | ScenarioPhase::Aborted)
    }
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioPhase::Provision1 => write!(f, "Provision1"),
            ScenarioPhase::AwaitBound1 => write!(f, "AwaitBound1"),
            ScenarioPhase::SpawnPods1 => write!(f, "SpawnPods1"),
            ScenarioPhase::AwaitRunning1 => write!(f, "AwaitRunning1"),
            ScenarioPhase::ProvisionWave2AndDeleteWave1 => {
                write!(f, "ProvisionWave2AndDeleteWave1")
            }
            ScenarioPhase::AwaitConvergence => write!(f, "AwaitConvergence"),
            ScenarioPhase::VerifyDeletion => write!(f, "VerifyDeletion"),
            ScenarioPhase::Terminal => write!(f, "Terminal"),
            ScenarioPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioEvent {
    ClaimsProvisioned,
    ClaimsBound,
    PodsSpawned,
    PodsRunning,
    /// All fan-out task groups resolved
    FanOutResolved,
    Converged,
    DeletionVerified,
    /// A phase finished with failed tasks
    PhaseFailed,
}

impl fmt::Display for ScenarioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioEvent::ClaimsProvisioned => write!(f, "ClaimsProvisioned"),
            ScenarioEvent::ClaimsBound => write!(f, "ClaimsBound"),
            ScenarioEvent::PodsSpawned => write!(f, "PodsSpawned"),
            ScenarioEvent::PodsRunning => write!(f, "PodsRunning"),
            ScenarioEvent::FanOutResolved => write!(f, "FanOutResolved"),
            ScenarioEvent::Converged => write!(f, "Converged"),
            ScenarioEvent::DeletionVerified => write!(f, "DeletionVerified"),
            ScenarioEvent::PhaseFailed => write!(f, "PhaseFailed"),
        }
    }
}

/// Task counts of the phase that just ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseTally {
    /// Tasks the phase submitted
    pub expected: usize,
    pub resolved: usize,
    pub failed: usize,
}

impl PhaseTally {
    pub fn new(expected: usize, resolved: usize, failed: usize) -> Self {
        Self {
            expected,
            resolved,
            failed,
        }
    }

    /// Every task resolved and none failed
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.resolved == self.expected
    }

    /// Event reporting this tally: `success` when clean, otherwise `PhaseFailed`
    pub fn event(&self, success: ScenarioEvent) -> ScenarioEvent {
        if self.is_clean() {
            success
        } else {
            ScenarioEvent::PhaseFailed
        }
    }
}

#[derive(Debug)]
pub struct Transition {
    pub from: ScenarioPhase,
    pub to: ScenarioPhase,
    pub event: ScenarioEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ScenarioPhase,
        to: ScenarioPhase,
        event: ScenarioEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a phase transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: ScenarioPhase,
        to: ScenarioPhase,
        event: ScenarioEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ScenarioPhase,
        event: ScenarioEvent,
    },
    GuardFailed {
        from: ScenarioPhase,
        to: ScenarioPhase,
        event: ScenarioEvent,
        reason: String,
    },
}

pub struct ScenarioStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ScenarioStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioStateMachine {
    pub fn new() -> Self {
        use ScenarioEvent as E;
        use ScenarioPhase as P;

        let mut transitions = vec![
            Transition::new(
                P::Provision1,
                P::AwaitBound1,
                E::ClaimsProvisioned,
                "Wave-1 and wave-2 claims created",
            ),
            Transition::new(
                P::AwaitBound1,
                P::SpawnPods1,
                E::ClaimsBound,
                "All provisioned claims are bound",
            ),
            Transition::new(
                P::SpawnPods1,
                P::AwaitRunning1,
                E::PodsSpawned,
                "Wave-1 pods created",
            ),
            Transition::new(
                P::AwaitRunning1,
                P::ProvisionWave2AndDeleteWave1,
                E::PodsRunning,
                "Wave-1 pods are running",
            ),
            Transition::new(
                P::ProvisionWave2AndDeleteWave1,
                P::AwaitConvergence,
                E::FanOutResolved,
                "Wave-2 creation and wave-1 deletion resolved",
            ),
            Transition::new(
                P::AwaitConvergence,
                P::VerifyDeletion,
                E::Converged,
                "Wave-2 claims bound and pods running",
            ),
            Transition::new(
                P::VerifyDeletion,
                P::Terminal,
                E::DeletionVerified,
                "Wave-1 resources confirmed deleted",
            ),
        ];

        // Any non-terminal phase can abort
        for phase in [
            P::Provision1,
            P::AwaitBound1,
            P::SpawnPods1,
            P::AwaitRunning1,
            P::ProvisionWave2AndDeleteWave1,
            P::AwaitConvergence,
            P::VerifyDeletion,
        ] {
            transitions.push(Transition::new(
                phase,
                P::Aborted,
                E::PhaseFailed,
                "Phase failed, aborting run",
            ));
        }

        Self { transitions }
    }

    /// Attempt to leave `current` on `event`
    pub fn transition(
        &self,
        current: &ScenarioPhase,
        event: ScenarioEvent,
        tally: &PhaseTally,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, tally) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition exists (ignoring guards)
    pub fn can_transition(&self, from: &ScenarioPhase, event: &ScenarioEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &ScenarioPhase) -> Vec<&ScenarioEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, tally: &PhaseTally) -> Option<String> {
        match transition.event {
            ScenarioEvent::PhaseFailed => None,
            ScenarioEvent::FanOutResolved => {
                if tally.expected != FAN_OUT_GROUPS || !tally.is_clean() {
                    Some(format!(
                        "Fan-out not resolved: {}/{} groups resolved, {} failed",
                        tally.resolved, FAN_OUT_GROUPS, tally.failed
                    ))
                } else {
                    None
                }
            }
            _ => {
                if !tally.is_clean() {
                    Some(format!(
                        "{}/{} tasks resolved, {} failed",
                        tally.resolved, tally.expected, tally.failed
                    ))
                } else {
                    None
                }
            }
        }
    }
}

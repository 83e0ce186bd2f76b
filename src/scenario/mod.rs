//! Multi-phase orchestration drivers

pub mod baremetal;
pub mod churn;
pub mod state_machine;

pub use baremetal::{VolumeProvisioner, VolumeRequest};
pub use churn::{ChurnScenario, PhaseReport, ScenarioReport, StopHandle, groups};
pub use state_machine::{
    FAN_OUT_GROUPS, PhaseTally, ScenarioEvent, ScenarioPhase, ScenarioStateMachine,
    TransitionResult,
};

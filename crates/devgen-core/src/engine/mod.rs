//! The playbook execution engine.
//!
//! - `agent` -- the pluggable capability that performs step actions
//! - `resolver` -- pure condition/dependency resolution and skip propagation
//! - `state` -- shared run state, snapshots, and the event log
//! - `executor` -- per-step attempt loop with timeout and retry
//! - `scheduler` -- the run loop, phase state machine, and control interface

pub mod agent;
pub mod executor;
pub mod resolver;
pub mod scheduler;
pub mod state;

pub use agent::{
    AgentError, AgentInvocation, AgentOutput, AgentRegistry, BoxStepAgent, FnAgent, StepAgent,
};
pub use executor::{StepOutcome, substitute_variables};
pub use scheduler::{ControlError, Engine, EngineConfig};
pub use state::SharedRun;

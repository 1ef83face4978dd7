//! Agent capability: the pluggable "do the work" seam of the engine.
//!
//! A [`StepAgent`] receives a fully-resolved invocation (step identity,
//! substituted action text) and performs it. The engine knows nothing about
//! what agents do; it only observes success or failure. Agents are registered
//! by identifier in an [`AgentRegistry`] and looked up by the `agent` field
//! of each step at dispatch time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use devgen_types::playbook::StepId;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation and output
// ---------------------------------------------------------------------------

/// Everything an agent needs to perform one step attempt.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// The run this attempt belongs to.
    pub run_id: Uuid,
    /// Full identity of the step being executed.
    pub step: StepId,
    /// The agent identifier the step named.
    pub agent: String,
    /// Action text after variable substitution.
    pub action: String,
    /// Which attempt this is (1-based).
    pub attempt: u32,
}

/// Result of a successful agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// Optional human-readable summary of what was done.
    pub message: Option<String>,
}

impl AgentOutput {
    /// Output with a summary message.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

/// Errors an agent can report back to the engine.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The action ran but did not succeed (non-zero exit, rejected request).
    #[error("action failed: {0}")]
    ActionFailed(String),

    /// The agent could not run the action at all.
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// StepAgent trait (RPITIT) + object-safe wrapper
// ---------------------------------------------------------------------------

/// A capability that executes step actions.
///
/// Uses RPITIT for the async method, consistent with the crate's Rust 2024
/// edition approach. Implementations must be cheap to invoke repeatedly;
/// retries re-invoke `execute` with a fresh invocation.
pub trait StepAgent: Send + Sync {
    /// Identifier this agent registers under (matched against `Step::agent`).
    fn id(&self) -> &str;

    /// Perform one attempt of the given action.
    fn execute(
        &self,
        invocation: AgentInvocation,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send;
}

/// Object-safe version of [`StepAgent`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn StepAgentDyn`).
/// A blanket implementation is provided for all types implementing
/// `StepAgent`.
pub trait StepAgentDyn: Send + Sync {
    fn id(&self) -> &str;

    fn execute_boxed(
        &self,
        invocation: AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + '_>>;
}

/// Blanket implementation: any `StepAgent` automatically implements
/// `StepAgentDyn`.
impl<T: StepAgent> StepAgentDyn for T {
    fn id(&self) -> &str {
        StepAgent::id(self)
    }

    fn execute_boxed(
        &self,
        invocation: AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + '_>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased agent for runtime selection by identifier.
///
/// Since `StepAgent` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxStepAgent` provides equivalent methods that delegate to the
/// inner `StepAgentDyn` trait object.
pub struct BoxStepAgent {
    inner: Box<dyn StepAgentDyn + Send + Sync>,
}

impl BoxStepAgent {
    /// Wrap a concrete `StepAgent` in a type-erased box.
    pub fn new<T: StepAgent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    /// The agent's registered identifier.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Perform one attempt of the given action.
    pub async fn execute(&self, invocation: AgentInvocation) -> Result<AgentOutput, AgentError> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepAgent").field("id", &self.id()).finish()
    }
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Concurrent registry of agents keyed by identifier.
///
/// Shared between the engine and any front end that registers agents; uses
/// `DashMap` so registration and lookup never block each other.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<BoxStepAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own identifier. Replaces any previous
    /// agent with the same identifier.
    pub fn register<T: StepAgent + 'static>(&self, agent: T) {
        let boxed = BoxStepAgent::new(agent);
        self.agents.insert(boxed.id().to_string(), Arc::new(boxed));
    }

    /// Look up an agent by identifier.
    pub fn get(&self, id: &str) -> Option<Arc<BoxStepAgent>> {
        self.agents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether an agent with this identifier is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// All registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// FnAgent (closure-backed agent, used heavily in tests)
// ---------------------------------------------------------------------------

/// An agent backed by a closure.
type AgentFn = dyn Fn(AgentInvocation) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send>>
    + Send
    + Sync;

/// Adapter turning an async closure into a [`StepAgent`].
pub struct FnAgent {
    id: String,
    func: Arc<AgentFn>,
}

impl FnAgent {
    pub fn new<F, Fut>(id: impl Into<String>, func: F) -> Self
    where
        F: Fn(AgentInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentOutput, AgentError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            func: Arc::new(move |invocation| Box::pin(func(invocation))),
        }
    }
}

impl StepAgent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(
        &self,
        invocation: AgentInvocation,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send {
        (self.func)(invocation)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

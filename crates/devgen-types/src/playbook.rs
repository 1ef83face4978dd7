//! Playbook domain types for DevGen.
//!
//! Defines the canonical in-memory representation of a playbook: a named,
//! versioned set of branches, each holding an ordered sequence of steps.
//! The engine consumes this structure after the loader has validated it;
//! nothing here is mutated during a run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Playbook
// ---------------------------------------------------------------------------

/// A named, versioned workflow definition containing branches and steps.
///
/// Immutable after load. Branch names are unique; step names are unique
/// within their branch (enforced by the loader, not by construction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Playbook name (alphanumeric plus hyphens).
    pub name: String,
    /// Free-form version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered variable declarations (key and default value).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    /// Ordered branches. Declaration order drives scheduling tie-breaks.
    pub branches: Vec<Branch>,
}

impl Playbook {
    /// Look up a branch by name.
    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name == name)
    }

    /// Look up a step by its fully-resolved identity.
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.branch(&id.branch)?.step(&id.step)
    }

    /// Total number of steps across all branches.
    pub fn step_count(&self) -> usize {
        self.branches.iter().map(|b| b.steps.len()).sum()
    }

    /// Iterate all steps in declaration order as `(branch, step)` pairs.
    pub fn steps(&self) -> impl Iterator<Item = (&Branch, &Step)> {
        self.branches
            .iter()
            .flat_map(|b| b.steps.iter().map(move |s| (b, s)))
    }

    /// Iterate all step identities in declaration order.
    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.steps().map(|(b, s)| StepId::new(&b.name, &s.name))
    }
}

/// A playbook variable: a key with a default value, substituted into step
/// actions as `${key}` before the agent is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub default: String,
}

// ---------------------------------------------------------------------------
// Branch
// ---------------------------------------------------------------------------

/// A named group of steps, either parallel or sequential relative to other
/// branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name, unique within the playbook.
    pub name: String,
    /// When true, this branch's ready steps run concurrently with steps of
    /// other parallel branches. When false, at most one of its steps is in
    /// flight at a time, in declared order.
    #[serde(default)]
    pub parallel: bool,
    /// Names of branches that must settle successfully (every step completed,
    /// or skipped as an unused failure handler) before any step of this
    /// branch becomes eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Ordered steps.
    pub steps: Vec<Step>,
}

impl Branch {
    /// Look up a step by name within this branch.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The smallest unit of work, gated by a condition and optional dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within its branch.
    pub name: String,
    /// Identifier of the agent that executes this step. The mapping from
    /// identifier to behavior is supplied by the surrounding application.
    pub agent: String,
    /// What the step does, passed to the agent (after variable substitution).
    pub action: String,
    /// Eligibility condition, defaulting to `start`.
    #[serde(default)]
    pub condition: Condition,
    /// Steps that must complete before this one, qualified as
    /// `<branch>.<step>` when cross-branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepRef>,
    /// Per-attempt timeout in seconds (engine default applies when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum retry count after the initial attempt (default 0).
    #[serde(default)]
    pub retries: u32,
}

// ---------------------------------------------------------------------------
// Step references and identity
// ---------------------------------------------------------------------------

/// A reference to a step from within a playbook, optionally qualified with
/// a branch name (`<branch>.<step>`). Unqualified references resolve within
/// the referring step's own branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepRef {
    pub branch: Option<String>,
    pub step: String,
}

impl StepRef {
    /// Resolve this reference into a full identity, using `owning_branch`
    /// for unqualified references.
    pub fn resolve(&self, owning_branch: &str) -> StepId {
        StepId {
            branch: self
                .branch
                .clone()
                .unwrap_or_else(|| owning_branch.to_string()),
            step: self.step.clone(),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}.{}", branch, self.step),
            None => write!(f, "{}", self.step),
        }
    }
}

impl FromStr for StepRef {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ConditionParseError::EmptyReference);
        }
        match s.split_once('.') {
            Some((branch, step)) if !branch.is_empty() && !step.is_empty() => Ok(StepRef {
                branch: Some(branch.to_string()),
                step: step.to_string(),
            }),
            Some(_) => Err(ConditionParseError::EmptyReference),
            None => Ok(StepRef {
                branch: None,
                step: s.to_string(),
            }),
        }
    }
}

impl Serialize for StepRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The fully-resolved identity of a step: its branch name plus step name.
///
/// Displayed (and serialized) as `<branch>.<step>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId {
    pub branch: String,
    pub step: String,
}

impl StepId {
    pub fn new(branch: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            step: step.into(),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.branch, self.step)
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.split_once('.') {
            Some((branch, step)) if !branch.is_empty() && !step.is_empty() => {
                Ok(StepId::new(branch, step))
            }
            _ => Err(serde::de::Error::custom(format!(
                "step identity '{s}' is not of the form <branch>.<step>"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A predicate over other steps' statuses gating a step's eligibility.
///
/// The grammar is three forms: the literal `start`, `<step>-completed`, or
/// `<step>-failed`, where `<step>` may be `<branch>.<step>` qualified.
/// Conditions are evaluated against current step statuses, never time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Condition {
    /// Satisfied as soon as the owning branch is eligible.
    #[default]
    Start,
    /// Satisfied once the referenced step reaches `completed`.
    Completed(StepRef),
    /// Satisfied once the referenced step reaches `failed`.
    Failed(StepRef),
}

impl Condition {
    /// The step this condition references, if any.
    pub fn reference(&self) -> Option<&StepRef> {
        match self {
            Condition::Start => None,
            Condition::Completed(r) | Condition::Failed(r) => Some(r),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Start => write!(f, "start"),
            Condition::Completed(r) => write!(f, "{r}-completed"),
            Condition::Failed(r) => write!(f, "{r}-failed"),
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "start" {
            return Ok(Condition::Start);
        }
        if let Some(rest) = s.strip_suffix("-completed") {
            return Ok(Condition::Completed(rest.parse()?));
        }
        if let Some(rest) = s.strip_suffix("-failed") {
            return Ok(Condition::Failed(rest.parse()?));
        }
        Err(ConditionParseError::UnknownForm(s.to_string()))
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors produced when parsing the condition grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionParseError {
    /// The string matched none of `start`, `<step>-completed`, `<step>-failed`.
    #[error("condition '{0}' is not 'start', '<step>-completed', or '<step>-failed'")]
    UnknownForm(String),

    /// A step reference was empty or had an empty branch/step part.
    #[error("empty step reference in condition")]
    EmptyReference,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Execution-tracking types: statuses, run phases, events, and snapshots.
//!
//! These are the types a front end sees. `ExecutionSnapshot` is always a
//! copy of engine state -- holding one never observes later mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::playbook::StepId;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of an individual step within a run.
///
/// Transitions are monotonic (`pending -> running -> completed|failed`, or
/// `pending -> skipped`) and never revert except via a run reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether this status is terminal for the run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Overall phase of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunPhase {
    /// Whether the run has reached a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Structured outcome tag for a log event, suitable for forwarding to an
/// external telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First attempt of a step began.
    Started { attempt: u32 },
    /// A retry attempt began after a failure or timeout.
    Retrying { attempt: u32 },
    /// The step completed successfully.
    Completed,
    /// The step exhausted its retry budget and failed.
    Failed { attempts: u32 },
    /// An attempt exceeded the step's timeout (counts against retries).
    Timeout { attempt: u32 },
    /// The step was skipped because its condition can never be satisfied.
    Skipped,
    /// The run moved to a new phase.
    Phase { phase: RunPhase },
}

/// A timestamped entry in the run's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Branch/step identity; absent for run-level phase events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,
    /// Structured outcome tag.
    pub kind: EventKind,
    /// Optional human-readable detail (e.g. the failure reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionEvent {
    /// Build an event stamped with the current time.
    pub fn now(step: Option<StepId>, kind: EventKind, message: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step,
            kind,
            message,
        }
    }

    /// Whether this event marks the start of an attempt (initial or retry).
    pub fn is_attempt(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Started { .. } | EventKind::Retrying { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Counters and snapshots
// ---------------------------------------------------------------------------

/// Aggregate step counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Per-step view within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: StepId,
    pub status: StepStatus,
    /// Attempts made so far (0 while pending).
    pub attempts: u32,
    /// Failure reason for a failed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An immutable copy of the engine's execution state.
///
/// `failed_step` distinguishes "failed because of step X" from "completed
/// with skipped branches": it is set only when the run phase is `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Identifier of this run.
    pub run_id: Uuid,
    /// Name of the playbook being executed.
    pub playbook: String,
    /// Overall run phase.
    pub phase: RunPhase,
    /// Per-step statuses in declaration order.
    pub steps: Vec<StepSnapshot>,
    /// Aggregate counters.
    pub counters: RunCounters,
    /// Most recent log events (truncated to the engine's snapshot window).
    pub recent_events: Vec<ExecutionEvent>,
    /// The step whose unrecovered failure moved the run to `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
}

impl ExecutionSnapshot {
    /// Look up a step's status in this snapshot.
    pub fn status(&self, id: &StepId) -> Option<StepStatus> {
        self.steps.iter().find(|s| &s.id == id).map(|s| s.status)
    }

    /// Whether every step has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

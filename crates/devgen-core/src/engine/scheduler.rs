//! The engine: run loop, phase state machine, and control interface.
//!
//! [`Engine`] is the only handle front ends hold. Control operations
//! (`start`, `pause`, `resume`, `stop`, `reset`) are async and validated
//! against the current phase; observation goes through copied snapshots and
//! the broadcast event stream.
//!
//! The run loop is status-driven rather than plan-driven: each iteration it
//! propagates skips, dispatches every eligible ready step (respecting
//! per-branch parallelism), then sleeps until a step settles, the phase
//! changes, or the run is cancelled. Pausing and stopping never force-cancel
//! an in-flight step; agents always run to their own completion or timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use devgen_types::execution::{ExecutionEvent, ExecutionSnapshot, RunPhase, StepStatus};
use devgen_types::playbook::{Playbook, StepId};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::playbook::{PlaybookError, validate_playbook};

use super::agent::AgentRegistry;
use super::executor::{StepExecutor, StepOutcome};
use super::resolver;
use super::state::SharedRun;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-attempt timeout applied when a step doesn't set its own.
    pub default_step_timeout: Duration,
    /// Fixed delay between a failed attempt and its retry.
    pub retry_backoff: Duration,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// How many recent events a snapshot carries.
    pub snapshot_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(1),
            event_capacity: 256,
            snapshot_events: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Control errors
// ---------------------------------------------------------------------------

/// A control operation was invalid for the current run phase.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot {action} while the run phase is {phase:?}")]
    InvalidPhase {
        action: &'static str,
        phase: RunPhase,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct EngineInner {
    run: Arc<SharedRun>,
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    /// Steps whose failure some other step handles via a `*-failed`
    /// condition. Failure outside this set is fatal to the run.
    recovery: HashSet<StepId>,
    task: tokio::sync::Mutex<Option<RunTask>>,
}

/// Playbook execution engine. Cheap to clone; all clones control the same
/// run.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine for a playbook.
    ///
    /// Re-validates the playbook and additionally checks that every agent
    /// identifier named by a step is registered, so a run can never stall on
    /// a missing capability.
    pub fn new(
        playbook: Playbook,
        registry: Arc<AgentRegistry>,
        config: EngineConfig,
    ) -> Result<Self, PlaybookError> {
        validate_playbook(&playbook)?;
        for (branch, step) in playbook.steps() {
            if !registry.contains(&step.agent) {
                return Err(PlaybookError::UnknownAgent {
                    step: StepId::new(&branch.name, &step.name),
                    agent: step.agent.clone(),
                });
            }
        }

        let recovery = resolver::failure_recovery_set(&playbook);
        let run = Arc::new(SharedRun::new(
            Arc::new(playbook),
            config.event_capacity,
            config.snapshot_events,
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                run,
                registry,
                config,
                recovery,
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// The playbook this engine executes.
    pub fn playbook(&self) -> &Arc<Playbook> {
        self.inner.run.playbook()
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Begin (or, after a stop, continue) executing the playbook.
    ///
    /// Only valid while idle. After a completed or failed run, `reset` first.
    pub async fn start(&self) -> Result<(), ControlError> {
        let mut task = self.inner.task.lock().await;
        let phase = self.inner.run.phase();
        if phase != RunPhase::Idle {
            return Err(ControlError::InvalidPhase {
                action: "start",
                phase,
            });
        }

        self.inner.run.set_phase(RunPhase::Running);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.inner.run),
            Arc::clone(&self.inner.registry),
            self.inner.recovery.clone(),
            self.inner.config.clone(),
            cancel.clone(),
        ));
        *task = Some(RunTask { handle, cancel });

        tracing::info!(
            run_id = %self.inner.run.run_id(),
            playbook = self.playbook().name.as_str(),
            "run started"
        );
        Ok(())
    }

    /// Suspend dispatch of new steps. In-flight steps keep running and their
    /// results are still recorded.
    pub async fn pause(&self) -> Result<(), ControlError> {
        let phase = self.inner.run.phase();
        if phase != RunPhase::Running {
            return Err(ControlError::InvalidPhase {
                action: "pause",
                phase,
            });
        }
        self.inner.run.set_phase(RunPhase::Paused);
        Ok(())
    }

    /// Resume dispatch after a pause.
    pub async fn resume(&self) -> Result<(), ControlError> {
        let phase = self.inner.run.phase();
        if phase != RunPhase::Paused {
            return Err(ControlError::InvalidPhase {
                action: "resume",
                phase,
            });
        }
        self.inner.run.set_phase(RunPhase::Running);
        Ok(())
    }

    /// Halt the run, letting in-flight steps finish, and return to idle with
    /// all step statuses preserved. A later `start` continues from them.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let mut task = self.inner.task.lock().await;
        let phase = self.inner.run.phase();
        if !matches!(phase, RunPhase::Running | RunPhase::Paused) {
            return Err(ControlError::InvalidPhase {
                action: "stop",
                phase,
            });
        }

        if let Some(running) = task.take() {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
        // The loop may have settled to a terminal phase before the cancel
        // landed; only an interrupted run goes back to idle.
        if !self.inner.run.phase().is_terminal() {
            self.inner.run.set_phase(RunPhase::Idle);
        }
        tracing::info!(run_id = %self.inner.run.run_id(), "run stopped");
        Ok(())
    }

    /// Discard all run state and return to idle, from any phase. A running
    /// playbook is halted first (in-flight steps finish, then their results
    /// are discarded with the rest).
    pub async fn reset(&self) {
        let mut task = self.inner.task.lock().await;
        if let Some(running) = task.take() {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
        self.inner.run.reset();
        tracing::info!(
            run_id = %self.inner.run.run_id(),
            playbook = self.playbook().name.as_str(),
            "run state reset"
        );
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// An immutable copy of the current run state.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        self.inner.run.snapshot()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.run.subscribe()
    }

    /// Wait until the run settles: completed, failed, or back to idle after
    /// a stop. Returns the settled phase immediately when the run is not
    /// active.
    pub async fn wait(&self) -> RunPhase {
        let mut rx = self.inner.run.watch_phase();
        match rx
            .wait_for(|phase| !matches!(phase, RunPhase::Running | RunPhase::Paused))
            .await
        {
            Ok(phase) => *phase,
            Err(_) => self.inner.run.phase(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

async fn run_loop(
    run: Arc<SharedRun>,
    registry: Arc<AgentRegistry>,
    recovery: HashSet<StepId>,
    config: EngineConfig,
    cancel: CancellationToken,
) {
    let playbook = Arc::clone(run.playbook());
    let executor = StepExecutor::new(
        Arc::clone(&run),
        registry,
        config.default_step_timeout,
        config.retry_backoff,
    );
    let mut join_set: JoinSet<(StepId, StepOutcome)> = JoinSet::new();
    let mut phase_rx = run.watch_phase();
    let mut in_flight: HashSet<StepId> = HashSet::new();
    let mut fatal = false;

    loop {
        // Skip propagation runs every iteration so steps that just became
        // impossible settle before the next dispatch decision.
        let skips = resolver::compute_skips(&playbook, &run.status_map());
        run.skip_steps(&skips);

        let phase = run.phase();

        // Settlement. Failure is derived from the status map, not only from
        // outcomes this loop observed: a step can fail while a previous
        // loop's stop() was draining it, and that failure must still doom a
        // restarted run.
        if join_set.is_empty() {
            let statuses = run.status_map();
            let doomed = playbook.step_ids().find(|id| {
                statuses.get(id) == Some(&StepStatus::Failed) && !recovery.contains(id)
            });
            if fatal || doomed.is_some() {
                if let Some(id) = doomed {
                    run.set_failed_step(id);
                }
                let pending: Vec<StepId> = statuses
                    .into_iter()
                    .filter(|(_, status)| *status == StepStatus::Pending)
                    .map(|(id, _)| id)
                    .collect();
                run.skip_steps(&pending);
                run.set_phase(RunPhase::Failed);
                return;
            }
            if phase == RunPhase::Running && run.all_terminal() {
                run.set_phase(RunPhase::Completed);
                tracing::info!(run_id = %run.run_id(), "run completed");
                return;
            }
        }

        // Dispatch
        if phase == RunPhase::Running && !fatal && !cancel.is_cancelled() {
            let ready = resolver::ready_steps(&playbook, &run.status_map());
            for id in ready {
                let parallel = playbook
                    .branch(&id.branch)
                    .is_some_and(|branch| branch.parallel);
                if !parallel && in_flight.iter().any(|f| f.branch == id.branch) {
                    // Sequential branch: one step in flight at a time.
                    continue;
                }
                if run.begin_step(&id) {
                    in_flight.insert(id.clone());
                    let executor = executor.clone();
                    join_set.spawn(async move {
                        let outcome = executor.run_step(id.clone()).await;
                        (id, outcome)
                    });
                }
            }
        }

        // Wait for the next thing to react to.
        tokio::select! {
            Some(settled) = join_set.join_next(), if !join_set.is_empty() => {
                match settled {
                    Ok((id, outcome)) => {
                        in_flight.remove(&id);
                        if outcome == StepOutcome::Failed && !recovery.contains(&id) {
                            tracing::error!(
                                run_id = %run.run_id(),
                                step = %id,
                                "unrecovered step failure, run will fail after draining"
                            );
                            run.set_failed_step(id);
                            fatal = true;
                        }
                    }
                    Err(join_err) => {
                        tracing::error!(error = %join_err, "step task panicked");
                        fatal = true;
                    }
                }
            }
            _ = phase_rx.changed() => {}
            _ = cancel.cancelled() => {
                // Drain in-flight steps; their results are still recorded.
                while let Some(settled) = join_set.join_next().await {
                    if let Ok((id, _)) = settled {
                        in_flight.remove(&id);
                    }
                }
                let skips = resolver::compute_skips(&playbook, &run.status_map());
                run.skip_steps(&skips);
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

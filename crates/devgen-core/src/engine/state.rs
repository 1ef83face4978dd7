//! Shared mutable run state behind a mutex, plus the observation surface.
//!
//! `SharedRun` is the single owner of everything mutable during a run: step
//! records, the phase, counters, and the bounded recent-event log. All
//! mutation goes through its methods so status transitions stay monotonic
//! and every transition produces exactly one event. Snapshots are copies;
//! nothing hands out references into the locked state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use devgen_types::execution::{
    EventKind, ExecutionEvent, ExecutionSnapshot, RunCounters, RunPhase, StepSnapshot, StepStatus,
};
use devgen_types::playbook::{Playbook, StepId};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Step record
// ---------------------------------------------------------------------------

/// Mutable per-step record inside the engine.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    run_id: Uuid,
    phase: RunPhase,
    steps: HashMap<StepId, StepRecord>,
    counters: RunCounters,
    recent_events: VecDeque<ExecutionEvent>,
    failed_step: Option<StepId>,
}

impl RunState {
    fn fresh(playbook: &Playbook) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            phase: RunPhase::Idle,
            steps: playbook
                .step_ids()
                .map(|id| (id, StepRecord::pending()))
                .collect(),
            counters: RunCounters::default(),
            recent_events: VecDeque::new(),
            failed_step: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SharedRun
// ---------------------------------------------------------------------------

/// Thread-safe run state shared between the scheduler, step executors, and
/// the control interface.
///
/// The mutex guards short, synchronous critical sections only; nothing async
/// happens while it is held. Phase changes are mirrored into a `watch`
/// channel so waiters can observe settlement without polling.
#[derive(Debug)]
pub struct SharedRun {
    playbook: Arc<Playbook>,
    state: Mutex<RunState>,
    bus: EventBus,
    phase_tx: watch::Sender<RunPhase>,
    event_limit: usize,
}

impl SharedRun {
    pub fn new(playbook: Arc<Playbook>, event_capacity: usize, event_limit: usize) -> Self {
        let state = RunState::fresh(&playbook);
        let (phase_tx, _) = watch::channel(state.phase);
        Self {
            playbook,
            state: Mutex::new(state),
            bus: EventBus::new(event_capacity),
            phase_tx,
            event_limit,
        }
    }

    pub fn playbook(&self) -> &Arc<Playbook> {
        &self.playbook
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        // A poisoned lock means a panic elsewhere; the state itself is still
        // coherent because critical sections are single assignments.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event in the bounded log and broadcast it.
    fn push_event(&self, state: &mut RunState, event: ExecutionEvent) {
        state.recent_events.push_back(event.clone());
        while state.recent_events.len() > self.event_limit {
            state.recent_events.pop_front();
        }
        self.bus.publish(event);
    }

    // -----------------------------------------------------------------------
    // Phase
    // -----------------------------------------------------------------------

    pub fn run_id(&self) -> Uuid {
        self.lock().run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    /// Transition to a new phase, logging and broadcasting the change.
    /// No-op when already in that phase.
    pub fn set_phase(&self, phase: RunPhase) {
        let mut state = self.lock();
        if state.phase == phase {
            return;
        }
        state.phase = phase;
        self.push_event(
            &mut state,
            ExecutionEvent::now(None, EventKind::Phase { phase }, None),
        );
        drop(state);
        // send_replace stores the value even when no receiver is alive, so
        // late subscribers (wait(), the CLI loop) observe the current phase.
        self.phase_tx.send_replace(phase);
    }

    /// Observe phase changes without polling.
    pub fn watch_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Step transitions
    // -----------------------------------------------------------------------

    /// Authorize dispatch of a step: `pending -> running`.
    ///
    /// Returns false (and changes nothing) when the step is not pending,
    /// which is how double dispatch is rejected.
    pub fn begin_step(&self, id: &StepId) -> bool {
        let mut state = self.lock();
        match state.steps.get_mut(id) {
            Some(record) if record.status == StepStatus::Pending => {
                record.status = StepStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Whether the step is currently marked running (dispatch was
    /// authorized).
    pub fn is_running(&self, id: &StepId) -> bool {
        self.lock()
            .steps
            .get(id)
            .is_some_and(|r| r.status == StepStatus::Running)
    }

    /// Record the start of an attempt: bumps the attempt counter and logs a
    /// `started` or `retrying` event.
    pub fn record_attempt(&self, id: &StepId, attempt: u32) {
        let mut state = self.lock();
        if let Some(record) = state.steps.get_mut(id) {
            record.attempts = attempt;
        }
        let kind = if attempt == 1 {
            EventKind::Started { attempt }
        } else {
            EventKind::Retrying { attempt }
        };
        self.push_event(&mut state, ExecutionEvent::now(Some(id.clone()), kind, None));
    }

    /// Log a timed-out attempt (the step stays running; the executor decides
    /// whether to retry).
    pub fn record_timeout(&self, id: &StepId, attempt: u32, message: String) {
        let mut state = self.lock();
        self.push_event(
            &mut state,
            ExecutionEvent::now(
                Some(id.clone()),
                EventKind::Timeout { attempt },
                Some(message),
            ),
        );
    }

    /// `running -> completed`.
    pub fn complete_step(&self, id: &StepId, message: Option<String>) {
        let mut state = self.lock();
        if let Some(record) = state.steps.get_mut(id) {
            record.status = StepStatus::Completed;
            record.error = None;
        }
        state.counters.completed += 1;
        self.push_event(
            &mut state,
            ExecutionEvent::now(Some(id.clone()), EventKind::Completed, message),
        );
    }

    /// `running -> failed` after the retry budget is exhausted.
    pub fn fail_step(&self, id: &StepId, attempts: u32, error: String) {
        let mut state = self.lock();
        if let Some(record) = state.steps.get_mut(id) {
            record.status = StepStatus::Failed;
            record.attempts = attempts;
            record.error = Some(error.clone());
        }
        state.counters.failed += 1;
        self.push_event(
            &mut state,
            ExecutionEvent::now(Some(id.clone()), EventKind::Failed { attempts }, Some(error)),
        );
    }

    /// `pending -> skipped` for each given step.
    pub fn skip_steps(&self, ids: &[StepId]) {
        let mut state = self.lock();
        for id in ids {
            let skipped = match state.steps.get_mut(id) {
                Some(record) if record.status == StepStatus::Pending => {
                    record.status = StepStatus::Skipped;
                    true
                }
                _ => false,
            };
            if skipped {
                state.counters.skipped += 1;
                self.push_event(
                    &mut state,
                    ExecutionEvent::now(Some(id.clone()), EventKind::Skipped, None),
                );
            }
        }
    }

    /// Remember which step's unrecovered failure doomed the run.
    pub fn set_failed_step(&self, id: StepId) {
        let mut state = self.lock();
        if state.failed_step.is_none() {
            state.failed_step = Some(id);
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Current status of every step, keyed by identity.
    pub fn status_map(&self) -> HashMap<StepId, StepStatus> {
        self.lock()
            .steps
            .iter()
            .map(|(id, record)| (id.clone(), record.status))
            .collect()
    }

    /// Whether every step has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.lock().steps.values().all(|r| r.status.is_terminal())
    }

    /// An immutable copy of the current state, steps in declaration order.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.lock();
        let steps = self
            .playbook
            .step_ids()
            .filter_map(|id| {
                state.steps.get(&id).map(|record| StepSnapshot {
                    id: id.clone(),
                    status: record.status,
                    attempts: record.attempts,
                    error: record.error.clone(),
                })
            })
            .collect();
        ExecutionSnapshot {
            run_id: state.run_id,
            playbook: self.playbook.name.clone(),
            phase: state.phase,
            steps,
            counters: state.counters,
            recent_events: state.recent_events.iter().cloned().collect(),
            failed_step: state.failed_step.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Discard all run state: fresh run id, all steps pending, counters and
    /// event log cleared, phase back to idle.
    pub fn reset(&self) {
        let mut state = self.lock();
        *state = RunState::fresh(&self.playbook);
        drop(state);
        self.phase_tx.send_replace(RunPhase::Idle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use devgen_types::playbook::{Branch, Step};

    fn sample_playbook() -> Arc<Playbook> {
        Arc::new(Playbook {
            name: "sample".to_string(),
            version: "1".to_string(),
            description: None,
            variables: vec![],
            branches: vec![Branch {
                name: "main".to_string(),
                parallel: false,
                depends_on: vec![],
                steps: vec![
                    Step {
                        name: "a".to_string(),
                        agent: "shell".to_string(),
                        action: "true".to_string(),
                        condition: "start".parse().unwrap(),
                        depends_on: vec![],
                        timeout_secs: None,
                        retries: 0,
                    },
                    Step {
                        name: "b".to_string(),
                        agent: "shell".to_string(),
                        action: "true".to_string(),
                        condition: "a-completed".parse().unwrap(),
                        depends_on: vec![],
                        timeout_secs: None,
                        retries: 0,
                    },
                ],
            }],
        })
    }

    fn shared() -> SharedRun {
        SharedRun::new(sample_playbook(), 64, 10)
    }

    #[test]
    fn begin_step_rejects_double_dispatch() {
        let run = shared();
        let id = StepId::new("main", "a");
        assert!(run.begin_step(&id));
        assert!(!run.begin_step(&id), "second dispatch must be rejected");
        assert!(run.is_running(&id));
    }

    #[test]
    fn complete_updates_counters_and_snapshot() {
        let run = shared();
        let id = StepId::new("main", "a");
        run.begin_step(&id);
        run.record_attempt(&id, 1);
        run.complete_step(&id, Some("done".to_string()));

        let snapshot = run.snapshot();
        assert_eq!(snapshot.status(&id), Some(StepStatus::Completed));
        assert_eq!(snapshot.counters.completed, 1);
        assert_eq!(snapshot.steps[0].attempts, 1);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let run = shared();
        let id = StepId::new("main", "a");
        let before = run.snapshot();

        run.begin_step(&id);
        run.record_attempt(&id, 1);
        run.fail_step(&id, 1, "boom".to_string());

        assert_eq!(before.status(&id), Some(StepStatus::Pending));
        assert_eq!(before.counters.failed, 0);

        let after = run.snapshot();
        assert_eq!(after.status(&id), Some(StepStatus::Failed));
        assert_eq!(after.steps[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn skip_only_applies_to_pending_steps() {
        let run = shared();
        let a = StepId::new("main", "a");
        let b = StepId::new("main", "b");
        run.begin_step(&a);

        run.skip_steps(&[a.clone(), b.clone()]);

        let snapshot = run.snapshot();
        assert_eq!(snapshot.status(&a), Some(StepStatus::Running));
        assert_eq!(snapshot.status(&b), Some(StepStatus::Skipped));
        assert_eq!(snapshot.counters.skipped, 1);
    }

    #[test]
    fn event_log_is_bounded() {
        let run = SharedRun::new(sample_playbook(), 64, 3);
        let id = StepId::new("main", "a");
        for attempt in 1..=10 {
            run.record_attempt(&id, attempt);
        }
        let snapshot = run.snapshot();
        assert_eq!(snapshot.recent_events.len(), 3);
        assert!(matches!(
            snapshot.recent_events[2].kind,
            EventKind::Retrying { attempt: 10 }
        ));
    }

    #[test]
    fn reset_restores_fresh_state_with_new_run_id() {
        let run = shared();
        let a = StepId::new("main", "a");
        let first_run_id = run.run_id();

        run.set_phase(RunPhase::Running);
        run.begin_step(&a);
        run.record_attempt(&a, 1);
        run.fail_step(&a, 1, "boom".to_string());
        run.set_failed_step(a.clone());
        run.set_phase(RunPhase::Failed);

        run.reset();

        let snapshot = run.snapshot();
        assert_ne!(snapshot.run_id, first_run_id);
        assert_eq!(snapshot.phase, RunPhase::Idle);
        assert_eq!(snapshot.status(&a), Some(StepStatus::Pending));
        assert_eq!(snapshot.counters, RunCounters::default());
        assert!(snapshot.recent_events.is_empty());
        assert!(snapshot.failed_step.is_none());
    }

    #[tokio::test]
    async fn phase_watch_observes_transitions() {
        let run = shared();
        let mut rx = run.watch_phase();
        run.set_phase(RunPhase::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RunPhase::Running);
    }

    #[test]
    fn phase_is_retained_for_late_watchers() {
        let run = shared();
        // No receiver is alive while these transitions happen.
        run.set_phase(RunPhase::Running);
        run.set_phase(RunPhase::Completed);

        let rx = run.watch_phase();
        assert_eq!(*rx.borrow(), RunPhase::Completed);

        run.reset();
        drop(rx);
        let rx = run.watch_phase();
        assert_eq!(*rx.borrow(), RunPhase::Idle);
    }
}

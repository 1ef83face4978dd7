//! Step executor: drives one step through its attempts.
//!
//! The executor owns the per-step lifecycle once the scheduler has
//! authorized dispatch: variable substitution, per-attempt timeout, the
//! retry budget, and the terminal transition. All observable effects go
//! through [`SharedRun`], so the scheduler only learns "completed" or
//! "failed" from the returned outcome.
//!
//! `retries: N` means up to `N + 1` attempts total. A timed-out attempt
//! counts against the budget the same as a failed one, but is logged with a
//! distinct `timeout` event so the cause is visible.

use std::sync::Arc;
use std::time::Duration;

use devgen_types::playbook::{StepId, Variable};

use super::agent::{AgentInvocation, AgentRegistry};
use super::state::SharedRun;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What the executor reports back to the scheduler for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// An attempt succeeded; the step is completed.
    Completed,
    /// Every attempt failed or timed out; the step is failed.
    Failed,
    /// Dispatch was not authorized (the step was not in the running state);
    /// nothing was executed and no state changed.
    NotStarted,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual steps against registered agents.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    run: Arc<SharedRun>,
    registry: Arc<AgentRegistry>,
    default_timeout: Duration,
    retry_backoff: Duration,
}

impl StepExecutor {
    pub fn new(
        run: Arc<SharedRun>,
        registry: Arc<AgentRegistry>,
        default_timeout: Duration,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            run,
            registry,
            default_timeout,
            retry_backoff,
        }
    }

    /// Run one step to a terminal status.
    ///
    /// The scheduler must have transitioned the step to `running` (via
    /// `SharedRun::begin_step`) before calling this; otherwise the dispatch
    /// is rejected and `NotStarted` is returned.
    pub async fn run_step(&self, id: StepId) -> StepOutcome {
        if !self.run.is_running(&id) {
            tracing::warn!(step = %id, "dispatch rejected: step is not in the running state");
            return StepOutcome::NotStarted;
        }

        let playbook = Arc::clone(self.run.playbook());
        let Some(step) = playbook.step(&id) else {
            // Unreachable for validated playbooks; settle the step anyway.
            self.run
                .fail_step(&id, 0, format!("step '{id}' not found in playbook"));
            return StepOutcome::Failed;
        };

        let Some(agent) = self.registry.get(&step.agent) else {
            self.run.fail_step(
                &id,
                0,
                format!("no agent registered under '{}'", step.agent),
            );
            return StepOutcome::Failed;
        };

        let action = substitute_variables(&step.action, &playbook.variables);
        let attempt_timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let max_attempts = step.retries + 1;
        let run_id = self.run.run_id();

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            self.run.record_attempt(&id, attempt);
            tracing::info!(
                run_id = %run_id,
                step = %id,
                agent = step.agent.as_str(),
                attempt,
                max_attempts,
                "executing step"
            );

            let invocation = AgentInvocation {
                run_id,
                step: id.clone(),
                agent: step.agent.clone(),
                action: action.clone(),
                attempt,
            };

            match tokio::time::timeout(attempt_timeout, agent.execute(invocation)).await {
                Ok(Ok(output)) => {
                    tracing::info!(run_id = %run_id, step = %id, attempt, "step completed");
                    self.run.complete_step(&id, output.message);
                    return StepOutcome::Completed;
                }
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        run_id = %run_id,
                        step = %id,
                        attempt,
                        error = last_error.as_str(),
                        "step attempt failed"
                    );
                }
                Err(_elapsed) => {
                    last_error = format!(
                        "attempt {attempt} timed out after {}s",
                        attempt_timeout.as_secs()
                    );
                    tracing::warn!(
                        run_id = %run_id,
                        step = %id,
                        attempt,
                        timeout_secs = attempt_timeout.as_secs(),
                        "step attempt timed out"
                    );
                    self.run.record_timeout(&id, attempt, last_error.clone());
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        self.run.fail_step(&id, max_attempts, last_error);
        StepOutcome::Failed
    }
}

// ---------------------------------------------------------------------------
// Variable substitution
// ---------------------------------------------------------------------------

/// Replace `${name}` placeholders in an action with variable defaults.
///
/// Unknown placeholders are left untouched so the agent can surface them in
/// its own error output.
pub fn substitute_variables(action: &str, variables: &[Variable]) -> String {
    let mut result = action.to_string();
    for variable in variables {
        let placeholder = format!("${{{}}}", variable.name);
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, &variable.default);
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use devgen_types::execution::{EventKind, StepStatus};
    use devgen_types::playbook::{Branch, Playbook, Step};

    use super::*;
    use crate::engine::agent::{AgentError, AgentOutput, FnAgent};

    fn playbook_with_step(step: Step) -> Arc<Playbook> {
        Arc::new(Playbook {
            name: "exec-test".to_string(),
            version: "1".to_string(),
            description: None,
            variables: vec![
                Variable {
                    name: "target".to_string(),
                    default: "prod".to_string(),
                },
            ],
            branches: vec![Branch {
                name: "main".to_string(),
                parallel: false,
                depends_on: vec![],
                steps: vec![step],
            }],
        })
    }

    fn base_step(retries: u32, timeout_secs: Option<u64>) -> Step {
        Step {
            name: "work".to_string(),
            agent: "test".to_string(),
            action: "deploy to ${target}".to_string(),
            condition: "start".parse().unwrap(),
            depends_on: vec![],
            timeout_secs,
            retries,
        }
    }

    fn executor_for(
        playbook: Arc<Playbook>,
        registry: AgentRegistry,
    ) -> (StepExecutor, Arc<SharedRun>) {
        let run = Arc::new(SharedRun::new(playbook, 64, 50));
        let executor = StepExecutor::new(
            Arc::clone(&run),
            Arc::new(registry),
            Duration::from_secs(300),
            Duration::from_millis(100),
        );
        (executor, run)
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_step_completes_with_substituted_action() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("test", |inv: AgentInvocation| async move {
            assert_eq!(inv.action, "deploy to prod");
            Ok(AgentOutput::with_message("deployed"))
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(0, None)), registry);

        let id = StepId::new("main", "work");
        assert!(run.begin_step(&id));
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::Completed);
        let snapshot = run.snapshot();
        assert_eq!(snapshot.status(&id), Some(StepStatus::Completed));
        assert_eq!(snapshot.steps[0].attempts, 1);
    }

    // -----------------------------------------------------------------------
    // Retry budget
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fails_once_then_succeeds_on_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = AgentRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register(FnAgent::new("test", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AgentError::ActionFailed("flaky".to_string()))
                } else {
                    Ok(AgentOutput::default())
                }
            }
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(2, None)), registry);

        let id = StepId::new("main", "work");
        run.begin_step(&id);
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.snapshot().steps[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails_with_exact_attempt_events() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("test", |_| async {
            Err(AgentError::ActionFailed("always broken".to_string()))
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(2, None)), registry);

        let id = StepId::new("main", "work");
        run.begin_step(&id);
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::Failed);
        let snapshot = run.snapshot();
        assert_eq!(snapshot.status(&id), Some(StepStatus::Failed));
        assert_eq!(snapshot.steps[0].attempts, 3, "retries: 2 means 3 attempts");
        assert_eq!(
            snapshot.steps[0].error.as_deref(),
            Some("action failed: always broken")
        );

        let attempts: Vec<_> = snapshot
            .recent_events
            .iter()
            .filter(|e| e.is_attempt())
            .collect();
        assert_eq!(attempts.len(), 3);
        assert!(matches!(attempts[0].kind, EventKind::Started { attempt: 1 }));
        assert!(matches!(attempts[1].kind, EventKind::Retrying { attempt: 2 }));
        assert!(matches!(attempts[2].kind, EventKind::Retrying { attempt: 3 }));
        let terminal = snapshot
            .recent_events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Failed { .. }))
            .count();
        assert_eq!(terminal, 1, "exactly one terminal event");
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_against_budget_with_distinct_event() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("test", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentOutput::default())
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(1, Some(1))), registry);

        let id = StepId::new("main", "work");
        run.begin_step(&id);
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::Failed);
        let snapshot = run.snapshot();
        let timeouts = snapshot
            .recent_events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Timeout { .. }))
            .count();
        assert_eq!(timeouts, 2, "both attempts timed out");
        assert!(
            snapshot.steps[0]
                .error
                .as_deref()
                .unwrap()
                .contains("timed out after 1s")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_within_timeout_completes() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("test", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentOutput::default())
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(0, Some(10))), registry);

        let id = StepId::new("main", "work");
        run.begin_step(&id);
        assert_eq!(executor.run_step(id).await, StepOutcome::Completed);
    }

    // -----------------------------------------------------------------------
    // Dispatch guard
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unauthorized_dispatch_is_rejected() {
        let registry = AgentRegistry::new();
        registry.register(FnAgent::new("test", |_| async {
            panic!("agent must not run without authorization")
        }));
        let (executor, run) = executor_for(playbook_with_step(base_step(0, None)), registry);

        let id = StepId::new("main", "work");
        // begin_step deliberately not called
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::NotStarted);
        assert_eq!(run.snapshot().status(&id), Some(StepStatus::Pending));
    }

    #[tokio::test]
    async fn missing_agent_fails_the_step() {
        let (executor, run) = executor_for(
            playbook_with_step(base_step(0, None)),
            AgentRegistry::new(),
        );

        let id = StepId::new("main", "work");
        run.begin_step(&id);
        let outcome = executor.run_step(id.clone()).await;

        assert_eq!(outcome, StepOutcome::Failed);
        assert!(
            run.snapshot().steps[0]
                .error
                .as_deref()
                .unwrap()
                .contains("no agent registered")
        );
    }

    // -----------------------------------------------------------------------
    // Variable substitution
    // -----------------------------------------------------------------------

    #[test]
    fn substitution_replaces_known_and_keeps_unknown() {
        let variables = vec![
            Variable {
                name: "env".to_string(),
                default: "staging".to_string(),
            },
            Variable {
                name: "region".to_string(),
                default: "eu-west-1".to_string(),
            },
        ];
        let action = "deploy --env ${env} --region ${region} --tag ${tag}";
        assert_eq!(
            substitute_variables(action, &variables),
            "deploy --env staging --region eu-west-1 --tag ${tag}"
        );
    }

    #[test]
    fn substitution_without_variables_is_identity() {
        assert_eq!(substitute_variables("make build", &[]), "make build");
    }
}

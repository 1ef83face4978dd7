//! Condition and dependency resolution.
//!
//! Pure functions from (playbook, step statuses) to scheduling decisions.
//! No clocks, no I/O, no interior mutability -- given the same inputs these
//! always produce the same outputs, in playbook declaration order, which is
//! what makes scheduling decisions reproducible and unit-testable.
//!
//! Two dual questions are answered for every pending step:
//! - is it *ready* (condition met, dependencies met, branch prerequisites
//!   fully complete)?
//! - is it *impossible* (some requirement can no longer be satisfied)?
//!
//! Impossible steps are skipped, and because a skip can make further steps
//! impossible, [`compute_skips`] iterates to a fixpoint.

use std::collections::{HashMap, HashSet};

use devgen_types::execution::StepStatus;
use devgen_types::playbook::{Branch, Condition, Playbook, Step, StepId};

// ---------------------------------------------------------------------------
// Ready set
// ---------------------------------------------------------------------------

/// All pending steps that are eligible to run right now, in declaration
/// order.
///
/// A step is ready when its condition holds, every `depends_on` target has
/// completed, and every prerequisite branch has settled successfully. Branch
/// parallelism is *not* applied here; the scheduler narrows the ready set to
/// respect per-branch concurrency.
pub fn ready_steps(playbook: &Playbook, statuses: &HashMap<StepId, StepStatus>) -> Vec<StepId> {
    playbook
        .steps()
        .filter_map(|(branch, step)| {
            let id = StepId::new(&branch.name, &step.name);
            let ready = statuses.get(&id) == Some(&StepStatus::Pending)
                && condition_met(&step.condition, &branch.name, statuses)
                && deps_met(step, &branch.name, statuses)
                && branch_prereqs_met(playbook, branch, statuses);
            ready.then_some(id)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Skip propagation
// ---------------------------------------------------------------------------

/// All pending steps that can never run, given the current statuses.
///
/// Iterates to a fixpoint: skipping a step may make further steps impossible
/// (their condition references it, they depend on it, or their branch now can
/// never fully complete). Returns the newly impossible steps in the order
/// they were discovered; the input map is not modified.
pub fn compute_skips(playbook: &Playbook, statuses: &HashMap<StepId, StepStatus>) -> Vec<StepId> {
    let mut working = statuses.clone();
    let mut skipped = Vec::new();

    loop {
        let mut changed = false;
        for (branch, step) in playbook.steps() {
            let id = StepId::new(&branch.name, &step.name);
            if working.get(&id) != Some(&StepStatus::Pending) {
                continue;
            }
            let impossible = condition_impossible(&step.condition, &branch.name, &working)
                || deps_impossible(step, &branch.name, &working)
                || branch_prereqs_impossible(playbook, branch, &working);
            if impossible {
                working.insert(id.clone(), StepStatus::Skipped);
                skipped.push(id);
                changed = true;
            }
        }
        if !changed {
            return skipped;
        }
    }
}

// ---------------------------------------------------------------------------
// Failure recovery
// ---------------------------------------------------------------------------

/// The set of steps whose failure some other step is prepared to handle.
///
/// A step `x` is in this set when any step in the playbook carries the
/// condition `x-failed`. Failure of such a step is recoverable: the run
/// continues and the handling steps become ready. Failure of any other step
/// is fatal to the run.
pub fn failure_recovery_set(playbook: &Playbook) -> HashSet<StepId> {
    playbook
        .steps()
        .filter_map(|(branch, step)| match &step.condition {
            Condition::Failed(reference) => Some(reference.resolve(&branch.name)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

fn status_of(
    reference: &devgen_types::playbook::StepRef,
    owning_branch: &str,
    statuses: &HashMap<StepId, StepStatus>,
) -> StepStatus {
    statuses
        .get(&reference.resolve(owning_branch))
        .copied()
        .unwrap_or(StepStatus::Pending)
}

fn condition_met(
    condition: &Condition,
    owning_branch: &str,
    statuses: &HashMap<StepId, StepStatus>,
) -> bool {
    match condition {
        Condition::Start => true,
        Condition::Completed(r) => status_of(r, owning_branch, statuses) == StepStatus::Completed,
        Condition::Failed(r) => status_of(r, owning_branch, statuses) == StepStatus::Failed,
    }
}

/// A condition is impossible once its referenced step settled in any terminal
/// state other than the one the condition waits for.
fn condition_impossible(
    condition: &Condition,
    owning_branch: &str,
    statuses: &HashMap<StepId, StepStatus>,
) -> bool {
    match condition {
        Condition::Start => false,
        Condition::Completed(r) => {
            let status = status_of(r, owning_branch, statuses);
            status.is_terminal() && status != StepStatus::Completed
        }
        Condition::Failed(r) => {
            let status = status_of(r, owning_branch, statuses);
            status.is_terminal() && status != StepStatus::Failed
        }
    }
}

fn deps_met(step: &Step, owning_branch: &str, statuses: &HashMap<StepId, StepStatus>) -> bool {
    step.depends_on
        .iter()
        .all(|dep| status_of(dep, owning_branch, statuses) == StepStatus::Completed)
}

fn deps_impossible(
    step: &Step,
    owning_branch: &str,
    statuses: &HashMap<StepId, StepStatus>,
) -> bool {
    step.depends_on.iter().any(|dep| {
        let status = status_of(dep, owning_branch, statuses);
        status.is_terminal() && status != StepStatus::Completed
    })
}

/// A skip that happens on the happy path: an unused `*-failed` handler
/// whose watched step completed (and whose own dependencies did not fail).
/// Every other skip traces back to a failure somewhere upstream.
fn benign_skip(step: &Step, owning_branch: &str, statuses: &HashMap<StepId, StepStatus>) -> bool {
    match &step.condition {
        Condition::Failed(r) => {
            status_of(r, owning_branch, statuses) == StepStatus::Completed
                && !deps_impossible(step, owning_branch, statuses)
        }
        _ => false,
    }
}

/// Every prerequisite branch has settled successfully: all of its steps are
/// completed or benignly skipped. An unused failure handler does not hold
/// its branch open, but a failure-caused skip still dooms dependents.
fn branch_prereqs_met(
    playbook: &Playbook,
    branch: &Branch,
    statuses: &HashMap<StepId, StepStatus>,
) -> bool {
    branch.depends_on.iter().all(|prereq| {
        playbook.branch(prereq).is_some_and(|b| {
            b.steps.iter().all(|s| {
                let status = statuses
                    .get(&StepId::new(&b.name, &s.name))
                    .copied()
                    .unwrap_or(StepStatus::Pending);
                match status {
                    StepStatus::Completed => true,
                    StepStatus::Skipped => benign_skip(s, &b.name, statuses),
                    _ => false,
                }
            })
        })
    })
}

/// Some prerequisite branch contains a failed (or failure-skipped) step, so
/// it can never settle successfully.
fn branch_prereqs_impossible(
    playbook: &Playbook,
    branch: &Branch,
    statuses: &HashMap<StepId, StepStatus>,
) -> bool {
    branch.depends_on.iter().any(|prereq| {
        playbook.branch(prereq).is_some_and(|b| {
            b.steps.iter().any(|s| {
                let status = statuses
                    .get(&StepId::new(&b.name, &s.name))
                    .copied()
                    .unwrap_or(StepStatus::Pending);
                match status {
                    StepStatus::Failed => true,
                    StepStatus::Skipped => !benign_skip(s, &b.name, statuses),
                    _ => false,
                }
            })
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

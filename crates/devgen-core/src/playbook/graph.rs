//! Graph checks for playbooks: cycle detection and startup liveness.
//!
//! Uses `petgraph` to model the playbook as directed graphs. Topological sort
//! detects cycles at three levels:
//!
//! 1. Branch prerequisites (`depends_on` between branches)
//! 2. Step dependencies and condition references
//! 3. The combined graph of both, with branch prerequisites expanded to
//!    step-level edges -- a cycle here means no step can ever become ready
//!    even though each individual graph is acyclic.

use std::collections::HashMap;

use devgen_types::playbook::{Playbook, StepId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::PlaybookError;

// ---------------------------------------------------------------------------
// Branch-prerequisite graph
// ---------------------------------------------------------------------------

/// Validate that branch prerequisites form a DAG.
///
/// Assumes references were already resolved by the caller; unknown branch
/// names are ignored here.
pub fn validate_branch_graph(playbook: &Playbook) -> Result<(), PlaybookError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, NodeIndex> = playbook
        .branches
        .iter()
        .map(|b| (b.name.as_str(), graph.add_node(b.name.as_str())))
        .collect();

    // Edge from prerequisite -> dependent branch
    for branch in &playbook.branches {
        for prereq in &branch.depends_on {
            if let Some(&from) = indices.get(prereq.as_str()) {
                graph.add_edge(from, indices[branch.name.as_str()], ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let name = graph[cycle.node_id()];
        PlaybookError::CycleDetected(format!("branch prerequisite cycle involving '{name}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Step graph (dependencies + condition references)
// ---------------------------------------------------------------------------

/// Validate that step dependencies and condition references form a DAG.
///
/// Both `depends_on` entries and the step named by a `*-completed` or
/// `*-failed` condition are treated as predecessor edges: either way the
/// referenced step must reach a terminal state before this one can start.
pub fn validate_step_graph(playbook: &Playbook) -> Result<(), PlaybookError> {
    let mut graph = DiGraph::<StepId, ()>::new();
    let mut indices: HashMap<StepId, NodeIndex> = HashMap::new();
    for id in playbook.step_ids() {
        let idx = graph.add_node(id.clone());
        indices.insert(id, idx);
    }

    add_step_edges(playbook, &mut graph, &indices);

    toposort(&graph, None).map_err(|cycle| {
        let id = &graph[cycle.node_id()];
        PlaybookError::CycleDetected(format!("step dependency cycle involving '{id}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Startup liveness
// ---------------------------------------------------------------------------

/// Validate that the playbook can make initial progress.
///
/// Builds the combined graph: step dependency edges, condition reference
/// edges, and branch prerequisites expanded to step level (every step of a
/// prerequisite branch precedes every step of the dependent branch). A cycle
/// in the combined graph means a set of steps mutually wait on each other
/// across the branch and step levels, so the run would sit idle forever.
pub fn validate_liveness(playbook: &Playbook) -> Result<(), PlaybookError> {
    let mut graph = DiGraph::<StepId, ()>::new();
    let mut indices: HashMap<StepId, NodeIndex> = HashMap::new();
    for id in playbook.step_ids() {
        let idx = graph.add_node(id.clone());
        indices.insert(id, idx);
    }

    add_step_edges(playbook, &mut graph, &indices);

    // Expand branch prerequisites: every step of the prerequisite branch
    // precedes every step of the dependent branch.
    for branch in &playbook.branches {
        for prereq in &branch.depends_on {
            let Some(prereq_branch) = playbook.branch(prereq) else {
                continue;
            };
            for pre_step in &prereq_branch.steps {
                let from = indices[&StepId::new(&prereq_branch.name, &pre_step.name)];
                for step in &branch.steps {
                    let to = indices[&StepId::new(&branch.name, &step.name)];
                    graph.add_edge(from, to, ());
                }
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let id = &graph[cycle.node_id()];
        PlaybookError::Deadlock(format!(
            "steps wait on each other across branches, starting from '{id}'"
        ))
    })?;

    Ok(())
}

/// Add one edge per step dependency and per condition reference, from the
/// referenced step to the referencing step.
fn add_step_edges(
    playbook: &Playbook,
    graph: &mut DiGraph<StepId, ()>,
    indices: &HashMap<StepId, NodeIndex>,
) {
    for (branch, step) in playbook.steps() {
        let to = indices[&StepId::new(&branch.name, &step.name)];
        for dep in &step.depends_on {
            if let Some(&from) = indices.get(&dep.resolve(&branch.name)) {
                graph.add_edge(from, to, ());
            }
        }
        if let Some(reference) = step.condition.reference() {
            if let Some(&from) = indices.get(&reference.resolve(&branch.name)) {
                graph.add_edge(from, to, ());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Playbook definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the in-memory `Playbook`, validates
//! structural constraints (unique names, resolvable references, acyclic
//! graphs, startup liveness), and provides discovery for playbook files on
//! disk. The engine re-runs `validate_playbook` defensively at construction;
//! anything caught here is a fatal load-time error, never a runtime one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use devgen_types::playbook::{Playbook, StepId};
use thiserror::Error;

use super::graph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a playbook.
#[derive(Debug, Error)]
pub enum PlaybookError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure (duplicate names, bad formats).
    #[error("validation error: {0}")]
    Validation(String),

    /// A branch or step reference does not resolve.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// The branch-prerequisite or step graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// No step can ever become ready; the run would hang before it starts.
    #[error("playbook can never make progress: {0}")]
    Deadlock(String),

    /// A step names an agent that is not registered with the engine.
    #[error("step '{step}' names unknown agent '{agent}'")]
    UnknownAgent { step: StepId, agent: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Playbook`.
///
/// Runs `validate_playbook` after deserialization, so the returned value is
/// guaranteed to be structurally valid and live.
pub fn parse_playbook_yaml(yaml: &str) -> Result<Playbook, PlaybookError> {
    let playbook: Playbook =
        serde_yaml_ng::from_str(yaml).map_err(|e| PlaybookError::Parse(e.to_string()))?;
    validate_playbook(&playbook)?;
    Ok(playbook)
}

/// Serialize a `Playbook` to a YAML string.
pub fn serialize_playbook_yaml(playbook: &Playbook) -> Result<String, PlaybookError> {
    serde_yaml_ng::to_string(playbook).map_err(|e| PlaybookError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `Playbook`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one branch; every branch has at least one step
/// - Branch names unique; step names unique within their branch
/// - Branch `depends_on` references existing branches (and not itself)
/// - Step `depends_on` and condition references resolve to existing steps
///   (and not the step itself)
/// - Branch-prerequisite graph and combined step graph are acyclic
/// - The playbook can make initial progress (no startup deadlock)
/// - Step timeouts are > 0 when set
pub fn validate_playbook(playbook: &Playbook) -> Result<(), PlaybookError> {
    if playbook.name.is_empty() {
        return Err(PlaybookError::Validation(
            "playbook name must not be empty".to_string(),
        ));
    }
    if !playbook
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(PlaybookError::Validation(format!(
            "playbook name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            playbook.name
        )));
    }

    if playbook.branches.is_empty() {
        return Err(PlaybookError::Validation(
            "playbook must have at least one branch".to_string(),
        ));
    }

    // Unique branch names
    let mut branch_names = HashSet::new();
    for branch in &playbook.branches {
        if !branch_names.insert(branch.name.as_str()) {
            return Err(PlaybookError::Validation(format!(
                "duplicate branch name: '{}'",
                branch.name
            )));
        }
        if branch.steps.is_empty() {
            return Err(PlaybookError::Validation(format!(
                "branch '{}' has no steps",
                branch.name
            )));
        }
    }

    // Unique step names per branch; collect full identities
    let mut step_ids = HashSet::new();
    for branch in &playbook.branches {
        let mut seen = HashSet::new();
        for step in &branch.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(PlaybookError::Validation(format!(
                    "duplicate step name '{}' in branch '{}'",
                    step.name, branch.name
                )));
            }
            step_ids.insert(StepId::new(&branch.name, &step.name));
        }
    }

    // Branch prerequisites must reference existing branches
    for branch in &playbook.branches {
        for prereq in &branch.depends_on {
            if prereq == &branch.name {
                return Err(PlaybookError::Validation(format!(
                    "branch '{}' depends on itself",
                    branch.name
                )));
            }
            if !branch_names.contains(prereq.as_str()) {
                return Err(PlaybookError::UnknownReference(format!(
                    "branch '{}' depends on unknown branch '{}'",
                    branch.name, prereq
                )));
            }
        }
    }

    // Step dependency and condition references must resolve
    for branch in &playbook.branches {
        for step in &branch.steps {
            let own_id = StepId::new(&branch.name, &step.name);
            for dep in &step.depends_on {
                let target = dep.resolve(&branch.name);
                if target == own_id {
                    return Err(PlaybookError::Validation(format!(
                        "step '{own_id}' depends on itself"
                    )));
                }
                if !step_ids.contains(&target) {
                    return Err(PlaybookError::UnknownReference(format!(
                        "step '{own_id}' depends on unknown step '{target}'"
                    )));
                }
            }
            if let Some(reference) = step.condition.reference() {
                let target = reference.resolve(&branch.name);
                if target == own_id {
                    return Err(PlaybookError::Validation(format!(
                        "step '{own_id}' condition references itself"
                    )));
                }
                if !step_ids.contains(&target) {
                    return Err(PlaybookError::UnknownReference(format!(
                        "step '{own_id}' condition references unknown step '{target}'"
                    )));
                }
            }
            if step.timeout_secs == Some(0) {
                return Err(PlaybookError::Validation(format!(
                    "step '{own_id}' timeout must be > 0"
                )));
            }
        }
    }

    // Graph-level checks: cycles and startup liveness
    graph::validate_branch_graph(playbook)?;
    graph::validate_step_graph(playbook)?;
    graph::validate_liveness(playbook)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a playbook from a YAML file.
pub fn load_playbook_file(path: &Path) -> Result<Playbook, PlaybookError> {
    let content = std::fs::read_to_string(path)?;
    parse_playbook_yaml(&content)
}

/// Save a playbook to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_playbook_file(path: &Path, playbook: &Playbook) -> Result<(), PlaybookError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_playbook_yaml(playbook)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all playbook YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// or validate are skipped with a warning rather than aborting discovery.
pub fn discover_playbooks(base_dir: &Path) -> Result<Vec<(PathBuf, Playbook)>, PlaybookError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, Playbook)>,
) -> Result<(), PlaybookError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_playbook_file(&path) {
                    Ok(playbook) => results.push((path, playbook)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable playbook file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use devgen_types::playbook::{Branch, Step};

    /// Helper: build a step with the given name, condition string, and deps.
    fn step(name: &str, condition: &str, depends_on: Vec<&str>) -> Step {
        Step {
            name: name.to_string(),
            agent: "shell".to_string(),
            action: format!("run {name}"),
            condition: condition.parse().unwrap(),
            depends_on: depends_on.into_iter().map(|d| d.parse().unwrap()).collect(),
            timeout_secs: None,
            retries: 0,
        }
    }

    /// Helper: build a branch.
    fn branch(name: &str, parallel: bool, depends_on: Vec<&str>, steps: Vec<Step>) -> Branch {
        Branch {
            name: name.to_string(),
            parallel,
            depends_on: depends_on.into_iter().map(String::from).collect(),
            steps,
        }
    }

    /// Helper: build a playbook.
    fn playbook(name: &str, branches: Vec<Branch>) -> Playbook {
        Playbook {
            name: name.to_string(),
            version: "1.0".to_string(),
            description: None,
            variables: vec![],
            branches,
        }
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn parse_yaml_roundtrip() {
        let yaml = r#"
name: release-pipeline
version: "1.0"
branches:
  - name: main
    steps:
      - name: setup
        agent: shell
        action: make setup
      - name: configure
        agent: shell
        action: make configure
        condition: setup-completed
  - name: build
    parallel: true
    steps:
      - name: compile
        agent: shell
        action: make build
"#;
        let pb = parse_playbook_yaml(yaml).expect("should parse");
        assert_eq!(pb.name, "release-pipeline");
        assert_eq!(pb.branches.len(), 2);

        let yaml2 = serialize_playbook_yaml(&pb).expect("should serialize");
        let pb2 = parse_playbook_yaml(&yaml2).expect("should re-parse");
        assert_eq!(pb2.name, pb.name);
        assert_eq!(pb2.step_count(), pb.step_count());
    }

    #[test]
    fn parse_rejects_bad_condition_grammar() {
        let yaml = r#"
name: p
version: "1"
branches:
  - name: main
    steps:
      - name: a
        agent: shell
        action: x
        condition: whenever-ready
"#;
        let err = parse_playbook_yaml(yaml).unwrap_err();
        assert!(matches!(err, PlaybookError::Parse(_)), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Validation: names
    // -----------------------------------------------------------------------

    #[test]
    fn validation_rejects_empty_name() {
        let pb = playbook("", vec![branch("main", false, vec![], vec![step("a", "start", vec![])])]);
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("must not be empty"), "got: {err}");
    }

    #[test]
    fn validation_rejects_invalid_name() {
        let pb = playbook(
            "has spaces!",
            vec![branch("main", false, vec![], vec![step("a", "start", vec![])])],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("invalid characters"), "got: {err}");
    }

    #[test]
    fn validation_rejects_duplicate_branch_names() {
        let pb = playbook(
            "p",
            vec![
                branch("main", false, vec![], vec![step("a", "start", vec![])]),
                branch("main", false, vec![], vec![step("b", "start", vec![])]),
            ],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("duplicate branch"), "got: {err}");
    }

    #[test]
    fn validation_rejects_duplicate_step_names_in_branch() {
        let pb = playbook(
            "p",
            vec![branch(
                "main",
                false,
                vec![],
                vec![step("a", "start", vec![]), step("a", "start", vec![])],
            )],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("duplicate step"), "got: {err}");
    }

    #[test]
    fn validation_allows_same_step_name_across_branches() {
        let pb = playbook(
            "p",
            vec![
                branch("one", true, vec![], vec![step("build", "start", vec![])]),
                branch("two", true, vec![], vec![step("build", "start", vec![])]),
            ],
        );
        assert!(validate_playbook(&pb).is_ok());
    }

    // -----------------------------------------------------------------------
    // Validation: references
    // -----------------------------------------------------------------------

    #[test]
    fn validation_rejects_unknown_branch_prerequisite() {
        let pb = playbook(
            "p",
            vec![branch(
                "main",
                false,
                vec!["missing"],
                vec![step("a", "start", vec![])],
            )],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(matches!(err, PlaybookError::UnknownReference(_)), "got: {err}");
    }

    #[test]
    fn validation_rejects_unknown_step_dependency() {
        let pb = playbook(
            "p",
            vec![branch(
                "main",
                false,
                vec![],
                vec![step("a", "start", vec!["missing"])],
            )],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(matches!(err, PlaybookError::UnknownReference(_)), "got: {err}");
    }

    #[test]
    fn validation_rejects_unknown_condition_reference() {
        let pb = playbook(
            "p",
            vec![branch(
                "main",
                false,
                vec![],
                vec![step("a", "start", vec![]), step("b", "ghost-completed", vec![])],
            )],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(matches!(err, PlaybookError::UnknownReference(_)), "got: {err}");
    }

    #[test]
    fn validation_rejects_self_dependency() {
        let pb = playbook(
            "p",
            vec![branch("main", false, vec![], vec![step("a", "start", vec!["a"])])],
        );
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("depends on itself"), "got: {err}");
    }

    #[test]
    fn validation_rejects_zero_timeout() {
        let mut pb = playbook(
            "p",
            vec![branch("main", false, vec![], vec![step("a", "start", vec![])])],
        );
        pb.branches[0].steps[0].timeout_secs = Some(0);
        let err = validate_playbook(&pb).unwrap_err();
        assert!(err.to_string().contains("timeout must be > 0"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Validation: cross-branch references
    // -----------------------------------------------------------------------

    #[test]
    fn validation_accepts_cross_branch_condition() {
        let pb = playbook(
            "p",
            vec![
                branch("main", false, vec![], vec![step("setup", "start", vec![])]),
                branch(
                    "deploy",
                    true,
                    vec![],
                    vec![step("ship", "main.setup-completed", vec![])],
                ),
            ],
        );
        assert!(validate_playbook(&pb).is_ok());
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playbooks/release.yaml");

        let pb = playbook(
            "release",
            vec![branch("main", false, vec![], vec![step("a", "start", vec![])])],
        );
        save_playbook_file(&path, &pb).expect("should save");

        let loaded = load_playbook_file(&path).expect("should load");
        assert_eq!(loaded.name, "release");
        assert_eq!(loaded.step_count(), 1);
    }

    #[test]
    fn discover_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();

        let pb1 = playbook(
            "wf-one",
            vec![branch("main", false, vec![], vec![step("a", "start", vec![])])],
        );
        let pb2 = playbook(
            "wf-two",
            vec![branch("main", false, vec![], vec![step("b", "start", vec![])])],
        );
        save_playbook_file(&dir.path().join("one.yaml"), &pb1).unwrap();
        save_playbook_file(&dir.path().join("sub/two.yml"), &pb2).unwrap();
        std::fs::write(dir.path().join("not-a-playbook.yaml"), "key: value").unwrap();

        let found = discover_playbooks(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2, "should find exactly 2 valid playbooks");
    }

    #[test]
    fn discover_nonexistent_dir_is_empty() {
        let found = discover_playbooks(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}

//! Playbook loading and validation.
//!
//! - `definition` -- YAML parsing, structural validation, filesystem load/save
//! - `graph` -- petgraph-based cycle detection and startup liveness checks

pub mod definition;
pub mod graph;

pub use definition::{
    PlaybookError, discover_playbooks, load_playbook_file, parse_playbook_yaml,
    save_playbook_file, validate_playbook,
};

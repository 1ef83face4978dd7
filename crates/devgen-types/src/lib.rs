//! Shared domain types for the DevGen playbook engine.
//!
//! This crate defines the playbook model consumed by the execution engine and
//! the execution-tracking types (statuses, events, snapshots) exposed to
//! front ends. It depends only on serde and time/id crates -- never on the
//! engine or any IO crate.

pub mod execution;
pub mod playbook;

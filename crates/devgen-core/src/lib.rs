//! Playbook execution engine for DevGen.
//!
//! This crate contains the "brain" of the orchestrator:
//! - `playbook` -- YAML parsing, structural validation, DAG/liveness checks
//! - `engine` -- resolver, agent capability, step executor, scheduler
//! - `event` -- broadcast bus distributing execution events to front ends
//!
//! The engine consumes a validated [`devgen_types::playbook::Playbook`] and
//! exposes only the control interface ([`engine::Engine`]) plus copied
//! snapshots -- front ends never touch engine internals.

pub mod engine;
pub mod event;
pub mod playbook;

//! CLI command definitions and dispatch for the `devgen` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod list;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run development playbooks against pluggable agents.
#[derive(Parser)]
#[command(name = "devgen", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a playbook to completion, streaming step events.
    Run {
        /// Path to the playbook YAML file.
        file: PathBuf,

        /// Override a playbook variable (KEY=VALUE, repeatable).
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Validate a playbook file without running it.
    Validate {
        /// Path to the playbook YAML file.
        file: PathBuf,
    },

    /// List playbooks found under a directory.
    #[command(alias = "ls")]
    List {
        /// Directory to scan recursively.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

//! `devgen validate` -- check a playbook file without executing it.

use std::path::Path;

use anyhow::{Result, bail};
use console::style;

use devgen_core::playbook::load_playbook_file;

pub fn validate_file(file: &Path, json: bool) -> Result<()> {
    match load_playbook_file(file) {
        Ok(playbook) => {
            if json {
                let report = serde_json::json!({
                    "valid": true,
                    "playbook": playbook.name,
                    "version": playbook.version,
                    "branches": playbook.branches.len(),
                    "steps": playbook.step_count(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!(
                    "  {} {} is valid",
                    style("✓").green().bold(),
                    style(&playbook.name).cyan()
                );
                println!(
                    "    {} branches, {} steps",
                    playbook.branches.len(),
                    playbook.step_count()
                );
                println!();
            }
            Ok(())
        }
        Err(err) => {
            if json {
                let report = serde_json::json!({
                    "valid": false,
                    "error": err.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!("  {} {}", style("✗").red().bold(), err);
                println!();
            }
            bail!("playbook validation failed");
        }
    }
}

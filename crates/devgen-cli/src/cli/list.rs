//! `devgen list` -- discover playbook files under a directory.

use std::path::Path;

use anyhow::Result;
use comfy_table::{ContentArrangement, Table, presets};
use console::style;

use devgen_core::playbook::discover_playbooks;

pub fn list_playbooks(dir: &Path, json: bool) -> Result<()> {
    let mut found = discover_playbooks(dir)?;
    found.sort_by(|(_, a), (_, b)| a.name.cmp(&b.name));

    if json {
        let entries: Vec<_> = found
            .iter()
            .map(|(path, playbook)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "name": playbook.name,
                    "version": playbook.version,
                    "branches": playbook.branches.len(),
                    "steps": playbook.step_count(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if found.is_empty() {
        println!();
        println!(
            "  No playbooks found under {}",
            style(dir.display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Name", "Version", "Branches", "Steps", "Path"]);

    for (path, playbook) in &found {
        table.add_row(vec![
            playbook.name.clone(),
            playbook.version.clone(),
            playbook.branches.len().to_string(),
            playbook.step_count().to_string(),
            path.display().to_string(),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

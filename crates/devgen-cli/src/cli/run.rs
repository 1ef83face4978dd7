//! `devgen run` -- execute a playbook, streaming step events to the
//! terminal.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use devgen_core::engine::{AgentRegistry, Engine, EngineConfig};
use devgen_core::playbook::load_playbook_file;
use devgen_types::execution::{EventKind, ExecutionEvent, ExecutionSnapshot, RunPhase, StepStatus};
use devgen_types::playbook::Playbook;

use crate::agents::CommandAgent;

/// Load, wire up, and execute a playbook to settlement.
pub async fn run_playbook(file: &Path, vars: &[String], json: bool, quiet: bool) -> Result<()> {
    let mut playbook = load_playbook_file(file)
        .with_context(|| format!("failed to load playbook from {}", file.display()))?;
    apply_overrides(&mut playbook, vars)?;

    // Every agent identifier the playbook names becomes a shell agent.
    let registry = Arc::new(AgentRegistry::new());
    let agent_ids: BTreeSet<String> = playbook
        .steps()
        .map(|(_, step)| step.agent.clone())
        .collect();
    for id in agent_ids {
        registry.register(CommandAgent::new(id));
    }

    let engine = Engine::new(playbook, registry, EngineConfig::default())?;
    let mut events = engine.subscribe();

    if !json && !quiet {
        println!();
        println!(
            "  {} Running playbook {} ({} steps)",
            style("⚡").bold(),
            style(&engine.playbook().name).cyan(),
            engine.playbook().step_count()
        );
        println!();
    }

    engine.start().await?;

    let phase = loop {
        tokio::select! {
            received = events.recv() => {
                if let Ok(event) = received {
                    render_event(&event, json, quiet);
                }
            }
            phase = engine.wait() => break phase,
            _ = tokio::signal::ctrl_c() => {
                if !json && !quiet {
                    println!();
                    println!(
                        "  {} Interrupted, waiting for in-flight steps...",
                        style("⏹").yellow()
                    );
                }
                engine.stop().await?;
            }
        }
    };

    // Flush any events that settled alongside the final phase change.
    while let Ok(event) = events.try_recv() {
        render_event(&event, json, quiet);
    }

    let snapshot = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if !quiet {
        print_summary(&snapshot);
    }

    match phase {
        RunPhase::Failed => {
            let failed = snapshot
                .failed_step
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown step".to_string());
            bail!("run failed at {failed}");
        }
        RunPhase::Idle => {
            if !json && !quiet {
                println!("  {} Run stopped; progress preserved.", style("⏹").yellow());
                println!();
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Apply `KEY=VALUE` overrides to the playbook's variable defaults.
fn apply_overrides(playbook: &mut Playbook, vars: &[String]) -> Result<()> {
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("invalid variable override '{var}' (expected KEY=VALUE)");
        };
        let Some(variable) = playbook.variables.iter_mut().find(|v| v.name == key) else {
            bail!(
                "unknown variable '{key}' (playbook declares: {})",
                playbook
                    .variables
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        };
        variable.default = value.to_string();
    }
    Ok(())
}

/// Print one execution event.
fn render_event(event: &ExecutionEvent, json: bool, quiet: bool) {
    if quiet {
        return;
    }
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
        return;
    }

    let ts = style(event.timestamp.format("%H:%M:%S")).dim();
    let step = event
        .step
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();

    match &event.kind {
        EventKind::Started { .. } => {
            println!("  {ts} {} {}", style("▶").cyan(), step);
        }
        EventKind::Retrying { attempt } => {
            println!(
                "  {ts} {} {} (attempt {attempt})",
                style("↻").yellow(),
                step
            );
        }
        EventKind::Completed => {
            println!("  {ts} {} {}", style("✓").green(), step);
        }
        EventKind::Failed { attempts } => {
            let detail = event.message.as_deref().unwrap_or("no detail");
            println!(
                "  {ts} {} {} after {attempts} attempt(s): {}",
                style("✗").red().bold(),
                step,
                style(detail).red()
            );
        }
        EventKind::Timeout { attempt } => {
            println!(
                "  {ts} {} {} (attempt {attempt} timed out)",
                style("⏱").yellow(),
                step
            );
        }
        EventKind::Skipped => {
            println!("  {ts} {} {}", style("○").dim(), style(step).dim());
        }
        EventKind::Phase { phase } => {
            println!("  {ts} {} run {phase:?}", style("●").bold());
        }
    }
}

/// Final per-step summary table.
fn print_summary(snapshot: &ExecutionSnapshot) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Step", "Status", "Attempts", "Detail"]);

    for step in &snapshot.steps {
        let status_cell = match step.status {
            StepStatus::Completed => Cell::new("completed").fg(Color::Green),
            StepStatus::Failed => Cell::new("failed").fg(Color::Red),
            StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
            StepStatus::Running => Cell::new("running").fg(Color::Cyan),
            StepStatus::Pending => Cell::new("pending"),
        };
        table.add_row(vec![
            Cell::new(step.id.to_string()),
            status_cell,
            Cell::new(step.attempts.to_string()),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {} completed, {} failed, {} skipped",
        style(snapshot.counters.completed).green(),
        style(snapshot.counters.failed).red(),
        style(snapshot.counters.skipped).dim()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use devgen_types::playbook::{Branch, Step, Variable};

    use super::*;

    fn playbook_with_vars(vars: Vec<(&str, &str)>) -> Playbook {
        Playbook {
            name: "vars".to_string(),
            version: "1".to_string(),
            description: None,
            variables: vars
                .into_iter()
                .map(|(name, default)| Variable {
                    name: name.to_string(),
                    default: default.to_string(),
                })
                .collect(),
            branches: vec![Branch {
                name: "main".to_string(),
                parallel: false,
                depends_on: vec![],
                steps: vec![Step {
                    name: "a".to_string(),
                    agent: "shell".to_string(),
                    action: "true".to_string(),
                    condition: "start".parse().unwrap(),
                    depends_on: vec![],
                    timeout_secs: None,
                    retries: 0,
                }],
            }],
        }
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut pb = playbook_with_vars(vec![("env", "staging"), ("region", "us-east-1")]);
        apply_overrides(&mut pb, &["env=prod".to_string()]).unwrap();
        assert_eq!(pb.variables[0].default, "prod");
        assert_eq!(pb.variables[1].default, "us-east-1");
    }

    #[test]
    fn override_of_unknown_variable_is_rejected() {
        let mut pb = playbook_with_vars(vec![("env", "staging")]);
        let err = apply_overrides(&mut pb, &["missing=x".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown variable"), "got: {err}");
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut pb = playbook_with_vars(vec![("env", "staging")]);
        let err = apply_overrides(&mut pb, &["no-equals-sign".to_string()]).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"), "got: {err}");
    }
}

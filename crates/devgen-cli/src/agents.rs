//! Shell-command agent: the CLI's default step capability.
//!
//! Every agent identifier named in a playbook is mapped to a
//! [`CommandAgent`] that runs the step's action as a shell command. Exit
//! status zero completes the step; anything else (or a spawn failure) fails
//! the attempt and counts against the retry budget.

use devgen_core::engine::{AgentError, AgentInvocation, AgentOutput, StepAgent};
use tokio::process::Command;

/// Cap on how much process output is carried into step events.
const OUTPUT_LIMIT: usize = 400;

/// Runs step actions as `sh -c <action>`.
pub struct CommandAgent {
    id: String,
}

impl CommandAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl StepAgent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, invocation: AgentInvocation) -> Result<AgentOutput, AgentError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&invocation.action)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let trimmed = stdout.trim();
            Ok(if trimmed.is_empty() {
                AgentOutput::default()
            } else {
                AgentOutput::with_message(truncate(trimmed))
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            let reason = if detail.is_empty() {
                format!("{}", output.status)
            } else {
                format!("{}: {}", output.status, truncate(detail))
            };
            Err(AgentError::ActionFailed(reason))
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= OUTPUT_LIMIT {
        return text.to_string();
    }
    let mut cut = OUTPUT_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

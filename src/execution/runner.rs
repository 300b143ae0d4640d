use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::decomposition::Workstream;

/// Keep at most this many characters of agent stdout as workstream output.
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Abstraction over running a single workstream, for testability.
/// Real implementation: `ProcessWorkstreamRunner`.
#[async_trait]
pub trait WorkstreamRunner: Send + Sync {
    /// Run the workstream to completion and return its output.
    async fn run(&self, workstream: &Workstream) -> Result<String>;
}

/// Runs each workstream as an agent CLI process.
///
/// `agent_cmd` is split on whitespace into program and leading arguments;
/// the workstream prompt is appended as the final argument.
pub struct ProcessWorkstreamRunner {
    agent_cmd: String,
    working_dir: Option<PathBuf>,
}

impl ProcessWorkstreamRunner {
    pub fn new(agent_cmd: &str) -> Self {
        Self {
            agent_cmd: agent_cmd.to_string(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn prompt(workstream: &Workstream) -> String {
        let mut prompt = format!(
            "You are the {} agent for workstream '{}' ({}).",
            workstream.assigned_agent, workstream.name, workstream.key
        );
        if !workstream.owns_files.is_empty() {
            let owns: Vec<&str> = workstream.owns_files.iter().map(String::as_str).collect();
            prompt.push_str(&format!(" Only modify these files: {}.", owns.join(", ")));
        }
        if !workstream.produces_files.is_empty() {
            let produces: Vec<&str> = workstream
                .produces_files
                .iter()
                .map(String::as_str)
                .collect();
            prompt.push_str(&format!(" Produce: {}.", produces.join(", ")));
        }
        prompt
    }
}

#[async_trait]
impl WorkstreamRunner for ProcessWorkstreamRunner {
    async fn run(&self, workstream: &Workstream) -> Result<String> {
        let mut parts = self.agent_cmd.split_whitespace();
        let program = parts.next().context("Agent command is empty")?;

        let owns: Vec<&str> = workstream.owns_files.iter().map(String::as_str).collect();
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg(Self::prompt(workstream))
            .env("FACTORY_WORKSTREAM_KEY", &workstream.key)
            .env("FACTORY_WORKSTREAM_AGENT", &workstream.assigned_agent)
            .env("FACTORY_WORKSTREAM_OWNS", owns.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(workstream = %workstream.key, cmd = %self.agent_cmd, "Spawning agent");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn agent command '{}'", self.agent_cmd))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Agent exited with {}: {}",
                output.status,
                tail(stderr.trim(), OUTPUT_TAIL_CHARS)
            );
        }
        Ok(tail(stdout.trim(), OUTPUT_TAIL_CHARS))
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

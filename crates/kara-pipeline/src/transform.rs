use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub command: String,
    pub duration_ms: u128,
}

/// Builds the fact tables from `raw.telegram_messages`.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    async fn run(&self) -> anyhow::Result<TransformReport>;
}

/// Runs an external transformation tool, `dbt run` by default.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTransform {
    pub fn new(command: &[String], working_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("transform command is empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl TransformRunner for CommandTransform {
    async fn run(&self) -> anyhow::Result<TransformReport> {
        let command_line = self.display();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        info!(command = %command_line, "running transform");
        let started = Instant::now();
        let output = command
            .output()
            .await
            .with_context(|| format!("spawning `{command_line}`"))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(target: "kara::transform", "{line}");
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!(target: "kara::transform", "{line}");
        }

        if !output.status.success() {
            let tail = stderr.lines().last().unwrap_or("").trim().to_string();
            bail!("`{command_line}` exited with {}: {tail}", output.status);
        }

        let duration_ms = started.elapsed().as_millis();
        info!(command = %command_line, duration_ms, "transform finished");
        Ok(TransformReport {
            command: command_line,
            duration_ms,
        })
    }
}

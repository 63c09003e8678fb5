//! Work item runners.
//!
//! A runner executes one work item attempt and reports usage plus an optional
//! classified failure. `RunnerRegistry` maps runner names to implementations;
//! `CommandRunner` shells out to a configured program.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::traits::{AgentRegistry, FailureKind, RunReport, RunRequest, WorkItem, WorkItemRunner};
use crate::utils::truncate_tail;

const MAX_LOG_CHARS: usize = 8_000;
const MAX_ERROR_CHARS: usize = 2_000;

#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn WorkItemRunner>>,
    default_runner: Option<String>,
}

impl RunnerRegistry {
    pub fn new(default_runner: Option<String>) -> Self {
        Self {
            runners: HashMap::new(),
            default_runner,
        }
    }

    pub fn from_config(
        runners: &HashMap<String, RunnerConfig>,
        default_runner: Option<String>,
    ) -> Self {
        let mut registry = Self::new(default_runner);
        for (name, cfg) in runners {
            registry.register(Arc::new(CommandRunner::new(name, cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn WorkItemRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkItemRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    /// The agent a work item belongs to: explicit assignment first, then the
    /// tick context that created it.
    fn agent_for<'a>(item: &'a WorkItem) -> Option<&'a str> {
        item.assigned_agent
            .as_deref()
            .or_else(|| item.context.as_agent_tick().map(|t| t.agent_id.as_str()))
    }

    /// Resolve the runner for a work item: its agent's runner when that names a
    /// registered one, else the default runner.
    pub fn resolve(
        &self,
        item: &WorkItem,
        agents: &dyn AgentRegistry,
    ) -> Option<Arc<dyn WorkItemRunner>> {
        let agent_runner = Self::agent_for(item)
            .and_then(|id| agents.get_agent(id))
            .and_then(|def| def.runner);
        if let Some(name) = agent_runner {
            if let Some(runner) = self.get(&name) {
                return Some(runner);
            }
            warn!(work_item_id = %item.id, runner = %name, "Agent names an unknown runner, using default");
        }
        self.default_runner.as_deref().and_then(|name| self.get(name))
    }
}

/// Usage line a command may print last on stdout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsageLine {
    tokens_used: i64,
    cost_usd: f64,
    artifacts: Vec<String>,
}

fn parse_usage_line(stdout: &str) -> Option<UsageLine> {
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    if !last.starts_with('{') {
        return None;
    }
    serde_json::from_str(last).ok()
}

pub struct CommandRunner {
    name: String,
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(name: &str, config: RunnerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl WorkItemRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: RunRequest) -> anyhow::Result<RunReport> {
        let payload = serde_json::to_string(&request.work_item)?;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env("PONYBUNNY_WORK_ITEM", payload)
            .env("PONYBUNNY_MODEL", &request.model)
            .env("PONYBUNNY_GOAL_ID", &request.goal.id)
            .env("PONYBUNNY_RUN_ID", &request.run_id)
            .env("PONYBUNNY_LANE", request.lane.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("runner '{}': failed to spawn {}", self.name, self.config.command))?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("runner '{}': wait failed", self.name))?,
            Err(_) => {
                // The child is dropped with the future and killed.
                return Ok(RunReport::failed(
                    FailureKind::Timeout,
                    format!("runner '{}' timed out after {}s", self.name, self.config.timeout_secs),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(
            runner = %self.name,
            work_item_id = %request.work_item.id,
            status = ?output.status.code(),
            "Runner exited"
        );

        let usage = parse_usage_line(&stdout).unwrap_or_default();
        let mut report = RunReport {
            tokens_used: usage.tokens_used,
            cost_usd: usage.cost_usd,
            artifacts: usage.artifacts,
            log: (!stdout.is_empty()).then(|| truncate_tail(&stdout, MAX_LOG_CHARS)),
            failure: None,
        };

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("exit status {:?}", output.status.code())
            } else {
                truncate_tail(stderr.trim(), MAX_ERROR_CHARS)
            };
            report.failure = RunReport::failed(
                FailureKind::Transient,
                format!("runner '{}' failed: {}", self.name, detail),
            )
            .failure;
        }
        Ok(report)
    }
}

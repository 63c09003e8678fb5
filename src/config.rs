use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::cron_utils::parse_schedule;
use crate::schedule::{ScheduleError, ScheduleSpec};
use crate::traits::AgentPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub lanes: LanesConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub runners: HashMap<String, RunnerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> String {
    "ponybunny.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// IP address to bind the health server to (default: "127.0.0.1").
    /// Set to "0.0.0.0" to listen on all interfaces.
    #[serde(default = "default_health_bind")]
    pub health_bind: String,
    /// Identity written into `claimed_by`. Generated per process when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            health_bind: default_health_bind(),
            instance_id: None,
        }
    }
}

impl DaemonConfig {
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = self.instance_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return id.trim().to_string();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "ponybunny".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
    }
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on one dispatch tick; the next tick still fires.
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,
    /// Claim lease length. There is no lease renewal, so keep this well above
    /// the worst-case dispatch + submit time; the per-occurrence run record is
    /// what ultimately prevents a double dispatch.
    #[serde(default = "default_claim_ttl_ms")]
    pub claim_ttl_ms: i64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_max_claims_per_tick")]
    pub max_claims_per_tick: i64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: i64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            tick_timeout_ms: default_tick_timeout_ms(),
            claim_ttl_ms: default_claim_ttl_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            max_claims_per_tick: default_max_claims_per_tick(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_tick_timeout_ms() -> u64 {
    30_000
}

fn default_claim_ttl_ms() -> i64 {
    120_000
}

fn default_submit_timeout_ms() -> u64 {
    30_000
}

fn default_max_claims_per_tick() -> i64 {
    16
}

fn default_backoff_base_ms() -> i64 {
    30_000
}

fn default_backoff_max_ms() -> i64 {
    3_600_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Runner used when a work item's agent names none.
    #[serde(default)]
    pub default_runner: Option<String>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_runner: None,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    pub max_concurrency: usize,
    #[serde(default = "default_lane_priority")]
    pub default_priority: i32,
}

fn default_lane_priority() -> i32 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct LanesConfig {
    #[serde(default = "default_main_lane")]
    pub main: LaneConfig,
    #[serde(default = "default_subagent_lane")]
    pub subagent: LaneConfig,
    #[serde(default = "default_cron_lane")]
    pub cron: LaneConfig,
    #[serde(default = "default_session_lane")]
    pub session: LaneConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            main: default_main_lane(),
            subagent: default_subagent_lane(),
            cron: default_cron_lane(),
            session: default_session_lane(),
        }
    }
}

fn default_main_lane() -> LaneConfig {
    LaneConfig {
        max_concurrency: 4,
        default_priority: 50,
    }
}

fn default_subagent_lane() -> LaneConfig {
    LaneConfig {
        max_concurrency: 4,
        default_priority: 40,
    }
}

fn default_cron_lane() -> LaneConfig {
    LaneConfig {
        max_concurrency: 2,
        default_priority: 30,
    }
}

fn default_session_lane() -> LaneConfig {
    LaneConfig {
        max_concurrency: 2,
        default_priority: 70,
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    /// Default primary/fallback pair used when no per-call override is given.
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
    /// Models currently usable. Empty means every configured model is.
    #[serde(default)]
    pub available: Vec<String>,
    #[serde(default)]
    pub tiers: TierModelsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TierModelsConfig {
    #[serde(default)]
    pub simple: TierModels,
    #[serde(default)]
    pub medium: TierModels,
    #[serde(default)]
    pub complex: TierModels,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TierModels {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    /// Fraction of a ceiling at which `budget_warning` fires.
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_ratio: default_warning_ratio(),
        }
    }
}

fn default_warning_ratio() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            multiplier: default_retry_multiplier(),
        }
    }
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

/// One `[[agents]]` entry.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: ScheduleConfig,
    /// IANA timezone for cron-style schedules.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub policy: AgentPolicy,
    #[serde(default)]
    pub runner: Option<String>,
}

fn default_agent_type() -> String {
    "agent".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Either a shortcut string (`"every 5m"`, `"weekdays at 9am"`, raw cron) or
/// an explicit `{ kind = "interval", every_ms = 60000 }` table.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum ScheduleConfig {
    Text(String),
    Spec(ScheduleSpec),
}

impl ScheduleConfig {
    pub fn resolve(&self, timezone: &str) -> Result<ScheduleSpec, ScheduleError> {
        match self {
            ScheduleConfig::Text(text) => parse_schedule(text, timezone),
            ScheduleConfig::Spec(spec) => {
                spec.compile()?;
                Ok(spec.clone())
            }
        }
    }
}

/// A `[runners.<name>]` entry executed as a child process.
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_runner_timeout_secs() -> u64 {
    600
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        for warning in config.validate()? {
            tracing::warn!("config: {}", warning);
        }
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with. Returns warnings for
    /// ones it can run with but probably shouldn't.
    pub fn validate(&self) -> anyhow::Result<Vec<String>> {
        let mut warnings = Vec::new();

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                anyhow::bail!("agent with empty id");
            }
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("duplicate agent id '{}'", agent.id);
            }
            agent
                .schedule
                .resolve(&agent.timezone)
                .map_err(|e| anyhow::anyhow!("agent '{}': {}", agent.id, e))?;
            if let Some(runner) = &agent.runner {
                if !self.runners.contains_key(runner) {
                    anyhow::bail!("agent '{}' references unknown runner '{}'", agent.id, runner);
                }
            }
        }

        if let Some(runner) = &self.execution.default_runner {
            if !self.runners.contains_key(runner) {
                anyhow::bail!("default_runner '{}' is not configured", runner);
            }
        }

        for (name, lane) in [
            ("main", &self.lanes.main),
            ("subagent", &self.lanes.subagent),
            ("cron", &self.lanes.cron),
            ("session", &self.lanes.session),
        ] {
            if lane.max_concurrency == 0 {
                anyhow::bail!("lane '{}' must allow at least one concurrent item", name);
            }
        }

        let s = &self.scheduler;
        if s.tick_interval_ms == 0 || s.tick_timeout_ms == 0 {
            anyhow::bail!("scheduler tick interval and timeout must be positive");
        }
        if s.claim_ttl_ms <= 0 || s.max_claims_per_tick <= 0 {
            anyhow::bail!("scheduler claim_ttl_ms and max_claims_per_tick must be positive");
        }
        if s.backoff_base_ms <= 0 || s.backoff_max_ms < s.backoff_base_ms {
            anyhow::bail!("scheduler backoff must satisfy 0 < backoff_base_ms <= backoff_max_ms");
        }
        if (s.claim_ttl_ms as u64) < s.submit_timeout_ms.saturating_mul(2) {
            warnings.push(format!(
                "claim_ttl_ms ({}) is less than twice submit_timeout_ms ({}); a slow submit may \
                 outlive its claim",
                s.claim_ttl_ms, s.submit_timeout_ms
            ));
        }

        if !(0.0..=1.0).contains(&self.budget.warning_ratio) {
            anyhow::bail!("budget.warning_ratio must be between 0 and 1");
        }
        if self.retry.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be at least 1.0");
        }

        if self.models.primary.is_empty()
            && self.models.tiers.simple.primary.is_empty()
            && self.models.tiers.medium.primary.is_empty()
            && self.models.tiers.complex.primary.is_empty()
        {
            warnings.push("no models configured; runs will be started with an empty model id".into());
        }

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.state.db_path, "ponybunny.db");
        assert_eq!(config.scheduler.claim_ttl_ms, 120_000);
        assert_eq!(config.lanes.cron.max_concurrency, 2);
        assert!((config.budget.warning_ratio - 0.8).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_agents_with_both_schedule_forms() {
        let config: AppConfig = toml::from_str(
            r#"
            [runners.shell]
            command = "sh"
            args = ["-c", "true"]

            [[agents]]
            id = "digest"
            schedule = "weekdays at 9am"
            timezone = "Europe/Paris"
            runner = "shell"

            [agents.policy]
            priority = 70
            budget_tokens = 20000

            [[agents]]
            id = "poller"
            schedule = { kind = "interval", every_ms = 60000 }
            "#,
        )
        .unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].policy.priority, Some(70));
        assert_eq!(
            config.agents[1].schedule.resolve("UTC").unwrap(),
            ScheduleSpec::interval(60_000).unwrap()
        );
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("no models configured")));
    }

    #[test]
    fn rejects_invalid_agent_setups() {
        let dup: AppConfig = toml::from_str(
            r#"
            [[agents]]
            id = "a"
            schedule = "hourly"
            [[agents]]
            id = "a"
            schedule = "daily"
            "#,
        )
        .unwrap();
        assert!(dup.validate().is_err());

        let bad_interval: AppConfig = toml::from_str(
            r#"
            [[agents]]
            id = "a"
            schedule = { kind = "interval", every_ms = 0 }
            "#,
        )
        .unwrap();
        let err = bad_interval.validate().unwrap_err().to_string();
        assert!(err.contains("interval must be positive"), "{err}");

        let bad_runner: AppConfig = toml::from_str(
            r#"
            [[agents]]
            id = "a"
            schedule = "hourly"
            runner = "missing"
            "#,
        )
        .unwrap();
        assert!(bad_runner.validate().is_err());
    }

    #[test]
    fn warns_on_short_claim_ttl() {
        let config: AppConfig = toml::from_str(
            r#"
            [scheduler]
            claim_ttl_ms = 10000
            submit_timeout_ms = 30000
            "#,
        )
        .unwrap();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("claim_ttl_ms")));
    }

    #[test]
    fn instance_id_prefers_configured_value() {
        let daemon = DaemonConfig {
            instance_id: Some("node-a".into()),
            ..Default::default()
        };
        assert_eq!(daemon.resolve_instance_id(), "node-a");
        let generated = DaemonConfig::default().resolve_instance_id();
        assert!(!generated.is_empty());
        assert_ne!(generated, DaemonConfig::default().resolve_instance_id());
    }
}

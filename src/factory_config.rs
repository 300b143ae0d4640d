//! Configuration for the factory, read from `.factory/factory.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! absent file is a valid configuration.
//!
//! ```toml
//! [server]
//! port = 3150
//! db_path = ".factory/factory.db"
//! dev = false
//!
//! [budget]
//! max_cost_usd = 25.0
//! max_agents = 4
//! max_runtime_sec = 1800
//!
//! [cost_model]
//! cost_per_workstream_usd = 1.5
//! runtime_per_wave_sec = 300
//!
//! [execution]
//! adapter = "local"
//! agent_cmd = "claude"
//! base_url = "http://127.0.0.1:8000"
//! # working_dir = "/path/to/checkout"
//!
//! [council]
//! gated_kinds = ["GITHUB_ISSUE", "GITHUB_PULL_REQUEST"]
//!
//! [stream]
//! keepalive_secs = 15
//! poll_interval_ms = 1000
//! max_streams = 256
//! max_connections_per_stream = 16
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::drafts::{CouncilPolicy, DraftKind};
use crate::router::{BudgetCeilings, CostModel};
use crate::streaming::StreamLimits;

pub const DEFAULT_CONFIG_PATH: &str = ".factory/factory.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub db_path: PathBuf,
    /// Bind 0.0.0.0 and allow any CORS origin.
    pub dev: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 3150,
            db_path: PathBuf::from(".factory/factory.db"),
            dev: false,
        }
    }
}

/// Default ceilings applied to execution requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_cost_usd: f64,
    pub max_agents: u32,
    pub max_runtime_sec: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        let ceilings = BudgetCeilings::default();
        Self {
            max_cost_usd: ceilings.max_cost_usd,
            max_agents: ceilings.max_agents,
            max_runtime_sec: ceilings.max_runtime_sec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Run workstreams as local agent processes.
    #[default]
    Local,
    /// Forward to a remote adapter host.
    Http,
}

impl FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "http" => Ok(Self::Http),
            _ => anyhow::bail!("Invalid adapter '{}'. Valid values: local, http", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub adapter: AdapterKind,
    pub agent_cmd: String,
    pub base_url: String,
    /// Directory agent processes start in; the server's own when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Local,
            agent_cmd: "claude".to_string(),
            base_url: "http://127.0.0.1:8000".to_string(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilSection {
    pub gated_kinds: Vec<String>,
}

impl Default for CouncilSection {
    fn default() -> Self {
        Self {
            gated_kinds: vec![
                DraftKind::GithubIssue.as_str().to_string(),
                DraftKind::GithubPullRequest.as_str().to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub keepalive_secs: u64,
    pub poll_interval_ms: u64,
    pub max_streams: usize,
    pub max_connections_per_stream: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            keepalive_secs: 15,
            poll_interval_ms: 1000,
            max_streams: 256,
            max_connections_per_stream: 16,
        }
    }
}

/// The full `factory.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactoryToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub cost_model: CostModel,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub council: CouncilSection,
    #[serde(default)]
    pub stream: StreamSection,
    /// Environment only (`GITHUB_TOKEN`); never written to the file.
    #[serde(skip)]
    pub github_token: Option<String>,
}

/// Outcome of [`FactoryToml::validate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl FactoryToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse factory.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File (or defaults) with process environment overrides applied.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize factory.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize factory.toml")
    }

    /// Apply `FACTORY_*` and `GITHUB_TOKEN` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FACTORY_MAX_COST_USD") {
            self.budget.max_cost_usd = parse_env("FACTORY_MAX_COST_USD", &v)?;
        }
        if let Some(v) = get("FACTORY_MAX_AGENTS") {
            self.budget.max_agents = parse_env("FACTORY_MAX_AGENTS", &v)?;
        }
        if let Some(v) = get("FACTORY_MAX_RUNTIME_SEC") {
            self.budget.max_runtime_sec = parse_env("FACTORY_MAX_RUNTIME_SEC", &v)?;
        }
        if let Some(v) = get("FACTORY_AGENT_CMD") {
            self.execution.agent_cmd = v;
        }
        if let Some(v) = get("FACTORY_EXECUTION_URL") {
            self.execution.base_url = v;
            self.execution.adapter = AdapterKind::Http;
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.github_token = Some(v);
        }
        Ok(())
    }

    pub fn ceilings(&self) -> BudgetCeilings {
        BudgetCeilings {
            max_cost_usd: self.budget.max_cost_usd,
            max_agents: self.budget.max_agents,
            max_runtime_sec: self.budget.max_runtime_sec,
        }
    }

    /// Council policy from `gated_kinds`; unknown kinds are skipped
    /// (and reported by [`validate`](Self::validate)).
    pub fn council_policy(&self) -> CouncilPolicy {
        CouncilPolicy::new(
            self.council
                .gated_kinds
                .iter()
                .filter_map(|k| DraftKind::from_str(k).ok()),
        )
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            keepalive: Duration::from_secs(self.stream.keepalive_secs),
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            max_streams: self.stream.max_streams,
            max_connections_per_stream: self.stream.max_connections_per_stream,
        }
    }

    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if !(self.budget.max_cost_usd.is_finite() && self.budget.max_cost_usd > 0.0) {
            report
                .errors
                .push("budget.max_cost_usd must be a positive number".to_string());
        }
        if self.budget.max_agents == 0 {
            report.errors.push("budget.max_agents must be at least 1".to_string());
        }
        if self.budget.max_runtime_sec == 0 {
            report
                .errors
                .push("budget.max_runtime_sec must be at least 1".to_string());
        }
        if self.cost_model.cost_per_workstream_usd < 0.0 {
            report
                .errors
                .push("cost_model.cost_per_workstream_usd must not be negative".to_string());
        }
        if self.stream.keepalive_secs == 0 {
            report.errors.push("stream.keepalive_secs must be at least 1".to_string());
        }
        if self.stream.poll_interval_ms == 0 {
            report
                .errors
                .push("stream.poll_interval_ms must be at least 1".to_string());
        }
        if self.stream.max_streams == 0 || self.stream.max_connections_per_stream == 0 {
            report
                .errors
                .push("stream limits must allow at least one connection".to_string());
        }

        if self.execution.agent_cmd.trim().is_empty() {
            report.errors.push("execution.agent_cmd must not be empty".to_string());
        }
        if self.execution.adapter == AdapterKind::Http
            && !(self.execution.base_url.starts_with("http://")
                || self.execution.base_url.starts_with("https://"))
        {
            report.errors.push(format!(
                "execution.base_url '{}' must start with http:// or https://",
                self.execution.base_url
            ));
        }
        if let Some(dir) = &self.execution.working_dir
            && self.execution.adapter == AdapterKind::Local
            && !dir.is_dir()
        {
            report.errors.push(format!(
                "execution.working_dir '{}' is not a directory",
                dir.display()
            ));
        }

        for kind in &self.council.gated_kinds {
            if DraftKind::from_str(kind).is_err() {
                report
                    .warnings
                    .push(format!("Unknown draft kind '{}' in council.gated_kinds", kind));
            }
        }
        if self.council.gated_kinds.is_empty() {
            report
                .warnings
                .push("council.gated_kinds is empty; no draft requires a Council decision".to_string());
        }
        if let Some(token) = &self.github_token
            && !crate::drafts::is_valid_github_token(token)
        {
            report
                .warnings
                .push("GITHUB_TOKEN does not look like a GitHub token".to_string());
        }

        report
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, value, e))
}

/// Write a default `factory.toml`. Refuses to overwrite unless `force`.
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    FactoryToml::default().save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FactoryToml::default();
        assert_eq!(config.server.port, 3150);
        assert_eq!(config.ceilings(), BudgetCeilings::default());
        assert_eq!(config.execution.adapter, AdapterKind::Local);
        assert!(config.council_policy().requires_council(DraftKind::GithubIssue));
        assert!(!config.council_policy().requires_council(DraftKind::WorkOrder));
        assert_eq!(config.stream_limits(), StreamLimits::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config = FactoryToml::parse(
            r#"
[budget]
max_cost_usd = 10.0

[cost_model]
runtime_per_wave_sec = 60

[execution]
adapter = "http"
base_url = "http://adapter:8000"
"#,
        )
        .unwrap();
        assert!((config.budget.max_cost_usd - 10.0).abs() < 1e-9);
        assert_eq!(config.budget.max_agents, 4);
        assert_eq!(config.cost_model.runtime_per_wave_sec, 60);
        assert!((config.cost_model.cost_per_workstream_usd - 1.5).abs() < 1e-9);
        assert_eq!(config.execution.adapter, AdapterKind::Http);
        assert_eq!(config.execution.agent_cmd, "claude");
        assert!(config.execution.working_dir.is_none());
    }

    #[test]
    fn test_execution_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FactoryToml::parse(&format!(
            "[execution]\nworking_dir = {:?}\n",
            dir.path().display().to_string()
        ))
        .unwrap();
        assert_eq!(config.execution.working_dir.as_deref(), Some(dir.path()));
        assert!(config.validate().is_ok());

        config.execution.working_dir = Some(dir.path().join("missing"));
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("execution.working_dir")));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = FactoryToml::default();
        config
            .apply_env(env(&[
                ("FACTORY_MAX_COST_USD", "5.5"),
                ("FACTORY_MAX_AGENTS", "2"),
                ("FACTORY_AGENT_CMD", "my-agent --fast"),
                ("FACTORY_EXECUTION_URL", "http://remote:9000"),
                ("GITHUB_TOKEN", "ghp_secret"),
            ]))
            .unwrap();
        assert!((config.budget.max_cost_usd - 5.5).abs() < 1e-9);
        assert_eq!(config.budget.max_agents, 2);
        assert_eq!(config.budget.max_runtime_sec, 1800);
        assert_eq!(config.execution.agent_cmd, "my-agent --fast");
        assert_eq!(config.execution.adapter, AdapterKind::Http);
        assert_eq!(config.github_token.as_deref(), Some("ghp_secret"));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = FactoryToml::default();
        let err = config
            .apply_env(env(&[("FACTORY_MAX_AGENTS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("FACTORY_MAX_AGENTS"));
    }

    #[test]
    fn test_validate_reports_errors_and_warnings() {
        let mut config = FactoryToml::default();
        config.budget.max_cost_usd = 0.0;
        config.budget.max_agents = 0;
        config.council.gated_kinds.push("SLACK_POST".into());
        let report = config.validate();
        assert_eq!(report.errors.len(), 2);
        assert!(!report.is_ok());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("SLACK_POST"));
    }

    #[test]
    fn test_token_never_serialized() {
        let mut config = FactoryToml::default();
        config.github_token = Some("ghp_secret".into());
        let text = config.to_toml_string().unwrap();
        assert!(!text.contains("ghp_secret"));
        assert!(text.contains("[budget]"));
    }

    #[test]
    fn test_init_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".factory").join("factory.toml");
        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let loaded = FactoryToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 3150);
        assert_eq!(loaded.council.gated_kinds.len(), 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = FactoryToml::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.port, 3150);
    }

    #[test]
    fn test_adapter_kind_parse() {
        assert_eq!("HTTP".parse::<AdapterKind>().unwrap(), AdapterKind::Http);
        assert!("grpc".parse::<AdapterKind>().is_err());
    }
}

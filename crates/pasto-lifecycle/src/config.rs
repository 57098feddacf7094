use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pasto_core::TransitionPolicy;
use pasto_notify::DEFAULT_FANOUT_CAP;
use serde::Deserialize;

/// Engine tunables. Layered as defaults, then an optional YAML file, then
/// `PASTO_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub fanout_cap: usize,
    pub list_limit: usize,
    pub status_order: TransitionPolicy,
    pub reject_repeat_ratings: bool,
    pub push_webhook_url: Option<String>,
    pub push_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fanout_cap: DEFAULT_FANOUT_CAP,
            list_limit: 100,
            status_order: TransitionPolicy::Strict,
            reject_repeat_ratings: true,
            push_webhook_url: None,
            push_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing engine config yaml")
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load using the process environment: `PASTO_CONFIG` names the YAML
    /// file, other `PASTO_*` variables override individual fields.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("PASTO_CONFIG").ok().map(PathBuf::from);
        Self::load(path.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn load(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("PASTO_FANOUT_CAP") {
            self.fanout_cap = v
                .parse()
                .with_context(|| format!("PASTO_FANOUT_CAP={v} is not a count"))?;
        }
        if let Some(v) = env("PASTO_LIST_LIMIT") {
            self.list_limit = v
                .parse()
                .with_context(|| format!("PASTO_LIST_LIMIT={v} is not a count"))?;
        }
        if let Some(v) = env("PASTO_STATUS_ORDER") {
            self.status_order = v.parse().context("PASTO_STATUS_ORDER")?;
        }
        if let Some(v) = env("PASTO_REJECT_REPEAT_RATINGS") {
            self.reject_repeat_ratings = parse_flag(&v)
                .with_context(|| format!("PASTO_REJECT_REPEAT_RATINGS={v} is not a boolean"))?;
        }
        if let Some(v) = env("PASTO_PUSH_WEBHOOK_URL") {
            self.push_webhook_url = (!v.trim().is_empty()).then_some(v);
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

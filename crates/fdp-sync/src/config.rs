use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fdp_core::FilingType;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::quality::CheckSpec;

/// Process-level settings, read from `FDP_*` environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub database_url: String,
    pub worker_concurrency: usize,
    pub worker_batch_size: usize,
    pub visibility_timeout: Duration,
    pub max_receives: u32,
    pub drain_poll_interval: Duration,
    pub drain_timeout: Duration,
    pub run_timeout: Duration,
    pub lookback_years: i32,
    pub sub_batch_size: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub alert_webhook_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl PipelineConfig {
    /// Defaults for a workspace rooted at `root`, with state under `root/state`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        let state_dir = workspace_root.join("state");
        Self {
            database_url: format!("sqlite:{}", state_dir.join("checkpoints.db").display()),
            workspace_root,
            state_dir,
            worker_concurrency: 10,
            worker_batch_size: 10,
            visibility_timeout: Duration::from_secs(300),
            max_receives: 5,
            drain_poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(3_600),
            run_timeout: Duration::from_secs(6 * 3_600),
            lookback_years: 1,
            sub_batch_size: 50,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            alert_webhook_url: None,
            user_agent: "fdp-bot/0.1".to_string(),
            http_timeout_secs: 20,
            web_port: 8000,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("FDP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(workspace_root);
        let state_dir = std::env::var("FDP_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.state_dir.clone());
        Self {
            database_url: std::env::var("FDP_DATABASE_URL")
                .unwrap_or_else(|_| format!("sqlite:{}", state_dir.join("checkpoints.db").display())),
            state_dir,
            worker_concurrency: env_parse("FDP_WORKER_CONCURRENCY", defaults.worker_concurrency),
            worker_batch_size: env_parse("FDP_WORKER_BATCH_SIZE", defaults.worker_batch_size),
            visibility_timeout: Duration::from_secs(env_parse(
                "FDP_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )),
            max_receives: env_parse("FDP_MAX_RECEIVES", defaults.max_receives),
            drain_poll_interval: Duration::from_millis(env_parse(
                "FDP_DRAIN_POLL_MS",
                defaults.drain_poll_interval.as_millis() as u64,
            )),
            drain_timeout: Duration::from_secs(env_parse("FDP_DRAIN_TIMEOUT_SECS", defaults.drain_timeout.as_secs())),
            run_timeout: Duration::from_secs(env_parse("FDP_RUN_TIMEOUT_SECS", defaults.run_timeout.as_secs())),
            lookback_years: env_parse("FDP_LOOKBACK_YEARS", defaults.lookback_years),
            sub_batch_size: env_parse("FDP_SUB_BATCH_SIZE", defaults.sub_batch_size),
            scheduler_enabled: env_flag("FDP_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("FDP_SYNC_CRON").unwrap_or(defaults.sync_cron.clone()),
            alert_webhook_url: std::env::var("FDP_ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("FDP_USER_AGENT").unwrap_or(defaults.user_agent.clone()),
            http_timeout_secs: env_parse("FDP_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            web_port: env_parse("FDP_WEB_PORT", defaults.web_port),
            ..defaults
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("raw")
    }

    pub fn tiers_dir(&self) -> PathBuf {
        self.state_dir.join("tiers")
    }

    pub fn queue_state_path(&self) -> PathBuf {
        self.state_dir.join("queue.json")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.state_dir.join("executions")
    }

    pub fn published_dir(&self) -> PathBuf {
        self.state_dir.join("published")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// sha256 of the fixture index file.
    #[default]
    Fixture,
    /// HEAD request against `url`.
    HttpHead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub inter_request_delay_ms: u64,
    #[serde(default = "default_max_items")]
    pub max_items_per_invocation: usize,
}

fn default_max_items() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            inter_request_delay_ms: 0,
            max_items_per_invocation: default_max_items(),
        }
    }
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A failing critical source fails the whole phase.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub year: Option<i32>,
    /// Filing type for listed items that do not name one.
    #[serde(default)]
    pub filing_type: Option<FilingType>,
    #[serde(default)]
    pub probe: ProbeKind,
    /// Fixture directory (holding `index.json`), relative to the workspace root.
    #[serde(default)]
    pub fixture_dir: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl SourceConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: None,
            enabled: true,
            critical: false,
            year: None,
            filing_type: None,
            probe: ProbeKind::Fixture,
            fixture_dir: None,
            url: None,
            rate_limit: RateLimitConfig::default(),
        }
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.key)
    }

    /// Fixture directory, defaulting to `fixtures/<key>`.
    pub fn fixture_path(&self, workspace_root: &Path) -> PathBuf {
        match &self.fixture_dir {
            Some(dir) => workspace_root.join(dir),
            None => workspace_root.join("fixtures").join(&self.key),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.key.as_str()) {
                anyhow::bail!("duplicate source key {}", source.key);
            }
        }
        Ok(registry)
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }

    pub fn get(&self, key: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| source.key == key)
    }
}

/// `quality.yaml`: check sets keyed by tier name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default)]
    pub tiers: BTreeMap<String, Vec<CheckSpec>>,
}

impl QualityConfig {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing quality checks")
    }

    /// A missing file yields an empty config.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("quality.yaml");
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            tracing::warn!(path = %path.display(), "no quality checks configured");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn checks_for(&self, tier: &str) -> &[CheckSpec] {
        self.tiers.get(tier).map(Vec::as_slice).unwrap_or(&[])
    }
}

//! Pipeline orchestration: update detection, checkpointed ingestion, the
//! durable work queue and its worker pool, quality gating, promotion and
//! publishing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fdp_adapters::{
    ExtractorRegistry, FanoutNotifier, FixtureProbe, FixtureSourceLister, HttpHeadProbe, Notifier, RemoteProbe,
    TracingNotifier, WebhookNotifier,
};
use fdp_core::{Execution, RunTrigger};
use fdp_storage::{ArtifactStore, CheckpointStore, HttpClientConfig, HttpFetcher, SqliteCheckpointStore, TierStore};
use tokio::fs;

pub mod config;
pub mod detector;
pub mod execution;
pub mod fetcher;
pub mod orchestrator;
pub mod promote;
pub mod publish;
pub mod quality;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use config::{PipelineConfig, ProbeKind, QualityConfig, RateLimitConfig, SourceConfig, SourceRegistry};
pub use detector::{UpdateDecision, UpdateDetector, UpdateReason};
pub use execution::{ExecutionLog, ExecutionLogError};
pub use fetcher::{CheckpointedFetcher, FetchLimits, FetchOutcome, FetchStatus, WorkSink};
pub use orchestrator::{Components, Orchestrator, OrchestratorSettings, PhasePolicy, PipelineSource};
pub use promote::{Promoter, UpsertPromoter};
pub use publish::{PublishManifest, Publisher};
pub use quality::{run_checks, CheckKind, CheckSpec, TierSnapshot};
pub use queue::{QueueConfig, QueueError, QueueStats, WorkQueue};
pub use scheduler::maybe_build_scheduler;
pub use worker::{Extraction, WorkerPool, WorkerPoolConfig, WorkerTotals};

pub const CRATE_NAME: &str = "fdp-sync";

fn source_probe(source: &SourceConfig, config: &PipelineConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn RemoteProbe>> {
    Ok(match source.probe {
        ProbeKind::Fixture => Arc::new(FixtureProbe::new(
            source.fixture_path(&config.workspace_root).join("index.json"),
        )),
        ProbeKind::HttpHead => {
            let Some(url) = &source.url else {
                bail!("source {} uses an http_head probe but has no url", source.key);
            };
            Arc::new(HttpHeadProbe::new(http.clone(), url.clone()))
        }
    })
}

/// Wires every component from `config` and the workspace's `sources.yaml`
/// and `quality.yaml`.
pub async fn build_orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    for dir in [config.state_dir.clone(), config.executions_dir(), config.published_dir()] {
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(
        SqliteCheckpointStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening checkpoint store {}", config.database_url))?,
    );
    let queue = WorkQueue::open(
        QueueConfig {
            visibility_timeout: config.visibility_timeout,
            max_receives: config.max_receives,
            state_path: Some(config.queue_state_path()),
            ..QueueConfig::default()
        },
        checkpoints.clone(),
    )
    .await
    .context("opening work queue")?;
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);

    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let mut sources = Vec::new();
    for source in registry.enabled() {
        let lister = FixtureSourceLister::new(source.fixture_path(&config.workspace_root))
            .with_default_filing_type(source.filing_type.unwrap_or_default());
        let probe = source_probe(source, config, &http)?;
        tracing::info!(source_key = %source.key, name = source.display_name(), probe = ?source.probe, "source registered");
        sources.push(PipelineSource {
            config: source.clone(),
            lister: Arc::new(lister),
            probe,
        });
    }
    let quality = QualityConfig::load(&config.workspace_root).await?;

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
    if let Some(url) = &config.alert_webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(http.client().clone(), url.clone())));
    }

    let tiers = Arc::new(TierStore::new(config.tiers_dir()));
    let components = Components {
        checkpoints,
        artifacts: Arc::new(ArtifactStore::new(config.artifacts_dir())),
        tiers: tiers.clone(),
        queue: Arc::new(queue),
        extractors: Arc::new(ExtractorRegistry::standard()),
        promoter: Arc::new(UpsertPromoter::new(tiers)),
        notifier: Arc::new(FanoutNotifier::new(notifiers)),
        log: Arc::new(ExecutionLog::new(config.executions_dir())),
        publisher: Publisher::new(config.published_dir()),
    };
    tracing::info!(sources = sources.len(), state_dir = %config.state_dir.display(), "pipeline wired");
    Ok(Orchestrator::new(
        components,
        sources,
        quality,
        OrchestratorSettings::from_config(config),
    ))
}

pub async fn run_once_from_env(trigger: RunTrigger) -> Result<Execution> {
    let config = PipelineConfig::from_env();
    let orchestrator = build_orchestrator(&config).await?;
    orchestrator.run(trigger).await
}

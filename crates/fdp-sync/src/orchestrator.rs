//! Phase orchestrator.
//!
//! ```text
//! CheckUpdates ─┬─> NoUpdatesFound
//!               └─> Ingest -> Extract -> AwaitQueueDrain -> QualityGate ─┬─> Promote -> Publish
//!                                                                       └─> Abort
//! ```
//!
//! Update checks and ingestion fan out one branch per source. Every phase
//! runs under a [`PhasePolicy`]; whatever escapes it is recorded on the
//! execution, alerted, and ends the run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fdp_adapters::{ExtractorRegistry, Notifier, RemoteProbe, SourceLister};
use fdp_core::{
    Execution, ExecutionOutcome, PhaseName, PhaseStatus, RunScope, RunTrigger, SourceCheckpoint, Verdict,
};
use fdp_storage::{ArtifactStore, CheckpointStore, Classify, RetryDisposition, RetryPolicy, TierStore};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::config::{PipelineConfig, QualityConfig, SourceConfig};
use crate::detector::{UpdateDecision, UpdateDetector};
use crate::execution::ExecutionLog;
use crate::fetcher::{CheckpointedFetcher, FetchLimits, FetchOutcome, FetchStatus};
use crate::promote::Promoter;
use crate::publish::Publisher;
use crate::quality::{run_checks, TierSnapshot};
use crate::queue::WorkQueue;
use crate::worker::{Extraction, PoolHandle, WorkerPool, WorkerPoolConfig, WorkerTotals};

#[derive(Debug, Clone, Copy)]
pub struct PhasePolicy {
    pub retry: RetryPolicy,
    /// Hard limit per attempt, unless the phase carries its own.
    pub attempt_timeout: Duration,
}

impl Default for PhasePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: Duration::from_millis(250),
            },
            attempt_timeout: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: PhaseName, after: Duration },
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl Classify for PhaseError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            PhaseError::Transient(_) => RetryDisposition::Retryable,
            PhaseError::Timeout { .. } | PhaseError::Fatal(_) => RetryDisposition::NonRetryable,
        }
    }
}

fn transient(err: impl std::fmt::Display) -> PhaseError {
    PhaseError::Transient(format!("{err:#}"))
}

/// A registered source together with its collaborators.
#[derive(Clone)]
pub struct PipelineSource {
    pub config: SourceConfig,
    pub lister: Arc<dyn SourceLister>,
    pub probe: Arc<dyn RemoteProbe>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub normalized_tier: String,
    pub aggregated_tier: String,
    pub lookback_years: i32,
    /// Overrides the wall-clock year used by the lookback window.
    pub current_year: Option<i32>,
    pub sub_batch_size: usize,
    /// Shared by update probes and source listing.
    pub source_retry: RetryPolicy,
    pub worker: WorkerPoolConfig,
    pub drain_poll_interval: Duration,
    pub drain_timeout: Duration,
    pub run_timeout: Duration,
    pub phase_policy: PhasePolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            normalized_tier: "normalized".into(),
            aggregated_tier: "aggregated".into(),
            lookback_years: 1,
            current_year: None,
            sub_batch_size: 50,
            source_retry: RetryPolicy::default(),
            worker: WorkerPoolConfig::default(),
            drain_poll_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(3_600),
            run_timeout: Duration::from_secs(6 * 3_600),
            phase_policy: PhasePolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            lookback_years: config.lookback_years,
            sub_batch_size: config.sub_batch_size,
            worker: WorkerPoolConfig {
                concurrency: config.worker_concurrency,
                batch_size: config.worker_batch_size,
                ..WorkerPoolConfig::default()
            },
            drain_poll_interval: config.drain_poll_interval,
            drain_timeout: config.drain_timeout,
            run_timeout: config.run_timeout,
            ..Self::default()
        }
    }
}

/// Shared services the orchestrator drives.
pub struct Components {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub tiers: Arc<TierStore>,
    pub queue: Arc<WorkQueue>,
    pub extractors: Arc<ExtractorRegistry>,
    pub promoter: Arc<dyn Promoter>,
    pub notifier: Arc<dyn Notifier>,
    pub log: Arc<ExecutionLog>,
    pub publisher: Publisher,
}

/// Why a run stopped before publishing.
#[derive(Debug)]
struct Halt {
    outcome: ExecutionOutcome,
    phase: PhaseName,
    message: String,
    alerted: bool,
}

impl Halt {
    fn failed(phase: PhaseName, message: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed,
            phase,
            message: message.into(),
            alerted: false,
        }
    }
}

struct RunState {
    cancel: CancellationToken,
    pool: Option<PoolHandle>,
    current_phase: PhaseName,
    ingested: Vec<String>,
}

struct BranchResult<T> {
    source_key: String,
    result: Result<T, String>,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    sources: Vec<PipelineSource>,
    quality: QualityConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    tiers: Arc<TierStore>,
    queue: Arc<WorkQueue>,
    detector: Arc<UpdateDetector>,
    fetcher: Arc<CheckpointedFetcher>,
    pool: WorkerPool,
    promoter: Arc<dyn Promoter>,
    notifier: Arc<dyn Notifier>,
    log: Arc<ExecutionLog>,
    publisher: Publisher,
    run_lock: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        components: Components,
        sources: Vec<PipelineSource>,
        quality: QualityConfig,
        settings: OrchestratorSettings,
    ) -> Self {
        let mut detector = UpdateDetector::new(
            components.checkpoints.clone(),
            settings.source_retry,
            settings.lookback_years,
        );
        if let Some(year) = settings.current_year {
            detector = detector.with_current_year(year);
        }
        let fetcher = CheckpointedFetcher::new(
            components.checkpoints.clone(),
            components.artifacts.clone(),
            components.queue.clone(),
            settings.sub_batch_size,
            settings.source_retry,
        );
        let extraction = Arc::new(Extraction {
            queue: components.queue.clone(),
            checkpoints: components.checkpoints.clone(),
            artifacts: components.artifacts,
            tiers: components.tiers.clone(),
            extractors: components.extractors,
            tier: settings.normalized_tier.clone(),
        });
        Self {
            pool: WorkerPool::new(extraction, settings.worker),
            settings,
            sources,
            quality,
            checkpoints: components.checkpoints,
            tiers: components.tiers,
            queue: components.queue,
            detector: Arc::new(detector),
            fetcher: Arc::new(fetcher),
            promoter: components.promoter,
            notifier: components.notifier,
            log: components.log,
            publisher: components.publisher,
            run_lock: Mutex::new(()),
        }
    }

    pub fn sources(&self) -> &[PipelineSource] {
        &self.sources
    }

    pub fn log(&self) -> &Arc<ExecutionLog> {
        &self.log
    }

    /// Runs one execution to a terminal state. Runs never overlap; a second
    /// trigger waits for the first to finish. Only execution-log I/O
    /// failures surface as `Err`.
    pub async fn run(&self, trigger: RunTrigger) -> anyhow::Result<Execution> {
        let _running = self.run_lock.lock().await;
        let mut execution = Execution::start(trigger);
        let span = info_span!("pipeline_run", execution_id = %execution.execution_id, mode = ?execution.mode);
        async {
            self.log.save(&execution).await?;
            tracing::info!("run started");

            let mut state = RunState {
                cancel: CancellationToken::new(),
                pool: None,
                current_phase: PhaseName::CheckUpdates,
                ingested: Vec::new(),
            };
            let run_timeout = self.settings.run_timeout;
            let finished = tokio::time::timeout(run_timeout, self.drive(&mut execution, &mut state)).await;
            let result = match finished {
                Ok(result) => result,
                Err(_) => Err(Halt::failed(
                    state.current_phase,
                    format!("run timed out after {run_timeout:?}"),
                )),
            };

            state.cancel.cancel();
            if let Some(pool) = state.pool.take() {
                let totals = pool.shutdown().await;
                apply_totals(&mut execution, totals);
            }

            match result {
                Ok(outcome) => {
                    skip_pending(&mut execution);
                    execution.succeed(outcome);
                    tracing::info!(outcome = ?outcome, counters = ?execution.counters, "run succeeded");
                }
                Err(halt) => {
                    execution.set_phase(halt.phase, PhaseStatus::Failed);
                    skip_pending(&mut execution);
                    execution.fail(halt.outcome, halt.phase, halt.message.clone());
                    tracing::error!(phase = %halt.phase, error = %halt.message, outcome = ?halt.outcome, "run failed");
                    if !halt.alerted {
                        self.notifier.alert(
                            "pipeline run failed",
                            json!({
                                "execution_id": execution.execution_id,
                                "phase": halt.phase,
                                "message": halt.message,
                            }),
                        );
                    }
                }
            }
            self.log.save(&execution).await?;
            Ok::<_, anyhow::Error>(execution)
        }
        .instrument(span)
        .await
    }

    async fn save_progress(&self, execution: &Execution) {
        if let Err(err) = self.log.save(execution).await {
            tracing::warn!(error = %err, "could not persist execution progress");
        }
    }

    async fn run_phase<T, F, Fut>(
        &self,
        execution: &mut Execution,
        state: &mut RunState,
        phase: PhaseName,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PhaseError>>,
    {
        state.current_phase = phase;
        let policy = self.settings.phase_policy;
        let attempts = policy.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            execution.set_phase(phase, PhaseStatus::Running);
            self.save_progress(execution).await;
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(PhaseError::Timeout { phase, after: timeout }),
            };
            match result {
                Ok(value) => {
                    execution.set_phase(phase, PhaseStatus::Succeeded);
                    self.save_progress(execution).await;
                    return Ok(value);
                }
                Err(err) if err.disposition() == RetryDisposition::Retryable && attempt + 1 < attempts => {
                    let delay = policy.retry.jittered_delay(attempt);
                    tracing::warn!(%phase, attempt, ?delay, error = %err, "phase failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(Halt::failed(phase, err.to_string())),
            }
        }
    }

    fn selected_sources(&self, execution: &mut Execution) -> Vec<PipelineSource> {
        let unknown: Vec<String> = execution
            .trigger
            .sources
            .iter()
            .filter(|(key, wanted)| **wanted && !self.sources.iter().any(|s| &s.config.key == *key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in unknown {
            tracing::warn!(source_key = %key, "trigger names an unknown source");
            execution.source_mut(&key).error = Some("unknown source".into());
        }
        self.sources
            .iter()
            .filter(|s| s.config.enabled && execution.trigger.selects(&s.config.key))
            .cloned()
            .collect()
    }

    async fn drive(&self, execution: &mut Execution, state: &mut RunState) -> Result<ExecutionOutcome, Halt> {
        let scope = execution.trigger.scope.clone();
        let targets = self.selected_sources(execution);

        // CheckUpdates
        let timeout = self.settings.phase_policy.attempt_timeout;
        let decisions = self
            .run_phase(execution, state, PhaseName::CheckUpdates, timeout, || {
                self.check_updates(&targets, &scope)
            })
            .await?;
        let mut to_ingest = Vec::new();
        for branch in decisions {
            let report = execution.source_mut(&branch.source_key);
            match branch.result {
                Ok(decision) => {
                    report.update_reason = Some(decision.reason.as_str().to_string());
                    report.has_update = decision.has_update;
                    if decision.has_update {
                        if let Some(source) = targets.iter().find(|s| s.config.key == branch.source_key) {
                            to_ingest.push((source.clone(), decision));
                        }
                    }
                }
                Err(message) => report.error = Some(message),
            }
        }
        let fetched = if to_ingest.is_empty() {
            let leftover = self
                .queue
                .depth()
                .await
                .map_err(|err| Halt::failed(PhaseName::CheckUpdates, err.to_string()))?;
            if leftover == 0 {
                tracing::info!("no source has new data");
                return Ok(ExecutionOutcome::NoUpdatesFound);
            }
            tracing::info!(leftover, "no source has new data; draining leftover work");
            execution.set_phase(PhaseName::Ingest, PhaseStatus::Skipped);
            Vec::new()
        } else {
            // Ingest
            let full_refresh = scope.full_refresh;
            self.run_phase(execution, state, PhaseName::Ingest, timeout, || {
                self.ingest(&to_ingest, full_refresh)
            })
            .await?
        };
        for branch in fetched {
            let report = execution.source_mut(&branch.source_key);
            match branch.result {
                Ok(outcome) => {
                    report.fetch_status = Some(outcome.status.as_str().to_string());
                    report.items_fetched = outcome.items_fetched;
                    execution.counters.items_enqueued += outcome.items_enqueued;
                    state.ingested.push(branch.source_key);
                }
                Err(message) => report.error = Some(message),
            }
        }
        self.save_progress(execution).await;

        // Extract
        state.current_phase = PhaseName::Extract;
        execution.set_phase(PhaseName::Extract, PhaseStatus::Running);
        let pending = self
            .queue
            .depth()
            .await
            .map_err(|err| Halt::failed(PhaseName::Extract, err.to_string()))?;
        if state.pool.is_none() {
            state.pool = Some(self.pool.spawn(state.cancel.child_token()));
        }
        tracing::info!(pending, workers = self.settings.worker.concurrency, "extraction started");
        execution.set_phase(PhaseName::Extract, PhaseStatus::Succeeded);
        self.save_progress(execution).await;

        // AwaitQueueDrain
        let queue = &self.queue;
        let poll = self.settings.drain_poll_interval;
        self.run_phase(
            execution,
            state,
            PhaseName::AwaitQueueDrain,
            self.settings.drain_timeout,
            move || async move {
                loop {
                    let depth = queue.depth().await.map_err(transient)?;
                    if depth == 0 {
                        return Ok(());
                    }
                    tracing::debug!(depth, "waiting for queue to drain");
                    tokio::time::sleep(poll).await;
                }
            },
        )
        .await?;
        if let Some(pool) = state.pool.take() {
            let totals = pool.shutdown().await;
            apply_totals(execution, totals);
            if totals.dead_lettered > 0 {
                self.notifier.alert(
                    "work items dead-lettered",
                    json!({
                        "execution_id": execution.execution_id,
                        "count": totals.dead_lettered,
                    }),
                );
            }
        }

        // QualityGate
        if execution.trigger.skip_quality_gate {
            tracing::warn!("quality gate skipped by trigger");
            execution.set_phase(PhaseName::QualityGate, PhaseStatus::Skipped);
        } else {
            let tiers = &self.tiers;
            let tier = self.settings.normalized_tier.as_str();
            let checks = self.quality.checks_for(tier);
            let report = self
                .run_phase(execution, state, PhaseName::QualityGate, timeout, move || async move {
                    let rows = tiers.read(tier).await.map_err(transient)?;
                    Ok(run_checks(tier, checks, &TierSnapshot::from_rows(&rows)))
                })
                .await?;
            let verdict = report.verdict;
            let failed: Vec<String> = report.failed_checks().map(|c| c.id.clone()).collect();
            execution.quality_reports.push(report);
            match verdict {
                Verdict::Passed => {}
                Verdict::Warned => {
                    tracing::warn!(?failed, "quality gate warned");
                    self.notifier.alert(
                        "quality gate warned",
                        json!({ "execution_id": execution.execution_id, "tier": tier, "failed_checks": failed }),
                    );
                }
                Verdict::Failed => {
                    self.notifier.alert(
                        "quality gate failed",
                        json!({ "execution_id": execution.execution_id, "tier": tier, "failed_checks": failed }),
                    );
                    return Err(Halt {
                        outcome: ExecutionOutcome::Aborted,
                        phase: PhaseName::QualityGate,
                        message: format!("critical quality checks failed: {}", failed.join(", ")),
                        alerted: true,
                    });
                }
            }
        }

        // Promote
        let promoter = &self.promoter;
        let (from, to) = (
            self.settings.normalized_tier.as_str(),
            self.settings.aggregated_tier.as_str(),
        );
        let summary = self
            .run_phase(execution, state, PhaseName::Promote, timeout, move || async move {
                promoter.promote(from, to).await.map_err(transient)
            })
            .await?;
        execution.counters.rows_promoted = summary.inserted + summary.replaced;

        // Publish
        let execution_id = execution.execution_id;
        let ingested = state.ingested.clone();
        let manifest = self
            .run_phase(execution, state, PhaseName::Publish, timeout, || {
                self.publish(execution_id, &ingested)
            })
            .await?;
        execution.published_manifest = Some(manifest);
        Ok(ExecutionOutcome::Published)
    }

    async fn check_updates(
        &self,
        targets: &[PipelineSource],
        scope: &RunScope,
    ) -> Result<Vec<BranchResult<UpdateDecision>>, PhaseError> {
        let mut branches = JoinSet::new();
        for source in targets {
            let detector = self.detector.clone();
            let source = source.clone();
            let scope = scope.clone();
            let span = info_span!("check_updates", source_key = %source.config.key);
            branches.spawn(
                async move {
                    let result = detector
                        .check_for_update(&source.config, source.probe.as_ref(), &scope)
                        .await;
                    if let Ok(decision) = &result {
                        tracing::info!(reason = decision.reason.as_str(), has_update = decision.has_update, "update check");
                    }
                    (source.config.key, source.config.critical, result)
                }
                .instrument(span),
            );
        }

        let mut results = Vec::new();
        while let Some(joined) = branches.join_next().await {
            let (source_key, critical, result) =
                joined.map_err(|err| PhaseError::Fatal(format!("update check branch aborted: {err}")))?;
            let result = match result {
                Ok(decision) => Ok(decision),
                Err(err) if critical => {
                    return Err(PhaseError::Fatal(format!("critical source {source_key}: {err}")));
                }
                Err(err) => {
                    tracing::warn!(%source_key, error = %err, "update check failed");
                    Err(err.to_string())
                }
            };
            results.push(BranchResult { source_key, result });
        }
        results.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        Ok(results)
    }

    async fn ingest(
        &self,
        targets: &[(PipelineSource, UpdateDecision)],
        full_refresh: bool,
    ) -> Result<Vec<BranchResult<FetchOutcome>>, PhaseError> {
        let mut branches = JoinSet::new();
        for (source, decision) in targets {
            let checkpoints = self.checkpoints.clone();
            let fetcher = self.fetcher.clone();
            let detector = self.detector.clone();
            let source = source.clone();
            let fingerprint = decision.new_fingerprint.clone();
            let span = info_span!("ingest", source_key = %source.config.key);
            branches.spawn(
                async move {
                    let key = source.config.key.clone();
                    let result = ingest_source(
                        checkpoints.as_ref(),
                        &fetcher,
                        &detector,
                        &source,
                        fingerprint.as_deref(),
                        full_refresh,
                    )
                    .await;
                    (key, source.config.critical, result)
                }
                .instrument(span),
            );
        }

        let mut results = Vec::new();
        while let Some(joined) = branches.join_next().await {
            let (source_key, critical, result) =
                joined.map_err(|err| PhaseError::Fatal(format!("ingest branch aborted: {err}")))?;
            let result = match result {
                Ok(outcome) => Ok(outcome),
                Err(err) if critical => {
                    return Err(PhaseError::Fatal(format!("critical source {source_key}: {err:#}")));
                }
                Err(err) => {
                    tracing::warn!(%source_key, error = %format!("{err:#}"), "ingest failed");
                    Err(format!("{err:#}"))
                }
            };
            results.push(BranchResult { source_key, result });
        }
        results.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        Ok(results)
    }

    async fn publish(&self, execution_id: uuid::Uuid, ingested: &[String]) -> Result<String, PhaseError> {
        let rows = self
            .tiers
            .read(&self.settings.aggregated_tier)
            .await
            .map_err(transient)?;
        let (manifest_path, _) = self.publisher.publish(execution_id, &rows).await.map_err(transient)?;

        let now = Utc::now();
        for key in ingested {
            let current = self
                .checkpoints
                .get_checkpoint(key)
                .await
                .map_err(transient)?
                .unwrap_or_else(|| SourceCheckpoint::new(key.as_str()));
            self.checkpoints
                .put_checkpoint(&current.succeeded_at(now), false)
                .await
                .map_err(transient)?;
        }
        Ok(manifest_path.display().to_string())
    }
}

async fn ingest_source(
    checkpoints: &dyn CheckpointStore,
    fetcher: &CheckpointedFetcher,
    detector: &UpdateDetector,
    source: &PipelineSource,
    fingerprint: Option<&str>,
    full_refresh: bool,
) -> anyhow::Result<FetchOutcome> {
    let key = source.config.key.as_str();
    let stored = checkpoints
        .get_checkpoint(key)
        .await?
        .unwrap_or_else(|| SourceCheckpoint::new(key));
    let checkpoint = if full_refresh {
        SourceCheckpoint { cursor: None, ..stored }
    } else {
        stored
    };
    let limits = FetchLimits {
        max_items: source.config.rate_limit.max_items_per_invocation,
        inter_request_delay: Duration::from_millis(source.config.rate_limit.inter_request_delay_ms),
    };
    let outcome = fetcher
        .fetch_batch(key, source.lister.as_ref(), checkpoint, limits, full_refresh)
        .await?;
    // A fingerprint is only settled once the whole listing has been taken.
    if outcome.status == FetchStatus::Complete {
        if let Some(fingerprint) = fingerprint {
            detector.record_fingerprint(key, fingerprint).await?;
        }
    }
    Ok(outcome)
}

fn apply_totals(execution: &mut Execution, totals: WorkerTotals) {
    let counters = &mut execution.counters;
    counters.items_succeeded += totals.succeeded;
    counters.items_duplicate += totals.duplicate;
    counters.items_retried += totals.retried;
    counters.items_dead_lettered += totals.dead_lettered;
}

fn skip_pending(execution: &mut Execution) {
    for phase in PhaseName::ALL {
        if execution.phase_status(phase) == PhaseStatus::Pending {
            execution.set_phase(phase, PhaseStatus::Skipped);
        }
    }
}

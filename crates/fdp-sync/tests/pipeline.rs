use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fdp_adapters::{
    ExtractorRegistry, ProbeError, RecordingNotifier, RemoteProbe, StaticProbe, StaticSourceLister,
};
use fdp_core::{Cursor, ExecutionOutcome, ExecutionStatus, FilingType, PhaseName, PhaseStatus, RunTrigger, Verdict};
use fdp_storage::{ArtifactStore, CheckpointStore, MemoryCheckpointStore, RetryPolicy, TierStore, UpsertSummary};
use fdp_sync::{
    Components, ExecutionLog, Orchestrator, OrchestratorSettings, PhasePolicy, PipelineSource, Promoter,
    Publisher, QualityConfig, QueueConfig, SourceConfig, UpsertPromoter, WorkQueue, WorkerPoolConfig,
};
use tempfile::TempDir;

struct CountingPromoter {
    inner: UpsertPromoter,
    calls: AtomicUsize,
}

#[async_trait]
impl Promoter for CountingPromoter {
    async fn promote(&self, from_tier: &str, to_tier: &str) -> anyhow::Result<UpsertSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.promote(from_tier, to_tier).await
    }
}

struct BrokenProbe;

#[async_trait]
impl RemoteProbe for BrokenProbe {
    async fn fingerprint(&self, _source_key: &str) -> Result<Option<String>, ProbeError> {
        Err(ProbeError::Fatal("index unreachable".into()))
    }
}

struct Harness {
    _dir: TempDir,
    checkpoints: Arc<MemoryCheckpointStore>,
    tiers: Arc<TierStore>,
    queue: Arc<WorkQueue>,
    promoter: Arc<CountingPromoter>,
    notifier: Arc<RecordingNotifier>,
    log: Arc<ExecutionLog>,
    orchestrator: Orchestrator,
}

const ROW_COUNT_CRITICAL: &str = r#"
tiers:
  normalized:
    - id: has_rows
      check: row_count
      min: 1
"#;

fn source(key: &str, lister: Arc<StaticSourceLister>, probe: Arc<dyn RemoteProbe>) -> PipelineSource {
    PipelineSource {
        config: SourceConfig::new(key),
        lister,
        probe,
    }
}

fn harness(sources: Vec<PipelineSource>, quality: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let tiers = Arc::new(TierStore::new(dir.path().join("tiers")));
    let queue = Arc::new(WorkQueue::new(
        QueueConfig {
            redelivery: RetryPolicy::none(),
            ..QueueConfig::default()
        },
        checkpoints.clone(),
    ));
    let promoter = Arc::new(CountingPromoter {
        inner: UpsertPromoter::new(tiers.clone()),
        calls: AtomicUsize::new(0),
    });
    let notifier = Arc::new(RecordingNotifier::new());
    let log = Arc::new(ExecutionLog::new(dir.path().join("executions")));

    let settings = OrchestratorSettings {
        current_year: Some(2024),
        source_retry: RetryPolicy::none(),
        worker: WorkerPoolConfig {
            concurrency: 4,
            batch_size: 5,
            idle_poll: Duration::from_millis(20),
        },
        drain_poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(30),
        run_timeout: Duration::from_secs(60),
        phase_policy: PhasePolicy {
            retry: RetryPolicy::none(),
            attempt_timeout: Duration::from_secs(30),
        },
        ..OrchestratorSettings::default()
    };
    let components = Components {
        checkpoints: checkpoints.clone(),
        artifacts: Arc::new(ArtifactStore::new(dir.path().join("raw"))),
        tiers: tiers.clone(),
        queue: queue.clone(),
        extractors: Arc::new(ExtractorRegistry::standard()),
        promoter: promoter.clone(),
        notifier: notifier.clone(),
        log: log.clone(),
        publisher: Publisher::new(dir.path().join("published")),
    };
    let orchestrator = Orchestrator::new(components, sources, QualityConfig::parse(quality).unwrap(), settings);
    Harness {
        _dir: dir,
        checkpoints,
        tiers,
        queue,
        promoter,
        notifier,
        log,
        orchestrator,
    }
}

fn annual(prefix: &str, count: u64) -> Arc<StaticSourceLister> {
    Arc::new(StaticSourceLister::numbered(prefix, count, FilingType::Annual))
}

#[tokio::test]
async fn first_run_publishes_every_item() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(execution.counters.items_enqueued, 3);
    assert_eq!(execution.counters.items_succeeded, 3);
    assert_eq!(execution.counters.rows_promoted, 3);
    assert_eq!(h.checkpoints.marker_count().await.unwrap(), 3);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(execution.quality_reports.len(), 1);
    assert_eq!(execution.quality_reports[0].verdict, Verdict::Passed);
    assert!(execution.published_manifest.is_some());
    assert!(PhaseName::ALL
        .iter()
        .all(|phase| execution.phase_status(*phase) == PhaseStatus::Succeeded));

    let report = &execution.sources["annual"];
    assert_eq!(report.update_reason.as_deref(), Some("first_seen"));
    assert_eq!(report.fetch_status.as_deref(), Some("complete"));
    assert_eq!(report.items_fetched, 3);

    let stored = h.log.get(execution.execution_id).await.unwrap().unwrap();
    assert_eq!(stored, execution);
    let checkpoint = h.checkpoints.get_checkpoint("annual").await.unwrap().unwrap();
    assert_eq!(checkpoint.fingerprint.as_deref(), Some("v1"));
    assert!(checkpoint.last_success_at.is_some());
    assert!(h.notifier.alerts().is_empty());
}

#[tokio::test]
async fn unchanged_fingerprint_is_a_no_op() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );
    h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    let second = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(second.outcome, Some(ExecutionOutcome::NoUpdatesFound));
    assert_eq!(second.counters.items_enqueued, 0);
    assert_eq!(second.sources["annual"].update_reason.as_deref(), Some("unchanged"));
    assert_eq!(second.phase_status(PhaseName::CheckUpdates), PhaseStatus::Succeeded);
    assert_eq!(second.phase_status(PhaseName::Ingest), PhaseStatus::Skipped);
    assert_eq!(second.phase_status(PhaseName::Publish), PhaseStatus::Skipped);
    assert_eq!(h.promoter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unpublished_source_touches_nothing() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(None)))],
        ROW_COUNT_CRITICAL,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::NoUpdatesFound));
    assert_eq!(
        execution.sources["annual"].update_reason.as_deref(),
        Some("not_yet_available")
    );
    assert!(!h.tiers.path_for("normalized").exists());
    assert!(h.checkpoints.get_checkpoint("annual").await.unwrap().is_none());
}

#[tokio::test]
async fn leftover_queue_work_is_drained_without_updates() {
    let h = harness(
        vec![source("annual", annual("fd", 2), Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );
    h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    // Left behind by an interrupted run; its payload is gone.
    h.queue
        .enqueue(fdp_core::WorkMessage {
            item_id: "orphan".into(),
            source_key: "annual".into(),
            payload_ref: "annual/missing.html".into(),
            retry_count: 0,
            filing_type: FilingType::Annual,
        })
        .await
        .unwrap();

    let second = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(second.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(second.phase_status(PhaseName::Ingest), PhaseStatus::Skipped);
    assert_eq!(second.phase_status(PhaseName::AwaitQueueDrain), PhaseStatus::Succeeded);
    assert_eq!(second.counters.items_enqueued, 0);
    assert_eq!(second.counters.items_dead_lettered, 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.queue.dead_letters().await.len(), 1);
    assert_eq!(h.notifier.alerts()[0].subject, "work items dead-lettered");
}

#[tokio::test]
async fn rate_limited_source_resumes_on_next_run() {
    let lister = Arc::new(StaticSourceLister::numbered("ptr", 250, FilingType::Annual).rate_limit_after(100));
    let h = harness(
        vec![source("annual", lister, Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );

    let first = h.orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(first.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(first.sources["annual"].fetch_status.as_deref(), Some("rate_limited"));
    assert_eq!(first.sources["annual"].items_fetched, 100);
    let checkpoint = h.checkpoints.get_checkpoint("annual").await.unwrap().unwrap();
    assert_eq!(checkpoint.cursor, Some(Cursor::Seq(100)));
    assert_eq!(checkpoint.fingerprint, None);

    let second = h.orchestrator.run(RunTrigger::manual()).await.unwrap();
    assert_eq!(second.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(second.sources["annual"].fetch_status.as_deref(), Some("complete"));
    assert_eq!(second.sources["annual"].items_fetched, 150);
    assert_eq!(second.counters.items_enqueued, 150);
    assert_eq!(h.checkpoints.marker_count().await.unwrap(), 250);
    assert_eq!(h.tiers.read("aggregated").await.unwrap().len(), 250);
}

#[tokio::test]
async fn full_refresh_twice_leaves_tiers_byte_identical() {
    let h = harness(
        vec![source("annual", annual("fd", 5), Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );
    let refresh = RunTrigger {
        scope: fdp_core::RunScope {
            full_refresh: true,
            ..Default::default()
        },
        ..RunTrigger::manual()
    };

    let first = h.orchestrator.run(refresh.clone()).await.unwrap();
    let normalized = std::fs::read(h.tiers.path_for("normalized")).unwrap();
    let aggregated = std::fs::read(h.tiers.path_for("aggregated")).unwrap();
    let second = h.orchestrator.run(refresh).await.unwrap();

    assert_eq!(first.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(second.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(second.sources["annual"].update_reason.as_deref(), Some("forced_refresh"));
    assert_eq!(second.counters.items_enqueued, 0);
    assert_eq!(normalized, std::fs::read(h.tiers.path_for("normalized")).unwrap());
    assert_eq!(aggregated, std::fs::read(h.tiers.path_for("aggregated")).unwrap());
}

#[tokio::test]
async fn critical_quality_failure_aborts_before_promotion() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1"))))],
        r#"
tiers:
  normalized:
    - id: enough_rows
      check: row_count
      min: 10
"#,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.outcome, Some(ExecutionOutcome::Aborted));
    assert_eq!(execution.error.as_ref().unwrap().phase, PhaseName::QualityGate);
    assert_eq!(execution.quality_reports[0].verdict, Verdict::Failed);
    assert_eq!(execution.phase_status(PhaseName::QualityGate), PhaseStatus::Failed);
    assert_eq!(execution.phase_status(PhaseName::Promote), PhaseStatus::Skipped);
    assert_eq!(execution.phase_status(PhaseName::Publish), PhaseStatus::Skipped);
    assert_eq!(h.promoter.calls.load(Ordering::SeqCst), 0);
    assert!(!h.tiers.path_for("aggregated").exists());

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].subject, "quality gate failed");
}

#[tokio::test]
async fn warning_quality_check_alerts_once_and_publishes() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1"))))],
        r#"
tiers:
  normalized:
    - id: enough_rows
      check: row_count
      min: 10
      severity: warn
"#,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(execution.quality_reports[0].verdict, Verdict::Warned);
    assert_eq!(h.promoter.calls.load(Ordering::SeqCst), 1);
    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].subject, "quality gate warned");
}

#[tokio::test]
async fn skipped_quality_gate_still_promotes() {
    let h = harness(
        vec![source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1"))))],
        "tiers:\n  normalized:\n    - id: enough_rows\n      check: row_count\n      min: 10\n",
    );
    let trigger = RunTrigger {
        skip_quality_gate: true,
        ..RunTrigger::manual()
    };

    let execution = h.orchestrator.run(trigger).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::Published));
    assert_eq!(execution.phase_status(PhaseName::QualityGate), PhaseStatus::Skipped);
    assert!(execution.quality_reports.is_empty());
    assert_eq!(h.promoter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn critical_source_failure_fails_the_run() {
    let mut broken = source("annual", annual("fd", 3), Arc::new(BrokenProbe));
    broken.config = broken.config.critical();
    let h = harness(
        vec![
            broken,
            source("candidates", annual("cd", 2), Arc::new(StaticProbe::new(Some("v1")))),
        ],
        ROW_COUNT_CRITICAL,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::Failed));
    assert_eq!(execution.error.as_ref().unwrap().phase, PhaseName::CheckUpdates);
    assert_eq!(execution.phase_status(PhaseName::Ingest), PhaseStatus::Skipped);
    assert_eq!(h.notifier.alerts().len(), 1);
    assert_eq!(h.notifier.alerts()[0].subject, "pipeline run failed");
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn non_critical_source_failure_is_isolated() {
    let h = harness(
        vec![
            source("annual", annual("fd", 3), Arc::new(BrokenProbe)),
            source("candidates", annual("cd", 2), Arc::new(StaticProbe::new(Some("v1")))),
        ],
        ROW_COUNT_CRITICAL,
    );

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::Published));
    assert!(execution.sources["annual"].error.is_some());
    assert_eq!(execution.sources["candidates"].items_fetched, 2);
    assert_eq!(h.checkpoints.marker_count().await.unwrap(), 2);
}

#[tokio::test]
async fn trigger_selects_sources() {
    let h = harness(
        vec![
            source("annual", annual("fd", 3), Arc::new(StaticProbe::new(Some("v1")))),
            source("candidates", annual("cd", 2), Arc::new(StaticProbe::new(Some("v1")))),
        ],
        ROW_COUNT_CRITICAL,
    );

    let execution = h
        .orchestrator
        .run(RunTrigger::manual().with_source("candidates").with_source("senate"))
        .await
        .unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::Published));
    assert!(!execution.sources.contains_key("annual"));
    assert_eq!(execution.sources["candidates"].items_fetched, 2);
    assert_eq!(execution.sources["senate"].error.as_deref(), Some("unknown source"));
}

#[tokio::test]
async fn out_of_scope_year_is_skipped() {
    let mut old = source("filings-2019", annual("old", 2), Arc::new(StaticProbe::new(Some("v1"))));
    old.config = old.config.with_year(2019);
    let h = harness(vec![old], ROW_COUNT_CRITICAL);

    let execution = h.orchestrator.run(RunTrigger::manual()).await.unwrap();

    assert_eq!(execution.outcome, Some(ExecutionOutcome::NoUpdatesFound));
    assert_eq!(
        execution.sources["filings-2019"].update_reason.as_deref(),
        Some("out_of_scope")
    );
}

#[tokio::test]
async fn executions_are_listed_latest_first() {
    let h = harness(
        vec![source("annual", annual("fd", 1), Arc::new(StaticProbe::new(Some("v1"))))],
        ROW_COUNT_CRITICAL,
    );
    let first = h.orchestrator.run(RunTrigger::manual()).await.unwrap();
    let second = h.orchestrator.run(RunTrigger::scheduled()).await.unwrap();

    let listed = h.log.list(10).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].execution_id, second.execution_id);
    assert_eq!(listed[1].execution_id, first.execution_id);
    assert!(listed.iter().all(|e| e.is_terminal()));
}

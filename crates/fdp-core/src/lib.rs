//! Core domain model for the disclosure pipeline: checkpoints, work items,
//! processed markers, executions and quality reports.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdp-core";

/// Position of a source's ingestion progress. Serialized untagged so the
/// wire form is either a bare integer or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Seq(u64),
    Token(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cannot compare cursor {left} with {right}")]
    Incomparable { left: String, right: String },
}

impl Cursor {
    pub fn try_cmp(&self, other: &Cursor) -> Result<Ordering, CursorError> {
        match (self, other) {
            (Cursor::Seq(a), Cursor::Seq(b)) => Ok(a.cmp(b)),
            (Cursor::Token(a), Cursor::Token(b)) => Ok(a.cmp(b)),
            _ => Err(CursorError::Incomparable {
                left: self.to_string(),
                right: other.to_string(),
            }),
        }
    }

    pub fn as_seq(&self) -> Option<u64> {
        match self {
            Cursor::Seq(n) => Some(*n),
            Cursor::Token(_) => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Seq(n) => write!(f, "{n}"),
            Cursor::Token(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Idle,
    InProgress,
    RateLimited,
    Completed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::RateLimited => "rate_limited",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "in_progress" => Some(Self::InProgress),
            "rate_limited" => Some(Self::RateLimited),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Durable watermark for one ingestible source.
///
/// Checkpoints are superseded, never deleted. The cursor must not move
/// backwards unless the write is an explicit forced full refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub source_key: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub status: CheckpointStatus,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SourceCheckpoint {
    pub fn new(source_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            cursor: None,
            fingerprint: None,
            status: CheckpointStatus::Idle,
            last_success_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn advanced(&self, cursor: Option<Cursor>, status: CheckpointStatus) -> Self {
        Self {
            cursor: cursor.or_else(|| self.cursor.clone()),
            status,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_fingerprint(&self, fingerprint: Option<String>) -> Self {
        Self {
            fingerprint,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn succeeded_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_success_at: Some(at),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// True when writing `self` over `previous` would move the cursor backwards.
    pub fn regresses_from(&self, previous: &SourceCheckpoint) -> Result<bool, CursorError> {
        match (&previous.cursor, &self.cursor) {
            (None, _) => Ok(false),
            (Some(_), None) => Ok(true),
            (Some(old), Some(new)) => Ok(new.try_cmp(old)? == Ordering::Less),
        }
    }
}

/// Closed set of filing kinds; each maps to one extractor at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilingType {
    PeriodicTransaction,
    Annual,
    Amendment,
    Candidate,
    Extension,
    #[default]
    Other,
}

impl FilingType {
    pub const ALL: [FilingType; 6] = [
        FilingType::PeriodicTransaction,
        FilingType::Annual,
        FilingType::Amendment,
        FilingType::Candidate,
        FilingType::Extension,
        FilingType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeriodicTransaction => "periodic_transaction",
            Self::Annual => "annual",
            Self::Amendment => "amendment",
            Self::Candidate => "candidate",
            Self::Extension => "extension",
            Self::Other => "other",
        }
    }

    /// Maps the single-letter codes used by disclosure clerk indexes.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "P" => Self::PeriodicTransaction,
            "A" | "O" | "H" => Self::Annual,
            "D" | "G" => Self::Amendment,
            "C" => Self::Candidate,
            "X" | "E" => Self::Extension,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for FilingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue wire message. Visibility timeout and dead-letter threshold are
/// queue configuration, not part of the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub item_id: String,
    pub source_key: String,
    pub payload_ref: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub filing_type: FilingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Queued,
    InFlight,
    Succeeded,
    RetryScheduled,
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub message: WorkMessage,
    pub state: WorkItemState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkItem {
    pub fn queued(message: WorkMessage) -> Self {
        Self {
            message,
            state: WorkItemState::Queued,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.message.item_id
    }
}

/// Authoritative per-item idempotence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub item_id: String,
    pub processed: bool,
    pub method: String,
    pub output_pointer: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Scheduled,
    #[default]
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunScope {
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub full_refresh: bool,
}

/// Run trigger input accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunTrigger {
    #[serde(default)]
    pub mode: TriggerMode,
    #[serde(default)]
    pub sources: BTreeMap<String, bool>,
    #[serde(default)]
    pub scope: RunScope,
    #[serde(default)]
    pub skip_quality_gate: bool,
}

impl RunTrigger {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn scheduled() -> Self {
        Self {
            mode: TriggerMode::Scheduled,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source_key: impl Into<String>) -> Self {
        self.sources.insert(source_key.into(), true);
        self
    }

    /// Empty selection means every enabled source.
    pub fn selects(&self, source_key: &str) -> bool {
        if self.sources.values().all(|enabled| !enabled) {
            return true;
        }
        self.sources.get(source_key).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    CheckUpdates,
    Ingest,
    Extract,
    AwaitQueueDrain,
    QualityGate,
    Promote,
    Publish,
}

impl PhaseName {
    pub const ALL: [PhaseName; 7] = [
        PhaseName::CheckUpdates,
        PhaseName::Ingest,
        PhaseName::Extract,
        PhaseName::AwaitQueueDrain,
        PhaseName::QualityGate,
        PhaseName::Promote,
        PhaseName::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckUpdates => "check_updates",
            Self::Ingest => "ingest",
            Self::Extract => "extract",
            Self::AwaitQueueDrain => "await_queue_drain",
            Self::QualityGate => "quality_gate",
            Self::Promote => "promote",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: PhaseName,
    pub status: PhaseStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    NoUpdatesFound,
    Published,
    Aborted,
    Failed,
}

/// Cause recorded on a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub phase: PhaseName,
    pub message: String,
}

/// What happened to one source during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceReport {
    #[serde(default)]
    pub update_reason: Option<String>,
    #[serde(default)]
    pub has_update: bool,
    #[serde(default)]
    pub fetch_status: Option<String>,
    #[serde(default)]
    pub items_fetched: usize,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionCounters {
    pub items_enqueued: usize,
    pub items_succeeded: usize,
    pub items_duplicate: usize,
    pub items_retried: usize,
    pub items_dead_lettered: usize,
    pub rows_promoted: usize,
}

/// One orchestrator run. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub mode: TriggerMode,
    pub trigger: RunTrigger,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub outcome: Option<ExecutionOutcome>,
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceReport>,
    #[serde(default)]
    pub counters: ExecutionCounters,
    #[serde(default)]
    pub quality_reports: Vec<QualityReport>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub published_manifest: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn start(trigger: RunTrigger) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            mode: trigger.mode,
            trigger,
            status: ExecutionStatus::Running,
            outcome: None,
            phases: PhaseName::ALL
                .iter()
                .map(|phase| PhaseRecord {
                    phase: *phase,
                    status: PhaseStatus::Pending,
                    attempts: 0,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            sources: BTreeMap::new(),
            counters: ExecutionCounters::default(),
            quality_reports: Vec::new(),
            error: None,
            published_manifest: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Running
    }

    pub fn phase_status(&self, phase: PhaseName) -> PhaseStatus {
        self.phases
            .iter()
            .find(|record| record.phase == phase)
            .map(|record| record.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    pub fn set_phase(&mut self, phase: PhaseName, status: PhaseStatus) {
        let now = Utc::now();
        if let Some(record) = self.phases.iter_mut().find(|record| record.phase == phase) {
            match status {
                PhaseStatus::Running => {
                    record.attempts += 1;
                    record.started_at.get_or_insert(now);
                }
                PhaseStatus::Succeeded | PhaseStatus::Failed | PhaseStatus::Skipped => {
                    record.finished_at = Some(now);
                }
                PhaseStatus::Pending => {}
            }
            record.status = status;
        }
    }

    pub fn source_mut(&mut self, source_key: &str) -> &mut SourceReport {
        self.sources.entry(source_key.to_string()).or_default()
    }

    pub fn succeed(&mut self, outcome: ExecutionOutcome) {
        self.status = ExecutionStatus::Succeeded;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, outcome: ExecutionOutcome, phase: PhaseName, message: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.outcome = Some(outcome);
        self.error = Some(ExecutionError {
            phase,
            message: message.into(),
        });
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Warned,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub expected: String,
    pub actual: String,
    pub severity: Severity,
    pub passed: bool,
}

/// Result of one tier-transition check run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub tier: String,
    pub verdict: Verdict,
    pub checks: Vec<CheckResult>,
    pub created_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn new(tier: impl Into<String>, checks: Vec<CheckResult>) -> Self {
        let verdict = Verdict::from_results(&checks);
        Self {
            tier: tier.into(),
            verdict,
            checks,
            created_at: Utc::now(),
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

impl Verdict {
    pub fn from_results(results: &[CheckResult]) -> Self {
        let failed = results.iter().filter(|r| !r.passed);
        let mut verdict = Verdict::Passed;
        for result in failed {
            match result.severity {
                Severity::Critical => return Verdict::Failed,
                Severity::Warn => verdict = Verdict::Warned,
            }
        }
        verdict
    }
}

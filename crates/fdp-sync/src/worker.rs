//! Extraction worker pool.
//!
//! A fixed number of tokio tasks share one [`WorkQueue`]. Each delivery is
//! handled on its own: one item failing never affects its siblings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fdp_adapters::{ExtractError, ExtractRequest, ExtractorRegistry};
use fdp_core::ProcessedMarker;
use fdp_storage::{ArtifactStore, CheckpointStore, Classify, RetryDisposition, TierRow, TierStore};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::queue::{Lease, NackOutcome, QueueError, WorkQueue};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    /// Upper bound on how long an idle worker sleeps before polling again.
    pub idle_poll: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
            idle_poll: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded { rows: usize },
    /// Already marked processed; acked without extracting again.
    Duplicate,
    Retried { error: String },
    DeadLettered { error: String },
    Released,
    /// The lease expired under us; another delivery owns the item now.
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub item_id: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Retried { .. } | ItemOutcome::DeadLettered { .. }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerTotals {
    pub succeeded: usize,
    pub duplicate: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub released: usize,
    pub rows_written: usize,
}

impl WorkerTotals {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded { rows } => {
                self.succeeded += 1;
                self.rows_written += rows;
            }
            ItemOutcome::Duplicate | ItemOutcome::LeaseLost => self.duplicate += 1,
            ItemOutcome::Retried { .. } => self.retried += 1,
            ItemOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            ItemOutcome::Released => self.released += 1,
        }
    }

    pub fn merge(&mut self, other: WorkerTotals) {
        self.succeeded += other.succeeded;
        self.duplicate += other.duplicate;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.rows_written += other.rows_written;
    }
}

/// Everything a worker needs to turn one delivery into tier rows.
pub struct Extraction {
    pub queue: Arc<WorkQueue>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub tiers: Arc<TierStore>,
    pub extractors: Arc<ExtractorRegistry>,
    pub tier: String,
}

enum Failure {
    Extract(ExtractError),
    Storage(String),
}

impl Extraction {
    async fn nack(&self, lease: &Lease, failure: Failure) -> Result<ItemOutcome, QueueError> {
        let (error, disposition) = match failure {
            Failure::Extract(err) => (err.to_string(), err.disposition()),
            Failure::Storage(message) => (message, RetryDisposition::Retryable),
        };
        tracing::warn!(item_id = lease.item_id(), %error, retry_count = lease.message.retry_count, "extraction failed");
        Ok(match self.queue.nack(lease, &error, disposition).await? {
            NackOutcome::RetryScheduled { .. } => ItemOutcome::Retried { error },
            NackOutcome::DeadLettered { .. } => ItemOutcome::DeadLettered { error },
        })
    }

    async fn ack(&self, lease: &Lease, outcome: ItemOutcome) -> Result<ItemOutcome, QueueError> {
        match self.queue.ack(lease).await {
            Ok(()) => Ok(outcome),
            Err(QueueError::LeaseLost { .. }) => {
                tracing::info!(item_id = lease.item_id(), "lease lost before ack; item handled elsewhere");
                Ok(ItemOutcome::LeaseLost)
            }
            Err(err) => Err(err),
        }
    }

    /// Marker check, extract, upsert, marker write, ack; in that order.
    pub async fn process(&self, lease: &Lease) -> Result<ItemOutcome, QueueError> {
        let message = &lease.message;
        if self.checkpoints.is_processed(&message.item_id).await? {
            return self.ack(lease, ItemOutcome::Duplicate).await;
        }

        let bytes = match self.artifacts.read_bytes(&message.payload_ref).await {
            Ok(bytes) => bytes,
            Err(err) => return self.nack(lease, Failure::Storage(format!("{err:#}"))).await,
        };
        let extractor = match self.extractors.resolve(message.filing_type) {
            Ok(extractor) => extractor,
            Err(err) => return self.nack(lease, Failure::Extract(err)).await,
        };
        let request = ExtractRequest {
            item_id: &message.item_id,
            source_key: &message.source_key,
            payload_ref: &message.payload_ref,
            filing_type: message.filing_type,
            bytes: &bytes,
        };
        let document = match extractor.extract(&request).await {
            Ok(document) => document,
            Err(err) => return self.nack(lease, Failure::Extract(err)).await,
        };

        let rows: Vec<TierRow> = document
            .records
            .into_iter()
            .enumerate()
            .map(|(idx, fields)| TierRow {
                key: format!("{}#{idx}", message.item_id),
                item_id: message.item_id.clone(),
                source_key: message.source_key.clone(),
                fields,
            })
            .collect();
        let row_count = rows.len();
        if let Err(err) = self.tiers.upsert(&self.tier, rows).await {
            return self.nack(lease, Failure::Storage(format!("{err:#}"))).await;
        }

        let marker = ProcessedMarker {
            item_id: message.item_id.clone(),
            processed: true,
            method: extractor.name().to_string(),
            output_pointer: format!("{}:{}#0..{row_count}", self.tier, message.item_id),
            processed_at: Utc::now(),
        };
        if let Err(err) = self.checkpoints.put_marker(&marker).await {
            return self.nack(lease, Failure::Storage(err.to_string())).await;
        }
        self.ack(lease, ItemOutcome::Succeeded { rows: row_count }).await
    }

    /// Processes leases one after another and reports each outcome.
    pub async fn process_batch(&self, leases: Vec<Lease>) -> BatchReport {
        let mut report = BatchReport::default();
        for lease in leases {
            let outcome = match self.process(&lease).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(item_id = lease.item_id(), error = %err, "queue bookkeeping failed");
                    ItemOutcome::Retried { error: err.to_string() }
                }
            };
            report.items.push(ItemReport {
                item_id: lease.message.item_id.clone(),
                outcome,
            });
        }
        report
    }
}

pub struct WorkerPool {
    extraction: Arc<Extraction>,
    config: WorkerPoolConfig,
}

/// Running pool; dropping it without [`PoolHandle::shutdown`] aborts workers.
pub struct PoolHandle {
    cancel: CancellationToken,
    workers: JoinSet<WorkerTotals>,
}

impl PoolHandle {
    /// Cancels the workers, waits for them to release in-flight leases and
    /// returns their combined totals.
    pub async fn shutdown(mut self) -> WorkerTotals {
        self.cancel.cancel();
        let mut totals = WorkerTotals::default();
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(worker) => totals.merge(worker),
                Err(err) => tracing::error!(error = %err, "worker task failed"),
            }
        }
        totals
    }
}

impl WorkerPool {
    pub fn new(extraction: Arc<Extraction>, config: WorkerPoolConfig) -> Self {
        Self { extraction, config }
    }

    pub fn spawn(&self, cancel: CancellationToken) -> PoolHandle {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            let extraction = self.extraction.clone();
            let config = self.config;
            let cancel = cancel.clone();
            workers.spawn(
                run_worker(extraction, config, cancel).instrument(info_span!("extraction_worker", worker_id)),
            );
        }
        PoolHandle { cancel, workers }
    }
}

async fn run_worker(extraction: Arc<Extraction>, config: WorkerPoolConfig, cancel: CancellationToken) -> WorkerTotals {
    let mut totals = WorkerTotals::default();
    let queue = extraction.queue.clone();
    while !cancel.is_cancelled() {
        let leases = match queue.receive(config.batch_size.max(1)).await {
            Ok(leases) => leases,
            Err(err) => {
                tracing::warn!(error = %err, "receive failed");
                Vec::new()
            }
        };
        if leases.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.wait_for_work() => {}
                _ = tokio::time::sleep(config.idle_poll) => {}
            }
            continue;
        }

        for lease in leases {
            let outcome = if cancel.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = extraction.process(&lease) => Some(result),
                }
            };
            let outcome = match outcome {
                Some(Ok(outcome)) => outcome,
                Some(Err(err)) => {
                    tracing::error!(item_id = lease.item_id(), error = %err, "queue bookkeeping failed");
                    continue;
                }
                None => match queue.release(&lease).await {
                    Ok(()) => ItemOutcome::Released,
                    Err(err) => {
                        tracing::warn!(item_id = lease.item_id(), error = %err, "release failed");
                        continue;
                    }
                },
            };
            tracing::debug!(item_id = lease.item_id(), ?outcome, "item handled");
            totals.record(&outcome);
        }
    }
    totals
}

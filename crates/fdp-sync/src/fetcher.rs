//! Rate-limited, checkpointed ingestion of one source.
//!
//! Items are pulled one at a time from a [`SourceLister`], stored in the raw
//! tier and handed to a [`WorkSink`]. The checkpoint only moves after the
//! sub-batch it covers has been handed off, so an interruption never skips
//! work: the worst case is re-listing items that are then deduplicated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fdp_adapters::{ListError, ListedItem, SourceLister};
use fdp_core::{CheckpointStatus, Cursor, SourceCheckpoint, WorkMessage};
use fdp_storage::{ArtifactStore, CheckpointError, CheckpointStore, RetryPolicy};
use serde::Serialize;
use thiserror::Error;

use crate::queue::{EnqueueOutcome, QueueError, WorkQueue};

/// Destination for freshly ingested work.
#[async_trait]
pub trait WorkSink: Send + Sync {
    /// Returns how many of `messages` were newly accepted.
    async fn submit(&self, messages: Vec<WorkMessage>) -> Result<usize, QueueError>;
}

#[async_trait]
impl WorkSink for WorkQueue {
    async fn submit(&self, messages: Vec<WorkMessage>) -> Result<usize, QueueError> {
        let mut accepted = 0;
        for message in messages {
            if self.enqueue(message).await? == EnqueueOutcome::Queued {
                accepted += 1;
            }
        }
        Ok(accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Complete,
    Partial,
    RateLimited,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::RateLimited => "rate_limited",
        }
    }

    fn checkpoint_status(self) -> CheckpointStatus {
        match self {
            Self::Complete => CheckpointStatus::Completed,
            Self::Partial => CheckpointStatus::InProgress,
            Self::RateLimited => CheckpointStatus::RateLimited,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub items_fetched: usize,
    pub items_enqueued: usize,
    pub new_checkpoint: SourceCheckpoint,
    pub status: FetchStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub max_items: usize,
    pub inter_request_delay: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_items: 500,
            inter_request_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("listing {source_key} failed: {source}")]
    List { source_key: String, source: ListError },
    #[error("storing raw artifact for {item_id}: {message}")]
    Artifact { item_id: String, message: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct CheckpointedFetcher {
    checkpoints: Arc<dyn CheckpointStore>,
    artifacts: Arc<ArtifactStore>,
    sink: Arc<dyn WorkSink>,
    sub_batch_size: usize,
    retry: RetryPolicy,
}

struct Progress {
    checkpoint: SourceCheckpoint,
    pending: Vec<WorkMessage>,
    cursor: Option<Cursor>,
    fetched: usize,
    enqueued: usize,
    force: bool,
}

impl CheckpointedFetcher {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        artifacts: Arc<ArtifactStore>,
        sink: Arc<dyn WorkSink>,
        sub_batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            checkpoints,
            artifacts,
            sink,
            sub_batch_size: sub_batch_size.max(1),
            retry,
        }
    }

    /// Hands pending work to the sink, then persists the checkpoint.
    async fn flush(&self, progress: &mut Progress, status: CheckpointStatus) -> Result<(), FetcherError> {
        if !progress.pending.is_empty() {
            let batch = std::mem::take(&mut progress.pending);
            progress.enqueued += self.sink.submit(batch).await?;
        }
        let next = progress.checkpoint.advanced(progress.cursor.clone(), status);
        self.checkpoints.put_checkpoint(&next, progress.force).await?;
        progress.checkpoint = next;
        progress.force = false;
        Ok(())
    }

    async fn stage(&self, source_key: &str, item: ListedItem) -> Result<WorkMessage, FetcherError> {
        let stored = self
            .artifacts
            .store_bytes(source_key, &item.extension, &item.bytes)
            .await
            .map_err(|err| FetcherError::Artifact {
                item_id: item.item_id.clone(),
                message: format!("{err:#}"),
            })?;
        Ok(WorkMessage {
            item_id: item.item_id,
            source_key: source_key.to_string(),
            payload_ref: stored.payload_ref,
            retry_count: 0,
            filing_type: item.filing_type,
        })
    }

    /// Fetches up to `limits.max_items` items after `checkpoint`'s cursor.
    ///
    /// `force` allows the first checkpoint write to move the cursor backwards
    /// (a full refresh passes a checkpoint whose cursor was cleared).
    pub async fn fetch_batch(
        &self,
        source_key: &str,
        lister: &dyn SourceLister,
        checkpoint: SourceCheckpoint,
        limits: FetchLimits,
        force: bool,
    ) -> Result<FetchOutcome, FetcherError> {
        let mut progress = Progress {
            cursor: checkpoint.cursor.clone(),
            checkpoint,
            pending: Vec::new(),
            fetched: 0,
            enqueued: 0,
            force,
        };

        let status = loop {
            if progress.fetched >= limits.max_items {
                break FetchStatus::Partial;
            }
            if progress.fetched > 0 && !limits.inter_request_delay.is_zero() {
                tokio::time::sleep(limits.inter_request_delay).await;
            }

            let after = progress.cursor.as_ref();
            let next = self
                .retry
                .run(move |_attempt| async move { lister.fetch_next(source_key, after).await })
                .await;

            match next {
                Ok(Some(item)) => {
                    let cursor = item.cursor.clone();
                    let message = self.stage(source_key, item).await?;
                    progress.pending.push(message);
                    progress.cursor = Some(cursor);
                    progress.fetched += 1;
                    if progress.pending.len() >= self.sub_batch_size {
                        self.flush(&mut progress, CheckpointStatus::InProgress).await?;
                        tracing::debug!(source_key, fetched = progress.fetched, "sub-batch checkpointed");
                    }
                }
                Ok(None) => break FetchStatus::Complete,
                Err(ListError::RateLimited { retry_after }) => {
                    tracing::info!(source_key, fetched = progress.fetched, ?retry_after, "rate limited; stopping early");
                    break FetchStatus::RateLimited;
                }
                Err(err) => {
                    self.flush(&mut progress, CheckpointStatus::InProgress).await?;
                    return Err(FetcherError::List {
                        source_key: source_key.to_string(),
                        source: err,
                    });
                }
            }
        };

        self.flush(&mut progress, status.checkpoint_status()).await?;
        tracing::info!(
            source_key,
            status = status.as_str(),
            fetched = progress.fetched,
            enqueued = progress.enqueued,
            "fetch finished"
        );
        Ok(FetchOutcome {
            items_fetched: progress.fetched,
            items_enqueued: progress.enqueued,
            new_checkpoint: progress.checkpoint,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdp_adapters::StaticSourceLister;
    use fdp_core::FilingType;
    use fdp_storage::MemoryCheckpointStore;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl WorkSink for RecordingSink {
        async fn submit(&self, messages: Vec<WorkMessage>) -> Result<usize, QueueError> {
            let n = messages.len();
            self.batches
                .lock()
                .unwrap()
                .push(messages.into_iter().map(|m| m.item_id).collect());
            Ok(n)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryCheckpointStore>,
        sink: Arc<RecordingSink>,
        fetcher: CheckpointedFetcher,
    }

    fn fixture(sub_batch_size: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink::default());
        let fetcher = CheckpointedFetcher::new(
            store.clone(),
            Arc::new(ArtifactStore::new(dir.path())),
            sink.clone(),
            sub_batch_size,
            RetryPolicy::none(),
        );
        Fixture {
            _dir: dir,
            store,
            sink,
            fetcher,
        }
    }

    fn limits(max_items: usize) -> FetchLimits {
        FetchLimits {
            max_items,
            ..FetchLimits::default()
        }
    }

    #[tokio::test]
    async fn exhausting_the_source_completes() {
        let fx = fixture(2);
        let lister = StaticSourceLister::numbered("doc", 5, FilingType::Annual);
        let outcome = fx
            .fetcher
            .fetch_batch("filings", &lister, SourceCheckpoint::new("filings"), limits(100), false)
            .await
            .unwrap();

        assert_eq!(outcome.status, FetchStatus::Complete);
        assert_eq!(outcome.items_fetched, 5);
        assert_eq!(outcome.new_checkpoint.cursor, Some(Cursor::Seq(5)));
        let stored = fx.store.get_checkpoint("filings").await.unwrap().unwrap();
        assert_eq!(stored.status, CheckpointStatus::Completed);

        let batches = fx.sink.batches.lock().unwrap().clone();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn max_items_yields_partial_and_resumes() {
        let fx = fixture(10);
        let lister = StaticSourceLister::numbered("doc", 25, FilingType::Annual);
        let first = fx
            .fetcher
            .fetch_batch("filings", &lister, SourceCheckpoint::new("filings"), limits(10), false)
            .await
            .unwrap();
        assert_eq!(first.status, FetchStatus::Partial);
        assert_eq!(first.new_checkpoint.status, CheckpointStatus::InProgress);
        assert_eq!(first.new_checkpoint.cursor, Some(Cursor::Seq(10)));

        let second = fx
            .fetcher
            .fetch_batch("filings", &lister, first.new_checkpoint, limits(100), false)
            .await
            .unwrap();
        assert_eq!(second.status, FetchStatus::Complete);
        assert_eq!(second.items_fetched, 15);
        let ids: Vec<String> = fx.sink.batches.lock().unwrap().concat();
        assert_eq!(ids.len(), 25);
        assert_eq!(ids[10], "doc-11");
    }

    #[tokio::test]
    async fn rate_limit_flushes_pending_and_succeeds() {
        let fx = fixture(30);
        let lister = StaticSourceLister::numbered("doc", 250, FilingType::Annual).rate_limit_after(100);
        let outcome = fx
            .fetcher
            .fetch_batch("filings", &lister, SourceCheckpoint::new("filings"), limits(1_000), false)
            .await
            .unwrap();

        assert_eq!(outcome.status, FetchStatus::RateLimited);
        assert_eq!(outcome.items_fetched, 100);
        let stored = fx.store.get_checkpoint("filings").await.unwrap().unwrap();
        assert_eq!(stored.cursor, Some(Cursor::Seq(100)));
        assert_eq!(stored.status, CheckpointStatus::RateLimited);
        assert_eq!(fx.sink.batches.lock().unwrap().concat().len(), 100);
    }

    /// Yields sequences in the given order, each once.
    struct OrderedLister(Vec<u64>);

    #[async_trait]
    impl SourceLister for OrderedLister {
        async fn fetch_next(&self, _source_key: &str, after: Option<&Cursor>) -> Result<Option<ListedItem>, ListError> {
            let next = match after.and_then(Cursor::as_seq) {
                None => self.0.first(),
                Some(seq) => self.0.iter().skip_while(|s| **s != seq).nth(1),
            };
            Ok(next.map(|seq| ListedItem {
                item_id: format!("doc-{seq}"),
                cursor: Cursor::Seq(*seq),
                filing_type: FilingType::Annual,
                extension: "json".into(),
                bytes: b"{\"records\":[]}".to_vec(),
            }))
        }
    }

    #[tokio::test]
    async fn forced_rewind_only_applies_to_the_first_write() {
        let fx = fixture(1);
        fx.store
            .put_checkpoint(
                &SourceCheckpoint::new("filings").advanced(Some(Cursor::Seq(8)), CheckpointStatus::Completed),
                false,
            )
            .await
            .unwrap();

        let lister = OrderedLister(vec![2, 1]);
        let err = fx
            .fetcher
            .fetch_batch("filings", &lister, SourceCheckpoint::new("filings"), limits(100), true)
            .await
            .unwrap_err();

        assert!(matches!(err, FetcherError::Checkpoint(CheckpointError::Regression { .. })));
        let stored = fx.store.get_checkpoint("filings").await.unwrap().unwrap();
        assert_eq!(stored.cursor, Some(Cursor::Seq(2)));
    }

    #[tokio::test]
    async fn checkpoint_never_runs_ahead_of_handed_off_items() {
        let fx = fixture(4);
        let lister = StaticSourceLister::numbered("doc", 10, FilingType::Annual);
        fx.fetcher
            .fetch_batch("filings", &lister, SourceCheckpoint::new("filings"), limits(6), false)
            .await
            .unwrap();
        let stored = fx.store.get_checkpoint("filings").await.unwrap().unwrap();
        let handed_off = fx.sink.batches.lock().unwrap().concat().len() as u64;
        assert_eq!(stored.cursor.and_then(|c| c.as_seq()), Some(handed_off));
    }
}

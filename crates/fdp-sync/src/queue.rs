//! Durable at-least-once work queue.
//!
//! Messages are leased for `visibility_timeout`; a lease that is neither
//! acked, nacked nor released before its deadline expires and the message
//! becomes visible again with its retry count bumped. When a message reaches
//! `max_receives` deliveries it is moved to the dead-letter list.
//!
//! With a `state_path` configured every mutation rewrites the JSON state file
//! atomically. Reopening turns in-flight messages back into visible ones.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fdp_core::{WorkItem, WorkItemState, WorkMessage};
use fdp_storage::{write_atomic, CheckpointError, CheckpointStore, RetryDisposition, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receives: u32,
    /// Delay schedule between a nack and the next delivery.
    pub redelivery: RetryPolicy,
    pub state_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receives: 5,
            redelivery: RetryPolicy::default(),
            state_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("lease for {item_id} is no longer held")]
    LeaseLost { item_id: String },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("queue state {path}: {message}")]
    State { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyProcessed,
    AlreadyQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    RetryScheduled { retry_count: u32, delay: Duration },
    DeadLettered { retry_count: u32 },
}

/// Exclusive, time-bounded claim on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub message: WorkMessage,
    pub token: Uuid,
    pub deadline: DateTime<Utc>,
}

impl Lease {
    pub fn item_id(&self) -> &str {
        &self.message.item_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub visible: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    pub acked: u64,
}

impl QueueStats {
    pub fn depth(&self) -> usize {
        self.visible + self.delayed + self.in_flight
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    item: WorkItem,
    #[serde(default)]
    lease: Option<Uuid>,
    #[serde(default)]
    lease_deadline: Option<DateTime<Utc>>,
    visible_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    #[serde(default)]
    entries: Vec<Entry>,
    #[serde(default)]
    dead_letters: Vec<WorkItem>,
    #[serde(default)]
    acked: u64,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub struct WorkQueue {
    config: QueueConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("config", &self.config).finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// In-memory queue (no state file).
    pub fn new(config: QueueConfig, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            config,
            checkpoints,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Opens the queue, loading `state_path` when it exists.
    pub async fn open(config: QueueConfig, checkpoints: Arc<dyn CheckpointStore>) -> Result<Self, QueueError> {
        let mut state = QueueState::default();
        if let Some(path) = &config.state_path {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    state = serde_json::from_slice(&bytes).map_err(|err| QueueError::State {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    })?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(QueueError::State {
                        path: path.display().to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }

        let now = Utc::now();
        let mut recovered = 0usize;
        for entry in state.entries.iter_mut().filter(|e| e.lease.is_some()) {
            entry.lease = None;
            entry.lease_deadline = None;
            entry.item.state = WorkItemState::Queued;
            entry.visible_at = now;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "in-flight messages returned to the queue on open");
        }

        Ok(Self {
            config,
            checkpoints,
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        let Some(path) = &self.config.state_path else {
            return Ok(());
        };
        let state_err = |message: String| QueueError::State {
            path: path.display().to_string(),
            message,
        };
        let bytes = serde_json::to_vec(state).map_err(|err| state_err(err.to_string()))?;
        write_atomic(path, &bytes)
            .await
            .map_err(|err| state_err(format!("{err:#}")))
    }

    /// Writes `next` to the state file, then makes it the live state. A failed
    /// write leaves the live state as it was.
    async fn commit(&self, live: &mut QueueState, next: QueueState) -> Result<(), QueueError> {
        self.persist(&next).await?;
        *live = next;
        Ok(())
    }

    /// Returns expired leases to the queue; true when anything changed.
    fn reclaim_expired(&self, state: &mut QueueState, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        let mut idx = 0;
        while idx < state.entries.len() {
            let expired = matches!(state.entries[idx].lease_deadline, Some(deadline) if deadline <= now);
            if !expired {
                idx += 1;
                continue;
            }
            changed = true;
            let entry = &mut state.entries[idx];
            entry.lease = None;
            entry.lease_deadline = None;
            entry.item.message.retry_count += 1;
            entry.item.last_error = Some("visibility timeout expired".into());
            if entry.item.message.retry_count >= self.config.max_receives {
                let mut item = state.entries.remove(idx).item;
                tracing::warn!(item_id = %item.message.item_id, "lease expired at delivery ceiling; dead-lettered");
                item.state = WorkItemState::DeadLettered;
                state.dead_letters.push(item);
                continue;
            }
            entry.item.state = WorkItemState::Queued;
            entry.visible_at = now;
            tracing::debug!(item_id = %entry.item.message.item_id, "lease expired; message visible again");
            idx += 1;
        }
        changed
    }

    /// Adds a message unless it was already processed or is already queued.
    pub async fn enqueue(&self, message: WorkMessage) -> Result<EnqueueOutcome, QueueError> {
        if self.checkpoints.is_processed(&message.item_id).await? {
            return Ok(EnqueueOutcome::AlreadyProcessed);
        }
        let mut state = self.state.lock().await;
        if state
            .entries
            .iter()
            .any(|entry| entry.item.message.item_id == message.item_id)
        {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        let mut next = state.clone();
        next.dead_letters
            .retain(|item| item.message.item_id != message.item_id);
        next.entries.push(Entry {
            item: WorkItem::queued(message),
            lease: None,
            lease_deadline: None,
            visible_at: Utc::now(),
        });
        self.commit(&mut state, next).await?;
        drop(state);
        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Queued)
    }

    /// Leases up to `max` visible messages in enqueue order.
    pub async fn receive(&self, max: usize) -> Result<Vec<Lease>, QueueError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let now = Utc::now();
        let mut changed = self.reclaim_expired(&mut next, now);
        let deadline = now + chrono_duration(self.config.visibility_timeout);

        let mut leases = Vec::new();
        for entry in next.entries.iter_mut() {
            if leases.len() >= max {
                break;
            }
            if entry.lease.is_some() || entry.visible_at > now {
                continue;
            }
            let token = Uuid::new_v4();
            entry.lease = Some(token);
            entry.lease_deadline = Some(deadline);
            entry.item.state = WorkItemState::InFlight;
            leases.push(Lease {
                message: entry.item.message.clone(),
                token,
                deadline,
            });
            changed = true;
        }
        if changed {
            self.commit(&mut state, next).await?;
        }
        Ok(leases)
    }

    fn position(state: &QueueState, lease: &Lease) -> Result<usize, QueueError> {
        state
            .entries
            .iter()
            .position(|entry| entry.item.message.item_id == lease.message.item_id && entry.lease == Some(lease.token))
            .ok_or_else(|| QueueError::LeaseLost {
                item_id: lease.message.item_id.clone(),
            })
    }

    /// Removes a successfully processed message.
    pub async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let idx = Self::position(&state, lease)?;
        let mut next = state.clone();
        next.entries.remove(idx);
        next.acked += 1;
        self.commit(&mut state, next).await
    }

    /// Records a failed delivery. Retryable failures are redelivered after a
    /// backoff delay until the delivery ceiling; anything else is dead-lettered.
    pub async fn nack(
        &self,
        lease: &Lease,
        error: impl Display,
        disposition: RetryDisposition,
    ) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let idx = Self::position(&state, lease)?;
        let mut next = state.clone();
        let retry_count = {
            let entry = &mut next.entries[idx];
            entry.lease = None;
            entry.lease_deadline = None;
            entry.item.message.retry_count += 1;
            entry.item.last_error = Some(error.to_string());
            entry.item.message.retry_count
        };

        let outcome = if disposition == RetryDisposition::NonRetryable || retry_count >= self.config.max_receives {
            let mut item = next.entries.remove(idx).item;
            item.state = WorkItemState::DeadLettered;
            next.dead_letters.push(item);
            NackOutcome::DeadLettered { retry_count }
        } else {
            let delay = self.config.redelivery.jittered_delay(retry_count.saturating_sub(1));
            let entry = &mut next.entries[idx];
            entry.item.state = WorkItemState::RetryScheduled;
            entry.visible_at = Utc::now() + chrono_duration(delay);
            NackOutcome::RetryScheduled { retry_count, delay }
        };
        self.commit(&mut state, next).await?;
        Ok(outcome)
    }

    /// Gives a lease back without counting a delivery attempt.
    pub async fn release(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let idx = Self::position(&state, lease)?;
        let mut next = state.clone();
        let entry = &mut next.entries[idx];
        entry.lease = None;
        entry.lease_deadline = None;
        entry.item.state = WorkItemState::Queued;
        entry.visible_at = Utc::now();
        self.commit(&mut state, next).await?;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Visible + delayed + in-flight messages.
    pub async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.stats().await?.depth())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut next = state.clone();
        if self.reclaim_expired(&mut next, now) {
            self.commit(&mut state, next).await?;
        }
        let mut stats = QueueStats {
            dead_lettered: state.dead_letters.len(),
            acked: state.acked,
            ..QueueStats::default()
        };
        for entry in &state.entries {
            if entry.lease.is_some() {
                stats.in_flight += 1;
            } else if entry.visible_at > now {
                stats.delayed += 1;
            } else {
                stats.visible += 1;
            }
        }
        Ok(stats)
    }

    pub async fn dead_letters(&self) -> Vec<WorkItem> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Resolves on the next enqueue or release.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}

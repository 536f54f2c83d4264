//! Update detection: compares a remote fingerprint against the stored
//! checkpoint and applies the lookback window.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use fdp_adapters::{ProbeError, RemoteProbe};
use fdp_core::{RunScope, SourceCheckpoint};
use fdp_storage::{CheckpointError, CheckpointStore, RetryPolicy};
use serde::Serialize;
use thiserror::Error;

use crate::config::SourceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    FirstSeen,
    FingerprintChanged,
    Unchanged,
    NotYetAvailable,
    OutOfScope,
    ForcedRefresh,
}

impl UpdateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSeen => "first_seen",
            Self::FingerprintChanged => "fingerprint_changed",
            Self::Unchanged => "unchanged",
            Self::NotYetAvailable => "not_yet_available",
            Self::OutOfScope => "out_of_scope",
            Self::ForcedRefresh => "forced_refresh",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDecision {
    pub source_key: String,
    pub has_update: bool,
    pub new_fingerprint: Option<String>,
    pub reason: UpdateReason,
}

impl UpdateDecision {
    fn skip(source_key: &str, reason: UpdateReason) -> Self {
        Self {
            source_key: source_key.to_string(),
            has_update: false,
            new_fingerprint: None,
            reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Decides per source whether a run has anything to ingest.
pub struct UpdateDetector {
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryPolicy,
    lookback_years: i32,
    current_year: i32,
}

impl UpdateDetector {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, retry: RetryPolicy, lookback_years: i32) -> Self {
        Self {
            checkpoints,
            retry,
            lookback_years: lookback_years.max(0),
            current_year: Utc::now().year(),
        }
    }

    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = year;
        self
    }

    /// Sources without a year are always in scope.
    pub fn in_scope(&self, source: &SourceConfig, scope: &RunScope) -> bool {
        let Some(year) = source.year else {
            return true;
        };
        if scope.year.is_some_and(|wanted| wanted != year) {
            return false;
        }
        year >= self.current_year - self.lookback_years
    }

    pub async fn check_for_update(
        &self,
        source: &SourceConfig,
        probe: &dyn RemoteProbe,
        scope: &RunScope,
    ) -> Result<UpdateDecision, DetectError> {
        let key = source.key.as_str();
        if !self.in_scope(source, scope) {
            return Ok(UpdateDecision::skip(key, UpdateReason::OutOfScope));
        }

        let remote = self
            .retry
            .run(move |_attempt| async move { probe.fingerprint(key).await })
            .await?;
        let Some(remote) = remote else {
            tracing::info!(source_key = key, "remote resource not published yet");
            return Ok(UpdateDecision::skip(key, UpdateReason::NotYetAvailable));
        };

        let stored = self
            .checkpoints
            .get_checkpoint(key)
            .await?
            .and_then(|checkpoint| checkpoint.fingerprint);

        let (has_update, reason) = if scope.full_refresh {
            (true, UpdateReason::ForcedRefresh)
        } else {
            match stored {
                None => (true, UpdateReason::FirstSeen),
                Some(previous) if previous != remote => (true, UpdateReason::FingerprintChanged),
                Some(_) => (false, UpdateReason::Unchanged),
            }
        };
        Ok(UpdateDecision {
            source_key: key.to_string(),
            has_update,
            new_fingerprint: Some(remote),
            reason,
        })
    }

    /// Stores the fingerprint once the source's ingestion has completed.
    pub async fn record_fingerprint(&self, source_key: &str, fingerprint: &str) -> Result<(), CheckpointError> {
        let current = self
            .checkpoints
            .get_checkpoint(source_key)
            .await?
            .unwrap_or_else(|| SourceCheckpoint::new(source_key));
        self.checkpoints
            .put_checkpoint(&current.with_fingerprint(Some(fingerprint.to_string())), false)
            .await
    }
}

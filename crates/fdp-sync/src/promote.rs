use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fdp_storage::{TierStore, UpsertSummary};

/// Moves a tier's rows into the next tier.
#[async_trait]
pub trait Promoter: Send + Sync {
    async fn promote(&self, from_tier: &str, to_tier: &str) -> Result<UpsertSummary>;
}

/// Idempotent upsert of every row of `from_tier` into `to_tier`.
pub struct UpsertPromoter {
    tiers: Arc<TierStore>,
}

impl UpsertPromoter {
    pub fn new(tiers: Arc<TierStore>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl Promoter for UpsertPromoter {
    async fn promote(&self, from_tier: &str, to_tier: &str) -> Result<UpsertSummary> {
        let rows = self.tiers.read(from_tier).await?;
        let summary = self.tiers.upsert(to_tier, rows).await?;
        tracing::info!(from_tier, to_tier, inserted = summary.inserted, replaced = summary.replaced, "tier promoted");
        Ok(summary)
    }
}

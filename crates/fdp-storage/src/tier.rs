//! Normalized and aggregated tiers as JSON Lines files.
//!
//! Every write is read existing -> drop rows whose keys are in the batch ->
//! append batch -> atomically replace. Rows are kept sorted by key, so
//! applying the same batch twice leaves the file byte-identical.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::sync::Mutex;

use crate::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRow {
    pub key: String,
    pub item_id: String,
    pub source_key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl TierRow {
    /// Column lookup across the fixed columns and the free-form fields.
    pub fn column(&self, name: &str) -> Option<JsonValue> {
        match name {
            "key" => Some(JsonValue::String(self.key.clone())),
            "item_id" => Some(JsonValue::String(self.item_id.clone())),
            "source_key" => Some(JsonValue::String(self.source_key.clone())),
            other => self.fields.get(other).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
pub struct TierStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TierStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, tier: &str) -> PathBuf {
        self.root.join(format!("{tier}.jsonl"))
    }

    async fn lock_for(&self, tier: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(tier.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn read(&self, tier: &str) -> anyhow::Result<Vec<TierRow>> {
        let path = self.path_for(tier);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))
            })
            .collect()
    }

    /// Idempotent upsert keyed by [`TierRow::key`]. An empty batch performs
    /// no write at all.
    pub async fn upsert(&self, tier: &str, batch: Vec<TierRow>) -> anyhow::Result<UpsertSummary> {
        if batch.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let lock = self.lock_for(tier).await;
        let _guard = lock.lock().await;

        let existing = self.read(tier).await?;
        let incoming: BTreeMap<String, TierRow> = batch
            .into_iter()
            .map(|row| (row.key.clone(), row))
            .collect();
        let existing_keys: BTreeSet<&str> = existing.iter().map(|row| row.key.as_str()).collect();
        let replaced = incoming
            .keys()
            .filter(|key| existing_keys.contains(key.as_str()))
            .count();
        let inserted = incoming.len() - replaced;

        let mut merged: BTreeMap<String, TierRow> = existing
            .into_iter()
            .filter(|row| !incoming.contains_key(&row.key))
            .map(|row| (row.key.clone(), row))
            .collect();
        merged.extend(incoming);

        let mut out = Vec::new();
        for row in merged.values() {
            serde_json::to_writer(&mut out, row).context("serializing tier row")?;
            out.push(b'\n');
        }
        write_atomic(&self.path_for(tier), &out).await?;

        tracing::debug!(tier, inserted, replaced, total = merged.len(), "tier upsert");
        Ok(UpsertSummary {
            inserted,
            replaced,
            total: merged.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(key: &str, amount: i64) -> TierRow {
        TierRow {
            key: key.into(),
            item_id: key.split('#').next().unwrap_or(key).into(),
            source_key: "filings-2024".into(),
            fields: BTreeMap::from([("amount".to_string(), json!(amount))]),
        }
    }

    #[tokio::test]
    async fn upsert_twice_is_byte_identical() {
        let dir = tempdir().unwrap();
        let store = TierStore::new(dir.path());
        let batch = vec![row("a#0", 1), row("b#0", 2)];

        let first = store.upsert("normalized", batch.clone()).await.unwrap();
        let bytes_first = std::fs::read(store.path_for("normalized")).unwrap();
        let second = store.upsert("normalized", batch).await.unwrap();
        let bytes_second = std::fs::read(store.path_for("normalized")).unwrap();

        assert_eq!(first, UpsertSummary { inserted: 2, replaced: 0, total: 2 });
        assert_eq!(second, UpsertSummary { inserted: 0, replaced: 2, total: 2 });
        assert_eq!(bytes_first, bytes_second);
    }

    #[tokio::test]
    async fn upsert_replaces_matching_keys_only() {
        let dir = tempdir().unwrap();
        let store = TierStore::new(dir.path());
        store.upsert("normalized", vec![row("a#0", 1), row("b#0", 2)]).await.unwrap();
        store.upsert("normalized", vec![row("b#0", 20), row("c#0", 3)]).await.unwrap();

        let rows = store.read("normalized").await.unwrap();
        let amounts: Vec<_> = rows.iter().map(|r| (r.key.as_str(), r.fields["amount"].clone())).collect();
        assert_eq!(amounts, vec![("a#0", json!(1)), ("b#0", json!(20)), ("c#0", json!(3))]);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = TierStore::new(dir.path());
        store.upsert("aggregated", Vec::new()).await.unwrap();
        assert!(!store.path_for("aggregated").exists());
        assert!(store.read("aggregated").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_upserts_do_not_lose_rows() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TierStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert("normalized", vec![row(&format!("doc-{i}#0"), i)]).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.read("normalized").await.unwrap().len(), 16);
    }
}

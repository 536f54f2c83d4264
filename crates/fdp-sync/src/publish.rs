//! Parquet snapshot of the aggregated tier plus a checksummed manifest.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use fdp_storage::{write_atomic, TierRow};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub const SNAPSHOT_FILE: &str = "filings.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishManifest {
    pub schema_version: u32,
    pub execution_id: Uuid,
    pub rows: usize,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Publisher {
    root: PathBuf,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir_for(&self, execution_id: Uuid) -> PathBuf {
        self.root.join(execution_id.to_string())
    }

    /// Writes `<root>/<execution_id>/filings.parquet` and `manifest.json`;
    /// returns the manifest path.
    pub async fn publish(&self, execution_id: Uuid, rows: &[TierRow]) -> Result<(PathBuf, PublishManifest)> {
        let dir = self.dir_for(execution_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        write_parquet(&snapshot_path, rows_to_batch(rows)?)?;

        let manifest = PublishManifest {
            schema_version: 1,
            execution_id,
            rows: rows.len(),
            files: vec![manifest_entry("filings", &dir, &snapshot_path)?],
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing publish manifest")?;
        write_atomic(&manifest_path, &bytes).await?;
        tracing::info!(%execution_id, rows = rows.len(), manifest = %manifest_path.display(), "snapshot published");
        Ok((manifest_path, manifest))
    }
}

fn cell(value: Option<&JsonValue>) -> Option<String> {
    match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Fixed identity columns, then one nullable Utf8 column per field name.
fn rows_to_batch(rows: &[TierRow]) -> Result<RecordBatch> {
    let field_names: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.fields.keys().map(String::as_str))
        .filter(|name| !matches!(*name, "key" | "item_id" | "source_key"))
        .collect();

    let mut schema_fields = vec![
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("source_key", DataType::Utf8, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.key.as_str())).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.item_id.as_str())).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| Some(r.source_key.as_str())).collect::<Vec<_>>())),
    ];
    for name in field_names {
        schema_fields.push(ArrowField::new(name, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            rows.iter().map(|r| cell(r.fields.get(name))).collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(Arc::new(Schema::new(schema_fields)), columns).context("building snapshot record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

//! Declarative quality checks over a tier's external contract.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use fdp_core::{CheckResult, QualityReport, Severity};
use fdp_storage::TierRow;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

fn default_severity() -> Severity {
    Severity::Critical
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub id: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: CheckKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CheckKind {
    RowCount {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    NonNullRatio {
        field: String,
        min_ratio: f64,
    },
    Unique {
        field: String,
    },
    RequiredColumns {
        columns: Vec<String>,
    },
}

/// Column names plus rows; all a check may look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierSnapshot {
    pub columns: BTreeSet<String>,
    pub rows: Vec<BTreeMap<String, JsonValue>>,
}

impl TierSnapshot {
    pub fn from_rows(rows: &[TierRow]) -> Self {
        let mut columns: BTreeSet<String> = ["key", "item_id", "source_key"].into_iter().map(String::from).collect();
        let rows = rows
            .iter()
            .map(|row| {
                let mut flat = row.fields.clone();
                columns.extend(flat.keys().cloned());
                flat.insert("key".into(), JsonValue::String(row.key.clone()));
                flat.insert("item_id".into(), JsonValue::String(row.item_id.clone()));
                flat.insert("source_key".into(), JsonValue::String(row.source_key.clone()));
                flat
            })
            .collect();
        Self { columns, rows }
    }
}

fn present(value: Option<&JsonValue>) -> bool {
    !matches!(value, None | Some(JsonValue::Null))
}

fn evaluate(kind: &CheckKind, snapshot: &TierSnapshot) -> (String, String, bool) {
    match kind {
        CheckKind::RowCount { min, max } => {
            let count = snapshot.rows.len();
            let expected = format!(
                "{}..={}",
                min.map(|n| n.to_string()).unwrap_or_default(),
                max.map(|n| n.to_string()).unwrap_or_default()
            );
            let passed = min.map_or(true, |min| count >= min) && max.map_or(true, |max| count <= max);
            (expected, count.to_string(), passed)
        }
        CheckKind::NonNullRatio { field, min_ratio } => {
            let total = snapshot.rows.len();
            let non_null = snapshot.rows.iter().filter(|row| present(row.get(field))).count();
            let ratio = if total == 0 { 1.0 } else { non_null as f64 / total as f64 };
            (format!(">= {min_ratio:.3}"), format!("{ratio:.3}"), ratio >= *min_ratio)
        }
        CheckKind::Unique { field } => {
            let mut seen: HashMap<String, usize> = HashMap::new();
            for value in snapshot.rows.iter().filter_map(|row| row.get(field)) {
                if !matches!(value, JsonValue::Null) {
                    *seen.entry(value.to_string()).or_default() += 1;
                }
            }
            let duplicates: usize = seen.values().filter(|n| **n > 1).map(|n| n - 1).sum();
            ("0 duplicates".to_string(), format!("{duplicates} duplicates"), duplicates == 0)
        }
        CheckKind::RequiredColumns { columns } => {
            let missing: Vec<&str> = columns
                .iter()
                .filter(|c| !snapshot.columns.contains(c.as_str()))
                .map(String::as_str)
                .collect();
            let actual = if missing.is_empty() {
                "all present".to_string()
            } else {
                format!("missing: {}", missing.join(", "))
            };
            (columns.join(", "), actual, missing.is_empty())
        }
    }
}

pub fn run_checks(tier: &str, checks: &[CheckSpec], snapshot: &TierSnapshot) -> QualityReport {
    let results = checks
        .iter()
        .map(|check| {
            let (expected, actual, passed) = evaluate(&check.kind, snapshot);
            if !passed {
                tracing::warn!(tier, check = %check.id, %expected, %actual, severity = ?check.severity, "quality check failed");
            }
            CheckResult {
                id: check.id.clone(),
                expected,
                actual,
                severity: check.severity,
                passed,
            }
        })
        .collect();
    QualityReport::new(tier, results)
}

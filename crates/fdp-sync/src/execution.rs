//! Execution log: one JSON document per run under a directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fdp_core::Execution;
use fdp_storage::write_atomic;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutionLogError {
    #[error("execution {0} is terminal and can no longer change")]
    Terminal(Uuid),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct ExecutionLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ExecutionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, execution_id: Uuid) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    /// Writes the execution; refuses to overwrite one already terminal.
    pub async fn save(&self, execution: &Execution) -> Result<(), ExecutionLogError> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.get(execution.execution_id).await? {
            if existing.is_terminal() {
                return Err(ExecutionLogError::Terminal(execution.execution_id));
            }
        }
        let bytes = serde_json::to_vec_pretty(execution).context("serializing execution")?;
        write_atomic(&self.path_for(execution.execution_id), &bytes).await?;
        Ok(())
    }

    pub async fn get(&self, execution_id: Uuid) -> anyhow::Result<Option<Execution>> {
        let path = self.path_for(execution_id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Most recent first.
    pub async fn list(&self, limit: usize) -> anyhow::Result<Vec<Execution>> {
        let mut executions = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(executions),
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.dir.display())),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?
        {
            let path = entry.path();
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|_| path.extension().is_some_and(|ext| ext == "json"))
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            if let Some(execution) = self.get(id).await? {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit);
        Ok(executions)
    }
}

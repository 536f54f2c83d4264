//! Durable state for the pipeline: raw artifact tier, checkpoint/marker
//! stores, tier files, plus the shared retry policy and HTTP fetcher.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod checkpoint;
pub mod http;
pub mod retry;
pub mod tier;

pub use checkpoint::{CheckpointError, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use http::{FetchError, HttpClientConfig, HttpFetcher, RemoteMetadata};
pub use retry::{Classify, RetryDisposition, RetryPolicy};
pub use tier::{TierRow, TierStore, UpsertSummary};

pub const CRATE_NAME: &str = "fdp-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    /// Relative path under the store root; this is the payload reference
    /// carried by work items.
    pub payload_ref: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Raw tier: immutable, content-addressed bytes.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, source_key: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let shard = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(source_key)
            .join(shard)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        source_key: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(source_key, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let payload_ref = relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            payload_ref: payload_ref.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        match write_new_atomic(&absolute_path, bytes).await? {
            true => Ok(stored(false)),
            false => Ok(stored(true)),
        }
    }

    pub async fn read_bytes(&self, payload_ref: &str) -> anyhow::Result<Vec<u8>> {
        let relative = Path::new(payload_ref);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("payload ref escapes the artifact root: {payload_ref}");
        }
        let path = self.root.join(relative);
        fs::read(&path)
            .await
            .with_context(|| format!("reading raw artifact {}", path.display()))
    }
}

fn temp_path_for(path: &Path, len: usize) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    Ok(parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), len)))
}

async fn write_temp(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = temp_path_for(path, bytes.len())?;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    Ok(temp_path)
}

/// Writes `bytes` to `path` via temp file + rename, replacing any existing file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = write_temp(path, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Like [`write_atomic`] but never replaces an existing file. Returns
/// `false` when another writer got there first.
async fn write_new_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = write_temp(path, bytes).await?;
    if fs::try_exists(path).await.unwrap_or(false) {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(false);
    }
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_share_one_artifact() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_bytes("filings-2024", "html", b"<table>same</table>")
            .await
            .expect("first store");
        let second = store
            .store_bytes("filings-2024", "html", b"<table>same</table>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.payload_ref, second.payload_ref);
        assert!(first.payload_ref.starts_with("filings-2024/"));
        assert!(first.absolute_path.exists());

        let bytes = store.read_bytes(&first.payload_ref).await.expect("read back");
        assert_eq!(bytes, b"<table>same</table>");
    }

    #[tokio::test]
    async fn payload_refs_cannot_escape_root() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(store.read_bytes("../etc/passwd").await.is_err());
        assert!(store.read_bytes("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn write_atomic_replaces_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"one").await.expect("first write");
        write_atomic(&path, b"two").await.expect("second write");
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}

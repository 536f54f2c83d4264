//! Collaborator contracts the pipeline consumes (extractors, source listers,
//! remote probes, notifiers) plus fixture-first reference implementations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fdp_core::{Cursor, FilingType};
use fdp_storage::{ArtifactStore, Classify, HttpFetcher, RetryDisposition};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::OnceCell;

pub const CRATE_NAME: &str = "fdp-adapters";

pub type Record = BTreeMap<String, JsonValue>;

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub item_id: &'a str,
    pub source_key: &'a str,
    pub payload_ref: &'a str,
    pub filing_type: FilingType,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("transient extraction failure: {0}")]
    Transient(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("no extractor registered for filing type {0}")]
    Unsupported(FilingType),
}

impl Classify for ExtractError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ExtractError::Transient(_) => RetryDisposition::Retryable,
            ExtractError::Malformed(_) | ExtractError::Unsupported(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Black-box document extraction. Implementations must be pure with respect
/// to their input: the same bytes always yield the same records.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ExtractedDocument, ExtractError>;
}

/// Filing type -> extractor capability table, built once at startup.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_type: HashMap<FilingType, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTML tables for transaction reports and their amendments, JSON records
    /// for everything else.
    pub fn standard() -> Self {
        let html: Arc<dyn Extractor> = Arc::new(HtmlTableExtractor);
        let json: Arc<dyn Extractor> = Arc::new(JsonRecordExtractor);
        let mut registry = Self::new();
        for filing_type in FilingType::ALL {
            let extractor = match filing_type {
                FilingType::PeriodicTransaction | FilingType::Amendment => html.clone(),
                _ => json.clone(),
            };
            registry.register(filing_type, extractor);
        }
        registry
    }

    pub fn register(&mut self, filing_type: FilingType, extractor: Arc<dyn Extractor>) -> &mut Self {
        self.by_type.insert(filing_type, extractor);
        self
    }

    pub fn with(mut self, filing_type: FilingType, extractor: Arc<dyn Extractor>) -> Self {
        self.register(filing_type, extractor);
        self
    }

    pub fn resolve(&self, filing_type: FilingType) -> Result<Arc<dyn Extractor>, ExtractError> {
        self.by_type
            .get(&filing_type)
            .cloned()
            .ok_or(ExtractError::Unsupported(filing_type))
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<_> = self
            .by_type
            .iter()
            .map(|(ft, ex)| (ft.as_str(), ex.name()))
            .collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Malformed(format!("invalid selector {selector}: {e}")))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn column_name(header: &str, idx: usize) -> String {
    let slug = header
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.is_empty() {
        format!("column_{idx}")
    } else {
        slug
    }
}

/// One record per `<tr>` of data cells; header cells name the fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTableExtractor;

impl HtmlTableExtractor {
    fn parse(text: &str) -> Result<Vec<Record>, ExtractError> {
        let document = Html::parse_document(text);
        let table_sel = parse_selector("table")?;
        let row_sel = parse_selector("tr")?;
        let th_sel = parse_selector("th")?;
        let td_sel = parse_selector("td")?;

        let mut records = Vec::new();
        let mut saw_table = false;
        for table in document.select(&table_sel) {
            saw_table = true;
            let mut headers: Vec<String> = Vec::new();
            for row in table.select(&row_sel) {
                let header_cells: Vec<_> = row.select(&th_sel).map(cell_text).collect();
                if !header_cells.is_empty() {
                    headers = header_cells
                        .iter()
                        .enumerate()
                        .map(|(idx, h)| column_name(h, idx))
                        .collect();
                    continue;
                }
                let cells: Vec<_> = row.select(&td_sel).map(cell_text).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    continue;
                }
                let record = cells
                    .into_iter()
                    .enumerate()
                    .map(|(idx, value)| {
                        let name = headers
                            .get(idx)
                            .cloned()
                            .unwrap_or_else(|| format!("column_{idx}"));
                        let value = if value.is_empty() {
                            JsonValue::Null
                        } else {
                            JsonValue::String(value)
                        };
                        (name, value)
                    })
                    .collect::<Record>();
                records.push(record);
            }
        }
        if !saw_table {
            return Err(ExtractError::Malformed("no <table> element in document".into()));
        }
        Ok(records)
    }
}

#[async_trait]
impl Extractor for HtmlTableExtractor {
    fn name(&self) -> &'static str {
        "html_table"
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ExtractedDocument, ExtractError> {
        let text = std::str::from_utf8(request.bytes)
            .map_err(|e| ExtractError::Malformed(format!("{} is not utf-8: {e}", request.payload_ref)))?;
        Ok(ExtractedDocument {
            records: Self::parse(text)?,
        })
    }
}

/// Accepts `{"records": [...]}` or a bare array of objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordExtractor;

#[async_trait]
impl Extractor for JsonRecordExtractor {
    fn name(&self) -> &'static str {
        "json_records"
    }

    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<ExtractedDocument, ExtractError> {
        let value: JsonValue = serde_json::from_slice(request.bytes)
            .map_err(|e| ExtractError::Malformed(format!("{}: {e}", request.payload_ref)))?;
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut obj) => match obj.remove("records") {
                Some(JsonValue::Array(items)) => items,
                _ => return Err(ExtractError::Malformed("expected a \"records\" array".into())),
            },
            _ => return Err(ExtractError::Malformed("expected an object or array".into())),
        };
        let records = items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(obj) => Ok(obj.into_iter().collect::<Record>()),
                other => Err(ExtractError::Malformed(format!("record is not an object: {other}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ExtractedDocument { records })
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// One item yielded by a source listing, with its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    pub item_id: String,
    pub cursor: Cursor,
    pub filing_type: FilingType,
    pub extension: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("rate limited by remote source")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient listing failure: {0}")]
    Transient(String),
    #[error("listing failed: {0}")]
    Fatal(String),
}

impl Classify for ListError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ListError::Transient(_) => RetryDisposition::Retryable,
            ListError::RateLimited { .. } | ListError::Fatal(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Lazy, finite, restartable listing: each call yields the first item after
/// `after`, or `None` once the source is exhausted.
#[async_trait]
pub trait SourceLister: Send + Sync {
    async fn fetch_next(&self, source_key: &str, after: Option<&Cursor>) -> Result<Option<ListedItem>, ListError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureIndex {
    pub source_key: String,
    #[serde(default)]
    pub items: Vec<FixtureItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    pub sequence: u64,
    pub item_id: String,
    #[serde(default)]
    pub filing_code: Option<String>,
    #[serde(default)]
    pub filing_type: Option<FilingType>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

fn default_content_type() -> String {
    "text/html".to_string()
}

impl FixtureItem {
    /// Explicit type, then the clerk code, then `fallback`.
    pub fn filing_type_or(&self, fallback: FilingType) -> FilingType {
        self.filing_type
            .or_else(|| self.filing_code.as_deref().map(FilingType::from_code))
            .unwrap_or(fallback)
    }
}

pub fn extension_for_content_type(content_type: &str) -> &'static str {
    match content_type {
        "text/html" => "html",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

pub fn load_fixture_index(path: impl AsRef<Path>) -> Result<FixtureIndex> {
    let mut index: FixtureIndex = read_json_file(path)?;
    index.items.sort_by_key(|item| item.sequence);
    Ok(index)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Lists items from `<dir>/index.json`; raw bytes come from `inline_text` or
/// from `path` relative to the fixture directory. The index is read on first
/// use, and a missing index lists as empty until it appears.
#[derive(Debug)]
pub struct FixtureSourceLister {
    dir: PathBuf,
    default_filing_type: FilingType,
    index: OnceCell<FixtureIndex>,
}

impl FixtureSourceLister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_filing_type: FilingType::default(),
            index: OnceCell::new(),
        }
    }

    /// Filing type for items whose index entry carries neither a type nor a code.
    pub fn with_default_filing_type(mut self, filing_type: FilingType) -> Self {
        self.default_filing_type = filing_type;
        self
    }

    async fn load_index(&self) -> Result<Option<&FixtureIndex>, ListError> {
        if let Some(index) = self.index.get() {
            return Ok(Some(index));
        }
        let path = self.dir.join("index.json");
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ListError::Transient(format!("checking {}: {e}", path.display())))?;
        if !exists {
            return Ok(None);
        }
        self.index
            .get_or_try_init(|| async { load_fixture_index(&path) })
            .await
            .map(Some)
            .map_err(|e| ListError::Fatal(format!("{e:#}")))
    }

    fn load_bytes(&self, item: &FixtureItem) -> Result<Vec<u8>, ListError> {
        if let Some(text) = &item.inline_text {
            return Ok(text.as_bytes().to_vec());
        }
        let Some(rel) = &item.path else {
            return Err(ListError::Fatal(format!("fixture item {} has no content", item.item_id)));
        };
        let path = self.dir.join(rel);
        fs::read(&path).map_err(|e| ListError::Fatal(format!("reading {}: {e}", path.display())))
    }
}

#[async_trait]
impl SourceLister for FixtureSourceLister {
    async fn fetch_next(&self, source_key: &str, after: Option<&Cursor>) -> Result<Option<ListedItem>, ListError> {
        let after_seq = match after {
            None => None,
            Some(Cursor::Seq(n)) => Some(*n),
            Some(other) => {
                return Err(ListError::Fatal(format!("fixture listings use integer cursors, got {other}")))
            }
        };
        let Some(index) = self.load_index().await? else {
            tracing::debug!(source_key, dir = %self.dir.display(), "fixture index not published");
            return Ok(None);
        };
        let Some(item) = index
            .items
            .iter()
            .find(|item| after_seq.map_or(true, |seq| item.sequence > seq))
        else {
            return Ok(None);
        };
        Ok(Some(ListedItem {
            item_id: item.item_id.clone(),
            cursor: Cursor::Seq(item.sequence),
            filing_type: item.filing_type_or(self.default_filing_type),
            extension: extension_for_content_type(&item.content_type).to_string(),
            bytes: self.load_bytes(item)?,
        }))
    }
}

/// In-memory listing with an optional one-shot rate-limit signal, for
/// embedding and tests.
#[derive(Debug, Default)]
pub struct StaticSourceLister {
    items: Vec<ListedItem>,
    rate_limit_after: Mutex<Option<u64>>,
    requests: AtomicUsize,
}

impl StaticSourceLister {
    pub fn new(mut items: Vec<ListedItem>) -> Self {
        items.sort_by_key(|item| item.cursor.as_seq().unwrap_or(u64::MAX));
        Self {
            items,
            rate_limit_after: Mutex::new(None),
            requests: AtomicUsize::new(0),
        }
    }

    /// Numbered JSON documents `{prefix}-{n}` with sequences `1..=count`.
    pub fn numbered(prefix: &str, count: u64, filing_type: FilingType) -> Self {
        let items = (1..=count)
            .map(|n| ListedItem {
                item_id: format!("{prefix}-{n}"),
                cursor: Cursor::Seq(n),
                filing_type,
                extension: "json".into(),
                bytes: serde_json::json!({
                    "records": [{ "doc_id": format!("{prefix}-{n}"), "amount": n }]
                })
                .to_string()
                .into_bytes(),
            })
            .collect();
        Self::new(items)
    }

    /// The next request made after `seq` has been fetched answers with a
    /// rate-limit signal, once.
    pub fn rate_limit_after(self, seq: u64) -> Self {
        if let Ok(mut slot) = self.rate_limit_after.lock() {
            *slot = Some(seq);
        }
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLister for StaticSourceLister {
    async fn fetch_next(&self, _source_key: &str, after: Option<&Cursor>) -> Result<Option<ListedItem>, ListError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let after_seq = after.and_then(Cursor::as_seq);
        {
            let mut slot = self
                .rate_limit_after
                .lock()
                .map_err(|_| ListError::Fatal("rate limit state poisoned".into()))?;
            if let Some(limit) = *slot {
                if after_seq.unwrap_or(0) >= limit {
                    *slot = None;
                    return Err(ListError::RateLimited { retry_after: None });
                }
            }
        }
        Ok(self
            .items
            .iter()
            .find(|item| match (after_seq, item.cursor.as_seq()) {
                (None, _) => true,
                (Some(after), Some(seq)) => seq > after,
                (Some(_), None) => false,
            })
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Remote fingerprints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("transient probe failure: {0}")]
    Transient(String),
    #[error("probe failed: {0}")]
    Fatal(String),
}

impl Classify for ProbeError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ProbeError::Transient(_) => RetryDisposition::Retryable,
            ProbeError::Fatal(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Computes a content fingerprint for a source's remote resource. `Ok(None)`
/// means the resource is not published yet.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    async fn fingerprint(&self, source_key: &str) -> Result<Option<String>, ProbeError>;
}

/// Fingerprint = sha256 of a local fixture file (usually the index).
#[derive(Debug, Clone)]
pub struct FixtureProbe {
    path: PathBuf,
}

impl FixtureProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RemoteProbe for FixtureProbe {
    async fn fingerprint(&self, _source_key: &str) -> Result<Option<String>, ProbeError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(ArtifactStore::sha256_hex(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ProbeError::Transient(format!("reading {}: {err}", self.path.display()))),
        }
    }
}

/// Fingerprint = hash of content-length + last-modified from an HTTP HEAD.
#[derive(Debug, Clone)]
pub struct HttpHeadProbe {
    fetcher: Arc<HttpFetcher>,
    url: String,
}

impl HttpHeadProbe {
    pub fn new(fetcher: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RemoteProbe for HttpHeadProbe {
    async fn fingerprint(&self, source_key: &str) -> Result<Option<String>, ProbeError> {
        match self.fetcher.head(source_key, &self.url).await {
            Ok(meta) => Ok(meta.map(|m| m.fingerprint())),
            Err(err) => match err.disposition() {
                RetryDisposition::Retryable => Err(ProbeError::Transient(err.to_string())),
                RetryDisposition::NonRetryable => Err(ProbeError::Fatal(err.to_string())),
            },
        }
    }
}

/// Settable fingerprint, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticProbe {
    value: Mutex<Option<String>>,
}

impl StaticProbe {
    pub fn new(value: Option<&str>) -> Self {
        Self {
            value: Mutex::new(value.map(str::to_string)),
        }
    }

    pub fn set(&self, value: Option<&str>) {
        if let Ok(mut slot) = self.value.lock() {
            *slot = value.map(str::to_string);
        }
    }
}

#[async_trait]
impl RemoteProbe for StaticProbe {
    async fn fingerprint(&self, _source_key: &str) -> Result<Option<String>, ProbeError> {
        self.value
            .lock()
            .map(|slot| slot.clone())
            .map_err(|_| ProbeError::Fatal("probe state poisoned".into()))
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Fire-and-forget alerting; implementations must never block the caller.
pub trait Notifier: Send + Sync {
    fn alert(&self, subject: &str, payload: JsonValue);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn alert(&self, subject: &str, payload: JsonValue) {
        tracing::warn!(subject, %payload, "pipeline alert");
    }
}

/// Posts `{"subject", "payload"}` to a webhook on a background task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn alert(&self, subject: &str, payload: JsonValue) {
        let body = serde_json::json!({ "subject": subject, "payload": payload });
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(subject, "no async runtime; webhook alert dropped");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => tracing::warn!(status = %resp.status(), url, "webhook alert rejected"),
                Err(err) => tracing::warn!(error = %err, url, "webhook alert failed"),
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub subject: String,
    pub payload: JsonValue,
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn alert(&self, subject: &str, payload: JsonValue) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(Alert {
                subject: subject.to_string(),
                payload,
            });
        }
    }
}

/// Fans one alert out to several notifiers.
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }
}

impl Notifier for FanoutNotifier {
    fn alert(&self, subject: &str, payload: JsonValue) {
        for target in &self.targets {
            target.alert(subject, payload.clone());
        }
    }
}

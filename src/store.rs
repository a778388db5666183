//! Persistence interfaces and the implementations shipped with the crate
//!
//! The pipeline writes to two collaborators: an item store holding one row per
//! `(item_id, variant_id)` plus one asset row per content hash, and a blob
//! store holding the canonical bytes. Work arrives from an [`Enumerator`].
//! Production adapters implement these traits; the in-memory and local-file
//! versions here back dry runs, single-machine runs and tests.
//!
//! All writes go through a [`Recorder`], which turns every write into a
//! structured log line when the run is a dry run.

use crate::{CaptureError, OcrResult, RendererKind, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered key/value metadata attached to an upload.
pub type Metadata = Vec<(String, String)>;

/// Page conditions that end an item without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    RemovedForPolicyViolation,
    RateLimited,
    NotFound,
    VariationUnavailable,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::RemovedForPolicyViolation => "removed_for_policy_violation",
            TerminalStatus::RateLimited => "rate_limited",
            TerminalStatus::NotFound => "not_found",
            TerminalStatus::VariationUnavailable => "variation_unavailable",
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Done,
    Error,
    Terminal(TerminalStatus),
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
            ItemStatus::Terminal(t) => t.as_str(),
        }
    }

    /// Whether an item already in this status should be captured again
    /// without an explicit re-scrape request.
    pub fn needs_capture(&self) -> bool {
        matches!(
            self,
            ItemStatus::Pending | ItemStatus::Error | ItemStatus::Terminal(TerminalStatus::RateLimited)
        )
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => ItemStatus::Pending,
            "done" => ItemStatus::Done,
            "error" => ItemStatus::Error,
            "removed_for_policy_violation" => ItemStatus::Terminal(TerminalStatus::RemovedForPolicyViolation),
            "rate_limited" => ItemStatus::Terminal(TerminalStatus::RateLimited),
            "not_found" => ItemStatus::Terminal(TerminalStatus::NotFound),
            "variation_unavailable" => ItemStatus::Terminal(TerminalStatus::VariationUnavailable),
            other => return Err(CaptureError::Storage(format!("unknown status: {other}"))),
        })
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row in the asset table, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AssetRecord {
    pub content_hash: String,
    pub fingerprint: String,
    pub width: u32,
    pub height: u32,
    pub storage_path: String,
}

/// Attributes written to an item row when a variant is captured.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SuccessRecord {
    pub content_hash: String,
    pub fingerprint: String,
    pub width: u32,
    pub height: u32,
    pub storage_path: String,
    pub renderer: RendererKind,
    pub capture_method: String,
    pub capture_target: String,
    pub source_url: Option<String>,
    pub click_url: Option<String>,
    pub ocr: Option<OcrResult>,
    pub pipeline_version: String,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn upsert_pending(
        &self,
        item_id: &str,
        variant_id: &str,
        owner_id: &str,
        source_url: &str,
    ) -> Result<(), CaptureError>;

    async fn record_status(
        &self,
        item_id: &str,
        variant_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<(), CaptureError>;

    async fn link_success(
        &self,
        item_id: &str,
        variant_id: &str,
        record: &SuccessRecord,
    ) -> Result<(), CaptureError>;

    /// Insert the asset unless its hash is already present. Returns whether a
    /// row was created.
    async fn ensure_asset(&self, asset: &AssetRecord) -> Result<bool, CaptureError>;

    async fn persist_click_url(
        &self,
        item_id: &str,
        variant_id: &str,
        click_url: &str,
    ) -> Result<(), CaptureError>;

    async fn status(&self, item_id: &str, variant_id: &str) -> Result<Option<ItemStatus>, CaptureError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Idempotent overwrite of `path`.
    async fn upload(&self, path: &str, bytes: &[u8], metadata: &Metadata) -> Result<(), CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationOrder {
    #[default]
    None,
    InsertedAsc,
    InsertedDesc,
    OwnerAsc,
}

#[derive(Debug, Clone, Default)]
pub struct EnumerationFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<usize>,
    pub order: EnumerationOrder,
}

/// Source of candidate work items. Each call re-runs the underlying query.
#[async_trait]
pub trait Enumerator: Send + Sync {
    async fn stream(
        &self,
        filter: &EnumerationFilter,
    ) -> Result<BoxStream<'static, Result<WorkItem, CaptureError>>, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct ItemRow {
    pub owner_id: String,
    pub source_url: String,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    pub success: Option<SuccessRecord>,
    pub click_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Item store held in memory.
#[derive(Default)]
pub struct MemoryItemStore {
    items: DashMap<(String, String), ItemRow>,
    assets: DashMap<String, AssetRecord>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, item_id: &str, variant_id: &str) -> Option<ItemRow> {
        self.items
            .get(&(item_id.to_string(), variant_id.to_string()))
            .map(|r| r.clone())
    }

    /// Rows of one item, sorted by variant id.
    pub fn rows_for(&self, item_id: &str) -> Vec<(String, ItemRow)> {
        let mut rows: Vec<(String, ItemRow)> = self
            .items
            .iter()
            .filter(|e| e.key().0 == item_id)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn asset(&self, content_hash: &str) -> Option<AssetRecord> {
        self.assets.get(content_hash).map(|a| a.clone())
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    fn touch<F: FnOnce(&mut ItemRow)>(&self, item_id: &str, variant_id: &str, apply: F) {
        let mut row = self
            .items
            .entry((item_id.to_string(), variant_id.to_string()))
            .or_insert_with(|| ItemRow {
                owner_id: String::new(),
                source_url: String::new(),
                status: ItemStatus::Pending,
                last_error: None,
                success: None,
                click_url: None,
                updated_at: Utc::now(),
            });
        apply(&mut row);
        row.updated_at = Utc::now();
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn upsert_pending(
        &self,
        item_id: &str,
        variant_id: &str,
        owner_id: &str,
        source_url: &str,
    ) -> Result<(), CaptureError> {
        self.touch(item_id, variant_id, |row| {
            row.owner_id = owner_id.to_string();
            row.source_url = source_url.to_string();
            row.status = ItemStatus::Pending;
            row.last_error = None;
        });
        Ok(())
    }

    async fn record_status(
        &self,
        item_id: &str,
        variant_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<(), CaptureError> {
        self.touch(item_id, variant_id, |row| {
            row.status = status;
            row.last_error = last_error.map(str::to_string);
        });
        Ok(())
    }

    async fn link_success(
        &self,
        item_id: &str,
        variant_id: &str,
        record: &SuccessRecord,
    ) -> Result<(), CaptureError> {
        self.touch(item_id, variant_id, |row| {
            row.status = ItemStatus::Done;
            row.last_error = None;
            if record.click_url.is_some() {
                row.click_url = record.click_url.clone();
            }
            row.success = Some(record.clone());
        });
        Ok(())
    }

    async fn ensure_asset(&self, asset: &AssetRecord) -> Result<bool, CaptureError> {
        let mut inserted = false;
        self.assets
            .entry(asset.content_hash.clone())
            .or_insert_with(|| {
                inserted = true;
                asset.clone()
            });
        Ok(inserted)
    }

    async fn persist_click_url(
        &self,
        item_id: &str,
        variant_id: &str,
        click_url: &str,
    ) -> Result<(), CaptureError> {
        self.touch(item_id, variant_id, |row| {
            row.click_url = Some(click_url.to_string());
        });
        Ok(())
    }

    async fn status(&self, item_id: &str, variant_id: &str) -> Result<Option<ItemStatus>, CaptureError> {
        Ok(self.row(item_id, variant_id).map(|r| r.status))
    }
}

/// Blob store held in memory, keyed by path.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Vec<u8>, Metadata)>,
    uploads: std::sync::atomic::AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<(Vec<u8>, Metadata)> {
        self.blobs.get(path).map(|b| b.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Upload calls, including overwrites.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], metadata: &Metadata) -> Result<(), CaptureError> {
        self.uploads.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.blobs.insert(path.to_string(), (bytes.to_vec(), metadata.clone()));
        Ok(())
    }
}

/// Writes `file://<bucket>/<key>` paths under a local root, with the ordered
/// metadata in a `<file>.meta.json` sidecar.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location for a canonical `file://` path.
    pub fn local_path(&self, path: &str) -> Result<PathBuf, CaptureError> {
        let rest = path
            .strip_prefix("file://")
            .ok_or_else(|| CaptureError::Storage(format!("not a file:// path: {path}")))?;

        let mut out = self.root.clone();
        for part in rest.split('/').filter(|p| !p.is_empty()) {
            if part == ".." || part == "." {
                return Err(CaptureError::Storage(format!("path escapes root: {path}")));
            }
            out.push(part);
        }
        Ok(out)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8], metadata: &Metadata) -> Result<(), CaptureError> {
        let target = self.local_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;

        let mut sidecar = target.clone().into_os_string();
        sidecar.push(".meta.json");
        tokio::fs::write(&sidecar, serde_json::to_vec_pretty(metadata)?).await?;

        debug!(path, bytes = bytes.len(), "Blob written");
        Ok(())
    }
}

/// Enumerator over a fixed list of items with insertion times.
#[derive(Default)]
pub struct MemoryEnumerator {
    rows: Vec<(WorkItem, DateTime<Utc>)>,
}

impl MemoryEnumerator {
    pub fn new(rows: Vec<(WorkItem, DateTime<Utc>)>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl Enumerator for MemoryEnumerator {
    async fn stream(
        &self,
        filter: &EnumerationFilter,
    ) -> Result<BoxStream<'static, Result<WorkItem, CaptureError>>, CaptureError> {
        let mut rows: Vec<(WorkItem, DateTime<Utc>)> = self
            .rows
            .iter()
            .filter(|(_, at)| filter.from.map_or(true, |from| at.date_naive() >= from))
            .filter(|(_, at)| filter.to.map_or(true, |to| at.date_naive() <= to))
            .cloned()
            .collect();

        match filter.order {
            EnumerationOrder::None => {}
            EnumerationOrder::InsertedAsc => rows.sort_by_key(|(_, at)| *at),
            EnumerationOrder::InsertedDesc => rows.sort_by(|a, b| b.1.cmp(&a.1)),
            EnumerationOrder::OwnerAsc => rows.sort_by(|a, b| a.0.owner_id.cmp(&b.0.owner_id)),
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }

        Ok(stream::iter(rows.into_iter().map(|(item, _)| Ok(item))).boxed())
    }
}

/// Write facade used by the pipeline. In a dry run every write becomes a
/// structured log line and nothing reaches the stores.
#[derive(Clone)]
pub struct Recorder {
    items: Arc<dyn ItemStore>,
    blobs: Arc<dyn BlobStore>,
    dry_run: bool,
}

impl Recorder {
    pub fn new(items: Arc<dyn ItemStore>, blobs: Arc<dyn BlobStore>, dry_run: bool) -> Self {
        Self { items, blobs, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn upsert_pending(
        &self,
        item_id: &str,
        variant_id: &str,
        owner_id: &str,
        source_url: &str,
    ) -> Result<(), CaptureError> {
        if self.dry_run {
            info!(event = "dry_run", op = "upsert_pending", item_id, variant_id, owner_id, source_url);
            return Ok(());
        }
        self.items.upsert_pending(item_id, variant_id, owner_id, source_url).await
    }

    pub async fn record_status(
        &self,
        item_id: &str,
        variant_id: &str,
        status: ItemStatus,
        last_error: Option<&str>,
    ) -> Result<(), CaptureError> {
        if self.dry_run {
            info!(
                event = "dry_run",
                op = "record_status",
                item_id,
                variant_id,
                status = status.as_str(),
                last_error = last_error.unwrap_or_default()
            );
            return Ok(());
        }
        self.items.record_status(item_id, variant_id, status, last_error).await
    }

    pub async fn link_success(
        &self,
        item_id: &str,
        variant_id: &str,
        record: &SuccessRecord,
    ) -> Result<(), CaptureError> {
        if self.dry_run {
            info!(
                event = "dry_run",
                op = "link_success",
                item_id,
                variant_id,
                content_hash = %record.content_hash,
                storage_path = %record.storage_path
            );
            return Ok(());
        }
        self.items.link_success(item_id, variant_id, record).await
    }

    pub async fn ensure_asset(&self, asset: &AssetRecord) -> Result<bool, CaptureError> {
        if self.dry_run {
            info!(event = "dry_run", op = "ensure_asset", content_hash = %asset.content_hash);
            return Ok(false);
        }
        self.items.ensure_asset(asset).await
    }

    pub async fn persist_click_url(
        &self,
        item_id: &str,
        variant_id: &str,
        click_url: &str,
    ) -> Result<(), CaptureError> {
        if self.dry_run {
            info!(event = "dry_run", op = "persist_click_url", item_id, variant_id, click_url);
            return Ok(());
        }
        self.items.persist_click_url(item_id, variant_id, click_url).await
    }

    pub async fn upload(&self, path: &str, bytes: &[u8], metadata: &Metadata) -> Result<(), CaptureError> {
        if self.dry_run {
            info!(event = "dry_run", op = "upload", path, bytes = bytes.len(), fields = metadata.len());
            return Ok(());
        }
        self.blobs.upload(path, bytes, metadata).await
    }

    /// Reads are never suppressed.
    pub async fn status(&self, item_id: &str, variant_id: &str) -> Result<Option<ItemStatus>, CaptureError> {
        self.items.status(item_id, variant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn asset(hash: &str) -> AssetRecord {
        AssetRecord {
            content_hash: hash.to_string(),
            fingerprint: "00ff00ff00ff00ff".to_string(),
            width: 300,
            height: 250,
            storage_path: format!("file://b/assets/image/{}/{hash}.png", &hash[..2]),
        }
    }

    #[tokio::test]
    async fn ensure_asset_inserts_once() {
        let store = MemoryItemStore::new();
        let hash = "ab".repeat(32);
        assert!(store.ensure_asset(&asset(&hash)).await.unwrap());
        assert!(!store.ensure_asset(&asset(&hash)).await.unwrap());
        assert_eq!(store.asset_count(), 1);
    }

    #[tokio::test]
    async fn status_transitions_are_upserts() {
        let store = MemoryItemStore::new();
        store.upsert_pending("CR1", "v1", "AR1", "https://x/").await.unwrap();
        store
            .record_status("CR1", "v1", ItemStatus::Error, Some("boom"))
            .await
            .unwrap();
        let row = store.row("CR1", "v1").unwrap();
        assert_eq!(row.status, ItemStatus::Error);
        assert_eq!(row.last_error.as_deref(), Some("boom"));

        store.upsert_pending("CR1", "v1", "AR1", "https://x/").await.unwrap();
        let row = store.row("CR1", "v1").unwrap();
        assert_eq!(row.status, ItemStatus::Pending);
        assert_eq!(row.last_error, None);
        assert_eq!(store.rows_for("CR1").len(), 1);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            "pending",
            "done",
            "error",
            "removed_for_policy_violation",
            "rate_limited",
            "not_found",
            "variation_unavailable",
        ] {
            assert_eq!(s.parse::<ItemStatus>().unwrap().as_str(), s);
        }
        assert!("archived".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn which_statuses_need_capture() {
        assert!(ItemStatus::Pending.needs_capture());
        assert!(ItemStatus::Error.needs_capture());
        assert!(ItemStatus::Terminal(TerminalStatus::RateLimited).needs_capture());
        assert!(!ItemStatus::Done.needs_capture());
        assert!(!ItemStatus::Terminal(TerminalStatus::NotFound).needs_capture());
    }

    #[tokio::test]
    async fn dry_run_recorder_writes_nothing() {
        let items = Arc::new(MemoryItemStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let recorder = Recorder::new(items.clone(), blobs.clone(), true);

        recorder.upsert_pending("CR1", "v1", "AR1", "u").await.unwrap();
        recorder.upload("file://b/x.png", b"png", &vec![]).await.unwrap();
        assert!(!recorder.ensure_asset(&asset(&"cd".repeat(32))).await.unwrap());

        assert!(items.row("CR1", "v1").is_none());
        assert_eq!(items.asset_count(), 0);
        assert_eq!(blobs.upload_count(), 0);
    }

    #[tokio::test]
    async fn local_blob_store_writes_sidecar_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let meta: Metadata = vec![
            ("type".to_string(), "IMAGE".to_string()),
            ("item_id".to_string(), "CR1".to_string()),
            ("content_hash".to_string(), "ab".to_string()),
        ];

        store
            .upload("file://bucket/assets/image/ab/ab.png", b"bytes", &meta)
            .await
            .unwrap();

        let file = dir.path().join("bucket/assets/image/ab/ab.png");
        assert_eq!(std::fs::read(&file).unwrap(), b"bytes");
        let sidecar: Metadata =
            serde_json::from_slice(&std::fs::read(dir.path().join("bucket/assets/image/ab/ab.png.meta.json")).unwrap())
                .unwrap();
        assert_eq!(sidecar, meta);

        assert!(store.local_path("gs://bucket/x").is_err());
        assert!(store.local_path("file://bucket/../etc").is_err());
    }

    #[tokio::test]
    async fn memory_enumerator_filters_and_orders() {
        let at = |d: u32| Utc.with_ymd_and_hms(2025, 10, d, 12, 0, 0).unwrap();
        let item = |id: &str, owner: &str| WorkItem::new(id, &format!("https://x/{id}"), owner);
        let source = MemoryEnumerator::new(vec![
            (item("CR2", "AR9"), at(2)),
            (item("CR1", "AR1"), at(1)),
            (item("CR3", "AR5"), at(3)),
        ]);

        let filter = EnumerationFilter {
            from: NaiveDate::from_ymd_opt(2025, 10, 2),
            order: EnumerationOrder::InsertedDesc,
            ..Default::default()
        };
        let ids: Vec<String> = source
            .stream(&filter)
            .await
            .unwrap()
            .map(|r| r.unwrap().item_id)
            .collect()
            .await;
        assert_eq!(ids, vec!["CR3", "CR2"]);

        let filter = EnumerationFilter {
            order: EnumerationOrder::OwnerAsc,
            limit: Some(2),
            ..Default::default()
        };
        let owners: Vec<String> = source
            .stream(&filter)
            .await
            .unwrap()
            .map(|r| r.unwrap().owner_id)
            .collect()
            .await;
        assert_eq!(owners, vec!["AR1", "AR5"]);
    }
}

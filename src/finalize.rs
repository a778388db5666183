//! Finalization of a captured variant
//!
//! normalize → optional OCR → content-addressed path → upload with ordered
//! metadata → insert asset if absent → mark the variant done.
//!
//! Every step before the last one is safe to repeat: uploads overwrite the
//! same content-addressed path and the asset insert is a no-op for a known
//! hash, so a retried item never duplicates rows.

use crate::{
    normalize, CaptureError, CaptureProfile, Config, Metadata, NormalizedAsset, OcrGate, Recorder,
    RendererKind, StorageConfig, SuccessRecord, WorkItem, AssetRecord,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// How the raw bytes of a variant were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMethod {
    /// The served image file, downloaded over plain HTTP
    DirectFetch,
    ElementScreenshot,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::DirectFetch => "direct-fetch",
            CaptureMethod::ElementScreenshot => "element-screenshot",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of one capture path.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub raw_bytes: Vec<u8>,
    pub method: CaptureMethod,
    /// Human-readable description of what was captured
    pub target: String,
}

impl CaptureResult {
    pub fn fetched(raw_bytes: Vec<u8>, target: impl Into<String>) -> Self {
        Self {
            raw_bytes,
            method: CaptureMethod::DirectFetch,
            target: target.into(),
        }
    }

    pub fn screenshot(raw_bytes: Vec<u8>, target: impl Into<String>) -> Self {
        Self {
            raw_bytes,
            method: CaptureMethod::ElementScreenshot,
            target: target.into(),
        }
    }
}

/// `<scheme>://<bucket>/assets/<kind>/<h[0:2]>/<h>.png`
pub fn canonical_asset_path(
    storage: &StorageConfig,
    profile: CaptureProfile,
    content_hash: &str,
) -> Result<String, CaptureError> {
    let valid = content_hash.len() == 64
        && content_hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return Err(CaptureError::Storage(format!(
            "not a lowercase sha-256 hex digest: {content_hash:?}"
        )));
    }

    Ok(format!(
        "{}://{}/assets/{}/{}/{}.png",
        storage.scheme,
        storage.bucket,
        profile.as_str(),
        &content_hash[..2],
        content_hash
    ))
}

/// Identity of the variant being finalized.
#[derive(Debug, Clone)]
pub struct VariantContext<'a> {
    pub item: &'a WorkItem,
    pub variant_id: &'a str,
    pub renderer: RendererKind,
}

/// Upload metadata in its fixed audit order. Optional fields are omitted
/// rather than written empty.
pub fn build_metadata(
    profile: CaptureProfile,
    variant: &VariantContext<'_>,
    capture: &CaptureResult,
    asset: &NormalizedAsset,
    pipeline_version: &str,
    click_url: Option<&str>,
    source_url: Option<&str>,
) -> Metadata {
    let mut md: Metadata = vec![
        ("type".to_string(), profile.ad_type().to_string()),
        ("item_id".to_string(), variant.item.item_id.clone()),
        ("owner_id".to_string(), variant.item.owner_id.clone()),
        ("variant_id".to_string(), variant.variant_id.to_string()),
        ("renderer".to_string(), variant.renderer.as_str().to_string()),
        ("capture_method".to_string(), capture.method.as_str().to_string()),
        ("capture_target".to_string(), capture.target.clone()),
        ("width".to_string(), asset.width.to_string()),
        ("height".to_string(), asset.height.to_string()),
        ("content_hash".to_string(), asset.content_hash.clone()),
        ("fingerprint".to_string(), asset.fingerprint.clone()),
        ("pipeline_version".to_string(), pipeline_version.to_string()),
    ];
    if let Some(url) = click_url.filter(|u| !u.is_empty()) {
        md.push(("click_url".to_string(), url.to_string()));
    }
    if let Some(url) = source_url.filter(|u| !u.is_empty()) {
        md.push(("source_url".to_string(), url.to_string()));
    }
    md
}

/// What finalization produced.
#[derive(Debug, Clone)]
pub struct FinalizedAsset {
    pub content_hash: String,
    pub storage_path: String,
    pub width: u32,
    pub height: u32,
    /// False when the hash was already known (or in a dry run).
    pub new_asset: bool,
}

pub struct Finalizer {
    recorder: Recorder,
    ocr: Arc<OcrGate>,
    storage: StorageConfig,
    profile: CaptureProfile,
    pipeline_version: String,
}

impl Finalizer {
    pub fn new(config: &Config, recorder: Recorder, ocr: Arc<OcrGate>) -> Self {
        Self {
            recorder,
            ocr,
            storage: config.storage.clone(),
            profile: config.profile,
            pipeline_version: config.pipeline_version(),
        }
    }

    pub fn pipeline_version(&self) -> &str {
        &self.pipeline_version
    }

    pub async fn finalize(
        &self,
        variant: &VariantContext<'_>,
        capture: &CaptureResult,
        click_url: Option<&str>,
    ) -> Result<FinalizedAsset, CaptureError> {
        let asset = normalize(&capture.raw_bytes, true)?;

        let ocr = if self.recorder.is_dry_run() {
            None
        } else {
            self.ocr.recognize(&asset.bytes).await
        };

        let storage_path = canonical_asset_path(&self.storage, self.profile, &asset.content_hash)?;
        let source_url = Some(variant.item.item_url.as_str());
        let metadata = build_metadata(
            self.profile,
            variant,
            capture,
            &asset,
            &self.pipeline_version,
            click_url,
            source_url,
        );

        self.recorder.upload(&storage_path, &asset.bytes, &metadata).await?;

        let new_asset = self
            .recorder
            .ensure_asset(&AssetRecord {
                content_hash: asset.content_hash.clone(),
                fingerprint: asset.fingerprint.clone(),
                width: asset.width,
                height: asset.height,
                storage_path: storage_path.clone(),
            })
            .await?;

        let record = SuccessRecord {
            content_hash: asset.content_hash.clone(),
            fingerprint: asset.fingerprint.clone(),
            width: asset.width,
            height: asset.height,
            storage_path: storage_path.clone(),
            renderer: variant.renderer,
            capture_method: capture.method.as_str().to_string(),
            capture_target: capture.target.clone(),
            source_url: source_url.map(str::to_string),
            click_url: click_url.map(str::to_string),
            ocr,
            pipeline_version: self.pipeline_version.clone(),
        };
        self.recorder
            .link_success(&variant.item.item_id, variant.variant_id, &record)
            .await?;

        info!(
            event = "asset_finalized",
            content_hash = %asset.content_hash,
            storage_path = %storage_path,
            width = asset.width,
            height = asset.height,
            new_asset,
            capture_method = capture.method.as_str(),
            capture_target = %capture.target,
            "Variant finalized"
        );

        Ok(FinalizedAsset {
            content_hash: asset.content_hash,
            storage_path,
            width: asset.width,
            height: asset.height,
            new_asset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{pattern_png, solid_png};
    use crate::{ItemStatus, MemoryBlobStore, MemoryItemStore, MockTextRecognizer, OcrResult};

    fn storage() -> StorageConfig {
        StorageConfig {
            scheme: "gs".to_string(),
            bucket: "creatives".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn asset_path_for_both_kinds() {
        let h = "0f".repeat(32);
        assert_eq!(
            canonical_asset_path(&storage(), CaptureProfile::Image, &h).unwrap(),
            format!("gs://creatives/assets/image/0f/{h}.png")
        );
        assert_eq!(
            canonical_asset_path(&storage(), CaptureProfile::Text, &h).unwrap(),
            format!("gs://creatives/assets/text/0f/{h}.png")
        );
    }

    #[test]
    fn asset_path_rejects_bad_hashes() {
        assert!(canonical_asset_path(&storage(), CaptureProfile::Image, "abc").is_err());
        assert!(canonical_asset_path(&storage(), CaptureProfile::Image, &"AB".repeat(32)).is_err());
        assert!(canonical_asset_path(&storage(), CaptureProfile::Image, &"../".repeat(22)[..64]).is_err());
    }

    #[test]
    fn metadata_order_is_fixed() {
        let item = WorkItem::new("CR1", "https://portal.example/creative/CR1", "AR1");
        let variant = VariantContext {
            item: &item,
            variant_id: "v2",
            renderer: RendererKind::AnimatedBundle,
        };
        let capture = CaptureResult::screenshot(Vec::new(), "#mys-content");
        let asset = normalize(&solid_png(4, 3, [9, 9, 9, 255]), false).unwrap();

        let md = build_metadata(
            CaptureProfile::Image,
            &variant,
            &capture,
            &asset,
            "image:test",
            Some("https://brand.example/"),
            Some(&item.item_url),
        );
        let keys: Vec<&str> = md.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "type",
                "item_id",
                "owner_id",
                "variant_id",
                "renderer",
                "capture_method",
                "capture_target",
                "width",
                "height",
                "content_hash",
                "fingerprint",
                "pipeline_version",
                "click_url",
                "source_url",
            ]
        );
        assert_eq!(md[0].1, "IMAGE");
        assert_eq!(md[5].1, "element-screenshot");
        assert_eq!(md[7].1, "4");

        let without = build_metadata(CaptureProfile::Text, &variant, &capture, &asset, "t", None, Some(""));
        assert_eq!(without.len(), 12);
        assert_eq!(without[0].1, "TEXT");
    }

    #[tokio::test]
    async fn finalize_twice_keeps_one_asset() {
        let items = Arc::new(MemoryItemStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let recorder = Recorder::new(items.clone(), blobs.clone(), false);
        let finalizer = Finalizer::new(&Config::default(), recorder, Arc::new(OcrGate::disabled()));

        let item = WorkItem::new("CR9", "https://portal.example/creative/CR9", "AR9");
        let variant = VariantContext {
            item: &item,
            variant_id: "v1",
            renderer: RendererKind::PlainImage,
        };
        let capture = CaptureResult::fetched(pattern_png(40, 30, 1), "img[src]");

        let first = finalizer.finalize(&variant, &capture, None).await.unwrap();
        let second = finalizer.finalize(&variant, &capture, None).await.unwrap();

        assert!(first.new_asset);
        assert!(!second.new_asset);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(items.asset_count(), 1);
        assert_eq!(blobs.paths(), vec![first.storage_path.clone()]);
        let row = items.row("CR9", "v1").unwrap();
        assert_eq!(row.status, ItemStatus::Done);
        assert_eq!(row.success.unwrap().content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn ocr_result_lands_on_the_row() {
        let mut mock = MockTextRecognizer::new();
        mock.expect_recognize().times(1).returning(|_| {
            Ok(Some(OcrResult {
                text: Some("Spring sale".to_string()),
                language: Some("en".to_string()),
                confidence: Some(0.8),
            }))
        });
        let items = Arc::new(MemoryItemStore::new());
        let recorder = Recorder::new(items.clone(), Arc::new(MemoryBlobStore::new()), false);
        let finalizer = Finalizer::new(&Config::default(), recorder, Arc::new(OcrGate::new(Arc::new(mock), true)));

        let item = WorkItem::new("CR5", "https://portal.example/creative/CR5", "AR5");
        let variant = VariantContext {
            item: &item,
            variant_id: "v1",
            renderer: RendererKind::IframeGeneric,
        };
        finalizer
            .finalize(&variant, &CaptureResult::screenshot(pattern_png(20, 20, 3), "canvas"), None)
            .await
            .unwrap();

        let ocr = items.row("CR5", "v1").unwrap().success.unwrap().ocr.unwrap();
        assert_eq!(ocr.text.as_deref(), Some("Spring sale"));
    }

    #[tokio::test]
    async fn undecodable_bytes_fail_before_any_write() {
        let items = Arc::new(MemoryItemStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let finalizer = Finalizer::new(
            &Config::default(),
            Recorder::new(items.clone(), blobs.clone(), false),
            Arc::new(OcrGate::disabled()),
        );
        let item = WorkItem::new("CR2", "https://portal.example/creative/CR2", "AR2");
        let variant = VariantContext {
            item: &item,
            variant_id: "v1",
            renderer: RendererKind::PlainImage,
        };

        let err = finalizer
            .finalize(&variant, &CaptureResult::fetched(b"<html>".to_vec(), "img[src]"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Decode(_)));
        assert_eq!(blobs.upload_count(), 0);
        assert_eq!(items.asset_count(), 0);
    }
}

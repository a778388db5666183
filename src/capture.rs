//! Per-item capture state machine
//!
//! ```text
//! start → navigated → terminal? → variants resolved → per variant: captured | failed
//!       → done (≥1 captured) | terminal re-check → error
//! ```
//!
//! A variant failure never aborts the item. Only transport failures (the
//! browser is gone) and navigation failures leave this module as errors; the
//! worker decides how to retry them. Everything else ends in a recorded
//! status.

use crate::{
    collect_click_urls, fingerprint, hamming_distance, is_meaningful_src, join_url, locate_tile,
    sanitize_filename, select_primary_click_url, settle, BrowserSession, ByteFetcher,
    CaptureError, CaptureProfile, CaptureResult, Config, CreativePage, Finalizer, ItemOutcome,
    ItemStatus, Metrics, OcrGate, Recorder, RendererKind, ResolveContext, Resolver,
    TerminalStatus, Timeouts, Variant, VariantContext, WorkItem, SINGLE_AD_CANVAS, SYNDICATED_ROOTS,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Variant id of the item-level status row.
pub const PRIMARY_VARIANT_ID: &str = "v1";

pub const POLICY_BANNER: &str = "div.policy-violation-banner";
const RENDER_FAILED: &str = "div.render-failed, div.render-failed-container";
const RATE_LIMIT_MARKER: &str = "#af-error-container";
const EMPTY_RESULTS: &str = "div.empty-results";
const CREATIVE_CONTAINER: &str = "div.creative-container, creative-details";
const RENDER_FAILED_WAIT: Duration = Duration::from_secs(2);

/// Elements showing the bundle document holds the creative itself.
const BUNDLE_CREATIVE_DOM: &str = "#mys-content, #google_image_div, gwd-google-ad, gwd-page, \
     #page1, .gwd-page-content, svg.image";
const BUNDLE_RAW_IMAGE: &str = "img.img_ad, a#aw0 > img, #google_image_div img";

/// Stage roots inside an image bundle, authoring-tool layouts first.
const BUNDLE_STAGES: [&str; 13] = [
    "#page1",
    ".gwd-page-content",
    "gwd-page",
    ".gwd-page-container",
    "gwd-pagedeck",
    "#pagedeck",
    "gwd-google-ad",
    "div[class*='gwd-page-']",
    "#mys-content",
    "#mys-wrapper",
    ".x-layout",
    "svg.image",
    "#google_image_div",
];
const TEXT_BUNDLE_STAGES: [&str; 1] = [SINGLE_AD_CANVAS];

const AUTHORING_METADATA: &str = "script[type='text/gwd-admetadata']";
const AUTHORING_ELEMENTS: &str = "gwd-google-ad, gwd-page, #gwd-ad, .gwd-page-content";

const TILE_SETTLE_DELAY: Duration = Duration::from_millis(300);
const FREEZE_DELAY: Duration = Duration::from_millis(200);
const NESTED_CANVAS_POLLS: usize = 5;
const NESTED_CANVAS_POLL: Duration = Duration::from_millis(120);
const MIN_CLIP_SIDE: f64 = 20.0;

/// Inspect a loaded portal page for conditions that end the item for good.
pub async fn detect_terminal(
    page: &dyn CreativePage,
    timeouts: &Timeouts,
) -> Result<Option<TerminalStatus>, CaptureError> {
    if page.wait_for(POLICY_BANNER, timeouts.banner).await? && page.is_visible(POLICY_BANNER).await? {
        return Ok(Some(TerminalStatus::RemovedForPolicyViolation));
    }
    if page.wait_for(RENDER_FAILED, RENDER_FAILED_WAIT.min(timeouts.banner)).await? {
        return Ok(Some(TerminalStatus::VariationUnavailable));
    }
    if page.title().await?.contains("Error 429") || page.exists(RATE_LIMIT_MARKER).await? {
        return Ok(Some(TerminalStatus::RateLimited));
    }
    if page.exists(EMPTY_RESULTS).await? && !page.exists(CREATIVE_CONTAINER).await? {
        return Ok(Some(TerminalStatus::NotFound));
    }
    Ok(None)
}

async fn authoring_marker_in(page: &dyn CreativePage) -> Result<Option<&'static str>, CaptureError> {
    if page.exists(AUTHORING_METADATA).await? {
        return Ok(Some("admetadata"));
    }
    if page.exists(AUTHORING_ELEMENTS).await? {
        return Ok(Some("gwd-element"));
    }
    Ok(None)
}

/// Authoring-tool marker of a bundle document or one of its same-origin
/// child frames (`child:` prefix).
pub async fn sniff_authoring_marker(page: &dyn CreativePage) -> Result<Option<String>, CaptureError> {
    if let Some(marker) = authoring_marker_in(page).await? {
        return Ok(Some(marker.to_string()));
    }

    for child in page.elements("iframe").await? {
        let selector = match (&child.id, &child.name) {
            (Some(id), _) => format!("iframe[id={}]", crate::css_quote(id)),
            (None, Some(name)) => format!("iframe[name={}]", crate::css_quote(name)),
            (None, None) => continue,
        };
        let Some(frame) = page.frame(&selector).await? else {
            continue;
        };
        if let Some(marker) = authoring_marker_in(frame.as_ref()).await? {
            return Ok(Some(format!("child:{marker}")));
        }
    }
    Ok(None)
}

/// Outcome of one variant's capture path.
enum VariantStep {
    Captured {
        capture: CaptureResult,
        clicks: Vec<String>,
    },
    /// The page turned terminal while the variant was being captured.
    Terminal(TerminalStatus),
}

/// Sources found inside a carousel tile after activating it.
#[derive(Debug, Default)]
struct TileProbe {
    tile: Option<String>,
    iframe: String,
    img: String,
}

pub struct CaptureOrchestrator {
    config: Config,
    resolver: Resolver,
    fetcher: Arc<dyn ByteFetcher>,
    recorder: Recorder,
    finalizer: Finalizer,
    metrics: Arc<Metrics>,
}

impl CaptureOrchestrator {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn ByteFetcher>,
        recorder: Recorder,
        ocr: Arc<OcrGate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let finalizer = Finalizer::new(&config, recorder.clone(), ocr);
        Self {
            resolver: Resolver::for_profile(config.profile),
            config,
            fetcher,
            recorder,
            finalizer,
            metrics,
        }
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Run one item to a recorded outcome.
    ///
    /// Returns `Err` only for transport failures, navigation included: the
    /// caller relaunches the browser and tries the same item again. Any other
    /// failure is recorded as `error` here.
    pub async fn process_item(
        &self,
        session: &dyn BrowserSession,
        item: &WorkItem,
    ) -> Result<ItemOutcome, CaptureError> {
        let span = info_span!("item", item_id = %item.item_id, owner_id = %item.owner_id);
        async {
            info!(event = "item_start", url = %item.item_url, ad_type = self.config.profile.ad_type());
            match self.run_item(session, item).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transport() => Err(e),
                Err(e) => {
                    let message = format!("exception: {e}");
                    warn!(event = "item_failed", error_kind = e.kind(), error = %e);
                    self.recorder
                        .record_status(&item.item_id, PRIMARY_VARIANT_ID, ItemStatus::Error, Some(&message))
                        .await?;
                    Ok(ItemOutcome::Error)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_item(
        &self,
        session: &dyn BrowserSession,
        item: &WorkItem,
    ) -> Result<ItemOutcome, CaptureError> {
        self.recorder
            .upsert_pending(&item.item_id, PRIMARY_VARIANT_ID, &item.owner_id, &item.item_url)
            .await?;

        let page = session.new_page().await?;
        let result = self.run_on_page(session, page.as_ref(), item).await;
        if let Err(e) = page.close().await {
            debug!(error = %e, "page close failed");
        }
        result
    }

    async fn run_on_page(
        &self,
        session: &dyn BrowserSession,
        page: &dyn CreativePage,
        item: &WorkItem,
    ) -> Result<ItemOutcome, CaptureError> {
        page.goto(&item.item_url, self.config.timeouts.page).await?;
        self.dump_debug_artifacts(page, &item.item_id).await;

        if let Some(status) = detect_terminal(page, &self.config.timeouts).await? {
            return self.finish_terminal(item, status).await;
        }

        let ctx = ResolveContext {
            page_url: item.item_url.clone(),
            probe_timeout: self.config.timeouts.frame,
        };
        let variants = self.resolver.resolve(page, &ctx).await?;
        if self.config.debug.frame_inventory {
            info!(event = "variants_resolved", variants = ?variants);
        }
        if variants.is_empty() {
            return self.finish_without_capture(page, item, "no_renderer_or_img_in_creative").await;
        }

        let mut captured = 0usize;
        let mut failures: Vec<String> = Vec::new();

        for variant in &variants {
            let variant_id = variant.variant_id();
            let span = info_span!("variant", variant_id = %variant_id, renderer = %variant.kind);
            let step = async {
                info!(event = "variant_attempt", position = variant.dom_position);
                self.recorder
                    .upsert_pending(&item.item_id, &variant_id, &item.owner_id, &item.item_url)
                    .await?;
                self.capture_and_finalize(session, page, item, variant).await
            }
            .instrument(span)
            .await;

            match step {
                Ok(None) => {
                    captured += 1;
                    self.metrics.record_variant(true);
                    if !self.config.all_variants {
                        break;
                    }
                }
                Ok(Some(status)) => return self.finish_terminal(item, status).await,
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    self.metrics.record_variant(false);
                    warn!(
                        event = "variant_failed",
                        variant_id = %variant_id,
                        error_kind = e.kind(),
                        error = %e
                    );
                    let message = format!("{}: {e}", variant.kind.as_str());
                    self.recorder
                        .record_status(&item.item_id, &variant_id, ItemStatus::Error, Some(&message))
                        .await?;
                    failures.push(format!("{variant_id}: {e}"));
                }
            }
        }

        if captured > 0 {
            info!(event = "item_done", captured, failed = failures.len());
            return Ok(ItemOutcome::Done);
        }
        let reason = format!("no_variant_captured ({})", failures.join("; "));
        self.finish_without_capture(page, item, &reason).await
    }

    /// `Ok(Some)` when the page turned terminal mid-capture.
    async fn capture_and_finalize(
        &self,
        session: &dyn BrowserSession,
        page: &dyn CreativePage,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<Option<TerminalStatus>, CaptureError> {
        let (capture, clicks) = match self.capture_variant(session, page, item, variant).await? {
            VariantStep::Captured { capture, clicks } => (capture, clicks),
            VariantStep::Terminal(status) => return Ok(Some(status)),
        };

        let variant_id = variant.variant_id();
        let click_url = select_primary_click_url(&clicks);
        if let Some(url) = &click_url {
            info!(event = "click_url", url = %url);
            self.recorder.persist_click_url(&item.item_id, &variant_id, url).await?;
        }

        let ctx = VariantContext {
            item,
            variant_id: &variant_id,
            renderer: variant.kind,
        };
        self.finalizer.finalize(&ctx, &capture, click_url.as_deref()).await?;
        Ok(None)
    }

    async fn capture_variant(
        &self,
        session: &dyn BrowserSession,
        page: &dyn CreativePage,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        match variant.kind {
            RendererKind::EmbeddedImage => self.capture_embedded_image(page, item, variant).await,
            RendererKind::PlainImage => self.capture_plain_image(page, item, variant).await,
            RendererKind::AnimatedBundle => self.capture_bundle_variant(session, page, item, variant).await,
            RendererKind::SyndicatedTile => self.capture_syndicated(page, variant).await,
            RendererKind::IframeGeneric => self.capture_generic_frame(page, variant).await,
        }
    }

    /// Scroll a lazy tile into view, click it, and read its sources.
    async fn activate_tile(
        &self,
        page: &dyn CreativePage,
        variant: &Variant,
        base_url: &str,
    ) -> Result<TileProbe, CaptureError> {
        if variant.dom_position == 0 {
            return Ok(TileProbe::default());
        }
        let Some(tile) = locate_tile(page, variant.dom_position, variant.variant_index).await? else {
            return Ok(TileProbe::default());
        };

        match page.activate(&tile).await {
            Ok(()) => tokio::time::sleep(TILE_SETTLE_DELAY).await,
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => debug!(tile = %tile, error = %e, "tile activation failed"),
        }

        let source = |raw: Option<String>| raw.and_then(|s| join_url(base_url, &s)).unwrap_or_default();
        let iframe = source(page.attribute(&format!("{tile} iframe"), "src").await?);
        let img = source(page.attribute(&format!("{tile} img"), "src").await?);
        Ok(TileProbe {
            tile: Some(tile),
            iframe,
            img,
        })
    }

    async fn capture_embedded_image(
        &self,
        page: &dyn CreativePage,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let probe = self.activate_tile(page, variant, &item.item_url).await?;
        let src = if is_meaningful_src(&variant.source_reference) {
            variant.source_reference.clone()
        } else {
            probe.img
        };
        if !is_meaningful_src(&src) {
            return Err(CaptureError::ElementNotFound(format!(
                "image source for {}",
                variant.dom_locator
            )));
        }

        let bytes = self.fetcher.fetch(&src, Some(&item.item_url)).await?;
        let scope = probe.tile.as_deref().unwrap_or("creative-details");
        let clicks = collect_click_urls(page, Some(scope)).await?;
        Ok(VariantStep::Captured {
            capture: CaptureResult::fetched(bytes, "img[src]"),
            clicks,
        })
    }

    async fn capture_plain_image(
        &self,
        page: &dyn CreativePage,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let bytes = self
            .fetcher
            .fetch(&variant.source_reference, Some(&item.item_url))
            .await?;

        let mut clicks = collect_click_urls(page, Some("creative-details")).await?;
        if clicks.is_empty() {
            clicks = collect_click_urls(page, None).await?;
        }
        Ok(VariantStep::Captured {
            capture: CaptureResult::fetched(bytes, "img[src]"),
            clicks,
        })
    }

    async fn capture_bundle_variant(
        &self,
        session: &dyn BrowserSession,
        page: &dyn CreativePage,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let mut src = variant.source_reference.clone();
        let mut probe = TileProbe::default();
        if variant.dom_position > 0 {
            probe = self.activate_tile(page, variant, &item.item_url).await?;
            if !is_meaningful_src(&src) {
                src = probe.iframe.clone();
            }
        }

        if is_meaningful_src(&src) {
            let sub = session.new_page().await?;
            let result = self.capture_bundle_document(sub.as_ref(), &src, item, variant).await;
            if let Err(e) = sub.close().await {
                debug!(error = %e, "bundle page close failed");
            }
            match result {
                Ok(step) => return Ok(step),
                Err(e @ CaptureError::Transport(_)) => return Err(e),
                Err(e) => warn!(event = "bundle_capture_failed", src = %src, error = %e),
            }
        }

        // No usable bundle document: screenshot whatever occupies the tile.
        let Some(tile) = probe.tile else {
            return Err(CaptureError::CaptureFailed(format!(
                "bundle source unavailable for {}",
                variant.dom_locator
            )));
        };
        let framed = format!("{tile} iframe");
        let target = if page.exists(&framed).await? { framed } else { tile };
        page.unclip_ancestors(&target).await?;
        let png = settle(|| page.screenshot_element(&target), &self.config.settle.standard).await?;
        Ok(VariantStep::Captured {
            capture: CaptureResult::screenshot(png, "host_iframe"),
            clicks: Vec::new(),
        })
    }

    /// Raw image, then stage element, then the whole document.
    async fn capture_bundle_document(
        &self,
        sub: &dyn CreativePage,
        src: &str,
        item: &WorkItem,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let timeouts = &self.config.timeouts;
        sub.goto(src, timeouts.page).await?;
        self.dump_debug_artifacts(sub, &format!("{}_{}", item.item_id, variant.variant_id()))
            .await;

        if !sub.exists(BUNDLE_CREATIVE_DOM).await? {
            if let Some(nested) = sub.attribute("iframe[src]", "src").await? {
                let base = sub.url().await?;
                if let Some(nested) = join_url(&base, &nested) {
                    debug!(nested = %nested, "following nested bundle frame");
                    match sub.goto(&nested, timeouts.page).await {
                        Err(e @ CaptureError::Transport(_)) => return Err(e),
                        Err(e) => debug!(error = %e, "nested bundle frame did not load"),
                        Ok(()) => {}
                    }
                }
            }
        }

        let profile = self.config.profile;
        if profile == CaptureProfile::Image {
            if let Some(capture) = self.fetch_bundle_image(sub, item).await? {
                let clicks = collect_click_urls(sub, None).await?;
                return Ok(VariantStep::Captured { capture, clicks });
            }
        }

        let stages: &[&str] = match profile {
            CaptureProfile::Image => &BUNDLE_STAGES,
            CaptureProfile::Text => &TEXT_BUNDLE_STAGES,
        };
        if let Some((png, stage)) = self.capture_stage(sub, stages).await? {
            let mut target = stage.to_string();
            if let Some(marker) = sniff_authoring_marker(sub).await? {
                target = format!("{target}[gwd:{marker}]");
            }
            let clicks = collect_click_urls(sub, None).await?;
            return Ok(VariantStep::Captured {
                capture: CaptureResult::screenshot(png, target),
                clicks,
            });
        }

        let png = settle(|| sub.screenshot_page(), &self.config.settle.full_page).await?;
        info!(event = "bundle_fullpage_fallback");
        Ok(VariantStep::Captured {
            capture: CaptureResult::screenshot(png, "sad_fullpage"),
            clicks: Vec::new(),
        })
    }

    /// Bytes of the bundle's own image element, if it has one that downloads.
    async fn fetch_bundle_image(
        &self,
        sub: &dyn CreativePage,
        item: &WorkItem,
    ) -> Result<Option<CaptureResult>, CaptureError> {
        if !sub.wait_for(BUNDLE_RAW_IMAGE, self.config.timeouts.frame).await? {
            return Ok(None);
        }
        tokio::time::sleep(FREEZE_DELAY).await;

        let Some(raw) = sub.attribute(BUNDLE_RAW_IMAGE, "src").await? else {
            return Ok(None);
        };
        let Some(url) = join_url(&sub.url().await?, &raw) else {
            return Ok(None);
        };
        match self.fetcher.fetch(&url, Some(&item.item_url)).await {
            Ok(bytes) => Ok(Some(CaptureResult::fetched(bytes, "sadbundle_img"))),
            Err(e) => {
                debug!(url = %url, error = %e, "bundle image fetch failed, falling back to screenshot");
                Ok(None)
            }
        }
    }

    /// Settle on the first stage root present, then freeze animations and
    /// take one more frame. If freezing moved the picture, settle again
    /// briefly and keep that instead.
    async fn capture_stage<'s>(
        &self,
        sub: &dyn CreativePage,
        stages: &[&'s str],
    ) -> Result<Option<(Vec<u8>, &'s str)>, CaptureError> {
        if !sub.wait_for(&stages.join(", "), self.config.timeouts.frame).await? {
            return Ok(None);
        }
        let mut found = None;
        for stage in stages {
            if sub.exists(stage).await? {
                found = Some(*stage);
                break;
            }
        }
        let Some(stage) = found else {
            return Ok(None);
        };

        let settle_cfg = &self.config.settle;
        sub.unclip_ancestors(stage).await?;
        let settled = settle(|| sub.screenshot_element(stage), &settle_cfg.standard).await?;

        sub.pause_animations().await?;
        tokio::time::sleep(FREEZE_DELAY).await;
        let frozen = match sub.screenshot_element(stage).await {
            Ok(png) => png,
            Err(e) if e.is_transport() => return Err(e),
            Err(_) => return Ok(Some((settled, stage))),
        };

        let distance = match (fingerprint(&settled), fingerprint(&frozen)) {
            (Ok(a), Ok(b)) => hamming_distance(&a, &b),
            _ => crate::MAX_FINGERPRINT_DISTANCE,
        };
        if distance > settle_cfg.repause_threshold {
            debug!(distance, "freezing changed the frame, settling again");
            let png = match settle(|| sub.screenshot_element(stage), &settle_cfg.syndicated).await {
                Ok(png) => png,
                Err(e) if e.is_transport() => return Err(e),
                Err(_) => frozen,
            };
            return Ok(Some((png, stage)));
        }
        Ok(Some((frozen, stage)))
    }

    async fn capture_syndicated(
        &self,
        page: &dyn CreativePage,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let mut candidates: Vec<String> = Vec::new();
        if variant.dom_position > 0 {
            if let Some(tile) = locate_tile(page, variant.dom_position, variant.variant_index).await? {
                if let Err(e) = page.activate(&tile).await {
                    if e.is_transport() {
                        return Err(e);
                    }
                }
                candidates.extend(SYNDICATED_ROOTS.iter().map(|r| format!("{tile} {r}")));
            }
        } else {
            candidates.push(variant.dom_locator.clone());
        }
        candidates.extend(SYNDICATED_ROOTS.iter().map(|s| s.to_string()));

        let mut root = None;
        for candidate in candidates {
            if page.exists(&candidate).await? {
                root = Some(candidate);
                break;
            }
        }

        if page.is_visible(POLICY_BANNER).await? {
            return Ok(VariantStep::Terminal(TerminalStatus::RemovedForPolicyViolation));
        }
        let root = root.ok_or_else(|| CaptureError::ElementNotFound("syndicated tile root".to_string()))?;

        page.unclip_ancestors(&root).await?;
        let png = settle(|| page.screenshot_element(&root), &self.config.settle.syndicated).await?;

        let mut clicks = Vec::new();
        if let Some(inner) = page.frame(&format!("{root} iframe")).await? {
            clicks = collect_click_urls(inner.as_ref(), None).await?;
        }
        if clicks.is_empty() {
            clicks = collect_click_urls(page, Some("creative-details")).await?;
        }

        let target = if variant.dom_position > 0 {
            "syndicated_tile"
        } else {
            "syndicated_host"
        };
        Ok(VariantStep::Captured {
            capture: CaptureResult::screenshot(png, target),
            clicks,
        })
    }

    /// Canvas in the page, canvas inside the frame, then a clipped screenshot
    /// of the frame's box on the host page.
    async fn capture_generic_frame(
        &self,
        page: &dyn CreativePage,
        variant: &Variant,
    ) -> Result<VariantStep, CaptureError> {
        let locator = variant.dom_locator.as_str();

        let is_canvas = page
            .elements(locator)
            .await?
            .first()
            .map(|e| e.tag == "canvas")
            .unwrap_or(false);
        if is_canvas {
            let png = page.screenshot_element(locator).await?;
            return Ok(VariantStep::Captured {
                capture: CaptureResult::screenshot(png, locator),
                clicks: Vec::new(),
            });
        }

        let frame = page.frame(locator).await?;
        if let Some(frame) = &frame {
            for _ in 0..NESTED_CANVAS_POLLS {
                if frame.exists(SINGLE_AD_CANVAS).await? {
                    break;
                }
                tokio::time::sleep(NESTED_CANVAS_POLL).await;
            }
            if frame.exists(SINGLE_AD_CANVAS).await? {
                match frame.screenshot_element(SINGLE_AD_CANVAS).await {
                    Ok(png) => {
                        let clicks = collect_click_urls(frame.as_ref(), None).await?;
                        return Ok(VariantStep::Captured {
                            capture: CaptureResult::screenshot(png, SINGLE_AD_CANVAS),
                            clicks,
                        });
                    }
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => debug!(error = %e, "nested canvas screenshot failed"),
                }
            }
        }

        let rect = page
            .bounding_box(locator)
            .await?
            .filter(|r| r.is_at_least(MIN_CLIP_SIDE, MIN_CLIP_SIDE))
            .ok_or_else(|| CaptureError::ElementNotFound(format!("{locator} has no usable box")))?;
        let png = page.screenshot_clip(rect).await?;
        debug!(locator, "clipped frame screenshot");

        let clicks = match &frame {
            Some(frame) => collect_click_urls(frame.as_ref(), None).await?,
            None => Vec::new(),
        };
        Ok(VariantStep::Captured {
            capture: CaptureResult::screenshot(png, frame_label(locator)),
            clicks,
        })
    }

    async fn finish_terminal(&self, item: &WorkItem, status: TerminalStatus) -> Result<ItemOutcome, CaptureError> {
        info!(event = "item_terminal", status = status.as_str());
        self.recorder
            .record_status(&item.item_id, PRIMARY_VARIANT_ID, ItemStatus::Terminal(status), None)
            .await?;
        Ok(ItemOutcome::Terminal)
    }

    /// Nothing was captured. The page may have turned terminal meanwhile.
    async fn finish_without_capture(
        &self,
        page: &dyn CreativePage,
        item: &WorkItem,
        reason: &str,
    ) -> Result<ItemOutcome, CaptureError> {
        if let Some(status) = detect_terminal(page, &self.config.timeouts).await? {
            return self.finish_terminal(item, status).await;
        }
        warn!(event = "item_error", reason);
        self.recorder
            .record_status(&item.item_id, PRIMARY_VARIANT_ID, ItemStatus::Error, Some(reason))
            .await?;
        Ok(ItemOutcome::Error)
    }

    /// Page HTML and frame inventory, when enabled. Never fails the item.
    async fn dump_debug_artifacts(&self, page: &dyn CreativePage, name: &str) {
        let debug_cfg = &self.config.debug;
        if debug_cfg.dump_html {
            let path = debug_cfg.dir.join(format!("{}.html", sanitize_filename(name)));
            let written = async {
                let html = page.content().await?;
                tokio::fs::create_dir_all(&debug_cfg.dir).await?;
                tokio::fs::write(&path, html).await?;
                Ok::<_, CaptureError>(())
            }
            .await;
            match written {
                Ok(()) => debug!(path = %path.display(), "page html dumped"),
                Err(e) => warn!(event = "debug_html_failed", error = %e),
            }
        }

        if debug_cfg.frame_inventory {
            match page.elements("iframe").await {
                Ok(frames) => {
                    let inventory: Vec<String> = frames
                        .iter()
                        .map(|f| {
                            format!(
                                "id={} src={} visible={}",
                                f.id.as_deref().unwrap_or("-"),
                                f.src.as_deref().unwrap_or("-"),
                                f.visible
                            )
                        })
                        .collect();
                    info!(event = "frame_inventory", frames = inventory.len(), inventory = ?inventory);
                }
                Err(e) => warn!(event = "frame_inventory_failed", error = %e),
            }
        }
    }
}

fn frame_label(locator: &str) -> String {
    locator
        .strip_prefix("iframe[id='")
        .and_then(|rest| rest.strip_suffix("']"))
        .map(|id| format!("iframe#{id}"))
        .unwrap_or_else(|| "iframe".to_string())
}

//! Renderer resolution
//!
//! The portal renders a creative in one of a handful of known DOM shapes. Each
//! shape is a [`VariantTemplate`]; a [`Resolver`] tries its templates in
//! priority order and returns the variants of the first one that matches.
//! Supporting a new shape means adding a template, not editing the others.

use crate::{css_quote, join_url, CaptureError, CaptureProfile, CreativePage, ElementInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Carousel layouts never show more than three tiles.
pub const MAX_TILES: usize = 3;

pub const CREATIVE_SCOPE: &str = "creative-details, .creative-details-container";
pub const SINGLE_AD_CANVAS: &str = "#single-ad-canvas";

const CAROUSEL_TILES: &str = "div.creative-container.creative-carousel > div.creative-sub-container";
const LOOSE_TILES: &str = "div.creative-container .creative-sub-container";
const LONE_SYNDICATED: &str = "div.creative-container fletch-renderer";

const TILE_FRAMES: [&str; 3] = [
    "creative > div > div > html-renderer > div > iframe",
    "creative > div > html-renderer > div > iframe",
    "creative html-renderer iframe",
];
const TILE_IMAGES: [&str; 3] = [
    "creative > div > div > html-renderer > div > img",
    "creative > div > html-renderer > div > img",
    "creative html-renderer img",
];
const TILE_SYNDICATED: [&str; 4] = [
    "fletch-renderer",
    "creative fletch-renderer",
    "creative > div fletch-renderer",
    "creative > div > div > fletch-renderer",
];

const SINGLE_FRAMES: [&str; 5] = [
    "creative-details html-renderer iframe",
    ".creative-details-container creative html-renderer iframe",
    "creative html-renderer iframe",
    "div.creative-container html-renderer iframe",
    "div.creative-container iframe",
];

/// Root elements of a syndicated tile rendered into the host page.
pub const SYNDICATED_ROOTS: [&str; 2] = ["fletch-renderer", "[id^='fletch-render']"];
const SYNDICATED_INNER_FRAMES: &str = "iframe[id^='google_ad_'], iframe[name^='google_ads_iframe_'], \
     iframe[src*='discover_ads'], iframe[src*='googleads']";

const PLAIN_IMAGES: &str = "creative-details img, .creative-details-container img";
const TARGETING_IMAGES: &str = "targeting-criteria img";

const BUNDLE_FRAMES: &str = "iframe[src*='sadbundle']";
const CREATIVE_FRAMES: &str = "creative-details iframe, .creative-details-container iframe";
const TARGETING_FRAMES: &str = "targeting-criteria iframe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RendererKind {
    /// `<img>` inside a carousel tile
    EmbeddedImage,
    /// Self-contained bundle document ("sadbundle") loaded in an iframe
    AnimatedBundle,
    /// Syndicated tile ("fletch") painted into the host page
    SyndicatedTile,
    /// Bare `<img>` in the creative container
    PlainImage,
    /// Any other creative iframe; text ads
    IframeGeneric,
}

impl RendererKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RendererKind::EmbeddedImage => "embedded-image",
            RendererKind::AnimatedBundle => "animated-bundle",
            RendererKind::SyndicatedTile => "syndicated-tile",
            RendererKind::PlainImage => "plain-image",
            RendererKind::IframeGeneric => "iframe-generic",
        }
    }
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One capturable rendering of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// 1-based
    pub variant_index: usize,
    pub kind: RendererKind,
    /// Absolute URL of the frame or image, or empty when not yet loaded.
    pub source_reference: String,
    /// Selector addressing the variant's element on the host page.
    pub dom_locator: String,
    /// 0 for standalone creatives, otherwise the tile's child position.
    pub dom_position: usize,
}

impl Variant {
    pub fn variant_id(&self) -> String {
        format!("v{}", self.variant_index)
    }
}

/// Inputs a template may need beyond the page itself.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub page_url: String,
    /// Bound for waiting on a shape that may still be rendering.
    pub probe_timeout: Duration,
}

/// One known DOM shape.
#[async_trait]
pub trait VariantTemplate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Variants in discovery order, or none if the shape is absent.
    async fn discover(
        &self,
        page: &dyn CreativePage,
        ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError>;
}

pub struct Resolver {
    templates: Vec<Box<dyn VariantTemplate>>,
}

impl Resolver {
    pub fn new(templates: Vec<Box<dyn VariantTemplate>>) -> Self {
        Self { templates }
    }

    pub fn for_profile(profile: CaptureProfile) -> Self {
        match profile {
            CaptureProfile::Image => Self::image(),
            CaptureProfile::Text => Self::text(),
        }
    }

    /// Carousel, single frame, syndicated host, plain images.
    pub fn image() -> Self {
        Self::new(vec![
            Box::new(CarouselTemplate),
            Box::new(SingleFrameTemplate),
            Box::new(SyndicatedHostTemplate),
            Box::new(PlainImageTemplate),
        ])
    }

    /// Page canvas, bundle frames, generic creative frames.
    pub fn text() -> Self {
        Self::new(vec![
            Box::new(PageCanvasTemplate),
            Box::new(BundleFramesTemplate),
            Box::new(CreativeFramesTemplate),
        ])
    }

    pub fn template_names(&self) -> Vec<&'static str> {
        self.templates.iter().map(|t| t.name()).collect()
    }

    /// Variants of the first matching template. Transport failures propagate;
    /// any other template failure counts as "no match".
    pub async fn resolve(
        &self,
        page: &dyn CreativePage,
        ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        for template in &self.templates {
            match template.discover(page, ctx).await {
                Ok(variants) if !variants.is_empty() => {
                    debug!(
                        template = template.name(),
                        variants = variants.len(),
                        "Resolved renderer template"
                    );
                    return Ok(variants);
                }
                Ok(_) => {}
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!(template = template.name(), error = %e, "Template probe failed");
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Selector candidates for the tile at child position `dom_position`, most
/// specific first.
pub fn tile_selector_candidates(dom_position: usize, variant_index: usize) -> Vec<String> {
    if dom_position == 0 || variant_index == 0 {
        return Vec::new();
    }
    vec![
        format!(".creative-container.creative-carousel > div:nth-child({dom_position})"),
        format!(".creative-container > div.creative-sub-container:nth-of-type({variant_index})"),
        format!(".creative-container > div.creative-sub-container:nth-child({dom_position})"),
        format!(".creative-container > div:nth-child({dom_position})"),
    ]
}

/// First candidate present on the page, else the most specific one.
pub async fn locate_tile(
    page: &dyn CreativePage,
    dom_position: usize,
    variant_index: usize,
) -> Result<Option<String>, CaptureError> {
    let candidates = tile_selector_candidates(dom_position, variant_index);
    for candidate in &candidates {
        if page.exists(candidate).await? {
            return Ok(Some(candidate.clone()));
        }
    }
    Ok(candidates.into_iter().next())
}

/// `root sel` for each selector, joined into one selector list.
pub fn within(root: &str, selectors: &[&str]) -> String {
    selectors
        .iter()
        .map(|s| format!("{root} {s}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Up to three carousel tiles, each classified by what it holds. Tile `i`
/// always becomes variant `i`, even when a neighbouring tile is unrecognized.
pub struct CarouselTemplate;

#[async_trait]
impl VariantTemplate for CarouselTemplate {
    fn name(&self) -> &'static str {
        "carousel"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        _ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        let mut tiles = page.count(CAROUSEL_TILES).await?;
        if tiles == 0 {
            tiles = page.count(LOOSE_TILES).await?;
        }

        let mut out = Vec::new();
        for variant_index in 1..=tiles.min(MAX_TILES) {
            // The first child of the container is the carousel header.
            let dom_position = variant_index + 1;
            let Some(tile) = locate_tile(page, dom_position, variant_index).await? else {
                continue;
            };

            let frames = within(&tile, &TILE_FRAMES);
            let images = within(&tile, &TILE_IMAGES);
            let (kind, dom_locator, source) = if page.exists(&frames).await? {
                let src = page.attribute(&frames, "src").await?.unwrap_or_default();
                (RendererKind::AnimatedBundle, frames, src)
            } else if page.exists(&images).await? {
                let src = page.attribute(&images, "src").await?.unwrap_or_default();
                (RendererKind::EmbeddedImage, images, src)
            } else if page.exists(&within(&tile, &TILE_SYNDICATED)).await? {
                (RendererKind::SyndicatedTile, tile.clone(), String::new())
            } else {
                debug!(variant_index, tile = %tile, "Skipping unrecognized carousel tile");
                continue;
            };

            out.push(Variant {
                variant_index,
                kind,
                source_reference: source,
                dom_locator,
                dom_position,
            });
        }

        if out.is_empty() && tiles == 0 {
            let lone = page.count(LONE_SYNDICATED).await?;
            for variant_index in 1..=lone {
                out.push(Variant {
                    variant_index,
                    kind: RendererKind::SyndicatedTile,
                    source_reference: String::new(),
                    dom_locator: format!("{LONE_SYNDICATED}:nth-of-type({variant_index})"),
                    dom_position: 0,
                });
            }
        }
        Ok(out)
    }
}

/// One creative frame outside any carousel.
pub struct SingleFrameTemplate;

#[async_trait]
impl VariantTemplate for SingleFrameTemplate {
    fn name(&self) -> &'static str {
        "single-frame"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        if !page.wait_for(&SINGLE_FRAMES.join(", "), ctx.probe_timeout).await? {
            return Ok(Vec::new());
        }
        for selector in SINGLE_FRAMES {
            if page.exists(selector).await? {
                let src = page.attribute(selector, "src").await?.unwrap_or_default();
                return Ok(vec![Variant {
                    variant_index: 1,
                    kind: RendererKind::AnimatedBundle,
                    source_reference: src,
                    dom_locator: selector.to_string(),
                    dom_position: 0,
                }]);
            }
        }
        Ok(Vec::new())
    }
}

/// Whether a document carries the syndicated-tile signature: a known root id,
/// one of the well-known anchors, a known inner ad frame, or the `adData`
/// global.
pub async fn has_syndicated_signature(page: &dyn CreativePage) -> Result<bool, CaptureError> {
    if page.exists(SYNDICATED_ROOTS[1]).await? {
        return Ok(true);
    }
    for anchor in crate::WELL_KNOWN_ANCHORS {
        if page.exists(anchor).await? {
            return Ok(true);
        }
    }
    if page.exists(SYNDICATED_INNER_FRAMES).await? {
        return Ok(true);
    }
    Ok(matches!(
        page.global_json("adData").await?,
        Some(serde_json::Value::Object(_))
    ))
}

/// Syndicated tile painted directly into the host page.
pub struct SyndicatedHostTemplate;

#[async_trait]
impl VariantTemplate for SyndicatedHostTemplate {
    fn name(&self) -> &'static str {
        "syndicated-host"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        _ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        if !has_syndicated_signature(page).await? {
            return Ok(Vec::new());
        }

        let mut root = SYNDICATED_ROOTS[0];
        for candidate in SYNDICATED_ROOTS {
            if page.exists(candidate).await? {
                root = candidate;
                break;
            }
        }
        Ok(vec![Variant {
            variant_index: 1,
            kind: RendererKind::SyndicatedTile,
            source_reference: String::new(),
            dom_locator: root.to_string(),
            dom_position: 0,
        }])
    }
}

/// Inline images in the creative container, excluding the targeting panel.
/// Each distinct source is its own variant.
pub struct PlainImageTemplate;

#[async_trait]
impl VariantTemplate for PlainImageTemplate {
    fn name(&self) -> &'static str {
        "plain-image"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        if !page.wait_for(PLAIN_IMAGES, ctx.probe_timeout).await? {
            return Ok(Vec::new());
        }

        let excluded = page.attributes(TARGETING_IMAGES, "src").await?;
        let mut sources: Vec<String> = Vec::new();
        for raw in page.attributes(PLAIN_IMAGES, "src").await? {
            if excluded.contains(&raw) {
                continue;
            }
            let Some(src) = join_url(&ctx.page_url, &raw) else {
                continue;
            };
            if src.starts_with("http") && !sources.contains(&src) {
                sources.push(src);
            }
        }

        Ok(sources
            .into_iter()
            .enumerate()
            .map(|(i, src)| Variant {
                variant_index: i + 1,
                kind: RendererKind::PlainImage,
                dom_locator: format!("img[src={}]", css_quote(&src)),
                source_reference: src,
                dom_position: 0,
            })
            .collect())
    }
}

/// Text ad drawn on a canvas directly in the host page.
pub struct PageCanvasTemplate;

#[async_trait]
impl VariantTemplate for PageCanvasTemplate {
    fn name(&self) -> &'static str {
        "page-canvas"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        _ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        if !page.exists(SINGLE_AD_CANVAS).await? {
            return Ok(Vec::new());
        }
        Ok(vec![Variant {
            variant_index: 1,
            kind: RendererKind::IframeGeneric,
            source_reference: String::new(),
            dom_locator: SINGLE_AD_CANVAS.to_string(),
            dom_position: 0,
        }])
    }
}

/// Explicit bundle frames, navigated separately.
pub struct BundleFramesTemplate;

#[async_trait]
impl VariantTemplate for BundleFramesTemplate {
    fn name(&self) -> &'static str {
        "bundle-frames"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        let mut out = Vec::new();
        for raw in page.attributes(BUNDLE_FRAMES, "src").await? {
            let Some(src) = join_url(&ctx.page_url, &raw) else {
                continue;
            };
            out.push(Variant {
                variant_index: out.len() + 1,
                kind: RendererKind::AnimatedBundle,
                dom_locator: format!("iframe[src={}]", css_quote(&raw)),
                source_reference: src,
                dom_position: 0,
            });
        }
        Ok(out)
    }
}

/// Visible, ad-sized creative iframes whose id or source marks them as ad
/// frames.
pub struct CreativeFramesTemplate;

impl CreativeFramesTemplate {
    fn looks_like_ad(frame: &ElementInfo) -> bool {
        let id = frame.id.as_deref().unwrap_or_default();
        let src = frame.src.as_deref().unwrap_or_default();
        let marked = id.starts_with("fletch-render-") || id.contains("_preview_") || src.contains("/adframe");
        let sized = frame.rect.map(|r| r.is_at_least(200.0, 150.0)).unwrap_or(false);
        frame.visible && marked && sized
    }
}

#[async_trait]
impl VariantTemplate for CreativeFramesTemplate {
    fn name(&self) -> &'static str {
        "creative-frames"
    }

    async fn discover(
        &self,
        page: &dyn CreativePage,
        _ctx: &ResolveContext,
    ) -> Result<Vec<Variant>, CaptureError> {
        let targeting = page.elements(TARGETING_FRAMES).await?;
        let mut out = Vec::new();

        for frame in page.elements(CREATIVE_FRAMES).await? {
            if targeting.contains(&frame) || !Self::looks_like_ad(&frame) {
                continue;
            }
            let dom_locator = match (&frame.id, &frame.src) {
                (Some(id), _) => format!("iframe[id={}]", css_quote(id)),
                (None, Some(src)) => format!("iframe[src={}]", css_quote(src)),
                (None, None) => continue,
            };
            out.push(Variant {
                variant_index: out.len() + 1,
                kind: RendererKind::IframeGeneric,
                source_reference: frame.src.clone().unwrap_or_default(),
                dom_locator,
                dom_position: 0,
            });
        }
        Ok(out)
    }
}

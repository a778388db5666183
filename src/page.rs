//! Page capability used by the resolver and the capture paths
//!
//! The pipeline never talks to the browser protocol directly. Everything it
//! needs from a loaded document is expressed through [`CreativePage`]:
//! selector queries, attribute reads, computed visibility, bounded waits and
//! screenshots. [`crate::ChromePage`] implements it over DevTools; tests use
//! scripted fakes.

use crate::CaptureError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rectangle in CSS pixels relative to the top-level document.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_at_least(&self, width: f64, height: f64) -> bool {
        self.width >= width && self.height >= height
    }
}

/// Snapshot of one element matched by a selector.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ElementInfo {
    pub tag: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub src: Option<String>,
    pub rect: Option<Rect>,
    pub visible: bool,
}

/// Everything the capture pipeline may ask of a loaded document.
///
/// Selectors are plain CSS. Queries that match nothing return an empty or
/// negative answer rather than an error; errors are reserved for a page that
/// could not be asked at all.
#[async_trait]
pub trait CreativePage: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), CaptureError>;

    async fn url(&self) -> Result<String, CaptureError>;

    async fn title(&self) -> Result<String, CaptureError>;

    async fn content(&self) -> Result<String, CaptureError>;

    async fn exists(&self, selector: &str) -> Result<bool, CaptureError> {
        Ok(self.count(selector).await? > 0)
    }

    async fn count(&self, selector: &str) -> Result<usize, CaptureError>;

    /// Attribute of the first match.
    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, CaptureError> {
        Ok(self.attributes(selector, name).await?.into_iter().next())
    }

    /// Non-empty attribute values of every match, in document order.
    async fn attributes(&self, selector: &str, name: &str) -> Result<Vec<String>, CaptureError>;

    async fn elements(&self, selector: &str) -> Result<Vec<ElementInfo>, CaptureError>;

    /// Rendered, non-zero sized, and not hidden by any ancestor.
    async fn is_visible(&self, selector: &str) -> Result<bool, CaptureError>;

    /// Returns `false` when the selector did not appear in time.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, CaptureError>;

    async fn bounding_box(&self, selector: &str) -> Result<Option<Rect>, CaptureError>;

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, CaptureError>;

    async fn screenshot_clip(&self, rect: Rect) -> Result<Vec<u8>, CaptureError>;

    async fn screenshot_page(&self) -> Result<Vec<u8>, CaptureError>;

    /// Unhide the element, scroll it into view and click it so lazy content loads.
    async fn activate(&self, selector: &str) -> Result<(), CaptureError>;

    /// Neutralize `overflow`/`clip` on every ancestor of the element.
    async fn unclip_ancestors(&self, selector: &str) -> Result<(), CaptureError>;

    /// Freeze CSS animations and transitions in the document.
    async fn pause_animations(&self) -> Result<(), CaptureError>;

    /// JSON value of a global variable, if it exists and serializes.
    async fn global_json(&self, name: &str) -> Result<Option<serde_json::Value>, CaptureError>;

    /// Page scoped to the content document of a same-origin frame.
    async fn frame(&self, selector: &str) -> Result<Option<Box<dyn CreativePage>>, CaptureError>;

    async fn close(&self) -> Result<(), CaptureError>;
}

/// Source of fresh pages. One session belongs to exactly one worker.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn CreativePage>, CaptureError>;

    /// Release the underlying browser. Further calls may fail.
    async fn shutdown(&self) {}
}

/// CSS string literal for use inside attribute selectors.
pub fn css_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_size_check() {
        let r = Rect::new(0.0, 0.0, 300.0, 250.0);
        assert!(r.is_at_least(200.0, 150.0));
        assert!(!Rect::new(0.0, 0.0, 199.0, 250.0).is_at_least(200.0, 150.0));
    }

    #[test]
    fn css_quote_escapes() {
        assert_eq!(css_quote("fletch-render-1"), "'fletch-render-1'");
        assert_eq!(css_quote("a'b"), "'a\\'b'");
    }
}

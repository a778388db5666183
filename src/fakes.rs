//! Scripted test doubles for the page, browser and fetch seams

use crate::{
    BrowserLauncher, BrowserSession, ByteFetcher, CaptureError, CreativePage, ElementInfo, Rect,
};
use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    encode(RgbaImage::from_pixel(width, height, Rgba(color)))
}

/// Distinct, visually structured image per `seed`.
pub fn pattern_png(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let band = ((x * 8 / width.max(1)) + (y * 8 / height.max(1)) + seed) % 2;
        if (band + seed / 2) % 2 == 0 {
            Rgba([20, 40, 200, 255])
        } else {
            Rgba([250, 220, 10, 255])
        }
    });
    encode(img)
}

fn encode(img: RgbaImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageOutputFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

/// Shared record of what the pipeline did to fake pages.
#[derive(Debug, Default)]
pub struct Journal {
    visits: Mutex<Vec<String>>,
    activated: Mutex<Vec<String>>,
    screenshots: AtomicUsize,
    pauses: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
}

impl Journal {
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    pub fn activated(&self) -> Vec<String> {
        self.activated.lock().unwrap().clone()
    }

    pub fn screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }
}

/// Frames returned by successive screenshots; the last one repeats.
#[derive(Debug, Default)]
struct ShotScript {
    queue: VecDeque<Result<Vec<u8>, CaptureError>>,
    last: Option<Vec<u8>>,
}

impl ShotScript {
    fn next(&mut self, what: &str) -> Result<Vec<u8>, CaptureError> {
        match self.queue.pop_front() {
            Some(Ok(bytes)) => {
                self.last = Some(bytes.clone());
                Ok(bytes)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .clone()
                .ok_or_else(|| CaptureError::CaptureFailed(format!("no screenshot scripted for {what}"))),
        }
    }
}

#[derive(Debug, Default)]
struct FakeDoc {
    url: String,
    title: String,
    html: String,
    counts: HashMap<String, usize>,
    attrs: HashMap<(String, String), Vec<String>>,
    elements: HashMap<String, Vec<ElementInfo>>,
    visible: Vec<String>,
    visible_after: HashMap<String, usize>,
    visibility_checks: Mutex<HashMap<String, usize>>,
    boxes: HashMap<String, Rect>,
    globals: HashMap<String, serde_json::Value>,
    frames: HashMap<String, Arc<FakeDoc>>,
    element_shots: HashMap<String, Mutex<ShotScript>>,
    clip_shots: Mutex<ShotScript>,
    page_shots: Mutex<ShotScript>,
}

impl FakeDoc {
    /// Selector lists without an exact entry are answered part by part.
    fn parts(selector: &str) -> Vec<&str> {
        selector.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
    }

    fn count_exact(&self, selector: &str) -> usize {
        let attrs = self
            .attrs
            .iter()
            .filter(|((sel, _), _)| sel == selector)
            .map(|(_, v)| v.len())
            .max()
            .unwrap_or(0);
        let elements = self.elements.get(selector).map_or(0, Vec::len);
        let shots = usize::from(self.element_shots.contains_key(selector) || self.boxes.contains_key(selector));
        let frames = usize::from(self.frames.contains_key(selector));
        [self.counts.get(selector).copied().unwrap_or(0), attrs, elements, shots, frames]
            .into_iter()
            .max()
            .unwrap_or(0)
    }

    fn count(&self, selector: &str) -> usize {
        let exact = self.count_exact(selector);
        if exact > 0 || !selector.contains(',') {
            return exact;
        }
        Self::parts(selector).into_iter().map(|p| self.count_exact(p)).sum()
    }

    fn attributes(&self, selector: &str, name: &str) -> Vec<String> {
        if let Some(values) = self.attrs.get(&(selector.to_string(), name.to_string())) {
            return values.clone();
        }
        if !selector.contains(',') {
            return Vec::new();
        }
        Self::parts(selector)
            .into_iter()
            .flat_map(|p| {
                self.attrs
                    .get(&(p.to_string(), name.to_string()))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    fn first_part_with<'a>(&self, selector: &'a str) -> &'a str {
        if self.count_exact(selector) > 0 {
            return selector;
        }
        Self::parts(selector)
            .into_iter()
            .find(|p| self.count_exact(p) > 0)
            .unwrap_or(selector)
    }
}

/// Scripted document. Built with the `with_*` methods, then used through
/// [`CreativePage`]. Tabs opened by [`FakeBrowser`] switch documents on
/// `goto` according to the browser's routes.
pub struct FakePage {
    doc: Mutex<Arc<FakeDoc>>,
    routes: Arc<HashMap<String, Route>>,
    journal: Arc<Journal>,
}

#[derive(Debug, Clone)]
enum Route {
    Doc(Arc<FakeDoc>),
    Fail(CaptureError),
}

impl Default for FakePage {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            doc: Mutex::new(Arc::new(FakeDoc::default())),
            routes: Arc::new(HashMap::new()),
            journal: Arc::new(Journal::default()),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut FakeDoc)) -> Self {
        let doc = Arc::get_mut(self.doc.get_mut().unwrap()).expect("fake page is still being built");
        f(doc);
        self
    }

    fn current(&self) -> Arc<FakeDoc> {
        self.doc.lock().unwrap().clone()
    }

    fn into_doc(self) -> Arc<FakeDoc> {
        self.doc.into_inner().unwrap()
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }

    pub fn with_url(self, url: &str) -> Self {
        self.edit(|d| d.url = url.to_string())
    }

    pub fn with_title(self, title: &str) -> Self {
        self.edit(|d| d.title = title.to_string())
    }

    pub fn with_html(self, html: &str) -> Self {
        self.edit(|d| d.html = html.to_string())
    }

    pub fn with_count(self, selector: &str, n: usize) -> Self {
        self.edit(|d| {
            d.counts.insert(selector.to_string(), n);
        })
    }

    pub fn with_visible(self, selector: &str) -> Self {
        self.edit(|d| {
            d.counts.entry(selector.to_string()).or_insert(1);
            d.visible.push(selector.to_string());
        })
    }

    /// Present from the start, but hidden for the first `checks` visibility
    /// checks. Models a banner the portal renders late.
    pub fn with_visible_after(self, selector: &str, checks: usize) -> Self {
        self.edit(|d| {
            d.counts.entry(selector.to_string()).or_insert(1);
            d.visible_after.insert(selector.to_string(), checks);
        })
    }

    pub fn with_attrs(self, selector: &str, name: &str, values: &[&str]) -> Self {
        self.edit(|d| {
            d.attrs.insert(
                (selector.to_string(), name.to_string()),
                values.iter().map(|v| v.to_string()).collect(),
            );
        })
    }

    pub fn with_elements(self, selector: &str, elements: Vec<ElementInfo>) -> Self {
        self.edit(|d| {
            d.elements.insert(selector.to_string(), elements);
        })
    }

    pub fn with_box(self, selector: &str, rect: Rect) -> Self {
        self.edit(|d| {
            d.boxes.insert(selector.to_string(), rect);
        })
    }

    pub fn with_global(self, name: &str, value: serde_json::Value) -> Self {
        self.edit(|d| {
            d.globals.insert(name.to_string(), value);
        })
    }

    pub fn with_frame(self, selector: &str, frame: FakePage) -> Self {
        let inner = frame.into_doc();
        self.edit(|d| {
            d.frames.insert(selector.to_string(), inner);
        })
    }

    /// Successive element screenshots of `selector`.
    pub fn with_shots(self, selector: &str, frames: Vec<Vec<u8>>) -> Self {
        self.with_shot_results(selector, frames.into_iter().map(Ok).collect())
    }

    pub fn with_shot_results(self, selector: &str, frames: Vec<Result<Vec<u8>, CaptureError>>) -> Self {
        self.edit(|d| {
            d.element_shots.insert(
                selector.to_string(),
                Mutex::new(ShotScript {
                    queue: frames.into(),
                    last: None,
                }),
            );
        })
    }

    pub fn with_clip_shots(self, frames: Vec<Vec<u8>>) -> Self {
        self.edit(|d| {
            d.clip_shots = Mutex::new(ShotScript {
                queue: frames.into_iter().map(Ok).collect(),
                last: None,
            });
        })
    }

    pub fn with_page_shots(self, frames: Vec<Vec<u8>>) -> Self {
        self.edit(|d| {
            d.page_shots = Mutex::new(ShotScript {
                queue: frames.into_iter().map(Ok).collect(),
                last: None,
            });
        })
    }

    fn screenshot_taken(&self) {
        self.journal.screenshots.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CreativePage for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), CaptureError> {
        self.journal.visits.lock().unwrap().push(url.to_string());
        match self.routes.get(url) {
            Some(Route::Doc(doc)) => {
                *self.doc.lock().unwrap() = doc.clone();
                Ok(())
            }
            Some(Route::Fail(e)) => Err(e.clone()),
            None => Err(CaptureError::Navigation(format!("{url}: no route"))),
        }
    }

    async fn url(&self) -> Result<String, CaptureError> {
        Ok(self.current().url.clone())
    }

    async fn title(&self) -> Result<String, CaptureError> {
        Ok(self.current().title.clone())
    }

    async fn content(&self) -> Result<String, CaptureError> {
        Ok(self.current().html.clone())
    }

    async fn count(&self, selector: &str) -> Result<usize, CaptureError> {
        Ok(self.current().count(selector))
    }

    async fn attributes(&self, selector: &str, name: &str) -> Result<Vec<String>, CaptureError> {
        Ok(self.current().attributes(selector, name))
    }

    async fn elements(&self, selector: &str) -> Result<Vec<ElementInfo>, CaptureError> {
        Ok(self.current().elements.get(selector).cloned().unwrap_or_default())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, CaptureError> {
        let doc = self.current();
        if doc.visible.iter().any(|s| s == selector) {
            return Ok(true);
        }
        if let Some(&hidden_for) = doc.visible_after.get(selector) {
            let mut checks = doc.visibility_checks.lock().unwrap();
            let seen = checks.entry(selector.to_string()).or_insert(0);
            *seen += 1;
            return Ok(*seen > hidden_for);
        }
        Ok(doc
            .elements
            .get(selector)
            .and_then(|e| e.first())
            .map(|e| e.visible)
            .unwrap_or(false))
    }

    async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<bool, CaptureError> {
        Ok(self.current().count(selector) > 0)
    }

    async fn bounding_box(&self, selector: &str) -> Result<Option<Rect>, CaptureError> {
        let doc = self.current();
        if let Some(rect) = doc.boxes.get(selector) {
            return Ok(Some(*rect));
        }
        Ok(doc.elements.get(selector).and_then(|e| e.first()).and_then(|e| e.rect))
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, CaptureError> {
        let doc = self.current();
        let key = doc.first_part_with(selector);
        let Some(script) = doc.element_shots.get(key) else {
            return Err(CaptureError::ElementNotFound(selector.to_string()));
        };
        self.screenshot_taken();
        let shot = script.lock().unwrap().next(selector);
        shot
    }

    async fn screenshot_clip(&self, rect: Rect) -> Result<Vec<u8>, CaptureError> {
        self.screenshot_taken();
        let shot = self.current().clip_shots.lock().unwrap().next(&format!("clip {rect:?}"));
        shot
    }

    async fn screenshot_page(&self) -> Result<Vec<u8>, CaptureError> {
        self.screenshot_taken();
        let shot = self.current().page_shots.lock().unwrap().next("page");
        shot
    }

    async fn activate(&self, selector: &str) -> Result<(), CaptureError> {
        self.journal.activated.lock().unwrap().push(selector.to_string());
        if self.current().count(selector) == 0 {
            return Err(CaptureError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn unclip_ancestors(&self, _selector: &str) -> Result<(), CaptureError> {
        Ok(())
    }

    async fn pause_animations(&self) -> Result<(), CaptureError> {
        self.journal.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn global_json(&self, name: &str) -> Result<Option<serde_json::Value>, CaptureError> {
        Ok(self.current().globals.get(name).cloned())
    }

    async fn frame(&self, selector: &str) -> Result<Option<Box<dyn CreativePage>>, CaptureError> {
        let doc = self.current();
        Ok(doc.frames.get(selector).map(|inner| {
            Box::new(FakePage {
                doc: Mutex::new(inner.clone()),
                routes: Arc::new(HashMap::new()),
                journal: self.journal.clone(),
            }) as Box<dyn CreativePage>
        }))
    }

    async fn close(&self) -> Result<(), CaptureError> {
        self.journal.pages_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Browser whose tabs serve scripted documents per URL.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    routes: HashMap<String, Route>,
    journal: Arc<Journal>,
    failing_pages: Arc<AtomicUsize>,
}

impl FakeBrowser {
    pub fn route(mut self, url: &str, page: FakePage) -> Self {
        let doc = page.with_url(url).into_doc();
        self.routes.insert(url.to_string(), Route::Doc(doc));
        self
    }

    /// Navigating to `url` fails with `error`.
    pub fn route_error(mut self, url: &str, error: CaptureError) -> Self {
        self.routes.insert(url.to_string(), Route::Fail(error));
        self
    }

    /// The next `n` tabs fail to open with a transport error.
    pub fn failing_new_pages(self, n: usize) -> Self {
        self.failing_pages.store(n, Ordering::SeqCst);
        self
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }
}

#[async_trait]
impl BrowserSession for FakeBrowser {
    async fn new_page(&self) -> Result<Box<dyn CreativePage>, CaptureError> {
        let fail = self
            .failing_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(CaptureError::Transport("target closed".to_string()));
        }

        self.journal.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            doc: Mutex::new(Arc::new(FakeDoc {
                url: "about:blank".to_string(),
                ..Default::default()
            })),
            routes: Arc::new(self.routes.clone()),
            journal: self.journal.clone(),
        }))
    }
}

/// Launcher producing a fresh browser from `factory` on every launch.
pub struct FakeLauncher {
    factory: Box<dyn Fn() -> FakeBrowser + Send + Sync>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(factory: impl Fn() -> FakeBrowser + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, _worker_id: usize) -> Result<Arc<dyn BrowserSession>, CaptureError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new((self.factory)()))
    }
}

/// Byte source keyed by URL.
#[derive(Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Result<Vec<u8>, CaptureError>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.responses.insert(url.to_string(), Ok(bytes));
        self
    }

    pub fn with_error(mut self, url: &str, error: CaptureError) -> Self {
        self.responses.insert(url.to_string(), Err(error));
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, _referer: Option<&str>) -> Result<Vec<u8>, CaptureError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.responses
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(CaptureError::Network(format!("{url}: HTTP 404 Not Found"))))
    }
}

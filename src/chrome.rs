//! DevTools-backed implementation of [`CreativePage`]
//!
//! DOM questions are answered by small self-contained scripts evaluated in the
//! page. A `ChromePage` may be scoped to a chain of same-origin frames; the
//! scripts then resolve the innermost content document first and report
//! geometry in top-level document coordinates so clipped screenshots line up.

use crate::{CaptureError, CreativePage, ElementInfo, Rect, Viewport};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport as ClipViewport};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParams};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::trace;

const WAIT_POLL: Duration = Duration::from_millis(150);

/// Resolves `__root` to `{ doc, offX, offY }` for the scope chain, or `null`
/// when a frame in the chain is missing or cross-origin.
const ROOT_JS: &str = r#"(() => {
    let doc = document;
    let offX = window.scrollX;
    let offY = window.scrollY;
    for (const sel of __args.scope) {
        const f = doc.querySelector(sel);
        if (!f || !f.contentDocument) return null;
        const r = f.getBoundingClientRect();
        offX += r.left + f.clientLeft;
        offY += r.top + f.clientTop;
        doc = f.contentDocument;
    }
    return { doc, offX, offY };
})()"#;

const RECT_JS: &str = r#"const __rect = (el) => {
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) return null;
    return { x: r.left + __root.offX, y: r.top + __root.offY, width: r.width, height: r.height };
};
const __visible = (el) => {
    if (!el) return false;
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) return false;
    const view = el.ownerDocument.defaultView;
    for (let n = el; n && n.nodeType === 1; n = n.parentElement) {
        const cs = view.getComputedStyle(n);
        if (cs.display === 'none' || cs.visibility === 'hidden' || parseFloat(cs.opacity) === 0) return false;
    }
    return true;
};"#;

const PAUSE_CSS: &str = "*,*::before,*::after{animation-play-state:paused !important;transition:none !important;caret-color:transparent !important}";

/// A script returning `null` or `undefined` carries no value; it decodes
/// as JSON `null` so `Option` results come back as `None`.
fn decode_script_result<T: DeserializeOwned>(
    value: Option<&serde_json::Value>,
) -> Result<T, CaptureError> {
    let value = value.cloned().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value)
        .map_err(|e| CaptureError::Serialization(format!("script result: {e}")))
}

pub struct ChromePage {
    page: Page,
    scope: Vec<String>,
}

impl ChromePage {
    /// Wrap a freshly created tab and apply the capture viewport to it.
    pub async fn new(page: Page, viewport: &Viewport) -> Result<Self, CaptureError> {
        let emulation = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::Configuration)?;

        page.execute(emulation).await?;

        Ok(Self {
            page,
            scope: Vec::new(),
        })
    }

    fn is_scoped(&self) -> bool {
        !self.scope.is_empty()
    }

    async fn eval<T: DeserializeOwned>(
        &self,
        body: &str,
        args: serde_json::Value,
    ) -> Result<T, CaptureError> {
        let mut args = args;
        if let Some(map) = args.as_object_mut() {
            map.insert("scope".to_string(), json!(self.scope));
        }

        let script = format!(
            "(() => {{ const __args = {args}; const __root = {ROOT_JS}; {RECT_JS} {body} }})()"
        );
        let params = EvaluateParams::builder()
            .expression(script)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(CaptureError::CaptureFailed)?;
        let result = self.page.evaluate_expression(params).await?;

        decode_script_result(result.value())
    }

    async fn capture(&self, params: ScreenshotParams) -> Result<Vec<u8>, CaptureError> {
        self.page
            .screenshot(params)
            .await
            .map_err(|e| match CaptureError::from(e) {
                CaptureError::Transport(t) => CaptureError::Transport(t),
                other => CaptureError::CaptureFailed(other.to_string()),
            })
    }
}

#[async_trait]
impl CreativePage for ChromePage {
    async fn goto(&self, url: &str, limit: Duration) -> Result<(), CaptureError> {
        match timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(match CaptureError::from(e) {
                CaptureError::Transport(t) => CaptureError::Transport(t),
                other => CaptureError::Navigation(format!("{url}: {other}")),
            }),
            Err(_) => Err(CaptureError::Navigation(format!(
                "{url}: no load within {limit:?}"
            ))),
        }
    }

    async fn url(&self) -> Result<String, CaptureError> {
        if self.is_scoped() {
            let href: Option<String> = self
                .eval("return __root ? __root.doc.location.href : null;", json!({}))
                .await?;
            return Ok(href.unwrap_or_default());
        }
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String, CaptureError> {
        if self.is_scoped() {
            let title: Option<String> = self
                .eval("return __root ? __root.doc.title : null;", json!({}))
                .await?;
            return Ok(title.unwrap_or_default());
        }
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn content(&self) -> Result<String, CaptureError> {
        if self.is_scoped() {
            let html: Option<String> = self
                .eval(
                    "return __root ? __root.doc.documentElement.outerHTML : null;",
                    json!({}),
                )
                .await?;
            return Ok(html.unwrap_or_default());
        }
        Ok(self.page.content().await?)
    }

    async fn count(&self, selector: &str) -> Result<usize, CaptureError> {
        self.eval(
            "if (!__root) return 0; return __root.doc.querySelectorAll(__args.sel).length;",
            json!({ "sel": selector }),
        )
        .await
    }

    async fn attributes(&self, selector: &str, name: &str) -> Result<Vec<String>, CaptureError> {
        self.eval(
            r#"if (!__root) return [];
            const out = [];
            for (const el of __root.doc.querySelectorAll(__args.sel)) {
                const absolute = (__args.name === 'src' || __args.name === 'href') && typeof el[__args.name] === 'string';
                const v = absolute ? el[__args.name] : el.getAttribute(__args.name);
                if (v) out.push(String(v));
            }
            return out;"#,
            json!({ "sel": selector, "name": name }),
        )
        .await
    }

    async fn elements(&self, selector: &str) -> Result<Vec<ElementInfo>, CaptureError> {
        self.eval(
            r#"if (!__root) return [];
            return Array.from(__root.doc.querySelectorAll(__args.sel)).map((el) => ({
                tag: el.tagName.toLowerCase(),
                id: el.id || null,
                name: el.getAttribute('name'),
                src: (typeof el.src === 'string' && el.src) ? el.src : el.getAttribute('src'),
                rect: __rect(el),
                visible: __visible(el),
            }));"#,
            json!({ "sel": selector }),
        )
        .await
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, CaptureError> {
        self.eval(
            "if (!__root) return false; return __visible(__root.doc.querySelector(__args.sel));",
            json!({ "sel": selector }),
        )
        .await
    }

    async fn wait_for(&self, selector: &str, limit: Duration) -> Result<bool, CaptureError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.exists(selector).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                trace!(selector, "wait_for gave up");
                return Ok(false);
            }
            sleep(WAIT_POLL).await;
        }
    }

    async fn bounding_box(&self, selector: &str) -> Result<Option<Rect>, CaptureError> {
        self.eval(
            r#"if (!__root) return null;
            const el = __root.doc.querySelector(__args.sel);
            return el ? __rect(el) : null;"#,
            json!({ "sel": selector }),
        )
        .await
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, CaptureError> {
        if self.is_scoped() {
            let rect = self
                .bounding_box(selector)
                .await?
                .ok_or_else(|| CaptureError::ElementNotFound(selector.to_string()))?;
            return self.screenshot_clip(rect).await;
        }

        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| match CaptureError::from(e) {
                CaptureError::Transport(t) => CaptureError::Transport(t),
                other => CaptureError::ElementNotFound(format!("{selector}: {other}")),
            })?;

        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| match CaptureError::from(e) {
                CaptureError::Transport(t) => CaptureError::Transport(t),
                other => CaptureError::CaptureFailed(format!("{selector}: {other}")),
            })
    }

    async fn screenshot_clip(&self, rect: Rect) -> Result<Vec<u8>, CaptureError> {
        if rect.width < 1.0 || rect.height < 1.0 {
            return Err(CaptureError::CaptureFailed(format!(
                "clip region too small: {}x{}",
                rect.width, rect.height
            )));
        }

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .clip(ClipViewport {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                scale: 1.0,
            })
            .capture_beyond_viewport(true)
            .build();

        self.capture(params).await
    }

    async fn screenshot_page(&self) -> Result<Vec<u8>, CaptureError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        self.capture(params).await
    }

    async fn activate(&self, selector: &str) -> Result<(), CaptureError> {
        let found: bool = self
            .eval(
                r#"if (!__root) return false;
                const el = __root.doc.querySelector(__args.sel);
                if (!el) return false;
                el.hidden = false;
                el.removeAttribute('hidden');
                el.setAttribute('aria-hidden', 'false');
                if (el.classList) el.classList.remove('hidden');
                el.scrollIntoView({ block: 'center', inline: 'center' });
                try { el.click(); } catch (e) {}
                return true;"#,
                json!({ "sel": selector }),
            )
            .await?;

        if found {
            Ok(())
        } else {
            Err(CaptureError::ElementNotFound(selector.to_string()))
        }
    }

    async fn unclip_ancestors(&self, selector: &str) -> Result<(), CaptureError> {
        self.eval::<bool>(
            r#"if (!__root) return false;
            const el = __root.doc.querySelector(__args.sel);
            if (!el) return false;
            for (let n = el.parentElement; n; n = n.parentElement) {
                n.style.setProperty('overflow', 'visible', 'important');
                n.style.setProperty('clip', 'auto', 'important');
                n.style.setProperty('clip-path', 'none', 'important');
                n.style.setProperty('contain', 'none', 'important');
            }
            el.scrollIntoView({ block: 'center', inline: 'center' });
            return true;"#,
            json!({ "sel": selector }),
        )
        .await
        .map(|_| ())
    }

    async fn pause_animations(&self) -> Result<(), CaptureError> {
        self.eval::<bool>(
            r#"if (!__root) return false;
            const doc = __root.doc;
            const style = doc.createElement('style');
            style.textContent = __args.css;
            (doc.head || doc.documentElement).appendChild(style);
            if (doc.getAnimations) doc.getAnimations().forEach((a) => { try { a.pause(); } catch (e) {} });
            return true;"#,
            json!({ "css": PAUSE_CSS }),
        )
        .await
        .map(|_| ())
    }

    async fn global_json(&self, name: &str) -> Result<Option<serde_json::Value>, CaptureError> {
        self.eval(
            r#"if (!__root) return null;
            try {
                const v = __root.doc.defaultView[__args.name];
                return v === undefined || v === null ? null : JSON.parse(JSON.stringify(v));
            } catch (e) { return null; }"#,
            json!({ "name": name }),
        )
        .await
    }

    async fn frame(&self, selector: &str) -> Result<Option<Box<dyn CreativePage>>, CaptureError> {
        let reachable: bool = self
            .eval(
                r#"if (!__root) return false;
                const f = __root.doc.querySelector(__args.sel);
                try { return !!(f && f.contentDocument); } catch (e) { return false; }"#,
                json!({ "sel": selector }),
            )
            .await?;

        if !reachable {
            return Ok(None);
        }

        let mut scope = self.scope.clone();
        scope.push(selector.to_string());
        Ok(Some(Box::new(ChromePage {
            page: self.page.clone(),
            scope,
        })))
    }

    async fn close(&self) -> Result<(), CaptureError> {
        if self.is_scoped() {
            return Ok(());
        }
        self.page.clone().close().await?;
        Ok(())
    }
}

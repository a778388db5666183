//! Per-worker browser lifecycle
//!
//! Each worker owns exactly one browser process through a [`BrowserSlot`].
//! The slot is either running or crashed; a transport failure observed while
//! processing an item moves it to crashed, and the next request for a session
//! relaunches the process in place.

use crate::{create_browser_config, BrowserSession, CaptureError, ChromePage, Config, CreativePage, Viewport};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Lifecycle state of a worker's browser resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    /// No process launched yet
    Idle,
    Running,
    /// Process or DevTools connection unusable; relaunch before next use
    Crashed,
}

/// Starts browser processes. Swapped for a scripted launcher in tests.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, worker_id: usize) -> Result<Arc<dyn BrowserSession>, CaptureError>;
}

/// Launches headless Chrome through chromiumoxide.
pub struct ChromeLauncher {
    config: Config,
}

impl ChromeLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, worker_id: usize) -> Result<Arc<dyn BrowserSession>, CaptureError> {
        let browser_config = create_browser_config(&self.config, worker_id)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::Transport(format!("browser launch failed: {e}")))?;

        // The handler stream drives all DevTools traffic and must be polled
        // for the lifetime of the browser.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(worker_id, "DevTools handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        info!(worker_id, "DevTools handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        info!(worker_id, "Browser launched");

        Ok(Arc::new(ChromeSession {
            worker_id,
            browser: Mutex::new(browser),
            handler: handler_task,
            viewport: self.config.viewport.clone(),
        }))
    }
}

pub struct ChromeSession {
    worker_id: usize,
    browser: Mutex<Browser>,
    handler: JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    viewport: Viewport,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn new_page(&self) -> Result<Box<dyn CreativePage>, CaptureError> {
        if self.handler.is_finished() {
            return Err(CaptureError::Transport(format!(
                "browser {} lost its DevTools connection",
                self.worker_id
            )));
        }

        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::Transport(format!("new page: {e}")))?;

        Ok(Box::new(ChromePage::new(page, &self.viewport).await?))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            warn!(worker_id = self.worker_id, "Browser close failed: {}", e);
        }
        self.handler.abort();
    }
}

/// One worker's browser resource with its relaunch protocol.
pub struct BrowserSlot {
    worker_id: usize,
    launcher: Arc<dyn BrowserLauncher>,
    session: Option<Arc<dyn BrowserSession>>,
    state: BrowserState,
    restarts: usize,
}

impl BrowserSlot {
    pub fn new(worker_id: usize, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            worker_id,
            launcher,
            session: None,
            state: BrowserState::Idle,
            restarts: 0,
        }
    }

    pub fn state(&self) -> BrowserState {
        self.state
    }

    /// Relaunches performed after the first launch.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Running session, launching or relaunching as needed.
    pub async fn session(&mut self) -> Result<Arc<dyn BrowserSession>, CaptureError> {
        if let (BrowserState::Running, Some(session)) = (self.state, &self.session) {
            return Ok(session.clone());
        }

        if let Some(old) = self.session.take() {
            old.shutdown().await;
        }

        let relaunch = self.state == BrowserState::Crashed;
        match self.launcher.launch(self.worker_id).await {
            Ok(session) => {
                if relaunch {
                    self.restarts += 1;
                    warn!(
                        worker_id = self.worker_id,
                        restarts = self.restarts,
                        event = "browser_relaunched",
                        "Browser relaunched after transport failure"
                    );
                }
                self.session = Some(session.clone());
                self.state = BrowserState::Running;
                Ok(session)
            }
            Err(e) => {
                self.state = BrowserState::Crashed;
                Err(e)
            }
        }
    }

    pub fn mark_crashed(&mut self) {
        self.state = BrowserState::Crashed;
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
        self.state = BrowserState::Idle;
    }
}

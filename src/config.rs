//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture pipeline,
//! including browser settings, per-boundary timeouts, stability-sampling
//! parameters, retry policy and sharding.

use crate::{CaptureError, SettleParams};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline version baked into every upload and item row.
pub const PIPELINE_VERSION: &str = "2025-10-26.1";

/// Environment variable that replaces the computed pipeline version.
pub const PIPELINE_VERSION_ENV: &str = "CAPTURE_PIPELINE_VERSION";

/// Main configuration structure for the capture pipeline
///
/// # Examples
///
/// ```rust
/// use creative_capture::{CaptureProfile, Config};
///
/// let config = Config {
///     profile: CaptureProfile::Text,
///     concurrency: 4,
///     ..Default::default()
/// };
/// assert!(config.all_variants);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Which family of creatives is being captured (default: image)
    pub profile: CaptureProfile,

    /// Number of concurrent workers, each owning one browser (default: 2)
    pub concurrency: usize,

    /// Retry policy for items that end in a retryable error
    pub retry: RetryConfig,

    /// Consecutive browser relaunches tolerated for a single item (default: 5)
    ///
    /// Relaunches do not consume retry attempts; this cap only stops a
    /// permanently broken browser from spinning forever on one item.
    pub max_browser_restarts: usize,

    /// Timeouts applied at each navigation/network boundary
    pub timeouts: Timeouts,

    /// Stability-sampling parameters
    pub settle: SettleConfig,

    /// Browser viewport configuration for captures
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// User-Agent sent by the browser and by direct fetches
    pub user_agent: String,

    /// Blob namespace for canonical assets
    pub storage: StorageConfig,

    /// Capture every resolved variant instead of stopping after the first (default: true)
    pub all_variants: bool,

    /// Skip every store/blob write and only log what would have happened
    pub dry_run: bool,

    /// Enable the optional text-recognition step (default: false)
    pub ocr_enabled: bool,

    /// Recognition service receiving canonical PNG bytes when OCR is enabled
    pub ocr_endpoint: Option<String>,

    /// Deterministic work partitioning across independent runs
    pub shard: ShardConfig,

    /// Owner ids whose items are never enqueued
    pub skip_owners: Vec<String>,

    /// Re-capture items whose primary variant already finished
    pub rescrape_done: bool,

    /// Stop enqueueing after this many items pass the filters
    pub max_items: Option<usize>,

    /// Best-effort debug artifacts
    pub debug: DebugSettings,

    /// Interval between status summary log lines
    pub summary_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: CaptureProfile::Image,
            concurrency: 2,
            retry: RetryConfig::default(),
            max_browser_restarts: 5,
            timeouts: Timeouts::default(),
            settle: SettleConfig::default(),
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: "creative-capture/1.0".to_string(),
            storage: StorageConfig::default(),
            all_variants: true,
            dry_run: false,
            ocr_enabled: false,
            ocr_endpoint: None,
            shard: ShardConfig::default(),
            skip_owners: Vec::new(),
            rescrape_done: false,
            max_items: None,
            debug: DebugSettings::default(),
            summary_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// `<profile>:<version>` unless overridden from the environment.
    pub fn pipeline_version(&self) -> String {
        std::env::var(PIPELINE_VERSION_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("{}:{}", self.profile.as_str(), PIPELINE_VERSION))
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.concurrency == 0 {
            return Err(CaptureError::Configuration(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.page.is_zero() || self.timeouts.frame.is_zero() || self.timeouts.fetch.is_zero() {
            return Err(CaptureError::Configuration(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CaptureError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if self.shard.count == 0 || self.shard.index >= self.shard.count {
            return Err(CaptureError::Configuration(format!(
                "shard index {} out of range for shard count {}",
                self.shard.index, self.shard.count
            )));
        }
        if self.storage.bucket.is_empty() || self.storage.bucket.contains('/') {
            return Err(CaptureError::Configuration(format!(
                "invalid bucket name: {:?}",
                self.storage.bucket
            )));
        }
        if self.ocr_enabled && self.ocr_endpoint.is_none() {
            return Err(CaptureError::Configuration(
                "OCR is enabled but no recognition endpoint is configured".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CaptureError::Configuration(
                "retry multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Creative family being captured. Selects the resolver templates and the
/// asset namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureProfile {
    Image,
    Text,
}

impl CaptureProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureProfile::Image => "image",
            CaptureProfile::Text => "text",
        }
    }

    /// Value written into the `type` metadata field.
    pub fn ad_type(&self) -> &'static str {
        match self {
            CaptureProfile::Image => "IMAGE",
            CaptureProfile::Text => "TEXT",
        }
    }
}

impl std::str::FromStr for CaptureProfile {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(CaptureProfile::Image),
            "text" => Ok(CaptureProfile::Text),
            other => Err(CaptureError::Configuration(format!("unknown profile: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 2)
    pub max_retries: usize,
    /// Delay before the first retry (default: 500ms)
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based retry attempt, capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    /// Top-level page navigations (default: 30s)
    pub page: Duration,
    /// Waits for selectors inside creative frames (default: 15s)
    pub frame: Duration,
    /// Direct HTTP fetches of creative bytes (default: 20s)
    pub fetch: Duration,
    /// Bounded wait for terminal banners on a fresh page (default: 5s)
    pub banner: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            page: Duration::from_secs(30),
            frame: Duration::from_secs(15),
            fetch: Duration::from_secs(20),
            banner: Duration::from_secs(5),
        }
    }
}

/// Stability-sampling parameters for the different capture paths.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettleConfig {
    /// Embedded and animated-bundle element captures
    pub standard: SettleParams,
    /// Syndicated tiles settle faster; also used for the post-pause re-settle
    pub syndicated: SettleParams,
    /// Last-resort full-page capture of an animated bundle
    pub full_page: SettleParams,
    /// Fingerprint distance above which pausing animations is considered to
    /// have changed the picture (default: 4 bits)
    pub repause_threshold: u32,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            standard: SettleParams::default(),
            syndicated: SettleParams {
                max_wait: Duration::from_millis(1800),
                min_stable: Duration::from_millis(600),
                min_observe: Duration::from_millis(400),
                ..SettleParams::default()
            },
            full_page: SettleParams {
                max_wait: Duration::from_millis(8000),
                min_stable: Duration::from_millis(1200),
                poll_interval: Duration::from_millis(250),
                min_observe: Duration::from_millis(800),
                ..SettleParams::default()
            },
            repause_threshold: 4,
        }
    }
}

/// Browser viewport configuration for captures
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 3.0)
    ///
    /// Creatives are small; a high ratio keeps screenshot captures sharp.
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 3.0,
            mobile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// URI scheme of canonical asset paths (default: "file")
    pub scheme: String,
    /// Bucket (top-level namespace) for canonical assets
    pub bucket: String,
    /// Directory backing the `file` scheme
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scheme: "file".to_string(),
            bucket: "creative-assets".to_string(),
            local_root: PathBuf::from("media"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardConfig {
    pub index: usize,
    pub count: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl ShardConfig {
    /// Shard settings from a batch scheduler's task environment, if present.
    pub fn from_task_env() -> Option<Self> {
        let index = std::env::var("CLOUD_RUN_TASK_INDEX").ok()?.parse().ok()?;
        let count = std::env::var("CLOUD_RUN_TASK_COUNT").ok()?.parse().ok()?;
        Some(Self { index, count })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Dump each item's page HTML into `dir`
    pub dump_html: bool,
    /// Log the iframe inventory of each item page
    pub frame_inventory: bool,
    pub dir: PathBuf,
}

/// Generate Chrome command-line arguments for one worker's browser.
///
/// Each worker gets its own user-data directory so relaunches never collide
/// with a sibling's profile lock.
pub fn get_chrome_args(config: &Config, worker_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), worker_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-gpu".to_string(),
        "--no-zygote".to_string(),
        "--no-first-run".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/creative-capture-{unique_id}"),
    ];

    if !config.user_agent.is_empty() {
        args.push(format!("--user-agent={}", config.user_agent));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
    worker_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.timeouts.page)
        .args(get_chrome_args(config, worker_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(|e| CaptureError::Configuration(format!("browser config: {e}")))
}

use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

/// Terminal outcome of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Done,
    Terminal,
    Error,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Done => "done",
            ItemOutcome::Terminal => "terminal",
            ItemOutcome::Error => "error",
        }
    }
}

#[derive(Default)]
struct Tally {
    done: AtomicU64,
    terminal: AtomicU64,
    error: AtomicU64,
    variants_captured: AtomicU64,
    variants_failed: AtomicU64,
    retries: AtomicU64,
    browser_restarts: AtomicU64,
    skipped: AtomicU64,
}

/// Pipeline counters. Every update goes both to the `metrics` facade (so an
/// installed recorder sees it) and to local tallies read by the summary task.
pub struct Metrics {
    items_done: Counter,
    items_terminal: Counter,
    items_error: Counter,
    variants_captured: Counter,
    variants_failed: Counter,
    retries: Counter,
    browser_restarts: Counter,
    items_skipped: Counter,
    item_duration: Histogram,
    queue_depth: Gauge,
    tally: Tally,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            items_done: register_counter!("capture_items_total", "outcome" => "done"),
            items_terminal: register_counter!("capture_items_total", "outcome" => "terminal"),
            items_error: register_counter!("capture_items_total", "outcome" => "error"),
            variants_captured: register_counter!("capture_variants_total", "result" => "captured"),
            variants_failed: register_counter!("capture_variants_total", "result" => "failed"),
            retries: register_counter!("capture_retries_total"),
            browser_restarts: register_counter!("capture_browser_restarts_total"),
            items_skipped: register_counter!("capture_items_skipped_total"),
            item_duration: register_histogram!("capture_item_duration_seconds"),
            queue_depth: register_gauge!("capture_queue_depth"),
            tally: Tally::default(),
            start_time: Instant::now(),
        }
    }

    pub fn record_item(&self, outcome: ItemOutcome, duration: Duration) {
        let (counter, tally) = match outcome {
            ItemOutcome::Done => (&self.items_done, &self.tally.done),
            ItemOutcome::Terminal => (&self.items_terminal, &self.tally.terminal),
            ItemOutcome::Error => (&self.items_error, &self.tally.error),
        };
        counter.increment(1);
        tally.fetch_add(1, Ordering::Relaxed);
        self.item_duration.record(duration.as_secs_f64());
    }

    pub fn record_variant(&self, captured: bool) {
        if captured {
            self.variants_captured.increment(1);
            self.tally.variants_captured.fetch_add(1, Ordering::Relaxed);
        } else {
            self.variants_failed.increment(1);
            self.tally.variants_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries.increment(1);
        self.tally.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts.increment(1);
        self.tally.browser_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.items_skipped.increment(1);
        self.tally.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            done: load(&self.tally.done),
            terminal: load(&self.tally.terminal),
            error: load(&self.tally.error),
            variants_captured: load(&self.tally.variants_captured),
            variants_failed: load(&self.tally.variants_failed),
            retries: load(&self.tally.retries),
            browser_restarts: load(&self.tally.browser_restarts),
            skipped: load(&self.tally.skipped),
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub done: u64,
    pub terminal: u64,
    pub error: u64,
    pub variants_captured: u64,
    pub variants_failed: u64,
    pub retries: u64,
    pub browser_restarts: u64,
    pub skipped: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn items_finished(&self) -> u64 {
        self.done + self.terminal + self.error
    }

    /// Finished items per minute since start.
    pub fn throughput_per_minute(&self) -> f64 {
        let minutes = self.uptime.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.items_finished() as f64 / minutes
        } else {
            0.0
        }
    }
}

/// Background task that logs a status summary every `interval`.
pub struct SummaryReporter {
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl SummaryReporter {
    pub fn new(metrics: Arc<Metrics>, interval: Duration) -> Self {
        Self { metrics, interval }
    }

    pub fn log_summary(metrics: &Metrics) {
        let s = metrics.snapshot();
        info!(
            event = "status_summary",
            done = s.done,
            terminal = s.terminal,
            error = s.error,
            skipped = s.skipped,
            variants_captured = s.variants_captured,
            variants_failed = s.variants_failed,
            retries = s.retries,
            browser_restarts = s.browser_restarts,
            items_per_minute = format!("{:.1}", s.throughput_per_minute()),
            uptime = %crate::format_duration(s.uptime),
            "Status summary"
        );
    }

    /// Caller aborts the returned handle when the run ends.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                Self::log_summary(&self.metrics);
            }
        })
    }
}

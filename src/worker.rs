use crate::{
    BrowserLauncher, BrowserSlot, CaptureError, CaptureOrchestrator, Config, EnumerationFilter,
    Enumerator, ItemOutcome, ItemStatus, Metrics, Recorder, RetryConfig, PRIMARY_VARIANT_ID,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Queue capacity between the producer and the workers.
pub const QUEUE_CAPACITY: usize = 1000;

/// One creative to capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub item_url: String,
    pub owner_id: String,
}

impl WorkItem {
    pub fn new(item_id: &str, item_url: &str, owner_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            item_url: item_url.to_string(),
            owner_id: owner_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkMessage {
    Item(WorkItem),
    /// No more work. The producer sends one per worker.
    Shutdown,
}

/// Shard owning `item_id` out of `count`. Stable across runs and processes:
/// the first four bytes of the id's SHA-256, big-endian, modulo `count`.
pub fn stable_shard_index(item_id: &str, count: usize) -> usize {
    let digest = Sha256::digest(item_id.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head as usize % count.max(1)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub enumerated: usize,
    pub queued: usize,
    pub skipped_owner: usize,
    pub skipped_shard: usize,
    pub skipped_done: usize,
}

/// Filters enumerated items and feeds the queue.
pub struct Producer {
    config: Config,
    recorder: Recorder,
    metrics: Arc<Metrics>,
}

impl Producer {
    pub fn new(config: Config, recorder: Recorder, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            recorder,
            metrics,
        }
    }

    /// Whether this shard should capture `item`, checking owner skips, shard
    /// ownership and previous success in that order.
    async fn admit(&self, item: &WorkItem, stats: &mut ProducerStats) -> Result<bool, CaptureError> {
        if self.config.skip_owners.iter().any(|o| o == &item.owner_id) {
            stats.skipped_owner += 1;
            return Ok(false);
        }

        let shard = &self.config.shard;
        if stable_shard_index(&item.item_id, shard.count) != shard.index {
            stats.skipped_shard += 1;
            return Ok(false);
        }

        if !self.config.rescrape_done {
            if let Some(status) = self.recorder.status(&item.item_id, PRIMARY_VARIANT_ID).await? {
                if !status.needs_capture() {
                    debug!(item_id = %item.item_id, status = %status, "Skipping already captured item");
                    stats.skipped_done += 1;
                    self.metrics.record_skipped();
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Enqueue admitted items until the source is exhausted or `max_items`
    /// is reached. Sentinels are the caller's job.
    pub async fn produce(
        &self,
        enumerator: &dyn Enumerator,
        filter: &EnumerationFilter,
        queue: &mpsc::Sender<WorkMessage>,
    ) -> Result<ProducerStats, CaptureError> {
        let mut stats = ProducerStats::default();
        let mut items = enumerator.stream(filter).await?;

        while let Some(item) = items.next().await {
            let item = item?;
            stats.enumerated += 1;
            if !self.admit(&item, &mut stats).await? {
                continue;
            }

            queue
                .send(WorkMessage::Item(item))
                .await
                .map_err(|e| CaptureError::CaptureFailed(format!("work queue closed: {e}")))?;
            stats.queued += 1;
            self.metrics
                .set_queue_depth(queue.max_capacity() - queue.capacity());

            if self.config.max_items.is_some_and(|max| stats.queued >= max) {
                info!(max_items = stats.queued, "Reached item cap");
                break;
            }
        }

        info!(
            event = "producer_finished",
            enumerated = stats.enumerated,
            queued = stats.queued,
            skipped_owner = stats.skipped_owner,
            skipped_shard = stats.skipped_shard,
            skipped_done = stats.skipped_done,
            "Producer finished"
        );
        Ok(stats)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub processed: usize,
    pub done: usize,
    pub terminal: usize,
    pub errors: usize,
    pub browser_restarts: usize,
}

/// Consumer owning one browser. Processes items one at a time with retry.
pub struct CaptureWorker {
    id: usize,
    orchestrator: Arc<CaptureOrchestrator>,
    slot: BrowserSlot,
    retry: RetryConfig,
    max_browser_restarts: usize,
    metrics: Arc<Metrics>,
    stats: WorkerStats,
}

impl CaptureWorker {
    pub fn new(
        id: usize,
        config: &Config,
        orchestrator: Arc<CaptureOrchestrator>,
        launcher: Arc<dyn BrowserLauncher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            orchestrator,
            slot: BrowserSlot::new(id, launcher),
            retry: config.retry.clone(),
            max_browser_restarts: config.max_browser_restarts,
            metrics,
            stats: WorkerStats {
                id,
                ..Default::default()
            },
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub async fn run_with_shared_receiver(
        mut self,
        queue: Arc<Mutex<mpsc::Receiver<WorkMessage>>>,
    ) -> WorkerStats {
        info!(worker_id = self.id, "Starting capture worker");

        loop {
            let message = {
                let mut receiver = queue.lock().await;
                receiver.recv().await
            };

            match message {
                Some(WorkMessage::Item(item)) => {
                    let outcome = self.process_with_retry(&item).await;
                    self.stats.processed += 1;
                    match outcome {
                        ItemOutcome::Done => self.stats.done += 1,
                        ItemOutcome::Terminal => self.stats.terminal += 1,
                        ItemOutcome::Error => self.stats.errors += 1,
                    }
                }
                Some(WorkMessage::Shutdown) | None => break,
            }
        }

        self.slot.shutdown().await;
        info!(
            worker_id = self.id,
            processed = self.stats.processed,
            errors = self.stats.errors,
            "Capture worker stopped"
        );
        self.stats
    }

    /// Capture one item to a final outcome.
    ///
    /// `error` outcomes and non-transport failures are retried with backoff
    /// up to the retry budget. A transport failure relaunches the browser
    /// and repeats the attempt without spending budget, up to
    /// `max_browser_restarts` relaunches for this item.
    pub async fn process_with_retry(&mut self, item: &WorkItem) -> ItemOutcome {
        let started = Instant::now();
        let mut attempt = 0usize;
        let mut relaunches = 0usize;

        let outcome = loop {
            let result = match self.slot.session().await {
                Ok(session) => self.orchestrator.process_item(session.as_ref(), item).await,
                Err(e) => Err(e),
            };

            let failure = match result {
                Ok(ItemOutcome::Error) => None,
                Ok(outcome) => break outcome,
                Err(e) if e.is_transport() => {
                    self.slot.mark_crashed();
                    if relaunches >= self.max_browser_restarts {
                        error!(
                            worker_id = self.id,
                            item_id = %item.item_id,
                            relaunches,
                            error = %e,
                            "Browser keeps failing, giving up on item"
                        );
                        self.record_abandoned(item, &e).await;
                        break ItemOutcome::Error;
                    }
                    relaunches += 1;
                    self.stats.browser_restarts += 1;
                    self.metrics.record_browser_restart();
                    warn!(
                        event = "browser_restart",
                        worker_id = self.id,
                        item_id = %item.item_id,
                        error = %e,
                        "Transport failure, relaunching browser"
                    );
                    continue;
                }
                Err(e) => Some(e),
            };

            if attempt >= self.retry.max_retries {
                if let Some(e) = &failure {
                    warn!(item_id = %item.item_id, error = %e, "Retries exhausted");
                }
                break ItemOutcome::Error;
            }

            let delay = self.retry.delay_for(attempt);
            attempt += 1;
            self.metrics.record_retry();
            warn!(
                event = "retry",
                worker_id = self.id,
                item_id = %item.item_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = failure.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "Retrying item"
            );
            tokio::time::sleep(delay).await;
        };

        self.metrics.record_item(outcome, started.elapsed());
        outcome
    }

    async fn record_abandoned(&self, item: &WorkItem, cause: &CaptureError) {
        let message = format!("browser unavailable: {cause}");
        if let Err(e) = self
            .orchestrator
            .recorder()
            .record_status(&item.item_id, PRIMARY_VARIANT_ID, ItemStatus::Error, Some(&message))
            .await
        {
            error!(item_id = %item.item_id, error = %e, "Failed to record abandoned item");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub producer: ProducerStats,
    pub workers: Vec<WorkerStats>,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn done(&self) -> usize {
        self.workers.iter().map(|w| w.done).sum()
    }

    pub fn terminal(&self) -> usize {
        self.workers.iter().map(|w| w.terminal).sum()
    }

    pub fn errors(&self) -> usize {
        self.workers.iter().map(|w| w.errors).sum()
    }
}

/// One producer and `concurrency` workers over a shared queue.
pub struct WorkerPool {
    config: Config,
    orchestrator: Arc<CaptureOrchestrator>,
    launcher: Arc<dyn BrowserLauncher>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    pub fn new(
        config: Config,
        orchestrator: Arc<CaptureOrchestrator>,
        launcher: Arc<dyn BrowserLauncher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            launcher,
            metrics,
        }
    }

    /// Drain `enumerator` through the workers. Workers finish their in-flight
    /// item before exiting; an enumeration failure is returned only after
    /// they have.
    pub async fn run(
        &self,
        enumerator: &dyn Enumerator,
        filter: &EnumerationFilter,
    ) -> Result<RunReport, CaptureError> {
        let worker_count = self.config.concurrency.max(1);
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let shared_receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = CaptureWorker::new(
                id,
                &self.config,
                self.orchestrator.clone(),
                self.launcher.clone(),
                self.metrics.clone(),
            );
            let rx = shared_receiver.clone();
            handles.push(tokio::spawn(worker.run_with_shared_receiver(rx)));
        }

        let producer = Producer::new(
            self.config.clone(),
            self.orchestrator.recorder().clone(),
            self.metrics.clone(),
        );
        let produced = producer.produce(enumerator, filter, &sender).await;
        if let Err(e) = &produced {
            error!(error = %e, "Enumeration failed, stopping after in-flight items");
        }

        for _ in 0..worker_count {
            if sender.send(WorkMessage::Shutdown).await.is_err() {
                break;
            }
        }
        drop(sender);

        let mut workers = Vec::with_capacity(worker_count);
        for handle in handles {
            match handle.await {
                Ok(stats) => workers.push(stats),
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        Ok(RunReport {
            producer: produced?,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{pattern_png, FakeBrowser, FakeFetcher, FakeLauncher, FakePage};
    use crate::{ItemStore, ManifestEnumerator, MemoryBlobStore, MemoryItemStore, OcrGate, ShardConfig};

    fn url(id: &str) -> String {
        format!("https://portal.example/advertiser/AR1/creative/{id}")
    }

    fn image_page(id: &str) -> FakePage {
        FakePage::new().with_attrs(
            "creative-details img, .creative-details-container img",
            "src",
            &[&format!("https://cdn.example/{id}.png")],
        )
    }

    struct Harness {
        config: Config,
        items: Arc<MemoryItemStore>,
        metrics: Arc<Metrics>,
        orchestrator: Arc<CaptureOrchestrator>,
    }

    fn harness(config: Config, fetcher: FakeFetcher) -> Harness {
        let items = Arc::new(MemoryItemStore::new());
        let recorder = Recorder::new(items.clone(), Arc::new(MemoryBlobStore::new()), false);
        let metrics = Arc::new(Metrics::new());
        let orchestrator = Arc::new(CaptureOrchestrator::new(
            config.clone(),
            Arc::new(fetcher),
            recorder,
            Arc::new(OcrGate::disabled()),
            metrics.clone(),
        ));
        Harness {
            config,
            items,
            metrics,
            orchestrator,
        }
    }

    fn worker(h: &Harness, launcher: Arc<FakeLauncher>) -> CaptureWorker {
        CaptureWorker::new(0, &h.config, h.orchestrator.clone(), launcher, h.metrics.clone())
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        for id in ["CR1", "CR123456789", ""] {
            let first = stable_shard_index(id, 7);
            assert!(first < 7);
            assert_eq!(stable_shard_index(id, 7), first);
        }
        assert_eq!(stable_shard_index("CR1", 1), 0);
        assert_eq!(stable_shard_index("CR1", 0), 0);
    }

    #[test]
    fn shards_partition_items() {
        let ids: Vec<String> = (0..200).map(|i| format!("CR{i}")).collect();
        let mut per_shard = [0usize; 4];
        for id in &ids {
            per_shard[stable_shard_index(id, 4)] += 1;
        }
        assert_eq!(per_shard.iter().sum::<usize>(), ids.len());
        assert!(per_shard.iter().all(|&n| n > 0));
    }

    #[tokio::test]
    async fn producer_filters_and_caps() {
        let items = Arc::new(MemoryItemStore::new());
        items
            .record_status("CR2", PRIMARY_VARIANT_ID, ItemStatus::Done, None)
            .await
            .unwrap();
        items
            .record_status("CR3", PRIMARY_VARIANT_ID, ItemStatus::Error, Some("timeout"))
            .await
            .unwrap();
        let recorder = Recorder::new(items, Arc::new(MemoryBlobStore::new()), false);

        let config = Config {
            skip_owners: vec!["AR_SKIP".to_string()],
            max_items: Some(2),
            ..Default::default()
        };
        let producer = Producer::new(config, recorder, Arc::new(Metrics::new()));
        let enumerator = ManifestEnumerator::new(vec![
            WorkItem::new("CR0", &url("CR0"), "AR_SKIP"),
            WorkItem::new("CR1", &url("CR1"), "AR1"),
            WorkItem::new("CR2", &url("CR2"), "AR1"),
            WorkItem::new("CR3", &url("CR3"), "AR1"),
            WorkItem::new("CR4", &url("CR4"), "AR1"),
        ]);

        let (tx, mut rx) = mpsc::channel(16);
        let stats = producer
            .produce(&enumerator, &EnumerationFilter::default(), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut queued = Vec::new();
        while let Some(WorkMessage::Item(item)) = rx.recv().await {
            queued.push(item.item_id);
        }
        assert_eq!(queued, vec!["CR1", "CR3"]);
        assert_eq!(stats.skipped_owner, 1);
        assert_eq!(stats.skipped_done, 1);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.enumerated, 4);
    }

    #[tokio::test]
    async fn producer_keeps_only_own_shard() {
        let recorder = Recorder::new(
            Arc::new(MemoryItemStore::new()),
            Arc::new(MemoryBlobStore::new()),
            false,
        );
        let config = Config {
            shard: ShardConfig { index: 1, count: 3 },
            ..Default::default()
        };
        let producer = Producer::new(config, recorder, Arc::new(Metrics::new()));
        let all: Vec<WorkItem> = (0..30)
            .map(|i| WorkItem::new(&format!("CR{i}"), &url("x"), "AR1"))
            .collect();
        let expected = all
            .iter()
            .filter(|i| stable_shard_index(&i.item_id, 3) == 1)
            .count();

        let (tx, _rx) = mpsc::channel(64);
        let stats = producer
            .produce(&ManifestEnumerator::new(all), &EnumerationFilter::default(), &tx)
            .await
            .unwrap();
        assert_eq!(stats.queued, expected);
        assert_eq!(stats.skipped_shard, 30 - expected);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_relaunches_without_spending_retries() {
        let browser = FakeBrowser::default()
            .route(&url("CR1"), image_page("CR1"))
            .failing_new_pages(1);
        let launcher = Arc::new(FakeLauncher::new(move || browser.clone()));
        let fetcher = FakeFetcher::new().with("https://cdn.example/CR1.png", pattern_png(20, 20, 3));
        let h = harness(Config::default(), fetcher);

        let mut worker = worker(&h, launcher.clone());
        let outcome = worker
            .process_with_retry(&WorkItem::new("CR1", &url("CR1"), "AR1"))
            .await;

        assert_eq!(outcome, ItemOutcome::Done);
        assert_eq!(launcher.launches(), 2);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.browser_restarts, 1);
        assert_eq!(snapshot.retries, 0);
        assert_eq!(h.items.row("CR1", "v1").unwrap().status, ItemStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn relaunch_cap_abandons_item() {
        let browser = FakeBrowser::default().failing_new_pages(usize::MAX);
        let launcher = Arc::new(FakeLauncher::new(move || browser.clone()));
        let config = Config {
            max_browser_restarts: 2,
            ..Default::default()
        };
        let h = harness(config, FakeFetcher::new());

        let mut worker = worker(&h, launcher.clone());
        let outcome = worker
            .process_with_retry(&WorkItem::new("CR1", &url("CR1"), "AR1"))
            .await;

        assert_eq!(outcome, ItemOutcome::Error);
        assert_eq!(launcher.launches(), 3);
        let row = h.items.row("CR1", "v1").unwrap();
        assert_eq!(row.status, ItemStatus::Error);
        assert!(row.last_error.unwrap().starts_with("browser unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_failure_relaunches_without_spending_retries() {
        let browser = FakeBrowser::default().route_error(
            &url("CR1"),
            CaptureError::Navigation("net::ERR_CONNECTION_RESET".to_string()),
        );
        let journal = browser.journal();
        let launcher = Arc::new(FakeLauncher::new(move || browser.clone()));
        let config = Config {
            max_browser_restarts: 2,
            ..Default::default()
        };
        let h = harness(config, FakeFetcher::new());

        let mut worker = worker(&h, launcher.clone());
        let outcome = worker
            .process_with_retry(&WorkItem::new("CR1", &url("CR1"), "AR1"))
            .await;

        assert_eq!(outcome, ItemOutcome::Error);
        assert_eq!(launcher.launches(), 3);
        assert_eq!(journal.visits().len(), 3);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.browser_restarts, 2);
        assert_eq!(snapshot.retries, 0);
        let row = h.items.row("CR1", "v1").unwrap();
        assert_eq!(row.status, ItemStatus::Error);
        let last_error = row.last_error.unwrap();
        assert!(last_error.starts_with("browser unavailable"));
        assert!(last_error.contains("ERR_CONNECTION_RESET"));
    }

    #[tokio::test(start_paused = true)]
    async fn error_outcome_is_retried_with_backoff() {
        let browser = FakeBrowser::default().route(&url("CR1"), FakePage::new());
        let journal = browser.journal();
        let launcher = Arc::new(FakeLauncher::new(move || browser.clone()));
        let h = harness(Config::default(), FakeFetcher::new());

        let mut worker = worker(&h, launcher);
        let started = tokio::time::Instant::now();
        let outcome = worker
            .process_with_retry(&WorkItem::new("CR1", &url("CR1"), "AR1"))
            .await;

        assert_eq!(outcome, ItemOutcome::Error);
        assert_eq!(journal.visits().len(), 3);
        assert_eq!(h.metrics.snapshot().retries, 2);
        // 500ms + 1000ms of backoff
        assert!(started.elapsed() >= std::time::Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_drains_queue_and_stops_workers() {
        let mut browser = FakeBrowser::default();
        let mut fetcher = FakeFetcher::new();
        let mut work = Vec::new();
        for i in 0..5 {
            let id = format!("CR{i}");
            browser = browser.route(&url(&id), image_page(&id));
            fetcher = fetcher.with(&format!("https://cdn.example/{id}.png"), pattern_png(16 + i, 16, i));
            work.push(WorkItem::new(&id, &url(&id), "AR1"));
        }
        let launcher = Arc::new(FakeLauncher::new(move || browser.clone()));
        let h = harness(
            Config {
                concurrency: 2,
                ..Default::default()
            },
            fetcher,
        );

        let pool = WorkerPool::new(h.config.clone(), h.orchestrator.clone(), launcher.clone(), h.metrics.clone());
        let report = pool
            .run(&ManifestEnumerator::new(work), &EnumerationFilter::default())
            .await
            .unwrap();

        assert_eq!(report.producer.queued, 5);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.processed(), 5);
        assert_eq!(report.done(), 5);
        assert!(launcher.launches() <= 2);
        assert_eq!(h.items.asset_count(), 5);
    }
}

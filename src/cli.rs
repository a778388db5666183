use crate::{
    format_bytes, format_duration, normalize, parse_ids_from_url, BlobStore, CaptureOrchestrator,
    CaptureProfile, ChromeLauncher, Config, EnumerationFilter, EnumerationOrder, HttpFetcher,
    HttpRecognizer, LocalBlobStore, ManifestEnumerator, MemoryBlobStore, MemoryItemStore, Metrics,
    OcrGate, Recorder, ShardConfig, SummaryReporter, TextRecognizer, WorkItem, WorkerPool,
};
use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "creative-capture")]
#[command(about = "Capture and normalize ad creatives from a transparency portal")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Flags that override fields of the loaded configuration.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    #[arg(long, global = true, help = "Creative family: image or text")]
    pub profile: Option<CaptureProfile>,

    #[arg(long, global = true, help = "Number of workers (one browser each)")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Log writes instead of performing them")]
    pub dry_run: bool,

    #[arg(long, global = true, help = "Stop after the first captured variant of each item")]
    pub first_variant_only: bool,

    #[arg(long, global = true, help = "Zero-based shard index")]
    pub shard_index: Option<usize>,

    #[arg(long, global = true, help = "Total number of shards")]
    pub shard_count: Option<usize>,

    #[arg(long = "skip-owner", global = true, help = "Owner id to skip (repeatable)")]
    pub skip_owners: Vec<String>,

    #[arg(long, global = true, help = "Capture items that already finished")]
    pub rescrape_done: bool,

    #[arg(long, global = true, help = "Enqueue at most this many items")]
    pub max_items: Option<usize>,

    #[arg(long, global = true, help = "Text-recognition endpoint; enables OCR")]
    pub ocr_endpoint: Option<String>,

    #[arg(long, global = true, help = "Dump each item's page HTML into the debug directory")]
    pub dump_html: bool,

    #[arg(long, global = true, help = "Log the iframe inventory of each item page")]
    pub frame_inventory: bool,

    #[arg(long, global = true, help = "Directory for debug artifacts")]
    pub debug_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(profile) = self.profile {
            config.profile = profile;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if self.dry_run {
            config.dry_run = true;
        }
        if self.first_variant_only {
            config.all_variants = false;
        }

        match (self.shard_index, self.shard_count) {
            (None, None) => {
                if let Some(shard) = ShardConfig::from_task_env() {
                    config.shard = shard;
                }
            }
            (index, count) => {
                config.shard = ShardConfig {
                    index: index.unwrap_or(config.shard.index),
                    count: count.unwrap_or(config.shard.count),
                };
            }
        }

        config.skip_owners.extend(self.skip_owners.iter().cloned());
        if self.rescrape_done {
            config.rescrape_done = true;
        }
        if let Some(max_items) = self.max_items {
            config.max_items = Some(max_items);
        }
        if let Some(endpoint) = &self.ocr_endpoint {
            config.ocr_endpoint = Some(endpoint.clone());
            config.ocr_enabled = true;
        }
        if self.dump_html {
            config.debug.dump_html = true;
        }
        if self.frame_inventory {
            config.debug.frame_inventory = true;
        }
        if let Some(dir) = &self.debug_dir {
            config.debug.dir = dir.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture one creative or every creative in a manifest
    Run {
        #[arg(long, conflicts_with = "manifest", help = "Creative page URL")]
        url: Option<String>,

        #[arg(long, requires = "url", help = "Item id (parsed from the URL when omitted)")]
        item_id: Option<String>,

        #[arg(long, requires = "url", help = "Owner id (parsed from the URL when omitted)")]
        owner_id: Option<String>,

        #[arg(long, help = "JSONL or CSV manifest of work items")]
        manifest: Option<PathBuf>,

        #[arg(long, help = "Earliest insertion date (YYYY-MM-DD)")]
        from: Option<NaiveDate>,

        #[arg(long, help = "Latest insertion date (YYYY-MM-DD)")]
        to: Option<NaiveDate>,

        #[arg(long, help = "Enumerate at most this many items")]
        limit: Option<usize>,

        #[arg(long, help = "Enumeration order: none, inserted-asc, inserted-desc, owner-asc")]
        order: Option<String>,
    },

    /// Normalize a local image file into a canonical PNG
    Normalize {
        #[arg(short, long, help = "Input image")]
        input: PathBuf,

        #[arg(short, long, help = "Output PNG path")]
        output: PathBuf,

        #[arg(long, help = "Keep uniform borders")]
        no_trim: bool,
    },

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        path: PathBuf,
    },
}

pub fn parse_order(raw: &str) -> anyhow::Result<EnumerationOrder> {
    Ok(match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "none" => EnumerationOrder::None,
        "inserted-asc" => EnumerationOrder::InsertedAsc,
        "inserted-desc" => EnumerationOrder::InsertedDesc,
        "owner-asc" => EnumerationOrder::OwnerAsc,
        other => bail!("unknown enumeration order: {other}"),
    })
}

/// Work item for a single creative URL. Missing ids are parsed from the URL.
pub fn single_item(url: &str, item_id: Option<String>, owner_id: Option<String>) -> anyhow::Result<WorkItem> {
    crate::validate_url(url).with_context(|| format!("invalid creative URL: {url}"))?;
    let parsed = parse_ids_from_url(url);
    let (owner_id, item_id) = match (owner_id, item_id, parsed) {
        (Some(owner), Some(item), _) => (owner, item),
        (owner, item, Some((parsed_owner, parsed_item))) => {
            (owner.unwrap_or(parsed_owner), item.unwrap_or(parsed_item))
        }
        _ => bail!("cannot derive item/owner ids from {url}; pass --item-id and --owner-id"),
    };
    Ok(WorkItem::new(&item_id, url, &owner_id))
}

/// Blob store backing the configured scheme. Dry runs never write, so any
/// scheme is accepted there.
pub fn blob_store_for(config: &Config) -> anyhow::Result<Arc<dyn BlobStore>> {
    match config.storage.scheme.as_str() {
        "file" => Ok(Arc::new(LocalBlobStore::new(config.storage.local_root.clone()))),
        _ if config.dry_run => Ok(Arc::new(MemoryBlobStore::new())),
        other => Err(anyhow!("no blob store adapter for scheme {other:?}; use \"file\" or --dry-run")),
    }
}

pub struct CliRunner {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    orchestrator: Arc<CaptureOrchestrator>,
}

impl CliRunner {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new());

        // Production item stores plug in behind `ItemStore`; the CLI keeps
        // statuses in memory for the lifetime of the run.
        let items = Arc::new(MemoryItemStore::new());
        let recorder = Recorder::new(items, blob_store_for(&config)?, config.dry_run);

        let recognizer: Arc<dyn TextRecognizer> = match &config.ocr_endpoint {
            Some(endpoint) => Arc::new(HttpRecognizer::new(endpoint.clone(), config.timeouts.fetch)?),
            None => Arc::new(crate::DisabledRecognizer),
        };
        let ocr = Arc::new(OcrGate::new(recognizer, config.ocr_enabled && !config.dry_run));

        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        let orchestrator = Arc::new(CaptureOrchestrator::new(
            config.clone(),
            fetcher,
            recorder,
            ocr,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            metrics,
            orchestrator,
        })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Run {
                url,
                item_id,
                owner_id,
                manifest,
                from,
                to,
                limit,
                order,
            } => {
                let filter = EnumerationFilter {
                    from,
                    to,
                    limit,
                    order: order.as_deref().map(parse_order).transpose()?.unwrap_or_default(),
                };
                let enumerator = match (url, manifest) {
                    (Some(url), _) => ManifestEnumerator::new(vec![single_item(&url, item_id, owner_id)?]),
                    (None, Some(path)) => ManifestEnumerator::from_path(&path)
                        .await
                        .with_context(|| format!("failed to load manifest {}", path.display()))?,
                    (None, None) => bail!("nothing to capture: pass --url or --manifest"),
                };
                self.run_capture(&enumerator, &filter).await
            }
            Commands::Normalize {
                input,
                output,
                no_trim,
            } => run_normalize(input, output, !no_trim).await,
            Commands::Validate { path } => validate_config_file(path).await,
        }
    }

    pub async fn run_capture(
        &self,
        enumerator: &ManifestEnumerator,
        filter: &EnumerationFilter,
    ) -> anyhow::Result<()> {
        let version = self.config.pipeline_version();
        let span = info_span!(
            "run",
            pipeline = self.config.profile.as_str(),
            pipeline_version = %version
        );

        async {
            info!(
                items = enumerator.len(),
                concurrency = self.config.concurrency,
                shard_index = self.config.shard.index,
                shard_count = self.config.shard.count,
                dry_run = self.config.dry_run,
                "Starting capture run"
            );
            let started = Instant::now();

            let summary = SummaryReporter::new(self.metrics.clone(), self.config.summary_interval).spawn();
            let launcher = Arc::new(ChromeLauncher::new(self.config.clone()));
            let pool = WorkerPool::new(
                self.config.clone(),
                self.orchestrator.clone(),
                launcher,
                self.metrics.clone(),
            );
            let report = pool.run(enumerator, filter).await;
            summary.abort();
            SummaryReporter::log_summary(&self.metrics);

            let report = report?;
            println!("Capture run completed in {}:", format_duration(started.elapsed()));
            println!("  Queued: {}", report.producer.queued);
            println!(
                "  Skipped: {} owner, {} shard, {} already done",
                report.producer.skipped_owner, report.producer.skipped_shard, report.producer.skipped_done
            );
            println!("  Done: {}", report.done());
            println!("  Terminal: {}", report.terminal());
            println!("  Error: {}", report.errors());
            if report.errors() > 0 {
                warn!(errors = report.errors(), "Some items ended in error");
            }
            Ok::<(), anyhow::Error>(())
        }
        .instrument(span)
        .await
    }
}

pub async fn run_normalize(input: PathBuf, output: PathBuf, trim: bool) -> anyhow::Result<()> {
    let raw = fs::read(&input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let asset = normalize(&raw, trim)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&output, &asset.bytes).await?;

    println!("Normalized {}:", input.display());
    println!("  Output: {}", output.display());
    println!("  Size: {} -> {}", format_bytes(raw.len()), format_bytes(asset.bytes.len()));
    println!("  Dimensions: {}x{}", asset.width, asset.height);
    println!("  Content hash: {}", asset.content_hash);
    println!("  Fingerprint: {}", asset.fingerprint);
    Ok(())
}

pub async fn validate_config_file(path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let content = fs::read_to_string(&path).await?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Profile: {}", config.profile.as_str());
    println!("  Pipeline version: {}", config.pipeline_version());
    println!("  Concurrency: {}", config.concurrency);
    println!("  Retries: {} (base delay {:?})", config.retry.max_retries, config.retry.base_delay);
    println!("  Page timeout: {:?}", config.timeouts.page);
    println!("  Shard: {}/{}", config.shard.index, config.shard.count);
    println!(
        "  Storage: {}://{} (local root {})",
        config.storage.scheme,
        config.storage.bucket,
        config.storage.local_root.display()
    );
    println!("  OCR: {}", if config.ocr_enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` wins over `--verbose` when set.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    Ok(())
}

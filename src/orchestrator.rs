//! The stage orchestrator: sequencing, checkpoint ownership, and failure
//! accounting.
//!
//! A run is three phases over the whole batch, in order: fetch everything,
//! transform everything, consume everything. Phases rather than a per-item
//! chain because the stages have opposite resource profiles — fetch is
//! network-bound and parallel, transform owns an exclusive accelerator, and
//! batching each keeps both resources saturated without interleaving them.
//!
//! The orchestrator is the only writer of the checkpoint store. Stage
//! components hand their outcomes back; every mark happens on this task, so
//! concurrent fetches never race on checkpoint state. Item failures are
//! recorded and the batch continues — only environmental errors (corrupt
//! checkpoint file, invalid config, missing credential, unwritable output)
//! abort the run.

use crate::catalog::{CatalogSource, ItemDescriptor};
use crate::checkpoint::{artifact_present, CheckpointStore, Stage, StageStatus};
use crate::config::{PipelineConfig, ProviderKind};
use crate::error::{PipelineError, StageError};
use crate::pipeline::consume::{
    self, Analyzer, ExtractedContent, LocalAnalyzer, OnlineAnalyzer, DEFAULT_LOCAL_BASE_URL,
    DEFAULT_LOCAL_MODEL, DEFAULT_ONLINE_MODEL,
};
use crate::pipeline::fetch::{FetchManager, Fetcher, HttpFetcher};
use crate::pipeline::worker::{ExitClass, WorkerRunner};
use crate::progress::{NoopProgress, ProgressHook};
use crate::report::RunReport;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Drives a full checkpoint-aware run over a catalog of items.
///
/// # Example
/// ```rust,no_run
/// use paperline::{Pipeline, PipelineConfig, JsonCatalog};
///
/// # async fn run() -> Result<(), paperline::PipelineError> {
/// let config = PipelineConfig::builder()
///     .data_root("data")
///     .worker_command(["python3", "ocr_engine.py"])
///     .build()?;
/// let catalog = JsonCatalog::new("catalog.json", config.payload_dir());
/// let report = Pipeline::new(config).run(&catalog).await?;
/// println!("{}", report.summary());
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Discover items from `catalog` and run every enabled stage over them.
    ///
    /// Returns the aggregate [`RunReport`]; per-item failures live inside it,
    /// fatal environmental errors come back as `Err`.
    pub async fn run(&self, catalog: &dyn CatalogSource) -> Result<RunReport, PipelineError> {
        let items = catalog.discover().await?;
        self.run_items(items).await
    }

    /// Run the pipeline over an already-discovered batch.
    pub async fn run_items(
        &self,
        mut items: Vec<ItemDescriptor>,
    ) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let config = &self.config;

        if let Some(limit) = config.limit {
            items.truncate(limit);
        }
        // The orchestrator owns the data layout; descriptors from any
        // catalog source get their payload directory assigned here.
        let payload_dir = config.payload_dir();
        for item in &mut items {
            item.dest_dir = payload_dir.clone();
        }

        let mut store = CheckpointStore::load(config.checkpoint_file())?;
        // Construct the analyzer before touching anything so a missing
        // credential aborts the run with no stage dispatched.
        let analyzer = if config.skip_consume {
            None
        } else {
            Some(self.analyzer()?)
        };

        let progress: ProgressHook = config
            .progress
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgress));
        let enabled = [config.skip_fetch, config.skip_transform, config.skip_consume]
            .iter()
            .filter(|skipped| !**skipped)
            .count();
        progress.on_run_start(items.len(), enabled);

        let mut report = RunReport {
            items: items.len(),
            ..RunReport::default()
        };
        info!(
            "Starting run: {} items, {} stages enabled",
            items.len(),
            enabled
        );

        if !config.skip_fetch {
            self.fetch_phase(&items, &mut store, &mut report, &progress)
                .await?;
        }
        if !config.skip_transform {
            self.transform_phase(&items, &mut store, &mut report, &progress)
                .await?;
        }
        if let Some(analyzer) = analyzer {
            self.consume_phase(&items, analyzer.as_ref(), &mut store, &mut report, &progress)
                .await?;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!("Run complete: {}", report.summary());
        if report.has_failures() {
            warn!("Failed items: {}", report.failed_ids().join(", "));
        }
        progress.on_run_complete(&report);
        Ok(report)
    }

    /// Phase 1: concurrent downloads for every item the checkpoint does not
    /// already cover.
    async fn fetch_phase(
        &self,
        items: &[ItemDescriptor],
        store: &mut CheckpointStore,
        report: &mut RunReport,
        progress: &ProgressHook,
    ) -> Result<(), PipelineError> {
        let config = &self.config;

        let mut to_fetch = Vec::new();
        for item in items {
            if store.should_run(&item.id, Stage::Fetch, &item.payload_path(), config.force) {
                to_fetch.push(item.clone());
            } else {
                debug!("{}: fetch checkpointed, skipping", item.id);
                report.fetch_skipped += 1;
                progress.on_stage_done(&item.id, Stage::Fetch, true);
            }
        }
        if to_fetch.is_empty() {
            return Ok(());
        }

        let fetcher: Arc<dyn Fetcher> = match &config.fetcher {
            Some(custom) => custom.clone(),
            None => Arc::new(HttpFetcher::new(config.fetch_timeout_secs)?),
        };
        let manager = FetchManager::new(
            fetcher,
            config.fetch_concurrency,
            config.fetch_retries,
            config.retry_backoff_ms,
            config.max_backoff_ms,
        );

        for outcome in manager.fetch_all(&to_fetch).await {
            match outcome.result {
                Ok(result) => {
                    store.mark(&outcome.item_id, Stage::Fetch, StageStatus::Done)?;
                    if result.already_present {
                        report.fetch_skipped += 1;
                    } else {
                        report.fetched += 1;
                    }
                    progress.on_stage_done(&outcome.item_id, Stage::Fetch, result.already_present);
                }
                Err(e) => {
                    let reason = e.to_string();
                    store.mark(
                        &outcome.item_id,
                        Stage::Fetch,
                        StageStatus::Failed {
                            reason: reason.clone(),
                            attempts: outcome.attempts,
                        },
                    )?;
                    report.fetch_failed += 1;
                    report.record_failure(&outcome.item_id, Stage::Fetch, &reason);
                    progress.on_stage_error(&outcome.item_id, Stage::Fetch, &reason);
                }
            }
        }
        Ok(())
    }

    /// Phase 2: one isolated worker process per item, strictly in sequence.
    async fn transform_phase(
        &self,
        items: &[ItemDescriptor],
        store: &mut CheckpointStore,
        report: &mut RunReport,
        progress: &ProgressHook,
    ) -> Result<(), PipelineError> {
        let config = &self.config;
        let runner = WorkerRunner::new(
            config.worker_command.clone(),
            config.worker_timeout_secs,
            config.extracted_root(),
        );

        for item in items {
            let payload = item.payload_path();
            if !self.fetch_satisfied(store, item) {
                debug!("{}: payload unavailable, transform not attempted", item.id);
                continue;
            }
            if !store.should_run(
                &item.id,
                Stage::Transform,
                &runner.extracted_path(item),
                config.force,
            ) {
                debug!("{}: transform checkpointed, skipping", item.id);
                report.transform_skipped += 1;
                progress.on_stage_done(&item.id, Stage::Transform, true);
                continue;
            }

            let result = runner.run(item, &payload, config.force).await;
            match result.exit {
                ExitClass::Completed => {
                    store.mark(&item.id, Stage::Transform, StageStatus::Done)?;
                    report.transformed += 1;
                    progress.on_stage_done(&item.id, Stage::Transform, false);
                }
                ExitClass::SkippedAlreadyDone => {
                    store.mark(&item.id, Stage::Transform, StageStatus::Done)?;
                    report.transform_skipped += 1;
                    progress.on_stage_done(&item.id, Stage::Transform, true);
                }
                ExitClass::TimedOut | ExitClass::Crashed => {
                    let error = result
                        .error()
                        .unwrap_or(StageError::TransformCrash {
                            exit_code: None,
                            diagnostics: String::new(),
                        })
                        .to_string();
                    store.mark(
                        &item.id,
                        Stage::Transform,
                        StageStatus::Failed {
                            reason: error.clone(),
                            attempts: 1,
                        },
                    )?;
                    if result.exit == ExitClass::TimedOut {
                        report.transform_timeout += 1;
                    } else {
                        report.transform_crash += 1;
                    }
                    report.record_failure(&item.id, Stage::Transform, &error);
                    progress.on_stage_error(&item.id, Stage::Transform, &error);
                }
            }
        }
        Ok(())
    }

    /// Phase 3: generate one analysis report per transformed item.
    async fn consume_phase(
        &self,
        items: &[ItemDescriptor],
        analyzer: &dyn Analyzer,
        store: &mut CheckpointStore,
        report: &mut RunReport,
        progress: &ProgressHook,
    ) -> Result<(), PipelineError> {
        let config = &self.config;
        let extracted_root = config.extracted_root();

        for item in items {
            let output_dir = extracted_root.join(item.slug());
            let report_file = consume::report_path(&output_dir);

            if !self.transform_satisfied(store, item, &output_dir) {
                debug!("{}: no extracted content, consume not attempted", item.id);
                continue;
            }
            if !store.should_run(&item.id, Stage::Consume, &report_file, config.force) {
                debug!("{}: consume checkpointed, skipping", item.id);
                report.consume_skipped += 1;
                progress.on_stage_done(&item.id, Stage::Consume, true);
                continue;
            }

            let analysis = match ExtractedContent::load(&item.id, &output_dir) {
                Ok(content) => analyzer.analyze(&content).await,
                Err(e) => Err(e),
            };
            match analysis {
                Ok(body) => {
                    // An unwritable output directory is environmental, not
                    // item-specific, so it aborts the run.
                    consume::write_report(&output_dir, &body)?;
                    store.mark(&item.id, Stage::Consume, StageStatus::Done)?;
                    report.consumed += 1;
                    progress.on_stage_done(&item.id, Stage::Consume, false);
                }
                Err(e) => {
                    let reason = e.to_string();
                    store.mark(
                        &item.id,
                        Stage::Consume,
                        StageStatus::Failed {
                            reason: reason.clone(),
                            attempts: 1,
                        },
                    )?;
                    report.consume_failed += 1;
                    report.record_failure(&item.id, Stage::Consume, &reason);
                    progress.on_stage_error(&item.id, Stage::Consume, &reason);
                }
            }
        }
        Ok(())
    }

    /// Whether the transform stage may run: the fetch checkpoint is done, or
    /// fetch is skipped entirely and the payload is simply expected on disk.
    fn fetch_satisfied(&self, store: &CheckpointStore, item: &ItemDescriptor) -> bool {
        if self.config.skip_fetch {
            artifact_present(&item.payload_path())
        } else {
            store.status(&item.id, Stage::Fetch).is_done()
        }
    }

    /// Whether the consume stage may run for an item.
    fn transform_satisfied(
        &self,
        store: &CheckpointStore,
        item: &ItemDescriptor,
        output_dir: &std::path::Path,
    ) -> bool {
        if self.config.skip_transform {
            artifact_present(&output_dir.join("full_extracted.md"))
        } else {
            store.status(&item.id, Stage::Transform).is_done()
        }
    }

    /// Resolve the analyzer from config: explicit injection wins, otherwise
    /// one is constructed for the selected provider.
    fn analyzer(&self) -> Result<Arc<dyn Analyzer>, PipelineError> {
        let config = &self.config;
        if let Some(custom) = &config.analyzer {
            return Ok(custom.clone());
        }
        match config.provider {
            ProviderKind::Online => {
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok());
                let model = config
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ONLINE_MODEL.to_string());
                Ok(Arc::new(OnlineAnalyzer::new(
                    model,
                    key,
                    config.consume_timeout_secs,
                )?))
            }
            ProviderKind::Local => {
                let model = config
                    .model
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string());
                let base = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.to_string());
                Ok(Arc::new(LocalAnalyzer::new(
                    model,
                    base,
                    config.consume_timeout_secs,
                )))
            }
        }
    }
}

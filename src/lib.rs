//! # paperline
//!
//! Checkpoint-driven batch pipeline for turning a catalog of research-paper
//! PDFs into model-generated analysis reports.
//!
//! Every item moves through three stages, each guarded by a durable
//! checkpoint so interrupted runs resume where they stopped:
//!
//! ```text
//!   catalog ──► fetch ──► transform (isolated OCR worker) ──► consume (LLM)
//! ```
//!
//! - **fetch** downloads payloads with bounded concurrency, retrying
//!   transient failures with exponential backoff. Only validated PDFs ever
//!   reach their final path.
//! - **transform** runs the OCR conversion in a fresh subprocess per item,
//!   one at a time, with a hard wall-clock budget. A crashed or hung worker
//!   takes its accelerator state down with it instead of poisoning the batch.
//! - **consume** feeds the extracted Markdown (and page renderings) to a
//!   local or hosted analysis model and writes `analysis_report.md`.
//!
//! Failures are isolated per item: one bad download or crashed worker is
//! recorded in the run report while the rest of the batch proceeds.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use paperline::{JsonCatalog, Pipeline, PipelineConfig};
//!
//! # async fn run() -> Result<(), paperline::PipelineError> {
//! let config = PipelineConfig::builder()
//!     .data_root("data")
//!     .worker_command(["python3", "ocr_engine.py"])
//!     .build()?;
//! let catalog = JsonCatalog::new("catalog.json", config.payload_dir());
//! let report = Pipeline::new(config).run(&catalog).await?;
//!
//! if report.has_failures() {
//!     eprintln!("rerun needed for: {:?}", report.failed_ids());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Reruns are cheap: a stage is skipped when its checkpoint says done *and*
//! its output artifact still exists, so a second invocation touches only the
//! items that failed (or whose artifacts were deleted out-of-band). Pass
//! `force` to redo everything.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod report;

pub use catalog::{CatalogSource, ItemDescriptor, JsonCatalog, StaticCatalog};
pub use checkpoint::{CheckpointStore, Stage, StageStatus};
pub use config::{PipelineConfig, PipelineConfigBuilder, ProviderKind};
pub use error::{PipelineError, StageError};
pub use orchestrator::Pipeline;
pub use pipeline::consume::{Analyzer, ExtractedContent, LocalAnalyzer, OnlineAnalyzer, PageContent};
pub use pipeline::fetch::{FetchManager, FetchOutcome, FetchResult, Fetcher, HttpFetcher};
pub use pipeline::worker::{ExitClass, TransformResult, WorkerRunner};
pub use progress::{NoopProgress, PipelineProgress, ProgressHook};
pub use report::{ItemFailure, RunReport};

/// Library version, from Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

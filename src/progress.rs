//! Progress-callback trait for per-item pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] to receive real-time
//! events as the orchestrator works through the batch.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a channel, a database record, or a terminal progress bar
//! without the library knowing anything about how the host application
//! communicates. The trait is `Send + Sync` because fetch results complete
//! concurrently.

use crate::checkpoint::Stage;
use crate::report::RunReport;
use std::sync::Arc;

/// Called by the orchestrator as items move through the stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `on_stage_done` and `on_stage_error` may be invoked
/// from the fetch fan-out, so implementations must synchronise shared state.
pub trait PipelineProgress: Send + Sync {
    /// Called once, after config validation, before any stage dispatch.
    ///
    /// `stages` is how many stages are enabled this run (1–3), so a bar of
    /// length `total_items * stages` tracks overall completion.
    fn on_run_start(&self, total_items: usize, stages: usize) {
        let _ = (total_items, stages);
    }

    /// A stage finished for an item — freshly executed or skipped via checkpoint.
    fn on_stage_done(&self, item_id: &str, stage: Stage, skipped: bool) {
        let _ = (item_id, stage, skipped);
    }

    /// A stage failed for an item; the batch continues.
    fn on_stage_error(&self, item_id: &str, stage: Stage, error: &str) {
        let _ = (item_id, stage, error);
    }

    /// Called once with the final report.
    fn on_run_complete(&self, report: &RunReport) {
        let _ = report;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressHook = Arc<dyn PipelineProgress>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        done: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineProgress for Counting {
        fn on_stage_done(&self, _item: &str, _stage: Stage, _skipped: bool) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stage_error(&self, _item: &str, _stage: Stage, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_does_not_panic() {
        let hook = NoopProgress;
        hook.on_run_start(3, 3);
        hook.on_stage_done("p", Stage::Fetch, false);
        hook.on_stage_error("p", Stage::Transform, "crash");
        hook.on_run_complete(&RunReport::default());
    }

    #[test]
    fn counting_hook_receives_events() {
        let hook = Counting {
            done: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        };
        hook.on_stage_done("a", Stage::Fetch, false);
        hook.on_stage_done("a", Stage::Transform, true);
        hook.on_stage_error("b", Stage::Fetch, "HTTP 500");
        assert_eq!(hook.done.load(Ordering::SeqCst), 2);
        assert_eq!(hook.errors.load(Ordering::SeqCst), 1);
    }
}

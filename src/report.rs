//! End-of-run reporting: aggregate counters plus the list of failed items.
//!
//! The report is the user-facing contract for targeted reruns: every failure
//! carries its item id, stage, and reason, and the checkpoint skip logic
//! guarantees a rerun touches only those items.

use crate::checkpoint::Stage;
use serde::Serialize;

/// One failed item/stage pair with its human-readable reason.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub stage: Stage,
    pub reason: String,
}

/// Aggregate outcome of one orchestrator run.
///
/// `*_skipped` counts stages short-circuited by checkpoint state;
/// they represent work preserved from earlier runs, not work done now.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Items in the batch after `--limit` truncation.
    pub items: usize,

    pub fetched: usize,
    pub fetch_skipped: usize,
    pub fetch_failed: usize,

    pub transformed: usize,
    pub transform_skipped: usize,
    pub transform_timeout: usize,
    pub transform_crash: usize,

    pub consumed: usize,
    pub consume_skipped: usize,
    pub consume_failed: usize,

    pub duration_ms: u64,

    /// Every failure this run, in the order it was observed.
    pub failures: Vec<ItemFailure>,
}

impl RunReport {
    pub fn record_failure(&mut self, item_id: &str, stage: Stage, reason: impl Into<String>) {
        self.failures.push(ItemFailure {
            item_id: item_id.to_string(),
            stage,
            reason: reason.into(),
        });
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Ids of all failed items, deduplicated, in first-failure order.
    pub fn failed_ids(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.failures
            .iter()
            .filter(|f| seen.insert(f.item_id.as_str()))
            .map(|f| f.item_id.as_str())
            .collect()
    }

    /// One-line summary used in log output.
    pub fn summary(&self) -> String {
        format!(
            "{} items: {} fetched ({} failed), {} transformed ({} timeout, {} crash), {} consumed ({} failed)",
            self.items,
            self.fetched,
            self.fetch_failed,
            self.transformed,
            self.transform_timeout,
            self.transform_crash,
            self.consumed,
            self.consume_failed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_ids_dedup_preserves_order() {
        let mut report = RunReport::default();
        report.record_failure("b", Stage::Fetch, "HTTP 503");
        report.record_failure("a", Stage::Transform, "crash");
        report.record_failure("b", Stage::Consume, "no text");
        assert_eq!(report.failed_ids(), vec!["b", "a"]);
        assert!(report.has_failures());
    }

    #[test]
    fn summary_mentions_counts() {
        let report = RunReport {
            items: 10,
            fetched: 9,
            fetch_failed: 1,
            transformed: 8,
            transform_crash: 1,
            consumed: 8,
            ..Default::default()
        };
        let s = report.summary();
        assert!(s.contains("10 items"));
        assert!(s.contains("1 crash"));
    }
}

//! The three pipeline stages and their shared data flow.
//!
//! ```text
//!   catalog ──► [fetch] ──► {data_root}/original/{slug}.pdf
//!                  │
//!                  ▼
//!             [transform] ──► {data_root}/extracted/{slug}/full_extracted.md
//!         (subprocess, 1-at-a-time)        └─ pages/page_N/…
//!                  │
//!                  ▼
//!              [consume] ──► {data_root}/extracted/{slug}/analysis_report.md
//! ```
//!
//! Each stage module owns exactly one concern and reports outcomes upward;
//! checkpoint writes and failure accounting live in
//! [`crate::orchestrator::Pipeline`], never in the stages themselves. Fetch
//! fans out under a concurrency cap, transform is strictly serialised behind
//! the worker gate, and consume walks items in order.

pub mod consume;
pub mod fetch;
pub mod worker;

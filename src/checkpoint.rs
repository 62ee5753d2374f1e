//! Durable per-item stage checkpoints: the source of truth for resumability.
//!
//! The store maps item id → [`CheckpointRecord`], persisted as a single JSON
//! file. Every mutation is written immediately via atomic replace (temp file
//! in the same directory, then rename) so a crash right after a stage
//! completes never loses the completion record and never leaves a
//! half-written file behind.
//!
//! ## Single writer
//!
//! Only the orchestrator mutates the store; stage components return results
//! to the orchestrator task, which serialises all [`CheckpointStore::mark`]
//! calls without needing a lock. Concurrent fetches therefore never race on
//! checkpoint state.
//!
//! ## Skip policy
//!
//! A stage is skipped iff its checkpoint says [`StageStatus::Done`] **and**
//! its expected output artifact still exists on disk (non-empty). A `done`
//! record whose artifact was deleted out-of-band reverts to pending and the
//! stage reruns — see [`CheckpointStore::should_run`].

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// The three ordered pipeline stages applied to every item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Retrieve the raw payload (PDF) from its source URL.
    Fetch,
    /// Run the heavy OCR conversion in an isolated worker process.
    Transform,
    /// Generate the analysis report from the extracted text.
    Consume,
}

impl Stage {
    /// Stable lowercase name used in checkpoint files and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
            Stage::Consume => "consume",
        }
    }

    /// The stage that must be `Done` before this one may run.
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Fetch => None,
            Stage::Transform => Some(Stage::Fetch),
            Stage::Consume => Some(Stage::Transform),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tri-state completion status of one stage for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet attempted (the default for unknown item/stage pairs).
    Pending,
    /// Completed; skipped on subsequent runs while its artifact survives.
    Done,
    /// Attempted and failed this run. Re-evaluated as pending next run.
    Failed { reason: String, attempts: u32 },
}

impl StageStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, StageStatus::Done)
    }
}

/// Persisted checkpoint state for one item.
///
/// Unknown extra fields written by newer versions are preserved through the
/// `extra` flatten map, so an old binary can re-write a newer file without
/// destroying data it does not understand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Stage name → status. Stages never observed are simply absent.
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageStatus>,
    /// Unix timestamp (seconds) of the last mutation to this record.
    #[serde(default)]
    pub last_updated: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The durable checkpoint store: one JSON file, loaded at startup,
/// rewritten atomically on every mark.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    records: BTreeMap<String, CheckpointRecord>,
}

impl CheckpointStore {
    /// Load persisted state, or start empty when no file exists yet.
    ///
    /// # Errors
    /// [`PipelineError::CorruptCheckpoint`] when the file exists but cannot
    /// be parsed — the caller must halt rather than silently discard records.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();

        let records = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                PipelineError::CorruptCheckpoint {
                    path: path.clone(),
                    detail: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(PipelineError::CorruptCheckpoint {
                    path,
                    detail: e.to_string(),
                })
            }
        };

        debug!("Loaded {} checkpoint records from {}", records.len(), path.display());
        Ok(Self { path, records })
    }

    /// Status of one stage for one item; `Pending` for unknown pairs.
    pub fn status(&self, item_id: &str, stage: Stage) -> StageStatus {
        self.records
            .get(item_id)
            .and_then(|r| r.stages.get(&stage))
            .cloned()
            .unwrap_or(StageStatus::Pending)
    }

    /// Record a stage outcome and persist immediately.
    ///
    /// Idempotent: marking the same status twice is a no-op (returns `false`
    /// without rewriting the file).
    pub fn mark(
        &mut self,
        item_id: &str,
        stage: Stage,
        status: StageStatus,
    ) -> Result<bool, PipelineError> {
        if self.status(item_id, stage) == status {
            return Ok(false);
        }

        let record = self.records.entry(item_id.to_string()).or_default();
        record.stages.insert(stage, status);
        record.last_updated = unix_now();
        self.persist()?;
        Ok(true)
    }

    /// Whether a stage should run for this item.
    ///
    /// Skipped (returns `false`) iff the checkpoint says `Done` and the
    /// expected `artifact` exists and is non-empty. `force` overrides `Done`
    /// records entirely — the explicit user escape hatch from monotonicity.
    pub fn should_run(&self, item_id: &str, stage: Stage, artifact: &Path, force: bool) -> bool {
        if force {
            return true;
        }
        match self.status(item_id, stage) {
            StageStatus::Done => {
                if artifact_present(artifact) {
                    false
                } else {
                    warn!(
                        "{}: {} checkpoint is done but artifact {} is missing — rerunning",
                        item_id,
                        stage,
                        artifact.display()
                    );
                    true
                }
            }
            _ => true,
        }
    }

    /// Number of items with at least one recorded stage.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the full map to disk via temp-file-then-rename.
    fn persist(&self) -> Result<(), PipelineError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::CheckpointWriteFailed {
            path: self.path.clone(),
            source: e,
        })?;

        // Temp file must live on the same filesystem as the target for the
        // rename to be atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            PipelineError::CheckpointWriteFailed {
                path: self.path.clone(),
                source: e,
            }
        })?;

        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| PipelineError::Internal(format!("checkpoint serialise: {e}")))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| PipelineError::CheckpointWriteFailed {
                path: self.path.clone(),
                source: e,
            })?;

        tmp.persist(&self.path)
            .map_err(|e| PipelineError::CheckpointWriteFailed {
                path: self.path.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}

/// An artifact counts as present only when it exists and is non-empty —
/// zero-byte files are what interrupted writes leave behind.
pub fn artifact_present(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::load(dir.path().join("checkpoints.json")).unwrap()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert_eq!(store.status("x", Stage::Fetch), StageStatus::Pending);
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, "{ not json").unwrap();
        match CheckpointStore::load(&path) {
            Err(PipelineError::CorruptCheckpoint { .. }) => {}
            other => panic!("expected CorruptCheckpoint, got {other:?}"),
        }
    }

    #[test]
    fn mark_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.json");

        let mut store = CheckpointStore::load(&path).unwrap();
        assert!(store.mark("paper1", Stage::Fetch, StageStatus::Done).unwrap());

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(reloaded.status("paper1", Stage::Fetch), StageStatus::Done);
        assert_eq!(reloaded.status("paper1", Stage::Transform), StageStatus::Pending);
    }

    #[test]
    fn mark_same_status_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        assert!(store.mark("p", Stage::Fetch, StageStatus::Done).unwrap());
        assert!(!store.mark("p", Stage::Fetch, StageStatus::Done).unwrap());
    }

    #[test]
    fn failed_record_keeps_reason_and_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.json");
        let mut store = CheckpointStore::load(&path).unwrap();
        store
            .mark(
                "p",
                Stage::Fetch,
                StageStatus::Failed {
                    reason: "HTTP 503".into(),
                    attempts: 4,
                },
            )
            .unwrap();

        let reloaded = CheckpointStore::load(&path).unwrap();
        match reloaded.status("p", Stage::Fetch) {
            StageStatus::Failed { reason, attempts } => {
                assert_eq!(reason, "HTTP 503");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn should_run_respects_done_with_artifact() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let artifact = dir.path().join("out.md");

        // Pending → run regardless of artifact
        assert!(store.should_run("p", Stage::Transform, &artifact, false));

        store.mark("p", Stage::Transform, StageStatus::Done).unwrap();

        // Done but artifact missing → rerun
        assert!(store.should_run("p", Stage::Transform, &artifact, false));

        // Done with non-empty artifact → skip
        std::fs::write(&artifact, "## Page 0\n").unwrap();
        assert!(!store.should_run("p", Stage::Transform, &artifact, false));

        // Empty artifact counts as missing
        std::fs::write(&artifact, "").unwrap();
        assert!(store.should_run("p", Stage::Transform, &artifact, false));
    }

    #[test]
    fn force_overrides_done() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let artifact = dir.path().join("out.md");
        std::fs::write(&artifact, "content").unwrap();
        store.mark("p", Stage::Fetch, StageStatus::Done).unwrap();
        assert!(store.should_run("p", Stage::Fetch, &artifact, true));
    }

    #[test]
    fn failed_is_reevaluated_as_pending() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        let artifact = dir.path().join("out.md");
        std::fs::write(&artifact, "content").unwrap();
        store
            .mark(
                "p",
                Stage::Fetch,
                StageStatus::Failed {
                    reason: "boom".into(),
                    attempts: 1,
                },
            )
            .unwrap();
        // Failed never satisfies the skip predicate, even with an artifact.
        assert!(store.should_run("p", Stage::Fetch, &artifact, false));
    }

    #[test]
    fn unknown_extra_fields_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(
            &path,
            r#"{"p":{"stages":{"fetch":{"state":"done"}},"last_updated":5,"sha256":"abc123"}}"#,
        )
        .unwrap();

        let mut store = CheckpointStore::load(&path).unwrap();
        assert_eq!(store.status("p", Stage::Fetch), StageStatus::Done);
        store.mark("p", Stage::Transform, StageStatus::Done).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("abc123"), "extra field dropped: {text}");
    }

    #[test]
    fn stage_prerequisites_are_ordered() {
        assert_eq!(Stage::Fetch.prerequisite(), None);
        assert_eq!(Stage::Transform.prerequisite(), Some(Stage::Fetch));
        assert_eq!(Stage::Consume.prerequisite(), Some(Stage::Transform));
    }
}

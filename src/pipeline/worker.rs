//! Isolated OCR worker: one killable subprocess per item.
//!
//! ## Why a fresh process per item?
//!
//! The OCR model holds accelerator memory that survives arbitrary library
//! failure modes — a hung kernel or fragmented VRAM inside a long-lived
//! in-process worker would poison every subsequent item. A fresh OS process
//! per invocation guarantees full resource teardown on exit no matter how the
//! transform misbehaves internally, trading per-item startup cost for
//! crash containment.
//!
//! ## Process contract
//!
//! The configured command is invoked as
//! `worker_command... <payload_path> <extracted_root>` and must write
//! `{extracted_root}/{slug}/full_extracted.md` (plus any per-page side
//! artifacts under `pages/`) and exit 0. Nonzero exit or signal death is a
//! crash; exceeding the wall-clock budget gets the process killed and is
//! classified as a timeout, not a crash, so callers can tell "took too long"
//! from "errored". stdout/stderr are always captured — accelerator failures
//! are often only diagnosable from them after the fact.

use crate::catalog::ItemDescriptor;
use crate::error::StageError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a worker invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    /// Exit 0 and the expected output artifact exists.
    Completed,
    /// Killed after exceeding the wall-clock budget.
    TimedOut,
    /// Nonzero exit, signal death, or a broken output contract.
    Crashed,
    /// A non-empty output artifact already existed; no process was spawned.
    SkippedAlreadyDone,
}

/// Structured result of one worker invocation.
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub item_id: String,
    /// Per-item output directory: `{extracted_root}/{slug}`.
    pub output_dir: PathBuf,
    /// The primary artifact: `{output_dir}/full_extracted.md`.
    pub extracted_path: PathBuf,
    pub exit: ExitClass,
    pub exit_code: Option<i32>,
    /// Captured stdout + stderr; empty on success.
    pub diagnostics: String,
    pub duration_ms: u64,
}

impl TransformResult {
    /// The stage error corresponding to a failed invocation, if any.
    pub fn error(&self) -> Option<StageError> {
        match self.exit {
            ExitClass::Completed | ExitClass::SkippedAlreadyDone => None,
            ExitClass::TimedOut => Some(StageError::TransformTimeout {
                secs: self.duration_ms / 1000,
            }),
            ExitClass::Crashed => Some(StageError::TransformCrash {
                exit_code: self.exit_code,
                diagnostics: self.diagnostics.clone(),
            }),
        }
    }
}

/// Spawns and supervises the per-item OCR subprocess.
///
/// Invocations are strictly serialised: the internal mutex is held from
/// spawn until the process is reaped, because the worker owns an exclusive
/// accelerator that cannot be time-sliced. Item `i+1` waits until item `i`'s
/// process has fully exited and released its resources.
pub struct WorkerRunner {
    command: Vec<String>,
    timeout: Duration,
    extracted_root: PathBuf,
    gate: Mutex<()>,
}

impl WorkerRunner {
    pub fn new(command: Vec<String>, timeout_secs: u64, extracted_root: impl Into<PathBuf>) -> Self {
        Self {
            command,
            timeout: Duration::from_secs(timeout_secs),
            extracted_root: extracted_root.into(),
            gate: Mutex::new(()),
        }
    }

    /// Expected per-item output directory.
    pub fn output_dir(&self, item: &ItemDescriptor) -> PathBuf {
        self.extracted_root.join(item.slug())
    }

    /// Expected primary artifact for an item.
    pub fn extracted_path(&self, item: &ItemDescriptor) -> PathBuf {
        self.output_dir(item).join("full_extracted.md")
    }

    /// Run the transform for one item.
    ///
    /// `force` discards any existing output first; otherwise a non-empty
    /// artifact short-circuits to [`ExitClass::SkippedAlreadyDone`].
    ///
    /// Safe to call again after any failure: partial output is removed before
    /// returning, and each process starts from a clean slate.
    pub async fn run(&self, item: &ItemDescriptor, payload: &Path, force: bool) -> TransformResult {
        let output_dir = self.output_dir(item);
        let extracted_path = self.extracted_path(item);

        if force {
            let _ = tokio::fs::remove_dir_all(&output_dir).await;
        } else if crate::checkpoint::artifact_present(&extracted_path) {
            debug!("{}: extracted output already present, skipping OCR", item.id);
            return TransformResult {
                item_id: item.id.clone(),
                output_dir,
                extracted_path,
                exit: ExitClass::SkippedAlreadyDone,
                exit_code: None,
                diagnostics: String::new(),
                duration_ms: 0,
            };
        }

        // Exclusive accelerator: exactly one worker process alive at a time.
        let _gate = self.gate.lock().await;
        let start = Instant::now();
        info!("{}: starting OCR worker", item.id);

        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => {
                return self.failed(
                    item,
                    output_dir,
                    extracted_path,
                    ExitClass::Crashed,
                    None,
                    "empty worker command".into(),
                    start,
                )
                .await
            }
        };

        let mut child = match Command::new(program)
            .args(args)
            .arg(payload)
            .arg(&self.extracted_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return self.failed(
                    item,
                    output_dir,
                    extracted_path,
                    ExitClass::Crashed,
                    None,
                    format!("failed to spawn worker '{program}': {e}"),
                    start,
                )
                .await
            }
        };

        // Drain both pipes concurrently with the wait so the child can never
        // deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let wait_result = tokio::time::timeout(self.timeout, child.wait()).await;

        let (exit, exit_code) = match wait_result {
            Err(_elapsed) => {
                warn!(
                    "{}: worker exceeded {}s budget — killing",
                    item.id,
                    self.timeout.as_secs()
                );
                // The subprocess may be unresponsive; forced termination, not
                // a cooperative cancellation request.
                let _ = child.start_kill();
                let _ = child.wait().await;
                (ExitClass::TimedOut, None)
            }
            Ok(Err(e)) => {
                warn!("{}: failed to await worker: {e}", item.id);
                let _ = child.start_kill();
                let _ = child.wait().await;
                (ExitClass::Crashed, None)
            }
            Ok(Ok(status)) if status.success() => (ExitClass::Completed, status.code()),
            Ok(Ok(status)) => (ExitClass::Crashed, status.code()),
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let diagnostics = join_diagnostics(&stdout, &stderr);

        match exit {
            ExitClass::Completed => {
                if crate::checkpoint::artifact_present(&extracted_path) {
                    info!(
                        "{}: OCR completed in {}ms",
                        item.id,
                        start.elapsed().as_millis()
                    );
                    TransformResult {
                        item_id: item.id.clone(),
                        output_dir,
                        extracted_path,
                        exit: ExitClass::Completed,
                        exit_code,
                        diagnostics: String::new(),
                        duration_ms: start.elapsed().as_millis() as u64,
                    }
                } else {
                    // Exit 0 without the artifact violates the contract.
                    self.failed(
                        item,
                        output_dir,
                        extracted_path,
                        ExitClass::Crashed,
                        exit_code,
                        format!("worker exited 0 but produced no output\n{diagnostics}"),
                        start,
                    )
                    .await
                }
            }
            class => {
                self.failed(item, output_dir, extracted_path, class, exit_code, diagnostics, start)
                    .await
            }
        }
    }

    /// Build a failure result, removing partial output so the next
    /// invocation starts clean.
    #[allow(clippy::too_many_arguments)]
    async fn failed(
        &self,
        item: &ItemDescriptor,
        output_dir: PathBuf,
        extracted_path: PathBuf,
        exit: ExitClass,
        exit_code: Option<i32>,
        diagnostics: String,
        start: Instant,
    ) -> TransformResult {
        if output_dir.exists() {
            warn!("{}: removing partial output {}", item.id, output_dir.display());
            let _ = tokio::fs::remove_dir_all(&output_dir).await;
        }
        TransformResult {
            item_id: item.id.clone(),
            output_dir,
            extracted_path,
            exit,
            exit_code,
            diagnostics,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn join_diagnostics(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::new();
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if !stdout.trim().is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("stderr:\n");
        out.push_str(stderr.trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptor;
    use tempfile::TempDir;

    fn item_in(dir: &TempDir) -> ItemDescriptor {
        descriptor("p1", "Test Paper", "https://x/p1.pdf", dir.path())
    }

    /// Worker script that honours the process contract: writes the artifact
    /// under `{root}/{payload stem}/` and exits 0.
    fn ok_command(dir: &TempDir) -> Vec<String> {
        let script = dir.path().join("ok_worker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\npdf=\"$1\"\nroot=\"$2\"\nname=$(basename \"$pdf\" .pdf)\nmkdir -p \"$root/$name\"\necho '## Page 0' > \"$root/$name/full_extracted.md\"\n",
        )
        .unwrap();
        vec!["/bin/sh".into(), script.to_string_lossy().into_owned()]
    }

    #[tokio::test]
    async fn completed_run_leaves_artifact() {
        let dir = TempDir::new().unwrap();
        let item = item_in(&dir);
        let payload = item.payload_path();
        std::fs::write(&payload, b"%PDF").unwrap();

        let runner = WorkerRunner::new(ok_command(&dir), 30, dir.path().join("extracted"));
        let result = runner.run(&item, &payload, false).await;

        assert_eq!(result.exit, ExitClass::Completed);
        assert!(result.extracted_path.exists());
        assert!(result.error().is_none());
    }

    #[tokio::test]
    async fn second_run_is_skipped_already_done() {
        let dir = TempDir::new().unwrap();
        let item = item_in(&dir);
        let payload = item.payload_path();
        std::fs::write(&payload, b"%PDF").unwrap();

        let runner = WorkerRunner::new(ok_command(&dir), 30, dir.path().join("extracted"));
        assert_eq!(runner.run(&item, &payload, false).await.exit, ExitClass::Completed);
        assert_eq!(
            runner.run(&item, &payload, false).await.exit,
            ExitClass::SkippedAlreadyDone
        );
    }

    #[tokio::test]
    async fn force_reruns_despite_existing_output() {
        let dir = TempDir::new().unwrap();
        let item = item_in(&dir);
        let payload = item.payload_path();
        std::fs::write(&payload, b"%PDF").unwrap();

        let runner = WorkerRunner::new(ok_command(&dir), 30, dir.path().join("extracted"));
        runner.run(&item, &payload, false).await;
        let rerun = runner.run(&item, &payload, true).await;
        assert_eq!(rerun.exit, ExitClass::Completed);
    }

    #[tokio::test]
    async fn exit_zero_without_artifact_is_a_crash() {
        let dir = TempDir::new().unwrap();
        let item = item_in(&dir);
        let payload = item.payload_path();
        std::fs::write(&payload, b"%PDF").unwrap();

        let runner = WorkerRunner::new(
            vec!["/bin/sh".into(), "-c".into(), "true".into()],
            30,
            dir.path().join("extracted"),
        );
        let result = runner.run(&item, &payload, false).await;
        assert_eq!(result.exit, ExitClass::Crashed);
        assert!(result.diagnostics.contains("no output"));
    }

    #[test]
    fn diagnostics_join_labels_streams() {
        let joined = join_diagnostics(b"loading model\n", b"CUDA error\n");
        assert!(joined.contains("stdout:"));
        assert!(joined.contains("loading model"));
        assert!(joined.contains("stderr:"));
        assert!(joined.contains("CUDA error"));
    }
}

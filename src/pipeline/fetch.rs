//! Payload retrieval: bounded-concurrency downloads with retry and backoff.
//!
//! ## Retry strategy
//!
//! Download hosts fail in two distinct ways. Network errors, timeouts, and
//! 5xx/429 responses are transient and frequent under concurrent load;
//! exponential backoff (`retry_backoff_ms * 2^(attempt-1)`, capped) retries
//! them without hammering a recovering host. A 404 or a payload that is not
//! a PDF will never get better — those fail the item immediately.
//!
//! ## Atomic writes
//!
//! Payload bytes stream to a `.part` file next to the destination and are
//! renamed only after the magic-byte and size checks pass, so a crash
//! mid-download never leaves a checkpoint-eligible but corrupt file. Stale
//! undersized payloads from earlier aborted runs are deleted before retrying.

use crate::catalog::ItemDescriptor;
use crate::error::{PipelineError, StageError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Payloads smaller than this are treated as failed downloads — error pages
/// and truncated bodies, never real documents.
pub const MIN_PAYLOAD_BYTES: u64 = 1024;

/// Successful retrieval of one payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FetchResult {
    /// Final on-disk location of the payload.
    pub path: PathBuf,
    pub bytes: u64,
    /// Reserved for content validation on skip; not yet populated.
    pub checksum: Option<String>,
    /// A valid payload already existed, so no network request was made.
    pub already_present: bool,
}

/// Outcome of the full retry loop for one item.
#[derive(Debug)]
pub struct FetchOutcome {
    pub item_id: String,
    /// Attempts actually made (0 when the payload was already present).
    pub attempts: u32,
    pub result: Result<FetchResult, StageError>,
}

/// One retrieval attempt. The seam between the retry/concurrency machinery
/// and the transport; tests inject a mock, production uses [`HttpFetcher`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `item`'s payload and leave it at `dest` (atomically).
    async fn fetch(&self, item: &ItemDescriptor, dest: &Path) -> Result<FetchResult, StageError>;
}

/// HTTP transport over reqwest with a per-attempt timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, item: &ItemDescriptor, dest: &Path) -> Result<FetchResult, StageError> {
        let response = self
            .client
            .get(&item.source_url)
            .send()
            .await
            .map_err(|e| StageError::TransientFetch {
                reason: if e.is_timeout() {
                    format!("timeout fetching {}", item.source_url)
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {status} for {}", item.source_url);
            // 5xx and 429 are worth retrying; everything else is permanent.
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(StageError::TransientFetch { reason })
            } else {
                Err(StageError::PermanentFetch { reason })
            };
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| StageError::TransientFetch {
                reason: format!("body read failed: {e}"),
            })?;

        write_payload(dest, &body).await
    }
}

/// Validate and atomically place payload bytes at `dest`.
async fn write_payload(dest: &Path, body: &[u8]) -> Result<FetchResult, StageError> {
    if !body.starts_with(b"%PDF") {
        return Err(StageError::PermanentFetch {
            reason: format!(
                "payload is not a PDF (first bytes: {:?})",
                &body[..body.len().min(4)]
            ),
        });
    }
    if (body.len() as u64) < MIN_PAYLOAD_BYTES {
        // Undersized bodies are usually truncation — retrying can succeed.
        return Err(StageError::TransientFetch {
            reason: format!("payload truncated ({} bytes)", body.len()),
        });
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StageError::TransientFetch {
                reason: format!("create {}: {e}", parent.display()),
            })?;
    }

    let part = part_path(dest);
    if let Err(e) = tokio::fs::write(&part, body).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(StageError::TransientFetch {
            reason: format!("write {}: {e}", part.display()),
        });
    }
    if let Err(e) = tokio::fs::rename(&part, dest).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(StageError::TransientFetch {
            reason: format!("rename {}: {e}", dest.display()),
        });
    }

    Ok(FetchResult {
        path: dest.to_path_buf(),
        bytes: body.len() as u64,
        checksum: None,
        already_present: false,
    })
}

fn part_path(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

/// Drives a batch of downloads under a concurrency cap, retrying transient
/// failures per item with bounded exponential backoff.
///
/// Failure isolation is per item: one item exhausting its budget neither
/// blocks nor cancels its siblings. Checkpoint writes stay with the caller —
/// this type only reports outcomes.
pub struct FetchManager {
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
    max_retries: u32,
    backoff_ms: u64,
    max_backoff_ms: u64,
}

impl FetchManager {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        concurrency: usize,
        max_retries: u32,
        backoff_ms: u64,
        max_backoff_ms: u64,
    ) -> Self {
        Self {
            fetcher,
            concurrency,
            max_retries,
            backoff_ms,
            max_backoff_ms,
        }
    }

    /// Fetch every item, up to `concurrency` in flight at once.
    ///
    /// Outcomes arrive in completion order, not catalog order — each is keyed
    /// by item id so the caller can persist them independently.
    pub async fn fetch_all(&self, items: &[ItemDescriptor]) -> Vec<FetchOutcome> {
        stream::iter(items.iter().map(|item| self.fetch_with_retry(item)))
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// The bounded retry loop for one item.
    async fn fetch_with_retry(&self, item: &ItemDescriptor) -> FetchOutcome {
        let dest = item.payload_path();

        // A valid payload from an earlier run short-circuits the network
        // entirely; an undersized leftover is deleted and re-fetched.
        match std::fs::metadata(&dest) {
            Ok(meta) if meta.len() >= MIN_PAYLOAD_BYTES => {
                debug!("{}: payload already present ({} bytes)", item.id, meta.len());
                return FetchOutcome {
                    item_id: item.id.clone(),
                    attempts: 0,
                    result: Ok(FetchResult {
                        path: dest,
                        bytes: meta.len(),
                        checksum: None,
                        already_present: true,
                    }),
                };
            }
            Ok(_) => {
                warn!("{}: removing undersized stale payload", item.id);
                let _ = std::fs::remove_file(&dest);
            }
            Err(_) => {}
        }

        let mut last_err: Option<StageError> = None;

        for attempt in 1..=self.max_retries + 1 {
            if attempt > 1 {
                let delay = self.backoff_delay(attempt);
                warn!(
                    "{}: retry {}/{} after {:?}",
                    item.id,
                    attempt - 1,
                    self.max_retries,
                    delay
                );
                sleep(delay).await;
            }

            match self.fetcher.fetch(item, &dest).await {
                Ok(result) => {
                    info!("{}: fetched {} bytes", item.id, result.bytes);
                    return FetchOutcome {
                        item_id: item.id.clone(),
                        attempts: attempt,
                        result: Ok(result),
                    };
                }
                Err(e) if !e.is_retryable() => {
                    warn!("{}: permanent fetch failure — {}", item.id, e);
                    return FetchOutcome {
                        item_id: item.id.clone(),
                        attempts: attempt,
                        result: Err(e),
                    };
                }
                Err(e) => {
                    warn!("{}: attempt {} failed — {}", item.id, attempt, e);
                    last_err = Some(e);
                }
            }
        }

        FetchOutcome {
            item_id: item.id.clone(),
            attempts: self.max_retries + 1,
            result: Err(last_err.unwrap_or(StageError::TransientFetch {
                reason: "retries exhausted".into(),
            })),
        }
    }

    /// Delay before `attempt` (2-based: the first retry doubles from base).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptor;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mock transport: fails configured ids forever, succeeds otherwise by
    /// writing a minimal valid payload.
    struct ScriptedFetcher {
        fail_ids: Vec<String>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedFetcher {
        fn new(fail_ids: &[&str]) -> Self {
            Self {
                fail_ids: fail_ids.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls_for(&self, id: &str) -> u32 {
            *self.calls.lock().unwrap().get(id).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            item: &ItemDescriptor,
            dest: &Path,
        ) -> Result<FetchResult, StageError> {
            *self.calls.lock().unwrap().entry(item.id.clone()).or_insert(0) += 1;
            if self.fail_ids.contains(&item.id) {
                return Err(StageError::TransientFetch {
                    reason: "HTTP 503".into(),
                });
            }
            let mut body = b"%PDF-1.4\n".to_vec();
            body.resize(MIN_PAYLOAD_BYTES as usize + 64, b'x');
            write_payload(dest, &body).await
        }
    }

    fn manager(fetcher: Arc<dyn Fetcher>, retries: u32) -> FetchManager {
        // 1 ms backoff keeps retry tests fast and deterministic.
        FetchManager::new(fetcher, 4, retries, 1, 10)
    }

    #[tokio::test]
    async fn failing_item_gets_full_retry_budget_without_blocking_siblings() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new(&["item3"]));
        let items: Vec<_> = (0..10)
            .map(|i| {
                descriptor(
                    &format!("item{i}"),
                    &format!("Paper {i}"),
                    "https://x/p.pdf",
                    dir.path(),
                )
            })
            .collect();

        let mgr = manager(fetcher.clone(), 2);
        let outcomes = mgr.fetch_all(&items).await;

        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item_id, "item3");
        // R retries + the initial attempt
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(fetcher.calls_for("item3"), 3);

        for o in outcomes.iter().filter(|o| o.result.is_ok()) {
            let r = o.result.as_ref().unwrap();
            assert!(r.path.exists());
            assert!(r.bytes >= MIN_PAYLOAD_BYTES);
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        struct NotFound;
        #[async_trait]
        impl Fetcher for NotFound {
            async fn fetch(
                &self,
                _item: &ItemDescriptor,
                _dest: &Path,
            ) -> Result<FetchResult, StageError> {
                Err(StageError::PermanentFetch {
                    reason: "HTTP 404".into(),
                })
            }
        }

        let dir = TempDir::new().unwrap();
        let items = vec![descriptor("gone", "Gone", "https://x/gone.pdf", dir.path())];
        let outcomes = manager(Arc::new(NotFound), 5).fetch_all(&items).await;
        assert_eq!(outcomes[0].attempts, 1);
        assert!(matches!(
            outcomes[0].result,
            Err(StageError::PermanentFetch { .. })
        ));
    }

    #[tokio::test]
    async fn existing_valid_payload_skips_network() {
        let dir = TempDir::new().unwrap();
        let item = descriptor("done", "Done Paper", "https://x/d.pdf", dir.path());
        let mut body = b"%PDF-1.4\n".to_vec();
        body.resize(2048, b'y');
        std::fs::write(item.payload_path(), &body).unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new(&[]));
        let outcomes = manager(fetcher.clone(), 3).fetch_all(&[item]).await;
        assert_eq!(outcomes[0].attempts, 0);
        assert!(outcomes[0].result.as_ref().unwrap().already_present);
        assert_eq!(fetcher.calls_for("done"), 0);
    }

    #[tokio::test]
    async fn undersized_stale_payload_is_replaced() {
        let dir = TempDir::new().unwrap();
        let item = descriptor("stale", "Stale Paper", "https://x/s.pdf", dir.path());
        std::fs::write(item.payload_path(), b"%PDF tiny").unwrap();

        let fetcher = Arc::new(ScriptedFetcher::new(&[]));
        let outcomes = manager(fetcher.clone(), 3).fetch_all(std::slice::from_ref(&item)).await;
        let result = outcomes[0].result.as_ref().unwrap();
        assert!(!result.already_present);
        assert!(result.bytes >= MIN_PAYLOAD_BYTES);
        assert_eq!(fetcher.calls_for("stale"), 1);
    }

    #[tokio::test]
    async fn non_pdf_body_is_permanent() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("x.pdf");
        let err = write_payload(&dest, b"<html>rate limited</html>")
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::PermanentFetch { .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mgr = FetchManager::new(
            Arc::new(ScriptedFetcher::new(&[])),
            1,
            5,
            500,
            2_000,
        );
        assert_eq!(mgr.backoff_delay(2), Duration::from_millis(500));
        assert_eq!(mgr.backoff_delay(3), Duration::from_millis(1_000));
        assert_eq!(mgr.backoff_delay(4), Duration::from_millis(2_000));
        // capped
        assert_eq!(mgr.backoff_delay(5), Duration::from_millis(2_000));
    }
}

//! Configuration for a pipeline run.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, log them, and diff two runs to
//! understand why their outcomes differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest; `build()` validates the combination.

use crate::error::PipelineError;
use crate::pipeline::consume::Analyzer;
use crate::pipeline::fetch::Fetcher;
use crate::progress::ProgressHook;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Which consumption provider generates the analysis reports.
///
/// A closed set, selected once at configuration time — the orchestrator is
/// provider-agnostic behind the [`Analyzer`] trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Locally-hosted model behind an OpenAI-compatible endpoint. (default)
    #[default]
    Local,
    /// Remote API-backed provider; requires a credential.
    Online,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Online => "online",
        }
    }
}

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use paperline::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .data_root("data")
///     .fetch_concurrency(4)
///     .fetch_retries(3)
///     .worker_command(["python3", "ocr_engine.py"])
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root directory for all pipeline state. Payloads land in
    /// `{data_root}/original`, extracted output in `{data_root}/extracted`,
    /// and checkpoints in `{data_root}/checkpoints.json` unless overridden.
    pub data_root: PathBuf,

    /// Explicit checkpoint file location; `None` derives it from `data_root`.
    pub checkpoint_path: Option<PathBuf>,

    /// Concurrent in-flight downloads. Default: 5.
    ///
    /// Download hosts throttle aggressively; five connections keeps a large
    /// batch moving without tripping 429 responses. Raise it for fast mirrors,
    /// lower it when the source rate-limits.
    pub fetch_concurrency: usize,

    /// Maximum retry attempts per item after the first fetch fails. Default: 3.
    ///
    /// Most 5xx and timeout errors are transient. Permanent errors (404,
    /// non-PDF payload) are never retried — they fail the item immediately.
    pub fetch_retries: u32,

    /// Per-attempt fetch timeout in seconds. Default: 60.
    pub fetch_timeout_secs: u64,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, capped at
    /// `max_backoff_ms`. Exponential backoff avoids the thundering-herd
    /// problem where N workers retry simultaneously against a recovering host.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds. Default: 30 000.
    pub max_backoff_ms: u64,

    /// Command line (program + leading args) of the OCR worker. The runner
    /// appends `<payload_path> <extracted_root>` on each invocation.
    pub worker_command: Vec<String>,

    /// Wall-clock budget for one worker invocation, in seconds. Default: 1200.
    ///
    /// A stuck accelerator kernel can hang a worker forever; twenty minutes
    /// covers the slowest legitimate documents while bounding the damage.
    pub worker_timeout_secs: u64,

    /// Consumption provider variant. Default: [`ProviderKind::Local`].
    pub provider: ProviderKind,

    /// Model identifier for the analysis provider; `None` uses the
    /// provider's default.
    pub model: Option<String>,

    /// Credential for the online provider. Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,

    /// Endpoint base URL for the local provider. `None` uses the default
    /// local server address.
    pub base_url: Option<String>,

    /// Per-analysis-call timeout in seconds. Default: 300.
    pub consume_timeout_secs: u64,

    /// Process at most this many items from the catalog. `None` = all.
    pub limit: Option<usize>,

    /// Skip the fetch stage entirely (operate on already-downloaded payloads).
    pub skip_fetch: bool,
    /// Skip the transform stage entirely.
    pub skip_transform: bool,
    /// Skip the consume stage entirely.
    pub skip_consume: bool,

    /// Re-run stages even when their checkpoint says done.
    pub force: bool,

    /// Pre-constructed fetcher. Takes precedence over the HTTP fetcher;
    /// the injection point for tests and custom transports.
    pub fetcher: Option<Arc<dyn Fetcher>>,

    /// Pre-constructed analyzer. Takes precedence over `provider`.
    pub analyzer: Option<Arc<dyn Analyzer>>,

    /// Progress event sink.
    pub progress: Option<ProgressHook>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            checkpoint_path: None,
            fetch_concurrency: 5,
            fetch_retries: 3,
            fetch_timeout_secs: 60,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
            worker_command: Vec::new(),
            worker_timeout_secs: 1200,
            provider: ProviderKind::default(),
            model: None,
            api_key: None,
            base_url: None,
            consume_timeout_secs: 300,
            limit: None,
            skip_fetch: false,
            skip_transform: false,
            skip_consume: false,
            force: false,
            fetcher: None,
            analyzer: None,
            progress: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("data_root", &self.data_root)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("fetch_retries", &self.fetch_retries)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("worker_command", &self.worker_command)
            .field("worker_timeout_secs", &self.worker_timeout_secs)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("limit", &self.limit)
            .field("skip_fetch", &self.skip_fetch)
            .field("skip_transform", &self.skip_transform)
            .field("skip_consume", &self.skip_consume)
            .field("force", &self.force)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<dyn Fetcher>"))
            .field("analyzer", &self.analyzer.as_ref().map(|_| "<dyn Analyzer>"))
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory where raw payloads are written.
    pub fn payload_dir(&self) -> PathBuf {
        self.data_root.join("original")
    }

    /// Directory holding one extracted-output subdirectory per item.
    pub fn extracted_root(&self) -> PathBuf {
        self.data_root.join("extracted")
    }

    /// Checkpoint file path (explicit or derived from `data_root`).
    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("checkpoints.json"))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.data_root = root.into();
        self
    }

    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_path = Some(path.into());
        self
    }

    pub fn fetch_concurrency(mut self, n: usize) -> Self {
        self.config.fetch_concurrency = n;
        self
    }

    pub fn fetch_retries(mut self, n: u32) -> Self {
        self.config.fetch_retries = n;
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn worker_command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.worker_command = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn worker_timeout_secs(mut self, secs: u64) -> Self {
        self.config.worker_timeout_secs = secs;
        self
    }

    pub fn provider(mut self, kind: ProviderKind) -> Self {
        self.config.provider = kind;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn consume_timeout_secs(mut self, secs: u64) -> Self {
        self.config.consume_timeout_secs = secs;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.config.limit = Some(n);
        self
    }

    pub fn skip_fetch(mut self, v: bool) -> Self {
        self.config.skip_fetch = v;
        self
    }

    pub fn skip_transform(mut self, v: bool) -> Self {
        self.config.skip_transform = v;
        self
    }

    pub fn skip_consume(mut self, v: bool) -> Self {
        self.config.skip_consume = v;
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.config.fetcher = Some(fetcher);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.config.analyzer = Some(analyzer);
        self
    }

    pub fn progress(mut self, hook: ProgressHook) -> Self {
        self.config.progress = Some(hook);
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Invalid combinations fail here, before any stage dispatch: a
    /// half-configured run must not touch checkpoints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.fetch_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "fetch concurrency must be ≥ 1".into(),
            ));
        }
        if c.worker_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker timeout must be ≥ 1s".into(),
            ));
        }
        if !c.skip_transform && c.worker_command.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "worker command is required unless the transform stage is skipped".into(),
            ));
        }
        if c.skip_fetch && c.skip_transform && c.skip_consume {
            return Err(PipelineError::InvalidConfig(
                "all three stages are skipped — nothing to do".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_derive_from_data_root() {
        let config = PipelineConfig::builder()
            .data_root("/srv/papers")
            .skip_transform(true)
            .build()
            .unwrap();
        assert_eq!(config.payload_dir(), PathBuf::from("/srv/papers/original"));
        assert_eq!(config.extracted_root(), PathBuf::from("/srv/papers/extracted"));
        assert_eq!(
            config.checkpoint_file(),
            PathBuf::from("/srv/papers/checkpoints.json")
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = PipelineConfig::builder()
            .fetch_concurrency(0)
            .skip_transform(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn transform_requires_worker_command() {
        let err = PipelineConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("worker command"));

        // Either a command or an explicit skip satisfies validation.
        assert!(PipelineConfig::builder()
            .worker_command(["python3", "ocr_engine.py"])
            .build()
            .is_ok());
        assert!(PipelineConfig::builder().skip_transform(true).build().is_ok());
    }

    #[test]
    fn all_stages_skipped_is_rejected() {
        let err = PipelineConfig::builder()
            .skip_fetch(true)
            .skip_transform(true)
            .skip_consume(true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nothing to do"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = PipelineConfig::builder()
            .skip_transform(true)
            .api_key("sk-secret")
            .build()
            .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

//! CLI binary for paperline.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints the run report.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paperline::{
    JsonCatalog, Pipeline, PipelineConfig, PipelineProgress, ProgressHook, ProviderKind,
    RunReport, Stage,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress hook using indicatif ────────────────────────────────────────

/// Terminal progress hook: one bar across the whole run, sized to
/// `items × enabled stages`, with a per-event log line above it.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_run_start

        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading catalog…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl PipelineProgress for CliProgress {
    fn on_run_start(&self, total_items: usize, stages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len}  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length((total_items * stages) as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Processing");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_items} items across {stages} stages…"))
        ));
    }

    fn on_stage_done(&self, item_id: &str, stage: Stage, skipped: bool) {
        if skipped {
            self.bar
                .println(format!("  {} {item_id}  {stage}  {}", dim("·"), dim("cached")));
        } else {
            self.bar
                .println(format!("  {} {item_id}  {stage}", green("✓")));
        }
        self.bar.set_message(format!("{item_id} ({stage})"));
        self.bar.inc(1);
    }

    fn on_stage_error(&self, item_id: &str, stage: Stage, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg: String = if error.chars().count() > 80 {
            let head: String = error.chars().take(79).collect();
            format!("{head}\u{2026}")
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {item_id}  {stage}  {}", red("✗"), red(&msg)));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, report: &RunReport) {
        self.bar.finish_and_clear();
        if report.has_failures() {
            eprintln!(
                "{} {}  ({} failed: {})",
                cyan("⚠"),
                report.summary(),
                red(&report.failures.len().to_string()),
                report.failed_ids().join(", "),
            );
        } else {
            eprintln!("{} {}", green("✔"), bold(&report.summary()));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline over a scraped catalog
  paperline catalog.json --worker "python3 ocr_engine.py"

  # Resume an interrupted run (same command — completed items are skipped)
  paperline catalog.json --worker "python3 ocr_engine.py"

  # First three items only, downloads already done
  paperline catalog.json --worker "python3 ocr_engine.py" --skip-fetch --limit 3

  # Downloads only (prepare a corpus offline)
  paperline catalog.json --skip-transform --skip-consume

  # Hosted model instead of the local one
  paperline catalog.json --worker "python3 ocr_engine.py" \
      --provider online --model gpt-5

  # Redo everything, ignoring checkpoints
  paperline catalog.json --worker "python3 ocr_engine.py" --force

  # Machine-readable run report
  paperline catalog.json --worker "python3 ocr_engine.py" --json > report.json

DATA LAYOUT (under --data-root, default ./data):
  original/{title}_{id}.pdf              downloaded payloads
  extracted/{title}_{id}/full_extracted.md   OCR output
  extracted/{title}_{id}/pages/page_N/       per-page artifacts
  extracted/{title}_{id}/analysis_report.md  final report
  checkpoints.json                       resumability state

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          Credential for --provider online
  PAPERLINE_WORKER        Override --worker
  PAPERLINE_DATA_ROOT     Override --data-root
  PAPERLINE_BASE_URL      Override --base-url (local provider endpoint)
  RUST_LOG                Tracing filter (overrides -v/-q defaults)

EXIT STATUS:
  0  every enabled stage completed for every item
  1  the run finished, but some items failed (rerun to retry just those)
  2  fatal error — nothing ran, or the run aborted
"#;

/// Fetch, OCR, and analyse a catalog of papers with checkpointed stages.
#[derive(Parser, Debug)]
#[command(
    name = "paperline",
    version,
    about = "Fetch, OCR, and analyse a catalog of papers with checkpointed stages",
    long_about = "Runs a catalog of papers through three resumable stages: download the PDFs \
(concurrently, with retry), convert each through an isolated OCR worker process, and generate \
an analysis report per paper with a local or hosted model. Completed work is checkpointed and \
skipped on rerun, so interrupting and restarting is always safe.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Catalog file: a JSON array of {id, title, source_url} entries.
    catalog: PathBuf,

    /// Root directory for payloads, extracted output, and checkpoints.
    #[arg(long, env = "PAPERLINE_DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    /// OCR worker command (whitespace-split); the payload path and output
    /// root are appended on each invocation.
    #[arg(long, env = "PAPERLINE_WORKER")]
    worker: Option<String>,

    /// Wall-clock budget per worker invocation, in seconds.
    #[arg(long, env = "PAPERLINE_WORKER_TIMEOUT", default_value_t = 1200)]
    worker_timeout: u64,

    /// Concurrent downloads.
    #[arg(short, long, env = "PAPERLINE_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// Retries per item after the first download attempt fails.
    #[arg(long, env = "PAPERLINE_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Per-attempt download timeout in seconds.
    #[arg(long, env = "PAPERLINE_FETCH_TIMEOUT", default_value_t = 60)]
    fetch_timeout: u64,

    /// Initial retry backoff in milliseconds (doubles per attempt).
    #[arg(long, env = "PAPERLINE_BACKOFF_MS", default_value_t = 500)]
    backoff_ms: u64,

    /// Analysis provider: local, online.
    #[arg(long, env = "PAPERLINE_PROVIDER", value_enum, default_value = "local")]
    provider: ProviderArg,

    /// Model ID for the analysis provider (defaults per provider).
    #[arg(long, env = "PAPERLINE_MODEL")]
    model: Option<String>,

    /// Credential for the online provider.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the local provider's OpenAI-compatible endpoint.
    #[arg(long, env = "PAPERLINE_BASE_URL")]
    base_url: Option<String>,

    /// Per-analysis-call timeout in seconds.
    #[arg(long, env = "PAPERLINE_CONSUME_TIMEOUT", default_value_t = 300)]
    consume_timeout: u64,

    /// Process at most N items from the catalog.
    #[arg(short, long)]
    limit: Option<usize>,

    /// Skip the download stage (payloads already on disk).
    #[arg(long)]
    skip_fetch: bool,

    /// Skip the OCR stage.
    #[arg(long)]
    skip_transform: bool,

    /// Skip the analysis stage.
    #[arg(long)]
    skip_consume: bool,

    /// Re-run every stage, ignoring checkpoints.
    #[arg(long)]
    force: bool,

    /// Checkpoint file location (default: {data-root}/checkpoints.json).
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Print the run report as JSON on stdout (implies --no-progress).
    #[arg(long)]
    json: bool,

    /// Write failed item ids to this file, one per line (overwritten each
    /// run; removed when everything succeeded).
    #[arg(long)]
    failed_list: Option<PathBuf>,

    /// Disable the progress bar.
    #[arg(long, env = "PAPERLINE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAPERLINE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAPERLINE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    Local,
    Online,
}

impl From<ProviderArg> for ProviderKind {
    fn from(v: ProviderArg) -> Self {
        match v {
            ProviderArg::Local => ProviderKind::Local,
            ProviderArg::Online => ProviderKind::Online,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {e:#}", red("error:"));
        std::process::exit(2);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli, show_progress)?;
    let catalog = JsonCatalog::new(&cli.catalog, config.payload_dir());

    let report = Pipeline::new(config)
        .run(&catalog)
        .await
        .context("Pipeline run failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !show_progress && !cli.quiet {
        eprintln!("{}", report.summary());
        if report.has_failures() {
            eprintln!("Failed items: {}", report.failed_ids().join(", "));
        }
    }

    if let Some(ref path) = cli.failed_list {
        if report.has_failures() {
            let mut lines = report.failed_ids().join("\n");
            lines.push('\n');
            std::fs::write(path, lines)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        } else {
            std::fs::remove_file(path).ok();
        }
    }

    if report.has_failures() {
        // Distinct from the fatal-error exit so scripts can tell "rerun to
        // retry" apart from "fix the setup".
        std::process::exit(1);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, show_progress: bool) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .data_root(&cli.data_root)
        .fetch_concurrency(cli.concurrency)
        .fetch_retries(cli.retries)
        .fetch_timeout_secs(cli.fetch_timeout)
        .retry_backoff_ms(cli.backoff_ms)
        .worker_timeout_secs(cli.worker_timeout)
        .provider(cli.provider.into())
        .consume_timeout_secs(cli.consume_timeout)
        .skip_fetch(cli.skip_fetch)
        .skip_transform(cli.skip_transform)
        .skip_consume(cli.skip_consume)
        .force(cli.force);

    if let Some(ref worker) = cli.worker {
        builder = builder.worker_command(worker.split_whitespace());
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref url) = cli.base_url {
        builder = builder.base_url(url);
    }
    if let Some(limit) = cli.limit {
        builder = builder.limit(limit);
    }
    if let Some(ref path) = cli.checkpoint {
        builder = builder.checkpoint_path(path);
    }
    if show_progress {
        builder = builder.progress(CliProgress::new() as ProgressHook);
    }

    builder.build().context("Invalid configuration")
}

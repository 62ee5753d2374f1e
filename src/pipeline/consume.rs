//! Consume stage: feed extracted content to an analysis model.
//!
//! Both backends speak the OpenAI chat-completions wire format; the
//! difference is only where the endpoint lives and whether a credential is
//! attached. [`LocalAnalyzer`] talks to a local OpenAI-compatible server and
//! needs no key; [`OnlineAnalyzer`] talks to a hosted API and refuses to
//! construct without one. The [`Analyzer`] trait is the seam tests use to
//! substitute a scripted model.

use crate::error::{PipelineError, StageError};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default hosted model.
pub const DEFAULT_ONLINE_MODEL: &str = "gpt-5";
/// Default local vision-language model.
pub const DEFAULT_LOCAL_MODEL: &str = "Qwen/Qwen3-VL-4B-Thinking";
/// Default local OpenAI-compatible endpoint.
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434/v1";

/// Keep prompts inside typical context windows; the tail of a very long
/// paper (appendices, reference lists) carries the least signal.
const MAX_TEXT_CHARS: usize = 120_000;
/// Upper bound on images attached to one request.
const MAX_IMAGES: usize = 16;

const SYSTEM_PROMPT: &str = "You are an expert reviewer of machine learning \
research papers. You are given the extracted text of a paper, page by page, \
with any figure or table images found on each page inserted after that \
page's text. Produce a structured review in Markdown with these sections: \
## Summary, ## Key Contributions, ## Methods, ## Strengths, ## Weaknesses, \
## Questions for the Authors. Ground every claim in the paper itself; if the \
extraction looks incomplete or garbled, say so explicitly instead of guessing.";

/// One page of extracted content: its text plus the figure/table images
/// found on it.
pub struct PageContent {
    pub number: u32,
    pub text: String,
    /// Images in filename order, as (mime type, raw bytes).
    pub images: Vec<(String, Vec<u8>)>,
}

/// Extracted artifacts for one item, loaded from the transform output
/// directory.
pub struct ExtractedContent {
    pub item_id: String,
    /// Concatenated Markdown for the whole document.
    pub markdown: String,
    /// Per-page text and figures, in page order. May be empty when the
    /// worker produced only the concatenated document.
    pub pages: Vec<PageContent>,
}

impl ExtractedContent {
    /// Load `full_extracted.md` plus the per-page `pages/page_N/` artifacts
    /// (text from `result.mmd`, figures from `images/`, falling back to the
    /// page rendering) from a transform output directory.
    pub fn load(item_id: &str, output_dir: &Path) -> Result<Self, StageError> {
        let markdown_path = output_dir.join("full_extracted.md");
        let markdown =
            std::fs::read_to_string(&markdown_path).map_err(|e| StageError::Consumption {
                provider: "loader".into(),
                reason: format!("cannot read {}: {e}", markdown_path.display()),
            })?;
        if markdown.trim().is_empty() {
            return Err(StageError::Consumption {
                provider: "loader".into(),
                reason: format!("{} is empty", markdown_path.display()),
            });
        }

        let pages = load_pages(&output_dir.join("pages"));
        debug!(
            "{item_id}: loaded {} chars of markdown, {} pages ({} images)",
            markdown.len(),
            pages.len(),
            pages.iter().map(|p| p.images.len()).sum::<usize>(),
        );
        Ok(Self {
            item_id: item_id.to_string(),
            markdown,
            pages,
        })
    }
}

fn load_pages(pages_dir: &Path) -> Vec<PageContent> {
    let mut numbered: Vec<(u32, PathBuf)> = match std::fs::read_dir(pages_dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                let n = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("page_")?
                    .parse()
                    .ok()?;
                path.is_dir().then_some((n, path))
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    numbered.sort_by_key(|(n, _)| *n);

    numbered
        .into_iter()
        .map(|(number, dir)| PageContent {
            number,
            text: std::fs::read_to_string(dir.join("result.mmd")).unwrap_or_default(),
            images: page_images(&dir),
        })
        .collect()
}

/// Figure/table crops from `images/` when present, otherwise the whole-page
/// rendering sitting next to `result.mmd`.
fn page_images(page_dir: &Path) -> Vec<(String, Vec<u8>)> {
    let cropped = images_in(&page_dir.join("images"));
    if !cropped.is_empty() {
        return cropped;
    }
    images_in(page_dir)
}

fn images_in(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let mime = match path.extension().and_then(|e| e.to_str()) {
                Some("png") => "image/png",
                Some("jpg") | Some("jpeg") => "image/jpeg",
                _ => return None,
            };
            std::fs::read(&path).ok().map(|bytes| (mime.to_string(), bytes))
        })
        .collect()
}

/// Model boundary for the consume stage.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Short provider name for logs and error classification.
    fn name(&self) -> &str;

    /// Produce the analysis report body for one item's extracted content.
    async fn analyze(&self, content: &ExtractedContent) -> Result<String, StageError>;
}

/// Hosted chat-completions backend. Requires a credential up front so a
/// missing key fails the run at configuration time, not mid-batch.
pub struct OnlineAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OnlineAnalyzer {
    pub fn new(
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or(PipelineError::MissingCredential {
                provider: "online".into(),
            })?;
        Ok(Self {
            client: http_client(timeout_secs),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Analyzer for OnlineAnalyzer {
    fn name(&self) -> &str {
        "online"
    }

    async fn analyze(&self, content: &ExtractedContent) -> Result<String, StageError> {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&chat_request(&self.model, content));
        execute_chat(self.name(), request).await
    }
}

/// Local OpenAI-compatible backend (ollama, vLLM, LM Studio). No credential.
pub struct LocalAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl LocalAnalyzer {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let base = base_url.into();
        Self {
            client: http_client(timeout_secs),
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Analyzer for LocalAnalyzer {
    fn name(&self) -> &str {
        "local"
    }

    async fn analyze(&self, content: &ExtractedContent) -> Result<String, StageError> {
        let request = self
            .client
            .post(&self.endpoint)
            .json(&chat_request(&self.model, content));
        execute_chat(self.name(), request).await
    }
}

fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

fn truncate_on_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

fn image_part(mime: &str, bytes: &[u8]) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    json!({
        "type": "image_url",
        "image_url": { "url": format!("data:{mime};base64,{encoded}") },
    })
}

/// Build a multimodal chat-completions request body.
///
/// With per-page content available, each page's text is followed by the
/// figures found on that page so the model sees them in context. Without it
/// (a worker that only emits the concatenated document), the full Markdown
/// goes in as a single block.
fn chat_request(model: &str, content: &ExtractedContent) -> serde_json::Value {
    let mut parts = vec![json!({
        "type": "text",
        "text": "Review the following paper.",
    })];
    let mut budget = MAX_TEXT_CHARS;
    let mut images_left = MAX_IMAGES;

    if content.pages.is_empty() {
        parts.push(json!({
            "type": "text",
            "text": truncate_on_char_boundary(&content.markdown, budget),
        }));
    } else {
        for page in &content.pages {
            if budget == 0 {
                break;
            }
            let text = truncate_on_char_boundary(&page.text, budget);
            budget -= text.len();
            parts.push(json!({
                "type": "text",
                "text": format!("--- Page {} ---\n{text}", page.number),
            }));
            for (mime, bytes) in page.images.iter().take(images_left) {
                parts.push(image_part(mime, bytes));
            }
            images_left = images_left.saturating_sub(page.images.len());
        }
    }

    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": SYSTEM_PROMPT },
            { "role": "user", "content": parts },
        ],
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

async fn execute_chat(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<String, StageError> {
    let consumption = |reason: String| StageError::Consumption {
        provider: provider.to_string(),
        reason,
    };

    let response = request
        .send()
        .await
        .map_err(|e| consumption(format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(consumption(format!(
            "HTTP {status}: {}",
            body.chars().take(300).collect::<String>()
        )));
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .map_err(|e| consumption(format!("malformed response: {e}")))?;

    let report = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .unwrap_or_default();
    if report.trim().is_empty() {
        return Err(consumption("model returned an empty report".into()));
    }
    Ok(report)
}

/// Where the final report for an item lives.
pub fn report_path(output_dir: &Path) -> PathBuf {
    output_dir.join("analysis_report.md")
}

/// Atomically write the analysis report next to the extracted content.
/// A crash mid-write never leaves a truncated report that a later run
/// would mistake for completed work.
pub fn write_report(output_dir: &Path, body: &str) -> Result<PathBuf, PipelineError> {
    let path = report_path(output_dir);
    let map_err = |e: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.clone(),
        source: e,
    };

    let tmp = tempfile::NamedTempFile::new_in(output_dir).map_err(map_err)?;
    std::fs::write(tmp.path(), body).map_err(map_err)?;
    tmp.persist(&path).map_err(|e| map_err(e.error))?;
    info!("Wrote report {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_page(root: &Path, n: u32, text: &str, images: &[(&str, &[u8])]) {
        let page_dir = root.join("pages").join(format!("page_{n}"));
        std::fs::create_dir_all(&page_dir).unwrap();
        std::fs::write(page_dir.join("result.mmd"), text).unwrap();
        for (name, bytes) in images {
            let img_dir = page_dir.join("images");
            std::fs::create_dir_all(&img_dir).unwrap();
            std::fs::write(img_dir.join(name), bytes).unwrap();
        }
    }

    #[test]
    fn load_reads_pages_in_numeric_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("full_extracted.md"), "full text").unwrap();
        // page_10 after page_2: numeric, not lexicographic.
        seed_page(dir.path(), 10, "ten", &[]);
        seed_page(dir.path(), 2, "two", &[("fig1.png", b"png-bytes")]);

        let content = ExtractedContent::load("p1", dir.path()).unwrap();
        assert_eq!(content.markdown, "full text");
        assert_eq!(content.pages.len(), 2);
        assert_eq!(content.pages[0].number, 2);
        assert_eq!(content.pages[0].text, "two");
        assert_eq!(content.pages[0].images.len(), 1);
        assert_eq!(content.pages[0].images[0].0, "image/png");
        assert_eq!(content.pages[1].number, 10);
        assert!(content.pages[1].images.is_empty());
    }

    #[test]
    fn load_falls_back_to_page_rendering_when_no_crops() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("full_extracted.md"), "text").unwrap();
        let page_dir = dir.path().join("pages/page_0");
        std::fs::create_dir_all(&page_dir).unwrap();
        std::fs::write(page_dir.join("result.mmd"), "page text").unwrap();
        std::fs::write(page_dir.join("original.jpg"), b"jpeg-bytes").unwrap();

        let content = ExtractedContent::load("p1", dir.path()).unwrap();
        assert_eq!(content.pages[0].images.len(), 1);
        assert_eq!(content.pages[0].images[0].0, "image/jpeg");
    }

    #[test]
    fn load_rejects_empty_markdown() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("full_extracted.md"), "   \n").unwrap();
        assert!(matches!(
            ExtractedContent::load("p1", dir.path()),
            Err(StageError::Consumption { .. })
        ));
    }

    #[test]
    fn load_tolerates_missing_pages_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("full_extracted.md"), "just the doc").unwrap();
        let content = ExtractedContent::load("p1", dir.path()).unwrap();
        assert!(content.pages.is_empty());
    }

    #[test]
    fn chat_request_interleaves_page_text_and_figures() {
        let content = ExtractedContent {
            item_id: "p1".into(),
            markdown: "full".into(),
            pages: vec![
                PageContent {
                    number: 0,
                    text: "intro".into(),
                    images: vec![("image/png".into(), b"img".to_vec())],
                },
                PageContent {
                    number: 1,
                    text: "method".into(),
                    images: Vec::new(),
                },
            ],
        };
        let body = chat_request("test-model", &content);

        assert_eq!(body["model"], "test-model");
        let parts = body["messages"][1]["content"].as_array().unwrap();
        // preamble, page 0 text, page 0 image, page 1 text
        assert_eq!(parts.len(), 4);
        assert!(parts[1]["text"].as_str().unwrap().contains("Page 0"));
        assert!(parts[1]["text"].as_str().unwrap().contains("intro"));
        let url = parts[2]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert!(parts[3]["text"].as_str().unwrap().contains("method"));
    }

    #[test]
    fn chat_request_without_pages_sends_full_markdown() {
        let content = ExtractedContent {
            item_id: "p1".into(),
            markdown: "the whole paper".into(),
            pages: Vec::new(),
        };
        let body = chat_request("m", &content);
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["text"], "the whole paper");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; cutting at an odd byte offset must back off.
        let text = "é".repeat(10);
        assert_eq!(truncate_on_char_boundary(&text, 7), "ééé");
        assert_eq!(truncate_on_char_boundary(&text, 20), text);
    }

    #[test]
    fn online_analyzer_requires_credential() {
        assert!(matches!(
            OnlineAnalyzer::new(DEFAULT_ONLINE_MODEL, None, 30),
            Err(PipelineError::MissingCredential { .. })
        ));
        assert!(matches!(
            OnlineAnalyzer::new(DEFAULT_ONLINE_MODEL, Some(String::new()), 30),
            Err(PipelineError::MissingCredential { .. })
        ));
        assert!(OnlineAnalyzer::new(DEFAULT_ONLINE_MODEL, Some("sk-test".into()), 30).is_ok());
    }

    #[test]
    fn local_analyzer_normalises_base_url() {
        let analyzer = LocalAnalyzer::new(DEFAULT_LOCAL_MODEL, "http://localhost:11434/v1/", 30);
        assert_eq!(
            analyzer.endpoint,
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn write_report_replaces_existing() {
        let dir = TempDir::new().unwrap();
        write_report(dir.path(), "first").unwrap();
        let path = write_report(dir.path(), "second").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "second");
    }
}

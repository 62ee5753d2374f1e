//! Item discovery: descriptors and the catalog-source boundary.
//!
//! The orchestrator's contract with catalog discovery is read-only and
//! pull-based: [`CatalogSource::discover`] is called once per run, before any
//! stage dispatch. The scraping logic that talks to a remote review system
//! lives behind this trait; the crate ships [`JsonCatalog`], which loads a
//! previously scraped catalog file, so the pipeline itself never depends on
//! the remote API being reachable.

use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One unit of work, immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Stable unique id (e.g. the submission id on the hosting site).
    pub id: String,
    /// Human-readable title; sanitised for use in filenames.
    pub title: String,
    /// Where the raw PDF payload lives.
    pub source_url: String,
    /// Directory the payload is written into.
    #[serde(default)]
    pub dest_dir: PathBuf,
}

impl ItemDescriptor {
    /// Filesystem-safe stem shared by the payload and all derived artifacts:
    /// `{sanitised_title}_{id}`.
    pub fn slug(&self) -> String {
        format!("{}_{}", sanitise_title(&self.title), self.id)
    }

    /// Full path of the fetched payload: `dest_dir/{slug}.pdf`.
    pub fn payload_path(&self) -> PathBuf {
        self.dest_dir.join(format!("{}.pdf", self.slug()))
    }
}

/// Reduce a title to `[A-Za-z0-9_]` so it is safe in any filename:
/// keep alphanumerics and spaces, trim, then turn spaces into underscores.
pub fn sanitise_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ')
        .collect();
    kept.trim_end().replace(' ', "_")
}

/// Read-only source of item descriptors, consulted once per run.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<ItemDescriptor>, PipelineError>;
}

/// Catalog backed by a local JSON file: an array of `{id, title, source_url}`
/// entries. `dest_dir` on each descriptor is filled in from `payload_dir` at
/// load time so catalog files stay portable across machines.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
    payload_dir: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>, payload_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload_dir: payload_dir.into(),
        }
    }
}

#[async_trait]
impl CatalogSource for JsonCatalog {
    async fn discover(&self) -> Result<Vec<ItemDescriptor>, PipelineError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::CatalogUnavailable {
                path: self.path.clone(),
                detail: e.to_string(),
            }
        })?;

        let mut items: Vec<ItemDescriptor> =
            serde_json::from_str(&text).map_err(|e| PipelineError::CatalogUnavailable {
                path: self.path.clone(),
                detail: format!("malformed catalog: {e}"),
            })?;

        for item in &mut items {
            item.dest_dir = self.payload_dir.clone();
        }

        info!("Catalog {}: {} items", self.path.display(), items.len());
        Ok(items)
    }
}

/// Convenience for tests and embedding: a fixed in-memory catalog.
pub struct StaticCatalog(pub Vec<ItemDescriptor>);

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn discover(&self) -> Result<Vec<ItemDescriptor>, PipelineError> {
        Ok(self.0.clone())
    }
}

/// Helper used by tests and the CLI to build a descriptor in one line.
pub fn descriptor(id: &str, title: &str, url: &str, dest_dir: &Path) -> ItemDescriptor {
    ItemDescriptor {
        id: id.to_string(),
        title: title.to_string(),
        source_url: url.to_string(),
        dest_dir: dest_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitise_strips_punctuation_and_joins_with_underscores() {
        assert_eq!(
            sanitise_title("Attention Is All You Need!"),
            "Attention_Is_All_You_Need"
        );
        assert_eq!(sanitise_title("A/B: c-d (e)"), "AB_cd_e");
        assert_eq!(sanitise_title("  spaced out  "), "__spaced_out");
    }

    #[test]
    fn slug_and_payload_path() {
        let item = descriptor(
            "abc123",
            "Deep Nets, Revisited",
            "https://example.org/pdf?id=abc123",
            Path::new("/data/original"),
        );
        assert_eq!(item.slug(), "Deep_Nets_Revisited_abc123");
        assert_eq!(
            item.payload_path(),
            PathBuf::from("/data/original/Deep_Nets_Revisited_abc123.pdf")
        );
    }

    #[tokio::test]
    async fn json_catalog_fills_dest_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog_path = dir.path().join("catalog.json");
        std::fs::write(
            &catalog_path,
            r#"[{"id":"p1","title":"First Paper","source_url":"https://x/p1.pdf"}]"#,
        )
        .unwrap();

        let catalog = JsonCatalog::new(&catalog_path, dir.path().join("original"));
        let items = catalog.discover().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "p1");
        assert_eq!(items[0].dest_dir, dir.path().join("original"));
    }

    #[tokio::test]
    async fn missing_catalog_is_unavailable() {
        let catalog = JsonCatalog::new("/definitely/not/here.json", "/tmp");
        match catalog.discover().await {
            Err(PipelineError::CatalogUnavailable { .. }) => {}
            other => panic!("expected CatalogUnavailable, got {other:?}"),
        }
    }
}

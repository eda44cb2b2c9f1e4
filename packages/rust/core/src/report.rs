//! Final report rendering.
//!
//! Documents are written atomically (temp file, then rename) under
//! `<output_dir>/<run_id>/`. A successful render yields a [`RenderReceipt`],
//! which is the only way to authorize clearing a weekly bucket.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use curator_shared::{CuratorError, Item, Result, RunId, RunMode, WeekId};

const REPORT_FILE: &str = "report.md";
const METRICS_FILE: &str = "metrics.json";

/// Context for one rendered document.
#[derive(Debug, Clone)]
pub struct ReportMetadata {
    pub run_id: RunId,
    pub mode: RunMode,
    pub week_id: Option<WeekId>,
    pub generated_at: DateTime<Utc>,
    pub title: String,
}

impl ReportMetadata {
    pub fn new(run_id: RunId, mode: RunMode, week_id: Option<WeekId>, at: DateTime<Utc>) -> Self {
        let title = match &week_id {
            Some(week) => format!("Curated report: {week}"),
            None => format!("Curated report: {}", at.format("%Y-%m-%d")),
        };
        Self {
            run_id,
            mode,
            week_id,
            generated_at: at,
            title,
        }
    }
}

/// What a renderer produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedDocument {
    pub path: PathBuf,
    pub sha256: String,
    pub item_count: usize,
}

/// Proof that a run's document was rendered. Only this crate can issue one.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderReceipt {
    pub run_id: RunId,
    pub sha256: String,
}

impl RenderReceipt {
    pub(crate) fn issue(run_id: &RunId, document: &RenderedDocument) -> Self {
        Self {
            run_id: run_id.clone(),
            sha256: document.sha256.clone(),
        }
    }
}

/// Turns the final item list into a document.
pub trait Renderer: Send + Sync {
    fn render(&self, items: &[Item], meta: &ReportMetadata) -> Result<RenderedDocument>;
}

/// Renders a Markdown digest to `<output_dir>/<run_id>/report.md`.
pub struct MarkdownRenderer {
    output_dir: PathBuf,
}

impl MarkdownRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl Renderer for MarkdownRenderer {
    #[instrument(skip_all, fields(run_id = %meta.run_id, items = items.len()))]
    fn render(&self, items: &[Item], meta: &ReportMetadata) -> Result<RenderedDocument> {
        let markdown = render_markdown(items, meta);
        let dir = run_dir(&self.output_dir, &meta.run_id);
        let path = write_atomic(&dir, REPORT_FILE, markdown.as_bytes())?;
        Ok(RenderedDocument {
            path,
            sha256: sha256_hex(markdown.as_bytes()),
            item_count: items.len(),
        })
    }
}

/// Markdown body for a report.
pub fn render_markdown(items: &[Item], meta: &ReportMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", meta.title);
    let _ = writeln!(
        out,
        "_Run `{}` ({}) generated {}. {} items._\n",
        meta.run_id,
        meta.mode,
        meta.generated_at.to_rfc3339(),
        items.len()
    );

    for (rank, item) in items.iter().enumerate() {
        let _ = writeln!(out, "## {}. {}\n", rank + 1, item.title.trim());

        let mut facts = vec![format!("source: {}", item.source_id)];
        if let Some(category) = &item.category {
            facts.push(format!("category: {category}"));
        }
        if let Some(score) = item.combined_score {
            facts.push(format!("score: {score:.2}"));
        }
        if let Some(at) = item.published_at {
            facts.push(format!("published: {}", at.format("%Y-%m-%d")));
        }
        let _ = writeln!(out, "{}\n", facts.join(" | "));

        let summary = item
            .paraphrase
            .as_deref()
            .unwrap_or(item.body.as_str())
            .trim();
        if !summary.is_empty() {
            let _ = writeln!(out, "{summary}\n");
        }
        if let Some(url) = &item.url {
            let _ = writeln!(out, "[Read more]({url})\n");
        }
    }
    out
}

/// Write `metrics.json` next to the run's report.
pub fn write_metrics<T: Serialize>(output_dir: &Path, run_id: &RunId, metrics: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(metrics)
        .map_err(|e| CuratorError::Render(format!("metrics serialization failed: {e}")))?;
    write_atomic(&run_dir(output_dir, run_id), METRICS_FILE, json.as_bytes())
}

pub fn run_dir(output_dir: &Path, run_id: &RunId) -> PathBuf {
    output_dir.join(run_id.to_string())
}

fn write_atomic(dir: &Path, filename: &str, content: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| CuratorError::io(dir, e))?;
    let target = dir.join(filename);
    let temp = dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| CuratorError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| CuratorError::io(&target, e))?;

    debug!(path = %target.display(), size = content.len(), "wrote file");
    Ok(target)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

//! Core domain types for curator runs, items, and weekly accumulation.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::CuratorError;

/// Query parameters stripped during URL normalization.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref", "ref_src", "mc_cid", "mc_eid"];

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-derived run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// WeekId
// ---------------------------------------------------------------------------

/// ISO week identifier, rendered as `YYYY-Www` (e.g. `2026-W42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekId(String);

impl WeekId {
    /// The ISO week containing `date`.
    pub fn from_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self(format!("{:04}-W{:02}", iso.year(), iso.week()))
    }

    /// The ISO week containing the current UTC date.
    pub fn current() -> Self {
        Self::from_date(Utc::now().date_naive())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WeekId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for WeekId {
    type Err = CuratorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || CuratorError::validation(format!("invalid week id '{s}', expected YYYY-Www"));
        let (year, week) = s.split_once("-W").ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let week: u32 = week.parse().map_err(|_| invalid())?;
        NaiveDate::from_isoywd_opt(year, week, chrono::Weekday::Mon).ok_or_else(invalid)?;
        Ok(Self(format!("{year:04}-W{week:02}")))
    }
}

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Stable item identifier: SHA-256 of the normalized URL, or of the content
/// when an item has no usable URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Derive an identifier from a URL (normalized first).
    pub fn from_url(url: &str) -> Option<Self> {
        normalize_url(url).map(|n| Self(sha256_hex(n.as_bytes())))
    }

    /// Derive an identifier from title and body text.
    pub fn from_content(title: &str, body: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.trim().to_lowercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(body.trim().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Prefer the URL, fall back to content.
    pub fn derive(url: Option<&str>, title: &str, body: &str) -> Self {
        url.and_then(Self::from_url)
            .unwrap_or_else(|| Self::from_content(title, body))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Normalize a URL for identity: lowercase scheme/host, drop fragment,
/// tracking parameters and trailing slash. Returns `None` for unparseable or
/// non-http(s) URLs.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    // The url crate already lowercases scheme and host.
    let mut s = url.to_string();
    if let Some(rest) = s.strip_prefix("http://") {
        s = format!("https://{rest}");
    }
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    Some(s)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// RawItem / Item
// ---------------------------------------------------------------------------

/// An item exactly as the source collector produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Evaluation tier an item passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

/// One entry in an item's admission history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAdmission {
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub at: DateTime<Utc>,
}

/// One externally sourced unit of content moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub body: String,
    pub source_id: String,
    /// Credibility weight of the originating source (tie-breaker in Tier-3).
    #[serde(default = "default_credibility")]
    pub source_credibility: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    /// Dimension scores keyed by dimension name (set by Tier-3).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    /// Weighted combination of `scores`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admissions: Vec<TierAdmission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Neutral rewrite produced by the paraphrase phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paraphrase: Option<String>,
    /// Background-entity data attached by the enrich phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<serde_json::Value>,
}

fn default_credibility() -> f64 {
    1.0
}

impl Item {
    /// Build a pipeline item from a collected raw item.
    pub fn from_raw(raw: RawItem, source_credibility: f64, collected_at: DateTime<Utc>) -> Self {
        let id = ItemId::derive(raw.url.as_deref(), &raw.title, &raw.body);
        Self {
            id,
            title: raw.title.trim().to_string(),
            url: raw.url,
            body: raw.body,
            source_id: raw.source_id,
            source_credibility,
            published_at: raw.published_at,
            collected_at,
            scores: BTreeMap::new(),
            combined_score: None,
            admissions: Vec::new(),
            category: None,
            tags: Vec::new(),
            paraphrase: None,
            enrichment: None,
        }
    }

    /// Record that this item passed `tier`.
    pub fn admit(&mut self, tier: Tier, score: Option<f64>, at: DateTime<Utc>) {
        self.admissions.push(TierAdmission { tier, score, at });
    }

    /// The most recent score recorded for `tier`, if any.
    pub fn tier_score(&self, tier: Tier) -> Option<f64> {
        self.admissions
            .iter()
            .rev()
            .find(|a| a.tier == tier)
            .and_then(|a| a.score)
    }

    /// Whether a Tier-3 score has been assigned.
    pub fn is_deep_scored(&self) -> bool {
        self.combined_score.is_some()
    }

    /// A new scored instance; the receiver's history is kept and extended.
    pub fn with_deep_score(
        &self,
        scores: BTreeMap<String, f64>,
        combined: f64,
        at: DateTime<Utc>,
    ) -> Self {
        let mut scored = self.clone();
        scored.scores = scores;
        scored.combined_score = Some(combined);
        scored.admit(Tier::Tier3, Some(combined), at);
        scored
    }

    /// Text used for relevance matching and prompts.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

// ---------------------------------------------------------------------------
// Run mode / status
// ---------------------------------------------------------------------------

/// What a run is meant to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Collect, score and render in a single pass.
    OneShot,
    /// Daily collection into the weekly checkpoint.
    Collect,
    /// Weekly dedup, deep scoring and render; clears the checkpoint.
    Finalize,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneShot => "one-shot",
            Self::Collect => "collect",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunMode {
    type Err = CuratorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "one-shot" | "oneshot" => Ok(Self::OneShot),
            "collect" => Ok(Self::Collect),
            "finalize" => Ok(Self::Finalize),
            other => Err(CuratorError::validation(format!(
                "unknown run mode '{other}': expected one-shot, collect, or finalize"
            ))),
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CuratorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(CuratorError::validation(format!("unknown run status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseRecord
// ---------------------------------------------------------------------------

/// Lifecycle state of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Execution record for one phase of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub input_count: usize,
    pub output_count: usize,
    /// Phase-specific counters (tokens, cost, failed batches, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PhaseStatus::NotStarted,
            started_at: None,
            duration_ms: 0,
            input_count: 0,
            output_count: 0,
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    /// `not_started -> running`.
    pub fn start(&mut self, input_count: usize, at: DateTime<Utc>) -> crate::Result<()> {
        self.transition(PhaseStatus::NotStarted, PhaseStatus::Running)?;
        self.input_count = input_count;
        self.started_at = Some(at);
        Ok(())
    }

    /// `running -> success`.
    pub fn succeed(
        &mut self,
        output_count: usize,
        duration_ms: u64,
        metrics: BTreeMap<String, f64>,
    ) -> crate::Result<()> {
        self.transition(PhaseStatus::Running, PhaseStatus::Success)?;
        self.output_count = output_count;
        self.duration_ms = duration_ms;
        self.metrics = metrics;
        Ok(())
    }

    /// `running -> failed`. The output count stays at the carried-forward input.
    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) -> crate::Result<()> {
        self.transition(PhaseStatus::Running, PhaseStatus::Failed)?;
        self.output_count = self.input_count;
        self.duration_ms = duration_ms;
        self.error = Some(error.into());
        Ok(())
    }

    /// `not_started -> skipped`, with the reason kept in `error`.
    pub fn skip(&mut self, reason: impl Into<String>) -> crate::Result<()> {
        self.transition(PhaseStatus::NotStarted, PhaseStatus::Skipped)?;
        self.error = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, from: PhaseStatus, to: PhaseStatus) -> crate::Result<()> {
        if self.status != from {
            return Err(CuratorError::phase(
                &self.name,
                format!("illegal transition {:?} -> {:?}", self.status, to),
            ));
        }
        self.status = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// A recovered (or fatal) error recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub phase: String,
    pub kind: String,
    /// Source, batch or item the error is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn from_error(phase: &str, subject: Option<String>, err: &CuratorError) -> Self {
        Self {
            phase: phase.to_string(),
            kind: err.kind().to_string(),
            subject,
            message: err.to_string(),
        }
    }
}

/// One execution of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_id: Option<WeekId>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub phases: Vec<PhaseRecord>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<RunId>,
}

impl Run {
    pub fn new(mode: RunMode, week_id: Option<WeekId>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            mode,
            week_id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            phases: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            errors: Vec::new(),
            resumed_from: None,
        }
    }

    /// Freeze the run with its final status. Only the first call has effect.
    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        if self.is_finished() {
            return;
        }
        self.status = status;
        self.finished_at = Some(at);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == name)
    }
}

//! Strict response schemas for collaborator calls.
//!
//! Every structured completion is decoded into one of these types and range
//! checked; anything else is a [`CuratorError::Schema`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use curator_shared::{CuratorError, DimensionWeights, Result};

use crate::llm::SchemaHint;

/// Decode a JSON completion, tolerating a surrounding Markdown code fence.
pub fn parse_json<T: DeserializeOwned>(schema: &str, text: &str) -> Result<T> {
    let body = strip_code_fence(text);
    serde_json::from_str(body)
        .map_err(|e| CuratorError::schema(format!("{schema}: {e}")))
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn check_range(schema: &str, field: &str, value: f64, max: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=max).contains(&value) {
        return Err(CuratorError::schema(format!(
            "{schema}: {field} = {value} outside 0-{max}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tier-2
// ---------------------------------------------------------------------------

/// Relevance judgment for one batch member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub id: String,
    /// 0-10.
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJudgments {
    pub judgments: Vec<Judgment>,
}

impl BatchJudgments {
    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Self = parse_json("batch_judgments", text)?;
        for j in &parsed.judgments {
            check_range("batch_judgments", &format!("score[{}]", j.id), j.score, 10.0)?;
        }
        Ok(parsed)
    }

    /// Scores keyed by id. The first judgment for an id wins.
    pub fn by_id(&self) -> BTreeMap<&str, f64> {
        let mut map = BTreeMap::new();
        for j in &self.judgments {
            map.entry(j.id.as_str()).or_insert(j.score);
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Tier-3
// ---------------------------------------------------------------------------

/// Five independent dimension scores, each 0-10.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub market_impact: f64,
    pub competitive_impact: f64,
    pub strategic_relevance: f64,
    pub operational_relevance: f64,
    pub credibility: f64,
}

impl DimensionScores {
    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Self = parse_json("dimension_scores", text)?;
        for (name, value) in parsed.entries() {
            check_range("dimension_scores", name, value, 10.0)?;
        }
        Ok(parsed)
    }

    pub fn entries(&self) -> [(&'static str, f64); 5] {
        [
            ("market_impact", self.market_impact),
            ("competitive_impact", self.competitive_impact),
            ("strategic_relevance", self.strategic_relevance),
            ("operational_relevance", self.operational_relevance),
            ("credibility", self.credibility),
        ]
    }

    /// Weighted sum over the five dimensions.
    pub fn combined(&self, weights: &DimensionWeights) -> f64 {
        self.market_impact * weights.market_impact
            + self.competitive_impact * weights.competitive_impact
            + self.strategic_relevance * weights.strategic_relevance
            + self.operational_relevance * weights.operational_relevance
            + self.credibility * weights.credibility
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Stage 1 output: adoption and growth case only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BullPayload {
    /// 0-100.
    pub momentum: f64,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thesis: Option<String>,
}

impl BullPayload {
    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Self = parse_json("bull", text)?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        check_range("bull", "momentum", self.momentum, 100.0)
    }
}

/// Severity attached to a red flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FlagSeverity {
    /// Risk-penalty points contributed by one flag.
    pub fn points(&self) -> f64 {
        match self {
            Self::Low => 2.0,
            Self::Medium => 5.0,
            Self::High => 10.0,
            Self::Critical => 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedFlag {
    pub description: String,
    pub severity: FlagSeverity,
}

/// Dominant risk category named by the bear stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryRisk {
    Commercial,
    Technical,
    Legal,
    Reputational,
    Security,
    Adoption,
    #[serde(rename = "none")]
    NoRisk,
    #[serde(other)]
    Other,
}

/// Stage 2 output: maturity and risk case, rebutting the bull payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BearPayload {
    /// Commercial maturity, 0-100.
    pub maturity: f64,
    /// 0-100; higher is safer.
    pub brand_safety: f64,
    pub primary_risk: PrimaryRisk,
    #[serde(default)]
    pub red_flags: Vec<RedFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuttal: Option<String>,
}

impl BearPayload {
    pub fn parse(text: &str) -> Result<Self> {
        let parsed: Self = parse_json("bear", text)?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        check_range("bear", "maturity", self.maturity, 100.0)?;
        check_range("bear", "brand_safety", self.brand_safety, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Conformance
// ---------------------------------------------------------------------------

/// Whether `text` decodes for `hint`. Only conforming completions are cached.
pub fn conforms(hint: SchemaHint, text: &str) -> Result<()> {
    match hint {
        SchemaHint::BatchJudgments => BatchJudgments::parse(text).map(drop),
        SchemaHint::DimensionScores => DimensionScores::parse(text).map(drop),
        SchemaHint::Bull => BullPayload::parse(text).map(drop),
        SchemaHint::Bear => BearPayload::parse(text).map(drop),
        SchemaHint::Paraphrase if text.trim().is_empty() => {
            Err(CuratorError::schema("paraphrase: empty completion"))
        }
        SchemaHint::Paraphrase => Ok(()),
    }
}

//! Application configuration for curator.
//!
//! User config lives at `~/.curator/curator.toml`.
//! CLI flags override config file values, which override defaults.
//! Every loaded config is validated before a run may start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CuratorError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "curator.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".curator";

/// Upper bound on Tier-2 batch size (collaborator payload limit).
pub const MAX_BATCH_SIZE: usize = 25;

/// Tolerance used when checking that weights sum to 1.0.
pub const WEIGHT_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Config structs (matching curator.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub tier1: Tier1Config,
    #[serde(default)]
    pub tier2: Tier2Config,
    #[serde(default)]
    pub tier3: Tier3Config,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub phases: PhasesConfig,
    /// Configured content sources.
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory that receives rendered reports and metrics artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// libSQL database holding runs, checkpoints and baselines.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How far back collectors look, in days.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Number of items the final report should list.
    #[serde(default = "default_target_size")]
    pub target_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            db_path: default_db_path(),
            lookback_days: default_lookback_days(),
            target_size: default_target_size(),
        }
    }
}

fn default_output_dir() -> String {
    "~/curator-reports".into()
}
fn default_db_path() -> String {
    "~/.curator/curator.db".into()
}
fn default_lookback_days() -> u32 {
    7
}
fn default_target_size() -> usize {
    7
}

/// `[llm]` section: text-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-call timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum concurrent in-flight calls.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Minimum spacing between call starts.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// USD per million prompt tokens.
    #[serde(default = "default_input_cost")]
    pub input_cost_per_mtok: f64,
    /// USD per million completion tokens.
    #[serde(default = "default_output_cost")]
    pub output_cost_per_mtok: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_in_flight: default_max_in_flight(),
            min_delay_ms: default_min_delay_ms(),
            input_cost_per_mtok: default_input_cost(),
            output_cost_per_mtok: default_output_cost(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_max_in_flight() -> usize {
    4
}
fn default_min_delay_ms() -> u64 {
    250
}
fn default_input_cost() -> f64 {
    0.6
}
fn default_output_cost() -> f64 {
    2.5
}

impl LlmConfig {
    /// Cost in USD of a call with the given token counts.
    pub fn cost_usd(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_cost_per_mtok + tokens_out as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

/// `[collector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Per-source timeout; a slow source fails alone.
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Sources fetched concurrently.
    #[serde(default = "default_collector_concurrency")]
    pub concurrency: usize,
    /// Cap on items kept per source.
    #[serde(default = "default_max_items_per_source")]
    pub max_items_per_source: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_source_timeout(),
            concurrency: default_collector_concurrency(),
            max_items_per_source: default_max_items_per_source(),
        }
    }
}

fn default_source_timeout() -> u64 {
    20
}
fn default_collector_concurrency() -> usize {
    8
}
fn default_max_items_per_source() -> usize {
    100
}

/// A keyword vocabulary entry for Tier-1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    pub keywords: Vec<String>,
}

/// `[tier1]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Config {
    /// Minimum combined title + body length, in characters.
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    /// Category vocabulary, matched in order.
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryRule>,
    /// Sources whose items are dropped regardless of content.
    #[serde(default)]
    pub disabled_sources: Vec<String>,
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            min_text_len: default_min_text_len(),
            categories: default_categories(),
            disabled_sources: Vec::new(),
        }
    }
}

fn default_min_text_len() -> usize {
    40
}

fn default_categories() -> Vec<CategoryRule> {
    let rule = |name: &str, keywords: &[&str]| CategoryRule {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule("product_launch", &["launch", "launches", "released", "unveils", "ships"]),
        rule("funding", &["raises", "funding", "series a", "series b", "acquires", "acquisition"]),
        rule("ai", &["ai", "llm", "model", "machine learning", "agent"]),
        rule("review", &["review", "hands-on", "benchmark", "teardown"]),
    ]
}

/// `[tier2]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier2Config {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Admission threshold on a 0-10 scale.
    #[serde(default = "default_tier2_threshold")]
    pub threshold: f64,
}

impl Default for Tier2Config {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            threshold: default_tier2_threshold(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_tier2_threshold() -> f64 {
    6.0
}

/// Tier-3 dimension weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionWeights {
    pub market_impact: f64,
    pub competitive_impact: f64,
    pub strategic_relevance: f64,
    pub operational_relevance: f64,
    pub credibility: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            market_impact: 0.30,
            competitive_impact: 0.25,
            strategic_relevance: 0.20,
            operational_relevance: 0.15,
            credibility: 0.10,
        }
    }
}

impl DimensionWeights {
    /// `(dimension name, weight)` in canonical order.
    pub fn entries(&self) -> [(&'static str, f64); 5] {
        [
            ("market_impact", self.market_impact),
            ("competitive_impact", self.competitive_impact),
            ("strategic_relevance", self.strategic_relevance),
            ("operational_relevance", self.operational_relevance),
            ("credibility", self.credibility),
        ]
    }

    pub fn sum(&self) -> f64 {
        self.entries().iter().map(|(_, w)| w).sum()
    }

    /// Reject negative weights or weights not summing to 1.0.
    pub fn validate(&self) -> Result<()> {
        if let Some((name, w)) = self.entries().into_iter().find(|(_, w)| *w < 0.0 || !w.is_finite()) {
            return Err(CuratorError::phase(
                "tier3_score",
                format!("weight {name} = {w} must be a non-negative number"),
            ));
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(CuratorError::phase(
                "tier3_score",
                format!("dimension weights sum to {sum:.4}, expected 1.0"),
            ));
        }
        Ok(())
    }
}

/// `[tier3]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier3Config {
    /// Minimum combined score to keep an item.
    #[serde(default = "default_tier3_minimum")]
    pub minimum: f64,
    #[serde(default)]
    pub weights: DimensionWeights,
}

impl Default for Tier3Config {
    fn default() -> Self {
        Self {
            minimum: default_tier3_minimum(),
            weights: DimensionWeights::default(),
        }
    }
}

fn default_tier3_minimum() -> f64 {
    6.5
}

/// `[ranking]` section: weekly dedup & rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Candidates handed to Tier-3 during finalization.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// Subtracted once per already-selected item from the same source.
    #[serde(default = "default_diversity_penalty")]
    pub diversity_penalty: f64,
    /// Title-token Jaccard similarity at or above which items collapse.
    #[serde(default = "default_near_duplicate_threshold")]
    pub near_duplicate_threshold: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            quality_weight: default_quality_weight(),
            recency_weight: default_recency_weight(),
            diversity_penalty: default_diversity_penalty(),
            near_duplicate_threshold: default_near_duplicate_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_quality_weight() -> f64 {
    0.7
}
fn default_recency_weight() -> f64 {
    0.3
}
fn default_diversity_penalty() -> f64 {
    0.05
}
fn default_near_duplicate_threshold() -> f64 {
    0.8
}

/// `[anomaly]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Relative deviation above which a metric is HIGH.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    /// Relative deviation above which a metric is MEDIUM.
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    /// Source success ratio below which backup sources are recommended.
    #[serde(default = "default_min_source_success_ratio")]
    pub min_source_success_ratio: f64,
    /// Batch failure ratio above which collaborator health is flagged.
    #[serde(default = "default_max_batch_failure_ratio")]
    pub max_batch_failure_ratio: f64,
    /// Tier-1 pass ratio below which keyword coverage is flagged.
    #[serde(default = "default_min_tier1_pass_ratio")]
    pub min_tier1_pass_ratio: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
            min_source_success_ratio: default_min_source_success_ratio(),
            max_batch_failure_ratio: default_max_batch_failure_ratio(),
            min_tier1_pass_ratio: default_min_tier1_pass_ratio(),
        }
    }
}

fn default_high_threshold() -> f64 {
    1.0
}
fn default_medium_threshold() -> f64 {
    0.5
}
fn default_min_source_success_ratio() -> f64 {
    0.7
}
fn default_max_batch_failure_ratio() -> f64 {
    0.25
}
fn default_min_tier1_pass_ratio() -> f64 {
    0.05
}

/// Momentum/maturity weighting for one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvictionWeights {
    pub momentum: f64,
    pub maturity: f64,
}

impl ConvictionWeights {
    fn validate(&self, kind: &str) -> Result<()> {
        let sum = self.momentum + self.maturity;
        if self.momentum < 0.0 || self.maturity < 0.0 || (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(CuratorError::phase(
                "consensus",
                format!("{kind} weights must be non-negative and sum to 1.0 (got {sum:.4})"),
            ));
        }
        Ok(())
    }
}

/// `[consensus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_open_source_weights")]
    pub open_source: ConvictionWeights,
    #[serde(default = "default_commercial_weights")]
    pub commercial: ConvictionWeights,
    #[serde(default = "default_other_weights")]
    pub other: ConvictionWeights,
    /// Momentum/maturity gap at or above which conflict is HIGH.
    #[serde(default = "default_conflict_high_gap")]
    pub conflict_high_gap: f64,
    /// Gap at or above which conflict is MEDIUM.
    #[serde(default = "default_conflict_medium_gap")]
    pub conflict_medium_gap: f64,
    /// Momentum above which the bonus applies.
    #[serde(default = "default_momentum_bonus_threshold")]
    pub momentum_bonus_threshold: f64,
    /// Bonus points per momentum point above the threshold.
    #[serde(default = "default_momentum_bonus_rate")]
    pub momentum_bonus_rate: f64,
    #[serde(default = "default_momentum_bonus_cap")]
    pub momentum_bonus_cap: f64,
    /// Brand-safety score below which a penalty applies.
    #[serde(default = "default_brand_safety_floor")]
    pub brand_safety_floor: f64,
    /// Penalty points per brand-safety point below the floor.
    #[serde(default = "default_brand_safety_rate")]
    pub brand_safety_rate: f64,
    #[serde(default = "default_risk_penalty_cap")]
    pub risk_penalty_cap: f64,
    /// Risk penalty at or above which an entity is ignored outright.
    #[serde(default = "default_severe_penalty")]
    pub severe_penalty: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default = "default_monitor_threshold")]
    pub monitor_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            open_source: default_open_source_weights(),
            commercial: default_commercial_weights(),
            other: default_other_weights(),
            conflict_high_gap: default_conflict_high_gap(),
            conflict_medium_gap: default_conflict_medium_gap(),
            momentum_bonus_threshold: default_momentum_bonus_threshold(),
            momentum_bonus_rate: default_momentum_bonus_rate(),
            momentum_bonus_cap: default_momentum_bonus_cap(),
            brand_safety_floor: default_brand_safety_floor(),
            brand_safety_rate: default_brand_safety_rate(),
            risk_penalty_cap: default_risk_penalty_cap(),
            severe_penalty: default_severe_penalty(),
            alert_threshold: default_alert_threshold(),
            monitor_threshold: default_monitor_threshold(),
        }
    }
}

fn default_open_source_weights() -> ConvictionWeights {
    ConvictionWeights {
        momentum: 0.7,
        maturity: 0.3,
    }
}
fn default_commercial_weights() -> ConvictionWeights {
    ConvictionWeights {
        momentum: 0.5,
        maturity: 0.5,
    }
}
fn default_other_weights() -> ConvictionWeights {
    ConvictionWeights {
        momentum: 0.6,
        maturity: 0.4,
    }
}
fn default_conflict_high_gap() -> f64 {
    50.0
}
fn default_conflict_medium_gap() -> f64 {
    25.0
}
fn default_momentum_bonus_threshold() -> f64 {
    80.0
}
fn default_momentum_bonus_rate() -> f64 {
    0.5
}
fn default_momentum_bonus_cap() -> f64 {
    10.0
}
fn default_brand_safety_floor() -> f64 {
    50.0
}
fn default_brand_safety_rate() -> f64 {
    0.3
}
fn default_risk_penalty_cap() -> f64 {
    30.0
}
fn default_severe_penalty() -> f64 {
    25.0
}
fn default_alert_threshold() -> f64 {
    80.0
}
fn default_monitor_threshold() -> f64 {
    50.0
}

/// `[phases]` section: optional phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Rewrite item summaries through the text-generation collaborator.
    #[serde(default = "default_true")]
    pub paraphrase: bool,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self { paraphrase: true }
    }
}

fn default_true() -> bool {
    true
}

/// How a source is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS, Atom, or JSON Feed.
    Rss,
    /// An HTML listing page scraped with CSS selectors.
    Html,
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tie-break weight used in Tier-3 ordering.
    #[serde(default = "default_credibility")]
    pub credibility: f64,
    /// CSS selector for one entry on an HTML listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_selector: Option<String>,
}

fn default_credibility() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check cross-field invariants. Called by every loader.
    pub fn validate(&self) -> Result<()> {
        self.tier3.weights.validate()?;

        if self.tier2.batch_size == 0 || self.tier2.batch_size > MAX_BATCH_SIZE {
            return Err(CuratorError::phase(
                "tier2_score",
                format!(
                    "batch_size {} must be between 1 and {MAX_BATCH_SIZE}",
                    self.tier2.batch_size
                ),
            ));
        }
        for (name, value) in [
            ("tier2.threshold", self.tier2.threshold),
            ("tier3.minimum", self.tier3.minimum),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return Err(CuratorError::validation(format!(
                    "{name} = {value} must be within 0-10"
                )));
            }
        }
        if self.anomaly.medium_threshold <= 0.0
            || self.anomaly.medium_threshold >= self.anomaly.high_threshold
        {
            return Err(CuratorError::validation(
                "anomaly.medium_threshold must be positive and below high_threshold",
            ));
        }
        if self.consensus.conflict_medium_gap >= self.consensus.conflict_high_gap {
            return Err(CuratorError::validation(
                "consensus.conflict_medium_gap must be below conflict_high_gap",
            ));
        }
        self.consensus.open_source.validate("open_source")?;
        self.consensus.commercial.validate("commercial")?;
        self.consensus.other.validate("other")?;

        if self.llm.max_in_flight == 0 || self.collector.concurrency == 0 {
            return Err(CuratorError::validation(
                "llm.max_in_flight and collector.concurrency must be at least 1",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(CuratorError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a source descriptor by id.
    pub fn source(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.curator/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CuratorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.curator/curator.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        let config = AppConfig::default();
        config.validate()?;
        return Ok(config);
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CuratorError::io(path, e))?;
    parse_config(&content).inspect_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "invalid config file");
    })
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)
        .map_err(|e| CuratorError::config(format!("failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CuratorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CuratorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CuratorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the text-generation API key from the env var named in config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CuratorError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

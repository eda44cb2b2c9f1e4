//! Shared types, error model, and configuration for curator.
//!
//! This crate is the foundation depended on by all other curator crates.
//! It provides:
//! - [`CuratorError`] : the unified error type
//! - Domain types ([`Item`], [`Run`], [`PhaseRecord`], [`WeekId`], [`RunId`])
//! - Configuration ([`AppConfig`] and its sections, config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnomalyConfig, AppConfig, CategoryRule, CollectorConfig, ConsensusConfig, ConvictionWeights,
    DefaultsConfig, DimensionWeights, LlmConfig, MAX_BATCH_SIZE, PhasesConfig, RankingConfig,
    SourceDescriptor, SourceKind, Tier1Config, Tier2Config, Tier3Config, WEIGHT_EPSILON,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    parse_config, resolve_api_key,
};
pub use error::{CuratorError, Result};
pub use types::{
    Item, ItemId, PhaseRecord, PhaseStatus, RawItem, Run, RunError, RunId, RunMode, RunStatus,
    Tier, TierAdmission, WeekId, normalize_url,
};

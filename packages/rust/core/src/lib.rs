//! Curation pipeline and domain logic for curator.
//!
//! This crate ties together collection, the three scoring tiers, weekly
//! accumulation, dedup/ranking and rendering into checkpointed runs
//! ([`Orchestrator::run`]), plus the post-run anomaly monitor and the
//! bull/bear/arbiter consensus scorer.

pub mod accumulator;
pub mod anomaly;
pub mod consensus;
pub mod llm;
pub mod pipeline;
pub mod rank;
pub mod refine;
pub mod report;
pub mod schema;
pub mod tier1;
pub mod tier2;
pub mod tier3;

pub use accumulator::WeeklyAccumulator;
pub use anomaly::{Advice, Anomaly, AnomalyMonitor, AnomalyReport, Severity};
pub use consensus::{ConsensusScorer, ConsensusVerdict, EntityKind, EntitySignals, Recommendation};
pub use llm::{CachedGenerator, LlmClient, OpenRouterGenerator, TextGenerator, Usage};
pub use pipeline::{
    Orchestrator, Phase, ProgressReporter, Resume, RunRequest, RunSummary, SilentProgress,
};
pub use refine::EntityEnricher;
pub use report::{MarkdownRenderer, RenderedDocument, Renderer, ReportMetadata};

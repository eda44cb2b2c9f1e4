//! Source collection: feeds and HTML listings fetched concurrently.
//!
//! This crate provides:
//! - [`SourceCollector`] : the per-source fetch contract
//! - [`HttpCollector`] : RSS/Atom/JSON Feed and CSS-selector listing collector
//! - [`collect_all`] : bounded fan-out with a per-source timeout

pub mod engine;
pub mod html;
pub mod rss;

pub use engine::{
    CollectLimits, Collection, HttpCollector, OutcomeError, SourceCollector, SourceOutcome,
    SourceStatus, collect_all,
};

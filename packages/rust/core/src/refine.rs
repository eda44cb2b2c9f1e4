//! Post-scoring refinement: neutral paraphrase, entity enrichment, and the
//! final shape check before rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use curator_shared::{CuratorError, Item, Result, RunError};

use crate::llm::{CompletionRequest, LlmClient, SchemaHint, Usage, truncate_chars};
use crate::tier3::fully_admitted;

const PARAPHRASE_SYSTEM: &str = "Rewrite the item as two or three neutral, factual sentences \
for a briefing. No hype, no speculation, no first person. Reply with the text only.";

const BODY_CHARS: usize = 2_000;

/// Item counts and errors from a refinement phase.
#[derive(Debug, Default)]
pub struct RefineOutcome {
    pub items: Vec<Item>,
    pub changed: usize,
    pub failed: usize,
    /// Items passed through without a call.
    pub untouched: usize,
    pub usage: Usage,
    pub errors: Vec<RunError>,
}

impl RefineOutcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::from([
            ("changed".to_string(), self.changed as f64),
            ("items_failed".to_string(), self.failed as f64),
            ("untouched".to_string(), self.untouched as f64),
        ]);
        self.usage.write_metrics(&mut metrics);
        metrics
    }
}

// ---------------------------------------------------------------------------
// Paraphrase
// ---------------------------------------------------------------------------

/// Attach a neutral rewrite to the first `limit` renderable items; the rest
/// pass through untouched since [`validate`] will drop them. An item whose
/// call fails keeps its original text; order is unchanged.
#[instrument(skip_all, fields(items = items.len(), limit = limit))]
pub async fn paraphrase(llm: &LlmClient, items: Vec<Item>, limit: usize) -> RefineOutcome {
    let mut handles = Vec::with_capacity(items.len());
    let mut requested = 0usize;
    for item in items {
        if requested >= limit || !renderable(&item) {
            handles.push((item, None));
            continue;
        }
        requested += 1;
        let llm = llm.clone();
        let request = CompletionRequest {
            schema: SchemaHint::Paraphrase,
            system: PARAPHRASE_SYSTEM.to_string(),
            prompt: json!({
                "title": item.title,
                "body": truncate_chars(item.body.trim(), BODY_CHARS),
            })
            .to_string(),
            subject_ids: vec![item.id.as_str().to_string()],
        };
        handles.push((item, Some(tokio::spawn(async move { llm.complete(&request).await }))));
    }

    let mut outcome = RefineOutcome::default();
    for (mut item, handle) in handles {
        let Some(handle) = handle else {
            outcome.untouched += 1;
            outcome.items.push(item);
            continue;
        };
        let result = handle
            .await
            .unwrap_or_else(|e| Err(CuratorError::Collaborator(format!("paraphrase task failed: {e}"))));
        match result {
            Ok((completion, usage)) if !completion.text.trim().is_empty() => {
                outcome.usage.add(&usage);
                item.paraphrase = Some(completion.text.trim().to_string());
                outcome.changed += 1;
            }
            Ok((_, usage)) => {
                outcome.usage.add(&usage);
                outcome.failed += 1;
                let err = CuratorError::schema("paraphrase: empty completion");
                outcome
                    .errors
                    .push(RunError::from_error("paraphrase", Some(item.id.to_string()), &err));
            }
            Err(err) => {
                outcome.failed += 1;
                warn!(item = %item.id, error = %err, "paraphrase failed, keeping original text");
                outcome
                    .errors
                    .push(RunError::from_error("paraphrase", Some(item.id.to_string()), &err));
            }
        }
        outcome.items.push(item);
    }
    outcome
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Looks up background data for the entity an item is about.
#[async_trait]
pub trait EntityEnricher: Send + Sync {
    /// `Ok(None)` when nothing is known about the item's entity.
    async fn enrich(&self, item: &Item) -> Result<Option<Value>>;
}

/// Attach enrichment data to each item. Failures leave the item untouched.
#[instrument(skip_all, fields(items = items.len()))]
pub async fn enrich(enricher: Arc<dyn EntityEnricher>, items: Vec<Item>) -> RefineOutcome {
    let mut outcome = RefineOutcome::default();
    for mut item in items {
        match enricher.enrich(&item).await {
            Ok(Some(data)) => {
                item.enrichment = Some(data);
                outcome.changed += 1;
            }
            Ok(None) => {}
            Err(err) => {
                outcome.failed += 1;
                warn!(item = %item.id, error = %err, "enrichment failed");
                outcome
                    .errors
                    .push(RunError::from_error("enrich", Some(item.id.to_string()), &err));
            }
        }
        outcome.items.push(item);
    }
    outcome
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ValidateOutcome {
    pub items: Vec<Item>,
    pub dropped_incomplete: usize,
    pub dropped_over_target: usize,
}

impl ValidateOutcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("dropped_incomplete".to_string(), self.dropped_incomplete as f64),
            ("dropped_over_target".to_string(), self.dropped_over_target as f64),
        ])
    }
}

/// Drop items that cannot be rendered (no title, no link, or not fully
/// scored) and cap the list at `target_size`, keeping order.
pub fn validate(items: Vec<Item>, target_size: usize) -> ValidateOutcome {
    let mut outcome = ValidateOutcome::default();
    for item in items {
        if !renderable(&item) {
            outcome.dropped_incomplete += 1;
            continue;
        }
        if outcome.items.len() >= target_size {
            outcome.dropped_over_target += 1;
            continue;
        }
        outcome.items.push(item);
    }
    debug!(
        kept = outcome.items.len(),
        dropped_incomplete = outcome.dropped_incomplete,
        "final list validated"
    );
    outcome
}

fn renderable(item: &Item) -> bool {
    !item.title.trim().is_empty()
        && item.url.as_deref().is_some_and(|u| !u.trim().is_empty())
        && fully_admitted(item)
}

//! Tier-3: per-item five-dimension scoring.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use curator_shared::{CuratorError, Item, Result, RunError, Tier, Tier3Config};

use crate::llm::{CompletionRequest, LlmClient, SchemaHint, Usage, truncate_chars};
use crate::schema::DimensionScores;

const PHASE: &str = "tier3_score";

const BODY_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "You are a senior industry analyst. Score the item on five \
independent dimensions, each from 0 to 10: market_impact, competitive_impact, \
strategic_relevance, operational_relevance, credibility. Respond with JSON containing \
exactly those five numeric fields.";

#[derive(Debug, Default)]
pub struct Tier3Outcome {
    /// Items at or above the minimum, best first.
    pub kept: Vec<Item>,
    /// Items scored by a collaborator call in this run.
    pub scored: usize,
    /// Items that already carried a deep score.
    pub reused: usize,
    pub failed: usize,
    pub below_minimum: usize,
    pub usage: Usage,
    pub errors: Vec<RunError>,
}

impl Tier3Outcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::from([
            ("scored".to_string(), self.scored as f64),
            ("reused".to_string(), self.reused as f64),
            ("items_failed".to_string(), self.failed as f64),
            ("below_minimum".to_string(), self.below_minimum as f64),
        ]);
        self.usage.write_metrics(&mut metrics);
        metrics
    }
}

fn item_request(item: &Item) -> CompletionRequest {
    let payload = json!({
        "id": item.id.as_str(),
        "title": item.title,
        "source": item.source_id,
        "category": item.category,
        "published_at": item.published_at,
        "url": item.url,
        "body": truncate_chars(item.body.trim(), BODY_CHARS),
    });
    CompletionRequest {
        schema: SchemaHint::DimensionScores,
        system: SYSTEM_PROMPT.to_string(),
        prompt: payload.to_string(),
        subject_ids: vec![item.id.as_str().to_string()],
    }
}

/// Order by combined score desc, then recency desc, then source credibility desc.
pub fn rank_order(a: &Item, b: &Item) -> Ordering {
    let score = |i: &Item| i.combined_score.unwrap_or(f64::MIN);
    score(b)
        .partial_cmp(&score(a))
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.published_at.cmp(&a.published_at))
        .then_with(|| {
            b.source_credibility
                .partial_cmp(&a.source_credibility)
                .unwrap_or(Ordering::Equal)
        })
}

/// Deep-score every item, keep those whose combined score reaches
/// `config.minimum`, and return them ordered by [`rank_order`].
///
/// Invalid weights fail the phase before any call is made. Items that
/// already carry a deep score are not re-scored.
#[instrument(skip_all, fields(items = items.len()))]
pub async fn deep_score(
    llm: &LlmClient,
    items: Vec<Item>,
    config: &Tier3Config,
    at: DateTime<Utc>,
) -> Result<Tier3Outcome> {
    config.weights.validate()?;

    let mut outcome = Tier3Outcome::default();
    let mut scored_items = Vec::with_capacity(items.len());
    let mut handles = Vec::new();

    for item in items {
        if item.is_deep_scored() {
            outcome.reused += 1;
            scored_items.push(item);
            continue;
        }
        let llm = llm.clone();
        let request = item_request(&item);
        let weights = config.weights;
        handles.push((
            item,
            tokio::spawn(async move {
                let (completion, usage) = llm
                    .complete(&request)
                    .await
                    .map_err(|e| (e, Usage::default()))?;
                let scores = DimensionScores::parse(&completion.text).map_err(|e| (e, usage))?;
                Ok::<_, (CuratorError, Usage)>((scores, scores.combined(&weights), usage))
            }),
        ));
    }

    for (item, handle) in handles {
        let result = handle.await.unwrap_or_else(|e| {
            Err((
                CuratorError::Collaborator(format!("scoring task failed: {e}")),
                Usage::default(),
            ))
        });
        match result {
            Ok((scores, combined, usage)) => {
                outcome.usage.add(&usage);
                outcome.scored += 1;
                debug!(item = %item.id, combined, "item deep-scored");
                scored_items.push(item.with_deep_score(scores.to_map(), combined, at));
            }
            Err((err, usage)) => {
                outcome.usage.add(&usage);
                outcome.failed += 1;
                warn!(item = %item.id, error = %err, "deep scoring failed, dropping item");
                outcome
                    .errors
                    .push(RunError::from_error(PHASE, Some(item.id.to_string()), &err));
            }
        }
    }

    for item in scored_items {
        if item.combined_score.unwrap_or(0.0) >= config.minimum {
            outcome.kept.push(item);
        } else {
            outcome.below_minimum += 1;
        }
    }
    outcome.kept.sort_by(rank_order);

    info!(
        kept = outcome.kept.len(),
        scored = outcome.scored,
        reused = outcome.reused,
        failed = outcome.failed,
        "tier-3 scoring complete"
    );
    Ok(outcome)
}

/// Whether `item` passed Tier-2 and carries a deep score, the shape every
/// rendered item must have.
pub fn fully_admitted(item: &Item) -> bool {
    item.admissions.iter().any(|a| a.tier == Tier::Tier2) && item.is_deep_scored()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallPolicy, Completion, TextGenerator};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use curator_shared::{DimensionWeights, LlmConfig, RawItem};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    /// Gives every dimension the value encoded after "=" in the title; titles
    /// containing "garbled" get an unparseable reply.
    struct Analyst {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for Analyst {
        async fn complete(&self, request: &CompletionRequest) -> curator_shared::Result<Completion> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let body: serde_json::Value = serde_json::from_str(&request.prompt).unwrap();
            let title = body["title"].as_str().unwrap();
            if title.contains("stalled") {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let text = if title.contains("garbled") {
                r#"{"market_impact": 9}"#.to_string()
            } else {
                let v: f64 = title.rsplit('=').next().unwrap().parse().unwrap();
                json!({
                    "market_impact": v,
                    "competitive_impact": v,
                    "strategic_relevance": v,
                    "operational_relevance": v,
                    "credibility": v,
                })
                .to_string()
            };
            Ok(Completion {
                text,
                tokens_in: 50,
                tokens_out: 10,
                model: "analyst".into(),
                latency_ms: 1,
                cached: false,
            })
        }

        fn model_id(&self) -> &str {
            "analyst"
        }
    }

    fn client(generator: Arc<Analyst>) -> LlmClient {
        client_with_timeout(generator, Duration::from_secs(5))
    }

    fn client_with_timeout(generator: Arc<Analyst>, timeout: Duration) -> LlmClient {
        LlmClient::with_policy(
            generator,
            CallPolicy::new(
                timeout,
                0,
                Duration::from_millis(1),
                Duration::ZERO,
                4,
            ),
            &LlmConfig::default(),
        )
    }

    fn item(title: &str, published_days_ago: i64, credibility: f64) -> Item {
        let now = Utc::now();
        let mut item = Item::from_raw(
            RawItem {
                source_id: "wire".into(),
                title: title.into(),
                url: Some(format!("https://example.com/{}", title.replace(' ', "-"))),
                body: "Body.".into(),
                published_at: Some(now - ChronoDuration::days(published_days_ago)),
            },
            credibility,
            now,
        );
        item.admit(Tier::Tier2, Some(8.0), now);
        item
    }

    #[tokio::test]
    async fn keeps_and_orders_by_combined_then_recency_then_credibility() {
        let analyst = Arc::new(Analyst {
            calls: AtomicUsize::new(0),
        });
        let items = vec![
            item("low =5", 0, 1.0),
            item("old tie =8", 3, 1.0),
            item("new tie =8", 1, 1.0),
            item("top =9.5", 2, 1.0),
            item("garbled", 0, 1.0),
            item("credible tie =7", 2, 2.0),
            item("plain tie =7", 2, 1.0),
        ];
        // Same publish instant for the credibility tie.
        let mut items = items;
        items[6].published_at = items[5].published_at;

        let outcome = deep_score(&client(analyst.clone()), items, &Tier3Config::default(), Utc::now())
            .await
            .unwrap();

        let titles: Vec<_> = outcome.kept.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["top =9.5", "new tie =8", "old tie =8", "credible tie =7", "plain tie =7"]
        );
        assert_eq!(outcome.below_minimum, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].kind, "schema");
        assert_eq!(analyst.calls.load(AtomicOrdering::SeqCst), 7);
        // The garbled reply is still billed.
        assert_eq!(outcome.usage.calls, 7);
        assert_eq!(outcome.usage.tokens_in, 350);
        assert!(outcome.kept.iter().all(fully_admitted));
        assert_eq!(outcome.kept[0].scores.len(), 5);
    }

    #[tokio::test]
    async fn already_scored_items_are_not_rescored() {
        let analyst = Arc::new(Analyst {
            calls: AtomicUsize::new(0),
        });
        let first = deep_score(
            &client(analyst.clone()),
            vec![item("again =8", 0, 1.0)],
            &Tier3Config::default(),
            Utc::now(),
        )
        .await
        .unwrap();

        let second = deep_score(&client(analyst.clone()), first.kept, &Tier3Config::default(), Utc::now())
            .await
            .unwrap();

        assert_eq!(analyst.calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(second.reused, 1);
        assert_eq!(second.kept[0].admissions.len(), 2);
    }

    #[tokio::test]
    async fn bad_weights_fail_before_any_call() {
        let analyst = Arc::new(Analyst {
            calls: AtomicUsize::new(0),
        });
        let config = Tier3Config {
            minimum: 6.5,
            weights: DimensionWeights {
                market_impact: 0.25,
                competitive_impact: 0.20,
                strategic_relevance: 0.20,
                operational_relevance: 0.15,
                credibility: 0.10,
            },
        };
        let err = deep_score(&client(analyst.clone()), vec![item("x =9", 0, 1.0)], &config, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CuratorError::Phase { .. }));
        assert_eq!(analyst.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timed_out_item_is_dropped() {
        let analyst = Arc::new(Analyst {
            calls: AtomicUsize::new(0),
        });
        let llm = client_with_timeout(analyst, Duration::from_millis(50));
        let items = vec![item("stalled =9", 0, 1.0), item("fast =8", 0, 1.0)];

        let outcome = deep_score(&llm, items, &Tier3Config::default(), Utc::now())
            .await
            .unwrap();

        let titles: Vec<_> = outcome.kept.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["fast =8"]);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].subject.as_deref(), Some(id_of("stalled =9").as_str()));
    }

    fn id_of(title: &str) -> String {
        item(title, 0, 1.0).id.to_string()
    }
}

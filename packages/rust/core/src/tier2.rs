//! Tier-2: batched relevance scoring.
//!
//! Survivors of Tier-1 are split into fixed-size batches and each batch is
//! judged by one collaborator call. Batches run concurrently under the call
//! policy; a failed batch fails closed (none of its items are admitted).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use curator_shared::{CuratorError, Item, RunError, Tier, Tier2Config};

use crate::llm::{CompletionRequest, LlmClient, SchemaHint, Usage, truncate_chars};
use crate::schema::BatchJudgments;

const PHASE: &str = "tier2_score";

/// Characters of body text sent per item.
const SUMMARY_CHARS: usize = 400;

const SYSTEM_PROMPT: &str = "You judge news items for a weekly technology briefing. \
For every item, return a relevance score from 0 (irrelevant) to 10 (must include). \
Respond with JSON: {\"judgments\":[{\"id\":\"<item id>\",\"score\":<0-10>,\"reason\":\"<short>\"}]}. \
Use only the ids you were given.";

/// Result of scoring all batches.
#[derive(Debug, Default)]
pub struct Tier2Outcome {
    /// Admitted items, in input order.
    pub admitted: Vec<Item>,
    pub batches: usize,
    pub failed_batches: usize,
    /// Items in batches that returned no judgment for them.
    pub unjudged: usize,
    pub usage: Usage,
    pub errors: Vec<RunError>,
}

impl Tier2Outcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::from([
            ("batches".to_string(), self.batches as f64),
            ("batches_failed".to_string(), self.failed_batches as f64),
            ("unjudged".to_string(), self.unjudged as f64),
        ]);
        self.usage.write_metrics(&mut metrics);
        metrics
    }
}

fn batch_request(batch: &[Item]) -> CompletionRequest {
    let entries: Vec<_> = batch
        .iter()
        .map(|item| {
            json!({
                "id": item.id.as_str(),
                "title": item.title,
                "category": item.category,
                "summary": truncate_chars(item.body.trim(), SUMMARY_CHARS),
            })
        })
        .collect();

    CompletionRequest {
        schema: SchemaHint::BatchJudgments,
        system: SYSTEM_PROMPT.to_string(),
        prompt: json!({ "items": entries }).to_string(),
        subject_ids: batch.iter().map(|i| i.id.as_str().to_string()).collect(),
    }
}

/// Score `items` in batches of `config.batch_size`, admitting those whose
/// score meets `config.threshold`. Judgments for ids not in the batch are
/// ignored; an item without a judgment is not admitted and is recorded as a
/// schema error.
#[instrument(skip_all, fields(items = items.len(), batch_size = config.batch_size))]
pub async fn score_batches(
    llm: &LlmClient,
    items: Vec<Item>,
    config: &Tier2Config,
    at: DateTime<Utc>,
) -> Tier2Outcome {
    let batch_size = config.batch_size.max(1);
    let mut batches: Vec<Vec<Item>> = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }

    let mut outcome = Tier2Outcome {
        batches: batches.len(),
        ..Tier2Outcome::default()
    };

    let mut handles = Vec::with_capacity(batches.len());
    for (index, batch) in batches.into_iter().enumerate() {
        let llm = llm.clone();
        let request = batch_request(&batch);
        handles.push((
            index,
            batch,
            tokio::spawn(async move {
                let (completion, usage) = llm
                    .complete(&request)
                    .await
                    .map_err(|e| (e, Usage::default()))?;
                let judgments = BatchJudgments::parse(&completion.text).map_err(|e| (e, usage))?;
                Ok::<_, (CuratorError, Usage)>((judgments, usage))
            }),
        ));
    }

    // Await in spawn order so admitted items keep their input order.
    for (index, batch, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err((
                CuratorError::Collaborator(format!("batch task failed: {e}")),
                Usage::default(),
            )),
        };

        match result {
            Ok((judgments, usage)) => {
                outcome.usage.add(&usage);
                let scores = judgments.by_id();
                for mut item in batch {
                    match scores.get(item.id.as_str()) {
                        Some(&score) if score >= config.threshold => {
                            item.admit(Tier::Tier2, Some(score), at);
                            outcome.admitted.push(item);
                        }
                        Some(_) => {}
                        None => {
                            outcome.unjudged += 1;
                            let err = CuratorError::schema(format!("batch {index}: no judgment returned"));
                            outcome
                                .errors
                                .push(RunError::from_error(PHASE, Some(item.id.to_string()), &err));
                        }
                    }
                }
            }
            Err((err, usage)) => {
                outcome.usage.add(&usage);
                outcome.failed_batches += 1;
                warn!(batch = index, size = batch.len(), error = %err, "tier-2 batch failed, dropping its items");
                outcome
                    .errors
                    .push(RunError::from_error(PHASE, Some(format!("batch {index}")), &err));
            }
        }
    }

    info!(
        admitted = outcome.admitted.len(),
        batches = outcome.batches,
        failed = outcome.failed_batches,
        "tier-2 scoring complete"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallPolicy, Completion, TextGenerator};
    use async_trait::async_trait;
    use curator_shared::{LlmConfig, RawItem, Result};
    use std::sync::Arc;
    use std::time::Duration;

    /// Scores every requested id as its numeric title suffix; fails batches
    /// containing "broken" and leaves "Unanswered" items out of its reply.
    struct Judge;

    #[async_trait]
    impl TextGenerator for Judge {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            if request.prompt.contains("broken") {
                return Ok(Completion {
                    text: "I think these are all great".into(),
                    tokens_in: 10,
                    tokens_out: 5,
                    model: "judge".into(),
                    latency_ms: 1,
                    cached: false,
                });
            }
            let body: serde_json::Value = serde_json::from_str(&request.prompt).unwrap();
            let mut judgments: Vec<_> = body["items"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|entry| !entry["title"].as_str().unwrap().starts_with("Unanswered"))
                .map(|entry| {
                    let title = entry["title"].as_str().unwrap();
                    let score: f64 = title.rsplit(' ').next().unwrap().parse().unwrap();
                    json!({ "id": entry["id"], "score": score })
                })
                .collect();
            judgments.push(json!({ "id": "not-in-batch", "score": 10 }));
            Ok(Completion {
                text: json!({ "judgments": judgments }).to_string(),
                tokens_in: 100,
                tokens_out: 20,
                model: "judge".into(),
                latency_ms: 1,
                cached: false,
            })
        }

        fn model_id(&self) -> &str {
            "judge"
        }
    }

    fn item(title: &str) -> Item {
        Item::from_raw(
            RawItem {
                source_id: "wire".into(),
                title: title.into(),
                url: Some(format!("https://example.com/{}", title.replace(' ', "-"))),
                body: "Body text.".into(),
                published_at: None,
            },
            1.0,
            Utc::now(),
        )
    }

    fn client() -> LlmClient {
        LlmClient::with_policy(
            Arc::new(Judge),
            CallPolicy::new(
                Duration::from_secs(5),
                0,
                Duration::from_millis(1),
                Duration::ZERO,
                4,
            ),
            &LlmConfig::default(),
        )
    }

    #[tokio::test]
    async fn admits_at_threshold_in_input_order() {
        let items: Vec<_> = [9, 2, 6, 7, 5, 8, 1]
            .iter()
            .enumerate()
            .map(|(i, s)| item(&format!("Item {i} scores {s}")))
            .collect();
        let config = Tier2Config {
            batch_size: 3,
            threshold: 6.0,
        };

        let outcome = score_batches(&client(), items, &config, Utc::now()).await;

        let scores: Vec<_> = outcome
            .admitted
            .iter()
            .map(|i| i.tier_score(Tier::Tier2).unwrap())
            .collect();
        assert_eq!(scores, vec![9.0, 6.0, 7.0, 8.0]);
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.usage.calls, 3);
        assert_eq!(outcome.usage.tokens_in, 300);
    }

    #[tokio::test]
    async fn malformed_batch_fails_closed() {
        let items = vec![
            item("Good 9"),
            item("Also good 8"),
            item("broken 10"),
            item("Fine 7"),
        ];
        let config = Tier2Config {
            batch_size: 2,
            threshold: 6.0,
        };

        let outcome = score_batches(&client(), items, &config, Utc::now()).await;

        let titles: Vec<_> = outcome.admitted.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Good 9", "Also good 8"]);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, "schema");
        assert_eq!(outcome.errors[0].subject.as_deref(), Some("batch 1"));
        assert_eq!(outcome.metrics()["batches_failed"], 1.0);
    }

    #[tokio::test]
    async fn missing_judgments_are_recorded() {
        let items = vec![item("Answered 8"), item("Unanswered 9"), item("Unanswered 7")];
        let silent: Vec<String> = items[1..].iter().map(|i| i.id.to_string()).collect();
        let config = Tier2Config {
            batch_size: 3,
            threshold: 6.0,
        };

        let outcome = score_batches(&client(), items, &config, Utc::now()).await;

        let titles: Vec<_> = outcome.admitted.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Answered 8"]);
        assert_eq!(outcome.unjudged, 2);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|e| e.kind == "schema"));
        let subjects: Vec<_> = outcome.errors.iter().filter_map(|e| e.subject.clone()).collect();
        assert_eq!(subjects, silent);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let outcome = score_batches(&client(), Vec::new(), &Tier2Config::default(), Utc::now()).await;
        assert_eq!(outcome.batches, 0);
        assert_eq!(outcome.usage.calls, 0);
    }
}

//! Bull/bear/arbiter consensus scoring for a single entity.
//!
//! The three stages run strictly in order and only exchange their payloads:
//! the bull stage sees the signals, the bear stage sees the signals plus the
//! bull payload, and [`arbitrate`] is a pure function of both payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};

use curator_shared::{ConsensusConfig, ConvictionWeights, Result};

use crate::llm::{CompletionRequest, LlmClient, SchemaHint, Usage};
use crate::schema::{BearPayload, BullPayload};

const BULL_SYSTEM: &str = "You argue the bull case for an entity. Use only adoption and growth \
evidence (stars, downloads, contributors, mentions, release cadence); ignore revenue and \
commercial viability. Respond with JSON: {\"momentum\": <0-100>, \"signals\": [<strings>], \
\"thesis\": \"<one sentence>\"}.";

const BEAR_SYSTEM: &str = "You argue the bear case for an entity and rebut the bull case you are \
given. Assess commercial maturity and brand safety. Respond with JSON: {\"maturity\": <0-100>, \
\"brand_safety\": <0-100, higher is safer>, \"primary_risk\": \"commercial|technical|legal|\
reputational|security|adoption|none\", \"red_flags\": [{\"description\": \"...\", \"severity\": \
\"low|medium|high|critical\"}], \"rebuttal\": \"<one sentence>\"}.";

/// Caller-supplied classification that selects the conviction weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    OpenSource,
    Commercial,
    Other,
}

impl EntityKind {
    fn weights(self, config: &ConsensusConfig) -> ConvictionWeights {
        match self {
            Self::OpenSource => config.open_source,
            Self::Commercial => config.commercial,
            Self::Other => config.other,
        }
    }
}

/// Raw signals about one entity, as read from a signals file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySignals {
    pub entity_id: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub signals: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictIntensity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Alert,
    Investigate,
    Monitor,
    Ignore,
}

/// The arbitrated outcome. Built once by [`arbitrate`]; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusVerdict {
    pub entity_id: String,
    pub kind: EntityKind,
    pub bull: BullPayload,
    pub bear: BearPayload,
    pub conflict_gap: f64,
    pub conflict: ConflictIntensity,
    pub base_score: f64,
    pub momentum_bonus: f64,
    pub risk_penalty: f64,
    /// 0-100.
    pub conviction: f64,
    pub recommendation: Recommendation,
}

pub fn classify_conflict(gap: f64, config: &ConsensusConfig) -> ConflictIntensity {
    if gap >= config.conflict_high_gap {
        ConflictIntensity::High
    } else if gap >= config.conflict_medium_gap {
        ConflictIntensity::Medium
    } else {
        ConflictIntensity::Low
    }
}

/// Combine the two one-sided analyses into a verdict.
pub fn arbitrate(
    entity_id: &str,
    kind: EntityKind,
    bull: BullPayload,
    bear: BearPayload,
    config: &ConsensusConfig,
) -> ConsensusVerdict {
    let weights = kind.weights(config);
    let base_score = weights.momentum * bull.momentum + weights.maturity * bear.maturity;

    let momentum_bonus = if bull.momentum > config.momentum_bonus_threshold {
        ((bull.momentum - config.momentum_bonus_threshold) * config.momentum_bonus_rate)
            .min(config.momentum_bonus_cap)
    } else {
        0.0
    };

    let flag_points: f64 = bear.red_flags.iter().map(|f| f.severity.points()).sum();
    let safety_shortfall = (config.brand_safety_floor - bear.brand_safety).max(0.0);
    let risk_penalty =
        (flag_points + safety_shortfall * config.brand_safety_rate).min(config.risk_penalty_cap);

    let conviction = (base_score + momentum_bonus - risk_penalty).clamp(0.0, 100.0);
    let conflict_gap = (bull.momentum - bear.maturity).abs();
    let conflict = classify_conflict(conflict_gap, config);

    let recommendation = if risk_penalty >= config.severe_penalty {
        Recommendation::Ignore
    } else if conflict == ConflictIntensity::High {
        Recommendation::Investigate
    } else if conviction > config.alert_threshold {
        Recommendation::Alert
    } else if conviction >= config.monitor_threshold {
        Recommendation::Monitor
    } else {
        Recommendation::Ignore
    };

    ConsensusVerdict {
        entity_id: entity_id.to_string(),
        kind,
        bull,
        bear,
        conflict_gap,
        conflict,
        base_score,
        momentum_bonus,
        risk_penalty,
        conviction,
        recommendation,
    }
}

/// Runs the bull and bear stages through the text-generation collaborator,
/// then arbitrates.
pub struct ConsensusScorer {
    llm: LlmClient,
    config: ConsensusConfig,
}

impl ConsensusScorer {
    pub fn new(llm: LlmClient, config: ConsensusConfig) -> Self {
        Self { llm, config }
    }

    pub async fn bull(&self, entity: &EntitySignals) -> Result<(BullPayload, Usage)> {
        let request = CompletionRequest {
            schema: SchemaHint::Bull,
            system: BULL_SYSTEM.to_string(),
            prompt: json!({ "entity": entity.entity_id, "signals": entity.signals }).to_string(),
            subject_ids: vec![entity.entity_id.clone()],
        };
        let (completion, usage) = self.llm.complete(&request).await?;
        Ok((BullPayload::parse(&completion.text)?, usage))
    }

    pub async fn bear(&self, entity: &EntitySignals, bull: &BullPayload) -> Result<(BearPayload, Usage)> {
        let request = CompletionRequest {
            schema: SchemaHint::Bear,
            system: BEAR_SYSTEM.to_string(),
            prompt: json!({
                "entity": entity.entity_id,
                "signals": entity.signals,
                "bull_case": bull,
            })
            .to_string(),
            subject_ids: vec![entity.entity_id.clone()],
        };
        let (completion, usage) = self.llm.complete(&request).await?;
        Ok((BearPayload::parse(&completion.text)?, usage))
    }

    /// Bull, then bear, then arbitration.
    #[instrument(skip_all, fields(entity = %entity.entity_id, kind = ?entity.kind))]
    pub async fn score(&self, entity: &EntitySignals) -> Result<(ConsensusVerdict, Usage)> {
        let (bull, bull_usage) = self.bull(entity).await?;
        let (bear, bear_usage) = self.bear(entity, &bull).await?;

        let mut usage = bull_usage;
        usage.add(&bear_usage);

        let verdict = arbitrate(&entity.entity_id, entity.kind, bull, bear, &self.config);
        info!(
            conviction = verdict.conviction,
            conflict = ?verdict.conflict,
            recommendation = ?verdict.recommendation,
            "consensus reached"
        );
        Ok((verdict, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallPolicy, Completion, TextGenerator};
    use crate::schema::{FlagSeverity, PrimaryRisk, RedFlag};
    use async_trait::async_trait;
    use curator_shared::LlmConfig;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    fn bull(momentum: f64) -> BullPayload {
        BullPayload {
            momentum,
            signals: vec!["stars doubled".into()],
            thesis: None,
        }
    }

    fn bear(maturity: f64, brand_safety: f64, flags: &[FlagSeverity]) -> BearPayload {
        BearPayload {
            maturity,
            brand_safety,
            primary_risk: PrimaryRisk::Commercial,
            red_flags: flags
                .iter()
                .map(|s| RedFlag {
                    description: "flag".into(),
                    severity: *s,
                })
                .collect(),
            rebuttal: None,
        }
    }

    #[test]
    fn open_source_weighting_favours_momentum() {
        let config = ConsensusConfig::default();
        let oss = arbitrate("proj", EntityKind::OpenSource, bull(90.0), bear(20.0, 80.0, &[]), &config);
        let com = arbitrate("proj", EntityKind::Commercial, bull(90.0), bear(20.0, 80.0, &[]), &config);

        assert!((oss.base_score - 69.0).abs() < 1e-9);
        assert!((com.base_score - 55.0).abs() < 1e-9);
        assert!((oss.momentum_bonus - 5.0).abs() < 1e-9);
        assert!(oss.conviction - com.conviction >= 10.0);
        assert_eq!(oss.conflict, ConflictIntensity::High);
        assert_eq!(oss.recommendation, Recommendation::Investigate);
    }

    #[test]
    fn recommendation_rules() {
        let config = ConsensusConfig::default();

        let alert = arbitrate("a", EntityKind::Commercial, bull(95.0), bear(85.0, 90.0, &[]), &config);
        assert_eq!(alert.conflict, ConflictIntensity::Low);
        assert_eq!(alert.recommendation, Recommendation::Alert);

        let monitor = arbitrate("b", EntityKind::Commercial, bull(60.0), bear(55.0, 90.0, &[]), &config);
        assert_eq!(monitor.recommendation, Recommendation::Monitor);

        let low = arbitrate("c", EntityKind::Other, bull(30.0), bear(20.0, 90.0, &[]), &config);
        assert_eq!(low.recommendation, Recommendation::Ignore);

        // Severe risk overrides a high score and a high conflict.
        let risky = arbitrate(
            "d",
            EntityKind::OpenSource,
            bull(95.0),
            bear(10.0, 20.0, &[FlagSeverity::Critical, FlagSeverity::Medium]),
            &config,
        );
        assert!((risky.risk_penalty - 29.0).abs() < 1e-9);
        assert_eq!(risky.recommendation, Recommendation::Ignore);
    }

    #[test]
    fn bonus_and_penalty_are_capped() {
        let config = ConsensusConfig::default();
        let v = arbitrate(
            "e",
            EntityKind::Commercial,
            bull(100.0),
            bear(100.0, 0.0, &[FlagSeverity::Critical, FlagSeverity::Critical]),
            &config,
        );
        assert_eq!(v.momentum_bonus, 10.0);
        assert_eq!(v.risk_penalty, 30.0);
        assert!((v.conviction - 80.0).abs() < 1e-9);
        assert_eq!(classify_conflict(25.0, &config), ConflictIntensity::Medium);
        assert_eq!(classify_conflict(24.9, &config), ConflictIntensity::Low);
    }

    /// Replays fixed payloads and records the prompts it was given.
    struct Debaters {
        prompts: Mutex<Vec<(SchemaHint, String)>>,
    }

    #[async_trait]
    impl TextGenerator for Debaters {
        async fn complete(&self, request: &CompletionRequest) -> curator_shared::Result<Completion> {
            self.prompts
                .lock()
                .unwrap()
                .push((request.schema, request.prompt.clone()));
            let text = match request.schema {
                SchemaHint::Bull => r#"{"momentum": 90, "signals": ["12k stars"], "thesis": "fast growth"}"#,
                _ => r#"{"maturity": 20, "brand_safety": 70, "primary_risk": "commercial", "red_flags": []}"#,
            };
            Ok(Completion {
                text: text.into(),
                tokens_in: 100,
                tokens_out: 40,
                model: "debaters".into(),
                latency_ms: 1,
                cached: false,
            })
        }

        fn model_id(&self) -> &str {
            "debaters"
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_bear_sees_bull() {
        let generator = Arc::new(Debaters {
            prompts: Mutex::new(Vec::new()),
        });
        let llm = LlmClient::with_policy(
            generator.clone(),
            CallPolicy::new(Duration::from_secs(5), 0, Duration::from_millis(1), Duration::ZERO, 1),
            &LlmConfig::default(),
        );
        let scorer = ConsensusScorer::new(llm, ConsensusConfig::default());
        let entity = EntitySignals {
            entity_id: "orion".into(),
            kind: EntityKind::OpenSource,
            signals: BTreeMap::from([("stars".to_string(), json!(12000))]),
        };

        let (verdict, usage) = scorer.score(&entity).await.unwrap();

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts[0].0, SchemaHint::Bull);
        assert_eq!(prompts[1].0, SchemaHint::Bear);
        assert!(prompts[1].1.contains("fast growth"));
        assert_eq!(usage.calls, 2);
        assert_eq!(verdict.bull.momentum, 90.0);
        assert!((verdict.conviction - 74.0).abs() < 1e-9);
    }
}

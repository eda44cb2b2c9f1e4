//! Run-level anomaly detection against a rolling per-phase baseline.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use curator_shared::{AnomalyConfig, PhaseStatus, Result, Run};
use curator_storage::{BaselineStat, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// One metric that strayed from its baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub phase: String,
    pub metric: String,
    pub current: f64,
    pub baseline_mean: f64,
    pub deviation_pct: f64,
    pub severity: Severity,
}

/// A canned recommendation triggered by a rule check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advice {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyReport {
    pub anomalies: Vec<Anomaly>,
    pub advice: Vec<Advice>,
}

/// Metrics compared per phase: duration, item counts and drop rate.
pub fn phase_metrics(run: &Run) -> Vec<(String, String, f64)> {
    let mut out = Vec::new();
    for phase in run.phases.iter().filter(|p| p.status == PhaseStatus::Success) {
        let mut push = |metric: &str, value: f64| {
            out.push((phase.name.clone(), metric.to_string(), value));
        };
        push("duration_ms", phase.duration_ms as f64);
        push("input_count", phase.input_count as f64);
        push("output_count", phase.output_count as f64);
        if phase.input_count > 0 {
            let dropped = phase.input_count.saturating_sub(phase.output_count);
            push("drop_rate", dropped as f64 / phase.input_count as f64);
        }
    }
    out
}

/// Compare `run` against `baseline`. Metrics with no history (or a zero mean)
/// are never flagged.
pub fn detect(run: &Run, baseline: &[BaselineStat], config: &AnomalyConfig) -> Vec<Anomaly> {
    let index: BTreeMap<(&str, &str), &BaselineStat> = baseline
        .iter()
        .map(|s| ((s.phase.as_str(), s.metric.as_str()), s))
        .collect();

    let mut anomalies = Vec::new();
    for (phase, metric, current) in phase_metrics(run) {
        let Some((count, baseline_mean)) = index
            .get(&(phase.as_str(), metric.as_str()))
            .map(|stat| (stat.count, stat.mean))
        else {
            continue;
        };
        if count == 0 || baseline_mean.abs() < f64::EPSILON {
            continue;
        }
        let deviation = (current - baseline_mean).abs() / baseline_mean.abs();
        let severity = if deviation > config.high_threshold {
            Severity::High
        } else if deviation > config.medium_threshold {
            Severity::Medium
        } else {
            continue;
        };
        anomalies.push(Anomaly {
            phase,
            metric,
            current,
            baseline_mean,
            deviation_pct: deviation * 100.0,
            severity,
        });
    }
    anomalies
}

fn metric(run: &Run, phase: &str, name: &str) -> Option<f64> {
    run.phase(phase).and_then(|p| p.metrics.get(name).copied())
}

/// Rule checks over the finished run.
pub fn advise(run: &Run, config: &AnomalyConfig) -> Vec<Advice> {
    let mut advice = Vec::new();

    if let (Some(ok), Some(attempted)) = (
        metric(run, "collect", "sources_succeeded"),
        metric(run, "collect", "sources_attempted"),
    ) {
        if attempted > 0.0 && ok / attempted < config.min_source_success_ratio {
            advice.push(Advice {
                code: "add_backup_sources",
                message: format!(
                    "only {ok:.0} of {attempted:.0} sources succeeded; add backup sources or fix failing feeds"
                ),
            });
        }
    }

    if let (Some(failed), Some(batches)) = (
        metric(run, "tier2_score", "batches_failed"),
        metric(run, "tier2_score", "batches"),
    ) {
        if batches > 0.0 && failed / batches > config.max_batch_failure_ratio {
            advice.push(Advice {
                code: "check_collaborator",
                message: format!(
                    "{failed:.0} of {batches:.0} scoring batches failed; check the text-generation service health and quota"
                ),
            });
        }
    }

    if let Some(tier1) = run.phase("tier1_filter") {
        if tier1.status == PhaseStatus::Success
            && tier1.input_count > 0
            && (tier1.output_count as f64 / tier1.input_count as f64) < config.min_tier1_pass_ratio
        {
            advice.push(Advice {
                code: "widen_keywords",
                message: format!(
                    "tier-1 passed {} of {} items; review the keyword vocabulary",
                    tier1.output_count, tier1.input_count
                ),
            });
        }
    }

    if let Some(tier3) = run.phase("tier3_score") {
        if tier3.status == PhaseStatus::Success && tier3.input_count > 0 && tier3.output_count == 0 {
            advice.push(Advice {
                code: "relax_tier3_minimum",
                message: format!(
                    "no item of {} reached the tier-3 minimum; consider relaxing it",
                    tier3.input_count
                ),
            });
        }
    }

    advice
}

/// Fold the run's successful phase metrics into `baseline`.
pub fn fold_baseline(run: &Run, baseline: &mut Vec<BaselineStat>) {
    for (phase, metric, value) in phase_metrics(run) {
        match baseline
            .iter_mut()
            .find(|s| s.phase == phase && s.metric == metric)
        {
            Some(stat) => stat.observe(value),
            None => {
                let mut stat = BaselineStat::empty(&phase, &metric);
                stat.observe(value);
                baseline.push(stat);
            }
        }
    }
}

/// Detects anomalies after each run and keeps the baseline current.
pub struct AnomalyMonitor {
    storage: Arc<Storage>,
    config: AnomalyConfig,
}

impl AnomalyMonitor {
    pub fn new(storage: Arc<Storage>, config: AnomalyConfig) -> Self {
        Self { storage, config }
    }

    /// Report on `run`, then fold it into the baseline whatever its status.
    #[instrument(skip_all, fields(run_id = %run.id, status = run.status.as_str()))]
    pub async fn observe(&self, run: &Run) -> Result<AnomalyReport> {
        let mut baseline = self.storage.load_baseline().await?;
        let report = AnomalyReport {
            anomalies: detect(run, &baseline, &self.config),
            advice: advise(run, &self.config),
        };

        for a in &report.anomalies {
            warn!(
                phase = %a.phase,
                metric = %a.metric,
                current = a.current,
                baseline = a.baseline_mean,
                deviation_pct = a.deviation_pct,
                severity = ?a.severity,
                "anomaly detected"
            );
        }

        fold_baseline(run, &mut baseline);
        self.storage.save_baseline(&baseline).await?;
        info!(
            anomalies = report.anomalies.len(),
            advice = report.advice.len(),
            "baseline updated"
        );
        Ok(report)
    }
}

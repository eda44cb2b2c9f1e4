//! Run orchestration: mode-dependent phase sequences with per-phase
//! checkpoints, resume, error aggregation and post-run anomaly checks.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use curator_collector::{CollectLimits, SourceCollector, SourceStatus, collect_all};
use curator_shared::{
    AppConfig, CuratorError, DefaultsConfig, Item, PhaseRecord, PhaseStatus, Result, Run,
    RunError, RunId, RunMode, RunStatus, WeekId,
};
use curator_storage::{Checkpoint, Storage};

use crate::accumulator::WeeklyAccumulator;
use crate::anomaly::{Advice, Anomaly, AnomalyMonitor, AnomalyReport};
use crate::llm::{LlmClient, Usage};
use crate::rank::dedup_and_rank;
use crate::refine::{self, EntityEnricher};
use crate::report::{RenderReceipt, RenderedDocument, Renderer, ReportMetadata, write_metrics};
use crate::tier1::Tier1Filter;
use crate::{tier2, tier3};

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// A named step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Collect,
    Tier1Filter,
    Tier2Score,
    Tier3Score,
    Accumulate,
    LoadWeek,
    DedupRank,
    Paraphrase,
    Enrich,
    Validate,
    Render,
    FinalizeWeek,
}

const ONE_SHOT: &[Phase] = &[
    Phase::Collect,
    Phase::Tier1Filter,
    Phase::Tier2Score,
    Phase::Tier3Score,
    Phase::Paraphrase,
    Phase::Enrich,
    Phase::Validate,
    Phase::Render,
];

const COLLECT: &[Phase] = &[
    Phase::Collect,
    Phase::Tier1Filter,
    Phase::Tier2Score,
    Phase::Accumulate,
];

const FINALIZE: &[Phase] = &[
    Phase::LoadWeek,
    Phase::DedupRank,
    Phase::Tier3Score,
    Phase::Paraphrase,
    Phase::Enrich,
    Phase::Validate,
    Phase::Render,
    Phase::FinalizeWeek,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Tier1Filter => "tier1_filter",
            Self::Tier2Score => "tier2_score",
            Self::Tier3Score => "tier3_score",
            Self::Accumulate => "accumulate",
            Self::LoadWeek => "load_week",
            Self::DedupRank => "dedup_rank",
            Self::Paraphrase => "paraphrase",
            Self::Enrich => "enrich",
            Self::Validate => "validate",
            Self::Render => "render",
            Self::FinalizeWeek => "finalize_week",
        }
    }

    /// A failed fatal phase fails the run and stops it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Accumulate | Self::LoadWeek | Self::Render | Self::FinalizeWeek
        )
    }

    /// The ordered phase list for a mode.
    pub fn sequence(mode: RunMode) -> &'static [Phase] {
        match mode {
            RunMode::OneShot => ONE_SHOT,
            RunMode::Collect => COLLECT,
            RunMode::Finalize => FINALIZE,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Request / summary
// ---------------------------------------------------------------------------

/// Where a run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// From the first phase.
    Fresh,
    /// From the latest checkpoint of the most recent unsuccessful run of the same mode.
    Latest,
    /// From the latest checkpoint of a specific run.
    Run(RunId),
}

/// Parameters of one invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub lookback_days: u32,
    pub target_size: usize,
    pub resume: Resume,
    /// Explicit week; defaults to the ISO week of `as_of`.
    pub week: Option<WeekId>,
    /// Reference time for collection windows, recency and the collection day.
    pub as_of: DateTime<Utc>,
}

impl RunRequest {
    pub fn from_defaults(mode: RunMode, defaults: &DefaultsConfig) -> Self {
        Self {
            mode,
            lookback_days: defaults.lookback_days,
            target_size: defaults.target_size,
            resume: Resume::Fresh,
            week: None,
            as_of: Utc::now(),
        }
    }
}

/// What a run reports back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub mode: RunMode,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week_id: Option<WeekId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<RunId>,
    pub phases: Vec<PhaseRecord>,
    pub final_item_count: usize,
    pub final_item_ids: Vec<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub anomalies: Vec<Anomaly>,
    pub recommendations: Vec<Advice>,
    pub errors: Vec<RunError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<RenderedDocument>,
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a phase executes.
    fn phase_started(&self, phase: &str, index: usize, total: usize);
    /// Called once a phase has succeeded, failed or been skipped.
    fn phase_finished(&self, record: &PhaseRecord);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase_started(&self, _phase: &str, _index: usize, _total: usize) {}
    fn phase_finished(&self, _record: &PhaseRecord) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Output of one successful phase.
struct PhaseOutput {
    items: Vec<Item>,
    metrics: BTreeMap<String, f64>,
    errors: Vec<RunError>,
    usage: Usage,
}

impl PhaseOutput {
    fn items(items: Vec<Item>) -> Self {
        Self {
            items,
            metrics: BTreeMap::new(),
            errors: Vec::new(),
            usage: Usage::default(),
        }
    }

    fn metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics.extend(metrics);
        self
    }
}

/// Run-scoped state shared by the phases of one run.
struct RunContext {
    run_id: RunId,
    mode: RunMode,
    week: Option<WeekId>,
    as_of: DateTime<Utc>,
    lookback_days: u32,
    target_size: usize,
    document: Option<RenderedDocument>,
    receipt: Option<RenderReceipt>,
}

/// Where a resumed run picks up.
struct RestorePoint {
    from: RunId,
    week: Option<WeekId>,
    checkpoint: Checkpoint,
    start: usize,
}

/// Drives runs against its collaborators.
pub struct Orchestrator {
    config: AppConfig,
    storage: Arc<Storage>,
    collector: Arc<dyn SourceCollector>,
    llm: LlmClient,
    renderer: Arc<dyn Renderer>,
    enricher: Option<Arc<dyn EntityEnricher>>,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        storage: Arc<Storage>,
        collector: Arc<dyn SourceCollector>,
        llm: LlmClient,
        renderer: Arc<dyn Renderer>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            storage,
            collector,
            llm,
            renderer,
            enricher: None,
            output_dir: output_dir.into(),
        }
    }

    /// Attach the background-entity collaborator; without one the enrich
    /// phase is skipped.
    pub fn with_enricher(mut self, enricher: Arc<dyn EntityEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn accumulator(&self) -> WeeklyAccumulator {
        WeeklyAccumulator::new(self.storage.clone())
    }

    /// Execute one run.
    ///
    /// Returns `Err` only when the run cannot be set up or its record cannot
    /// be persisted; phase failures are reported in the summary.
    #[instrument(skip_all, fields(mode = %request.mode))]
    pub async fn run(
        &self,
        request: &RunRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary> {
        self.config.validate()?;
        let sequence = Phase::sequence(request.mode);
        let restore = self.find_restore_point(request, sequence).await?;

        let week = match request.mode {
            RunMode::OneShot => None,
            _ => request
                .week
                .clone()
                .or_else(|| restore.as_ref().and_then(|r| r.week.clone()))
                .or_else(|| Some(WeekId::from_date(request.as_of.date_naive()))),
        };

        if request.mode == RunMode::Collect {
            let day = request.as_of.date_naive();
            if let Some(week) = week.as_ref().filter(|w| **w != WeekId::from_date(day)) {
                return Err(CuratorError::validation(format!(
                    "collection day {day} is outside week {week}"
                )));
            }
        }

        let mut run = Run::new(request.mode, week.clone(), Utc::now());
        let mut items: Vec<Item> = Vec::new();
        let mut start = 0;

        if let Some(point) = restore {
            info!(
                run_id = %run.id,
                resumed_from = %point.from,
                phase = %point.checkpoint.phase,
                items = point.checkpoint.items.len(),
                "resuming from checkpoint"
            );
            self.storage
                .write_checkpoint(
                    &run.id,
                    &point.checkpoint.phase,
                    point.checkpoint.seq,
                    &point.checkpoint.items,
                )
                .await?;
            run.resumed_from = Some(point.from);
            items = point.checkpoint.items;
            start = point.start;
        }

        self.storage.save_run(&run).await?;
        info!(run_id = %run.id, week = ?run.week_id, start_phase = start, "run started");

        let mut ctx = RunContext {
            run_id: run.id.clone(),
            mode: request.mode,
            week,
            as_of: request.as_of,
            lookback_days: request.lookback_days,
            target_size: request.target_size,
            document: None,
            receipt: None,
        };

        let mut aborted_by: Option<Phase> = None;
        let mut fatal_failure = false;

        for (index, phase) in sequence.iter().copied().enumerate().skip(start) {
            let mut record = PhaseRecord::new(phase.as_str());

            if let Some(failed) = aborted_by {
                record.skip(format!("run aborted after {failed} failed"))?;
                progress.phase_finished(&record);
                run.phases.push(record);
                continue;
            }
            if let Some(reason) = self.skip_reason(phase) {
                info!(phase = %phase, reason, "phase skipped");
                record.skip(reason)?;
                progress.phase_finished(&record);
                run.phases.push(record);
                self.storage.save_run(&run).await?;
                continue;
            }

            progress.phase_started(phase.as_str(), index, sequence.len());
            record.start(items.len(), Utc::now())?;
            let started = Instant::now();
            let result = self.execute(phase, items.clone(), &mut ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(mut output) => {
                    run.tokens_in += output.usage.tokens_in;
                    run.tokens_out += output.usage.tokens_out;
                    run.cost_usd += output.usage.cost_usd;
                    run.errors.append(&mut output.errors);
                    record.succeed(output.items.len(), duration_ms, output.metrics)?;
                    info!(
                        phase = %phase,
                        input = record.input_count,
                        output = record.output_count,
                        duration_ms,
                        "phase complete"
                    );
                    items = output.items;

                    // The next phase must not start before this checkpoint is durable.
                    if let Err(err) = self
                        .storage
                        .write_checkpoint(&run.id, phase.as_str(), index as u32, &items)
                        .await
                    {
                        warn!(phase = %phase, error = %err, "checkpoint write failed, aborting run");
                        run.errors.push(RunError::from_error(phase.as_str(), None, &err));
                        aborted_by = Some(phase);
                    }
                }
                Err(err) => {
                    warn!(phase = %phase, error = %err, fatal = phase.is_fatal(), "phase failed");
                    record.fail(err.to_string(), duration_ms)?;
                    run.errors.push(RunError::from_error(phase.as_str(), None, &err));
                    if phase.is_fatal() {
                        fatal_failure = true;
                    }
                    if phase.is_fatal() || err.aborts_run() {
                        aborted_by = Some(phase);
                    }
                }
            }

            progress.phase_finished(&record);
            run.phases.push(record);
            self.storage.save_run(&run).await?;
        }

        let any_failed = run.phases.iter().any(|p| p.status == PhaseStatus::Failed);
        let status = if fatal_failure || aborted_by.is_some() {
            RunStatus::Failed
        } else if any_failed {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        run.finish(status, Utc::now());

        let monitor = AnomalyMonitor::new(self.storage.clone(), self.config.anomaly.clone());
        let report = monitor.observe(&run).await.unwrap_or_else(|e| {
            warn!(error = %e, "anomaly check failed");
            AnomalyReport::default()
        });

        let summary = RunSummary {
            run_id: run.id.clone(),
            mode: run.mode,
            status: run.status,
            week_id: run.week_id.clone(),
            resumed_from: run.resumed_from.clone(),
            phases: run.phases.clone(),
            final_item_count: items.len(),
            final_item_ids: items.iter().map(|i| i.id.to_string()).collect(),
            tokens_in: run.tokens_in,
            tokens_out: run.tokens_out,
            cost_usd: run.cost_usd,
            anomalies: report.anomalies,
            recommendations: report.advice,
            errors: run.errors.clone(),
            document: ctx.document.take(),
        };

        if let Err(e) = write_metrics(&self.output_dir, &run.id, &summary) {
            warn!(error = %e, "failed to write metrics artifact");
        }
        self.storage.save_run(&run).await?;

        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            items = summary.final_item_count,
            tokens_in = run.tokens_in,
            tokens_out = run.tokens_out,
            cost_usd = run.cost_usd,
            errors = run.errors.len(),
            "run finished"
        );
        progress.done(&summary);
        Ok(summary)
    }

    fn skip_reason(&self, phase: Phase) -> Option<&'static str> {
        match phase {
            Phase::Paraphrase if !self.config.phases.paraphrase => Some("paraphrase disabled"),
            Phase::Enrich if self.enricher.is_none() => Some("no entity enricher configured"),
            _ => None,
        }
    }

    async fn find_restore_point(
        &self,
        request: &RunRequest,
        sequence: &[Phase],
    ) -> Result<Option<RestorePoint>> {
        let prior = match &request.resume {
            Resume::Fresh => return Ok(None),
            Resume::Latest => match self.storage.latest_resumable_run(request.mode).await? {
                Some(run) => run,
                None => {
                    info!(mode = %request.mode, "no unfinished run to resume, starting fresh");
                    return Ok(None);
                }
            },
            Resume::Run(id) => self
                .storage
                .get_run(id)
                .await?
                .ok_or_else(|| CuratorError::validation(format!("run {id} not found")))?,
        };

        if prior.mode != request.mode {
            return Err(CuratorError::validation(format!(
                "run {} is a {} run, cannot resume it as {}",
                prior.id, prior.mode, request.mode
            )));
        }

        let Some(checkpoint) = self.storage.latest_checkpoint(&prior.id).await? else {
            info!(run_id = %prior.id, "run has no checkpoint, starting fresh");
            return Ok(None);
        };

        let position = sequence
            .iter()
            .position(|p| p.as_str() == checkpoint.phase)
            .ok_or_else(|| {
                CuratorError::validation(format!(
                    "checkpoint phase '{}' is not part of a {} run",
                    checkpoint.phase, request.mode
                ))
            })?;

        // Clearing the week needs a receipt from this run's own render.
        let mut start = position + 1;
        if let Some(render) = sequence.iter().position(|p| *p == Phase::Render) {
            if sequence.contains(&Phase::FinalizeWeek) && start > render {
                start = render;
            }
        }

        Ok(Some(RestorePoint {
            from: prior.id,
            week: prior.week_id,
            checkpoint,
            start,
        }))
    }

    #[instrument(skip_all, fields(phase = %phase, run_id = %ctx.run_id, input = items.len()))]
    async fn execute(
        &self,
        phase: Phase,
        items: Vec<Item>,
        ctx: &mut RunContext,
    ) -> Result<PhaseOutput> {
        match phase {
            Phase::Collect => self.collect(ctx).await,
            Phase::Tier1Filter => {
                let filter = Tier1Filter::new(&self.config.tier1)?;
                let outcome = filter.apply(items, Utc::now());
                let metrics = outcome.metrics();
                Ok(PhaseOutput::items(outcome.passed).metrics(metrics))
            }
            Phase::Tier2Score => {
                let outcome = tier2::score_batches(&self.llm, items, &self.config.tier2, Utc::now()).await;
                Ok(PhaseOutput {
                    metrics: outcome.metrics(),
                    items: outcome.admitted,
                    errors: outcome.errors,
                    usage: outcome.usage,
                })
            }
            Phase::Tier3Score => {
                let outcome = tier3::deep_score(&self.llm, items, &self.config.tier3, Utc::now()).await?;
                Ok(PhaseOutput {
                    metrics: outcome.metrics(),
                    items: outcome.kept,
                    errors: outcome.errors,
                    usage: outcome.usage,
                })
            }
            Phase::Accumulate => {
                let week = require_week(ctx)?;
                let day = ctx.as_of.date_naive();
                let inserted = self.accumulator().append(week, day, &items).await?;
                let metrics = BTreeMap::from([
                    ("inserted".to_string(), inserted as f64),
                    ("already_present".to_string(), (items.len() - inserted.min(items.len())) as f64),
                ]);
                Ok(PhaseOutput::items(items).metrics(metrics))
            }
            Phase::LoadWeek => {
                let week = require_week(ctx)?;
                let accumulator = self.accumulator();
                let loaded = accumulator.load(week).await?;
                if loaded.is_empty() {
                    return Err(CuratorError::validation(format!(
                        "week {week} has no accumulated items"
                    )));
                }
                let days = accumulator.day_counts(week).await?.len();
                let metrics = BTreeMap::from([("days".to_string(), days as f64)]);
                Ok(PhaseOutput::items(loaded).metrics(metrics))
            }
            Phase::DedupRank => {
                let outcome = dedup_and_rank(items, &self.config.ranking, ctx.lookback_days, ctx.as_of);
                let metrics = outcome.metrics();
                Ok(PhaseOutput::items(outcome.candidates).metrics(metrics))
            }
            Phase::Paraphrase => {
                let outcome = refine::paraphrase(&self.llm, items, ctx.target_size).await;
                Ok(PhaseOutput {
                    metrics: outcome.metrics(),
                    items: outcome.items,
                    errors: outcome.errors,
                    usage: outcome.usage,
                })
            }
            Phase::Enrich => {
                let enricher = self
                    .enricher
                    .clone()
                    .ok_or_else(|| CuratorError::phase("enrich", "no entity enricher configured"))?;
                let outcome = refine::enrich(enricher, items).await;
                Ok(PhaseOutput {
                    metrics: outcome.metrics(),
                    items: outcome.items,
                    errors: outcome.errors,
                    usage: outcome.usage,
                })
            }
            Phase::Validate => {
                let outcome = refine::validate(items, ctx.target_size);
                let metrics = outcome.metrics();
                Ok(PhaseOutput::items(outcome.items).metrics(metrics))
            }
            Phase::Render => {
                let meta =
                    ReportMetadata::new(ctx.run_id.clone(), ctx.mode, ctx.week.clone(), ctx.as_of);
                let document = self.renderer.render(&items, &meta)?;
                info!(path = %document.path.display(), items = document.item_count, "report rendered");
                ctx.receipt = Some(RenderReceipt::issue(&ctx.run_id, &document));
                ctx.document = Some(document);
                Ok(PhaseOutput::items(items))
            }
            Phase::FinalizeWeek => {
                let week = require_week(ctx)?;
                let receipt = ctx.receipt.as_ref().ok_or_else(|| {
                    CuratorError::phase("finalize_week", "no successful render in this run")
                })?;
                let removed = self.accumulator().finalize(week, receipt).await?;
                let metrics = BTreeMap::from([("cleared".to_string(), removed as f64)]);
                Ok(PhaseOutput::items(items).metrics(metrics))
            }
        }
    }

    async fn collect(&self, ctx: &RunContext) -> Result<PhaseOutput> {
        let since = ctx.as_of - ChronoDuration::days(i64::from(ctx.lookback_days));
        let collection = collect_all(
            self.collector.clone(),
            &self.config.sources,
            since,
            CollectLimits::from(&self.config.collector),
        )
        .await;

        let mut errors = Vec::new();
        let mut timed_out = 0usize;
        for outcome in &collection.outcomes {
            if outcome.status == SourceStatus::TimedOut {
                timed_out += 1;
            }
            if let Some(err) = &outcome.error {
                errors.push(RunError {
                    phase: Phase::Collect.as_str().to_string(),
                    kind: err.kind.to_string(),
                    subject: Some(outcome.source_id.clone()),
                    message: err.message.clone(),
                });
            }
        }

        let attempted = collection.attempted();
        let succeeded = collection.succeeded();
        if attempted > 0 && succeeded == 0 {
            return Err(CuratorError::source(
                "*",
                format!("all {attempted} sources failed"),
            ));
        }

        let raw_count = collection.items.len();
        let mut seen = HashSet::new();
        let items: Vec<Item> = collection
            .items
            .into_iter()
            .map(|raw| {
                let credibility = self
                    .config
                    .source(&raw.source_id)
                    .map_or(1.0, |s| s.credibility);
                Item::from_raw(raw, credibility, ctx.as_of)
            })
            .filter(|item| seen.insert(item.id.clone()))
            .collect();

        let metrics = BTreeMap::from([
            ("sources_attempted".to_string(), attempted as f64),
            ("sources_succeeded".to_string(), succeeded as f64),
            ("sources_timed_out".to_string(), timed_out as f64),
            ("duplicates".to_string(), (raw_count - items.len()) as f64),
        ]);
        Ok(PhaseOutput {
            items,
            metrics,
            errors,
            usage: Usage::default(),
        })
    }
}

fn require_week(ctx: &RunContext) -> Result<&WeekId> {
    ctx.week
        .as_ref()
        .ok_or_else(|| CuratorError::validation(format!("{} run has no week", ctx.mode)))
}

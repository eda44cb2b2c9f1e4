//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use curator_collector::HttpCollector;
use curator_core::consensus::{ConsensusScorer, ConsensusVerdict, EntitySignals};
use curator_core::llm::{CachedGenerator, LlmClient, OpenRouterGenerator, TextGenerator, Usage};
use curator_core::pipeline::{
    Orchestrator, ProgressReporter, Resume, RunRequest, RunSummary,
};
use curator_core::report::MarkdownRenderer;
use curator_core::WeeklyAccumulator;
use curator_shared::{
    AppConfig, PhaseRecord, PhaseStatus, RunId, RunMode, RunStatus, WeekId, expand_home,
    init_config, load_config, load_config_from, resolve_api_key,
};
use curator_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// curator: collect, score and report on the week's news.
#[derive(Parser)]
#[command(
    name = "curator",
    version,
    about = "Collect, filter, score and report on industry news.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.curator/curator.toml).
    #[arg(long, global = true, env = "CURATOR_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModeArg {
    OneShot,
    Collect,
    Finalize,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::OneShot => RunMode::OneShot,
            ModeArg::Collect => RunMode::Collect,
            ModeArg::Finalize => RunMode::Finalize,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Execute a curation run.
    Run {
        /// Run mode.
        #[arg(long, value_enum, default_value = "one-shot")]
        mode: ModeArg,

        /// Collection window in days.
        #[arg(long)]
        lookback_days: Option<u32>,

        /// Number of items in the final report.
        #[arg(long)]
        target: Option<usize>,

        /// Resume from a checkpoint; without an id, the latest unfinished run of this mode.
        #[arg(long, value_name = "RUN_ID", num_args = 0..=1)]
        resume: Option<Option<String>>,

        /// ISO week to accumulate into or finalize (YYYY-Www).
        #[arg(long)]
        week: Option<String>,

        /// Database path.
        #[arg(long)]
        db: Option<String>,

        /// Output directory for reports and metrics.
        #[arg(long)]
        out: Option<String>,

        /// Bypass the completion cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Score entities with the bull/bear/arbiter consensus.
    Consensus {
        /// JSON file holding one entity or an array of entities.
        #[arg(long)]
        signals: PathBuf,

        /// Database path (completion cache).
        #[arg(long)]
        db: Option<String>,

        /// Bypass the completion cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Inspect the weekly accumulation.
    Week {
        #[command(subcommand)]
        action: WeekAction,
    },

    /// Inspect the anomaly baseline.
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },

    /// Inspect past runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum WeekAction {
    /// Per-day item counts for a week.
    Show {
        /// ISO week (defaults to the current week).
        #[arg(long)]
        week: Option<String>,

        #[arg(long)]
        db: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum BaselineAction {
    /// Print the rolling per-phase metric baseline.
    Show {
        #[arg(long)]
        db: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum RunsAction {
    /// Most recent runs first.
    List {
        #[arg(long, default_value = "20")]
        limit: u32,

        #[arg(long)]
        db: Option<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = ["curator", "curator_core", "curator_collector", "curator_storage", "curator_shared"]
        .map(|target| format!("{target}={level}"))
        .join(",");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            mode,
            lookback_days,
            target,
            resume,
            week,
            db,
            out,
            no_cache,
        } => {
            let config = config_at(config_path.as_deref())?;
            let mut request = RunRequest::from_defaults(mode.into(), &config.defaults);
            if let Some(days) = lookback_days {
                request.lookback_days = days;
            }
            if let Some(target) = target {
                request.target_size = target;
            }
            request.resume = match resume {
                None => Resume::Fresh,
                Some(None) => Resume::Latest,
                Some(Some(id)) => Resume::Run(
                    id.parse::<RunId>()
                        .map_err(|e| eyre!("invalid run id '{id}': {e}"))?,
                ),
            };
            request.week = week.as_deref().map(str::parse::<WeekId>).transpose()?;
            cmd_run(config, request, db.as_deref(), out.as_deref(), no_cache).await
        }
        Command::Consensus {
            signals,
            db,
            no_cache,
        } => {
            let config = config_at(config_path.as_deref())?;
            cmd_consensus(config, &signals, db.as_deref(), no_cache).await
        }
        Command::Week { action } => match action {
            WeekAction::Show { week, db } => {
                let config = config_at(config_path.as_deref())?;
                cmd_week_show(&config, week.as_deref(), db.as_deref()).await
            }
        },
        Command::Baseline { action } => match action {
            BaselineAction::Show { db } => {
                let config = config_at(config_path.as_deref())?;
                cmd_baseline_show(&config, db.as_deref()).await
            }
        },
        Command::Runs { action } => match action {
            RunsAction::List { limit, db } => {
                let config = config_at(config_path.as_deref())?;
                cmd_runs_list(&config, limit, db.as_deref()).await
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_deref()).await,
        },
    }
}

fn config_at(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn db_path(config: &AppConfig, flag: Option<&str>) -> PathBuf {
    expand_home(flag.unwrap_or(&config.defaults.db_path))
}

/// The collaborator client, behind the completion cache unless disabled.
fn llm_client(config: &AppConfig, storage: &Arc<Storage>, no_cache: bool) -> Result<LlmClient> {
    let api_key = resolve_api_key(config)?;
    let remote: Arc<dyn TextGenerator> = Arc::new(OpenRouterGenerator::new(&config.llm, api_key)?);
    let generator: Arc<dyn TextGenerator> = if no_cache {
        remote
    } else {
        Arc::new(CachedGenerator::new(remote, storage.clone()))
    };
    Ok(LlmClient::new(generator, &config.llm))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: AppConfig,
    request: RunRequest,
    db: Option<&str>,
    out: Option<&str>,
    no_cache: bool,
) -> Result<()> {
    let storage = Arc::new(Storage::open(&db_path(&config, db)).await?);
    let output_dir = expand_home(out.unwrap_or(&config.defaults.output_dir));
    let llm = llm_client(&config, &storage, no_cache)?;
    let collector = Arc::new(HttpCollector::new(Duration::from_secs(
        config.collector.timeout_secs,
    ))?);
    let renderer = Arc::new(MarkdownRenderer::new(output_dir.clone()));

    info!(
        mode = %request.mode,
        lookback_days = request.lookback_days,
        target = request.target_size,
        resume = ?request.resume,
        "starting run"
    );

    let orchestrator = Orchestrator::new(config, storage, collector, llm, renderer, output_dir);
    let reporter = CliProgress::new();
    let summary = orchestrator.run(&request, &reporter).await?;

    print_summary(&summary);
    match summary.status {
        RunStatus::Failed => Err(eyre!(
            "run {} failed; resume with `curator run --mode {} --resume {}`",
            summary.run_id,
            summary.mode,
            summary.run_id
        )),
        _ => Ok(()),
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run:     {} ({})", summary.run_id, summary.mode);
    println!("  Status:  {}", summary.status.as_str());
    if let Some(week) = &summary.week_id {
        println!("  Week:    {week}");
    }
    if let Some(from) = &summary.resumed_from {
        println!("  Resumed: {from}");
    }
    println!("  Items:   {}", summary.final_item_count);
    println!(
        "  Tokens:  {} in / {} out (${:.4})",
        summary.tokens_in, summary.tokens_out, summary.cost_usd
    );
    if let Some(doc) = &summary.document {
        println!("  Report:  {}", doc.path.display());
    }
    if !summary.errors.is_empty() {
        println!("  Errors:  {}", summary.errors.len());
    }
    for anomaly in &summary.anomalies {
        println!(
            "  ! {}.{}: {:.1} vs baseline {:.1} ({:+.0}%, {:?})",
            anomaly.phase,
            anomaly.metric,
            anomaly.current,
            anomaly.baseline_mean,
            anomaly.deviation_pct,
            anomaly.severity
        );
    }
    for advice in &summary.recommendations {
        println!("  > {}", advice.message);
    }
    println!();
}

async fn cmd_consensus(
    config: AppConfig,
    signals: &Path,
    db: Option<&str>,
    no_cache: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(signals)
        .wrap_err_with(|| format!("reading {}", signals.display()))?;
    let entities: Vec<EntitySignals> = match serde_json::from_str(&content) {
        Ok(list) => list,
        Err(_) => vec![
            serde_json::from_str(&content)
                .wrap_err_with(|| format!("{} is not an entity or entity list", signals.display()))?,
        ],
    };

    let storage = Arc::new(Storage::open(&db_path(&config, db)).await?);
    let scorer = ConsensusScorer::new(llm_client(&config, &storage, no_cache)?, config.consensus.clone());

    let mut verdicts: Vec<ConsensusVerdict> = Vec::with_capacity(entities.len());
    let mut usage = Usage::default();
    for entity in &entities {
        match scorer.score(entity).await {
            Ok((verdict, spent)) => {
                usage.add(&spent);
                verdicts.push(verdict);
            }
            Err(e) => warn!(entity = %entity.entity_id, error = %e, "consensus scoring failed"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&verdicts)?);
    info!(
        scored = verdicts.len(),
        failed = entities.len() - verdicts.len(),
        tokens_in = usage.tokens_in,
        tokens_out = usage.tokens_out,
        cost_usd = usage.cost_usd,
        "consensus complete"
    );
    if verdicts.len() < entities.len() {
        return Err(eyre!(
            "{} of {} entities could not be scored",
            entities.len() - verdicts.len(),
            entities.len()
        ));
    }
    Ok(())
}

async fn cmd_week_show(config: &AppConfig, week: Option<&str>, db: Option<&str>) -> Result<()> {
    let week = match week {
        Some(w) => w.parse::<WeekId>()?,
        None => WeekId::current(),
    };
    let storage = Arc::new(Storage::open_readonly(&db_path(config, db)).await?);
    let counts = WeeklyAccumulator::new(storage).day_counts(&week).await?;

    println!("Week {week}");
    if counts.is_empty() {
        println!("  (no accumulated items)");
    }
    for (day, count) in &counts {
        println!("  {day}  {count:>5}");
    }
    let total: usize = counts.iter().map(|(_, c)| c).sum();
    println!("  total       {total:>5}");
    Ok(())
}

async fn cmd_baseline_show(config: &AppConfig, db: Option<&str>) -> Result<()> {
    let storage = Storage::open_readonly(&db_path(config, db)).await?;
    let baseline = storage.load_baseline().await?;
    if baseline.is_empty() {
        println!("No baseline yet; it is built from completed runs.");
        return Ok(());
    }
    println!("{:<16} {:<14} {:>6} {:>12} {:>12}", "phase", "metric", "runs", "mean", "stddev");
    for stat in &baseline {
        let stddev = stat.variance().map(f64::sqrt).unwrap_or(0.0);
        println!(
            "{:<16} {:<14} {:>6} {:>12.2} {:>12.2}",
            stat.phase, stat.metric, stat.count, stat.mean, stddev
        );
    }
    Ok(())
}

async fn cmd_runs_list(config: &AppConfig, limit: u32, db: Option<&str>) -> Result<()> {
    let storage = Storage::open_readonly(&db_path(config, db)).await?;
    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in &runs {
        let failed = run
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Failed)
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        println!(
            "{}  {:<9} {:<8} {}  {} errors{}",
            run.id,
            run.mode.as_str(),
            run.status.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.errors.len(),
            if failed.is_empty() {
                String::new()
            } else {
                format!("  failed: {}", failed.join(", "))
            }
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = config_at(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase_started(&self, phase: &str, index: usize, total: usize) {
        self.spinner
            .set_message(format!("[{}/{total}] {phase}", index + 1));
    }

    fn phase_finished(&self, record: &PhaseRecord) {
        let line = match record.status {
            PhaseStatus::Success => format!(
                "  ok    {:<14} {:>5} -> {:<5} {}ms",
                record.name, record.input_count, record.output_count, record.duration_ms
            ),
            PhaseStatus::Failed => format!(
                "  FAIL  {:<14} {}",
                record.name,
                record.error.as_deref().unwrap_or("")
            ),
            PhaseStatus::Skipped => format!(
                "  skip  {:<14} {}",
                record.name,
                record.error.as_deref().unwrap_or("")
            ),
            _ => return,
        };
        self.spinner.println(line);
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

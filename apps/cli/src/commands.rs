//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use curricula_core::{
    BridgeConfig, BridgeModel, Collaborators, JobState, JobStatus, KillSwitch, Orchestrator,
    ProgressReporter, ResumeEvent, SubmitOutcome,
};
use curricula_shared::{
    AppConfig, CurriculumRequest, GenerationKind, JobId, JurisdictionChoice, JurisdictionLevel,
    LogAlertSink, SearchCapability, expand_home, init_config, load_config, validate_api_key,
    validate_config,
};
use curricula_sources::{HttpDocumentExtractor, HttpSearch};
use curricula_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Curricula: verified curricula and grounded lesson content.
#[derive(Parser)]
#[command(
    name = "curricula",
    version,
    about = "Resolve a request to an official curriculum and generate content grounded in it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Kill switch to engage for this run (repeatable).
    #[arg(long, value_enum, global = true)]
    pub disable: Vec<SwitchArg>,

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
pub(crate) enum SwitchArg {
    Ingestion,
    Generation,
    ReplicaStorage,
}

impl From<SwitchArg> for KillSwitch {
    fn from(arg: SwitchArg) -> Self {
        match arg {
            SwitchArg::Ingestion => Self::Ingestion,
            SwitchArg::Generation => Self::Generation,
            SwitchArg::ReplicaStorage => Self::ReplicaStorage,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum KindArg {
    LessonPlan,
    Quiz,
    Summary,
}

impl From<KindArg> for GenerationKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::LessonPlan => Self::LessonPlan,
            KindArg::Quiz => Self::Quiz,
            KindArg::Summary => Self::Summary,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Request content for a curriculum, e.g. "JSS 1 biology lesson plan for Nigeria".
    Request {
        prompt: String,

        /// Jurisdiction: national, state:<name> or county:<name>[@<parent key>].
        #[arg(short, long)]
        jurisdiction: Option<String>,

        /// What to generate.
        #[arg(short, long, value_enum, default_value = "summary")]
        kind: KindArg,
    },

    /// Continue a job waiting on an answer or a human decision.
    Resume {
        job_id: String,

        /// Resume token printed when the job suspended.
        #[arg(long)]
        token: String,

        #[command(subcommand)]
        event: ResumeAction,
    },

    /// Rebuild the replica a finished job was served from.
    Refresh { job_id: String },

    /// Show a job's state, tier history and result.
    Status { job_id: String },

    /// List open human alerts.
    Alerts,

    /// Re-drive jobs a previous run left mid-stage.
    Recover,

    /// Inspect the curriculum vault.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum ResumeAction {
    /// Answer a jurisdiction question.
    Answer {
        /// national, state:<name> or county:<name>[@<parent key>].
        jurisdiction: String,
    },
    /// Approve and continue past an alert.
    Approve,
    /// Supply an official source URL to validate instead of search results.
    Source { url: String },
    /// Stop the job.
    Terminate,
}

#[derive(Subcommand)]
pub(crate) enum VaultAction {
    /// List stored curricula.
    List,
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

    let filter = match cli.verbose {
        0 => "curricula=info",
        1 => "curricula=debug",
        _ => "curricula=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
    let json = cli.json;
    match cli.command {
        Command::Request {
            prompt,
            jurisdiction,
            kind,
        } => cmd_request(&cli.disable, prompt, jurisdiction.as_deref(), kind, json).await,
        Command::Resume {
            job_id,
            token,
            event,
        } => cmd_resume(&cli.disable, &job_id, &token, event, json).await,
        Command::Refresh { job_id } => cmd_refresh(&cli.disable, &job_id, json).await,
        Command::Status { job_id } => cmd_status(&job_id, json).await,
        Command::Alerts => cmd_alerts(json).await,
        Command::Recover => cmd_recover(&cli.disable, json).await,
        Command::Vault { action } => match action {
            VaultAction::List => cmd_vault_list(json).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

/// A started orchestrator plus the bridge it must shut down.
struct Engine {
    orchestrator: Orchestrator,
    bridge: Arc<BridgeModel>,
}

impl Engine {
    async fn start(disabled: &[SwitchArg]) -> Result<Self> {
        let config = load_config()?;
        validate_config(&config)?;
        if let Err(e) = validate_api_key(&config) {
            warn!(error = %e, "model tiers will fail over to deterministic fallbacks");
        }

        let storage = Arc::new(open_storage(&config).await?);
        let search: Option<Arc<dyn SearchCapability>> = match &config.search.endpoint {
            Some(_) => Some(Arc::new(HttpSearch::new(
                &config.search,
                config.countries.clone(),
            )?)),
            None => {
                info!("no search endpoint configured, using official domains only");
                None
            }
        };
        let bridge = Arc::new(BridgeModel::new(BridgeConfig::from(&config.models)));
        let collaborators = Collaborators {
            search,
            extractor: Arc::new(HttpDocumentExtractor::new(&config.search)?),
            model: bridge.clone(),
            alerts: Arc::new(LogAlertSink),
        };

        let orchestrator =
            Orchestrator::start_with(config, storage, collaborators, Arc::new(CliProgress::new()))
                .await?;
        let switches = orchestrator.kill_switches();
        for switch in disabled {
            switches.set((*switch).into(), true);
        }
        Ok(Self {
            orchestrator,
            bridge,
        })
    }

    /// Wait for background work, then stop the bridge.
    async fn finish(self) {
        self.orchestrator.drain().await;
        self.bridge.shutdown().await;
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.defaults.db_path)?;
    Ok(Storage::open(&path).await?)
}

/// Open the database read-only for the reporting commands.
async fn open_reporting(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.defaults.db_path)?;
    if !path.exists() {
        return Err(eyre!(
            "no database at {}; run `curricula request` first",
            path.display()
        ));
    }
    Ok(Storage::open_readonly(&path).await?)
}

fn parse_job_id(job_id: &str) -> Result<JobId> {
    job_id
        .parse()
        .map_err(|e| eyre!("invalid job id '{job_id}': {e}"))
}

/// Parse `national`, `state:<name>` or `county:<name>[@<parent key>]`.
fn parse_jurisdiction(value: &str) -> Result<JurisdictionChoice> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("national") {
        return Ok(JurisdictionChoice::national());
    }
    let (level, rest) = value
        .split_once(':')
        .ok_or_else(|| eyre!("expected national, state:<name> or county:<name>, got '{value}'"))?;
    let level: JurisdictionLevel = level.trim().to_lowercase().parse()?;
    let (name, parent) = match rest.split_once('@') {
        Some((name, parent)) => (name.trim(), Some(parent.trim().to_string())),
        None => (rest.trim(), None),
    };
    if name.is_empty() {
        return Err(eyre!("jurisdiction '{value}' has no name"));
    }
    Ok(JurisdictionChoice {
        level,
        name: Some(name.to_string()),
        parent,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_request(
    disabled: &[SwitchArg],
    prompt: String,
    jurisdiction: Option<&str>,
    kind: KindArg,
    json: bool,
) -> Result<()> {
    let request = CurriculumRequest {
        prompt,
        jurisdiction: jurisdiction.map(parse_jurisdiction).transpose()?,
        generation: kind.into(),
    };
    let engine = Engine::start(disabled).await?;
    info!(prompt = %request.prompt, "submitting request");

    let outcome = engine.orchestrator.submit(request).await?;
    let result = settle(&engine.orchestrator, outcome, json).await;
    engine.finish().await;
    result
}

async fn cmd_resume(
    disabled: &[SwitchArg],
    job_id: &str,
    token: &str,
    action: ResumeAction,
    json: bool,
) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let event = match action {
        ResumeAction::Answer { jurisdiction } => {
            ResumeEvent::Jurisdiction(parse_jurisdiction(&jurisdiction)?)
        }
        ResumeAction::Approve => ResumeEvent::Approve,
        ResumeAction::Source { url } => ResumeEvent::ProvideSource(url),
        ResumeAction::Terminate => ResumeEvent::Terminate,
    };

    let engine = Engine::start(disabled).await?;
    let outcome = engine.orchestrator.resume(job_id, token, event).await?;
    let result = settle(&engine.orchestrator, outcome, json).await;
    engine.finish().await;
    result
}

async fn cmd_refresh(disabled: &[SwitchArg], job_id: &str, json: bool) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let engine = Engine::start(disabled).await?;
    let outcome = engine.orchestrator.refresh(job_id).await?;
    let result = settle(&engine.orchestrator, outcome, json).await;
    engine.finish().await;
    result
}

async fn cmd_recover(disabled: &[SwitchArg], json: bool) -> Result<()> {
    let engine = Engine::start(disabled).await?;
    let recovered = engine.orchestrator.recover_in_flight().await?;
    let mut statuses = Vec::new();
    for job_id in &recovered {
        statuses.push(engine.orchestrator.wait(*job_id).await?);
    }
    engine.finish().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else if statuses.is_empty() {
        println!("No in-flight jobs to recover.");
    } else {
        for status in &statuses {
            print_status(status);
        }
    }
    Ok(())
}

async fn cmd_status(job_id: &str, json: bool) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let config = load_config()?;
    let storage = open_reporting(&config).await?;
    let row = storage
        .load_job(&job_id.to_string())
        .await?
        .ok_or_else(|| eyre!("unknown job {job_id}"))?;
    let job = curricula_core::Job::from_row(&row)?;
    let status = JobStatus::from(&job);

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

async fn cmd_alerts(json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = open_reporting(&config).await?;
    let alerts = storage.open_alerts().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&alerts)?);
        return Ok(());
    }
    if alerts.is_empty() {
        println!("No open alerts.");
    }
    for alert in &alerts {
        println!();
        println!("  Job:     {}", alert.job_id);
        println!("  Class:   {}", alert.class);
        println!("  Reason:  {}", alert.reason);
        println!("  Action:  {}", alert.recommended_action);
        println!("  Raised:  {}", alert.raised_at.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn cmd_vault_list(json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = open_reporting(&config).await?;
    let records = storage.list_curricula().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("The vault is empty.");
    }
    for record in &records {
        println!(
            "  {:<3} {:<20} {:<10} {:<16} v{} {:.2} {} (ttl {})",
            record.country_code,
            record.jurisdiction_key,
            record.grade,
            record.subject,
            record.version,
            record.confidence_score,
            record.status.as_str(),
            record.ttl_expiry.format("%Y-%m-%d"),
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Wait for a started job, then print where it ended up.
async fn settle(orchestrator: &Orchestrator, outcome: SubmitOutcome, json: bool) -> Result<()> {
    let job_id = match &outcome {
        SubmitOutcome::Enqueued { job_id } | SubmitOutcome::Resumed { job_id } => *job_id,
        _ => {
            print_outcome(&outcome, json)?;
            return Ok(());
        }
    };

    let status = orchestrator.wait(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_outcome(outcome: &SubmitOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    println!();
    match outcome {
        SubmitOutcome::Served {
            job_id,
            output,
            stale_warning,
        } => {
            println!("  Job:      {job_id}");
            if let Some(warning) = stale_warning {
                println!("  Warning:  {warning}");
            }
            println!("  Kind:     {}", output.kind.as_str());
            println!("  Coverage: {:.0}%", output.coverage * 100.0);
            println!();
            println!("{}", output.content());
        }
        SubmitOutcome::NeedsInput {
            job_id,
            question,
            resume_token,
        } => {
            println!("  {}", question.prompt);
            if !question.options.is_empty() {
                println!("  Options: {}", question.options.join(", "));
            }
            println!();
            println!(
                "  curricula resume {job_id} --token {resume_token} answer <jurisdiction>"
            );
        }
        SubmitOutcome::Joined { job_id } => {
            println!("  Job {job_id} is already building this curriculum.");
            println!("  Check it with: curricula status {job_id}");
        }
        SubmitOutcome::Rejected { reason } => println!("  Request rejected: {reason}"),
        SubmitOutcome::Alert { job_id, alert } => {
            println!("  Job:     {job_id} needs a human");
            println!("  Reason:  {}", alert.reason);
            println!("  Action:  {}", alert.recommended_action);
        }
        SubmitOutcome::Failed { job_id, error } => {
            println!("  Job {job_id} failed: {error}");
        }
        SubmitOutcome::Enqueued { job_id } | SubmitOutcome::Resumed { job_id } => {
            println!("  Job {job_id} is running.");
        }
    }
    println!();
    Ok(())
}

fn print_status(status: &JobStatus) {
    println!();
    println!("  Job:     {}", status.job_id);
    println!("  State:   {}", status.state);
    if let Some(key) = &status.key {
        println!("  Key:     {key}");
    }
    for tier in &status.tiers {
        let confidence = tier
            .confidence
            .map(|c| format!("{c:.2}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "    {:<10} {:<13} {:<24} {confidence}",
            tier.stage.as_str(),
            tier.tier.as_str(),
            tier.model_id
        );
    }
    if let Some(alert) = &status.alert {
        println!("  Reason:  {}", alert.reason);
        println!("  Action:  {}", alert.recommended_action);
    }
    if let Some(question) = &status.question {
        println!("  Question: {}", question.prompt);
    }
    if let Some(token) = &status.resume_token {
        println!("  Resume:  curricula resume {} --token {token} <event>", status.job_id);
    }
    if let Some(error) = &status.last_error {
        println!("  Error:   [{}] {}", error.class, error.message);
    }
    if let Some(warning) = &status.stale_warning {
        println!("  Warning: {warning}");
    }
    if status.state == JobState::End {
        if let Some(output) = &status.generation {
            println!();
            println!("{}", output.content());
        }
    }
    println!();
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
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, _job_id: JobId, state: JobState) {
        if self.spinner.is_finished() {
            self.spinner.reset();
        }
        self.spinner.enable_steady_tick(Duration::from_millis(80));
        self.spinner.set_message(state.as_str().to_string());
    }

    fn done(&self, _job_id: JobId, _state: JobState) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_jurisdictions() {
        assert_eq!(
            parse_jurisdiction("national").unwrap(),
            JurisdictionChoice::national()
        );
        let state = parse_jurisdiction("state:Lagos").unwrap();
        assert_eq!(state.level, JurisdictionLevel::State);
        assert_eq!(state.name.as_deref(), Some("Lagos"));

        let county = parse_jurisdiction("county:Ikeja@state:lagos").unwrap();
        assert_eq!(county.level, JurisdictionLevel::County);
        assert_eq!(county.parent.as_deref(), Some("state:lagos"));

        assert!(parse_jurisdiction("state:").is_err());
        assert!(parse_jurisdiction("province:x").is_err());
        assert!(parse_jurisdiction("lagos").is_err());
    }
}

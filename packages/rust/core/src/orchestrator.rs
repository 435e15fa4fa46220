//! The orchestrator: one job per request, driven through the transition table.
//!
//! The request path (normalize, resolve, look up) runs inline and either
//! serves from the vault, asks the caller one question, or claims the
//! request's key and starts a cold start in the background. Suspended jobs
//! (WAIT_USER, HumanAlert) are persisted with a resume token and continue
//! only through [`Orchestrator::resume`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use curricula_grounding::{GroundingPolicy, GroundingVerifier, LexicalCosine};
use curricula_router::{ModelRouter, RouterConfig};
use curricula_shared::{
    AgentOutput, AlertSink, AppConfig, AuthorityHint, CandidateUrl, Competency, CurriculaError,
    CurriculumRecord, CurriculumRequest, CurriculumStatus, DocumentExtractor, FallbackTier,
    GenerationOutput, GenerationStatus, GenerativeModel, HumanAlert, JobId,
    JurisdictionChoice, KillSwitchConfig, ParsingStatus, Result, SearchCapability, SearchOutput,
    SearchStatus, StageMeta, ValidationStatus,
};
use curricula_storage::Storage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::job::{AlertKind, Job, JobError, JobKey, TierRecord};
use crate::jurisdiction::{AmbiguitySignals, JurisdictionResolver, Question, ResolveOutcome};
use crate::normalizer::Normalizer;
use crate::progress::{ProgressReporter, SilentProgress};
use crate::registry::{Claim, JobRegistry};
use crate::stages::{StageInput, StageOutcome, StageProduct, StageRunner, StageTask};
use crate::state::{self, Condition, JobState};
use crate::vault::{self, VaultDecision};

/// Model id recorded on a search output supplied by a human.
const MANUAL_SOURCE: &str = "manual-source";

// ---------------------------------------------------------------------------
// Collaborators and kill switches
// ---------------------------------------------------------------------------

/// External capabilities the engine consumes.
#[derive(Clone)]
pub struct Collaborators {
    /// `None` sends search straight to the official-domain fallback.
    pub search: Option<Arc<dyn SearchCapability>>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub model: Arc<dyn GenerativeModel>,
    pub alerts: Arc<dyn AlertSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitch {
    Ingestion,
    Generation,
    ReplicaStorage,
}

/// Process-scoped kill switches, read before every dispatch.
#[derive(Debug, Default)]
pub struct KillSwitches {
    ingestion: AtomicBool,
    generation: AtomicBool,
    replica_storage: AtomicBool,
}

impl KillSwitches {
    pub fn from_config(config: &KillSwitchConfig) -> Self {
        Self {
            ingestion: AtomicBool::new(config.disable_ingestion),
            generation: AtomicBool::new(config.disable_generation),
            replica_storage: AtomicBool::new(config.disable_replica_storage),
        }
    }

    pub fn set(&self, switch: KillSwitch, active: bool) {
        self.flag(switch).store(active, Ordering::SeqCst);
        warn!(?switch, active, "kill switch changed");
    }

    pub fn is_active(&self, switch: KillSwitch) -> bool {
        self.flag(switch).load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> KillSwitchConfig {
        KillSwitchConfig {
            disable_ingestion: self.is_active(KillSwitch::Ingestion),
            disable_generation: self.is_active(KillSwitch::Generation),
            disable_replica_storage: self.is_active(KillSwitch::ReplicaStorage),
        }
    }

    /// The switch guarding dispatch from `state`, if any.
    pub fn guarding(state: JobState) -> Option<KillSwitch> {
        match state {
            JobState::ScoutAgent
            | JobState::GatekeeperAgent
            | JobState::ArchitectAgent
            | JobState::Embedder => Some(KillSwitch::Ingestion),
            JobState::VaultStore => Some(KillSwitch::ReplicaStorage),
            JobState::Generate => Some(KillSwitch::Generation),
            _ => None,
        }
    }

    fn flag(&self, switch: KillSwitch) -> &AtomicBool {
        match switch {
            KillSwitch::Ingestion => &self.ingestion,
            KillSwitch::Generation => &self.generation,
            KillSwitch::ReplicaStorage => &self.replica_storage,
        }
    }
}

// ---------------------------------------------------------------------------
// Public results
// ---------------------------------------------------------------------------

/// What a caller gets back from `submit`, `resume` or `refresh`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Generated from a vault artifact.
    Served {
        job_id: JobId,
        output: GenerationOutput,
        #[serde(skip_serializing_if = "Option::is_none")]
        stale_warning: Option<String>,
    },
    /// The caller must answer one question.
    NeedsInput {
        job_id: JobId,
        question: Question,
        resume_token: String,
    },
    /// A cold start is running in the background.
    Enqueued { job_id: JobId },
    /// Another job already holds this key; `job_id` is that job.
    Joined { job_id: JobId },
    /// The request could not be normalized. Nothing was stored.
    Rejected { reason: String },
    /// The job is waiting on a human.
    Alert { job_id: JobId, alert: HumanAlert },
    Failed { job_id: JobId, error: String },
    /// A suspended job is running again.
    Resumed { job_id: JobId },
}

/// External event that continues a suspended job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeEvent {
    /// Answer to a jurisdiction question.
    Jurisdiction(JurisdictionChoice),
    /// Human approval of an alert.
    Approve,
    /// A source URL to validate in place of search results.
    ProvideSource(String),
    Terminate,
}

impl ResumeEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Jurisdiction(_) => "jurisdiction answer",
            Self::Approve => "approval",
            Self::ProvideSource(_) => "manual source",
            Self::Terminate => "termination",
        }
    }
}

/// Status query view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub key: Option<String>,
    pub resume_token: Option<String>,
    pub question: Option<Question>,
    pub alert: Option<HumanAlert>,
    pub last_error: Option<JobError>,
    pub stale_warning: Option<String>,
    pub generation: Option<GenerationOutput>,
    pub tiers: Vec<TierRecord>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            key: job.key.as_ref().map(ToString::to_string),
            resume_token: job.resume_token.as_ref().map(|t| t.as_str().to_string()),
            question: job.question.clone(),
            alert: job.alert.as_ref().map(|a| a.alert.clone()),
            last_error: job.last_error.clone(),
            stale_warning: job.payload.stale_warning.clone(),
            generation: job.payload.generation.clone(),
            tiers: job.tier_history.clone(),
            updated_at: job.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<AppConfig>,
    storage: Arc<Storage>,
    registry: JobRegistry,
    normalizer: Normalizer,
    resolver: JurisdictionResolver,
    verifier: GroundingVerifier,
    runner: StageRunner,
    kill_switches: Arc<KillSwitches>,
    alerts: Arc<dyn AlertSink>,
    progress: Arc<dyn ProgressReporter>,
    handles: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl Orchestrator {
    pub async fn start(
        config: AppConfig,
        storage: Arc<Storage>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        Self::start_with(config, storage, collaborators, Arc::new(SilentProgress)).await
    }

    /// Load the router's ledger and floors, initialize kill switches, and
    /// build every component.
    pub async fn start_with(
        config: AppConfig,
        storage: Arc<Storage>,
        collaborators: Collaborators,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let router = Arc::new(
            ModelRouter::start(RouterConfig::from(config.as_ref()), storage.clone()).await?,
        );
        let verifier = GroundingVerifier::new(
            Box::new(LexicalCosine),
            GroundingPolicy::from_config(&config.thresholds, &config.grounding),
        );
        let runner = StageRunner::new(config.clone(), router, storage.clone(), &collaborators);
        let kill_switches = Arc::new(KillSwitches::from_config(&config.kill_switches));

        info!(
            countries = config.countries.len(),
            shadow = config.shadow.enabled,
            "orchestrator started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::new(storage.clone()),
                normalizer: Normalizer::from_config(&config),
                resolver: JurisdictionResolver::new(&config.thresholds),
                verifier,
                runner,
                kill_switches,
                alerts: collaborators.alerts,
                progress,
                handles: Mutex::new(HashMap::new()),
                config,
                storage,
            }),
        })
    }

    /// Accept a request and take it as far as the request path goes.
    #[instrument(skip_all)]
    pub async fn submit(&self, request: CurriculumRequest) -> Result<SubmitOutcome> {
        let mut job = Job::new(request);

        match self.inner.normalizer.normalize(&job.payload.request.prompt) {
            Ok(normalized) => {
                info!(
                    job_id = %job.id,
                    country = %normalized.country_code,
                    grade = %normalized.grade,
                    subject = %normalized.subject,
                    "request normalized"
                );
                job.payload.normalized = Some(normalized);
                transition(&mut job, Condition::Normalized)?;
            }
            Err(e @ CurriculaError::Validation { .. }) => {
                transition(&mut job, Condition::Rejected)?;
                info!(reason = %e, "request rejected");
                return Ok(SubmitOutcome::Rejected {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        self.inner.advance(job).await
    }

    /// Continue a suspended job. The token must be the job's current one.
    #[instrument(skip_all, fields(job_id = %job_id, event = event.name()))]
    pub async fn resume(
        &self,
        job_id: JobId,
        token: &str,
        event: ResumeEvent,
    ) -> Result<SubmitOutcome> {
        let inner = &self.inner;
        let mut job = inner.load(job_id).await?;

        if !job.state.is_suspended() {
            return Err(CurriculaError::Resume(format!(
                "job {job_id} is not suspended (state {})",
                job.state
            )));
        }
        if job.resume_token.as_ref().map(|t| t.as_str()) != Some(token) {
            return Err(CurriculaError::Resume(format!(
                "resume token does not match job {job_id}"
            )));
        }

        match (job.state, event) {
            (JobState::WaitUser, ResumeEvent::Jurisdiction(choice)) => {
                job.payload.answer = Some(choice);
                job.clear_suspension();
                transition(&mut job, Condition::UserAnswered)?;
                inner.advance(job).await
            }
            (JobState::WaitUser | JobState::HumanAlert, ResumeEvent::Terminate) => {
                job.clear_suspension();
                transition(&mut job, Condition::Terminated)?;
                job.record_error(&CurriculaError::Resume("terminated by caller".into()));
                inner.persist(&job).await?;
                inner.storage.resolve_alert(&job_id.to_string()).await?;
                inner.registry.release(&job).await;
                Ok(SubmitOutcome::Failed {
                    job_id,
                    error: "terminated by caller".into(),
                })
            }
            (JobState::HumanAlert, ResumeEvent::Approve) => {
                if job.resume_state.is_none() {
                    return Err(CurriculaError::Resume(format!(
                        "approval cannot clear this alert on job {job_id}; provide a source or terminate"
                    )));
                }
                transition(&mut job, Condition::HumanApproved)?;
                job.clear_suspension();
                if job.claimed {
                    inner.registry.adopt(&job).await;
                }
                inner.persist(&job).await?;
                inner.storage.resolve_alert(&job_id.to_string()).await?;
                inner.spawn(job).await;
                Ok(SubmitOutcome::Resumed { job_id })
            }
            (JobState::HumanAlert, ResumeEvent::ProvideSource(url)) => {
                let candidate = manual_candidate(&url)?;
                if job.claimed {
                    inner.registry.adopt(&job).await;
                } else if let Claim::Joined(holder) = inner.registry.claim(&mut job).await? {
                    return Err(CurriculaError::Resume(format!(
                        "job {holder} is already rebuilding this curriculum"
                    )));
                }
                job.payload.manual_source = Some(url);
                job.payload.outputs.push(AgentOutput::Search(SearchOutput {
                    job_id,
                    queries: Vec::new(),
                    candidate_urls: vec![candidate],
                    status: SearchStatus::Success,
                    meta: StageMeta {
                        tier: FallbackTier::Deterministic,
                        confidence: 1.0,
                        model_id: MANUAL_SOURCE.into(),
                    },
                }));
                transition(&mut job, Condition::SourceProvided)?;
                job.clear_suspension();
                inner.persist(&job).await?;
                inner.storage.resolve_alert(&job_id.to_string()).await?;
                inner.spawn(job).await;
                Ok(SubmitOutcome::Resumed { job_id })
            }
            (state, event) => Err(CurriculaError::Resume(format!(
                "{} does not apply to a job in {state}",
                event.name()
            ))),
        }
    }

    /// Start a cold start for the key a finished job was served from.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn refresh(&self, job_id: JobId) -> Result<SubmitOutcome> {
        let inner = &self.inner;
        let served = inner.load(job_id).await?;
        if !served.state.is_terminal() {
            return Err(CurriculaError::Resume(format!(
                "job {job_id} is still running (state {})",
                served.state
            )));
        }
        let (Some(normalized), Some(resolution), Some(key)) = (
            served.payload.normalized.clone(),
            served.payload.resolution.clone(),
            served.key.clone(),
        ) else {
            return Err(CurriculaError::Resume(format!(
                "job {job_id} never resolved a curriculum to refresh"
            )));
        };

        let found = vault::lookup(&inner.storage, &normalized, &resolution).await?;
        let mut job = Job::new(served.payload.request.clone());
        job.payload.normalized = Some(normalized);
        job.payload.resolution = Some(resolution);
        job.payload.exact_version = found.exact_version;
        job.key = Some(key);
        job.state = JobState::EnqueueColdStart;
        info!(refresh_of = %job_id, new_job = %job.id, "refresh requested");
        inner.enqueue(job).await
    }

    /// Re-drive jobs a previous process left mid-stage. Each counts as one
    /// missed heartbeat; a second miss fails the job.
    #[instrument(skip_all)]
    pub async fn recover_in_flight(&self) -> Result<Vec<JobId>> {
        let inner = &self.inner;
        let states: Vec<&str> = JobState::ALL
            .iter()
            .filter(|s| s.is_stage() || **s == JobState::EnqueueColdStart)
            .map(|s| s.as_str())
            .collect();
        let rows = inner.storage.list_jobs_in_states(&states).await?;

        let mut resumed = Vec::new();
        for row in rows {
            let mut job = Job::from_row(&row)?;
            if inner.handles.lock().await.contains_key(&job.id) {
                continue;
            }
            inner.registry.adopt(&job).await;

            if job.state == JobState::EnqueueColdStart {
                transition(&mut job, Condition::Enqueued)?;
            } else if job.bump_heartbeat() >= 2 {
                job.record_error(&CurriculaError::stage(
                    job.state.as_str(),
                    "worker lost twice during this stage",
                ));
                transition(&mut job, Condition::RetriesExhausted)?;
                inner.persist(&job).await?;
                inner.registry.release(&job).await;
                warn!(job_id = %job.id, "recovered job failed after a second lost worker");
                continue;
            } else {
                transition(&mut job, Condition::HeartbeatRetry)?;
            }

            inner.persist(&job).await?;
            info!(job_id = %job.id, state = %job.state, "recovering job");
            resumed.push(job.id);
            inner.spawn(job).await;
        }
        Ok(resumed)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(JobStatus::from(&self.inner.load(job_id).await?))
    }

    /// Wait for a job's background task, then report its status.
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatus> {
        let handle = self.inner.handles.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| CurriculaError::Unclassified(format!("job task failed: {e}")))?;
        }
        self.status(job_id).await
    }

    /// Wait for every background job and shadow run.
    pub async fn drain(&self) {
        let handles: Vec<(JobId, JoinHandle<()>)> =
            self.inner.handles.lock().await.drain().collect();
        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "job task failed");
            }
        }
        self.inner.runner.drain_shadows().await;
    }

    pub async fn alerts(&self) -> Result<Vec<HumanAlert>> {
        self.inner.storage.open_alerts().await
    }

    pub fn kill_switches(&self) -> Arc<KillSwitches> {
        self.inner.kill_switches.clone()
    }
}

// ---------------------------------------------------------------------------
// Request path and job driver
// ---------------------------------------------------------------------------

impl Inner {
    async fn load(&self, job_id: JobId) -> Result<Job> {
        let row = self
            .storage
            .load_job(&job_id.to_string())
            .await?
            .ok_or_else(|| CurriculaError::Resume(format!("unknown job {job_id}")))?;
        Job::from_row(&row)
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        self.storage.save_job(&job.to_row()?).await
    }

    /// Run the inline part of a request: jurisdiction, vault, claim.
    async fn advance(self: &Arc<Self>, mut job: Job) -> Result<SubmitOutcome> {
        loop {
            let step = match job.state {
                JobState::ResolveJurisdiction => self.resolve_jurisdiction(&mut job).await,
                JobState::VaultLookup => self.lookup(&mut job).await,
                JobState::WaitUser => {
                    self.persist(&job).await?;
                    let (Some(question), Some(token)) = (job.question.clone(), job.resume_token.as_ref())
                    else {
                        return Err(CurriculaError::Unclassified(format!(
                            "job {} is waiting without a question",
                            job.id
                        )));
                    };
                    return Ok(SubmitOutcome::NeedsInput {
                        job_id: job.id,
                        question,
                        resume_token: token.as_str().to_string(),
                    });
                }
                JobState::EnqueueColdStart => return self.enqueue(job).await,
                JobState::Generate => {
                    let job = self.drive(job).await;
                    return Ok(outcome_of(&job));
                }
                JobState::Failed => {
                    self.persist(&job).await?;
                    return Ok(outcome_of(&job));
                }
                other => {
                    return Err(CurriculaError::Unclassified(format!(
                        "{other} is not reachable on the request path"
                    )));
                }
            };
            if let Err(e) = step {
                self.fail(&mut job, e);
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn resolve_jurisdiction(&self, job: &mut Job) -> Result<()> {
        let normalized = job
            .payload
            .normalized
            .clone()
            .ok_or_else(|| CurriculaError::Unclassified("resolving an unnormalized job".into()))?;
        let profile = self.config.country(&normalized.country_code);
        let cached = self
            .storage
            .count_jurisdictions(&normalized.country_code, &normalized.grade, &normalized.subject)
            .await?;
        let signals = AmbiguitySignals::gather(profile, &normalized, cached);

        // A user's answer supersedes the jurisdiction stated in the request.
        let answer = job.payload.answer.take();
        let explicit = match answer {
            Some(_) => None,
            None => job.payload.request.jurisdiction.clone(),
        };

        match self.resolver.resolve(
            &normalized.country,
            &signals,
            explicit.as_ref(),
            answer.as_ref(),
        )? {
            ResolveOutcome::Resolved(resolution) if self.resolver.is_confident(&resolution) => {
                job.key = Some(JobKey::new(&normalized, &resolution));
                job.payload.resolution = Some(resolution);
                transition(job, Condition::Resolved)
            }
            ResolveOutcome::Resolved(resolution) => {
                info!(confidence = resolution.confidence, "resolution not confident, asking");
                job.ask(Question::scope(&normalized.country));
                transition(job, Condition::NeedsUser)
            }
            ResolveOutcome::Ask(question) => {
                info!(score = signals.score(), "jurisdiction needs the caller");
                job.ask(question);
                transition(job, Condition::NeedsUser)
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn lookup(&self, job: &mut Job) -> Result<()> {
        let (Some(normalized), Some(resolution)) = (&job.payload.normalized, &job.payload.resolution)
        else {
            return Err(CurriculaError::Unclassified("vault lookup before resolution".into()));
        };
        let found = vault::lookup(&self.storage, normalized, resolution).await?;
        let decision = vault::decide(&found, self.config.thresholds.vault_serve, Utc::now());

        job.payload.lookup = Some(found.result.clone());
        job.payload.exact_version = found.exact_version;
        job.payload.record_id = found.record.as_ref().map(|r| r.id.clone());

        match decision {
            VaultDecision::Serve => transition(job, Condition::Serve),
            VaultDecision::ServeStale { reason } => {
                info!(reason = %reason, "serving stale artifact");
                job.payload.stale_warning = Some(reason);
                transition(job, Condition::ServeStale)
            }
            VaultDecision::ColdStart => {
                job.payload.record_id = None;
                transition(job, Condition::NotFound)
            }
        }
    }

    /// Claim the key and start the cold start, or join the holder.
    async fn enqueue(self: &Arc<Self>, mut job: Job) -> Result<SubmitOutcome> {
        match self.registry.claim(&mut job).await? {
            Claim::Owner => {
                transition(&mut job, Condition::Enqueued)?;
                self.persist(&job).await?;
                let job_id = job.id;
                self.spawn(job).await;
                Ok(SubmitOutcome::Enqueued { job_id })
            }
            Claim::Joined(holder) => {
                transition(&mut job, Condition::Joined)?;
                info!(holder = %holder, "joined in-flight cold start");
                Ok(SubmitOutcome::Joined { job_id: holder })
            }
        }
    }

    async fn spawn(self: &Arc<Self>, job: Job) {
        let job_id = job.id;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.drive(job).await;
        });
        let mut handles = self.handles.lock().await;
        handles.retain(|_, h| !h.is_finished());
        handles.insert(job_id, handle);
    }

    /// Step a job until it finishes or suspends, persisting every transition.
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn drive(&self, mut job: Job) -> Job {
        while !job.state.is_terminal() && !job.state.is_suspended() {
            self.progress.phase(job.id, job.state);
            if let Err(e) = self.step(&mut job).await {
                self.fail(&mut job, e);
            }
            if let Err(e) = self.persist(&job).await {
                error!(state = %job.state, error = %e, "could not persist job, stopping");
                break;
            }
        }

        if job.state.is_terminal() {
            self.registry.release(&job).await;
        }
        info!(state = %job.state, "job stopped");
        self.progress.done(job.id, job.state);
        job
    }

    async fn step(&self, job: &mut Job) -> Result<()> {
        if let Some(switch) = KillSwitches::guarding(job.state) {
            if self.kill_switches.is_active(switch) {
                warn!(state = %job.state, ?switch, "kill switch active, pausing job");
                self.raise(job, AlertKind::KillSwitch, &format!("{switch:?} is disabled"))
                    .await?;
                return transition(job, Condition::KillSwitch);
            }
        }

        match job.state {
            JobState::VaultStore => self.store_replica(job).await,
            state => match StageTask::for_state(state) {
                Some(task) => self.run_stage(job, task).await,
                None => Err(CurriculaError::Unclassified(format!(
                    "no dispatch for state {state}"
                ))),
            },
        }
    }

    async fn run_stage(&self, job: &mut Job, task: StageTask) -> Result<()> {
        let competencies = if task == StageTask::Generate {
            let record_id = job.payload.record_id.as_deref().ok_or_else(|| {
                CurriculaError::Unclassified("generation without a vault record".into())
            })?;
            self.storage.competencies_for(record_id).await?
        } else {
            Vec::new()
        };

        let run = self
            .runner
            .run(task, StageInput { job: &*job, competencies: &competencies })
            .await;
        job.tier_history.extend(run.tiers);

        match run.outcome {
            StageOutcome::Completed(product) => self.on_product(job, product).await,
            StageOutcome::HeartbeatMissed => {
                if job.bump_heartbeat() >= 2 {
                    job.record_error(&CurriculaError::stage(
                        task.stage().as_str(),
                        "heartbeat missed twice",
                    ));
                    transition(job, Condition::RetriesExhausted)
                } else {
                    transition(job, Condition::HeartbeatRetry)
                }
            }
            StageOutcome::BelowThreshold { product, threshold } => {
                let detail = format!(
                    "{} answered at confidence {:.2}, below {threshold:.2}, and no higher tier answered",
                    task.stage(),
                    product.confidence()
                );
                match product {
                    StageProduct::Agent(output) => job.payload.outputs.push(output),
                    StageProduct::Generation(output) => job.payload.generation = Some(output),
                }
                self.raise(job, AlertKind::LowConfidence, &detail).await?;
                transition(job, Condition::ConfidenceInsufficient)
            }
            StageOutcome::Exhausted(e) => {
                warn!(stage = %task.stage(), error = %e, "stage retries exhausted");
                job.record_error(&e);
                transition(job, Condition::RetriesExhausted)
            }
            StageOutcome::Fatal(e) => Err(e),
        }
    }

    async fn on_product(&self, job: &mut Job, product: StageProduct) -> Result<()> {
        match product {
            StageProduct::Agent(AgentOutput::Search(output)) => {
                let found = output.status == SearchStatus::Success;
                job.payload.outputs.push(AgentOutput::Search(output));
                if found {
                    transition(job, Condition::CandidatesFound)
                } else if job.bump_retry() <= 1 {
                    info!("search found nothing, retrying once");
                    transition(job, Condition::SearchFailedRetry)
                } else {
                    self.raise(job, AlertKind::SearchExhausted, "").await?;
                    transition(job, Condition::SearchRetriesExhausted)
                }
            }
            StageProduct::Agent(AgentOutput::Validation(output)) => {
                let status = output.status;
                let rejected = output.rejected_sources.len();
                job.payload.outputs.push(AgentOutput::Validation(output));
                match status {
                    ValidationStatus::Approved => transition(job, Condition::Approved),
                    ValidationStatus::Conflicted => {
                        self.raise(job, AlertKind::ValidationConflict, "").await?;
                        transition(job, Condition::Conflicted)
                    }
                    ValidationStatus::Failed => {
                        let detail = format!("{rejected} candidates rejected");
                        self.raise(job, AlertKind::ValidationFailed, &detail).await?;
                        transition(job, Condition::ValidationFailed)
                    }
                }
            }
            StageProduct::Agent(AgentOutput::Parsing(output)) => {
                let detail = format!(
                    "{} competencies, average confidence {:.2}",
                    output.competencies.len(),
                    output.average_confidence
                );
                let kind = match (output.storable, output.status) {
                    (true, ParsingStatus::Success) => None,
                    (true, ParsingStatus::LowConfidence) => Some(AlertKind::LowConfidence),
                    _ => Some(AlertKind::NotStorable),
                };
                job.payload.outputs.push(AgentOutput::Parsing(output));
                match kind {
                    None => transition(job, Condition::ConfidenceSufficient),
                    Some(kind) => {
                        self.raise(job, kind, &detail).await?;
                        transition(job, Condition::ConfidenceInsufficient)
                    }
                }
            }
            StageProduct::Agent(AgentOutput::Embedding(output)) => {
                job.payload.outputs.push(AgentOutput::Embedding(output));
                transition(job, Condition::Embedded)
            }
            StageProduct::Generation(output) => {
                let approved = output.status == GenerationStatus::Approved;
                let detail = output.rejection_reasons.join("; ");
                job.payload.generation = Some(output);
                if approved {
                    transition(job, Condition::GenerationApproved)
                } else {
                    self.raise(job, AlertKind::GenerationRejected, &detail).await?;
                    transition(job, Condition::GenerationRejected)
                }
            }
        }
    }

    /// Verify the parsed replica and write it all-or-nothing.
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn store_replica(&self, job: &mut Job) -> Result<()> {
        let parsing = job
            .payload
            .latest_parsing()
            .cloned()
            .ok_or_else(|| CurriculaError::Unclassified("replica store without a parse".into()))?;
        let (Some(normalized), Some(resolution)) =
            (job.payload.normalized.clone(), job.payload.resolution.clone())
        else {
            return Err(CurriculaError::Unclassified("replica store before resolution".into()));
        };
        let reported_deprecated = job
            .payload
            .latest_validation()
            .map(|v| v.deprecated_topics.clone())
            .unwrap_or_default();

        let report = self.verifier.verify(
            &parsing.competencies,
            &parsing.chunks,
            &normalized.grade,
            &reported_deprecated,
        );
        if !report.approved || !parsing.storable {
            let mut reasons = report.rejection_reasons();
            if !parsing.storable {
                reasons.push("parse came from mechanical extraction".into());
            }
            self.raise(job, AlertKind::GroundingRejected, &reasons.join("; "))
                .await?;
            return transition(job, Condition::GroundingRejected);
        }

        let now = Utc::now();
        let record = CurriculumRecord {
            id: Uuid::now_v7().to_string(),
            country: normalized.country.clone(),
            country_code: normalized.country_code.clone(),
            jurisdiction_level: resolution.level,
            jurisdiction_name: resolution.name.clone(),
            parent_jurisdiction_id: resolution.parent_id.clone(),
            jurisdiction_key: resolution.key(),
            grade: normalized.grade.clone(),
            subject: normalized.subject.clone(),
            status: CurriculumStatus::Active,
            confidence_score: parsing.average_confidence,
            last_verified: now,
            ttl_expiry: now + ChronoDuration::days(self.config.defaults.artifact_ttl_days),
            source_url: parsing.snapshot.source_url.clone(),
            checksum: competency_checksum(&parsing.competencies)?,
            version: job.payload.exact_version.map_or(1, |v| v + 1),
        };

        let stored = self
            .storage
            .store_replica(&record, &parsing.competencies, job.payload.exact_version)
            .await?;
        info!(
            record_id = %stored.id,
            version = stored.version,
            competencies = parsing.competencies.len(),
            "replica stored"
        );
        job.payload.record_id = Some(stored.id);
        job.payload.exact_version = Some(stored.version);
        transition(job, Condition::Stored)
    }

    async fn raise(&self, job: &mut Job, kind: AlertKind, detail: &str) -> Result<()> {
        let raised_in = job.state;
        let alert = job.raise(kind, detail, raised_in).alert.clone();
        self.storage.upsert_alert(&alert).await?;
        if let Err(e) = self.alerts.notify(&alert).await {
            warn!(job_id = %job.id, error = %e, "alert sink failed");
        }
        Ok(())
    }

    /// End the job on an error, logging the full job.
    fn fail(&self, job: &mut Job, e: CurriculaError) {
        job.record_error(&e);
        let snapshot = serde_json::to_string(job).unwrap_or_else(|_| "<unserializable>".into());
        error!(
            job_id = %job.id,
            state = %job.state,
            class = %e.class(),
            error = %e,
            job = %snapshot,
            "job failed"
        );
        job.state = state::next(job.state, Condition::Fatal, None).unwrap_or(JobState::Failed);
        job.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transition(job: &mut Job, condition: Condition) -> Result<()> {
    let to = state::next(job.state, condition, job.resume_state)?;
    info!(
        job_id = %job.id,
        from = %job.state,
        to = %to,
        condition = condition.as_str(),
        "transition"
    );
    job.state = to;
    job.updated_at = Utc::now();
    Ok(())
}

fn outcome_of(job: &Job) -> SubmitOutcome {
    match (job.state, &job.payload.generation, &job.alert) {
        (JobState::End, Some(output), _) => SubmitOutcome::Served {
            job_id: job.id,
            output: output.clone(),
            stale_warning: job.payload.stale_warning.clone(),
        },
        (JobState::HumanAlert, _, Some(raised)) => SubmitOutcome::Alert {
            job_id: job.id,
            alert: raised.alert.clone(),
        },
        (state, _, _) => SubmitOutcome::Failed {
            job_id: job.id,
            error: job
                .last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("job stopped in {state}")),
        },
    }
}

/// SHA-256 over the canonical JSON of the competency set.
fn competency_checksum(competencies: &[Competency]) -> Result<String> {
    let body = serde_json::to_vec(competencies)
        .map_err(|e| CurriculaError::Storage(format!("serialize competencies: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    Ok(format!("{:x}", hasher.finalize()))
}

fn manual_candidate(url: &str) -> Result<CandidateUrl> {
    let parsed = url::Url::parse(url)
        .map_err(|e| CurriculaError::validation(format!("invalid source url '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CurriculaError::validation(format!(
            "source url must be http or https: {url}"
        )));
    }
    let domain = parsed
        .host_str()
        .map(str::to_lowercase)
        .ok_or_else(|| CurriculaError::validation(format!("source url has no host: {url}")))?;
    Ok(CandidateUrl {
        url: url.to_string(),
        domain,
        rank: 1,
        authority_hint: AuthorityHint::Official,
    })
}

//! Cold-start stage tasks and the tier attempt loop.
//!
//! Every stage runs through the same loop:
//! 1. Ask the router for a tier ([`ModelRouter::decide`])
//! 2. Dispatch the stage at that tier under the heartbeat deadline
//! 3. Decode the payload strictly against the stage's schema
//! 4. On a transient failure or a low-confidence primary result, go again
//!
//! Schema violations are fatal and end the loop at once. Parsing and
//! generation results from the primary tier may be shadowed by the
//! escalation model in the background.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use curricula_grounding::{
    GenerationGate, ShadowBreaker, ShadowView, check_schema, compare, extract_items,
    normalize_items, terms,
};
use curricula_router::{AttemptState, ModelRouter, TierDecision};
use curricula_shared::{
    AgentOutput, AppConfig, ApprovedSource, AuthorityHint, CandidateUrl, Competency,
    CountryProfile, CurriculaError, CurriculumSnapshot, DocumentExtractor, EmbeddingOutput,
    EmbeddingStatus, FallbackTier, GenerationKind, GenerationOutput, GenerationParagraph,
    GenerationStatus, GenerativeModel, LicenseKind, MAX_SEARCH_QUERIES, ModelRequest,
    NormalizedRequest, ParsingOutput, ParsingStatus, Result, SearchCapability, SearchHit,
    SearchOutput, SearchStatus, StageKind, StageMeta, ValidationOutput, ValidationStatus,
};
use curricula_storage::{ShadowRunRow, Storage};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::job::{Job, TierRecord};
use crate::orchestrator::Collaborators;
use crate::state::JobState;

/// Dispatches per stage before the loop gives up.
const MAX_DISPATCHES: u32 = 3;

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])((?:19|20)[0-9]{2})(?:[^0-9]|$)").expect("valid regex"));

// ---------------------------------------------------------------------------
// Stage registry
// ---------------------------------------------------------------------------

/// The five dispatchable stage tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTask {
    Scout,
    Gatekeeper,
    Architect,
    Embedder,
    Generate,
}

impl StageTask {
    pub fn for_state(state: JobState) -> Option<Self> {
        match state {
            JobState::ScoutAgent => Some(Self::Scout),
            JobState::GatekeeperAgent => Some(Self::Gatekeeper),
            JobState::ArchitectAgent => Some(Self::Architect),
            JobState::Embedder => Some(Self::Embedder),
            JobState::Generate => Some(Self::Generate),
            _ => None,
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            Self::Scout => StageKind::Search,
            Self::Gatekeeper => StageKind::Validation,
            Self::Architect => StageKind::Parsing,
            Self::Embedder => StageKind::Embedding,
            Self::Generate => StageKind::Generation,
        }
    }

    pub fn output_schema(&self) -> &'static str {
        self.stage().schema_name()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StageProduct {
    Agent(AgentOutput),
    Generation(GenerationOutput),
}

impl StageProduct {
    pub fn meta(&self) -> &StageMeta {
        match self {
            Self::Agent(output) => output.meta(),
            Self::Generation(output) => &output.meta,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.meta().confidence
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    Completed(StageProduct),
    /// The dispatch did not answer within the heartbeat deadline.
    HeartbeatMissed,
    /// The primary answered below the ladder threshold and no higher tier
    /// answered at all. The product is kept for human review only.
    BelowThreshold { product: StageProduct, threshold: f64 },
    /// Every allowed dispatch failed; carries the last error.
    Exhausted(CurriculaError),
    Fatal(CurriculaError),
}

#[derive(Debug)]
pub struct StageRun {
    pub outcome: StageOutcome,
    /// One record per dispatch, in order.
    pub tiers: Vec<TierRecord>,
}

/// One successful dispatch, plus the model request behind it when a model ran.
struct Dispatched {
    product: StageProduct,
    request: Option<ModelRequest>,
}

// ---------------------------------------------------------------------------
// Model payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidationPayload {
    approved_sources: Vec<ApprovedSource>,
    rejected_sources: Vec<String>,
    status: ValidationStatus,
    #[serde(default)]
    deprecated_topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParsingPayload {
    competencies: Vec<Competency>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingPayload {
    embedded_chunks: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerationPayload {
    paragraphs: Vec<GenerationParagraph>,
}

fn decode<T: DeserializeOwned>(stage: StageKind, payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| CurriculaError::schema(stage.as_str(), format!("payload rejected: {e}")))
}

fn check_confidence(stage: StageKind, confidence: f64) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(CurriculaError::schema(
            stage.as_str(),
            format!("confidence {confidence} outside [0, 1]"),
        ))
    }
}

/// Inputs a stage task reads. Generation also needs the stored competencies.
pub struct StageInput<'a> {
    pub job: &'a Job,
    pub competencies: &'a [Competency],
}

impl StageInput<'_> {
    fn normalized(&self) -> Result<&NormalizedRequest> {
        self.job.payload.normalized.as_ref().ok_or_else(|| {
            CurriculaError::Unclassified(format!("job {} reached a stage unnormalized", self.job.id))
        })
    }
}

// ---------------------------------------------------------------------------
// StageRunner
// ---------------------------------------------------------------------------

enum ShadowSpec {
    Parsing,
    Generation {
        kind: GenerationKind,
        requested: Vec<String>,
    },
}

pub struct StageRunner {
    config: Arc<AppConfig>,
    router: Arc<ModelRouter>,
    storage: Arc<Storage>,
    search: Option<Arc<dyn SearchCapability>>,
    extractor: Arc<dyn DocumentExtractor>,
    model: Arc<dyn GenerativeModel>,
    gate: GenerationGate,
    heartbeat: Duration,
    breaker: Arc<Mutex<ShadowBreaker>>,
    shadows: Mutex<Vec<JoinHandle<()>>>,
}

impl StageRunner {
    pub fn new(
        config: Arc<AppConfig>,
        router: Arc<ModelRouter>,
        storage: Arc<Storage>,
        collaborators: &Collaborators,
    ) -> Self {
        let breaker = ShadowBreaker::new(
            config.shadow.failure_threshold,
            Duration::from_secs(config.shadow.recovery_secs),
        );
        Self {
            gate: GenerationGate::new(config.thresholds.coverage),
            heartbeat: Duration::from_secs(config.defaults.heartbeat_timeout_secs),
            search: collaborators.search.clone(),
            extractor: collaborators.extractor.clone(),
            model: collaborators.model.clone(),
            breaker: Arc::new(Mutex::new(breaker)),
            shadows: Mutex::new(Vec::new()),
            config,
            router,
            storage,
        }
    }

    /// Override the heartbeat deadline.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Run one stage to a result, walking down the ladder as needed.
    #[instrument(skip_all, fields(job_id = %input.job.id, stage = %task.stage()))]
    pub async fn run(&self, task: StageTask, input: StageInput<'_>) -> StageRun {
        let stage = task.stage();
        let started = Instant::now();
        let mut attempt = AttemptState::default();
        let mut tiers = Vec::new();
        let mut best: Option<StageProduct> = None;
        let mut last_error = None;
        let threshold = self
            .router
            .ladder(stage)
            .map(|l| l.confidence_threshold)
            .unwrap_or(0.0);

        for _ in 0..MAX_DISPATCHES {
            attempt.elapsed = started.elapsed();
            let decision = match self.router.decide(stage, &attempt).await {
                Ok(d) => d,
                Err(e) => {
                    return StageRun {
                        outcome: StageOutcome::Exhausted(e),
                        tiers,
                    };
                }
            };
            let mut record = TierRecord {
                stage,
                tier: decision.tier,
                model_id: decision.model_id.clone(),
                confidence: None,
                reason: decision.reason.clone(),
            };

            let dispatched =
                tokio::time::timeout(self.heartbeat, self.dispatch(task, &decision, &input)).await;
            let dispatched = match dispatched {
                Err(_) => {
                    warn!(tier = %decision.tier, "no heartbeat within deadline");
                    tiers.push(record);
                    return StageRun {
                        outcome: StageOutcome::HeartbeatMissed,
                        tiers,
                    };
                }
                Ok(Err(e)) if e.is_fatal() => {
                    tiers.push(record);
                    return StageRun {
                        outcome: StageOutcome::Fatal(e),
                        tiers,
                    };
                }
                Ok(Err(e)) => {
                    warn!(tier = %decision.tier, error = %e, "stage dispatch failed");
                    tiers.push(record);
                    attempt.failures += 1;
                    last_error = Some(e);
                    if decision.tier == FallbackTier::Deterministic {
                        break;
                    }
                    continue;
                }
                Ok(Ok(d)) => d,
            };

            let confidence = dispatched.product.confidence();
            record.confidence = Some(confidence);
            tiers.push(record);

            if decision.tier == FallbackTier::Primary && confidence < threshold {
                info!(confidence, threshold, "primary result below threshold, escalating");
                attempt.last_confidence = Some(confidence);
                best = Some(dispatched.product);
                continue;
            }

            if decision.tier == FallbackTier::Primary {
                if let Some(request) = dispatched.request {
                    self.maybe_shadow(task, &input, &dispatched.product, request);
                }
            }
            return StageRun {
                outcome: StageOutcome::Completed(dispatched.product),
                tiers,
            };
        }

        let outcome = match (best, last_error) {
            (Some(product), _) => {
                warn!(
                    confidence = product.confidence(),
                    threshold, "no tier above the primary answered"
                );
                StageOutcome::BelowThreshold { product, threshold }
            }
            (None, Some(e)) => StageOutcome::Exhausted(e),
            (None, None) => StageOutcome::Exhausted(CurriculaError::stage(
                stage.as_str(),
                "no dispatch produced a result",
            )),
        };
        StageRun { outcome, tiers }
    }

    /// Wait for every background shadow run to finish.
    pub async fn drain_shadows(&self) {
        let handles: Vec<JoinHandle<()>> = match self.shadows.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "shadow run panicked");
            }
        }
    }

    async fn dispatch(
        &self,
        task: StageTask,
        decision: &TierDecision,
        input: &StageInput<'_>,
    ) -> Result<Dispatched> {
        let dispatched = match task {
            StageTask::Scout => self.scout(decision, input).await?,
            StageTask::Gatekeeper => self.gatekeeper(decision, input).await?,
            StageTask::Architect => self.architect(decision, input).await?,
            StageTask::Embedder => self.embedder(decision, input).await?,
            StageTask::Generate => self.generate(decision, input).await?,
        };
        if let StageProduct::Agent(output) = &dispatched.product {
            output.validate(self.config.thresholds.parsing)?;
        }
        Ok(dispatched)
    }

    fn model_request(&self, decision: &TierDecision, input: serde_json::Value) -> ModelRequest {
        ModelRequest {
            stage: decision.stage,
            model_id: decision.model_id.clone(),
            schema: decision.stage.schema_name().to_string(),
            input,
        }
    }

    /// Invoke the model and check the response envelope.
    async fn invoke(&self, request: &ModelRequest) -> Result<curricula_shared::ModelResponse> {
        let response = self.model.invoke(request.clone()).await?;
        check_confidence(request.stage, response.confidence)?;
        if let Some(cost) = response.cost_usd {
            debug!(model = %response.model_id, cost_usd = cost, "model reported spend");
        }
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    async fn scout(&self, decision: &TierDecision, input: &StageInput<'_>) -> Result<Dispatched> {
        let request = input.normalized()?;
        let profile = self.config.country(&request.country_code);
        let place = input
            .job
            .payload
            .resolution
            .as_ref()
            .and_then(|r| r.name.as_deref());
        let queries = build_queries(request, place, profile);

        let (candidate_urls, model_id) = match decision.tier {
            FallbackTier::Deterministic => (official_candidates(profile), decision.model_id.clone()),
            _ => {
                let search = self
                    .search
                    .as_ref()
                    .ok_or_else(|| CurriculaError::config("no search capability configured"))?;
                let hits = search.search(&request.country_code, &queries).await?;
                (rank_hits(hits, profile), search.name().to_string())
            }
        };

        let (status, confidence) = if candidate_urls.is_empty() {
            (SearchStatus::Failed, 0.0)
        } else if candidate_urls
            .iter()
            .any(|c| c.authority_hint == AuthorityHint::Official)
        {
            (SearchStatus::Success, 1.0)
        } else {
            (SearchStatus::Success, 0.8)
        };
        info!(candidates = candidate_urls.len(), "search finished");

        Ok(Dispatched {
            product: StageProduct::Agent(AgentOutput::Search(SearchOutput {
                job_id: input.job.id,
                queries,
                candidate_urls,
                status,
                meta: StageMeta {
                    tier: decision.tier,
                    confidence,
                    model_id,
                },
            })),
            request: None,
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    async fn gatekeeper(
        &self,
        decision: &TierDecision,
        input: &StageInput<'_>,
    ) -> Result<Dispatched> {
        let stage = StageKind::Validation;
        let search = input.job.payload.latest_search().ok_or_else(|| {
            CurriculaError::Unclassified("source validation without a search output".into())
        })?;
        let request = input.normalized()?;

        if decision.tier == FallbackTier::Deterministic {
            let output = rule_gatekeeper(input.job, search, decision);
            return Ok(Dispatched {
                product: StageProduct::Agent(AgentOutput::Validation(output)),
                request: None,
            });
        }

        let model_request = self.model_request(
            decision,
            json!({
                "country": request.country,
                "grade": request.grade,
                "subject": request.subject,
                "candidates": search.candidate_urls,
            }),
        );
        let response = self.invoke(&model_request).await?;
        let payload: ValidationPayload = decode(stage, response.payload)?;
        for source in &payload.approved_sources {
            if !search.candidate_urls.iter().any(|c| c.url == source.url) {
                return Err(CurriculaError::schema(
                    stage.as_str(),
                    format!("approved source {} was never a candidate", source.url),
                ));
            }
        }

        Ok(Dispatched {
            product: StageProduct::Agent(AgentOutput::Validation(ValidationOutput {
                job_id: input.job.id,
                approved_sources: payload.approved_sources,
                rejected_sources: payload.rejected_sources,
                status: payload.status,
                deprecated_topics: payload.deprecated_topics,
                meta: StageMeta {
                    tier: decision.tier,
                    confidence: response.confidence,
                    model_id: response.model_id,
                },
            })),
            request: Some(model_request),
        })
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    async fn architect(
        &self,
        decision: &TierDecision,
        input: &StageInput<'_>,
    ) -> Result<Dispatched> {
        let stage = StageKind::Parsing;
        let request = input.normalized()?;
        let validation = input.job.payload.latest_validation().ok_or_else(|| {
            CurriculaError::Unclassified("parsing without a validation output".into())
        })?;
        let source = validation
            .approved_sources
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or_else(|| CurriculaError::Data("no approved source to parse".into()))?;

        let document = self.extractor.extract(&source.url).await?;
        if document.chunks.is_empty() {
            return Err(CurriculaError::Data(format!(
                "{} yielded no text",
                document.url
            )));
        }

        let max_abstraction = self.config.thresholds.max_abstraction_level;
        let (competencies, confidence, model_id, model_request) = match decision.tier {
            FallbackTier::Deterministic => {
                let items = extract_items(&document.chunks);
                let competencies = normalize_items(&items, Some(&request.grade));
                let confidence = ParsingOutput::mean_confidence(&competencies);
                (competencies, confidence, decision.model_id.clone(), None)
            }
            _ => {
                let model_request = self.model_request(
                    decision,
                    json!({
                        "source_url": document.url,
                        "country": request.country,
                        "grade": request.grade,
                        "subject": request.subject,
                        "max_abstraction_level": max_abstraction,
                        "chunks": document.chunks,
                    }),
                );
                let response = self.invoke(&model_request).await?;
                let payload: ParsingPayload = decode(stage, response.payload)?;
                for competency in &payload.competencies {
                    check_schema(competency, max_abstraction)?;
                }
                (
                    payload.competencies,
                    response.confidence,
                    response.model_id,
                    Some(model_request),
                )
            }
        };

        let average_confidence = ParsingOutput::mean_confidence(&competencies);
        let status = if competencies.is_empty() {
            ParsingStatus::Failed
        } else if average_confidence < self.config.thresholds.parsing {
            ParsingStatus::LowConfidence
        } else {
            ParsingStatus::Success
        };
        info!(
            competencies = competencies.len(),
            average_confidence,
            extraction_only = decision.extraction_only,
            "parse finished"
        );

        Ok(Dispatched {
            product: StageProduct::Agent(AgentOutput::Parsing(ParsingOutput {
                job_id: input.job.id,
                snapshot: CurriculumSnapshot {
                    source_url: document.url,
                    checksum: document.checksum,
                    chunk_count: document.chunks.len(),
                },
                competencies,
                chunks: document.chunks,
                average_confidence,
                status,
                storable: decision.tier != FallbackTier::Deterministic
                    && !decision.extraction_only,
                meta: StageMeta {
                    tier: decision.tier,
                    confidence,
                    model_id,
                },
            })),
            request: model_request,
        })
    }

    // -----------------------------------------------------------------------
    // Embedding
    // -----------------------------------------------------------------------

    async fn embedder(
        &self,
        decision: &TierDecision,
        input: &StageInput<'_>,
    ) -> Result<Dispatched> {
        let stage = StageKind::Embedding;
        let parsing = input.job.payload.latest_parsing().ok_or_else(|| {
            CurriculaError::Unclassified("embedding without a parsing output".into())
        })?;
        let competencies = &parsing.competencies;

        let (embedded_chunks, confidence, model_id) = match decision.tier {
            FallbackTier::Deterministic => {
                let embedded = competencies
                    .iter()
                    .filter(|c| !terms(&format!("{} {}", c.title, c.description)).is_empty())
                    .count();
                let confidence = if competencies.is_empty() {
                    0.0
                } else {
                    embedded as f64 / competencies.len() as f64
                };
                (embedded, confidence, decision.model_id.clone())
            }
            _ => {
                let texts: Vec<serde_json::Value> = competencies
                    .iter()
                    .map(|c| json!({"id": c.id, "text": format!("{}. {}", c.title, c.description)}))
                    .collect();
                let model_request = self.model_request(decision, json!({ "texts": texts }));
                let response = self.invoke(&model_request).await?;
                let payload: EmbeddingPayload = decode(stage, response.payload)?;
                if payload.embedded_chunks > competencies.len() {
                    return Err(CurriculaError::schema(
                        stage.as_str(),
                        format!(
                            "{} embeddings for {} competencies",
                            payload.embedded_chunks,
                            competencies.len()
                        ),
                    ));
                }
                (payload.embedded_chunks, response.confidence, response.model_id)
            }
        };

        let status = if embedded_chunks == 0 {
            EmbeddingStatus::Failed
        } else {
            EmbeddingStatus::Success
        };
        if status == EmbeddingStatus::Failed {
            return Err(CurriculaError::stage(stage.as_str(), "nothing was embedded"));
        }

        Ok(Dispatched {
            product: StageProduct::Agent(AgentOutput::Embedding(EmbeddingOutput {
                job_id: input.job.id,
                embedded_chunks,
                embedding_model: model_id.clone(),
                status,
                meta: StageMeta {
                    tier: decision.tier,
                    confidence,
                    model_id,
                },
            })),
            request: None,
        })
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    async fn generate(
        &self,
        decision: &TierDecision,
        input: &StageInput<'_>,
    ) -> Result<Dispatched> {
        let stage = StageKind::Generation;
        let request = input.normalized()?;
        let kind = input.job.payload.request.generation;
        let requested: Vec<String> = input.competencies.iter().map(|c| c.id.clone()).collect();

        if decision.tier == FallbackTier::Deterministic || decision.extraction_only {
            return Ok(Dispatched {
                product: StageProduct::Generation(competency_listing(
                    kind,
                    input.competencies,
                    decision,
                )),
                request: None,
            });
        }

        let model_request = self.model_request(
            decision,
            json!({
                "kind": kind.as_str(),
                "country": request.country,
                "grade": request.grade,
                "subject": request.subject,
                "language": request.language,
                "competencies": input
                    .competencies
                    .iter()
                    .map(|c| json!({
                        "id": c.id,
                        "title": c.title,
                        "description": c.description,
                        "learning_outcomes": c.learning_outcomes,
                    }))
                    .collect::<Vec<_>>(),
            }),
        );
        let response = self.invoke(&model_request).await?;
        let payload: GenerationPayload = decode(stage, response.payload)?;
        let output = self.gate.evaluate(
            kind,
            payload.paragraphs,
            &requested,
            StageMeta {
                tier: decision.tier,
                confidence: response.confidence,
                model_id: response.model_id,
            },
        );
        info!(
            coverage = output.coverage,
            status = ?output.status,
            "generation gated"
        );

        Ok(Dispatched {
            product: StageProduct::Generation(output),
            request: Some(model_request),
        })
    }

    // -----------------------------------------------------------------------
    // Shadow runs
    // -----------------------------------------------------------------------

    /// Rerun a primary parsing or generation request on the escalation
    /// model in the background and record the drift.
    fn maybe_shadow(
        &self,
        task: StageTask,
        input: &StageInput<'_>,
        product: &StageProduct,
        request: ModelRequest,
    ) {
        if !self.config.shadow.enabled {
            return;
        }
        let (spec, primary_view) = match (task, product) {
            (StageTask::Architect, StageProduct::Agent(AgentOutput::Parsing(p))) => {
                (ShadowSpec::Parsing, ShadowView::from_competencies(&p.competencies))
            }
            (StageTask::Generate, StageProduct::Generation(g)) => (
                ShadowSpec::Generation {
                    kind: g.kind,
                    requested: input.competencies.iter().map(|c| c.id.clone()).collect(),
                },
                ShadowView::from_generation(g),
            ),
            _ => return,
        };
        let stage = task.stage();
        let Ok(ladder) = self.router.ladder(stage) else {
            return;
        };
        if ladder.escalation == request.model_id {
            return;
        }
        match self.breaker.lock() {
            Ok(mut breaker) => {
                if !breaker.allow() {
                    debug!(stage = %stage, "shadow breaker open, skipping");
                    return;
                }
            }
            Err(_) => return,
        }

        let job_id = input.job.id;
        let primary_model = request.model_id.clone();
        let shadow_model = ladder.escalation.clone();
        let shadow_cost = ladder.escalation_cost_usd;
        let ceiling = self.config.budget.ceiling(stage);
        let drift_threshold = self.config.shadow.drift_threshold;
        let mut shadow_request = request;
        shadow_request.model_id = shadow_model.clone();

        let model = self.model.clone();
        let router = self.router.clone();
        let storage = self.storage.clone();
        let breaker = self.breaker.clone();
        let gate = self.gate;

        let handle = tokio::spawn(async move {
            if router.spent(stage).await + shadow_cost > ceiling {
                debug!(stage = %stage, "shadow run skipped, over budget");
                return;
            }
            let result: Result<ShadowView> = async {
                let response = model.invoke(shadow_request).await?;
                check_confidence(stage, response.confidence)?;
                match spec {
                    ShadowSpec::Parsing => {
                        let payload: ParsingPayload = decode(stage, response.payload)?;
                        Ok(ShadowView::from_competencies(&payload.competencies))
                    }
                    ShadowSpec::Generation { kind, requested } => {
                        let payload: GenerationPayload = decode(stage, response.payload)?;
                        let output = gate.evaluate(
                            kind,
                            payload.paragraphs,
                            &requested,
                            StageMeta {
                                tier: FallbackTier::Escalation,
                                confidence: response.confidence,
                                model_id: response.model_id,
                            },
                        );
                        Ok(ShadowView::from_generation(&output))
                    }
                }
            }
            .await;

            let view = match result {
                Ok(view) => {
                    if let Ok(mut b) = breaker.lock() {
                        b.record_success();
                    }
                    view
                }
                Err(e) => {
                    if let Ok(mut b) = breaker.lock() {
                        b.record_failure();
                    }
                    warn!(job_id = %job_id, stage = %stage, error = %e, "shadow run failed");
                    return;
                }
            };

            let diff = compare(&primary_view, &view);
            let escalated = diff.drift > drift_threshold;
            info!(
                job_id = %job_id,
                stage = %stage,
                drift = diff.drift,
                topic_overlap = diff.topic_overlap,
                escalated,
                "shadow run compared"
            );
            if escalated {
                let reason = format!("shadow drift {:.2} above {drift_threshold:.2}", diff.drift);
                if let Err(e) = router
                    .escalate_floor(stage, FallbackTier::Escalation, &reason)
                    .await
                {
                    warn!(error = %e, "failed to raise stage floor");
                }
            }
            let row = ShadowRunRow {
                job_id: job_id.to_string(),
                stage: stage.as_str().to_string(),
                primary_model,
                shadow_model,
                topic_overlap: diff.topic_overlap,
                structural_similarity: diff.structural_similarity,
                drift: diff.drift,
                escalated,
            };
            if let Err(e) = storage.insert_shadow_run(&row).await {
                warn!(error = %e, "failed to record shadow run");
            }
        });

        if let Ok(mut shadows) = self.shadows.lock() {
            shadows.retain(|h| !h.is_finished());
            shadows.push(handle);
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic tiers and helpers
// ---------------------------------------------------------------------------

fn build_queries(
    request: &NormalizedRequest,
    place: Option<&str>,
    profile: Option<&CountryProfile>,
) -> Vec<String> {
    let grade = &request.grade;
    let subject = &request.subject;
    let place = place.unwrap_or(&request.country);

    let mut queries = vec![
        format!("{place} {grade} {subject} curriculum"),
        format!("{place} {grade} {subject} syllabus"),
        format!("{} national curriculum {subject} {grade} pdf", request.country),
    ];
    if let Some(domain) = profile.and_then(|p| p.official_domains.iter().find(|d| !d.starts_with('.'))) {
        queries.push(format!("site:{domain} {subject} {grade}"));
    }
    queries.push(format!("{} {subject} scheme of work {grade}", request.country));

    let mut seen = std::collections::HashSet::new();
    queries.retain(|q| seen.insert(q.to_lowercase()));
    queries.truncate(MAX_SEARCH_QUERIES);
    queries
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// Turn provider hits into ranked candidates, dropping unparseable URLs and
/// duplicates. Official domains from the country profile upgrade the hint.
fn rank_hits(hits: Vec<SearchHit>, profile: Option<&CountryProfile>) -> Vec<CandidateUrl> {
    let mut candidates: Vec<CandidateUrl> = Vec::new();
    for hit in hits {
        let Some(domain) = host_of(&hit.url) else {
            debug!(url = %hit.url, "dropping unparseable hit");
            continue;
        };
        if candidates.iter().any(|c| c.url == hit.url) {
            continue;
        }
        let official = hit.authority_hint == AuthorityHint::Official
            || profile.is_some_and(|p| p.is_official_host(&domain));
        candidates.push(CandidateUrl {
            url: hit.url,
            domain,
            rank: candidates.len() as u32 + 1,
            authority_hint: if official {
                AuthorityHint::Official
            } else {
                AuthorityHint::Unknown
            },
        });
    }
    candidates
}

/// Tier 2 search: the country's configured official domains.
fn official_candidates(profile: Option<&CountryProfile>) -> Vec<CandidateUrl> {
    profile
        .map(|p| {
            p.official_domains
                .iter()
                .filter(|d| !d.starts_with('.'))
                .enumerate()
                .map(|(i, d)| CandidateUrl {
                    url: format!("https://{d}/"),
                    domain: d.to_lowercase(),
                    rank: i as u32 + 1,
                    authority_hint: AuthorityHint::Official,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn year_in(url: &str) -> Option<i32> {
    YEAR_RE
        .captures(url)
        .and_then(|caps| caps[1].parse().ok())
}

/// Tier 2 validation: approve official candidates, reject everything else,
/// and flag disagreeing publication years as a conflict.
fn rule_gatekeeper(job: &Job, search: &SearchOutput, decision: &TierDecision) -> ValidationOutput {
    let mut approved = Vec::new();
    let mut rejected = Vec::new();
    for candidate in &search.candidate_urls {
        if candidate.authority_hint == AuthorityHint::Official {
            approved.push(ApprovedSource {
                url: candidate.url.clone(),
                authority: candidate.domain.clone(),
                license: LicenseKind::Permissive,
                published_year: year_in(&candidate.url),
                confidence: 0.95,
            });
        } else {
            rejected.push(candidate.url.clone());
        }
    }

    let mut years: Vec<i32> = approved.iter().filter_map(|s| s.published_year).collect();
    years.sort_unstable();
    years.dedup();
    let status = if approved.is_empty() {
        ValidationStatus::Failed
    } else if years.len() > 1 {
        ValidationStatus::Conflicted
    } else {
        ValidationStatus::Approved
    };
    let confidence = if approved.is_empty() { 0.0 } else { 0.95 };

    ValidationOutput {
        job_id: job.id,
        approved_sources: approved,
        rejected_sources: rejected,
        status,
        deprecated_topics: Vec::new(),
        meta: StageMeta {
            tier: decision.tier,
            confidence,
            model_id: decision.model_id.clone(),
        },
    }
}

/// Tier 2 generation: the stored competencies, verbatim. Never approved,
/// since prose needs a model tier.
fn competency_listing(
    kind: GenerationKind,
    competencies: &[Competency],
    decision: &TierDecision,
) -> GenerationOutput {
    let paragraphs: Vec<GenerationParagraph> = competencies
        .iter()
        .map(|c| GenerationParagraph {
            text: format!("{}: {}", c.title, c.description),
            citations: vec![c.id.clone()],
        })
        .collect();
    let citations = competencies.iter().map(|c| c.id.clone()).collect();
    GenerationOutput {
        kind,
        paragraphs,
        citations,
        coverage: if competencies.is_empty() { 0.0 } else { 1.0 },
        status: GenerationStatus::Rejected,
        rejection_reasons: vec![format!(
            "{} requires a model tier; returned the competency listing",
            kind.as_str()
        )],
        meta: StageMeta {
            tier: decision.tier,
            confidence: 0.0,
            model_id: decision.model_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        ScriptedModel, StaticDocuments, StaticSearch, collaborators, competency, document_chunks,
        keyed_job, test_storage,
    };
    use curricula_router::RouterConfig;

    async fn runner(config: AppConfig, collaborators: &Collaborators) -> StageRunner {
        let storage = Arc::new(test_storage().await);
        let config = Arc::new(config);
        let router = Arc::new(
            ModelRouter::start(RouterConfig::from(config.as_ref()), storage.clone())
                .await
                .unwrap(),
        );
        StageRunner::new(config, router, storage, collaborators)
    }

    fn decision(stage: StageKind, tier: FallbackTier) -> TierDecision {
        TierDecision {
            stage,
            tier,
            model_id: format!("{}-{}", stage.as_str(), tier.as_str()),
            reason: "test".into(),
            budget_downgraded: false,
            reserved_cost: 0.0,
            extraction_only: stage == StageKind::Parsing && tier == FallbackTier::Deterministic,
        }
    }

    fn candidate(url: &str, rank: u32, hint: AuthorityHint) -> CandidateUrl {
        CandidateUrl {
            url: url.into(),
            domain: host_of(url).unwrap_or_default(),
            rank,
            authority_hint: hint,
        }
    }

    fn with_search(job: &mut Job, candidates: Vec<CandidateUrl>) {
        job.payload.outputs.push(AgentOutput::Search(SearchOutput {
            job_id: job.id,
            queries: vec!["nigeria jss 1 biology curriculum".into()],
            candidate_urls: candidates,
            status: SearchStatus::Success,
            meta: StageMeta {
                tier: FallbackTier::Primary,
                confidence: 1.0,
                model_id: "web-search".into(),
            },
        }));
    }

    fn with_approved(job: &mut Job, url: &str) {
        job.payload.outputs.push(AgentOutput::Validation(ValidationOutput {
            job_id: job.id,
            approved_sources: vec![ApprovedSource {
                url: url.into(),
                authority: "nerdc.gov.ng".into(),
                license: LicenseKind::Permissive,
                published_year: Some(2019),
                confidence: 0.95,
            }],
            rejected_sources: vec![],
            status: ValidationStatus::Approved,
            deprecated_topics: vec![],
            meta: StageMeta {
                tier: FallbackTier::Primary,
                confidence: 0.9,
                model_id: "validator".into(),
            },
        }));
    }

    #[test]
    fn stage_tasks_map_to_states() {
        assert_eq!(StageTask::for_state(JobState::ScoutAgent), Some(StageTask::Scout));
        assert_eq!(StageTask::for_state(JobState::Generate), Some(StageTask::Generate));
        assert_eq!(StageTask::for_state(JobState::VaultStore), None);
        assert_eq!(StageTask::Architect.stage(), StageKind::Parsing);
        assert_eq!(
            StageTask::Gatekeeper.output_schema(),
            StageKind::Validation.schema_name()
        );
    }

    #[test]
    fn queries_are_capped_and_distinct() {
        let config = AppConfig::default();
        let job = keyed_job();
        let request = job.payload.normalized.as_ref().unwrap();
        let queries = build_queries(request, None, config.country("NG"));
        assert!(queries.len() <= MAX_SEARCH_QUERIES);
        assert!(queries[0].contains("biology"));
        let unique: std::collections::HashSet<_> = queries.iter().collect();
        assert_eq!(unique.len(), queries.len());
    }

    #[test]
    fn year_is_read_from_url() {
        assert_eq!(year_in("https://nerdc.gov.ng/2019/biology.pdf"), Some(2019));
        assert_eq!(year_in("https://nerdc.gov.ng/biology-2013-ed.pdf"), Some(2013));
        assert_eq!(year_in("https://nerdc.gov.ng/doc/120195"), None);
    }

    #[test]
    fn rule_gatekeeper_flags_disagreeing_years() {
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![
                candidate("https://nerdc.gov.ng/2013/biology.pdf", 1, AuthorityHint::Official),
                candidate("https://nerdc.gov.ng/2019/biology.pdf", 2, AuthorityHint::Official),
                candidate("https://blog.example.com/biology", 3, AuthorityHint::Unknown),
            ],
        );
        let search = job.payload.latest_search().unwrap();
        let out = rule_gatekeeper(&job, search, &decision(StageKind::Validation, FallbackTier::Deterministic));
        assert_eq!(out.status, ValidationStatus::Conflicted);
        assert_eq!(out.approved_sources.len(), 2);
        assert_eq!(out.rejected_sources, vec!["https://blog.example.com/biology"]);
    }

    #[test]
    fn rule_gatekeeper_fails_without_official_sources() {
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://blog.example.com/biology", 1, AuthorityHint::Unknown)],
        );
        let search = job.payload.latest_search().unwrap();
        let out = rule_gatekeeper(&job, search, &decision(StageKind::Validation, FallbackTier::Deterministic));
        assert_eq!(out.status, ValidationStatus::Failed);
        assert!(out.validate().is_ok());
    }

    #[tokio::test]
    async fn search_ranks_hits_and_marks_official_domains() {
        let search = StaticSearch::new(vec![
            SearchHit {
                url: "https://blog.example.com/jss1-biology".into(),
                title: None,
                authority_hint: AuthorityHint::Unknown,
            },
            SearchHit {
                url: "https://nerdc.gov.ng/biology.pdf".into(),
                title: Some("Biology curriculum".into()),
                authority_hint: AuthorityHint::Unknown,
            },
            SearchHit {
                url: "not a url".into(),
                title: None,
                authority_hint: AuthorityHint::Unknown,
            },
        ]);
        let collab = collaborators(Some(Arc::new(search)), ScriptedModel::new(), StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let job = keyed_job();

        let run = runner
            .run(StageTask::Scout, StageInput { job: &job, competencies: &[] })
            .await;
        let StageOutcome::Completed(StageProduct::Agent(AgentOutput::Search(out))) = run.outcome else {
            panic!("expected a search output, got {:?}", run.outcome);
        };
        assert_eq!(out.candidate_urls.len(), 2);
        assert_eq!(out.candidate_urls[1].rank, 2);
        assert_eq!(out.candidate_urls[1].authority_hint, AuthorityHint::Official);
        assert_eq!(out.meta.confidence, 1.0);
        assert_eq!(run.tiers.len(), 1);
    }

    #[tokio::test]
    async fn search_without_a_provider_falls_back_to_official_domains() {
        let collab = collaborators(None, ScriptedModel::new(), StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let job = keyed_job();

        let run = runner
            .run(StageTask::Scout, StageInput { job: &job, competencies: &[] })
            .await;
        let StageOutcome::Completed(StageProduct::Agent(AgentOutput::Search(out))) = run.outcome else {
            panic!("expected a search output, got {:?}", run.outcome);
        };
        assert_eq!(out.meta.tier, FallbackTier::Deterministic);
        assert!(
            out.candidate_urls
                .iter()
                .all(|c| c.authority_hint == AuthorityHint::Official)
        );
        assert_eq!(run.tiers.last().unwrap().tier, FallbackTier::Deterministic);
    }

    #[tokio::test]
    async fn unknown_payload_field_is_fatal() {
        let model = ScriptedModel::new();
        model.push(
            StageKind::Validation,
            0.9,
            json!({
                "approved_sources": [],
                "rejected_sources": [],
                "status": "failed",
                "notes": "extra"
            }),
        );
        let collab = collaborators(None, model, StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://nerdc.gov.ng/biology.pdf", 1, AuthorityHint::Official)],
        );

        let run = runner
            .run(StageTask::Gatekeeper, StageInput { job: &job, competencies: &[] })
            .await;
        assert!(matches!(
            run.outcome,
            StageOutcome::Fatal(CurriculaError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn approving_an_unlisted_url_is_fatal() {
        let model = ScriptedModel::new();
        model.push(
            StageKind::Validation,
            0.9,
            json!({
                "approved_sources": [{
                    "url": "https://elsewhere.example.org/doc.pdf",
                    "authority": "elsewhere",
                    "license": "permissive",
                    "confidence": 0.9
                }],
                "rejected_sources": [],
                "status": "approved"
            }),
        );
        let collab = collaborators(None, model, StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://nerdc.gov.ng/biology.pdf", 1, AuthorityHint::Official)],
        );

        let run = runner
            .run(StageTask::Gatekeeper, StageInput { job: &job, competencies: &[] })
            .await;
        assert!(matches!(run.outcome, StageOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn low_primary_confidence_escalates() {
        let approved = json!({
            "approved_sources": [{
                "url": "https://nerdc.gov.ng/biology.pdf",
                "authority": "NERDC",
                "license": "permissive",
                "published_year": 2019,
                "confidence": 0.9
            }],
            "rejected_sources": [],
            "status": "approved"
        });
        let model = ScriptedModel::new();
        model.push(StageKind::Validation, 0.5, approved.clone());
        model.push(StageKind::Validation, 0.92, approved);
        let collab = collaborators(None, model, StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://nerdc.gov.ng/biology.pdf", 1, AuthorityHint::Official)],
        );

        let run = runner
            .run(StageTask::Gatekeeper, StageInput { job: &job, competencies: &[] })
            .await;
        assert_eq!(run.tiers.len(), 2);
        assert_eq!(run.tiers[0].tier, FallbackTier::Primary);
        assert_eq!(run.tiers[0].confidence, Some(0.5));
        assert_eq!(run.tiers[1].tier, FallbackTier::Escalation);
        let StageOutcome::Completed(product) = run.outcome else {
            panic!("expected completion");
        };
        assert_eq!(product.confidence(), 0.92);
    }

    #[tokio::test]
    async fn slow_dispatch_misses_heartbeat() {
        let model = ScriptedModel::new().with_delay(Duration::from_millis(500));
        model.push(StageKind::Validation, 0.9, json!({}));
        let collab = collaborators(None, model, StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab)
            .await
            .with_heartbeat(Duration::from_millis(50));
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://nerdc.gov.ng/biology.pdf", 1, AuthorityHint::Official)],
        );

        let run = runner
            .run(StageTask::Gatekeeper, StageInput { job: &job, competencies: &[] })
            .await;
        assert!(matches!(run.outcome, StageOutcome::HeartbeatMissed));
    }

    #[tokio::test]
    async fn mechanical_parse_is_not_storable() {
        let mut config = AppConfig::default();
        config.budget.parsing_usd = 0.0;
        let documents = StaticDocuments::new("https://nerdc.gov.ng/biology.pdf", document_chunks());
        let collab = collaborators(None, ScriptedModel::new(), documents);
        let runner = runner(config, &collab).await;
        let mut job = keyed_job();
        with_approved(&mut job, "https://nerdc.gov.ng/biology.pdf");

        let run = runner
            .run(StageTask::Architect, StageInput { job: &job, competencies: &[] })
            .await;
        let StageOutcome::Completed(StageProduct::Agent(AgentOutput::Parsing(out))) = run.outcome else {
            panic!("expected a parsing output, got {:?}", run.outcome);
        };
        assert_eq!(out.meta.tier, FallbackTier::Deterministic);
        assert!(!out.storable);
        assert_eq!(out.competencies.len(), 2);
        assert_eq!(out.competencies[0].title, "Living Things");
        assert_eq!(out.snapshot.chunk_count, 2);
    }

    #[tokio::test]
    async fn fallback_parse_is_not_storable_on_a_non_critical_ladder() {
        let mut config = AppConfig::default();
        config.models.stages.parsing.critical = false;
        config.budget.parsing_usd = 0.0;
        let documents = StaticDocuments::new("https://nerdc.gov.ng/biology.pdf", document_chunks());
        let collab = collaborators(None, ScriptedModel::new(), documents);
        let runner = runner(config, &collab).await;
        let mut job = keyed_job();
        with_approved(&mut job, "https://nerdc.gov.ng/biology.pdf");

        let run = runner
            .run(StageTask::Architect, StageInput { job: &job, competencies: &[] })
            .await;
        let StageOutcome::Completed(StageProduct::Agent(AgentOutput::Parsing(out))) = run.outcome else {
            panic!("expected a parsing output, got {:?}", run.outcome);
        };
        assert_eq!(out.meta.tier, FallbackTier::Deterministic);
        assert!(!out.storable);
    }

    #[tokio::test]
    async fn low_primary_with_failed_escalation_is_not_completed() {
        let model = ScriptedModel::new();
        model.push(
            StageKind::Validation,
            0.5,
            json!({
                "approved_sources": [{
                    "url": "https://nerdc.gov.ng/biology.pdf",
                    "authority": "NERDC",
                    "license": "permissive",
                    "published_year": 2019,
                    "confidence": 0.95
                }],
                "rejected_sources": [],
                "status": "approved"
            }),
        );
        let collab = collaborators(None, model, StaticDocuments::empty());
        let runner = runner(AppConfig::default(), &collab).await;
        let mut job = keyed_job();
        with_search(
            &mut job,
            vec![candidate("https://nerdc.gov.ng/biology.pdf", 1, AuthorityHint::Official)],
        );

        let run = runner
            .run(StageTask::Gatekeeper, StageInput { job: &job, competencies: &[] })
            .await;
        assert_eq!(run.tiers[0].confidence, Some(0.5));
        assert!(run.tiers[1..].iter().all(|t| t.confidence.is_none()));
        let StageOutcome::BelowThreshold { product, threshold } = run.outcome else {
            panic!("expected a below-threshold outcome, got {:?}", run.outcome);
        };
        assert_eq!(product.confidence(), 0.5);
        assert_eq!(threshold, 0.7);
    }

    #[tokio::test]
    async fn model_parse_with_abstracted_competency_is_fatal() {
        let model = ScriptedModel::new();
        model.push(
            StageKind::Parsing,
            0.9,
            json!({
                "competencies": [{
                    "id": "c1",
                    "title": "Cells",
                    "description": "Understand life",
                    "learning_outcomes": ["Understand life"],
                    "abstraction_level": 3,
                    "confidence": 0.9,
                    "source_chunk_ids": ["abc-1"]
                }]
            }),
        );
        let documents = StaticDocuments::new("https://nerdc.gov.ng/biology.pdf", document_chunks());
        let collab = collaborators(None, model, documents);
        let runner = runner(AppConfig::default(), &collab).await;
        let mut job = keyed_job();
        with_approved(&mut job, "https://nerdc.gov.ng/biology.pdf");

        let run = runner
            .run(StageTask::Architect, StageInput { job: &job, competencies: &[] })
            .await;
        assert!(matches!(run.outcome, StageOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn deterministic_generation_is_rejected_listing() {
        let mut config = AppConfig::default();
        config.budget.generation_usd = 0.0;
        let collab = collaborators(None, ScriptedModel::new(), StaticDocuments::empty());
        let runner = runner(config, &collab).await;
        let job = keyed_job();
        let competencies = vec![competency("c1", "abc-1", "Identify the parts of a cell")];

        let run = runner
            .run(
                StageTask::Generate,
                StageInput { job: &job, competencies: &competencies },
            )
            .await;
        let StageOutcome::Completed(StageProduct::Generation(out)) = run.outcome else {
            panic!("expected generation output, got {:?}", run.outcome);
        };
        assert_eq!(out.status, GenerationStatus::Rejected);
        assert_eq!(out.citations, vec!["c1"]);
        assert!(out.rejection_reasons[0].contains("model tier"));
    }

    #[tokio::test]
    async fn shadow_run_records_drift_and_raises_floor() {
        let mut config = AppConfig::default();
        config.shadow.enabled = true;
        config.shadow.drift_threshold = 0.1;
        let model = ScriptedModel::new();
        model.push(
            StageKind::Parsing,
            0.9,
            json!({"competencies": [{
                "id": "c1",
                "title": "Cells",
                "description": "Identify the parts of a cell",
                "learning_outcomes": ["Identify the parts of a cell"],
                "confidence": 0.9,
                "source_chunk_ids": ["abc-1"]
            }]}),
        );
        model.push(
            StageKind::Parsing,
            0.95,
            json!({"competencies": [{
                "id": "s1",
                "title": "Ecology",
                "description": "Explain food chains",
                "learning_outcomes": ["Explain food chains"],
                "confidence": 0.95,
                "source_chunk_ids": ["abc-1"]
            }, {
                "id": "s2",
                "title": "Genetics",
                "description": "Describe inheritance",
                "learning_outcomes": ["Describe inheritance"],
                "confidence": 0.95,
                "source_chunk_ids": ["abc-1"]
            }]}),
        );
        let documents = StaticDocuments::new("https://nerdc.gov.ng/biology.pdf", document_chunks());
        let collab = collaborators(None, model, documents);
        let runner = runner(config, &collab).await;
        let mut job = keyed_job();
        with_approved(&mut job, "https://nerdc.gov.ng/biology.pdf");

        let run = runner
            .run(StageTask::Architect, StageInput { job: &job, competencies: &[] })
            .await;
        assert!(matches!(run.outcome, StageOutcome::Completed(_)));
        runner.drain_shadows().await;

        let shadow_runs = runner.storage.list_shadow_runs("parsing", 10).await.unwrap();
        assert_eq!(shadow_runs.len(), 1);
        assert!(shadow_runs[0].escalated);
        assert_eq!(
            runner.router.floor(StageKind::Parsing).await,
            FallbackTier::Escalation
        );
    }
}

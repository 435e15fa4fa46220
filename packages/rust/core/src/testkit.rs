//! In-memory collaborators and fixtures shared by the crate's tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use curricula_shared::{
    AlertSink, AppConfig, AssumptionType, ChunkKind, Competency, CurriculaError, CurriculumRecord,
    CurriculumRequest, CurriculumStatus, DocumentExtractor, ExtractedDocument, GenerativeModel,
    HumanAlert, JurisdictionLevel, JurisdictionResolution, ModelRequest, ModelResponse,
    NormalizedRequest, Result, SearchCapability, SearchHit, SourceChunk, StageKind,
};
use curricula_storage::Storage;
use uuid::Uuid;

use crate::job::{Job, JobKey};
use crate::orchestrator::Collaborators;
use crate::state::JobState;

pub async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("curricula_core_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// Default config with rate limits loose enough that tests never wait.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.limits.model_burst = 1_000;
    config.limits.search_burst = 1_000;
    config
}

pub fn curriculum_request(prompt: &str) -> CurriculumRequest {
    CurriculumRequest {
        prompt: prompt.into(),
        jurisdiction: None,
        generation: Default::default(),
    }
}

/// What the normalizer makes of "JSS 1 biology for Nigeria".
pub fn request() -> NormalizedRequest {
    NormalizedRequest {
        request_id: Uuid::now_v7(),
        raw_prompt: "JSS 1 biology for Nigeria".into(),
        country: "nigeria".into(),
        country_code: "NG".into(),
        grade: "jss 1".into(),
        subject: "biology".into(),
        language: "en".into(),
        confidence: 1.0,
    }
}

pub fn resolution(level: JurisdictionLevel, name: Option<&str>) -> JurisdictionResolution {
    JurisdictionResolution {
        level,
        name: name.map(str::to_string),
        parent_id: None,
        ambiguity_score: 0.0,
        assumption_type: if level == JurisdictionLevel::National {
            AssumptionType::Assumed
        } else {
            AssumptionType::UserConfirmed
        },
        confidence: 1.0,
    }
}

/// An active NG record for `key` (`national`, `state:lagos`, `county:ikeja`).
pub fn record(key: &str, confidence: f64) -> CurriculumRecord {
    let (level, name) = match key.split_once(':') {
        Some(("state", name)) => (JurisdictionLevel::State, Some(name.to_string())),
        Some(("county", name)) => (JurisdictionLevel::County, Some(name.to_string())),
        _ => (JurisdictionLevel::National, None),
    };
    CurriculumRecord {
        id: Uuid::now_v7().to_string(),
        country: "nigeria".into(),
        country_code: "NG".into(),
        jurisdiction_level: level,
        jurisdiction_name: name,
        parent_jurisdiction_id: None,
        jurisdiction_key: key.into(),
        grade: "jss 1".into(),
        subject: "biology".into(),
        status: CurriculumStatus::Active,
        confidence_score: confidence,
        last_verified: Utc::now(),
        ttl_expiry: Utc::now() + chrono::Duration::days(30),
        source_url: "https://nerdc.gov.ng/biology".into(),
        checksum: "abc".into(),
        version: 0,
    }
}

pub fn competency(id: &str, chunk_id: &str, text: &str) -> Competency {
    Competency {
        id: id.into(),
        title: "Living Things".into(),
        description: text.into(),
        learning_outcomes: vec![text.into()],
        grade: None,
        abstraction_level: 0,
        confidence: 0.9,
        source_chunk_ids: vec![chunk_id.into()],
    }
}

/// A heading chunk followed by a two-objective list.
pub fn document_chunks() -> Vec<SourceChunk> {
    vec![
        SourceChunk {
            id: "abc-0".into(),
            text: "Living Things".into(),
            kind: ChunkKind::Heading,
            page: Some(1),
            confidence: 0.9,
        },
        SourceChunk {
            id: "abc-1".into(),
            text: "1. Identify the parts of a cell.\n2. Describe photosynthesis.".into(),
            kind: ChunkKind::Text,
            page: Some(1),
            confidence: 0.9,
        },
    ]
}

/// A job resolved to the NG national curriculum, ready for stage dispatch.
pub fn keyed_job() -> Job {
    let mut job = Job::new(curriculum_request("JSS 1 biology for Nigeria"));
    let normalized = request();
    let resolved = resolution(JurisdictionLevel::National, None);
    job.key = Some(JobKey::new(&normalized, &resolved));
    job.payload.normalized = Some(normalized);
    job.payload.resolution = Some(resolved);
    job.state = JobState::ScoutAgent;
    job
}

pub fn collaborators(
    search: Option<Arc<dyn SearchCapability>>,
    model: ScriptedModel,
    documents: StaticDocuments,
) -> Collaborators {
    Collaborators {
        search,
        extractor: Arc::new(documents),
        model: Arc::new(model),
        alerts: Arc::new(RecordingAlerts::default()),
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Search provider returning the same hits for every query.
pub struct StaticSearch {
    hits: Vec<SearchHit>,
    delay: Option<Duration>,
}

impl StaticSearch {
    pub fn new(hits: Vec<SearchHit>) -> Self {
        Self { hits, delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl SearchCapability for StaticSearch {
    fn name(&self) -> &str {
        "static-search"
    }

    async fn search(&self, _country_code: &str, _queries: &[String]) -> Result<Vec<SearchHit>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.hits.clone())
    }
}

/// Extractor returning the same chunks for any URL.
pub struct StaticDocuments {
    url: String,
    chunks: Vec<SourceChunk>,
}

impl StaticDocuments {
    pub fn new(url: &str, chunks: Vec<SourceChunk>) -> Self {
        Self {
            url: url.into(),
            chunks,
        }
    }

    pub fn empty() -> Self {
        Self::new("", Vec::new())
    }
}

#[async_trait]
impl DocumentExtractor for StaticDocuments {
    async fn extract(&self, url: &str) -> Result<ExtractedDocument> {
        let url = if self.url.is_empty() { url } else { &self.url };
        Ok(ExtractedDocument {
            url: url.to_string(),
            checksum: "abc".into(),
            chunks: self.chunks.clone(),
        })
    }
}

/// Model that answers each stage from a queue of scripted responses.
///
/// An empty queue is a model error, so unscripted stages fall down the
/// ladder the way an unavailable provider would.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<HashMap<StageKind, VecDeque<(f64, serde_json::Value)>>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, stage: StageKind, confidence: f64, payload: serde_json::Value) {
        self.responses
            .lock()
            .expect("script lock")
            .entry(stage)
            .or_default()
            .push_back((confidence, payload));
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .expect("script lock")
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);
        let (confidence, payload) = next.ok_or_else(|| {
            CurriculaError::Model(format!("no scripted response for {}", request.stage))
        })?;
        Ok(ModelResponse {
            model_id: request.model_id,
            confidence,
            payload,
            cost_usd: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<HumanAlert>>,
}

impl RecordingAlerts {
    pub fn recorded(&self) -> Vec<HumanAlert> {
        self.alerts.lock().expect("alerts lock").clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify(&self, alert: &HumanAlert) -> Result<()> {
        self.alerts.lock().expect("alerts lock").push(alert.clone());
        Ok(())
    }
}

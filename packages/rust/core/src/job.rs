//! The persisted job: state, accumulated payload and bookkeeping.
//!
//! A job is stored as one JSON body in the `jobs` table. Storage indexes
//! only the cold-start key, the state name and the in-flight flag.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use curricula_shared::{
    AgentOutput, CurriculaError, CurriculumRequest, EmbeddingOutput, FailureClass, FallbackTier,
    GenerationOutput, HumanAlert, JobId, JurisdictionChoice, JurisdictionResolution,
    NormalizedRequest, ParsingOutput, Result, ResumeToken, SearchOutput, StageKind,
    ValidationOutput, VaultLookupResult,
};
use curricula_storage::JobRow;
use serde::{Deserialize, Serialize};

use crate::jurisdiction::Question;
use crate::state::JobState;

// ---------------------------------------------------------------------------
// JobKey
// ---------------------------------------------------------------------------

/// Cold-start deduplication key. Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub country_code: String,
    pub jurisdiction_key: String,
    pub grade: String,
    pub subject: String,
}

impl JobKey {
    pub fn new(request: &NormalizedRequest, resolution: &JurisdictionResolution) -> Self {
        Self {
            country_code: request.country_code.to_lowercase(),
            jurisdiction_key: resolution.key().to_lowercase(),
            grade: request.grade.to_lowercase(),
            subject: request.subject.to_lowercase(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.country_code, self.jurisdiction_key, self.grade, self.subject
        )
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping records
// ---------------------------------------------------------------------------

/// One routing decision, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRecord {
    pub stage: StageKind,
    pub tier: FallbackTier,
    pub model_id: String,
    /// Confidence the dispatch reported, if it completed.
    pub confidence: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub class: FailureClass,
    pub message: String,
}

impl From<&CurriculaError> for JobError {
    fn from(e: &CurriculaError) -> Self {
        Self {
            class: e.class(),
            message: e.to_string(),
        }
    }
}

/// Why a job is waiting on a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    KillSwitch,
    SearchExhausted,
    ValidationConflict,
    ValidationFailed,
    LowConfidence,
    NotStorable,
    GroundingRejected,
    GenerationRejected,
}

impl AlertKind {
    pub fn summary(&self) -> &'static str {
        match self {
            Self::KillSwitch => "a kill switch stopped the job before dispatch",
            Self::SearchExhausted => "search found no usable sources after a retry",
            Self::ValidationConflict => "approved sources disagree",
            Self::ValidationFailed => "no source could be approved",
            Self::LowConfidence => "stage output is below the confidence threshold",
            Self::NotStorable => "parsing fell back to mechanical extraction",
            Self::GroundingRejected => "the replica failed grounding verification",
            Self::GenerationRejected => "generated content failed the coverage or citation gate",
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self {
            Self::KillSwitch => "clear the kill switch, then approve to resume",
            Self::SearchExhausted => "provide an official source URL or terminate",
            Self::ValidationConflict => "provide the authoritative source URL or terminate",
            Self::ValidationFailed => "provide a source URL with a clear license or terminate",
            Self::LowConfidence => "review the output and approve, provide a better source, or terminate",
            Self::NotStorable => "approve to retry parsing, provide another source, or terminate",
            Self::GroundingRejected => "provide a source URL for re-verification or terminate",
            Self::GenerationRejected => "approve to regenerate or terminate",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::KillSwitch => FailureClass::System,
            Self::SearchExhausted | Self::ValidationConflict => FailureClass::Data,
            Self::ValidationFailed => FailureClass::Legal,
            Self::LowConfidence
            | Self::NotStorable
            | Self::GroundingRejected
            | Self::GenerationRejected => FailureClass::Agent,
        }
    }

    /// State a human approval resumes, or `None` when approval would
    /// bypass a gate and only a manual source or termination applies.
    pub fn resume_state(&self, raised_in: JobState) -> Option<JobState> {
        match self {
            Self::KillSwitch => Some(raised_in),
            // An approved parse moves on; other stages run again.
            Self::LowConfidence => match raised_in {
                JobState::ArchitectAgent => Some(JobState::Embedder),
                other => Some(other),
            },
            Self::NotStorable => Some(JobState::ArchitectAgent),
            Self::GenerationRejected => Some(JobState::Generate),
            Self::SearchExhausted
            | Self::ValidationConflict
            | Self::ValidationFailed
            | Self::GroundingRejected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaisedAlert {
    pub kind: AlertKind,
    pub alert: HumanAlert,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Everything a job has accumulated so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub request: CurriculumRequest,
    #[serde(default)]
    pub normalized: Option<NormalizedRequest>,
    #[serde(default)]
    pub resolution: Option<JurisdictionResolution>,
    /// The user's latest answer to a jurisdiction question.
    #[serde(default)]
    pub answer: Option<JurisdictionChoice>,
    #[serde(default)]
    pub lookup: Option<VaultLookupResult>,
    /// Record generation reads from: the served hit or the stored replica.
    #[serde(default)]
    pub record_id: Option<String>,
    /// Version to expect under the exact key when writing the replica.
    #[serde(default)]
    pub exact_version: Option<i64>,
    #[serde(default)]
    pub stale_warning: Option<String>,
    /// Stage outputs in emission order.
    #[serde(default)]
    pub outputs: Vec<AgentOutput>,
    #[serde(default)]
    pub generation: Option<GenerationOutput>,
    /// Source URL supplied by a human after an alert.
    #[serde(default)]
    pub manual_source: Option<String>,
}

impl JobPayload {
    pub fn new(request: CurriculumRequest) -> Self {
        Self {
            request,
            normalized: None,
            resolution: None,
            answer: None,
            lookup: None,
            record_id: None,
            exact_version: None,
            stale_warning: None,
            outputs: Vec::new(),
            generation: None,
            manual_source: None,
        }
    }

    pub fn latest_search(&self) -> Option<&SearchOutput> {
        self.outputs.iter().rev().find_map(|o| match o {
            AgentOutput::Search(s) => Some(s),
            _ => None,
        })
    }

    pub fn latest_validation(&self) -> Option<&ValidationOutput> {
        self.outputs.iter().rev().find_map(|o| match o {
            AgentOutput::Validation(v) => Some(v),
            _ => None,
        })
    }

    pub fn latest_parsing(&self) -> Option<&ParsingOutput> {
        self.outputs.iter().rev().find_map(|o| match o {
            AgentOutput::Parsing(p) => Some(p),
            _ => None,
        })
    }

    pub fn latest_embedding(&self) -> Option<&EmbeddingOutput> {
        self.outputs.iter().rev().find_map(|o| match o {
            AgentOutput::Embedding(e) => Some(e),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Set once jurisdiction is resolved.
    #[serde(default)]
    pub key: Option<JobKey>,
    /// True once this job owns its key for a cold start.
    #[serde(default)]
    pub claimed: bool,
    pub state: JobState,
    pub payload: JobPayload,
    /// Transient-failure retries, by state name.
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    /// Missed heartbeats, by state name.
    #[serde(default)]
    pub heartbeat_misses: BTreeMap<String, u32>,
    #[serde(default)]
    pub tier_history: Vec<TierRecord>,
    #[serde(default)]
    pub resume_token: Option<ResumeToken>,
    #[serde(default)]
    pub question: Option<Question>,
    /// Where a human approval continues.
    #[serde(default)]
    pub resume_state: Option<JobState>,
    #[serde(default)]
    pub alert: Option<RaisedAlert>,
    #[serde(default)]
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: CurriculumRequest) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            key: None,
            claimed: false,
            state: JobState::NormalizeRequest,
            payload: JobPayload::new(request),
            retries: BTreeMap::new(),
            heartbeat_misses: BTreeMap::new(),
            tier_history: Vec::new(),
            resume_token: None,
            question: None,
            resume_state: None,
            alert: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Holds the in-flight key: claimed and not yet finished.
    pub fn in_flight(&self) -> bool {
        self.claimed && !self.state.is_terminal()
    }

    /// Increment and return the retry counter for the current state.
    pub fn bump_retry(&mut self) -> u32 {
        let n = self.retries.entry(self.state.as_str().to_string()).or_default();
        *n += 1;
        *n
    }

    /// Increment and return the missed-heartbeat counter for the current state.
    pub fn bump_heartbeat(&mut self) -> u32 {
        let n = self
            .heartbeat_misses
            .entry(self.state.as_str().to_string())
            .or_default();
        *n += 1;
        *n
    }

    /// Suspend on a user question with a fresh token.
    pub fn ask(&mut self, question: Question) -> &ResumeToken {
        self.question = Some(question);
        self.resume_token.insert(ResumeToken::issue())
    }

    /// Suspend for a human with a fresh token. `raised_in` is the state
    /// the alert was raised from.
    pub fn raise(&mut self, kind: AlertKind, detail: &str, raised_in: JobState) -> &RaisedAlert {
        let reason = if detail.is_empty() {
            kind.summary().to_string()
        } else {
            format!("{}: {detail}", kind.summary())
        };
        self.resume_state = kind.resume_state(raised_in);
        self.resume_token = Some(ResumeToken::issue());
        self.alert.insert(RaisedAlert {
            kind,
            alert: HumanAlert {
                job_id: self.id,
                reason,
                recommended_action: kind.recommended_action().to_string(),
                class: kind.class(),
                raised_at: Utc::now(),
            },
        })
    }

    /// Drop suspension state after a valid resume event.
    pub fn clear_suspension(&mut self) {
        self.resume_token = None;
        self.question = None;
        self.alert = None;
        self.resume_state = None;
    }

    pub fn record_error(&mut self, error: &CurriculaError) {
        self.last_error = Some(JobError::from(error));
    }

    pub fn to_row(&self) -> Result<JobRow> {
        let body_json = serde_json::to_string(self)
            .map_err(|e| CurriculaError::Storage(format!("serialize job {}: {e}", self.id)))?;
        Ok(JobRow {
            id: self.id.to_string(),
            job_key: self.key.as_ref().map(ToString::to_string),
            state: self.state.as_str().to_string(),
            in_flight: self.in_flight(),
            resume_token: self.resume_token.as_ref().map(|t| t.as_str().to_string()),
            body_json,
            last_error: self.last_error.as_ref().map(|e| e.message.clone()),
        })
    }

    pub fn from_row(row: &JobRow) -> Result<Self> {
        serde_json::from_str(&row.body_json)
            .map_err(|e| CurriculaError::Storage(format!("corrupt job row {}: {e}", row.id)))
    }
}

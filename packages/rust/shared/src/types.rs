//! Core domain types for curriculum requests, jurisdictions and verified artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CurriculaError, FailureClass, Result};

// ---------------------------------------------------------------------------
// JobId / ResumeToken
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque token a caller must present to resume a suspended job.
///
/// A new token is issued on every suspension, so a token only ever
/// resumes the suspension it was handed out for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn issue() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

/// Every unit of work that can be routed through the model ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Normalization,
    Jurisdiction,
    Search,
    Validation,
    Parsing,
    Embedding,
    Generation,
}

impl StageKind {
    /// Stable key used in storage and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalization => "normalization",
            Self::Jurisdiction => "jurisdiction",
            Self::Search => "search",
            Self::Validation => "validation",
            Self::Parsing => "parsing",
            Self::Embedding => "embedding",
            Self::Generation => "generation",
        }
    }

    /// Name of the output schema a model must answer with for this stage.
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::Normalization => "normalized_request.v1",
            Self::Jurisdiction => "jurisdiction_resolution.v1",
            Self::Search => "search_output.v1",
            Self::Validation => "validation_output.v1",
            Self::Parsing => "parsing_output.v1",
            Self::Embedding => "embedding_output.v1",
            Self::Generation => "generation_output.v1",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = CurriculaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normalization" => Ok(Self::Normalization),
            "jurisdiction" => Ok(Self::Jurisdiction),
            "search" => Ok(Self::Search),
            "validation" => Ok(Self::Validation),
            "parsing" => Ok(Self::Parsing),
            "embedding" => Ok(Self::Embedding),
            "generation" => Ok(Self::Generation),
            other => Err(CurriculaError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback tiers
// ---------------------------------------------------------------------------

/// Position on a stage's fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// Tier 0: cost-optimized model.
    Primary,
    /// Tier 1: high-accuracy model.
    Escalation,
    /// Tier 2: rule-based, mechanical extraction only. Never storable.
    Deterministic,
}

impl FallbackTier {
    pub fn index(&self) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Escalation => 1,
            Self::Deterministic => 2,
        }
    }

    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Primary,
            1 => Self::Escalation,
            _ => Self::Deterministic,
        }
    }

    /// One step down the ladder. Tier 2 is the floor.
    pub fn step_down(&self) -> Self {
        Self::from_index(self.index() + 1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "tier0",
            Self::Escalation => "tier1",
            Self::Deterministic => "tier2",
        }
    }
}

impl std::fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution metadata every stage output carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMeta {
    pub tier: FallbackTier,
    pub confidence: f64,
    pub model_id: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A free-form request as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumRequest {
    /// Free-form prompt, e.g. "Grade 7 biology lesson plan for Nigeria".
    pub prompt: String,
    /// Jurisdiction stated up front by the caller, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<JurisdictionChoice>,
    /// What to generate once a verified artifact is available.
    #[serde(default)]
    pub generation: GenerationKind,
}

/// Canonical form of an accepted request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub request_id: Uuid,
    pub raw_prompt: String,
    pub country: String,
    /// ISO 3166-1 alpha-2.
    pub country_code: String,
    pub grade: String,
    pub subject: String,
    pub language: String,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Jurisdictions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionLevel {
    National,
    State,
    County,
}

impl JurisdictionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::National => "national",
            Self::State => "state",
            Self::County => "county",
        }
    }
}

impl std::str::FromStr for JurisdictionLevel {
    type Err = CurriculaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "national" => Ok(Self::National),
            "state" => Ok(Self::State),
            "county" => Ok(Self::County),
            other => Err(CurriculaError::validation(format!(
                "unknown jurisdiction level '{other}'"
            ))),
        }
    }
}

/// A jurisdiction named by a caller or a user answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionChoice {
    pub level: JurisdictionLevel,
    /// Required for state and county levels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Key of the enclosing jurisdiction, for county choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl JurisdictionChoice {
    pub fn national() -> Self {
        Self {
            level: JurisdictionLevel::National,
            name: None,
            parent: None,
        }
    }
}

/// Build the storage key for a jurisdiction: `national`, `state:lagos`, ...
pub fn jurisdiction_key(level: JurisdictionLevel, name: Option<&str>) -> String {
    match (level, name) {
        (JurisdictionLevel::National, _) | (_, None) => "national".to_string(),
        (level, Some(name)) => format!("{}:{}", level.as_str(), name.trim().to_lowercase()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionType {
    Assumed,
    UserConfirmed,
    Explicit,
}

/// Outcome of jurisdiction resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JurisdictionResolution {
    pub level: JurisdictionLevel,
    pub name: Option<String>,
    /// Key of the parent jurisdiction, if this is sub-national.
    pub parent_id: Option<String>,
    pub ambiguity_score: f64,
    pub assumption_type: AssumptionType,
    pub confidence: f64,
}

impl JurisdictionResolution {
    /// Reject resolutions whose fields contradict each other.
    ///
    /// An assumed jurisdiction above the silent-assume threshold is an
    /// invalid state, never a warning.
    pub fn validate(&self, silent_assume_threshold: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ambiguity_score) {
            return Err(CurriculaError::InvalidResolution(format!(
                "ambiguity score {} outside [0, 1]",
                self.ambiguity_score
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(CurriculaError::InvalidResolution(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.assumption_type == AssumptionType::Assumed
            && self.ambiguity_score > silent_assume_threshold
        {
            return Err(CurriculaError::InvalidResolution(format!(
                "assumed jurisdiction with ambiguity score {} above {}",
                self.ambiguity_score, silent_assume_threshold
            )));
        }
        if self.level != JurisdictionLevel::National && self.name.is_none() {
            return Err(CurriculaError::InvalidResolution(format!(
                "{} jurisdiction without a name",
                self.level.as_str()
            )));
        }
        Ok(())
    }

    pub fn key(&self) -> String {
        jurisdiction_key(self.level, self.name.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Which lookup tier produced a vault match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultSource {
    /// Exact jurisdiction match.
    Cache,
    Parent,
    National,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultLookupResult {
    pub found: bool,
    pub artifact_id: Option<String>,
    pub confidence: f64,
    pub source: Option<VaultSource>,
}

impl VaultLookupResult {
    pub fn miss() -> Self {
        Self {
            found: false,
            artifact_id: None,
            confidence: 0.0,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurriculumStatus {
    Active,
    Stale,
    Conflicted,
}

impl CurriculumStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stale => "stale",
            Self::Conflicted => "conflicted",
        }
    }
}

impl std::str::FromStr for CurriculumStatus {
    type Err = CurriculaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "stale" => Ok(Self::Stale),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(CurriculaError::Storage(format!(
                "unknown curriculum status '{other}'"
            ))),
        }
    }
}

/// A verified curriculum artifact as stored in the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumRecord {
    pub id: String,
    pub country: String,
    pub country_code: String,
    pub jurisdiction_level: JurisdictionLevel,
    pub jurisdiction_name: Option<String>,
    pub parent_jurisdiction_id: Option<String>,
    pub jurisdiction_key: String,
    pub grade: String,
    pub subject: String,
    pub status: CurriculumStatus,
    pub confidence_score: f64,
    pub last_verified: DateTime<Utc>,
    pub ttl_expiry: DateTime<Utc>,
    pub source_url: String,
    /// SHA-256 of the canonical competency set.
    pub checksum: String,
    /// Monotonic write version, starts at 1.
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Source material and competencies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Table,
    Heading,
}

/// A raw span of source material with its extraction confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChunk {
    pub id: String,
    pub text: String,
    pub kind: ChunkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub confidence: f64,
}

/// Atomic learning objective. Only the parsing stage creates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Competency {
    pub id: String,
    pub title: String,
    pub description: String,
    pub learning_outcomes: Vec<String>,
    #[serde(default)]
    pub grade: Option<String>,
    /// 0 means verbatim from the source.
    #[serde(default)]
    pub abstraction_level: u8,
    pub confidence: f64,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    LessonPlan,
    Quiz,
    #[default]
    Summary,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LessonPlan => "lesson_plan",
            Self::Quiz => "quiz",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParagraph {
    pub text: String,
    /// Competency ids this paragraph is grounded on.
    #[serde(default)]
    pub citations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Approved,
    Rejected,
}

/// Generated content. Produced on demand and never cached as a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub kind: GenerationKind,
    pub paragraphs: Vec<GenerationParagraph>,
    /// Distinct competency ids cited anywhere in the output.
    pub citations: Vec<String>,
    pub coverage: f64,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejection_reasons: Vec<String>,
    pub meta: StageMeta,
}

impl GenerationOutput {
    /// Render the paragraphs as plain text with bracketed citations.
    pub fn content(&self) -> String {
        self.paragraphs
            .iter()
            .map(|p| format!("{} [{}]", p.text, p.citations.join(", ")))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Notification raised when a job suspends for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanAlert {
    pub job_id: JobId,
    pub reason: String,
    pub recommended_action: String,
    pub class: FailureClass,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn tiers_step_down_to_floor() {
        assert_eq!(FallbackTier::Primary.step_down(), FallbackTier::Escalation);
        assert_eq!(FallbackTier::Escalation.step_down(), FallbackTier::Deterministic);
        assert_eq!(
            FallbackTier::Deterministic.step_down(),
            FallbackTier::Deterministic
        );
        assert!(FallbackTier::Primary < FallbackTier::Deterministic);
    }

    #[test]
    fn jurisdiction_keys() {
        assert_eq!(jurisdiction_key(JurisdictionLevel::National, None), "national");
        assert_eq!(
            jurisdiction_key(JurisdictionLevel::State, Some(" Lagos ")),
            "state:lagos"
        );
        assert_eq!(
            jurisdiction_key(JurisdictionLevel::National, Some("ignored")),
            "national"
        );
    }

    fn resolution(score: f64, assumption: AssumptionType) -> JurisdictionResolution {
        JurisdictionResolution {
            level: JurisdictionLevel::National,
            name: None,
            parent_id: None,
            ambiguity_score: score,
            assumption_type: assumption,
            confidence: 1.0 - score,
        }
    }

    #[test]
    fn assumed_above_threshold_is_invalid() {
        assert!(resolution(0.3, AssumptionType::Assumed).validate(0.4).is_ok());
        assert!(resolution(0.4, AssumptionType::Assumed).validate(0.4).is_ok());
        let err = resolution(0.5, AssumptionType::Assumed)
            .validate(0.4)
            .unwrap_err();
        assert!(matches!(err, CurriculaError::InvalidResolution(_)));
        assert!(
            resolution(0.9, AssumptionType::Explicit)
                .validate(0.4)
                .is_ok()
        );
    }

    #[test]
    fn subnational_resolution_needs_name() {
        let mut r = resolution(0.5, AssumptionType::UserConfirmed);
        r.level = JurisdictionLevel::State;
        assert!(r.validate(0.4).is_err());
        r.name = Some("Lagos".into());
        assert!(r.validate(0.4).is_ok());
        assert_eq!(r.key(), "state:lagos");
    }

    #[test]
    fn competency_rejects_unknown_fields() {
        let json = r#"{"id":"c1","title":"Cells","description":"d","learning_outcomes":["x"],
                       "confidence":0.9,"teaching_tip":"use slides"}"#;
        assert!(serde_json::from_str::<Competency>(json).is_err());
    }
}

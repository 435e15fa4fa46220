//! Stage output schemas for the cold-start chain.
//!
//! Each stage emits exactly one [`AgentOutput`] variant. Outputs are
//! immutable once emitted and carry their own consistency rules in
//! `validate()`. A violation is a schema mismatch, which is fatal for the job.

use serde::{Deserialize, Serialize};

use crate::error::{CurriculaError, Result};
use crate::types::{Competency, JobId, SourceChunk, StageKind, StageMeta};

/// Upper bound on search queries per search stage run.
pub const MAX_SEARCH_QUERIES: usize = 5;

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityHint {
    Official,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateUrl {
    pub url: String,
    pub domain: String,
    /// 1 is best.
    pub rank: u32,
    pub authority_hint: AuthorityHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    pub job_id: JobId,
    pub queries: Vec<String>,
    pub candidate_urls: Vec<CandidateUrl>,
    pub status: SearchStatus,
    pub meta: StageMeta,
}

impl SearchOutput {
    pub fn validate(&self) -> Result<()> {
        let stage = StageKind::Search.as_str();
        if self.queries.len() > MAX_SEARCH_QUERIES {
            return Err(CurriculaError::schema(
                stage,
                format!("{} queries, at most {MAX_SEARCH_QUERIES}", self.queries.len()),
            ));
        }
        if self.queries.iter().any(|q| q.trim().is_empty()) {
            return Err(CurriculaError::schema(stage, "empty search query"));
        }
        if self.candidate_urls.is_empty() && self.status != SearchStatus::Failed {
            return Err(CurriculaError::schema(
                stage,
                "no candidate urls but status is not failed",
            ));
        }
        if self.candidate_urls.iter().any(|c| c.rank == 0) {
            return Err(CurriculaError::schema(stage, "candidate rank must be >= 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseKind {
    Permissive,
    Unclear,
    Restricted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovedSource {
    pub url: String,
    pub authority: String,
    pub license: LicenseKind,
    #[serde(default)]
    pub published_year: Option<i32>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Approved,
    Conflicted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub job_id: JobId,
    pub approved_sources: Vec<ApprovedSource>,
    pub rejected_sources: Vec<String>,
    pub status: ValidationStatus,
    /// Topics the authority has retired; fed into the forbidden-pattern scan.
    #[serde(default)]
    pub deprecated_topics: Vec<String>,
    pub meta: StageMeta,
}

impl ValidationOutput {
    pub fn validate(&self) -> Result<()> {
        let stage = StageKind::Validation.as_str();
        if self.approved_sources.is_empty() && self.status == ValidationStatus::Approved {
            return Err(CurriculaError::schema(
                stage,
                "no approved sources but status is approved",
            ));
        }
        for source in &self.approved_sources {
            if source.license != LicenseKind::Permissive {
                return Err(CurriculaError::schema(
                    stage,
                    format!("approved source {} without a permissive license", source.url),
                ));
            }
            if !(0.0..=1.0).contains(&source.confidence) {
                return Err(CurriculaError::schema(
                    stage,
                    format!("confidence {} outside [0, 1]", source.confidence),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Reference to the source document a parse was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumSnapshot {
    pub source_url: String,
    pub checksum: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingStatus {
    Success,
    LowConfidence,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingOutput {
    pub job_id: JobId,
    pub snapshot: CurriculumSnapshot,
    pub competencies: Vec<Competency>,
    pub chunks: Vec<SourceChunk>,
    pub average_confidence: f64,
    pub status: ParsingStatus,
    /// False when produced by mechanical extraction on a critical stage.
    pub storable: bool,
    pub meta: StageMeta,
}

impl ParsingOutput {
    pub fn validate(&self, min_confidence: f64) -> Result<()> {
        let stage = StageKind::Parsing.as_str();
        if self.competencies.is_empty() && self.status != ParsingStatus::Failed {
            return Err(CurriculaError::schema(
                stage,
                "no competencies but status is not failed",
            ));
        }
        if self.average_confidence < min_confidence && self.status == ParsingStatus::Success {
            return Err(CurriculaError::schema(
                stage,
                format!(
                    "average confidence {} below {min_confidence} but status is success",
                    self.average_confidence
                ),
            ));
        }
        for c in &self.competencies {
            if c.title.trim().is_empty() || c.description.trim().is_empty() {
                return Err(CurriculaError::schema(
                    stage,
                    format!("competency {} has an empty title or description", c.id),
                ));
            }
            if c.learning_outcomes.is_empty() {
                return Err(CurriculaError::schema(
                    stage,
                    format!("competency {} has no learning outcomes", c.id),
                ));
            }
            if !(0.0..=1.0).contains(&c.confidence) {
                return Err(CurriculaError::schema(
                    stage,
                    format!("competency {} confidence {} outside [0, 1]", c.id, c.confidence),
                ));
            }
        }
        Ok(())
    }

    /// Mean competency confidence, 0.0 for an empty set.
    pub fn mean_confidence(competencies: &[Competency]) -> f64 {
        if competencies.is_empty() {
            return 0.0;
        }
        competencies.iter().map(|c| c.confidence).sum::<f64>() / competencies.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub job_id: JobId,
    pub embedded_chunks: usize,
    pub embedding_model: String,
    pub status: EmbeddingStatus,
    pub meta: StageMeta,
}

impl EmbeddingOutput {
    pub fn validate(&self) -> Result<()> {
        if self.embedded_chunks == 0 && self.status == EmbeddingStatus::Success {
            return Err(CurriculaError::schema(
                StageKind::Embedding.as_str(),
                "status success with zero embedded chunks",
            ));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(CurriculaError::schema(
                StageKind::Embedding.as_str(),
                "empty embedding model name",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AgentOutput
// ---------------------------------------------------------------------------

/// Closed set of cold-start stage outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AgentOutput {
    Search(SearchOutput),
    Validation(ValidationOutput),
    Parsing(ParsingOutput),
    Embedding(EmbeddingOutput),
}

impl AgentOutput {
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Search(_) => StageKind::Search,
            Self::Validation(_) => StageKind::Validation,
            Self::Parsing(_) => StageKind::Parsing,
            Self::Embedding(_) => StageKind::Embedding,
        }
    }

    pub fn meta(&self) -> &StageMeta {
        match self {
            Self::Search(o) => &o.meta,
            Self::Validation(o) => &o.meta,
            Self::Parsing(o) => &o.meta,
            Self::Embedding(o) => &o.meta,
        }
    }

    pub fn validate(&self, parsing_min_confidence: f64) -> Result<()> {
        match self {
            Self::Search(o) => o.validate(),
            Self::Validation(o) => o.validate(),
            Self::Parsing(o) => o.validate(parsing_min_confidence),
            Self::Embedding(o) => o.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FallbackTier;

    fn meta() -> StageMeta {
        StageMeta {
            tier: FallbackTier::Primary,
            confidence: 0.9,
            model_id: "test-model".into(),
        }
    }

    #[test]
    fn search_requires_candidates_unless_failed() {
        let mut out = SearchOutput {
            job_id: JobId::new(),
            queries: vec!["nigeria grade 7 biology curriculum".into()],
            candidate_urls: vec![],
            status: SearchStatus::Success,
            meta: meta(),
        };
        assert!(out.validate().is_err());
        out.status = SearchStatus::Failed;
        assert!(out.validate().is_ok());
    }

    #[test]
    fn search_caps_queries() {
        let out = SearchOutput {
            job_id: JobId::new(),
            queries: (0..6).map(|i| format!("query {i}")).collect(),
            candidate_urls: vec![],
            status: SearchStatus::Failed,
            meta: meta(),
        };
        assert!(matches!(
            out.validate(),
            Err(CurriculaError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn validation_without_sources_cannot_be_approved() {
        let mut out = ValidationOutput {
            job_id: JobId::new(),
            approved_sources: vec![],
            rejected_sources: vec!["https://blog.example.com".into()],
            status: ValidationStatus::Approved,
            deprecated_topics: vec![],
            meta: meta(),
        };
        assert!(out.validate().is_err());
        out.status = ValidationStatus::Conflicted;
        assert!(out.validate().is_ok());
    }

    #[test]
    fn parsing_status_must_match_confidence() {
        let competency = Competency {
            id: "c1".into(),
            title: "Cell structure".into(),
            description: "Identify parts of a cell".into(),
            learning_outcomes: vec!["Label a plant cell".into()],
            grade: None,
            abstraction_level: 0,
            confidence: 0.6,
            source_chunk_ids: vec!["k1".into()],
        };
        let mut out = ParsingOutput {
            job_id: JobId::new(),
            snapshot: CurriculumSnapshot {
                source_url: "https://nerdc.gov.ng/bio.html".into(),
                checksum: "abc".into(),
                chunk_count: 1,
            },
            competencies: vec![competency],
            chunks: vec![],
            average_confidence: 0.6,
            status: ParsingStatus::Success,
            storable: true,
            meta: meta(),
        };
        assert!(out.validate(0.75).is_err());
        out.status = ParsingStatus::LowConfidence;
        assert!(out.validate(0.75).is_ok());
    }

    #[test]
    fn embedding_success_needs_chunks() {
        let out = EmbeddingOutput {
            job_id: JobId::new(),
            embedded_chunks: 0,
            embedding_model: "text-embedding-3-small".into(),
            status: EmbeddingStatus::Success,
            meta: meta(),
        };
        assert!(out.validate().is_err());
    }

    #[test]
    fn agent_output_is_tagged_by_stage() {
        let out = AgentOutput::Embedding(EmbeddingOutput {
            job_id: JobId::new(),
            embedded_chunks: 3,
            embedding_model: "m".into(),
            status: EmbeddingStatus::Success,
            meta: meta(),
        });
        let json = serde_json::to_value(&out).expect("serialize");
        assert_eq!(json["stage"], "embedding");
        assert_eq!(out.stage(), StageKind::Embedding);
    }
}

//! Shared types, error model, and configuration for Curricula.
//!
//! This crate is the foundation depended on by all other Curricula crates.
//! It provides:
//! - [`CurriculaError`] and [`FailureClass`], the unified error model
//! - Domain types ([`NormalizedRequest`], [`JurisdictionResolution`], [`CurriculumRecord`], ...)
//! - Stage output schemas ([`AgentOutput`] and its variants)
//! - Collaborator contracts ([`SearchCapability`], [`DocumentExtractor`], [`GenerativeModel`], [`AlertSink`])
//! - Configuration ([`AppConfig`], config loading)

pub mod agents;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use agents::{
    AgentOutput, ApprovedSource, AuthorityHint, CandidateUrl, CurriculumSnapshot,
    EmbeddingOutput, EmbeddingStatus, LicenseKind, MAX_SEARCH_QUERIES, ParsingOutput,
    ParsingStatus, SearchOutput, SearchStatus, ValidationOutput, ValidationStatus,
};
pub use capabilities::{
    AlertSink, DocumentExtractor, ExtractedDocument, GenerativeModel, LogAlertSink,
    ModelRequest, ModelResponse, SearchCapability, SearchHit,
};
pub use config::{
    AppConfig, BudgetConfig, CountryProfile, DefaultsConfig, GroundingConfig, KillSwitchConfig,
    LimitsConfig, ModelsConfig, SearchConfig, ShadowConfig, StageLadder, StageLadders,
    ThresholdsConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key, validate_config,
};
pub use error::{CurriculaError, FailureClass, Result};
pub use types::{
    AssumptionType, ChunkKind, Competency, CurriculumRecord, CurriculumRequest,
    CurriculumStatus, FallbackTier, GenerationKind, GenerationOutput, GenerationParagraph,
    GenerationStatus, HumanAlert, JobId, JurisdictionChoice, JurisdictionLevel,
    JurisdictionResolution, NormalizedRequest, ResumeToken, SourceChunk, StageKind, StageMeta,
    VaultLookupResult, VaultSource, jurisdiction_key,
};

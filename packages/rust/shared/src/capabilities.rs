//! Contracts for the external collaborators the engine consumes.
//!
//! The engine never talks to a search provider, document source, model or
//! notification channel directly. It holds `Arc<dyn ...>` handles to these
//! traits; `curricula-sources` and the model bridge in `curricula-core`
//! provide the shipped implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::AuthorityHint;
use crate::error::Result;
use crate::types::{HumanAlert, SourceChunk, StageKind};

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// One ranked hit from a search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub authority_hint: AuthorityHint,
}

#[async_trait]
pub trait SearchCapability: Send + Sync {
    /// Provider name, recorded as the stage's model id.
    fn name(&self) -> &str;

    /// Run up to five queries and return ranked hits, best first.
    async fn search(&self, country_code: &str, queries: &[String]) -> Result<Vec<SearchHit>>;
}

// ---------------------------------------------------------------------------
// Document extraction
// ---------------------------------------------------------------------------

/// Raw chunks pulled from one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub url: String,
    /// SHA-256 of the fetched bytes.
    pub checksum: String,
    pub chunks: Vec<SourceChunk>,
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedDocument>;
}

// ---------------------------------------------------------------------------
// Generative model
// ---------------------------------------------------------------------------

/// A single call to a generative model with a declared output schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub stage: StageKind,
    pub model_id: String,
    /// Schema name the payload must conform to.
    pub schema: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model_id: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    pub payload: serde_json::Value,
    /// Actual spend reported by the provider, if any.
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse>;
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &HumanAlert) -> Result<()>;
}

/// Alert sink that only writes a structured log line.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &HumanAlert) -> Result<()> {
        tracing::warn!(
            job_id = %alert.job_id,
            class = %alert.class,
            reason = %alert.reason,
            action = %alert.recommended_action,
            "human alert raised"
        );
        Ok(())
    }
}

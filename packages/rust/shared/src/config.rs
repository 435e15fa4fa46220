//! Application configuration for Curricula.
//!
//! User config lives at `~/.curricula/curricula.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CurriculaError, Result};
use crate::types::StageKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "curricula.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".curricula";

// ---------------------------------------------------------------------------
// Config structs (matching curricula.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub kill_switches: KillSwitchConfig,

    #[serde(default)]
    pub shadow: ShadowConfig,

    #[serde(default)]
    pub grounding: GroundingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    /// Per-country profiles used by normalization and jurisdiction scoring.
    #[serde(default = "default_countries")]
    pub countries: Vec<CountryProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            thresholds: ThresholdsConfig::default(),
            budget: BudgetConfig::default(),
            limits: LimitsConfig::default(),
            kill_switches: KillSwitchConfig::default(),
            shadow: ShadowConfig::default(),
            grounding: GroundingConfig::default(),
            search: SearchConfig::default(),
            models: ModelsConfig::default(),
            countries: default_countries(),
        }
    }
}

impl AppConfig {
    /// Find a country profile by ISO code or any of its names.
    pub fn country(&self, code_or_name: &str) -> Option<&CountryProfile> {
        let needle = code_or_name.trim().to_lowercase();
        self.countries.iter().find(|c| {
            c.code.eq_ignore_ascii_case(&needle)
                || c.name == needle
                || c.aliases.iter().any(|a| a == &needle)
        })
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path of the libSQL database holding the vault and job state.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Language assumed when a request does not name one.
    #[serde(default = "default_language")]
    pub language: String,

    /// A stage that reports nothing for this long is treated as crashed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Days a newly verified artifact stays fresh.
    #[serde(default = "default_ttl_days")]
    pub artifact_ttl_days: i64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            language: default_language(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            artifact_ttl_days: default_ttl_days(),
        }
    }
}

fn default_db_path() -> String {
    "~/.curricula/curricula.db".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_heartbeat_timeout() -> u64 {
    120
}
fn default_ttl_days() -> i64 {
    180
}

/// `[thresholds]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    /// Minimum normalization confidence to accept a request.
    #[serde(default = "default_normalization")]
    pub normalization: f64,
    /// Minimum resolution confidence to proceed without asking.
    #[serde(default = "default_jurisdiction_confidence")]
    pub jurisdiction_confidence: f64,
    /// Ambiguity score below which national is assumed silently.
    #[serde(default = "default_silent_assume")]
    pub silent_assume: f64,
    /// Ambiguity score above which the caller must state the jurisdiction.
    #[serde(default = "default_require_explicit")]
    pub require_explicit: f64,
    /// Minimum artifact confidence to serve without a staleness warning.
    #[serde(default = "default_vault_serve")]
    pub vault_serve: f64,
    /// Minimum average competency confidence after parsing.
    #[serde(default = "default_parsing")]
    pub parsing: f64,
    /// Minimum similarity between a competency and its cited source.
    #[serde(default = "default_similarity")]
    pub similarity: f64,
    /// Minimum share of requested competencies a generation must cite.
    #[serde(default = "default_coverage")]
    pub coverage: f64,
    /// Highest abstraction level normalization may produce.
    #[serde(default = "default_max_abstraction")]
    pub max_abstraction_level: u8,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            normalization: default_normalization(),
            jurisdiction_confidence: default_jurisdiction_confidence(),
            silent_assume: default_silent_assume(),
            require_explicit: default_require_explicit(),
            vault_serve: default_vault_serve(),
            parsing: default_parsing(),
            similarity: default_similarity(),
            coverage: default_coverage(),
            max_abstraction_level: default_max_abstraction(),
        }
    }
}

fn default_normalization() -> f64 {
    0.7
}
fn default_jurisdiction_confidence() -> f64 {
    0.6
}
fn default_silent_assume() -> f64 {
    0.4
}
fn default_require_explicit() -> f64 {
    0.7
}
fn default_vault_serve() -> f64 {
    0.8
}
fn default_parsing() -> f64 {
    0.75
}
fn default_similarity() -> f64 {
    0.75
}
fn default_coverage() -> f64 {
    0.8
}
fn default_max_abstraction() -> u8 {
    1
}

/// `[budget]` section. Monthly ceilings in USD, per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_search_ceiling")]
    pub search_usd: f64,
    #[serde(default = "default_validation_ceiling")]
    pub validation_usd: f64,
    #[serde(default = "default_parsing_ceiling")]
    pub parsing_usd: f64,
    #[serde(default = "default_embedding_ceiling")]
    pub embedding_usd: f64,
    #[serde(default = "default_generation_ceiling")]
    pub generation_usd: f64,
}

impl BudgetConfig {
    pub fn ceiling(&self, stage: StageKind) -> f64 {
        match stage {
            StageKind::Search => self.search_usd,
            StageKind::Validation => self.validation_usd,
            StageKind::Parsing => self.parsing_usd,
            StageKind::Embedding => self.embedding_usd,
            StageKind::Generation => self.generation_usd,
            StageKind::Normalization | StageKind::Jurisdiction => 0.0,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            search_usd: default_search_ceiling(),
            validation_usd: default_validation_ceiling(),
            parsing_usd: default_parsing_ceiling(),
            embedding_usd: default_embedding_ceiling(),
            generation_usd: default_generation_ceiling(),
        }
    }
}

fn default_search_ceiling() -> f64 {
    5.0
}
fn default_validation_ceiling() -> f64 {
    5.0
}
fn default_parsing_ceiling() -> f64 {
    20.0
}
fn default_embedding_ceiling() -> f64 {
    5.0
}
fn default_generation_ceiling() -> f64 {
    25.0
}

/// `[limits]` section. Token-bucket quotas for external capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_model_rate")]
    pub model_rate_per_sec: f64,
    #[serde(default = "default_burst")]
    pub model_burst: u32,
    #[serde(default = "default_search_rate")]
    pub search_rate_per_sec: f64,
    #[serde(default = "default_burst")]
    pub search_burst: u32,
    /// First backoff delay when a bucket is empty.
    #[serde(default = "default_backoff_ms")]
    pub backoff_initial_ms: u64,
    /// Total time to wait for a token before downgrading the tier.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            model_rate_per_sec: default_model_rate(),
            model_burst: default_burst(),
            search_rate_per_sec: default_search_rate(),
            search_burst: default_burst(),
            backoff_initial_ms: default_backoff_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_model_rate() -> f64 {
    2.0
}
fn default_search_rate() -> f64 {
    1.0
}
fn default_burst() -> u32 {
    5
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_max_wait_ms() -> u64 {
    5_000
}

/// `[kill_switches]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default)]
    pub disable_ingestion: bool,
    #[serde(default)]
    pub disable_generation: bool,
    #[serde(default)]
    pub disable_replica_storage: bool,
}

/// `[shadow]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Drift above this permanently raises the stage's tier floor.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// Consecutive shadow failures before shadow runs pause.
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_recovery")]
    pub recovery_secs: u64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drift_threshold: default_drift_threshold(),
            failure_threshold: default_breaker_threshold(),
            recovery_secs: default_breaker_recovery(),
        }
    }
}

fn default_drift_threshold() -> f64 {
    0.2
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_recovery() -> u64 {
    60
}

/// `[grounding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingConfig {
    /// Topics that must never reappear in a stored replica.
    #[serde(default)]
    pub deprecated_topics: Vec<String>,
    /// Phrases that mark added pedagogical advice.
    #[serde(default = "default_pedagogical_phrases")]
    pub pedagogical_phrases: Vec<String>,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            deprecated_topics: Vec::new(),
            pedagogical_phrases: default_pedagogical_phrases(),
        }
    }
}

fn default_pedagogical_phrases() -> Vec<String> {
    [
        "teachers should",
        "it is recommended",
        "we recommend",
        "best practice",
        "students should be encouraged",
        "a good approach",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// JSON search endpoint (`GET ?q=...`). Unset disables web search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Name of the env var holding the search API key.
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Largest document the extractor will download.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_search_key_env(),
            max_results: default_max_results(),
            timeout_secs: default_http_timeout(),
            max_document_bytes: default_max_document_bytes(),
        }
    }
}

fn default_search_key_env() -> String {
    "CURRICULA_SEARCH_KEY".into()
}
fn default_max_results() -> usize {
    10
}
fn default_http_timeout() -> u64 {
    15
}
fn default_max_document_bytes() -> u64 {
    20 * 1024 * 1024
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Bridge command (e.g. "bun").
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Bridge script passed to the bridge command.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    #[serde(default)]
    pub stages: StageLadders,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            bridge_cmd: default_bridge_cmd(),
            bridge_script: default_bridge_script(),
            working_dir: default_working_dir(),
            stages: StageLadders::default(),
        }
    }
}

fn default_api_key_env() -> String {
    "CURRICULA_MODEL_API_KEY".into()
}
fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "packages/ts/model-bridge/src/bridge.ts".into()
}
fn default_working_dir() -> String {
    ".".into()
}

/// Fallback ladder declared by one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLadder {
    /// Tier 0 model id.
    pub primary: String,
    /// Tier 1 model id.
    pub escalation: String,
    /// Tier 2 rule-based fallback name.
    pub deterministic: String,
    /// Primary output below this confidence escalates to tier 1.
    pub confidence_threshold: f64,
    /// Critical stages may only extract on tier 2.
    #[serde(default)]
    pub critical: bool,
    /// Cumulative time budget for the stage before tier 2.
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub primary_cost_usd: f64,
    #[serde(default)]
    pub escalation_cost_usd: f64,
}

fn default_stage_timeout_ms() -> u64 {
    60_000
}

impl StageLadder {
    fn new(
        primary: &str,
        escalation: &str,
        deterministic: &str,
        threshold: f64,
        critical: bool,
        costs: (f64, f64),
    ) -> Self {
        Self {
            primary: primary.into(),
            escalation: escalation.into(),
            deterministic: deterministic.into(),
            confidence_threshold: threshold,
            critical,
            timeout_ms: default_stage_timeout_ms(),
            primary_cost_usd: costs.0,
            escalation_cost_usd: costs.1,
        }
    }
}

/// `[models.stages.*]` tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLadders {
    #[serde(default = "default_search_ladder")]
    pub search: StageLadder,
    #[serde(default = "default_validation_ladder")]
    pub validation: StageLadder,
    #[serde(default = "default_parsing_ladder")]
    pub parsing: StageLadder,
    #[serde(default = "default_embedding_ladder")]
    pub embedding: StageLadder,
    #[serde(default = "default_generation_ladder")]
    pub generation: StageLadder,
}

impl StageLadders {
    /// Ladder for a routed stage. Normalization and jurisdiction are rule-based
    /// and have no ladder.
    pub fn get(&self, stage: StageKind) -> Option<&StageLadder> {
        match stage {
            StageKind::Search => Some(&self.search),
            StageKind::Validation => Some(&self.validation),
            StageKind::Parsing => Some(&self.parsing),
            StageKind::Embedding => Some(&self.embedding),
            StageKind::Generation => Some(&self.generation),
            StageKind::Normalization | StageKind::Jurisdiction => None,
        }
    }
}

impl Default for StageLadders {
    fn default() -> Self {
        Self {
            search: default_search_ladder(),
            validation: default_validation_ladder(),
            parsing: default_parsing_ladder(),
            embedding: default_embedding_ladder(),
            generation: default_generation_ladder(),
        }
    }
}

fn default_search_ladder() -> StageLadder {
    StageLadder::new(
        "web-search",
        "web-search",
        "official-domains",
        0.0,
        false,
        (0.002, 0.002),
    )
}
fn default_validation_ladder() -> StageLadder {
    StageLadder::new(
        "google/gemini-2.0-flash-001",
        "anthropic/claude-sonnet-4",
        "rule-gatekeeper",
        0.7,
        false,
        (0.002, 0.015),
    )
}
fn default_parsing_ladder() -> StageLadder {
    StageLadder::new(
        "google/gemini-2.0-flash-001",
        "anthropic/claude-sonnet-4",
        "mechanical-extract",
        0.75,
        true,
        (0.005, 0.04),
    )
}
fn default_embedding_ladder() -> StageLadder {
    StageLadder::new(
        "openai/text-embedding-3-small",
        "openai/text-embedding-3-large",
        "lexical-terms",
        0.5,
        false,
        (0.0005, 0.002),
    )
}
fn default_generation_ladder() -> StageLadder {
    StageLadder::new(
        "moonshotai/kimi-k2.5",
        "anthropic/claude-sonnet-4",
        "competency-listing",
        0.8,
        true,
        (0.004, 0.03),
    )
}

/// `[[countries]]` entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CountryProfile {
    /// ISO 3166-1 alpha-2.
    pub code: String,
    /// Lowercase canonical name.
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// More than one curriculum is currently in force.
    #[serde(default)]
    pub multiple_curricula: bool,
    /// Subjects managed below national level. `"*"` means all.
    #[serde(default)]
    pub subnational_subjects: Vec<String>,
    /// Grade naming terms used by this country's system.
    #[serde(default)]
    pub grade_terms: Vec<String>,
    /// Domains whose documents count as official.
    #[serde(default)]
    pub official_domains: Vec<String>,
}

impl CountryProfile {
    pub fn subject_is_subnational(&self, subject: &str) -> bool {
        self.subnational_subjects
            .iter()
            .any(|s| s == "*" || s.eq_ignore_ascii_case(subject))
    }

    /// True if `host` is, or is a subdomain of, an official domain.
    /// Entries starting with a dot (`.gov`) match as suffixes.
    pub fn is_official_host(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.official_domains.iter().any(|d| {
            let d = d.to_lowercase();
            if d.starts_with('.') {
                host.ends_with(&d)
            } else {
                host == d || host.ends_with(&format!(".{d}"))
            }
        })
    }
}

fn country(
    code: &str,
    name: &str,
    aliases: &[&str],
    multiple_curricula: bool,
    subnational: &[&str],
    grade_terms: &[&str],
    domains: &[&str],
) -> CountryProfile {
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    CountryProfile {
        code: code.into(),
        name: name.into(),
        aliases: owned(aliases),
        multiple_curricula,
        subnational_subjects: owned(subnational),
        grade_terms: owned(grade_terms),
        official_domains: owned(domains),
    }
}

fn default_countries() -> Vec<CountryProfile> {
    vec![
        country(
            "NG",
            "nigeria",
            &[],
            false,
            &[],
            &["primary", "jss", "ss"],
            &["nerdc.gov.ng", "education.gov.ng", "waec.org.ng"],
        ),
        country(
            "KE",
            "kenya",
            &[],
            true,
            &[],
            &["grade", "form"],
            &["kicd.ac.ke", "education.go.ke", "knec.ac.ke"],
        ),
        country(
            "GH",
            "ghana",
            &[],
            false,
            &[],
            &["basic", "jhs", "shs"],
            &["nacca.gov.gh", "moe.gov.gh"],
        ),
        country(
            "ZA",
            "south africa",
            &[],
            false,
            &[],
            &["grade"],
            &["education.gov.za", "dbe.gov.za"],
        ),
        country(
            "US",
            "united states",
            &["usa", "america"],
            true,
            &["*"],
            &["grade"],
            &[".gov", "corestandards.org"],
        ),
        country(
            "GB",
            "united kingdom",
            &["uk", "england", "britain"],
            true,
            &[],
            &["year", "key stage"],
            &["gov.uk", "education.gov.uk"],
        ),
        country(
            "CA",
            "canada",
            &[],
            true,
            &["*"],
            &["grade"],
            &[".edu.on.ca", "gov.bc.ca", "education.gov.on.ca"],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.curricula/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CurriculaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.curricula/curricula.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CurriculaError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CurriculaError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CurriculaError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject threshold combinations the engine cannot honour.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let t = &config.thresholds;
    let unit = [
        ("normalization", t.normalization),
        ("jurisdiction_confidence", t.jurisdiction_confidence),
        ("silent_assume", t.silent_assume),
        ("require_explicit", t.require_explicit),
        ("vault_serve", t.vault_serve),
        ("parsing", t.parsing),
        ("similarity", t.similarity),
        ("coverage", t.coverage),
    ];
    for (name, value) in unit {
        if !(0.0..=1.0).contains(&value) {
            return Err(CurriculaError::config(format!(
                "thresholds.{name} = {value} is outside [0, 1]"
            )));
        }
    }
    if t.silent_assume > t.require_explicit {
        return Err(CurriculaError::config(
            "thresholds.silent_assume must not exceed thresholds.require_explicit",
        ));
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CurriculaError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CurriculaError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CurriculaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.models.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(CurriculaError::config(format!(
            "model API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("db_path"));
        assert!(toml_str.contains("CURRICULA_MODEL_API_KEY"));
        assert!(toml_str.contains("nerdc.gov.ng"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.thresholds.vault_serve, 0.8);
        assert_eq!(parsed.models.stages, StageLadders::default());
        assert_eq!(parsed.countries.len(), 7);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[thresholds]
coverage = 0.9

[kill_switches]
disable_generation = true

[models.stages.parsing]
primary = "cheap"
escalation = "smart"
deterministic = "rules"
confidence_threshold = 0.8
critical = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.thresholds.coverage, 0.9);
        assert_eq!(config.thresholds.parsing, 0.75);
        assert!(config.kill_switches.disable_generation);
        assert_eq!(config.models.stages.parsing.primary, "cheap");
        assert_eq!(config.models.stages.parsing.timeout_ms, 60_000);
        assert_eq!(config.models.stages.search.deterministic, "official-domains");
        assert!(!config.countries.is_empty());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.thresholds.silent_assume = 0.8;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.thresholds.coverage = 1.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn country_lookup_and_official_hosts() {
        let config = AppConfig::default();
        let us = config.country("usa").expect("us profile");
        assert_eq!(us.code, "US");
        assert!(us.is_official_host("www.ed.gov"));
        assert!(!us.is_official_host("gov.example.com"));
        assert!(us.subject_is_subnational("biology"));

        let ng = config.country("NG").expect("ng profile");
        assert!(ng.is_official_host("nerdc.gov.ng"));
        assert!(ng.is_official_host("www.nerdc.gov.ng"));
        assert!(!ng.is_official_host("notnerdc.gov.ng"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.models.api_key_env = "CURRICULA_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}

//! The orchestrator's states and its closed transition table.
//!
//! Every move a job makes goes through [`next`]. A (state, condition) pair
//! missing from the table is an [`CurriculaError::InvalidTransition`], which
//! is fatal for the job.

use curricula_shared::{CurriculaError, Result, StageKind};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    NormalizeRequest,
    ResolveJurisdiction,
    #[serde(rename = "WAIT_USER")]
    WaitUser,
    VaultLookup,
    EnqueueColdStart,
    ScoutAgent,
    GatekeeperAgent,
    ArchitectAgent,
    Embedder,
    VaultStore,
    Generate,
    HumanAlert,
    #[serde(rename = "END")]
    End,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 14] = [
        Self::NormalizeRequest,
        Self::ResolveJurisdiction,
        Self::WaitUser,
        Self::VaultLookup,
        Self::EnqueueColdStart,
        Self::ScoutAgent,
        Self::GatekeeperAgent,
        Self::ArchitectAgent,
        Self::Embedder,
        Self::VaultStore,
        Self::Generate,
        Self::HumanAlert,
        Self::End,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NormalizeRequest => "NormalizeRequest",
            Self::ResolveJurisdiction => "ResolveJurisdiction",
            Self::WaitUser => "WAIT_USER",
            Self::VaultLookup => "VaultLookup",
            Self::EnqueueColdStart => "EnqueueColdStart",
            Self::ScoutAgent => "ScoutAgent",
            Self::GatekeeperAgent => "GatekeeperAgent",
            Self::ArchitectAgent => "ArchitectAgent",
            Self::Embedder => "Embedder",
            Self::VaultStore => "VaultStore",
            Self::Generate => "Generate",
            Self::HumanAlert => "HumanAlert",
            Self::End => "END",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Failed)
    }

    /// Suspension points: the job is persisted and waits for an external event.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::WaitUser | Self::HumanAlert)
    }

    /// The routed stage this state dispatches, if any.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Self::ScoutAgent => Some(StageKind::Search),
            Self::GatekeeperAgent => Some(StageKind::Validation),
            Self::ArchitectAgent => Some(StageKind::Parsing),
            Self::Embedder => Some(StageKind::Embedding),
            Self::Generate => Some(StageKind::Generation),
            _ => None,
        }
    }

    /// States that do work and can therefore miss a heartbeat or hit a
    /// kill switch.
    pub fn is_stage(&self) -> bool {
        self.stage().is_some() || *self == Self::VaultStore
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = CurriculaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CurriculaError::Storage(format!("unknown job state '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// What happened in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Normalized,
    Rejected,
    Resolved,
    NeedsUser,
    UserAnswered,
    Terminated,
    Serve,
    ServeStale,
    NotFound,
    Enqueued,
    Joined,
    CandidatesFound,
    SearchFailedRetry,
    SearchRetriesExhausted,
    Approved,
    Conflicted,
    ValidationFailed,
    ConfidenceSufficient,
    ConfidenceInsufficient,
    Embedded,
    Stored,
    GroundingRejected,
    GenerationApproved,
    GenerationRejected,
    HumanApproved,
    SourceProvided,
    HeartbeatRetry,
    RetriesExhausted,
    KillSwitch,
    Fatal,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalized => "normalized",
            Self::Rejected => "rejected",
            Self::Resolved => "resolved",
            Self::NeedsUser => "needs_user",
            Self::UserAnswered => "user_answered",
            Self::Terminated => "terminated",
            Self::Serve => "serve",
            Self::ServeStale => "serve_stale",
            Self::NotFound => "not_found",
            Self::Enqueued => "enqueued",
            Self::Joined => "joined",
            Self::CandidatesFound => "candidates_found",
            Self::SearchFailedRetry => "search_failed_retry",
            Self::SearchRetriesExhausted => "search_retries_exhausted",
            Self::Approved => "approved",
            Self::Conflicted => "conflicted",
            Self::ValidationFailed => "validation_failed",
            Self::ConfidenceSufficient => "confidence_sufficient",
            Self::ConfidenceInsufficient => "confidence_insufficient",
            Self::Embedded => "embedded",
            Self::Stored => "stored",
            Self::GroundingRejected => "grounding_rejected",
            Self::GenerationApproved => "generation_approved",
            Self::GenerationRejected => "generation_rejected",
            Self::HumanApproved => "human_approved",
            Self::SourceProvided => "source_provided",
            Self::HeartbeatRetry => "heartbeat_retry",
            Self::RetriesExhausted => "retries_exhausted",
            Self::KillSwitch => "kill_switch",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

use Condition as C;
use JobState as S;

/// Fixed (from, condition, to) rows.
const TRANSITIONS: &[(JobState, Condition, JobState)] = &[
    (S::NormalizeRequest, C::Normalized, S::ResolveJurisdiction),
    (S::NormalizeRequest, C::Rejected, S::Failed),
    (S::ResolveJurisdiction, C::Resolved, S::VaultLookup),
    (S::ResolveJurisdiction, C::NeedsUser, S::WaitUser),
    (S::WaitUser, C::UserAnswered, S::ResolveJurisdiction),
    (S::WaitUser, C::Terminated, S::Failed),
    (S::VaultLookup, C::Serve, S::Generate),
    (S::VaultLookup, C::ServeStale, S::Generate),
    (S::VaultLookup, C::NotFound, S::EnqueueColdStart),
    (S::EnqueueColdStart, C::Enqueued, S::ScoutAgent),
    (S::EnqueueColdStart, C::Joined, S::End),
    (S::ScoutAgent, C::CandidatesFound, S::GatekeeperAgent),
    (S::ScoutAgent, C::SearchFailedRetry, S::ScoutAgent),
    (S::ScoutAgent, C::SearchRetriesExhausted, S::HumanAlert),
    (S::GatekeeperAgent, C::Approved, S::ArchitectAgent),
    (S::GatekeeperAgent, C::Conflicted, S::HumanAlert),
    (S::GatekeeperAgent, C::ValidationFailed, S::HumanAlert),
    (S::ArchitectAgent, C::ConfidenceSufficient, S::Embedder),
    (S::ArchitectAgent, C::ConfidenceInsufficient, S::HumanAlert),
    (S::Embedder, C::Embedded, S::VaultStore),
    (S::VaultStore, C::Stored, S::Generate),
    (S::VaultStore, C::GroundingRejected, S::HumanAlert),
    (S::Generate, C::GenerationApproved, S::End),
    (S::Generate, C::GenerationRejected, S::HumanAlert),
    (S::HumanAlert, C::SourceProvided, S::GatekeeperAgent),
    (S::HumanAlert, C::Terminated, S::Failed),
];

/// Compute the next state.
///
/// `resume` is the state recorded when the job entered `HumanAlert`; it is
/// only consulted for [`Condition::HumanApproved`].
pub fn next(from: JobState, condition: Condition, resume: Option<JobState>) -> Result<JobState> {
    let invalid = || CurriculaError::InvalidTransition {
        from: from.as_str().to_string(),
        condition: condition.as_str().to_string(),
    };

    if let Some((_, _, to)) = TRANSITIONS
        .iter()
        .find(|(f, c, _)| *f == from && *c == condition)
    {
        return Ok(*to);
    }

    match condition {
        C::Fatal if !from.is_terminal() => Ok(S::Failed),
        C::HeartbeatRetry if from.is_stage() => Ok(from),
        C::RetriesExhausted if from.is_stage() => Ok(S::Failed),
        C::KillSwitch if from.is_stage() => Ok(S::HumanAlert),
        C::ConfidenceInsufficient if from.is_stage() => Ok(S::HumanAlert),
        C::HumanApproved if from == S::HumanAlert => match resume {
            Some(state) if state.is_stage() => Ok(state),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("Nowhere".parse::<JobState>().is_err());
    }

    #[test]
    fn happy_path_cold_start() {
        let path = [
            (S::NormalizeRequest, C::Normalized, S::ResolveJurisdiction),
            (S::ResolveJurisdiction, C::Resolved, S::VaultLookup),
            (S::VaultLookup, C::NotFound, S::EnqueueColdStart),
            (S::EnqueueColdStart, C::Enqueued, S::ScoutAgent),
            (S::ScoutAgent, C::CandidatesFound, S::GatekeeperAgent),
            (S::GatekeeperAgent, C::Approved, S::ArchitectAgent),
            (S::ArchitectAgent, C::ConfidenceSufficient, S::Embedder),
            (S::Embedder, C::Embedded, S::VaultStore),
            (S::VaultStore, C::Stored, S::Generate),
            (S::Generate, C::GenerationApproved, S::End),
        ];
        for (from, cond, to) in path {
            assert_eq!(next(from, cond, None).unwrap(), to, "{from} --{cond}-->");
        }
    }

    #[test]
    fn conflicted_validation_only_reaches_human_alert() {
        assert_eq!(
            next(S::GatekeeperAgent, C::Conflicted, None).unwrap(),
            S::HumanAlert
        );
        // No row lets a conflict continue to parsing.
        assert!(
            !TRANSITIONS
                .iter()
                .any(|r| *r == (S::GatekeeperAgent, C::Conflicted, S::ArchitectAgent))
        );
    }

    #[test]
    fn undefined_pairs_fail_closed() {
        let err = next(S::VaultLookup, C::Approved, None).unwrap_err();
        assert!(matches!(err, CurriculaError::InvalidTransition { .. }));
        assert!(err.is_fatal());

        assert!(next(S::End, C::Fatal, None).is_err());
        assert!(next(S::WaitUser, C::HeartbeatRetry, None).is_err());
        assert!(next(S::ResolveJurisdiction, C::KillSwitch, None).is_err());
    }

    #[test]
    fn any_stage_rows() {
        for state in [S::ScoutAgent, S::ArchitectAgent, S::VaultStore, S::Generate] {
            assert_eq!(next(state, C::HeartbeatRetry, None).unwrap(), state);
            assert_eq!(next(state, C::RetriesExhausted, None).unwrap(), S::Failed);
            assert_eq!(next(state, C::KillSwitch, None).unwrap(), S::HumanAlert);
            assert_eq!(
                next(state, C::ConfidenceInsufficient, None).unwrap(),
                S::HumanAlert
            );
            assert_eq!(next(state, C::Fatal, None).unwrap(), S::Failed);
        }
        assert_eq!(next(S::WaitUser, C::Fatal, None).unwrap(), S::Failed);
    }

    #[test]
    fn human_approval_resumes_recorded_stage() {
        assert_eq!(
            next(S::HumanAlert, C::HumanApproved, Some(S::Embedder)).unwrap(),
            S::Embedder
        );
        assert!(next(S::HumanAlert, C::HumanApproved, None).is_err());
        assert!(next(S::HumanAlert, C::HumanApproved, Some(S::End)).is_err());
        assert_eq!(
            next(S::HumanAlert, C::SourceProvided, None).unwrap(),
            S::GatekeeperAgent
        );
    }
}

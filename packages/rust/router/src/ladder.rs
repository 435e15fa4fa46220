//! Tier selection on a stage's fallback ladder.
//!
//! Selection is a pure function of the stage's ladder and what happened on
//! previous attempts. Budget and quota adjustments are applied afterwards by
//! [`crate::ModelRouter`].

use std::time::Duration;

use curricula_shared::{FallbackTier, StageKind, StageLadder};
use serde::{Deserialize, Serialize};

/// What previous dispatches of the current stage reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptState {
    /// Failed calls so far for this stage (errors and heartbeat misses).
    pub failures: u32,
    /// Confidence of the last completed call, if any.
    pub last_confidence: Option<f64>,
    /// Wall time already spent on this stage.
    pub elapsed: Duration,
}

/// The router's answer for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDecision {
    pub stage: StageKind,
    pub tier: FallbackTier,
    pub model_id: String,
    pub reason: String,
    /// A projected overspend moved this dispatch down the ladder.
    pub budget_downgraded: bool,
    /// Cost reserved in the monthly ledger before dispatch.
    pub reserved_cost: f64,
    /// Critical stage on tier 2: mechanical extraction only, nothing storable.
    pub extraction_only: bool,
}

/// Tier chosen from attempt history alone, with the reason.
pub fn base_tier(ladder: &StageLadder, attempt: &AttemptState) -> (FallbackTier, String) {
    let timeout = Duration::from_millis(ladder.timeout_ms);
    if attempt.failures >= 2 {
        return (
            FallbackTier::Deterministic,
            format!("{} cumulative failures", attempt.failures),
        );
    }
    if attempt.elapsed > timeout {
        return (
            FallbackTier::Deterministic,
            format!("timeout budget of {}ms exceeded", ladder.timeout_ms),
        );
    }
    if attempt.failures == 1 {
        return (FallbackTier::Escalation, "primary call failed".into());
    }
    match attempt.last_confidence {
        Some(c) if c < ladder.confidence_threshold => (
            FallbackTier::Escalation,
            format!(
                "confidence {c:.2} below {:.2}",
                ladder.confidence_threshold
            ),
        ),
        _ => (FallbackTier::Primary, "primary".into()),
    }
}

/// Model (or rule set) that serves `tier` on this ladder.
pub fn model_for(ladder: &StageLadder, tier: FallbackTier) -> &str {
    match tier {
        FallbackTier::Primary => &ladder.primary,
        FallbackTier::Escalation => &ladder.escalation,
        FallbackTier::Deterministic => &ladder.deterministic,
    }
}

/// Projected cost of one dispatch at `tier`. Tier 2 is free.
pub fn cost_for(ladder: &StageLadder, tier: FallbackTier) -> f64 {
    match tier {
        FallbackTier::Primary => ladder.primary_cost_usd,
        FallbackTier::Escalation => ladder.escalation_cost_usd,
        FallbackTier::Deterministic => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curricula_shared::StageLadders;

    fn parsing() -> StageLadder {
        StageLadders::default().parsing
    }

    #[test]
    fn fresh_attempt_uses_primary() {
        let (tier, _) = base_tier(&parsing(), &AttemptState::default());
        assert_eq!(tier, FallbackTier::Primary);
    }

    #[test]
    fn low_confidence_escalates() {
        let attempt = AttemptState {
            last_confidence: Some(0.6),
            ..Default::default()
        };
        let (tier, reason) = base_tier(&parsing(), &attempt);
        assert_eq!(tier, FallbackTier::Escalation);
        assert!(reason.contains("below"));

        let attempt = AttemptState {
            last_confidence: Some(0.75),
            ..Default::default()
        };
        assert_eq!(base_tier(&parsing(), &attempt).0, FallbackTier::Primary);
    }

    #[test]
    fn one_failure_escalates_two_drop_to_deterministic() {
        let one = AttemptState {
            failures: 1,
            ..Default::default()
        };
        assert_eq!(base_tier(&parsing(), &one).0, FallbackTier::Escalation);

        let two = AttemptState {
            failures: 2,
            ..Default::default()
        };
        assert_eq!(base_tier(&parsing(), &two).0, FallbackTier::Deterministic);
    }

    #[test]
    fn exceeded_timeout_drops_to_deterministic() {
        let mut ladder = parsing();
        ladder.timeout_ms = 100;
        let attempt = AttemptState {
            elapsed: Duration::from_millis(101),
            ..Default::default()
        };
        let (tier, reason) = base_tier(&ladder, &attempt);
        assert_eq!(tier, FallbackTier::Deterministic);
        assert!(reason.contains("timeout"));
    }

    #[test]
    fn deterministic_tier_is_free() {
        let ladder = parsing();
        assert_eq!(cost_for(&ladder, FallbackTier::Deterministic), 0.0);
        assert_eq!(model_for(&ladder, FallbackTier::Deterministic), "mechanical-extract");
        assert_eq!(model_for(&ladder, FallbackTier::Escalation), ladder.escalation);
    }
}

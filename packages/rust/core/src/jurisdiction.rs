//! Jurisdiction ambiguity scoring and resolution.
//!
//! The score is a capped sum of weighted signals. Below the silent-assume
//! threshold national is assumed; between the thresholds the caller is
//! asked one fixed two-option question; above the require-explicit
//! threshold the caller must name the jurisdiction.
//!
//! Weights are kept in integer hundredths so the band edges are exact.

use curricula_shared::{
    AssumptionType, CountryProfile, JurisdictionChoice, JurisdictionLevel,
    JurisdictionResolution, NormalizedRequest, Result, ThresholdsConfig,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalizer::grade_term;

const WEIGHT_MULTIPLE_CURRICULA: u32 = 40;
const WEIGHT_SUBNATIONAL_SUBJECT: u32 = 30;
const WEIGHT_MULTIPLE_CACHED: u32 = 20;
const WEIGHT_GRADE_CONFLICT: u32 = 10;

/// Signals feeding the ambiguity score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguitySignals {
    /// More than one curriculum is in force for the country.
    pub multiple_curricula: bool,
    /// The subject is managed below national level.
    pub subnational_subject: bool,
    /// The vault holds more than one jurisdiction for this grade and subject.
    pub multiple_cached: bool,
    /// The request's grade term is not one the country uses.
    pub grade_naming_conflict: bool,
}

impl AmbiguitySignals {
    pub fn gather(
        profile: Option<&CountryProfile>,
        request: &NormalizedRequest,
        cached_jurisdictions: usize,
    ) -> Self {
        let term = grade_term(&request.grade);
        Self {
            multiple_curricula: profile.is_some_and(|p| p.multiple_curricula),
            subnational_subject: profile.is_some_and(|p| p.subject_is_subnational(&request.subject)),
            multiple_cached: cached_jurisdictions > 1,
            grade_naming_conflict: profile
                .is_some_and(|p| !p.grade_terms.is_empty() && !p.grade_terms.iter().any(|t| t == term)),
        }
    }

    /// Score in hundredths, capped at 100.
    pub fn score_hundredths(&self) -> u32 {
        let mut total = 0;
        if self.multiple_curricula {
            total += WEIGHT_MULTIPLE_CURRICULA;
        }
        if self.subnational_subject {
            total += WEIGHT_SUBNATIONAL_SUBJECT;
        }
        if self.multiple_cached {
            total += WEIGHT_MULTIPLE_CACHED;
        }
        if self.grade_naming_conflict {
            total += WEIGHT_GRADE_CONFLICT;
        }
        total.min(100)
    }

    pub fn score(&self) -> f64 {
        f64::from(self.score_hundredths()) / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityAction {
    AssumeNational,
    AskOnce,
    RequireExplicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    /// National curriculum or a state/county one?
    Scope,
    /// Follow-up after choosing state or county without naming it.
    WhichSubnational { level: JurisdictionLevel },
    /// Ambiguity too high to offer a default.
    ExplicitRequired,
}

/// The single question a suspended job is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<String>,
}

impl Question {
    pub fn scope(country: &str) -> Self {
        Self {
            kind: QuestionKind::Scope,
            prompt: format!(
                "Which curriculum should be used for {country}: the national curriculum, \
                 or a state/county curriculum?"
            ),
            options: vec!["national".into(), "state/county".into()],
        }
    }

    pub fn which(level: JurisdictionLevel) -> Self {
        Self {
            kind: QuestionKind::WhichSubnational { level },
            prompt: format!("Which {}?", level.as_str()),
            options: Vec::new(),
        }
    }

    pub fn explicit(country: &str) -> Self {
        Self {
            kind: QuestionKind::ExplicitRequired,
            prompt: format!(
                "Curricula in {country} vary by jurisdiction for this request. \
                 Name the jurisdiction explicitly (national, state:<name> or county:<name>)."
            ),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved(JurisdictionResolution),
    /// Exactly one question for the caller.
    Ask(Question),
}

/// Turns signals and caller input into a resolution or one question.
#[derive(Debug, Clone, Copy)]
pub struct JurisdictionResolver {
    silent_assume: f64,
    require_explicit: f64,
    confidence_threshold: f64,
}

impl JurisdictionResolver {
    pub fn new(thresholds: &ThresholdsConfig) -> Self {
        Self {
            silent_assume: thresholds.silent_assume,
            require_explicit: thresholds.require_explicit,
            confidence_threshold: thresholds.jurisdiction_confidence,
        }
    }

    pub fn silent_assume(&self) -> f64 {
        self.silent_assume
    }

    pub fn action(&self, score: f64) -> AmbiguityAction {
        if score < self.silent_assume {
            AmbiguityAction::AssumeNational
        } else if score <= self.require_explicit {
            AmbiguityAction::AskOnce
        } else {
            AmbiguityAction::RequireExplicit
        }
    }

    /// Whether a resolution is confident enough to proceed to the vault.
    pub fn is_confident(&self, resolution: &JurisdictionResolution) -> bool {
        resolution.confidence >= self.confidence_threshold
    }

    /// Resolve from the caller's explicit choice, a user's answer, or the
    /// signals alone. Any returned resolution has passed `validate`.
    pub fn resolve(
        &self,
        country: &str,
        signals: &AmbiguitySignals,
        explicit: Option<&JurisdictionChoice>,
        answer: Option<&JurisdictionChoice>,
    ) -> Result<ResolveOutcome> {
        let score = signals.score();

        let outcome = if let Some(choice) = explicit {
            from_choice(choice, score, AssumptionType::Explicit)
        } else if let Some(choice) = answer {
            from_choice(choice, score, AssumptionType::UserConfirmed)
        } else {
            match self.action(score) {
                AmbiguityAction::AssumeNational => ResolveOutcome::Resolved(JurisdictionResolution {
                    level: JurisdictionLevel::National,
                    name: None,
                    parent_id: None,
                    ambiguity_score: score,
                    assumption_type: AssumptionType::Assumed,
                    confidence: 1.0 - score,
                }),
                AmbiguityAction::AskOnce => ResolveOutcome::Ask(Question::scope(country)),
                AmbiguityAction::RequireExplicit => {
                    ResolveOutcome::Ask(Question::explicit(country))
                }
            }
        };

        if let ResolveOutcome::Resolved(resolution) = &outcome {
            resolution.validate(self.silent_assume)?;
            debug!(
                key = %resolution.key(),
                score,
                assumption = ?resolution.assumption_type,
                "jurisdiction resolved"
            );
        }
        Ok(outcome)
    }
}

fn from_choice(
    choice: &JurisdictionChoice,
    score: f64,
    assumption_type: AssumptionType,
) -> ResolveOutcome {
    let name = choice
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    match (choice.level, name) {
        (JurisdictionLevel::National, _) => ResolveOutcome::Resolved(JurisdictionResolution {
            level: JurisdictionLevel::National,
            name: None,
            parent_id: None,
            ambiguity_score: score,
            assumption_type,
            confidence: 1.0,
        }),
        (level, None) => ResolveOutcome::Ask(Question::which(level)),
        (level, Some(name)) => {
            let parent = match level {
                JurisdictionLevel::County => choice
                    .parent
                    .clone()
                    .unwrap_or_else(|| "national".to_string()),
                _ => "national".to_string(),
            };
            ResolveOutcome::Resolved(JurisdictionResolution {
                level,
                name: Some(name.to_string()),
                parent_id: Some(parent),
                ambiguity_score: score,
                assumption_type,
                confidence: 1.0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curricula_shared::AppConfig;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn resolver() -> JurisdictionResolver {
        JurisdictionResolver::new(&ThresholdsConfig::default())
    }

    fn request(grade: &str, subject: &str) -> NormalizedRequest {
        NormalizedRequest {
            request_id: Uuid::now_v7(),
            raw_prompt: String::new(),
            country: "united states".into(),
            country_code: "US".into(),
            grade: grade.into(),
            subject: subject.into(),
            language: "en".into(),
            confidence: 1.0,
        }
    }

    fn signals(a: bool, b: bool, c: bool, d: bool) -> AmbiguitySignals {
        AmbiguitySignals {
            multiple_curricula: a,
            subnational_subject: b,
            multiple_cached: c,
            grade_naming_conflict: d,
        }
    }

    #[test]
    fn weights_sum_exactly() {
        assert_eq!(signals(true, false, false, false).score_hundredths(), 40);
        assert_eq!(signals(true, true, false, false).score_hundredths(), 70);
        assert_eq!(signals(true, true, true, true).score(), 1.0);
        assert_eq!(signals(false, false, false, false).score(), 0.0);
    }

    #[test]
    fn action_bands() {
        let r = resolver();
        assert_eq!(r.action(0.3), AmbiguityAction::AssumeNational);
        assert_eq!(r.action(0.4), AmbiguityAction::AskOnce);
        assert_eq!(r.action(0.7), AmbiguityAction::AskOnce);
        assert_eq!(r.action(0.8), AmbiguityAction::RequireExplicit);
    }

    #[test]
    fn gather_reads_country_profile() {
        let config = AppConfig::default();
        let us = config.country("US");
        let s = AmbiguitySignals::gather(us, &request("grade 7", "biology"), 0);
        assert!(s.multiple_curricula);
        assert!(s.subnational_subject);
        assert!(!s.multiple_cached);
        assert!(!s.grade_naming_conflict);
        assert_eq!(s.score_hundredths(), 70);

        let ng = config.country("NG");
        let s = AmbiguitySignals::gather(ng, &request("form 2", "chemistry"), 2);
        assert!(s.grade_naming_conflict);
        assert!(s.multiple_cached);
        assert_eq!(s.score_hundredths(), 30);
    }

    #[test]
    fn low_score_assumes_national_silently() {
        let out = resolver()
            .resolve("nigeria", &signals(false, false, true, true), None, None)
            .unwrap();
        let ResolveOutcome::Resolved(r) = out else {
            panic!("expected a resolution");
        };
        assert_eq!(r.assumption_type, AssumptionType::Assumed);
        assert!((r.confidence - 0.7).abs() < 1e-9);
        assert_eq!(r.key(), "national");
    }

    #[test]
    fn middle_band_asks_one_scope_question() {
        let out = resolver()
            .resolve("kenya", &signals(true, false, false, false), None, None)
            .unwrap();
        let ResolveOutcome::Ask(q) = out else {
            panic!("expected a question");
        };
        assert_eq!(q.kind, QuestionKind::Scope);
        assert_eq!(q.options, vec!["national", "state/county"]);
    }

    #[test]
    fn high_band_requires_explicit() {
        let out = resolver()
            .resolve("united states", &signals(true, true, true, false), None, None)
            .unwrap();
        assert!(matches!(
            out,
            ResolveOutcome::Ask(Question {
                kind: QuestionKind::ExplicitRequired,
                ..
            })
        ));
    }

    #[test]
    fn unnamed_state_answer_asks_follow_up() {
        let answer = JurisdictionChoice {
            level: JurisdictionLevel::State,
            name: None,
            parent: None,
        };
        let out = resolver()
            .resolve("kenya", &signals(true, false, false, false), None, Some(&answer))
            .unwrap();
        assert_eq!(out, ResolveOutcome::Ask(Question::which(JurisdictionLevel::State)));
    }

    #[test]
    fn named_answer_is_user_confirmed() {
        let answer = JurisdictionChoice {
            level: JurisdictionLevel::State,
            name: Some("Texas".into()),
            parent: None,
        };
        let out = resolver()
            .resolve("united states", &signals(true, true, false, false), None, Some(&answer))
            .unwrap();
        let ResolveOutcome::Resolved(r) = out else {
            panic!("expected a resolution");
        };
        assert_eq!(r.assumption_type, AssumptionType::UserConfirmed);
        assert_eq!(r.key(), "state:texas");
        assert_eq!(r.parent_id.as_deref(), Some("national"));
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn explicit_choice_skips_question() {
        let out = resolver()
            .resolve(
                "united states",
                &signals(true, true, true, true),
                Some(&JurisdictionChoice::national()),
                None,
            )
            .unwrap();
        let ResolveOutcome::Resolved(r) = out else {
            panic!("expected a resolution");
        };
        assert_eq!(r.assumption_type, AssumptionType::Explicit);
        assert_eq!(r.ambiguity_score, 1.0);
    }

    proptest! {
        #[test]
        fn score_bounded_and_assumption_consistent(
            a in any::<bool>(),
            b in any::<bool>(),
            c in any::<bool>(),
            d in any::<bool>(),
        ) {
            let s = signals(a, b, c, d);
            let score = s.score();
            prop_assert!((0.0..=1.0).contains(&score));

            let r = resolver();
            if let ResolveOutcome::Resolved(res) = r.resolve("x", &s, None, None).unwrap() {
                prop_assert_eq!(res.assumption_type, AssumptionType::Assumed);
                prop_assert!(res.ambiguity_score <= r.silent_assume());
                prop_assert!(r.is_confident(&res));
            }
        }
    }
}

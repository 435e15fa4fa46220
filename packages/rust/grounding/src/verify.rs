//! Phase 3: all-or-nothing verification of a candidate replica.
//!
//! A candidate is approved only if every competency passes the schema
//! check, cites at least one known chunk, and reaches the similarity
//! threshold against its best cited chunk, and the forbidden-pattern scan
//! finds nothing. Anything less discards the whole candidate.

use std::collections::HashMap;

use curricula_shared::{Competency, GroundingConfig, SourceChunk, ThresholdsConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::normalize::check_schema;
use crate::patterns::{ForbiddenPattern, ScanContext, scan};
use crate::similarity::{SimilarityScorer, best_chunk_score};

/// Per-competency verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencyCheck {
    pub competency_id: String,
    pub grounded: bool,
    pub best_similarity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingReport {
    pub total: usize,
    pub grounded: usize,
    pub checks: Vec<CompetencyCheck>,
    pub patterns: Vec<ForbiddenPattern>,
    /// grounded / total, 0.0 for an empty candidate.
    pub aggregate_confidence: f64,
    pub approved: bool,
}

impl GroundingReport {
    /// Human-readable reasons the candidate was discarded.
    pub fn rejection_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if self.total == 0 {
            reasons.push("no competencies to verify".to_string());
        }
        for check in self.checks.iter().filter(|c| !c.grounded) {
            reasons.push(format!(
                "{}: {}",
                check.competency_id,
                check.failure.as_deref().unwrap_or("ungrounded")
            ));
        }
        for pattern in &self.patterns {
            reasons.push(format!("forbidden pattern: {pattern:?}"));
        }
        reasons
    }
}

/// Thresholds and word lists the verifier applies.
#[derive(Debug, Clone)]
pub struct GroundingPolicy {
    pub similarity_threshold: f64,
    pub max_abstraction_level: u8,
    pub pedagogical_phrases: Vec<String>,
    pub deprecated_topics: Vec<String>,
}

impl GroundingPolicy {
    pub fn from_config(thresholds: &ThresholdsConfig, grounding: &GroundingConfig) -> Self {
        Self {
            similarity_threshold: thresholds.similarity,
            max_abstraction_level: thresholds.max_abstraction_level,
            pedagogical_phrases: grounding.pedagogical_phrases.clone(),
            deprecated_topics: grounding.deprecated_topics.clone(),
        }
    }
}

pub struct GroundingVerifier {
    scorer: Box<dyn SimilarityScorer>,
    policy: GroundingPolicy,
}

impl GroundingVerifier {
    pub fn new(scorer: Box<dyn SimilarityScorer>, policy: GroundingPolicy) -> Self {
        Self { scorer, policy }
    }

    pub fn policy(&self) -> &GroundingPolicy {
        &self.policy
    }

    /// Verify a candidate replica against its source chunks.
    ///
    /// `extra_deprecated` carries topics reported by source validation for
    /// this job, on top of the configured list.
    pub fn verify(
        &self,
        competencies: &[Competency],
        chunks: &[SourceChunk],
        grade: &str,
        extra_deprecated: &[String],
    ) -> GroundingReport {
        let by_id: HashMap<&str, &SourceChunk> =
            chunks.iter().map(|c| (c.id.as_str(), c)).collect();

        let checks: Vec<CompetencyCheck> = competencies
            .iter()
            .map(|c| self.check_one(c, &by_id))
            .collect();

        let mut deprecated = self.policy.deprecated_topics.clone();
        deprecated.extend(extra_deprecated.iter().cloned());
        let patterns = scan(
            competencies,
            chunks,
            &ScanContext {
                grade,
                pedagogical_phrases: &self.policy.pedagogical_phrases,
                deprecated_topics: &deprecated,
            },
        );

        let total = checks.len();
        let grounded = checks.iter().filter(|c| c.grounded).count();
        let aggregate_confidence = if total == 0 {
            0.0
        } else {
            grounded as f64 / total as f64
        };
        let approved = total > 0
            && grounded == total
            && patterns.is_empty()
            && aggregate_confidence == 1.0;

        let report = GroundingReport {
            total,
            grounded,
            checks,
            patterns,
            aggregate_confidence,
            approved,
        };

        if report.approved {
            info!(total, scorer = self.scorer.name(), "candidate grounded");
        } else {
            warn!(
                total,
                grounded,
                patterns = report.patterns.len(),
                "candidate discarded by grounding verification"
            );
        }
        report
    }

    fn check_one(
        &self,
        competency: &Competency,
        by_id: &HashMap<&str, &SourceChunk>,
    ) -> CompetencyCheck {
        let fail = |best: f64, why: String| CompetencyCheck {
            competency_id: competency.id.clone(),
            grounded: false,
            best_similarity: best,
            failure: Some(why),
        };

        if let Err(e) = check_schema(competency, self.policy.max_abstraction_level) {
            return fail(0.0, e.to_string());
        }
        if competency.source_chunk_ids.is_empty() {
            return fail(0.0, "no source citation".into());
        }

        let text = format!(
            "{} {}",
            competency.description,
            competency.learning_outcomes.join(" ")
        );
        let mut cited_any = false;
        let mut best = 0.0_f64;
        for id in &competency.source_chunk_ids {
            if let Some(chunk) = by_id.get(id.as_str()) {
                cited_any = true;
                best = best.max(best_chunk_score(self.scorer.as_ref(), &text, &chunk.text));
            }
        }

        if !cited_any {
            return fail(0.0, "cites no known source chunk".into());
        }
        if best < self.policy.similarity_threshold {
            return fail(
                best,
                format!(
                    "similarity {best:.2} below {:.2}",
                    self.policy.similarity_threshold
                ),
            );
        }
        CompetencyCheck {
            competency_id: competency.id.clone(),
            grounded: true,
            best_similarity: best,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::LexicalCosine;
    use curricula_shared::ChunkKind;

    fn verifier() -> GroundingVerifier {
        GroundingVerifier::new(
            Box::new(LexicalCosine),
            GroundingPolicy::from_config(&ThresholdsConfig::default(), &GroundingConfig::default()),
        )
    }

    fn chunk(id: &str, text: &str) -> SourceChunk {
        SourceChunk {
            id: id.into(),
            text: text.into(),
            kind: ChunkKind::Text,
            page: None,
            confidence: 0.95,
        }
    }

    fn comp(id: &str, text: &str, cites: &str) -> Competency {
        Competency {
            id: id.into(),
            title: text.into(),
            description: text.into(),
            learning_outcomes: vec![text.into()],
            grade: None,
            abstraction_level: 0,
            confidence: 0.9,
            source_chunk_ids: vec![cites.into()],
        }
    }

    fn ten_topics() -> (Vec<SourceChunk>, Vec<Competency>) {
        let topics = [
            "Identify the parts of a cell",
            "Describe the process of photosynthesis",
            "Classify living organisms",
            "Explain respiration in plants",
            "Describe the human digestive system",
            "Explain food chains",
            "Measure the mass of objects",
            "Describe diffusion across membranes",
            "Name the planets of the solar system",
            "Explain the water cycle",
        ];
        let chunks = topics
            .iter()
            .enumerate()
            .map(|(i, t)| chunk(&format!("k{i}"), t))
            .collect();
        let comps = topics
            .iter()
            .enumerate()
            .map(|(i, t)| comp(&format!("c{i}"), t, &format!("k{i}")))
            .collect();
        (chunks, comps)
    }

    #[test]
    fn fully_grounded_candidate_is_approved() {
        let (chunks, comps) = ten_topics();
        let report = verifier().verify(&comps, &chunks, "jss 1", &[]);
        assert!(report.approved, "{:?}", report.rejection_reasons());
        assert_eq!(report.aggregate_confidence, 1.0);
    }

    #[test]
    fn nine_of_ten_grounded_is_discarded() {
        let (chunks, mut comps) = ten_topics();
        comps[9].description = "Design a rocket propulsion system".into();
        comps[9].learning_outcomes = vec!["Design a rocket propulsion system".into()];
        comps[9].title = "Rocketry".into();

        let report = verifier().verify(&comps, &chunks, "jss 1", &[]);
        assert!(!report.approved);
        assert_eq!(report.grounded, 9);
        assert!((report.aggregate_confidence - 0.9).abs() < 1e-9);
        assert_eq!(report.rejection_reasons().len(), 1);
    }

    #[test]
    fn unknown_citation_is_ungrounded() {
        let (chunks, mut comps) = ten_topics();
        comps[0].source_chunk_ids = vec!["missing".into()];
        let report = verifier().verify(&comps, &chunks, "jss 1", &[]);
        assert!(!report.approved);
        assert_eq!(
            report.checks[0].failure.as_deref(),
            Some("cites no known source chunk")
        );
    }

    #[test]
    fn empty_candidate_is_discarded() {
        let report = verifier().verify(&[], &[chunk("k0", "text")], "jss 1", &[]);
        assert!(!report.approved);
        assert_eq!(report.aggregate_confidence, 0.0);
    }

    #[test]
    fn forbidden_pattern_alone_discards() {
        let (chunks, comps) = ten_topics();
        let report = verifier().verify(&comps, &chunks, "jss 1", &["water cycle".into()]);
        assert_eq!(report.grounded, 10);
        assert!(!report.approved);
        assert_eq!(report.patterns.len(), 1);
    }

    #[test]
    fn over_abstracted_competency_fails_schema() {
        let (chunks, mut comps) = ten_topics();
        comps[3].abstraction_level = 3;
        let report = verifier().verify(&comps, &chunks, "jss 1", &[]);
        assert!(!report.approved);
        assert!(
            report.checks[3]
                .failure
                .as_deref()
                .unwrap_or_default()
                .contains("abstraction")
        );
    }
}

//! Generation gate: coverage and citation checks on generated content.
//!
//! The two gates are independent. Coverage below the threshold rejects
//! regardless of citations, and a paragraph without a citation rejects
//! regardless of coverage.

use std::collections::BTreeSet;

use curricula_shared::{
    GenerationKind, GenerationOutput, GenerationParagraph, GenerationStatus, StageMeta,
};

#[derive(Debug, Clone, Copy)]
pub struct GenerationGate {
    pub coverage_threshold: f64,
}

impl GenerationGate {
    pub fn new(coverage_threshold: f64) -> Self {
        Self { coverage_threshold }
    }

    /// Reasons to reject content with this coverage and these paragraphs.
    /// `known` lists the competency ids a citation may point at.
    pub fn rejection_reasons(
        &self,
        coverage: f64,
        paragraphs: &[GenerationParagraph],
        known: &[String],
    ) -> Vec<String> {
        let mut reasons = Vec::new();
        if coverage < self.coverage_threshold {
            reasons.push(format!(
                "coverage {coverage:.2} below {:.2}",
                self.coverage_threshold
            ));
        }
        if paragraphs.is_empty() {
            reasons.push("no paragraphs".to_string());
        }
        for (i, p) in paragraphs.iter().enumerate() {
            if !p.citations.iter().any(|c| known.contains(c)) {
                reasons.push(format!("paragraph {} has no citation", i + 1));
            }
        }
        reasons
    }

    /// Fraction of `requested` competency ids cited by at least one paragraph.
    pub fn coverage(paragraphs: &[GenerationParagraph], requested: &[String]) -> f64 {
        if requested.is_empty() {
            return 0.0;
        }
        let cited: BTreeSet<&String> = paragraphs.iter().flat_map(|p| &p.citations).collect();
        let covered = requested.iter().filter(|id| cited.contains(id)).count();
        covered as f64 / requested.len() as f64
    }

    /// Compute coverage and citations, then gate.
    pub fn evaluate(
        &self,
        kind: GenerationKind,
        paragraphs: Vec<GenerationParagraph>,
        requested: &[String],
        meta: StageMeta,
    ) -> GenerationOutput {
        let coverage = Self::coverage(&paragraphs, requested);
        let citations: Vec<String> = paragraphs
            .iter()
            .flat_map(|p| p.citations.iter())
            .filter(|c| requested.contains(c))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .cloned()
            .collect();
        let rejection_reasons = self.rejection_reasons(coverage, &paragraphs, requested);
        let status = if rejection_reasons.is_empty() {
            GenerationStatus::Approved
        } else {
            GenerationStatus::Rejected
        };

        GenerationOutput {
            kind,
            paragraphs,
            citations,
            coverage,
            status,
            rejection_reasons,
            meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curricula_shared::FallbackTier;

    fn para(text: &str, cites: &[&str]) -> GenerationParagraph {
        GenerationParagraph {
            text: text.into(),
            citations: cites.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{i}")).collect()
    }

    fn meta() -> StageMeta {
        StageMeta {
            tier: FallbackTier::Primary,
            confidence: 0.9,
            model_id: "m".into(),
        }
    }

    #[test]
    fn coverage_below_threshold_rejects_regardless_of_citations() {
        let gate = GenerationGate::new(0.8);
        let paragraphs = vec![para("a", &["c0", "c1"]), para("b", &["c2"])];
        let reasons = gate.rejection_reasons(0.79, &paragraphs, &ids(3));
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("coverage"));
    }

    #[test]
    fn threshold_coverage_without_citations_rejects() {
        let gate = GenerationGate::new(0.8);
        let paragraphs = vec![para("a", &[]), para("b", &[])];
        let reasons = gate.rejection_reasons(0.80, &paragraphs, &ids(5));
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().all(|r| r.contains("no citation")));
    }

    #[test]
    fn citation_to_unknown_id_does_not_count() {
        let gate = GenerationGate::new(0.8);
        let out = gate.evaluate(
            GenerationKind::Summary,
            vec![para("a", &["c0", "c1", "c2", "c3"]), para("b", &["ghost"])],
            &ids(4),
            meta(),
        );
        assert_eq!(out.coverage, 1.0);
        assert_eq!(out.status, GenerationStatus::Rejected);
        assert_eq!(out.citations.len(), 4);
    }

    #[test]
    fn covered_and_cited_content_is_approved() {
        let gate = GenerationGate::new(0.8);
        let out = gate.evaluate(
            GenerationKind::Quiz,
            vec![para("q1", &["c0", "c1"]), para("q2", &["c2", "c3"])],
            &ids(5),
            meta(),
        );
        assert!((out.coverage - 0.8).abs() < 1e-9);
        assert_eq!(out.status, GenerationStatus::Approved);
        assert!(out.rejection_reasons.is_empty());
    }

    #[test]
    fn empty_output_is_rejected() {
        let out = GenerationGate::new(0.8).evaluate(GenerationKind::Summary, vec![], &ids(2), meta());
        assert_eq!(out.status, GenerationStatus::Rejected);
        assert_eq!(out.coverage, 0.0);
    }
}

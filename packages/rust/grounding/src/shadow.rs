//! Shadow comparison between a primary output and a high-accuracy rerun.
//!
//! Results are for offline review and floor escalation only. Nothing here
//! feeds back into the job that produced the primary output.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use curricula_shared::{Competency, GenerationOutput};
use serde::{Deserialize, Serialize};

use crate::patterns::normalize_text;

/// The parts of an output the diff looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowView {
    /// Ordered topic keys.
    pub topics: Vec<String>,
    /// Secondary size measure (outcomes or citations).
    pub detail_count: usize,
}

impl ShadowView {
    pub fn from_competencies(competencies: &[Competency]) -> Self {
        Self {
            topics: competencies.iter().map(|c| normalize_text(&c.title)).collect(),
            detail_count: competencies.iter().map(|c| c.learning_outcomes.len()).sum(),
        }
    }

    pub fn from_generation(output: &GenerationOutput) -> Self {
        let mut topics = Vec::new();
        for id in output.paragraphs.iter().flat_map(|p| &p.citations) {
            if !topics.contains(id) {
                topics.push(id.clone());
            }
        }
        Self {
            topics,
            detail_count: output.paragraphs.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowDiff {
    /// Jaccard index of the topic sets.
    pub topic_overlap: f64,
    /// Mean of count ratio, detail ratio and ordering agreement.
    pub structural_similarity: f64,
    pub drift: f64,
}

pub fn compare(primary: &ShadowView, shadow: &ShadowView) -> ShadowDiff {
    let p: BTreeSet<&String> = primary.topics.iter().collect();
    let s: BTreeSet<&String> = shadow.topics.iter().collect();
    let union = p.union(&s).count();
    let topic_overlap = if union == 0 {
        1.0
    } else {
        p.intersection(&s).count() as f64 / union as f64
    };

    let count_ratio = ratio(primary.topics.len(), shadow.topics.len());
    let detail_ratio = ratio(primary.detail_count, shadow.detail_count);
    let ordering = 1.0 - kendall_distance(&primary.topics, &shadow.topics);
    let structural_similarity = (count_ratio + detail_ratio + ordering) / 3.0;

    ShadowDiff {
        topic_overlap,
        structural_similarity,
        drift: 1.0 - (topic_overlap + structural_similarity) / 2.0,
    }
}

fn ratio(a: usize, b: usize) -> f64 {
    match a.max(b) {
        0 => 1.0,
        max => a.min(b) as f64 / max as f64,
    }
}

/// Fraction of discordant pairs among topics present in both orders.
fn kendall_distance(primary: &[String], shadow: &[String]) -> f64 {
    let shared: Vec<usize> = primary
        .iter()
        .filter_map(|t| shadow.iter().position(|x| x == t))
        .collect();
    let n = shared.len();
    if n < 2 {
        return 0.0;
    }
    let mut discordant = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            if shared[i] > shared[j] {
                discordant += 1;
            }
        }
    }
    discordant as f64 / (n * (n - 1) / 2) as f64
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Stops shadow runs after repeated failures, then retries after a cooldown.
#[derive(Debug)]
pub struct ShadowBreaker {
    failure_threshold: u32,
    recovery: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl ShadowBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a shadow run may start now.
    pub fn allow(&mut self) -> bool {
        match self.opened_at {
            None => true,
            Some(at) if at.elapsed() >= self.recovery => {
                // Half-open: one trial run.
                self.opened_at = None;
                self.consecutive_failures = self.failure_threshold - 1;
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            tracing::warn!(
                failures = self.consecutive_failures,
                "shadow circuit opened"
            );
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

//! Forbidden-pattern scan over a candidate competency set.
//!
//! A pattern is only forbidden when the source material does not itself
//! contain it: a composite topic or a recommendation copied verbatim from
//! the official document is grounded, not invented.

use std::sync::LazyLock;

use curricula_shared::{Competency, SourceChunk};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForbiddenPattern {
    /// Two topics merged into one competency that the source never merges.
    CompositeTopic { competency_id: String, title: String },
    /// Mentions a grade other than the requested one.
    CrossGrade {
        competency_id: String,
        mentioned: String,
    },
    /// Added teaching advice that the source does not contain.
    PedagogicalRecommendation {
        competency_id: String,
        phrase: String,
    },
    /// A topic the authority has retired.
    DeprecatedTopic { competency_id: String, topic: String },
}

/// What the scan needs to know besides the candidates.
#[derive(Debug, Clone, Default)]
pub struct ScanContext<'a> {
    /// Requested grade, normalized (e.g. `jss 1`, `grade 7`).
    pub grade: &'a str,
    pub pedagogical_phrases: &'a [String],
    pub deprecated_topics: &'a [String],
}

static CONJUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s(?:and|&)\s|\s*/\s*").expect("valid regex")
});

static GRADE_MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(grade|year|jss|ss|form|primary|class)\s*(\d{1,2})\b").expect("valid regex")
});

/// Collapse whitespace and case for substring comparisons.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Scan every competency and return all patterns found.
pub fn scan(
    competencies: &[Competency],
    chunks: &[SourceChunk],
    ctx: &ScanContext<'_>,
) -> Vec<ForbiddenPattern> {
    let source = normalize_text(
        &chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    );
    let requested = normalize_grade(ctx.grade);

    let mut found = Vec::new();
    for c in competencies {
        let body = normalize_text(&format!(
            "{} {} {}",
            c.title,
            c.description,
            c.learning_outcomes.join(" ")
        ));

        let title = normalize_text(&c.title);
        if CONJUNCTION_RE.is_match(&c.title) && !source.contains(&title) {
            found.push(ForbiddenPattern::CompositeTopic {
                competency_id: c.id.clone(),
                title: c.title.clone(),
            });
        }

        if let Some(grade) = &c.grade {
            if !requested.is_empty() && normalize_grade(grade) != requested {
                found.push(ForbiddenPattern::CrossGrade {
                    competency_id: c.id.clone(),
                    mentioned: grade.clone(),
                });
            }
        }
        for caps in GRADE_MENTION_RE.captures_iter(&body) {
            let mention = format!("{} {}", caps[1].to_lowercase(), &caps[2]);
            let pattern = ForbiddenPattern::CrossGrade {
                competency_id: c.id.clone(),
                mentioned: mention.clone(),
            };
            if !requested.is_empty()
                && mention != requested
                && !source.contains(&mention)
                && !found.contains(&pattern)
            {
                found.push(pattern);
            }
        }

        for phrase in ctx.pedagogical_phrases {
            let phrase = normalize_text(phrase);
            if !phrase.is_empty() && body.contains(&phrase) && !source.contains(&phrase) {
                found.push(ForbiddenPattern::PedagogicalRecommendation {
                    competency_id: c.id.clone(),
                    phrase,
                });
            }
        }

        for topic in ctx.deprecated_topics {
            let topic = normalize_text(topic);
            if !topic.is_empty() && body.contains(&topic) {
                found.push(ForbiddenPattern::DeprecatedTopic {
                    competency_id: c.id.clone(),
                    topic,
                });
            }
        }
    }

    found
}

/// `Grade 7`, `grade7` and `GRADE  7` all become `grade 7`.
fn normalize_grade(grade: &str) -> String {
    match GRADE_MENTION_RE.captures(grade) {
        Some(caps) => format!("{} {}", caps[1].to_lowercase(), &caps[2]),
        None => normalize_text(grade),
    }
}

//! Request normalization: free-form prompt to a canonical
//! (country, grade, subject, language) tuple.
//!
//! Normalization is rule-based. Each component carries its own match
//! confidence and the request confidence is their product, so a missing
//! component always rejects.

use std::sync::LazyLock;

use curricula_shared::{AppConfig, CountryProfile, CurriculaError, NormalizedRequest, Result};
use regex::Regex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// `grade 7`, `jss 1`, `year 10`, `key stage 3`, `form 2` ...
static GRADE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(grade|year|form|class|primary|basic|jss|sss|ss|jhs|shs|key stage)\s*-?\s*(\d{1,2})\b",
    )
    .expect("valid regex")
});

/// `7th grade`, `10th-grade`
static ORDINAL_GRADE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?:st|nd|rd|th)[\s-]+grade\b").expect("valid regex")
});

static LANGUAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\bin (english|french|spanish|portuguese|swahili|arabic|hausa|yoruba|igbo|afrikaans|zulu)\b",
    )
    .expect("valid regex")
});

/// Canonical subject and the phrases that name it. Longer phrases first.
const SUBJECTS: &[(&str, &[&str])] = &[
    ("basic science", &["basic science", "integrated science"]),
    ("computer science", &["computer science", "computing", "ict"]),
    ("social studies", &["social studies"]),
    ("mathematics", &["mathematics", "maths", "math"]),
    ("english", &["english language", "english", "literacy"]),
    ("biology", &["biology"]),
    ("chemistry", &["chemistry"]),
    ("physics", &["physics"]),
    ("geography", &["geography"]),
    ("history", &["history"]),
    ("economics", &["economics"]),
    ("agriculture", &["agricultural science", "agriculture"]),
    ("science", &["science"]),
];

const LANGUAGES: &[(&str, &str)] = &[
    ("english", "en"),
    ("french", "fr"),
    ("spanish", "es"),
    ("portuguese", "pt"),
    ("swahili", "sw"),
    ("arabic", "ar"),
    ("hausa", "ha"),
    ("yoruba", "yo"),
    ("igbo", "ig"),
    ("afrikaans", "af"),
    ("zulu", "zu"),
];

/// Rule-based request normalizer.
#[derive(Debug, Clone)]
pub struct Normalizer {
    countries: Vec<CountryProfile>,
    default_language: String,
    threshold: f64,
}

impl Normalizer {
    pub fn new(countries: Vec<CountryProfile>, default_language: &str, threshold: f64) -> Self {
        Self {
            countries,
            default_language: default_language.to_string(),
            threshold,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.countries.clone(),
            &config.defaults.language,
            config.thresholds.normalization,
        )
    }

    /// Normalize a prompt, or reject it when confidence is below the threshold.
    #[instrument(skip_all)]
    pub fn normalize(&self, prompt: &str) -> Result<NormalizedRequest> {
        let lowered = prompt.to_lowercase();

        let country = self.match_country(prompt, &lowered);
        let grade = match_grade(&lowered, country.map(|(c, _)| c));
        // "in english" names the output language, not the subject.
        let subject = match_subject(&LANGUAGE_RE.replace_all(&lowered, " "));

        let mut missing = Vec::new();
        if country.is_none() {
            missing.push("country");
        }
        if grade.is_none() {
            missing.push("grade");
        }
        if subject.is_none() {
            missing.push("subject");
        }

        let confidence = [
            country.map_or(0.0, |(_, c)| c),
            grade.as_ref().map_or(0.0, |(_, c)| *c),
            subject.map_or(0.0, |(_, c)| c),
        ]
        .iter()
        .product::<f64>();

        debug!(confidence, ?missing, "normalization scored");

        if confidence < self.threshold {
            let detail = if missing.is_empty() {
                String::new()
            } else {
                format!(" (could not identify {})", missing.join(", "))
            };
            return Err(CurriculaError::validation(format!(
                "request confidence {confidence:.2} is below {:.2}{detail}",
                self.threshold
            )));
        }

        // All three are present past this point.
        let (Some((profile, _)), Some((grade, _)), Some((subject, _))) = (country, grade, subject)
        else {
            return Err(CurriculaError::validation("incomplete request"));
        };

        let language = LANGUAGE_RE
            .captures(&lowered)
            .and_then(|c| c.get(1))
            .and_then(|m| LANGUAGES.iter().find(|(name, _)| *name == m.as_str()))
            .map_or_else(|| self.default_language.clone(), |(_, code)| code.to_string());

        Ok(NormalizedRequest {
            request_id: Uuid::now_v7(),
            raw_prompt: prompt.to_string(),
            country: profile.name.clone(),
            country_code: profile.code.to_uppercase(),
            grade,
            subject: subject.to_string(),
            language,
            confidence,
        })
    }

    /// Country by full name (1.0), alias (0.95) or bare ISO code (0.9).
    fn match_country(&self, prompt: &str, lowered: &str) -> Option<(&CountryProfile, f64)> {
        let mut best: Option<(&CountryProfile, f64)> = None;
        for profile in &self.countries {
            let score = if contains_phrase(lowered, &profile.name) {
                1.0
            } else if profile.aliases.iter().any(|a| contains_phrase(lowered, a)) {
                0.95
            } else if prompt
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == profile.code.to_uppercase())
            {
                // Only an upper-case token counts; "us" or "in" in prose do not.
                0.9
            } else {
                continue;
            };
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((profile, score));
            }
        }
        best
    }
}

/// Grade term plus number, e.g. `("jss 1", 1.0)`.
///
/// A term the country's profile lists scores 1.0, any other term 0.9.
fn match_grade(lowered: &str, country: Option<&CountryProfile>) -> Option<(String, f64)> {
    let (term, number) = if let Some(caps) = GRADE_RE.captures(lowered) {
        (caps[1].to_string(), caps[2].to_string())
    } else if let Some(caps) = ORDINAL_GRADE_RE.captures(lowered) {
        ("grade".to_string(), caps[1].to_string())
    } else {
        return None;
    };

    let number = number.trim_start_matches('0');
    if number.is_empty() {
        return None;
    }
    let known = country.is_some_and(|c| c.grade_terms.iter().any(|t| *t == term));
    Some((format!("{term} {number}"), if known { 1.0 } else { 0.9 }))
}

/// Canonical subject; the canonical name itself scores 1.0, a synonym 0.9.
fn match_subject(lowered: &str) -> Option<(&'static str, f64)> {
    for (canonical, phrases) in SUBJECTS {
        for phrase in *phrases {
            if contains_phrase(lowered, phrase) {
                let score = if phrase == canonical { 1.0 } else { 0.9 };
                return Some((*canonical, score));
            }
        }
    }
    None
}

/// The grade term of a normalized grade (`"jss 1"` -> `"jss"`).
pub fn grade_term(grade: &str) -> &str {
    grade
        .rsplit_once(' ')
        .map_or(grade, |(term, _)| term)
        .trim()
}

/// Whole-word phrase match on already-lowercased text.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    haystack.match_indices(phrase).any(|(i, _)| {
        let before = haystack[..i].chars().next_back();
        let after = haystack[i + phrase.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

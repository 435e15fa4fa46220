//! Semantic similarity between competency text and source chunks.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Pluggable similarity measure returning a score in [0, 1].
pub trait SimilarityScorer: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, a: &str, b: &str) -> f64;
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "its", "of", "on", "or", "that", "the", "their", "this", "to", "with", "will", "can",
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid regex"));

/// Lowercased content terms of `text`, stop words removed.
pub fn terms(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.chars().count() > 1 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Cosine similarity of term-frequency vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalCosine;

impl SimilarityScorer for LexicalCosine {
    fn name(&self) -> &str {
        "lexical-cosine"
    }

    fn score(&self, a: &str, b: &str) -> f64 {
        let (wa, wb) = (terms(a), terms(b));
        let ta = frequencies(&wa);
        let tb = frequencies(&wb);
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let dot: f64 = ta
            .iter()
            .filter_map(|(t, x)| tb.get(t).map(|y| x * y))
            .sum();
        let norm = |m: &HashMap<&str, f64>| m.values().map(|v| v * v).sum::<f64>().sqrt();
        (dot / (norm(&ta) * norm(&tb))).clamp(0.0, 1.0)
    }
}

fn frequencies(terms: &[String]) -> HashMap<&str, f64> {
    let mut map = HashMap::new();
    for t in terms {
        *map.entry(t.as_str()).or_insert(0.0) += 1.0;
    }
    map
}

/// Best score of `text` against a chunk, taken over the whole chunk and
/// each of its lines.
pub fn best_chunk_score(scorer: &dyn SimilarityScorer, text: &str, chunk_text: &str) -> f64 {
    std::iter::once(chunk_text)
        .chain(chunk_text.lines())
        .map(|candidate| scorer.score(text, candidate))
        .fold(0.0, f64::max)
}

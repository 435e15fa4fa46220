//! Phase 1: mechanical extraction of headings and objectives.
//!
//! Nothing here rewrites text. Every extracted item is a verbatim span of
//! one source chunk, trimmed of list markers.

use std::sync::LazyLock;

use curricula_shared::{ChunkKind, SourceChunk};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Heading,
    Objective,
}

/// One verbatim item pulled from a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedItem {
    pub chunk_id: String,
    pub kind: ItemKind,
    pub text: String,
    /// Confidence of the chunk the item came from.
    pub confidence: f64,
}

static LIST_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*\u{2022}]|\d{1,3}[.)]|[a-zA-Z][.)]|\(\w{1,3}\))\s+(.+)$")
        .expect("valid regex")
});

static HEADING_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s+|(?:unit|topic|theme|strand|module|chapter)\s+[\w.]+\s*[:.-]\s*)(.+)$")
        .expect("valid regex")
});

static OBJECTIVE_LEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:students?|learners?|pupils?)\s+(?:should|will|must)\s+(?:be\s+able\s+to\s+)?(.+)$",
    )
    .expect("valid regex")
});

/// Pull headings and objectives from chunks, in source order.
pub fn extract_items(chunks: &[SourceChunk]) -> Vec<ExtractedItem> {
    let mut items = Vec::new();

    for chunk in chunks {
        if chunk.kind == ChunkKind::Heading {
            let text = chunk.text.trim();
            if !text.is_empty() {
                items.push(item(chunk, ItemKind::Heading, text));
            }
            continue;
        }

        for line in chunk.text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = HEADING_LINE_RE.captures(line) {
                items.push(item(chunk, ItemKind::Heading, caps[1].trim()));
            } else if let Some(caps) = LIST_MARKER_RE.captures(line) {
                items.push(item(chunk, ItemKind::Objective, caps[1].trim()));
            } else if let Some(caps) = OBJECTIVE_LEAD_RE.captures(line) {
                items.push(item(chunk, ItemKind::Objective, caps[1].trim()));
            } else if chunk.kind == ChunkKind::Table {
                items.push(item(chunk, ItemKind::Objective, line));
            }
        }
    }

    items
}

fn item(chunk: &SourceChunk, kind: ItemKind, text: &str) -> ExtractedItem {
    ExtractedItem {
        chunk_id: chunk.id.clone(),
        kind,
        text: text.trim_end_matches(['.', ';', ',']).to_string(),
        confidence: chunk.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, kind: ChunkKind, text: &str) -> SourceChunk {
        SourceChunk {
            id: id.into(),
            text: text.into(),
            kind,
            page: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn extracts_headings_and_list_objectives() {
        let chunks = vec![
            chunk("h1", ChunkKind::Heading, "Living Things"),
            chunk(
                "t1",
                ChunkKind::Text,
                "Introduction to the unit.\n1. Identify the parts of a cell.\n- Describe photosynthesis;",
            ),
        ];
        let items = extract_items(&chunks);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, ItemKind::Heading);
        assert_eq!(items[0].text, "Living Things");
        assert_eq!(items[1].text, "Identify the parts of a cell");
        assert_eq!(items[1].chunk_id, "t1");
        assert_eq!(items[2].text, "Describe photosynthesis");
    }

    #[test]
    fn recognizes_objective_leads_and_topic_lines() {
        let chunks = vec![chunk(
            "t1",
            ChunkKind::Text,
            "Topic 3: Ecology\nStudents should be able to explain food chains.",
        )];
        let items = extract_items(&chunks);
        assert_eq!(items[0].kind, ItemKind::Heading);
        assert_eq!(items[0].text, "Ecology");
        assert_eq!(items[1].kind, ItemKind::Objective);
        assert_eq!(items[1].text, "explain food chains");
    }

    #[test]
    fn plain_prose_is_not_an_objective() {
        let chunks = vec![chunk("t1", ChunkKind::Text, "This document was approved in 2019.")];
        assert!(extract_items(&chunks).is_empty());
    }

    #[test]
    fn table_rows_are_objectives() {
        let chunks = vec![chunk("r1", ChunkKind::Table, "Measure mass | balance")];
        let items = extract_items(&chunks);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, ItemKind::Objective);
    }
}

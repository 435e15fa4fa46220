//! Phase 2: constrained conversion of extracted items into competencies.

use curricula_shared::{Competency, CurriculaError, Result, StageKind};
use uuid::Uuid;

use crate::extract::{ExtractedItem, ItemKind};

/// Turn extracted objectives into verbatim competencies.
///
/// Each objective becomes one competency titled by the nearest preceding
/// heading (or the objective itself), with abstraction level 0 and a single
/// citation to its chunk. Headings with no objectives produce nothing.
pub fn normalize_items(items: &[ExtractedItem], grade: Option<&str>) -> Vec<Competency> {
    let mut competencies = Vec::new();
    let mut heading: Option<&str> = None;

    for item in items {
        match item.kind {
            ItemKind::Heading => heading = Some(&item.text),
            ItemKind::Objective => competencies.push(Competency {
                id: Uuid::now_v7().to_string(),
                title: heading.unwrap_or(&item.text).to_string(),
                description: item.text.clone(),
                learning_outcomes: vec![item.text.clone()],
                grade: grade.map(str::to_string),
                abstraction_level: 0,
                confidence: item.confidence,
                source_chunk_ids: vec![item.chunk_id.clone()],
            }),
        }
    }

    competencies
}

/// Reject a competency that breaks the fixed schema.
pub fn check_schema(competency: &Competency, max_abstraction: u8) -> Result<()> {
    let stage = StageKind::Parsing.as_str();
    if competency.title.trim().is_empty() || competency.description.trim().is_empty() {
        return Err(CurriculaError::schema(stage, "empty title or description"));
    }
    if competency.learning_outcomes.is_empty()
        || competency.learning_outcomes.iter().any(|o| o.trim().is_empty())
    {
        return Err(CurriculaError::schema(stage, "missing learning outcome"));
    }
    if competency.abstraction_level > max_abstraction {
        return Err(CurriculaError::schema(
            stage,
            format!(
                "abstraction level {} above maximum {max_abstraction}",
                competency.abstraction_level
            ),
        ));
    }
    if !(0.0..=1.0).contains(&competency.confidence) {
        return Err(CurriculaError::schema(
            stage,
            format!("confidence {} outside [0, 1]", competency.confidence),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ItemKind, text: &str, chunk: &str) -> ExtractedItem {
        ExtractedItem {
            chunk_id: chunk.into(),
            kind,
            text: text.into(),
            confidence: 0.8,
        }
    }

    #[test]
    fn objectives_take_nearest_heading() {
        let items = vec![
            item(ItemKind::Objective, "Name the planets", "c0"),
            item(ItemKind::Heading, "Cells", "c1"),
            item(ItemKind::Objective, "Identify the parts of a cell", "c2"),
        ];
        let comps = normalize_items(&items, Some("jss 1"));
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].title, "Name the planets");
        assert_eq!(comps[1].title, "Cells");
        assert_eq!(comps[1].description, "Identify the parts of a cell");
        assert_eq!(comps[1].source_chunk_ids, vec!["c2".to_string()]);
        assert_eq!(comps[1].abstraction_level, 0);
        assert_eq!(comps[1].grade.as_deref(), Some("jss 1"));
    }

    #[test]
    fn schema_caps_abstraction() {
        let mut comp = normalize_items(&[item(ItemKind::Objective, "Measure mass", "c1")], None)
            .remove(0);
        assert!(check_schema(&comp, 1).is_ok());
        comp.abstraction_level = 2;
        let err = check_schema(&comp, 1).unwrap_err();
        assert!(err.to_string().contains("abstraction"));
    }
}

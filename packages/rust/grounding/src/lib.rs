//! Grounding verification for curriculum replicas and generated content.
//!
//! Three phases guard anything destined for storage or output:
//! 1. [`extract`]: mechanical pull of headings and objectives, no rewriting
//! 2. [`normalize`]: conversion into atomic competencies under a fixed schema
//! 3. [`verify`]: citation and similarity checks plus the forbidden-pattern scan
//!
//! [`generation`] gates generated lessons, quizzes and summaries, and
//! [`shadow`] diffs a primary output against a high-accuracy rerun.

pub mod extract;
pub mod generation;
pub mod normalize;
pub mod patterns;
pub mod shadow;
pub mod similarity;
pub mod verify;

pub use extract::{ExtractedItem, ItemKind, extract_items};
pub use generation::GenerationGate;
pub use normalize::{check_schema, normalize_items};
pub use patterns::{ForbiddenPattern, ScanContext, normalize_text, scan};
pub use shadow::{ShadowBreaker, ShadowDiff, ShadowView, compare};
pub use similarity::{LexicalCosine, SimilarityScorer, best_chunk_score, terms};
pub use verify::{CompetencyCheck, GroundingPolicy, GroundingReport, GroundingVerifier};

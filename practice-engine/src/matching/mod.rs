//! Text canonicalization and fuzzy matching of heard speech against a
//! target word.

mod normalize;
mod similarity;

pub use normalize::normalize;
pub use similarity::{edit_distance, evaluate, similarity, SimilarityScorer, SUCCESS_THRESHOLD};

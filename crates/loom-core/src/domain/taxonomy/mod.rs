//! Taxonomy - the category tree and the placement engine that proposes
//! label paths for candidate nodes

pub mod keywords;
pub mod placement;
pub mod tree;

pub use keywords::{content_tokens, extract_keywords, is_stop_word, tokenize, tokens_match};
pub use placement::{Placement, PlacementConfig, TaxonomyPlacer};
pub use tree::{ROOT_ID, TaxonomyNode, TaxonomyTree};

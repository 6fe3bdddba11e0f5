//! Resolution and extraction
//!
//! Resolution rewrites a text unit so its references are explicit; extraction
//! turns the rewrite into a candidate subgraph keyed by batch-scoped temp ids.

pub mod candidate;
pub mod extractor;
pub mod resolution;

pub use candidate::{CandidateBatch, CandidateEdge, CandidateNode};
pub use extractor::{ExtractionProposal, ExtractionStage};
pub use resolution::{ResolutionProposal, ResolutionStage, ResolvedUnit, TextUnit, check_faithful};

//! Duplicate detection
//!
//! Scheduled, sampled pairwise comparison over committed nodes. Output groups
//! are candidates only; the consolidation engine decides what they become.

pub mod detector;
pub mod similarity;

pub use detector::{DetectionRun, DetectorConfig, DuplicateDetector, DuplicateGroup, group_key};
pub use similarity::{Similarity, blocking_keys, similarity};

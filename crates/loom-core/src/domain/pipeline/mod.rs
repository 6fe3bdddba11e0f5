//! Pipeline
//!
//! Resolution → extraction → placement → batch commit per text unit, on
//! bounded parallel workers; detection → consolidation as scheduled cycles.
//! The shared [`PipelineGate`] lets an operator halt new transactions.

pub mod gate;
pub mod orchestrator;

pub use gate::PipelineGate;
pub use orchestrator::{
    CycleReport, Pipeline, PipelineConfig, UnitOutcome, UnitStatus, split_units,
};

//! Repair
//!
//! Finds structural problems in committed nodes and either fixes them or
//! hands them to a human.
//!
//! # Case lifecycle
//!
//! ```text
//! open -> critiqued -> resolved
//!                   -> skipped
//!                   -> escalated -> (verdict) -> open | skipped | postponed
//! postponed -> open   once the postponement is due
//! ```

pub mod analyzer;
pub mod case;
pub mod clock;
pub mod repair_loop;

pub use analyzer::{Critique, Finding, analyze_node, apply_fix, critique, scan};
pub use case::{ProblemKind, RepairCase, RepairFix, RepairStatus, Verdict};
pub use clock::{Clock, ManualClock, ReferenceZone, SystemClock, parse_utc_offset};
pub use repair_loop::{Escalation, RepairConfig, RepairController, RepairLoop, TickReport};

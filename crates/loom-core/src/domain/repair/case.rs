//! Repair cases and verdicts

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::ReferenceZone;
use crate::domain::dedup::DuplicateGroup;
use crate::error::{Error, Result};

/// Lifecycle status of a repair case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    /// Waiting for self-critique
    Open,
    /// Critiqued; about to be fixed or escalated
    Critiqued,
    /// Waiting for an operator verdict
    Escalated,
    /// Fixed automatically or found already fixed
    Resolved,
    /// Closed without a fix
    Skipped,
    /// Parked until a timestamp
    Postponed,
}

impl RepairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Critiqued => "critiqued",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Skipped => "skipped",
            Self::Postponed => "postponed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Skipped)
    }

    /// Whether a case may move from `self` to `to`
    pub fn can_transition_to(&self, to: RepairStatus) -> bool {
        use RepairStatus::*;
        matches!(
            (self, to),
            (Open, Critiqued)
                | (Open, Skipped)
                | (Critiqued, Resolved)
                | (Critiqued, Escalated)
                | (Critiqued, Skipped)
                | (Critiqued, Open)
                | (Escalated, Open)
                | (Escalated, Skipped)
                | (Escalated, Postponed)
                | (Postponed, Open)
        )
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the analysis pass found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    EmptyCore,
    MissingSourceSentence,
    InvertedTemporalRange,
    DuplicateAlias,
    ZeroScore,
    Orphan,
    /// A merge the consolidation engine would not make on its own
    DeferredMerge,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyCore => "empty_core",
            Self::MissingSourceSentence => "missing_source_sentence",
            Self::InvertedTemporalRange => "inverted_temporal_range",
            Self::DuplicateAlias => "duplicate_alias",
            Self::ZeroScore => "zero_score",
            Self::Orphan => "orphan",
            Self::DeferredMerge => "deferred_merge",
        }
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A concrete change the loop can make without asking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fix", rename_all = "snake_case")]
pub enum RepairFix {
    RemoveAlias { alias: String },
    SwapTemporalRange,
    SetField { field: String, value: String },
    /// Merge a deferred group as the operator instructed
    Merge,
}

/// An operator's decision on an escalated case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Halt new consolidation transactions until resumed; the case stays escalated
    PauseEntirePipeline,
    SkipThisNode,
    PostponeUntil { until: DateTime<Utc> },
    /// Re-open the case with added context
    Instructions { text: String },
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PauseEntirePipeline => "pause_entire_pipeline",
            Self::SkipThisNode => "skip_this_node",
            Self::PostponeUntil { .. } => "postpone_until",
            Self::Instructions { .. } => "instructions",
        }
    }

    /// Read an operator's typed verdict: `pause`, `skip`,
    /// `postpone <timestamp>` or `instruct <text>`
    pub fn parse(line: &str, zone: &ReferenceZone) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match word.to_lowercase().as_str() {
            "pause" | "pause_entire_pipeline" => Ok(Self::PauseEntirePipeline),
            "skip" | "skip_this_node" => Ok(Self::SkipThisNode),
            "postpone" | "postpone_until" => Ok(Self::PostponeUntil {
                until: zone.parse(rest)?,
            }),
            "instruct" | "instructions" if !rest.is_empty() => Ok(Self::Instructions {
                text: rest.to_string(),
            }),
            _ => Err(Error::InvalidInput(format!(
                "unknown verdict '{}'; expected pause, skip, postpone <time> or instruct <text>",
                line
            ))),
        }
    }
}

/// One problem on one node (or one deferred group)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairCase {
    pub id: String,
    pub node_id: String,
    /// Node version the case was opened against
    #[serde(default)]
    pub node_version: Option<u64>,
    pub problem: ProblemKind,
    pub problem_description: String,
    pub suggested_actions: Vec<String>,
    pub status: RepairStatus,
    /// Operator instructions, oldest first
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub postponed_until: Option<DateTime<Utc>>,
    /// Set for deferred merges
    #[serde(default)]
    pub group: Option<DuplicateGroup>,
    /// Why the case was last escalated, skipped or resolved
    #[serde(default)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepairCase {
    pub fn new(
        node_id: impl Into<String>,
        problem: ProblemKind,
        description: impl Into<String>,
        suggested_actions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            node_version: None,
            problem,
            problem_description: description.into(),
            suggested_actions,
            status: RepairStatus::Open,
            instructions: Vec::new(),
            postponed_until: None,
            group: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_node_version(mut self, version: u64) -> Self {
        self.node_version = Some(version);
        self
    }

    pub fn with_group(mut self, group: DuplicateGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Move to `to`, refusing transitions the lifecycle does not allow
    pub fn transition(&mut self, to: RepairStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::ValidationError(format!(
                "repair case '{}' cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = now;
        if to != RepairStatus::Postponed {
            self.postponed_until = None;
        }
        Ok(())
    }

    pub fn latest_instruction(&self) -> Option<&str> {
        self.instructions.last().map(String::as_str)
    }

    /// Postponed and due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RepairStatus::Postponed && self.postponed_until.is_some_and(|t| t <= now)
    }
}

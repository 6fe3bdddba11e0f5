//! Domain events for the graph
//!
//! Events are derived from commit records. They are used for audit output
//! and logging; the commit log itself remains the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::edge::RelationshipType;
use super::transaction::CommitRecord;

/// Events that can occur in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// A node was committed for the first time
    NodeCreated {
        node_id: String,
        label: String,
        taxonomy_path: Vec<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// An existing node received a new version
    NodeUpdated {
        node_id: String,
        version: u64,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// A node was retired into a survivor by a merge
    NodeRetired {
        node_id: String,
        survivor_id: String,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// An edge was created or replaced
    EdgeUpserted {
        edge_id: String,
        source_id: String,
        target_id: String,
        relationship_type: RelationshipType,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// An edge was removed while collapsing a merge
    EdgeRemoved {
        edge_id: String,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
    /// A taxonomy category was added
    CategoryAdded {
        category_id: String,
        label: String,
        parent_id: Option<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },
}

impl GraphEvent {
    /// Expand a commit record into its events, in application order
    pub fn from_record(record: &CommitRecord) -> Vec<GraphEvent> {
        let sequence = record.sequence;
        let timestamp = record.committed_at;
        let tx = &record.transaction;
        let mut events = Vec::new();

        for category in &tx.category_additions {
            events.push(Self::CategoryAdded {
                category_id: category.id.clone(),
                label: category.label.clone(),
                parent_id: category.parent.clone(),
                sequence,
                timestamp,
            });
        }
        for node in &tx.node_upserts {
            if node.version <= 1 {
                events.push(Self::NodeCreated {
                    node_id: node.id.clone(),
                    label: node.label.clone(),
                    taxonomy_path: node.taxonomy_path.clone(),
                    sequence,
                    timestamp,
                });
            } else {
                events.push(Self::NodeUpdated {
                    node_id: node.id.clone(),
                    version: node.version,
                    sequence,
                    timestamp,
                });
            }
        }
        if let Some(rewrite) = &tx.rewrite {
            for retired in &rewrite.retired_ids {
                events.push(Self::NodeRetired {
                    node_id: retired.clone(),
                    survivor_id: rewrite.survivor_id.clone(),
                    sequence,
                    timestamp,
                });
            }
        }
        for edge in &tx.edge_upserts {
            events.push(Self::EdgeUpserted {
                edge_id: edge.id.clone(),
                source_id: edge.source_id.clone(),
                target_id: edge.target_id.clone(),
                relationship_type: edge.relationship_type.clone(),
                sequence,
                timestamp,
            });
        }
        for edge_id in &record.removed_edge_ids {
            events.push(Self::EdgeRemoved {
                edge_id: edge_id.clone(),
                sequence,
                timestamp,
            });
        }
        events
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::NodeCreated { timestamp, .. }
            | Self::NodeUpdated { timestamp, .. }
            | Self::NodeRetired { timestamp, .. }
            | Self::EdgeUpserted { timestamp, .. }
            | Self::EdgeRemoved { timestamp, .. }
            | Self::CategoryAdded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name
    pub fn event_type_name(&self) -> &'static str {
        match self {
            Self::NodeCreated { .. } => "node_created",
            Self::NodeUpdated { .. } => "node_updated",
            Self::NodeRetired { .. } => "node_retired",
            Self::EdgeUpserted { .. } => "edge_upserted",
            Self::EdgeRemoved { .. } => "edge_removed",
            Self::CategoryAdded { .. } => "category_added",
        }
    }

    /// One-line description for CLI output
    pub fn summary(&self) -> String {
        match self {
            Self::NodeCreated {
                node_id,
                label,
                taxonomy_path,
                ..
            } => format!("created {} '{}' in {}", node_id, label, taxonomy_path.join(" / ")),
            Self::NodeUpdated {
                node_id, version, ..
            } => format!("updated {} to v{}", node_id, version),
            Self::NodeRetired {
                node_id,
                survivor_id,
                ..
            } => format!("retired {} into {}", node_id, survivor_id),
            Self::EdgeUpserted {
                source_id,
                target_id,
                relationship_type,
                ..
            } => format!("{} -[{}]-> {}", source_id, relationship_type, target_id),
            Self::EdgeRemoved { edge_id, .. } => format!("removed edge {}", edge_id),
            Self::CategoryAdded { label, .. } => format!("added category '{}'", label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{Node, Transaction};

    #[test]
    fn test_events_from_record() {
        let mut tx = Transaction::new("merge");
        let mut survivor = Node::new("Alice", "person").with_id("a");
        survivor.version = 2;
        tx.upsert_node(survivor);
        tx.set_rewrite("a", vec!["b".into()]).unwrap();
        let record = CommitRecord {
            sequence: 7,
            committed_at: Utc::now(),
            transaction: tx,
            removed_edge_ids: vec!["e9".into()],
        };

        let events = GraphEvent::from_record(&record);
        let names: Vec<_> = events.iter().map(|e| e.event_type_name()).collect();
        assert_eq!(names, vec!["node_updated", "node_retired", "edge_removed"]);
        assert_eq!(events[1].summary(), "retired b into a");
    }
}

//! Attribute unification for merges

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::decision::{MergeProposal, UNIFIED_FIELDS_MIN_CONFIDENCE};
use crate::domain::graph::{Node, TemporalRange, canonicalize};

/// Index of the node that survives a merge: highest confidence × importance,
/// then earliest creation, then smallest id
pub fn choose_survivor(nodes: &[Node]) -> Option<usize> {
    nodes
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            b.merge_score()
                .partial_cmp(&a.merge_score())
                .unwrap_or(Ordering::Equal)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
        .map(|(i, _)| i)
}

/// Union of names, first spelling of each canonical form wins
fn union_names<'a>(names: impl Iterator<Item = &'a String>) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut out = BTreeSet::new();
    for name in names {
        let canonical = canonicalize(name);
        if !canonical.is_empty() && seen.insert(canonical) {
            out.insert(name.clone());
        }
    }
    out
}

fn fill_blank(slot: &mut Option<String>, others: &[&Node], get: fn(&Node) -> &Option<String>) {
    if slot.is_none() {
        *slot = others.iter().find_map(|n| get(n).clone());
    }
}

/// Build the merged node. `nodes[survivor]` keeps its id.
pub fn unify(nodes: &[Node], survivor: usize, proposal: &MergeProposal) -> Node {
    let mut merged = nodes[survivor].clone();
    let others: Vec<&Node> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != survivor)
        .map(|(_, n)| n)
        .collect();

    // Every member's label and aliases, survivor first
    let names: Vec<&String> = std::iter::once(&merged)
        .chain(others.iter().copied())
        .flat_map(|n| std::iter::once(&n.label).chain(n.aliases.iter()))
        .collect();
    let aliases = union_names(names.into_iter());
    let tags: BTreeSet<String> = others
        .iter()
        .flat_map(|n| n.tags.iter().cloned())
        .chain(merged.tags.iter().cloned())
        .collect();

    // Blank survivor fields are filled from the other members
    if merged.core.trim().is_empty()
        && let Some(core) = others.iter().map(|n| &n.core).find(|c| !c.trim().is_empty())
    {
        merged.core = core.clone();
    }
    if merged.source_sentence.is_none() {
        merged.source_sentence = others.iter().find_map(|n| n.source_sentence.clone());
    }
    fill_blank(&mut merged.valid_during, &others, |n| &n.valid_during);
    fill_blank(&mut merged.semantic_label, &others, |n| &n.semantic_label);
    fill_blank(&mut merged.status, &others, |n| &n.status);

    let mut temporal = merged.temporal_range.clone();
    for other in &others {
        temporal = match (temporal, &other.temporal_range) {
            (None, other) => other.clone(),
            (Some(current), None) => Some(current),
            (Some(current), Some(other)) => {
                Some(TemporalRange::prefer(&current, other).clone())
            }
        };
    }
    merged.temporal_range = temporal;

    if proposal.merge_confidence >= UNIFIED_FIELDS_MIN_CONFIDENCE {
        let u = &proposal.unified;
        if let Some(label) = &u.label {
            merged.label = label.trim().to_string();
        }
        if let Some(node_type) = &u.node_type {
            merged.node_type = node_type.clone();
        }
        if let Some(core) = &u.core {
            merged.core = core.clone();
        }
        if u.source_sentence.is_some() {
            merged.source_sentence = u.source_sentence.clone();
        }
        if u.temporal_range.is_some() {
            merged.temporal_range = u.temporal_range.clone();
        }
        if u.valid_during.is_some() {
            merged.valid_during = u.valid_during.clone();
        }
        if u.semantic_label.is_some() {
            merged.semantic_label = u.semantic_label.clone();
        }
        if u.status.is_some() {
            merged.status = u.status.clone();
        }
        if let Some(confidence) = u.confidence
            && confidence > 0.0
        {
            merged.confidence = confidence.min(1.0);
        }
        if let Some(importance) = u.importance {
            merged.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(path) = &u.taxonomy_path
            && !path.is_empty()
        {
            merged.taxonomy_path = path.clone();
        }
    }

    merged.aliases = aliases;
    merged.tags = tags;
    merged
}

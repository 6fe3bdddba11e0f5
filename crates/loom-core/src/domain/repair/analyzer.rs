//! Structural analysis and self-critique of committed nodes

use std::collections::BTreeMap;

use super::case::{ProblemKind, RepairCase, RepairFix};
use crate::domain::graph::{GraphState, Node, canonicalize};
use crate::error::{Error, Result};

/// Bound confidence at or above which an inverted range is swapped automatically
pub const SWAP_MIN_BOUND_CONFIDENCE: f32 = 0.5;

/// Fields an operator may set with `set <field>=<value>`
pub const SETTABLE_FIELDS: &[&str] = &[
    "label",
    "type",
    "core",
    "source_sentence",
    "valid_during",
    "semantic_label",
    "status",
    "confidence",
    "importance",
];

/// A problem found on one node
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub node_id: String,
    /// Version of the node the finding was made on
    pub node_version: u64,
    pub problem: ProblemKind,
    pub description: String,
    pub suggested_actions: Vec<String>,
}

impl Finding {
    fn new(node: &Node, problem: ProblemKind, description: String, actions: &[&str]) -> Self {
        Self {
            node_id: node.id.clone(),
            node_version: node.version,
            problem,
            description,
            suggested_actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn into_case(self, now: chrono::DateTime<chrono::Utc>) -> RepairCase {
        RepairCase::new(
            self.node_id,
            self.problem,
            self.description,
            self.suggested_actions,
            now,
        )
        .with_node_version(self.node_version)
    }
}

/// Pairs of aliases that canonicalize to the same form; the later spelling
/// of each pair is the one to drop
fn duplicate_aliases(node: &Node) -> Vec<String> {
    let mut seen: BTreeMap<String, &String> = BTreeMap::new();
    let mut dupes = Vec::new();
    for alias in &node.aliases {
        let canonical = canonicalize(alias);
        if seen.contains_key(&canonical) {
            dupes.push(alias.clone());
        } else {
            seen.insert(canonical, alias);
        }
    }
    dupes
}

/// Every problem on `node`, given how many edges touch it
pub fn analyze_node(node: &Node, degree: usize) -> Vec<Finding> {
    let mut findings = Vec::new();
    if node.core.trim().is_empty() {
        findings.push(Finding::new(
            node,
            ProblemKind::EmptyCore,
            format!("'{}' has an empty core description", node.label),
            &["instruct set core=<description>", "skip"],
        ));
    }
    let no_sentence = node
        .source_sentence
        .as_deref()
        .is_none_or(|s| s.trim().is_empty());
    if no_sentence {
        findings.push(Finding::new(
            node,
            ProblemKind::MissingSourceSentence,
            format!("'{}' has no source sentence", node.label),
            &["instruct set source_sentence=<sentence>", "skip"],
        ));
    }
    if let Some(range) = &node.temporal_range
        && range.is_inverted()
    {
        findings.push(Finding::new(
            node,
            ProblemKind::InvertedTemporalRange,
            format!("'{}' has a temporal range that starts after it ends", node.label),
            &["swap the bounds", "skip"],
        ));
    }
    let dupes = duplicate_aliases(node);
    if !dupes.is_empty() {
        findings.push(Finding::new(
            node,
            ProblemKind::DuplicateAlias,
            format!(
                "'{}' carries aliases that differ only in case or punctuation: {}",
                node.label,
                dupes.join(", ")
            ),
            &["remove the duplicate spelling"],
        ));
    }
    if node.confidence <= 0.0 || node.importance <= 0.0 {
        findings.push(Finding::new(
            node,
            ProblemKind::ZeroScore,
            format!(
                "'{}' has confidence {} and importance {}",
                node.label, node.confidence, node.importance
            ),
            &["instruct set importance=<0..1>", "skip"],
        ));
    }
    if degree == 0 && no_sentence {
        findings.push(Finding::new(
            node,
            ProblemKind::Orphan,
            format!("'{}' has no edges and no source sentence", node.label),
            &["instruct set source_sentence=<sentence>", "skip"],
        ));
    }
    findings
}

/// Analyse every committed node in one consistent view, ordered by node id
pub fn scan(state: &GraphState) -> Vec<Finding> {
    let mut nodes: Vec<&Node> = state.nodes().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
        .into_iter()
        .flat_map(|n| analyze_node(n, state.degree(&n.id)))
        .collect()
}

/// Outcome of re-reading a case against the current graph
#[derive(Debug, Clone, PartialEq)]
pub enum Critique {
    /// The case no longer applies (node retired or gone, operator said keep)
    Skip(String),
    /// The problem is gone already
    AlreadyFixed,
    Fix(RepairFix),
    Escalate(String),
}

/// Parse `set <field>=<value>`
pub fn parse_set_instruction(text: &str) -> Option<(String, String)> {
    let rest = text.trim().strip_prefix("set ")?;
    let (field, value) = rest.split_once('=')?;
    let field = field.trim().to_lowercase();
    if !SETTABLE_FIELDS.contains(&field.as_str()) {
        return None;
    }
    Some((field, value.trim().to_string()))
}

fn critique_deferred(case: &RepairCase, state: &GraphState) -> Critique {
    let Some(group) = &case.group else {
        return Critique::Escalate("deferred merge without a group".to_string());
    };
    let mut live = std::collections::BTreeSet::new();
    for id in &group.node_ids {
        match state.resolve(id) {
            Some(current) => {
                live.insert(current);
            }
            None => return Critique::Skip(format!("node '{}' no longer exists", id)),
        }
    }
    if live.len() < 2 {
        return Critique::AlreadyFixed;
    }
    match case.latest_instruction().map(|t| t.trim().to_lowercase()) {
        Some(text) if text == "merge" => Critique::Fix(RepairFix::Merge),
        Some(text) if text == "keep separate" || text == "distinct" => {
            Critique::Skip("operator kept the nodes separate".to_string())
        }
        _ => Critique::Escalate(case.problem_description.clone()),
    }
}

/// Decide what to do with `case` given the graph as it is now
pub fn critique(case: &RepairCase, state: &GraphState) -> Critique {
    if case.problem == ProblemKind::DeferredMerge {
        return critique_deferred(case, state);
    }

    let Some(node) = state.node(&case.node_id) else {
        return match state.resolve(&case.node_id) {
            Some(survivor) => Critique::Skip(format!("node was merged into '{}'", survivor)),
            None => Critique::Skip("node no longer exists".to_string()),
        };
    };

    if let Some(instruction) = case.latest_instruction() {
        return match parse_set_instruction(instruction) {
            Some((field, value)) => Critique::Fix(RepairFix::SetField { field, value }),
            None => Critique::Escalate(format!(
                "could not act on instruction '{}'; expected set <field>=<value> with field one of {}",
                instruction,
                SETTABLE_FIELDS.join(", ")
            )),
        };
    }

    let still_present = analyze_node(node, state.degree(&node.id))
        .into_iter()
        .any(|f| f.problem == case.problem);
    if !still_present {
        return Critique::AlreadyFixed;
    }

    match case.problem {
        ProblemKind::DuplicateAlias => match duplicate_aliases(node).into_iter().next() {
            Some(alias) => Critique::Fix(RepairFix::RemoveAlias { alias }),
            None => Critique::AlreadyFixed,
        },
        ProblemKind::InvertedTemporalRange => {
            let confident = node.temporal_range.as_ref().is_some_and(|r| {
                [&r.start, &r.end].into_iter().all(|b| {
                    b.as_ref()
                        .is_some_and(|b| b.confidence >= SWAP_MIN_BOUND_CONFIDENCE)
                })
            });
            if confident {
                Critique::Fix(RepairFix::SwapTemporalRange)
            } else {
                Critique::Escalate(format!(
                    "{}; bound confidence too low to swap automatically",
                    case.problem_description
                ))
            }
        }
        _ => Critique::Escalate(case.problem_description.clone()),
    }
}

fn parse_unit_interval(field: &str, value: &str) -> Result<f32> {
    value
        .parse::<f32>()
        .ok()
        .filter(|v| (0.0..=1.0).contains(v))
        .ok_or_else(|| Error::InvalidInput(format!("{} must be a number in [0, 1], got '{}'", field, value)))
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Apply a node-level fix to a copy of `node`
pub fn apply_fix(node: &Node, fix: &RepairFix) -> Result<Node> {
    let mut fixed = node.clone();
    match fix {
        RepairFix::RemoveAlias { alias } => {
            fixed.aliases.remove(alias);
        }
        RepairFix::SwapTemporalRange => {
            fixed.temporal_range = fixed.temporal_range.as_ref().map(|r| r.swapped());
        }
        RepairFix::SetField { field, value } => match field.as_str() {
            "label" if !value.is_empty() => fixed.label = value.clone(),
            "type" if !value.is_empty() => fixed.node_type = value.clone(),
            "core" => fixed.core = value.clone(),
            "source_sentence" => fixed.source_sentence = optional(value),
            "valid_during" => fixed.valid_during = optional(value),
            "semantic_label" => fixed.semantic_label = optional(value),
            "status" => fixed.status = optional(value),
            "confidence" => fixed.confidence = parse_unit_interval(field, value)?,
            "importance" => fixed.importance = parse_unit_interval(field, value)?,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "cannot set {} to '{}'",
                    field, value
                )));
            }
        },
        RepairFix::Merge => {
            return Err(Error::InvalidInput(
                "a merge is not a single-node fix".to_string(),
            ));
        }
    }
    fixed.validate_committable()?;
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{GraphStore, TemporalBound, TemporalRange};
    use chrono::{TimeZone, Utc};

    fn complete(label: &str) -> Node {
        Node::new(label, "person")
            .with_core("a person")
            .with_source_sentence(format!("{} was here.", label))
            .with_taxonomy_path(["People"])
            .with_confidence(0.8)
            .with_importance(0.5)
    }

    fn inverted(confidence: f32) -> TemporalRange {
        let t = |d: u32| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
        TemporalRange::new(
            Some(TemporalBound::new(t(20), confidence)),
            Some(TemporalBound::new(t(2), confidence)),
        )
    }

    fn problems(node: &Node, degree: usize) -> Vec<ProblemKind> {
        analyze_node(node, degree).into_iter().map(|f| f.problem).collect()
    }

    #[test]
    fn test_clean_node_has_no_findings() {
        assert!(problems(&complete("Alice"), 1).is_empty());
    }

    #[test]
    fn test_detects_each_problem() {
        let mut node = Node::new("Ghost", "person")
            .with_taxonomy_path(["People"])
            .with_temporal_range(inverted(0.9))
            .with_importance(0.0);
        node.aliases.insert("Mr. Ghost".to_string());
        node.aliases.insert("mr ghost".to_string());
        assert_eq!(
            problems(&node, 0),
            vec![
                ProblemKind::EmptyCore,
                ProblemKind::MissingSourceSentence,
                ProblemKind::InvertedTemporalRange,
                ProblemKind::DuplicateAlias,
                ProblemKind::ZeroScore,
                ProblemKind::Orphan,
            ]
        );
        // An edge keeps it from being an orphan
        assert!(!problems(&node, 1).contains(&ProblemKind::Orphan));
    }

    #[tokio::test]
    async fn test_critique_picks_unambiguous_fixes() {
        let store = GraphStore::in_memory();
        let mut dup = complete("Robert");
        dup.aliases.insert("Bob".to_string());
        dup.aliases.insert("bob.".to_string());
        let dup_id = store.put_node(dup).await.unwrap();
        let sure_id = store
            .put_node(complete("War").with_temporal_range(inverted(0.9)))
            .await
            .unwrap();
        let unsure_id = store
            .put_node(complete("Peace").with_temporal_range(inverted(0.2)))
            .await
            .unwrap();

        let state = store.snapshot().await;
        let findings = scan(&state);
        let case_for = |id: &str, kind: ProblemKind| {
            findings
                .iter()
                .find(|f| f.node_id == id && f.problem == kind)
                .cloned()
                .unwrap()
                .into_case(Utc::now())
        };

        let c = case_for(&dup_id, ProblemKind::DuplicateAlias);
        assert!(matches!(critique(&c, &state), Critique::Fix(RepairFix::RemoveAlias { .. })));
        let c = case_for(&sure_id, ProblemKind::InvertedTemporalRange);
        assert_eq!(critique(&c, &state), Critique::Fix(RepairFix::SwapTemporalRange));
        let c = case_for(&unsure_id, ProblemKind::InvertedTemporalRange);
        assert!(matches!(critique(&c, &state), Critique::Escalate(_)));
    }

    #[tokio::test]
    async fn test_critique_follows_instructions_and_current_state() {
        let store = GraphStore::in_memory();
        let id = store
            .put_node(complete("Alice").with_core(""))
            .await
            .unwrap();
        let state = store.snapshot().await;
        let mut case = RepairCase::new(&id, ProblemKind::EmptyCore, "empty core", vec![], Utc::now());
        assert!(matches!(critique(&case, &state), Critique::Escalate(_)));

        case.instructions.push("set core = a chemist".to_string());
        let Critique::Fix(fix) = critique(&case, &state) else {
            panic!("expected a fix");
        };
        let fixed = apply_fix(state.node(&id).unwrap(), &fix).unwrap();
        assert_eq!(fixed.core, "a chemist");

        case.instructions.push("make it better".to_string());
        assert!(matches!(critique(&case, &state), Critique::Escalate(_)));

        let gone = RepairCase::new("missing", ProblemKind::EmptyCore, "x", vec![], Utc::now());
        assert!(matches!(critique(&gone, &state), Critique::Skip(_)));
    }

    #[test]
    fn test_apply_fix_validates() {
        let node = complete("Alice");
        let bad = RepairFix::SetField {
            field: "confidence".to_string(),
            value: "0".to_string(),
        };
        assert!(apply_fix(&node, &bad).is_err());
        assert!(parse_set_instruction("set taxonomy_path=x").is_none());
        assert_eq!(
            parse_set_instruction("set Status=retired"),
            Some(("status".to_string(), "retired".to_string()))
        );
    }
}

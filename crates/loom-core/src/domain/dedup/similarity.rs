//! Pairwise node similarity
//!
//! Scores are in [0, 1]. Two nodes sharing a canonical name (label or alias)
//! score 1.0; otherwise names and cores are compared by token overlap. A type
//! mismatch halves either score.

use std::collections::BTreeSet;

use crate::domain::graph::{Node, canonicalize};
use crate::domain::taxonomy::content_tokens;

const NAME_WEIGHT: f32 = 0.7;
const CORE_WEIGHT: f32 = 0.3;
const TYPE_MISMATCH_PENALTY: f32 = 0.5;

/// Score and a short explanation for one compared pair
#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub score: f32,
    pub reason: String,
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let total = a.union(b).count();
    shared as f32 / total as f32
}

fn name_tokens(node: &Node) -> BTreeSet<String> {
    std::iter::once(&node.label)
        .chain(node.aliases.iter())
        .flat_map(|n| content_tokens(n))
        .collect()
}

/// Keys used to pick comparison partners before random sampling
pub fn blocking_keys(node: &Node) -> BTreeSet<String> {
    let mut keys = name_tokens(node);
    keys.extend(node.canonical_names());
    keys
}

pub fn similarity(a: &Node, b: &Node) -> Similarity {
    let shared_name = a
        .canonical_names()
        .intersection(&b.canonical_names())
        .next()
        .cloned();

    let (mut score, mut reason) = match shared_name {
        Some(name) => (1.0, format!("shared name '{}'", name)),
        None => {
            let names = jaccard(&name_tokens(a), &name_tokens(b));
            let core_a: BTreeSet<String> = content_tokens(&a.core).into_iter().collect();
            let core_b: BTreeSet<String> = content_tokens(&b.core).into_iter().collect();
            if core_a.is_empty() || core_b.is_empty() {
                (names, format!("name overlap {:.2}", names))
            } else {
                let cores = jaccard(&core_a, &core_b);
                (
                    NAME_WEIGHT * names + CORE_WEIGHT * cores,
                    format!("name overlap {:.2}, core overlap {:.2}", names, cores),
                )
            }
        }
    };

    if canonicalize(&a.node_type) != canonicalize(&b.node_type) {
        score *= TYPE_MISMATCH_PENALTY;
        reason.push_str(&format!(", type {} vs {}", a.node_type, b.node_type));
    }

    Similarity { score, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_match_scores_one() {
        let existing = Node::new("Ali", "person").with_aliases(["Alice"]);
        let fresh = Node::new("alice", "person");
        let sim = similarity(&existing, &fresh);
        assert_eq!(sim.score, 1.0);
        assert!(sim.reason.contains("alice"));
    }

    #[test]
    fn test_type_mismatch_penalized() {
        let city = Node::new("Paris", "city");
        let person = Node::new("Paris", "person");
        assert_eq!(similarity(&city, &person).score, 0.5);
    }

    #[test]
    fn test_token_overlap() {
        let a = Node::new("Marie Curie", "person").with_core("physicist chemist");
        let b = Node::new("Marie Sklodowska Curie", "person").with_core("chemist physicist");
        let sim = similarity(&a, &b);
        // names 2/3, cores 1.0
        assert!((sim.score - (0.7 * 2.0 / 3.0 + 0.3)).abs() < 1e-5);

        let c = Node::new("Bob", "person");
        assert_eq!(similarity(&a, &c).score, 0.0);
    }

    #[test]
    fn test_blocking_keys() {
        let node = Node::new("Albert Einstein", "person").with_aliases(["Bert"]);
        let keys = blocking_keys(&node);
        assert!(keys.contains("albert"));
        assert!(keys.contains("bert"));
        assert!(keys.contains("albert einstein"));
    }
}

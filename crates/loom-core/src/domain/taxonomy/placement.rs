//! Taxonomy placement
//!
//! Assigns each candidate node a label path in the category tree. The placer
//! never mutates the committed tree: new categories travel with the placement
//! and are committed in the same transaction as the node that needs them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::keywords::{content_tokens, extract_keywords, tokens_match};
use super::tree::{ROOT_ID, TaxonomyNode, TaxonomyTree};
use crate::domain::extraction::CandidateNode;

/// Placement tuning
#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Minimum path score for reusing an existing category
    pub confidence_threshold: f32,
    /// Keywords extracted per candidate (1-5)
    pub max_keywords: usize,
    /// Deepest level a new category may be created at
    pub max_depth: usize,
    /// Children a category may have before new siblings are refused
    pub max_children: usize,
    /// Weight of a category's own relevance versus its ancestors', per level
    pub depth_decay: f32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            max_keywords: 5,
            max_depth: 4,
            max_children: 12,
            depth_decay: 0.85,
        }
    }
}

/// Where a candidate goes in the taxonomy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    /// Category labels below the root
    pub path: Vec<String>,
    pub confidence: f32,
    pub keywords: Vec<String>,
    /// Category this placement introduces, committed with the node
    pub new_category: Option<TaxonomyNode>,
}

impl Placement {
    pub fn is_new_subcategory(&self) -> bool {
        self.new_category.is_some()
    }
}

#[derive(Debug, Clone)]
struct Scored {
    id: String,
    score: f32,
    depth: usize,
    path: Vec<String>,
}

/// Taxonomy placement engine
#[derive(Debug, Clone, Default)]
pub struct TaxonomyPlacer {
    config: PlacementConfig,
}

impl TaxonomyPlacer {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// 1 to `max_keywords` concept keywords for a candidate
    pub fn keywords_for(&self, label: &str, core: &str, node_type: &str) -> Vec<String> {
        let max = self.config.max_keywords.clamp(1, 5);
        let keywords = extract_keywords(&format!("{} {}", label, core), max);
        if !keywords.is_empty() {
            return keywords;
        }
        let fallback = content_tokens(node_type);
        if fallback.is_empty() {
            vec!["entity".to_string()]
        } else {
            fallback.into_iter().take(max).collect()
        }
    }

    /// Fraction of a category label's tokens matched by some term
    pub fn relevance(label: &str, terms: &[String]) -> f32 {
        let tokens = content_tokens(label);
        if tokens.is_empty() {
            return 0.0;
        }
        let matched = tokens
            .iter()
            .filter(|t| terms.iter().any(|k| tokens_match(t, k)))
            .count();
        matched as f32 / tokens.len() as f32
    }

    /// Score every category: own relevance blended with the parent's score,
    /// the parent's weight growing with depth
    fn score_tree(&self, tree: &TaxonomyTree, terms: &[String]) -> Vec<Scored> {
        let mut scored = Vec::new();
        let mut stack: Vec<(String, f32)> = tree
            .branches()
            .into_iter()
            .map(|b| (b.id.clone(), 0.0))
            .collect();
        while let Some((id, parent_score)) = stack.pop() {
            let Some(node) = tree.get(&id) else {
                continue;
            };
            let depth = tree.depth(&id);
            let weight = self.config.depth_decay.powi(depth as i32 - 1);
            let score = weight * Self::relevance(&node.label, terms) + (1.0 - weight) * parent_score;
            for child in tree.children(&id) {
                stack.push((child.id.clone(), score));
            }
            scored.push(Scored {
                path: tree.path_labels(&id),
                id,
                score,
                depth,
            });
        }
        scored
    }

    /// Highest score wins; exact ties prefer the shallower path, then label order
    fn best<'a>(candidates: impl Iterator<Item = &'a Scored>) -> Option<&'a Scored> {
        candidates.min_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.depth.cmp(&b.depth))
                .then(a.path.cmp(&b.path))
        })
    }

    /// Place one candidate against `tree`
    pub fn place(&self, tree: &TaxonomyTree, label: &str, core: &str, node_type: &str) -> Placement {
        let keywords = self.keywords_for(label, core, node_type);
        let mut terms = keywords.clone();
        for token in content_tokens(node_type) {
            if !terms.contains(&token) {
                terms.push(token);
            }
        }

        let scored = self.score_tree(tree, &terms);
        let best = Self::best(scored.iter());

        if let Some(best) = best {
            if best.score >= self.config.confidence_threshold {
                return Placement {
                    path: best.path.clone(),
                    confidence: best.score,
                    keywords,
                    new_category: None,
                };
            }
        }

        // Nothing clears the threshold: propose a subcategory under the
        // nearest matching ancestor, or a new branch when nothing matches.
        let (parent_id, parent_score, new_label) = match best.filter(|b| b.score > 0.0) {
            Some(anchor) => {
                let taken: Vec<String> = anchor
                    .path
                    .iter()
                    .flat_map(|l| content_tokens(l))
                    .collect();
                let label = keywords
                    .iter()
                    .find(|k| !taken.iter().any(|t| tokens_match(t, k)))
                    .or_else(|| keywords.first())
                    .map(|k| title_case(k))
                    .unwrap_or_else(|| title_case(node_type));
                (anchor.id.clone(), anchor.score, label)
            }
            None => {
                let label = if content_tokens(node_type).is_empty() {
                    keywords.first().map(|k| title_case(k)).unwrap_or_default()
                } else {
                    title_case(node_type)
                };
                (ROOT_ID.to_string(), 0.0, label)
            }
        };

        let by_id = |id: &str| scored.iter().find(|s| s.id == id);

        if let Some(existing) = tree.child_by_label(&parent_id, &new_label) {
            if let Some(s) = by_id(&existing.id) {
                return Placement {
                    path: s.path.clone(),
                    confidence: s.score,
                    keywords,
                    new_category: None,
                };
            }
        }

        let depth = tree.depth(&parent_id) + 1;
        let bounded =
            depth > self.config.max_depth || tree.child_count(&parent_id) >= self.config.max_children;
        if bounded {
            // Reuse the best existing child, or the anchor itself
            let children: Vec<String> = tree
                .children(&parent_id)
                .into_iter()
                .map(|c| c.id.clone())
                .collect();
            let reuse = Self::best(scored.iter().filter(|s| children.contains(&s.id)))
                .or_else(|| by_id(&parent_id));
            if let Some(reuse) = reuse {
                debug!(
                    label = %label,
                    path = %reuse.path.join(" / "),
                    "Taxonomy bound reached, reusing existing category"
                );
                return Placement {
                    path: reuse.path.clone(),
                    confidence: reuse.score,
                    keywords,
                    new_category: None,
                };
            }
        }

        let weight = self.config.depth_decay.powi(depth as i32 - 1);
        let confidence = weight + (1.0 - weight) * parent_score;
        let category = TaxonomyNode::new(new_label.clone(), parent_id.clone());
        let mut path = tree.path_labels(&parent_id);
        path.push(new_label);
        Placement {
            path,
            confidence,
            keywords,
            new_category: Some(category),
        }
    }

    /// Place every candidate in a batch, attaching the placements.
    ///
    /// Works on a copy of `tree` so candidates proposing the same new
    /// category share it; only the first carries the addition.
    pub fn place_batch(&self, tree: &TaxonomyTree, candidates: &mut [CandidateNode]) {
        let mut working = tree.clone();
        for candidate in candidates.iter_mut() {
            let placement = self.place(
                &working,
                &candidate.label,
                &candidate.core,
                &candidate.node_type,
            );
            if let Some(category) = &placement.new_category {
                if working.insert(category.clone()).is_err() {
                    debug!(label = %category.label, "Proposed category already present in batch");
                }
            }
            debug!(
                temp_id = %candidate.temp_id,
                path = %placement.path.join(" / "),
                confidence = placement.confidence,
                new_category = placement.is_new_subcategory(),
                "Candidate placed"
            );
            candidate.placement = Some(placement);
        }
    }
}

fn title_case(word: &str) -> String {
    word.split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

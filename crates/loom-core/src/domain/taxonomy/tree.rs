//! Category tree
//!
//! The tree is an arena keyed by category id with a synthetic root. Nodes
//! reference categories only by their label path below the root.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::graph::node::canonicalize;
use crate::error::{Error, Result};

/// Id of the synthetic root category
pub const ROOT_ID: &str = "root";

/// A category in the taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: String,
    pub label: String,
    /// Parent category id; only the root has none
    pub parent: Option<String>,
}

impl TaxonomyNode {
    /// Create a new category under `parent`
    pub fn new(label: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            parent: Some(parent.into()),
        }
    }
}

/// The category hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyTree {
    nodes: HashMap<String, TaxonomyNode>,
    children: HashMap<String, Vec<String>>,
}

impl Default for TaxonomyTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TaxonomyTree {
    /// Create a tree containing only the root
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID.to_string(),
            TaxonomyNode {
                id: ROOT_ID.to_string(),
                label: String::new(),
                parent: None,
            },
        );
        Self {
            nodes,
            children: HashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TaxonomyNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of categories, root excluded
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Child categories of `id`, in insertion order
    pub fn children(&self, id: &str) -> Vec<&TaxonomyNode> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn child_count(&self, id: &str) -> usize {
        self.children.get(id).map_or(0, Vec::len)
    }

    /// Top-level branches
    pub fn branches(&self) -> Vec<&TaxonomyNode> {
        self.children(ROOT_ID)
    }

    /// Child of `parent` whose label canonicalizes like `label`
    pub fn child_by_label(&self, parent: &str, label: &str) -> Option<&TaxonomyNode> {
        let wanted = canonicalize(label);
        self.children(parent)
            .into_iter()
            .find(|c| canonicalize(&c.label) == wanted)
    }

    /// Depth below the root (branches are depth 1, the root is 0)
    pub fn depth(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            match &node.parent {
                Some(parent) => {
                    depth += 1;
                    current = self.nodes.get(parent);
                }
                None => break,
            }
        }
        depth
    }

    /// Labels from the first level below the root down to `id`
    pub fn path_labels(&self, id: &str) -> Vec<String> {
        let mut labels = Vec::new();
        let mut current = self.nodes.get(id);
        while let Some(node) = current {
            if node.parent.is_none() {
                break;
            }
            labels.push(node.label.clone());
            current = node.parent.as_deref().and_then(|p| self.nodes.get(p));
        }
        labels.reverse();
        labels
    }

    /// Category id for a label path, if every segment exists
    pub fn find_path(&self, path: &[String]) -> Option<String> {
        let mut current = ROOT_ID.to_string();
        for label in path {
            current = self.child_by_label(&current, label)?.id.clone();
        }
        Some(current)
    }

    /// Ids of every category in the subtree rooted at `id`, `id` included
    pub fn subtree(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.get(&current) {
                stack.extend(kids.iter().rev().cloned());
            }
            out.push(current);
        }
        out
    }

    /// Check that `node` can be inserted: the parent exists, the label is
    /// non-empty and no sibling has the same canonical label.
    pub fn check_insert(&self, node: &TaxonomyNode) -> Result<()> {
        let parent = node.parent.as_deref().ok_or_else(|| {
            Error::ValidationError(format!("category '{}' has no parent", node.label))
        })?;
        if !self.contains(parent) {
            return Err(Error::ValidationError(format!(
                "category '{}' references missing parent '{}'",
                node.label, parent
            )));
        }
        if canonicalize(&node.label).is_empty() {
            return Err(Error::ValidationError(
                "category label must not be empty".to_string(),
            ));
        }
        if self.contains(&node.id) {
            return Err(Error::ValidationError(format!(
                "category id '{}' already exists",
                node.id
            )));
        }
        if self.child_by_label(parent, &node.label).is_some() {
            return Err(Error::ValidationError(format!(
                "category '{}' already exists under '{}'",
                node.label, parent
            )));
        }
        Ok(())
    }

    /// Insert a category after validation
    pub fn insert(&mut self, node: TaxonomyNode) -> Result<()> {
        self.check_insert(&node)?;
        if let Some(parent) = node.parent.clone() {
            self.children.entry(parent).or_default().push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Every category, root excluded
    pub fn categories(&self) -> impl Iterator<Item = &TaxonomyNode> {
        self.nodes.values().filter(|n| n.parent.is_some())
    }

    /// Deepest category depth in the tree
    pub fn max_depth(&self) -> usize {
        self.categories().map(|c| self.depth(&c.id)).max().unwrap_or(0)
    }

    /// Largest number of children under any single category (root included)
    pub fn max_fan_out(&self) -> usize {
        self.children.values().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (TaxonomyTree, String, String) {
        let mut tree = TaxonomyTree::new();
        let people = TaxonomyNode::new("People", ROOT_ID);
        let people_id = people.id.clone();
        tree.insert(people).unwrap();
        let friends = TaxonomyNode::new("Friends", &people_id);
        let friends_id = friends.id.clone();
        tree.insert(friends).unwrap();
        (tree, people_id, friends_id)
    }

    #[test]
    fn test_paths_and_depth() {
        let (tree, people_id, friends_id) = sample_tree();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.depth(ROOT_ID), 0);
        assert_eq!(tree.depth(&people_id), 1);
        assert_eq!(tree.depth(&friends_id), 2);
        assert_eq!(tree.path_labels(&friends_id), vec!["People", "Friends"]);
        assert_eq!(
            tree.find_path(&["people".to_string(), "FRIENDS".to_string()]),
            Some(friends_id)
        );
        assert!(tree.path_labels(ROOT_ID).is_empty());
    }

    #[test]
    fn test_insert_rejects_duplicate_sibling() {
        let (mut tree, people_id, _) = sample_tree();
        let dup = TaxonomyNode::new("friends", &people_id);
        assert!(matches!(tree.insert(dup), Err(Error::ValidationError(_))));
    }

    #[test]
    fn test_insert_rejects_missing_parent() {
        let (mut tree, _, _) = sample_tree();
        let orphan = TaxonomyNode::new("Lost", "nope");
        assert!(tree.insert(orphan).is_err());
    }

    #[test]
    fn test_subtree() {
        let (tree, people_id, friends_id) = sample_tree();
        let sub = tree.subtree(&people_id);
        assert_eq!(sub, vec![people_id, friends_id]);
        assert_eq!(tree.max_fan_out(), 1);
        assert_eq!(tree.max_depth(), 2);
    }
}

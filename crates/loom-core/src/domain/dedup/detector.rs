//! Duplicate detector
//!
//! Sampled pairwise comparison: each fresh node is compared with at most
//! `sample_size` partners, blocking-key matches first, then a seeded random
//! fill. Pairs above the threshold are unioned, so groups are the connected
//! components of the hits even where a pair inside a group was never sampled.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::similarity::{blocking_keys, similarity};
use crate::domain::graph::Node;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub similarity_threshold: f32,
    /// Comparisons per fresh node
    pub sample_size: usize,
    /// Fixed RNG seed for reproducible sampling
    pub seed: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            sample_size: 16,
            seed: None,
        }
    }
}

/// Deterministic key for a set of node ids: SHA-256 over the sorted ids
pub fn group_key(node_ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for id in node_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Candidate duplicates; consumed by the consolidation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub node_ids: BTreeSet<String>,
    pub notes: Vec<String>,
}

impl DuplicateGroup {
    pub fn new<I, S>(node_ids: I, notes: Vec<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node_ids: BTreeSet<String> = node_ids.into_iter().map(Into::into).collect();
        Self {
            key: group_key(&node_ids),
            node_ids,
            notes,
        }
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_ids.contains(id)
    }
}

/// Output of one detection pass
///
/// Groups are disjoint: a node belongs to at most one group of a run.
#[derive(Debug, Clone)]
pub struct DetectionRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub groups: Vec<DuplicateGroup>,
    pub comparisons: usize,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != cur {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
    }
}

pub struct DuplicateDetector {
    config: DetectorConfig,
    rng: StdRng,
}

impl DuplicateDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Compare every node against the rest
    pub fn detect_all(&mut self, nodes: &[Node]) -> DetectionRun {
        let fresh: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        self.detect(nodes, &fresh)
    }

    /// Group duplicates among `nodes`, sampling partners for each id in
    /// `fresh`. Ids in `fresh` missing from `nodes` are ignored.
    pub fn detect(&mut self, nodes: &[Node], fresh: &[String]) -> DetectionRun {
        let started_at = Utc::now();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for key in blocking_keys(node) {
                blocks.entry(key).or_default().push(i);
            }
        }

        let mut uf = UnionFind::new(nodes.len());
        let mut compared: HashSet<(usize, usize)> = HashSet::new();
        let mut notes: Vec<(usize, usize, String)> = Vec::new();
        let mut seen_fresh: HashSet<usize> = HashSet::new();

        for id in fresh {
            let Some(&i) = index.get(id.as_str()) else {
                continue;
            };
            if !seen_fresh.insert(i) {
                continue;
            }

            let partners = self.sample_partners(i, nodes, &blocks);
            for j in partners {
                let pair = (i.min(j), i.max(j));
                if !compared.insert(pair) {
                    continue;
                }
                let sim = similarity(&nodes[i], &nodes[j]);
                if sim.score >= self.config.similarity_threshold {
                    uf.union(i, j);
                    notes.push((
                        pair.0,
                        pair.1,
                        format!(
                            "{} ~ {} ({:.2}: {})",
                            nodes[pair.0].label, nodes[pair.1].label, sim.score, sim.reason
                        ),
                    ));
                }
            }
        }

        let mut components: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (a, b, _) in &notes {
            let root = uf.find(*a);
            components.entry(root).or_default().extend([*a, *b]);
        }

        let mut groups: Vec<DuplicateGroup> = components
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(root, members)| {
                let group_notes = notes
                    .iter()
                    .filter(|(a, _, _)| uf.find(*a) == root)
                    .map(|(_, _, note)| note.clone())
                    .collect();
                DuplicateGroup::new(members.iter().map(|&m| nodes[m].id.clone()), group_notes)
            })
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));

        for group in &groups {
            debug!(key = %group.key, size = group.len(), "Duplicate group found");
        }
        info!(
            nodes = nodes.len(),
            fresh = seen_fresh.len(),
            comparisons = compared.len(),
            groups = groups.len(),
            "Duplicate detection finished"
        );

        DetectionRun {
            run_id: Uuid::new_v4().to_string(),
            started_at,
            groups,
            comparisons: compared.len(),
        }
    }

    /// Blocking-key partners first, then a random fill up to `sample_size`
    fn sample_partners(
        &mut self,
        i: usize,
        nodes: &[Node],
        blocks: &BTreeMap<String, Vec<usize>>,
    ) -> Vec<usize> {
        let budget = self.config.sample_size;
        let mut chosen: Vec<usize> = Vec::with_capacity(budget);
        let mut taken: HashSet<usize> = HashSet::from([i]);

        for key in blocking_keys(&nodes[i]) {
            for &j in blocks.get(&key).into_iter().flatten() {
                if chosen.len() >= budget {
                    return chosen;
                }
                if taken.insert(j) {
                    chosen.push(j);
                }
            }
        }

        if chosen.len() < budget {
            // Oversample by the taken count so the fill never comes up short
            let need = budget - chosen.len();
            let amount = (need + taken.len()).min(nodes.len());
            let picks = index::sample(&mut self.rng, nodes.len(), amount);
            chosen.extend(picks.into_iter().filter(|j| !taken.contains(j)).take(need));
        }
        chosen
    }
}

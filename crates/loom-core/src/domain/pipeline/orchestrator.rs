//! Pipeline orchestration
//!
//! Text units flow through resolution, extraction and taxonomy placement on
//! parallel workers, then commit as candidate batches. Detection and
//! consolidation run as separate cycles over the nodes committed since the
//! last cycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::gate::PipelineGate;
use crate::domain::consolidation::{BatchCommit, ConsolidationEngine, MergeDecision, MergeProposal};
use crate::domain::dedup::{DetectionRun, DuplicateDetector, DuplicateGroup};
use crate::domain::extraction::{ExtractionStage, ResolutionStage, TextUnit};
use crate::domain::graph::{GraphStore, Node};
use crate::domain::taxonomy::TaxonomyPlacer;
use crate::error::{Error, Result};
use crate::llm::{ProposalGateway, StageRequest};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Units processed concurrently
    pub workers: usize,
    /// Preceding units passed to resolution as context
    pub context_window: usize,
    pub detection_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            context_window: 3,
            detection_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Committed,
    /// Extraction proposed nothing
    Empty,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Empty => "empty",
            Self::Failed => "failed",
        }
    }
}

/// What happened to one text unit
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit_id: String,
    pub status: UnitStatus,
    pub commit: Option<BatchCommit>,
    pub error: Option<String>,
}

impl UnitOutcome {
    pub fn is_committed(&self) -> bool {
        self.status == UnitStatus::Committed
    }

    /// Committed ids of the unit's nodes
    pub fn node_ids(&self) -> Vec<String> {
        self.commit
            .as_ref()
            .map(|c| c.node_ids.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// What one detection and consolidation cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub run_id: Option<String>,
    pub fresh_nodes: usize,
    pub comparisons: usize,
    pub groups: usize,
    pub merged: usize,
    pub deferred: usize,
    pub rejected: usize,
    /// Skipped because the pipeline was paused
    pub paused: bool,
}

/// Split a document into text units: one per sentence, paragraphs kept apart
pub fn split_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    for paragraph in text.split("\n\n") {
        let mut current = String::new();
        let mut chars = paragraph.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(if c == '\n' { ' ' } else { c });
            let boundary = matches!(c, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace());
            if boundary {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    units.push(sentence.to_string());
                }
                current.clear();
            }
        }
        let rest = current.trim();
        if !rest.is_empty() {
            units.push(rest.to_string());
        }
    }
    units
}

pub struct Pipeline {
    store: Arc<GraphStore>,
    engine: Arc<ConsolidationEngine>,
    gateway: Arc<ProposalGateway>,
    resolution: ResolutionStage,
    extraction: ExtractionStage,
    placer: TaxonomyPlacer,
    detector: tokio::sync::Mutex<DuplicateDetector>,
    /// Placement reads the tree and the commit may grow it; holding this
    /// across both keeps concurrent batches within the tree's bounds
    placement: tokio::sync::Mutex<()>,
    fresh: Mutex<BTreeSet<String>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        engine: Arc<ConsolidationEngine>,
        gateway: Arc<ProposalGateway>,
        placer: TaxonomyPlacer,
        detector: DuplicateDetector,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            resolution: ResolutionStage::new(Arc::clone(&gateway)),
            extraction: ExtractionStage::new(Arc::clone(&gateway)),
            engine,
            gateway,
            placer,
            detector: tokio::sync::Mutex::new(detector),
            placement: tokio::sync::Mutex::new(()),
            fresh: Mutex::new(BTreeSet::new()),
            config,
        }
    }

    pub fn engine(&self) -> &Arc<ConsolidationEngine> {
        &self.engine
    }

    pub fn gate(&self) -> &PipelineGate {
        self.engine.gate()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Text units for a document, each carrying its preceding units as context
    pub fn units_for_document(&self, text: &str) -> Vec<TextUnit> {
        let sentences = split_units(text);
        sentences
            .iter()
            .enumerate()
            .map(|(i, sentence)| {
                let start = i.saturating_sub(self.config.context_window);
                TextUnit::new(sentence.clone()).with_context(sentences[start..i].to_vec())
            })
            .collect()
    }

    /// Resolve, extract, place and commit one unit
    pub async fn ingest_unit(&self, unit: &TextUnit) -> UnitOutcome {
        match self.process_unit(unit).await {
            Ok(Some(commit)) => {
                if let Ok(mut fresh) = self.fresh.lock() {
                    fresh.extend(commit.node_ids.values().cloned());
                }
                UnitOutcome {
                    unit_id: unit.id.clone(),
                    status: UnitStatus::Committed,
                    commit: Some(commit),
                    error: None,
                }
            }
            Ok(None) => UnitOutcome {
                unit_id: unit.id.clone(),
                status: UnitStatus::Empty,
                commit: None,
                error: None,
            },
            Err(e) => {
                warn!(unit_id = %unit.id, code = e.code(), error = %e, "Unit failed");
                UnitOutcome {
                    unit_id: unit.id.clone(),
                    status: UnitStatus::Failed,
                    commit: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn process_unit(&self, unit: &TextUnit) -> Result<Option<BatchCommit>> {
        let resolved = self.resolution.resolve(unit).await?;
        let mut batch = self.extraction.extract(&resolved).await?;
        if batch.is_empty() {
            return Ok(None);
        }

        loop {
            self.gate().wait_until_open().await;
            let _placing = self.placement.lock().await;
            let tree = self.store.taxonomy().await;
            self.placer.place_batch(&tree, &mut batch.nodes);
            match self.engine.commit_batch(&batch).await {
                Err(Error::PipelinePaused(reason)) => {
                    debug!(unit_id = %unit.id, reason = %reason, "Commit held by pause");
                    continue;
                }
                other => return other.map(Some),
            }
        }
    }

    /// Ingest units on up to `workers` concurrent tasks; outcomes arrive in
    /// completion order
    pub async fn ingest(&self, units: Vec<TextUnit>) -> Vec<UnitOutcome> {
        let workers = self.config.workers.max(1);
        let outcomes: Vec<UnitOutcome> = stream::iter(units)
            .map(|unit| async move { self.ingest_unit(&unit).await })
            .buffer_unordered(workers)
            .collect()
            .await;
        let committed = outcomes.iter().filter(|o| o.is_committed()).count();
        let failed = outcomes
            .iter()
            .filter(|o| o.status == UnitStatus::Failed)
            .count();
        info!(units = outcomes.len(), committed, failed, "Ingest finished");
        outcomes
    }

    pub async fn ingest_document(&self, text: &str) -> Vec<UnitOutcome> {
        let units = self.units_for_document(text);
        self.ingest(units).await
    }

    /// Queue every committed node for the next detection cycle
    pub async fn mark_all_fresh(&self) {
        let ids: Vec<String> = {
            let snapshot = self.store.snapshot().await;
            snapshot.nodes().map(|n| n.id.clone()).collect()
        };
        if let Ok(mut fresh) = self.fresh.lock() {
            fresh.extend(ids);
        }
    }

    pub fn pending_fresh(&self) -> usize {
        self.fresh.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Detect duplicates around the nodes committed since the last cycle and
    /// decide every group
    pub async fn run_detection_cycle(&self) -> Result<CycleReport> {
        if self.gate().is_paused() {
            debug!("Detection cycle skipped while paused");
            return Ok(CycleReport {
                paused: true,
                ..CycleReport::default()
            });
        }
        let fresh: Vec<String> = match self.fresh.lock() {
            Ok(mut fresh) => std::mem::take(&mut *fresh).into_iter().collect(),
            Err(_) => return Err(Error::Other("fresh node set poisoned".to_string())),
        };
        if fresh.is_empty() {
            return Ok(CycleReport::default());
        }

        let (nodes, fresh): (Vec<Node>, Vec<String>) = {
            let snapshot = self.store.snapshot().await;
            let live: BTreeSet<String> = fresh.iter().filter_map(|id| snapshot.resolve(id)).collect();
            (snapshot.nodes().cloned().collect(), live.into_iter().collect())
        };

        let DetectionRun {
            run_id,
            groups,
            comparisons,
            ..
        } = self.detector.lock().await.detect(&nodes, &fresh);
        let mut report = CycleReport {
            run_id: Some(run_id.clone()),
            fresh_nodes: fresh.len(),
            comparisons,
            groups: groups.len(),
            ..CycleReport::default()
        };

        // Groups of one run are disjoint, so each is decided exactly once
        let work: Vec<(DuplicateGroup, Vec<Node>)> = {
            let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
            groups
                .into_iter()
                .map(|group| {
                    let members = group
                        .node_ids
                        .iter()
                        .filter_map(|id| by_id.get(id.as_str()).map(|n| (*n).clone()))
                        .collect();
                    (group, members)
                })
                .collect()
        };
        let decisions: Vec<MergeDecision> = stream::iter(work)
            .map(|(group, members)| async move { self.decide_group(&group, members).await })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        for decision in decisions {
            match decision {
                MergeDecision::Merged { .. } => report.merged += 1,
                MergeDecision::Deferred { .. } => report.deferred += 1,
                MergeDecision::Rejected { .. } => report.rejected += 1,
            }
        }

        info!(
            run_id = %run_id,
            fresh = report.fresh_nodes,
            groups = report.groups,
            merged = report.merged,
            deferred = report.deferred,
            rejected = report.rejected,
            "Detection cycle finished"
        );
        Ok(report)
    }

    async fn decide_group(&self, group: &DuplicateGroup, members: Vec<Node>) -> MergeDecision {
        let request = StageRequest::Consolidation {
            group_key: group.key.clone(),
            nodes: members,
            notes: group.notes.clone(),
        };
        match self
            .gateway
            .propose_with(&request, |p: &MergeProposal| p.validate())
            .await
        {
            Ok(proposal) => self.engine.consolidate(group, &proposal).await,
            Err(e) => self
                .engine
                .defer_unproposed(group, format!("no usable proposal: {}", e)),
        }
    }

    /// Run detection cycles every `detection_interval` until `stop` turns
    /// true or its sender is dropped
    pub fn spawn_schedule(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.detection_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_detection_cycle().await {
                            warn!(error = %e, "Detection cycle failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            debug!("Detection schedule stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::consolidation::ConsolidationConfig;
    use crate::domain::dedup::DetectorConfig;
    use crate::domain::locking::NodeLockManager;
    use crate::llm::GatewayConfig;
    use crate::test_support::ScriptedModelClient;
    use serde_json::json;

    /// Echoes resolution, extracts one person per capitalized first word and
    /// says yes to every merge
    fn model() -> Arc<ScriptedModelClient> {
        Arc::new(ScriptedModelClient::new(|request, _| match request {
            StageRequest::Resolution { text, .. } => Ok(json!({ "rewritten": text })),
            StageRequest::Extraction { text, .. } => {
                let name = text.split_whitespace().next().unwrap_or("").trim_matches('.');
                if name.is_empty() || name.chars().next().is_some_and(char::is_lowercase) {
                    return Ok(json!({}));
                }
                Ok(json!({
                    "nodes": [{
                        "temp_id": "n1",
                        "type": "person",
                        "label": name,
                        "core": "a person",
                        "source_sentence": text,
                        "confidence": 0.9
                    }]
                }))
            }
            StageRequest::Consolidation { .. } => {
                Ok(json!({"same_entity": true, "merge_confidence": 0.9}))
            }
        }))
    }

    fn pipeline(client: Arc<ScriptedModelClient>) -> Pipeline {
        pipeline_with(client, PipelineConfig::default())
    }

    fn pipeline_with(client: Arc<ScriptedModelClient>, config: PipelineConfig) -> Pipeline {
        let store = Arc::new(GraphStore::in_memory());
        let engine = Arc::new(ConsolidationEngine::new(
            store,
            Arc::new(NodeLockManager::with_defaults()),
            PipelineGate::new(),
            ConsolidationConfig::default(),
        ));
        let gateway = Arc::new(ProposalGateway::new(
            client,
            GatewayConfig {
                max_retries: 1,
                retry_backoff: Duration::ZERO,
            },
        ));
        Pipeline::new(
            engine,
            gateway,
            TaxonomyPlacer::default(),
            DuplicateDetector::new(DetectorConfig {
                seed: Some(7),
                ..DetectorConfig::default()
            }),
            config,
        )
    }

    #[test]
    fn test_split_units() {
        let units = split_units("Alice met Bob. They talked!\nLater, rain.\n\nDr. no");
        assert_eq!(
            units,
            vec!["Alice met Bob.", "They talked!", "Later, rain.", "Dr.", "no"]
        );
        assert!(split_units("  \n\n ").is_empty());
    }

    #[test]
    fn test_units_carry_context_window() {
        let p = pipeline(model());
        let units = p.units_for_document("A one. B two. C three. D four. E five.");
        assert_eq!(units.len(), 5);
        assert!(units[0].context.is_empty());
        assert_eq!(units[4].context, vec!["B two.", "C three.", "D four."]);
    }

    #[tokio::test]
    async fn test_ingest_then_merge_duplicates() {
        let p = pipeline(model());
        let outcomes = p
            .ingest_document("Alice arrived. nothing here. Alice left.")
            .await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.is_committed()).count(), 2);
        assert_eq!(
            outcomes.iter().filter(|o| o.status == UnitStatus::Empty).count(),
            1
        );
        assert_eq!(p.pending_fresh(), 2);

        let report = p.run_detection_cycle().await.unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.merged, 1);
        assert_eq!(p.pending_fresh(), 0);
        assert_eq!(p.engine().store().stats().await.nodes, 1);

        // Nothing new since the last cycle
        let report = p.run_detection_cycle().await.unwrap();
        assert_eq!(report.groups, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_unit_failed() {
        let client = Arc::new(ScriptedModelClient::new(|_, _| Ok(json!({"bogus": 1}))));
        let p = pipeline(Arc::clone(&client));
        let outcome = p.ingest_unit(&TextUnit::new("Alice arrived.")).await;
        assert_eq!(outcome.status, UnitStatus::Failed);
        assert!(outcome.error.unwrap().contains("gave up after 2 attempts"));
        assert_eq!(client.attempts(), 2);
    }

    #[tokio::test]
    async fn test_paused_cycle_is_skipped() {
        let p = pipeline(model());
        p.ingest_document("Alice arrived. Alice left.").await;
        p.gate().pause("operator");
        let report = p.run_detection_cycle().await.unwrap();
        assert!(report.paused);
        assert_eq!(p.pending_fresh(), 2);

        p.gate().resume();
        let report = p.run_detection_cycle().await.unwrap();
        assert_eq!(report.merged, 1);
    }

    #[tokio::test]
    async fn test_rejected_group_decided_once_per_cycle() {
        let client = Arc::new(ScriptedModelClient::new(|request, _| match request {
            StageRequest::Resolution { text, .. } => Ok(json!({ "rewritten": text })),
            StageRequest::Extraction { text, .. } => Ok(json!({
                "nodes": [{
                    "temp_id": "n1",
                    "type": "person",
                    "label": "Alice",
                    "core": "a person",
                    "source_sentence": text,
                    "confidence": 0.9
                }]
            })),
            StageRequest::Consolidation { .. } => {
                Ok(json!({"same_entity": false, "merge_confidence": 0.1}))
            }
        }));
        let p = pipeline(Arc::clone(&client));
        p.ingest_document("Alice arrived. Alice left.").await;
        let before = client.attempts();

        let report = p.run_detection_cycle().await.unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(client.attempts() - before, 1);
        assert_eq!(p.engine().store().stats().await.nodes, 2);
    }

    #[tokio::test]
    async fn test_schedule_runs_until_stopped() {
        let p = Arc::new(pipeline_with(
            model(),
            PipelineConfig {
                detection_interval: Duration::from_millis(10),
                ..PipelineConfig::default()
            },
        ));
        p.ingest_document("Alice arrived. Alice left.").await;

        let (stop, stop_rx) = watch::channel(false);
        let handle = Arc::clone(&p).spawn_schedule(stop_rx);
        for _ in 0..200 {
            if p.engine().store().stats().await.nodes == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(p.engine().store().stats().await.nodes, 1);
        assert_eq!(p.pending_fresh(), 0);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

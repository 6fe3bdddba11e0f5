//! The repair loop
//!
//! Scans committed nodes, critiques what it finds, fixes the unambiguous
//! cases with ordinary transactions and escalates the rest to an operator.
//! Escalations go out over a channel; verdicts come back through a
//! [`RepairController`] and are drained at the start of every tick, so a
//! slow operator never blocks the loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::analyzer::{Critique, apply_fix, critique, scan};
use super::case::{ProblemKind, RepairCase, RepairFix, RepairStatus, Verdict};
use super::clock::{Clock, ReferenceZone, SystemClock};
use crate::domain::consolidation::{ConsolidationEngine, DeferredMerge, MergeProposal};
use crate::domain::graph::{GraphStore, Transaction};
use crate::domain::locking::NodeLockManager;
use crate::domain::pipeline::PipelineGate;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Zone postponement timestamps are shown in
    pub reference_offset: FixedOffset,
    /// Zone naive operator timestamps are read in
    pub upstream_offset: FixedOffset,
    pub scan_interval: Duration,
    /// Longest wait for a node lock before an auto-fix is retried next tick
    pub lock_timeout: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            reference_offset: Utc.fix(),
            upstream_offset: Utc.fix(),
            scan_interval: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl RepairConfig {
    pub fn zone(&self) -> ReferenceZone {
        ReferenceZone::new(self.reference_offset, self.upstream_offset)
    }
}

/// A case waiting on an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub case_id: String,
    pub node_id: String,
    pub problem: ProblemKind,
    pub problem_description: String,
    pub suggested_actions: Vec<String>,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct VerdictSubmission {
    case_id: String,
    verdict: Verdict,
}

/// Operator-side handle: receives escalations, sends verdicts
pub struct RepairController {
    verdicts: mpsc::UnboundedSender<VerdictSubmission>,
    escalations: mpsc::UnboundedReceiver<Escalation>,
    gate: PipelineGate,
    zone: ReferenceZone,
}

impl RepairController {
    /// Queue a verdict; it is applied on the loop's next tick
    pub fn submit(&self, case_id: impl Into<String>, verdict: Verdict) -> Result<()> {
        let case_id = case_id.into();
        self.verdicts
            .send(VerdictSubmission { case_id, verdict })
            .map_err(|_| Error::Other("repair loop has stopped".to_string()))
    }

    /// Queue a typed verdict line such as `postpone 2024-05-01 09:00`
    pub fn submit_line(&self, case_id: impl Into<String>, line: &str) -> Result<()> {
        let verdict = Verdict::parse(line, &self.zone)?;
        self.submit(case_id, verdict)
    }

    pub async fn next_escalation(&mut self) -> Option<Escalation> {
        self.escalations.recv().await
    }

    pub fn try_next_escalation(&mut self) -> Option<Escalation> {
        self.escalations.try_recv().ok()
    }

    /// Lift a `pause_entire_pipeline` verdict
    pub fn resume_pipeline(&self) {
        self.gate.resume();
    }

    pub fn zone(&self) -> &ReferenceZone {
        &self.zone
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub verdicts_applied: usize,
    /// Postponed case ids moved back to open
    pub requeued: Vec<String>,
    pub deferred_received: usize,
    pub opened: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub escalated: usize,
}

pub struct RepairLoop {
    store: Arc<GraphStore>,
    locks: Arc<NodeLockManager>,
    gate: PipelineGate,
    clock: Arc<dyn Clock>,
    config: RepairConfig,
    engine: Option<Arc<ConsolidationEngine>>,
    cases: BTreeMap<String, RepairCase>,
    /// Operator skips: node version each (node, problem) was skipped at
    skipped: HashMap<(String, ProblemKind), u64>,
    escalations: mpsc::UnboundedSender<Escalation>,
    verdicts: mpsc::UnboundedReceiver<VerdictSubmission>,
    deferred: Option<mpsc::UnboundedReceiver<DeferredMerge>>,
}

impl RepairLoop {
    pub fn new(
        store: Arc<GraphStore>,
        locks: Arc<NodeLockManager>,
        gate: PipelineGate,
        config: RepairConfig,
    ) -> (Self, RepairController) {
        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        let controller = RepairController {
            verdicts: verdict_tx,
            escalations: escalation_rx,
            gate: gate.clone(),
            zone: config.zone(),
        };
        let repair = Self {
            store,
            locks,
            gate,
            clock: Arc::new(SystemClock),
            config,
            engine: None,
            cases: BTreeMap::new(),
            skipped: HashMap::new(),
            escalations: escalation_tx,
            verdicts: verdict_rx,
            deferred: None,
        };
        (repair, controller)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine used to carry out operator-approved merges
    pub fn with_engine(mut self, engine: Arc<ConsolidationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// A sender for the consolidation engine's deferred groups
    pub fn deferred_sink(&mut self) -> mpsc::UnboundedSender<DeferredMerge> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.deferred = Some(rx);
        tx
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    pub fn case(&self, id: &str) -> Option<&RepairCase> {
        self.cases.get(id)
    }

    pub fn cases(&self) -> impl Iterator<Item = &RepairCase> {
        self.cases.values()
    }

    fn with_status(&self, status: RepairStatus) -> Vec<&RepairCase> {
        self.cases.values().filter(|c| c.status == status).collect()
    }

    pub fn open_cases(&self) -> Vec<&RepairCase> {
        self.with_status(RepairStatus::Open)
    }

    pub fn escalated_cases(&self) -> Vec<&RepairCase> {
        self.with_status(RepairStatus::Escalated)
    }

    pub fn postponed_cases(&self) -> Vec<&RepairCase> {
        self.with_status(RepairStatus::Postponed)
    }

    /// One full pass: verdicts, due postponements, deferred merges, a fresh
    /// scan, then critique of everything open
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport {
            verdicts_applied: self.drain_verdicts(),
            requeued: self.requeue_due(),
            deferred_received: self.drain_deferred(),
            ..TickReport::default()
        };
        report.opened = self.scan().await;
        self.process_open(&mut report).await?;
        if report != TickReport::default() {
            info!(
                verdicts = report.verdicts_applied,
                requeued = report.requeued.len(),
                opened = report.opened,
                resolved = report.resolved,
                skipped = report.skipped,
                escalated = report.escalated,
                "Repair tick"
            );
        }
        Ok(report)
    }

    /// Run ticks every `scan_interval` until `stop` turns true or is dropped
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Repair tick failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!("Repair loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Move every due postponed case back to open
    pub fn requeue_due(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let mut requeued = Vec::new();
        for case in self.cases.values_mut().filter(|c| c.is_due(now)) {
            if case.transition(RepairStatus::Open, now).is_ok() {
                debug!(case_id = %case.id, node_id = %case.node_id, "Postponed case requeued");
                requeued.push(case.id.clone());
            }
        }
        requeued
    }

    fn has_active(&self, node_id: &str, problem: ProblemKind) -> bool {
        self.cases
            .values()
            .any(|c| !c.status.is_terminal() && c.node_id == node_id && c.problem == problem)
    }

    /// Whether the operator skipped this problem on this version of the node.
    /// A skip lapses once the node changes.
    fn is_skipped(&mut self, node_id: &str, problem: ProblemKind, version: u64) -> bool {
        let key = (node_id.to_string(), problem);
        match self.skipped.get(&key) {
            Some(&at) if at == version => true,
            Some(_) => {
                self.skipped.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Open a case for every new finding; returns how many were opened
    pub async fn scan(&mut self) -> usize {
        let findings = {
            let snapshot = self.store.snapshot().await;
            scan(&snapshot)
        };
        let now = self.clock.now();
        let mut opened = 0;
        for finding in findings {
            if self.has_active(&finding.node_id, finding.problem)
                || self.is_skipped(&finding.node_id, finding.problem, finding.node_version)
            {
                continue;
            }
            let case = finding.into_case(now);
            debug!(case_id = %case.id, node_id = %case.node_id, problem = %case.problem, "Repair case opened");
            self.cases.insert(case.id.clone(), case);
            opened += 1;
        }
        opened
    }

    /// Turn deferred merges into cases; returns how many arrived
    pub fn drain_deferred(&mut self) -> usize {
        let mut incoming = Vec::new();
        if let Some(rx) = self.deferred.as_mut() {
            while let Ok(record) = rx.try_recv() {
                incoming.push(record);
            }
        }
        let count = incoming.len();
        let now = self.clock.now();
        for record in incoming {
            let already = self.cases.values().any(|c| {
                !c.status.is_terminal() && c.group.as_ref().is_some_and(|g| g.key == record.group.key)
            });
            if already {
                continue;
            }
            let anchor = record.group.node_ids.iter().next().cloned().unwrap_or_default();
            let description = format!(
                "merge of {} nodes deferred: {}",
                record.group.len(),
                record.reason
            );
            let case = RepairCase::new(
                anchor,
                ProblemKind::DeferredMerge,
                description,
                vec!["instruct merge".to_string(), "instruct keep separate".to_string()],
                now,
            )
            .with_group(record.group);
            self.cases.insert(case.id.clone(), case);
        }
        count
    }

    /// Apply every queued verdict; returns how many were applied
    pub fn drain_verdicts(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(submission) = self.verdicts.try_recv() {
            match self.submit_verdict(&submission.case_id, submission.verdict) {
                Ok(()) => applied += 1,
                Err(e) => warn!(case_id = %submission.case_id, error = %e, "Verdict not applied"),
            }
        }
        applied
    }

    /// Apply one verdict to an escalated case
    pub fn submit_verdict(&mut self, case_id: &str, verdict: Verdict) -> Result<()> {
        let now = self.clock.now();
        let case = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| Error::RepairCaseNotFound(case_id.to_string()))?;
        if case.status != RepairStatus::Escalated {
            return Err(Error::InvalidVerdict {
                case_id: case_id.to_string(),
                reason: format!("case is {}, not escalated", case.status),
            });
        }
        info!(case_id = %case_id, verdict = verdict.as_str(), "Verdict received");
        match verdict {
            Verdict::PauseEntirePipeline => {
                self.gate.pause(format!(
                    "repair case {} on node {}: {}",
                    case.id, case.node_id, case.problem_description
                ));
            }
            Verdict::SkipThisNode => {
                case.transition(RepairStatus::Skipped, now)?;
                case.note = Some("skipped by operator".to_string());
                if let Some(version) = case.node_version {
                    self.skipped
                        .insert((case.node_id.clone(), case.problem), version);
                }
            }
            Verdict::PostponeUntil { until } => {
                case.transition(RepairStatus::Postponed, now)?;
                case.postponed_until = Some(until);
                debug!(
                    case_id = %case_id,
                    until = %self.config.zone().display(until),
                    "Case postponed"
                );
            }
            Verdict::Instructions { text } => {
                if text.trim().is_empty() {
                    return Err(Error::InvalidVerdict {
                        case_id: case_id.to_string(),
                        reason: "instructions are empty".to_string(),
                    });
                }
                case.instructions.push(text.trim().to_string());
                case.transition(RepairStatus::Open, now)?;
            }
        }
        Ok(())
    }

    async fn process_open(&mut self, report: &mut TickReport) -> Result<()> {
        let open: Vec<String> = self.open_cases().iter().map(|c| c.id.clone()).collect();
        for case_id in open {
            let Some(case) = self.cases.get(&case_id).cloned() else {
                continue;
            };
            let verdict = {
                let snapshot = self.store.snapshot().await;
                critique(&case, &snapshot)
            };
            if let Critique::Fix(_) = &verdict
                && self.gate.is_paused()
            {
                // Fixes are transactions; hold them until the gate opens
                continue;
            }
            let now = self.clock.now();
            self.update(&case_id, |c| c.transition(RepairStatus::Critiqued, now))?;

            let outcome = match verdict {
                Critique::Skip(reason) => Outcome::Skipped(reason),
                Critique::AlreadyFixed => Outcome::Resolved("already fixed".to_string()),
                Critique::Fix(fix) => match self.apply(&case, &fix).await {
                    Ok(note) => Outcome::Resolved(note),
                    Err(FixFailure::Stale(reason)) => Outcome::Skipped(reason),
                    Err(FixFailure::Retry(reason)) => Outcome::Retry(reason),
                    Err(FixFailure::Escalate(reason)) => Outcome::Escalated(reason),
                },
                Critique::Escalate(reason) => Outcome::Escalated(reason),
            };
            self.finish(&case_id, outcome, report)?;
        }
        Ok(())
    }

    fn update(&mut self, case_id: &str, f: impl FnOnce(&mut RepairCase) -> Result<()>) -> Result<()> {
        let case = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| Error::RepairCaseNotFound(case_id.to_string()))?;
        f(case)
    }

    fn finish(&mut self, case_id: &str, outcome: Outcome, report: &mut TickReport) -> Result<()> {
        let now = self.clock.now();
        let case = self
            .cases
            .get_mut(case_id)
            .ok_or_else(|| Error::RepairCaseNotFound(case_id.to_string()))?;
        match outcome {
            Outcome::Resolved(note) => {
                case.transition(RepairStatus::Resolved, now)?;
                info!(case_id = %case.id, node_id = %case.node_id, problem = %case.problem, note = %note, "Repair case resolved");
                case.note = Some(note);
                report.resolved += 1;
            }
            Outcome::Skipped(note) => {
                case.transition(RepairStatus::Skipped, now)?;
                debug!(case_id = %case.id, note = %note, "Repair case skipped");
                case.note = Some(note);
                report.skipped += 1;
            }
            Outcome::Retry(note) => {
                case.transition(RepairStatus::Open, now)?;
                debug!(case_id = %case.id, note = %note, "Repair fix deferred to next tick");
                case.note = Some(note);
            }
            Outcome::Escalated(reason) => {
                case.transition(RepairStatus::Escalated, now)?;
                case.note = Some(reason.clone());
                let escalation = Escalation {
                    case_id: case.id.clone(),
                    node_id: case.node_id.clone(),
                    problem: case.problem,
                    problem_description: case.problem_description.clone(),
                    suggested_actions: case.suggested_actions.clone(),
                    reason,
                    escalated_at: now,
                };
                info!(case_id = %case.id, node_id = %case.node_id, problem = %case.problem, "Repair case escalated");
                if self.escalations.send(escalation).is_err() {
                    warn!(case_id = %case.id, "No operator listening for escalations");
                }
                report.escalated += 1;
            }
        }
        Ok(())
    }

    async fn apply(&self, case: &RepairCase, fix: &RepairFix) -> std::result::Result<String, FixFailure> {
        if let RepairFix::Merge = fix {
            return self.apply_merge(case).await;
        }

        let holder = format!("repair case {}", case.id);
        let _guard = self
            .locks
            .acquire(&case.node_id, &holder, Some(self.config.lock_timeout))
            .await
            .map_err(|e| FixFailure::Retry(format!("node busy: {}", e)))?;

        let node = match self.store.get_node(&case.node_id).await {
            Ok(node) => node,
            Err(e) => return Err(FixFailure::Stale(e.to_string())),
        };
        let fixed = apply_fix(&node, fix).map_err(|e| FixFailure::Escalate(e.to_string()))?;
        let mut tx = Transaction::new(format!("repair {} on {}", case.problem, case.node_id));
        tx.upsert_node(fixed);
        match self.store.apply(tx).await {
            Ok(commit) => Ok(format!("fixed in commit {}", commit.sequence)),
            Err(Error::StaleReference(id)) => Err(FixFailure::Stale(format!("node '{}' was retired", id))),
            Err(e) => Err(FixFailure::Escalate(format!("fix did not commit: {}", e))),
        }
    }

    async fn apply_merge(&self, case: &RepairCase) -> std::result::Result<String, FixFailure> {
        let Some(engine) = &self.engine else {
            return Err(FixFailure::Escalate(
                "no consolidation engine attached to carry out the merge".to_string(),
            ));
        };
        let Some(group) = &case.group else {
            return Err(FixFailure::Escalate("deferred merge without a group".to_string()));
        };
        let mut proposal = MergeProposal::same(1.0);
        proposal.rationale = Some(format!("operator approved in repair case {}", case.id));
        let decision = engine.consolidate(group, &proposal).await;
        match decision.survivor() {
            Some(survivor) => Ok(format!("merged into '{}'", survivor)),
            None => match decision.reason() {
                Some("already-merged") => Ok("already merged".to_string()),
                Some(reason) => Err(FixFailure::Escalate(format!("merge {}: {}", decision.kind(), reason))),
                None => Err(FixFailure::Escalate(format!("merge {}", decision.kind()))),
            },
        }
    }
}

enum Outcome {
    Resolved(String),
    Skipped(String),
    Retry(String),
    Escalated(String),
}

enum FixFailure {
    /// The node is gone; the case no longer applies
    Stale(String),
    /// Try again next tick
    Retry(String),
    Escalate(String),
}

//! # Reputation Engine
//!
//! Rule-based behavioral scoring (RBCET). Every observed behavior maps
//! to a fixed-weight event; scores accumulate from a neutral starting
//! point and are clamped to `[0, 100]`. The full score history per
//! node is kept append-only so observers can chart trajectories.

use serde::{Deserialize, Serialize};

use crate::NodeId;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;
pub const INITIAL_SCORE: f64 = 50.0;

/// Observable node behaviors, in scoring order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorEvent {
    /// Vote delivered within its view.
    TimelyVote,
    /// Took part in a commit that finalized a block.
    CommitParticipation,
    /// Withheld an expected vote, or stalled a view as leader.
    MissedVote,
    /// Message attributably delivered after its view had passed.
    LateResponse,
    /// Sent conflicting proposals for the same height and view.
    Equivocation,
}

impl BehaviorEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorEvent::TimelyVote => "timely_vote",
            BehaviorEvent::CommitParticipation => "commit_participation",
            BehaviorEvent::MissedVote => "missed_vote",
            BehaviorEvent::LateResponse => "late_response",
            BehaviorEvent::Equivocation => "equivocation",
        }
    }
}

/// Score deltas per behavior event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationWeights {
    pub timely_vote: f64,
    pub commit_participation: f64,
    pub missed_vote: f64,
    pub late_response: f64,
    pub equivocation: f64,
}

impl Default for ReputationWeights {
    fn default() -> Self {
        Self {
            timely_vote: 1.0,
            commit_participation: 0.5,
            missed_vote: -2.0,
            late_response: -1.0,
            equivocation: -10.0,
        }
    }
}

impl ReputationWeights {
    pub fn weight_for(&self, event: BehaviorEvent) -> f64 {
        match event {
            BehaviorEvent::TimelyVote => self.timely_vote,
            BehaviorEvent::CommitParticipation => self.commit_participation,
            BehaviorEvent::MissedVote => self.missed_vote,
            BehaviorEvent::LateResponse => self.late_response,
            BehaviorEvent::Equivocation => self.equivocation,
        }
    }
}

/// One node's standing, exposed through `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationRecord {
    pub node: NodeId,
    pub score: f64,
    pub timely_responses: u64,
    pub violations: u64,
    /// Score after each update, oldest first.
    pub history: Vec<f64>,
}

impl ReputationRecord {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            score: INITIAL_SCORE,
            timely_responses: 0,
            violations: 0,
            history: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ReputationEngine {
    weights: ReputationWeights,
    records: Vec<ReputationRecord>,
}

impl ReputationEngine {
    pub fn new(num_nodes: usize, weights: ReputationWeights) -> Self {
        Self {
            weights,
            records: (0..num_nodes as NodeId).map(ReputationRecord::new).collect(),
        }
    }

    /// Apply one behavior observation. Out-of-range node ids are
    /// ignored, which cannot happen for engine-driven observations.
    pub fn observe(&mut self, node: NodeId, event: BehaviorEvent) {
        let Some(record) = self.records.get_mut(node as usize) else {
            return;
        };
        let delta = self.weights.weight_for(event);
        record.score = (record.score + delta).clamp(MIN_SCORE, MAX_SCORE);
        record.history.push(record.score);
        if delta >= 0.0 {
            record.timely_responses += 1;
        } else {
            record.violations += 1;
        }
        tracing::trace!(
            node,
            event = event.as_str(),
            delta,
            score = record.score,
            "reputation update"
        );
    }

    pub fn score(&self, node: NodeId) -> f64 {
        self.records
            .get(node as usize)
            .map(|r| r.score)
            .unwrap_or(INITIAL_SCORE)
    }

    pub fn records(&self) -> &[ReputationRecord] {
        &self.records
    }
}

//! # Node State
//!
//! Per-node protocol state. Nodes never touch the clock or the network
//! directly: the engine hands them delivered envelopes, the protocol
//! handlers mutate this state, and any messages to send come back as
//! [`NodeOutput`]s. Vote bookkeeping lives in ordered maps keyed by
//! `(height, view, block)` so iteration order is deterministic.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Block, BlockId, Height, NodeId, ProtocolMessage, Stake, ViewNumber};

/// How a malicious node deviates from the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaliciousStrategy {
    /// Suppress own vote-phase messages (and proposals when leader).
    pub withhold_votes: bool,
    /// Send conflicting block candidates to different peers.
    pub equivocate: bool,
    /// Extra seconds added to every message this node sends.
    pub extra_delay: Option<f64>,
}

impl MaliciousStrategy {
    pub fn withholding() -> Self {
        Self {
            withhold_votes: true,
            ..Self::default()
        }
    }

    pub fn equivocating() -> Self {
        Self {
            equivocate: true,
            ..Self::default()
        }
    }

    pub fn laggard(extra_secs: f64) -> Self {
        Self {
            extra_delay: Some(extra_secs),
            ..Self::default()
        }
    }

    /// Preset cycle used when a config enables malicious nodes without
    /// picking a strategy.
    pub fn preset(index: usize) -> Self {
        match index % 3 {
            0 => Self::withholding(),
            1 => Self::equivocating(),
            _ => Self::laggard(2.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Honest,
    Malicious(MaliciousStrategy),
}

impl Role {
    pub fn is_malicious(&self) -> bool {
        matches!(self, Role::Malicious(_))
    }

    pub fn strategy(&self) -> Option<&MaliciousStrategy> {
        match self {
            Role::Honest => None,
            Role::Malicious(strategy) => Some(strategy),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Honest => "honest",
            Role::Malicious(_) => "malicious",
        }
    }
}

/// Where a node is within the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingProposal,
    Voting,
}

/// What a protocol handler asks the engine to do.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Send to every other node, subject to network drops and delays.
    Broadcast(ProtocolMessage),
    /// This node appended the block to its local chain.
    Finalized(Block),
}

/// Per-node traffic counters, reported through `status()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounters {
    pub sent: u64,
    pub received: u64,
    /// Messages ignored because their height or view had passed.
    pub stale: u64,
}

#[derive(Debug)]
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    pub stake: Stake,
    pub phase: Phase,
    /// View this node currently participates in.
    pub view: ViewNumber,
    /// Locally finalized chain, contiguous from height 1.
    pub chain: Vec<Block>,
    /// First proposal accepted per (height, view).
    pub proposals: BTreeMap<(Height, ViewNumber), Block>,
    /// PBFT prepare voters per candidate block.
    pub prepares: BTreeMap<(Height, ViewNumber, BlockId), BTreeSet<NodeId>>,
    /// PBFT commit voters per candidate block.
    pub commits: BTreeMap<(Height, ViewNumber, BlockId), BTreeSet<NodeId>>,
    /// PoS / PoA vote sets per candidate block.
    pub votes: BTreeMap<(Height, ViewNumber, BlockId), BTreeSet<NodeId>>,
    /// Guards against double-committing within one (height, view).
    pub sent_commit: BTreeSet<(Height, ViewNumber)>,
    pub counters: NodeCounters,
}

impl NodeState {
    pub fn new(id: NodeId, role: Role, stake: Stake) -> Self {
        Self {
            id,
            role,
            stake,
            phase: Phase::Idle,
            view: 0,
            chain: Vec::new(),
            proposals: BTreeMap::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            votes: BTreeMap::new(),
            sent_commit: BTreeSet::new(),
            counters: NodeCounters::default(),
        }
    }

    /// Height of the last locally finalized block.
    pub fn chain_height(&self) -> Height {
        self.chain.len() as Height
    }

    /// Identifier of the local chain tip, 0 before the first block.
    pub fn tip_id(&self) -> BlockId {
        self.chain.last().map(|b| b.id).unwrap_or(0)
    }

    /// Move into a new view; vote state for earlier views is kept so
    /// lagging deliveries can still complete.
    pub fn enter_view(&mut self, view: ViewNumber) {
        self.view = view;
        self.phase = Phase::AwaitingProposal;
    }

    /// A message is stale when it concerns an already-finalized height
    /// or a view this node has moved past.
    pub fn is_stale(&self, msg: &ProtocolMessage) -> bool {
        msg.height() <= self.chain_height() || msg.view() < self.view
    }

    /// Append a finalized block. Callers check contiguity first.
    pub fn finalize(&mut self, block: Block) {
        self.chain.push(block);
        self.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_idle_at_height_zero() {
        let node = NodeState::new(0, Role::Honest, 100);
        assert_eq!(node.chain_height(), 0);
        assert_eq!(node.tip_id(), 0);
        assert_eq!(node.phase, Phase::Idle);
    }

    #[test]
    fn stale_detection_covers_height_and_view() {
        let mut node = NodeState::new(0, Role::Honest, 100);
        node.enter_view(2);
        let old_view = ProtocolMessage::Prepare {
            height: 1,
            view: 1,
            block: 7,
        };
        assert!(node.is_stale(&old_view));

        let current = ProtocolMessage::Prepare {
            height: 1,
            view: 2,
            block: 7,
        };
        assert!(!node.is_stale(&current));

        node.finalize(Block {
            height: 1,
            view: 2,
            proposer: 0,
            parent: 0,
            id: crate::block_id(1, 0, 2, 0),
            tx_count: 3,
            proposed_at: 0,
        });
        assert!(node.is_stale(&current));
    }

    #[test]
    fn preset_cycle_covers_all_behaviors() {
        assert!(MaliciousStrategy::preset(0).withhold_votes);
        assert!(MaliciousStrategy::preset(1).equivocate);
        assert!(MaliciousStrategy::preset(2).extra_delay.is_some());
        assert_eq!(MaliciousStrategy::preset(3), MaliciousStrategy::preset(0));
    }
}

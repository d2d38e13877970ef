//! # Consensus Protocols
//!
//! One state-machine module per protocol family, behind a common
//! [`ConsensusProtocol`] dispatch enum. Handlers are pure over node
//! state: they take a delivered envelope, mutate the recipient's
//! bookkeeping, and return the broadcasts and finalizations the engine
//! should act on. Leader selection and quorum arithmetic live here so
//! the engine stays protocol-agnostic.

pub mod pbft;
pub mod poa;
pub mod pos;

use std::collections::BTreeSet;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::node::{NodeOutput, NodeState};
use crate::{Block, Envelope, Height, NodeId, SimConfig, Stake, ViewNumber};

/// Which consensus protocol a simulation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Pbft,
    ProofOfStake,
    ProofOfAuthority,
}

impl ProtocolKind {
    /// Smallest cluster for which the quorum rule is meaningful:
    /// PBFT needs 3f+1 with f >= 1; the vote-based protocols need a
    /// majority that is more than one node.
    pub fn min_nodes(&self) -> usize {
        match self {
            ProtocolKind::Pbft => 4,
            ProtocolKind::ProofOfStake => 3,
            ProtocolKind::ProofOfAuthority => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Pbft => "pbft",
            ProtocolKind::ProofOfStake => "proof_of_stake",
            ProtocolKind::ProofOfAuthority => "proof_of_authority",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PbftParams {
    pub num_nodes: usize,
    /// Tolerated Byzantine faults, `(n - 1) / 3`.
    pub faults: usize,
}

impl PbftParams {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            faults: (num_nodes - 1) / 3,
        }
    }

    /// Matching prepare or commit votes needed: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.faults + 1
    }
}

#[derive(Debug, Clone)]
pub struct PosParams {
    pub stakes: Vec<Stake>,
    pub total_stake: Stake,
}

impl PosParams {
    pub fn new(stakes: Vec<Stake>) -> Self {
        let total_stake = stakes.iter().sum();
        Self { stakes, total_stake }
    }
}

#[derive(Debug, Clone)]
pub struct PoaParams {
    /// Authorized proposers and voters, the first `k` node ids.
    pub authorities: Vec<NodeId>,
}

impl PoaParams {
    pub fn new(count: usize) -> Self {
        Self {
            authorities: (0..count as NodeId).collect(),
        }
    }

    pub fn is_authority(&self, node: NodeId) -> bool {
        (node as usize) < self.authorities.len()
    }

    /// Strict majority of the authority set.
    pub fn majority(&self) -> usize {
        self.authorities.len() / 2 + 1
    }
}

#[derive(Debug, Clone)]
pub enum ConsensusProtocol {
    Pbft(PbftParams),
    ProofOfStake(PosParams),
    ProofOfAuthority(PoaParams),
}

impl ConsensusProtocol {
    pub fn from_config(config: &SimConfig) -> Self {
        match config.protocol {
            ProtocolKind::Pbft => ConsensusProtocol::Pbft(PbftParams::new(config.num_nodes)),
            ProtocolKind::ProofOfStake => {
                ConsensusProtocol::ProofOfStake(PosParams::new(config.stake_table()))
            }
            ProtocolKind::ProofOfAuthority => ConsensusProtocol::ProofOfAuthority(PoaParams::new(
                config.authority_count.unwrap_or(config.num_nodes),
            )),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            ConsensusProtocol::Pbft(_) => ProtocolKind::Pbft,
            ConsensusProtocol::ProofOfStake(_) => ProtocolKind::ProofOfStake,
            ConsensusProtocol::ProofOfAuthority(_) => ProtocolKind::ProofOfAuthority,
        }
    }

    /// Leader for a `(height, view)` slot. PBFT and PoA rotate
    /// deterministically; PoS samples proportionally to stake.
    pub fn select_leader(
        &self,
        height: Height,
        view: ViewNumber,
        rng: &mut ChaCha8Rng,
    ) -> NodeId {
        match self {
            ConsensusProtocol::Pbft(p) => ((height + view) % p.num_nodes as u64) as NodeId,
            ConsensusProtocol::ProofOfStake(p) => {
                let target = rng.gen_range(0..p.total_stake);
                let mut cumulative = 0;
                for (id, stake) in p.stakes.iter().enumerate() {
                    cumulative += stake;
                    if target < cumulative {
                        return id as NodeId;
                    }
                }
                (p.stakes.len() - 1) as NodeId
            }
            ConsensusProtocol::ProofOfAuthority(p) => {
                p.authorities[((height + view) % p.authorities.len() as u64) as usize]
            }
        }
    }

    /// Whether a voter set reaches this protocol's quorum.
    pub fn quorum_satisfied(&self, voters: &BTreeSet<NodeId>) -> bool {
        match self {
            ConsensusProtocol::Pbft(p) => voters.len() >= p.quorum(),
            ConsensusProtocol::ProofOfStake(p) => {
                let voted: Stake = voters
                    .iter()
                    .filter_map(|id| p.stakes.get(*id as usize))
                    .sum();
                // strictly more than two thirds of total stake
                voted * 3 > p.total_stake * 2
            }
            ConsensusProtocol::ProofOfAuthority(p) => {
                voters.iter().filter(|id| p.is_authority(**id)).count() >= p.majority()
            }
        }
    }

    /// The leader opens the view by registering its own proposal and
    /// broadcasting it.
    pub fn start_round(&self, leader: &mut NodeState, block: Block) -> Vec<NodeOutput> {
        match self {
            ConsensusProtocol::Pbft(_) => pbft::start_round(leader, block),
            ConsensusProtocol::ProofOfStake(_) => pos::start_round(leader, block),
            ConsensusProtocol::ProofOfAuthority(_) => poa::start_round(leader, block),
        }
    }

    /// Handle a delivered, non-stale message on the recipient.
    pub fn on_message(&self, node: &mut NodeState, env: &Envelope) -> Vec<NodeOutput> {
        match self {
            ConsensusProtocol::Pbft(_) => pbft::on_message(self, node, env),
            ConsensusProtocol::ProofOfStake(_) => pos::on_message(self, node, env),
            ConsensusProtocol::ProofOfAuthority(_) => poa::on_message(self, node, env),
        }
    }
}

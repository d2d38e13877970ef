//! # Quorumsim
//!
//! A deterministic simulator for small consensus networks. A single
//! logical loop drives per-node protocol state machines (PBFT,
//! Proof-of-Stake or Proof-of-Authority) over a configurable network
//! model (fixed or randomized delay, probabilistic drops), scores node
//! behavior through a reputation engine, and aggregates throughput and
//! latency metrics for observers.
//!
//! The core is [`engine::Simulation`]: fully synchronous, seeded, and
//! reproducible: the same configuration and seed always produce the
//! same finalized chain. [`controller::SimulationController`] wraps it
//! with a background round loop exposing `start`/`stop`/`status`.
//!
//! ## Usage
//!
//! ```rust
//! use quorumsim::{ProtocolKind, Simulation, SimConfig};
//!
//! let config = SimConfig::new(ProtocolKind::ProofOfAuthority)
//!     .with_nodes(4)
//!     .with_delay(0.1)
//!     .with_seed(7);
//!
//! let mut sim = Simulation::new(config).expect("valid config");
//! let outcome = sim.run_round().expect("round runs");
//! println!("{:?}", outcome);
//! ```

use serde::{Deserialize, Serialize};

pub mod controller;
pub mod engine;
pub mod metrics;
pub mod network;
pub mod node;
pub mod protocol;
pub mod reputation;
pub mod scheduler;

pub use controller::SimulationController;
pub use engine::{RoundOutcome, SimEvent, Simulation, StatusSnapshot};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use network::{DelayDistribution, NetworkMode, NetworkModel};
pub use node::{MaliciousStrategy, NodeState, Role};
pub use protocol::{ConsensusProtocol, ProtocolKind};
pub use reputation::{BehaviorEvent, ReputationEngine, ReputationWeights};
pub use scheduler::{ProtocolTimer, Scheduler};

/// Node identifier, dense from zero for a run.
pub type NodeId = u32;

/// Chain height of a finalized block; the genesis parent sits at height 0.
pub type Height = u64;

/// View number within one round; incremented on each leader change.
pub type ViewNumber = u64;

/// Stake or authority weight.
pub type Stake = u64;

/// Simplified block identifier (no real hashing, by non-goal).
pub type BlockId = u64;

/// Simulated time in microseconds since simulation start.
pub type SimTime = u64;

/// Convert wall-style seconds into simulated microseconds.
pub fn sim_time_from_secs(secs: f64) -> SimTime {
    (secs * 1_000_000.0).round() as SimTime
}

/// Convert simulated microseconds back into seconds.
pub fn sim_time_to_secs(time: SimTime) -> f64 {
    time as f64 / 1_000_000.0
}

/// Fold block coordinates into a stable 64-bit identifier (FNV-1a).
///
/// `salt` distinguishes equivocating variants proposed for the same
/// height and view.
pub fn block_id(height: Height, proposer: NodeId, view: ViewNumber, salt: u64) -> BlockId {
    let mut id: u64 = 0xcbf2_9ce4_8422_2325;
    for word in [height, proposer as u64, view, salt] {
        id ^= word;
        id = id.wrapping_mul(0x0000_0100_0000_01b3);
    }
    id
}

/// A block candidate, finalized at most once per height.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub view: ViewNumber,
    pub proposer: NodeId,
    /// Identifier of the parent block; 0 for the first block.
    pub parent: BlockId,
    pub id: BlockId,
    /// Placeholder for block content: how many transactions it carries.
    pub tx_count: u32,
    /// Simulated time at which the proposer created the block.
    pub proposed_at: SimTime,
}

/// Message kind, used for per-type metrics counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    Proposal,
    Vote,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PrePrepare => "pre_prepare",
            MessageKind::Prepare => "prepare",
            MessageKind::Commit => "commit",
            MessageKind::Proposal => "proposal",
            MessageKind::Vote => "vote",
        }
    }
}

/// Protocol messages exchanged between nodes.
///
/// PBFT uses the three-phase `PrePrepare`/`Prepare`/`Commit` set;
/// PoS and PoA use `Proposal`/`Vote`. Votes carry only the block id;
/// finalizing requires having seen the matching proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    PrePrepare { view: ViewNumber, block: Block },
    Prepare { height: Height, view: ViewNumber, block: BlockId },
    Commit { height: Height, view: ViewNumber, block: BlockId },
    Proposal { view: ViewNumber, block: Block },
    Vote { height: Height, view: ViewNumber, block: BlockId },
}

impl ProtocolMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ProtocolMessage::PrePrepare { .. } => MessageKind::PrePrepare,
            ProtocolMessage::Prepare { .. } => MessageKind::Prepare,
            ProtocolMessage::Commit { .. } => MessageKind::Commit,
            ProtocolMessage::Proposal { .. } => MessageKind::Proposal,
            ProtocolMessage::Vote { .. } => MessageKind::Vote,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            ProtocolMessage::PrePrepare { block, .. } | ProtocolMessage::Proposal { block, .. } => {
                block.height
            }
            ProtocolMessage::Prepare { height, .. }
            | ProtocolMessage::Commit { height, .. }
            | ProtocolMessage::Vote { height, .. } => *height,
        }
    }

    pub fn view(&self) -> ViewNumber {
        match self {
            ProtocolMessage::PrePrepare { view, .. }
            | ProtocolMessage::Prepare { view, .. }
            | ProtocolMessage::Commit { view, .. }
            | ProtocolMessage::Proposal { view, .. }
            | ProtocolMessage::Vote { view, .. } => *view,
        }
    }

    /// Vote-phase messages: suppressed by withholding nodes.
    pub fn is_vote(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::Prepare { .. }
                | ProtocolMessage::Commit { .. }
                | ProtocolMessage::Vote { .. }
        )
    }

    /// Proposal-phase messages: subject to equivocation.
    pub fn is_proposal(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::PrePrepare { .. } | ProtocolMessage::Proposal { .. }
        )
    }
}

/// A message in flight. Owned by the scheduler until delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub recipient: NodeId,
    pub sent_at: SimTime,
    /// Filled in by the scheduler from the network model's delay.
    pub delivered_at: SimTime,
    pub msg: ProtocolMessage,
}

/// Simulation configuration. Built with `SimConfig::new(..).with_*(..)`
/// and checked by [`SimConfig::validate`] before a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Which consensus protocol the run exercises.
    pub protocol: ProtocolKind,

    /// Number of nodes; must meet the protocol's minimum quorum size.
    pub num_nodes: usize,

    /// Base one-way message delay in seconds.
    pub delay: f64,

    /// Fixed delay, or re-sampled per message from `delay_distribution`.
    pub network_mode: NetworkMode,

    /// Distribution for randomized mode. Defaults to uniform over
    /// `[0.5 * delay, 1.5 * delay]` when unset.
    pub delay_distribution: Option<DelayDistribution>,

    /// Probability in `[0, 1]` that a message is silently dropped.
    pub drop_rate: f64,

    /// Fraction of nodes behaving maliciously, in `[0, 1)`. The last
    /// `floor(ratio * n)` node ids get a malicious strategy.
    pub malicious_ratio: f64,

    /// Strategy applied to every malicious node. When unset, presets
    /// cycle per node: withholding, equivocating, laggard.
    pub malicious_strategy: Option<MaliciousStrategy>,

    /// Seconds a view waits for finalization before rotating leaders.
    pub round_timeout: f64,

    /// RNG seed; identical seeds reproduce identical runs.
    pub seed: u64,

    /// Per-node stake table for PoS. Defaults to equal stake.
    pub stakes: Option<Vec<Stake>>,

    /// Number of authorities for PoA (the first `k` node ids).
    /// Defaults to all nodes.
    pub authority_count: Option<usize>,

    /// Reputation increment/decrement table.
    pub reputation: ReputationWeights,
}

impl SimConfig {
    pub fn new(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            num_nodes: 4,
            delay: 0.1,
            network_mode: NetworkMode::Fixed,
            delay_distribution: None,
            drop_rate: 0.0,
            malicious_ratio: 0.0,
            malicious_strategy: None,
            round_timeout: 5.0,
            seed: 0,
            stakes: None,
            authority_count: None,
            reputation: ReputationWeights::default(),
        }
    }

    pub fn with_nodes(mut self, count: usize) -> Self {
        self.num_nodes = count;
        self
    }

    pub fn with_delay(mut self, secs: f64) -> Self {
        self.delay = secs;
        self
    }

    pub fn with_network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    pub fn with_delay_distribution(mut self, dist: DelayDistribution) -> Self {
        self.delay_distribution = Some(dist);
        self
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn with_malicious_ratio(mut self, ratio: f64) -> Self {
        self.malicious_ratio = ratio;
        self
    }

    pub fn with_malicious_strategy(mut self, strategy: MaliciousStrategy) -> Self {
        self.malicious_strategy = Some(strategy);
        self
    }

    pub fn with_round_timeout(mut self, secs: f64) -> Self {
        self.round_timeout = secs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_stakes(mut self, stakes: Vec<Stake>) -> Self {
        self.stakes = Some(stakes);
        self
    }

    pub fn with_authority_count(mut self, count: usize) -> Self {
        self.authority_count = Some(count);
        self
    }

    pub fn with_reputation_weights(mut self, weights: ReputationWeights) -> Self {
        self.reputation = weights;
        self
    }

    /// Check the configuration against protocol and network bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = self.protocol.min_nodes();
        if self.num_nodes < required {
            return Err(ConfigError::TooFewNodes {
                protocol: self.protocol,
                required,
                got: self.num_nodes,
            });
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(ConfigError::InvalidDelay(self.delay));
        }
        if !self.round_timeout.is_finite() || self.round_timeout <= 0.0 {
            return Err(ConfigError::InvalidTimeout(self.round_timeout));
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(ConfigError::InvalidDropRate(self.drop_rate));
        }
        if !(0.0..1.0).contains(&self.malicious_ratio) {
            return Err(ConfigError::InvalidMaliciousRatio(self.malicious_ratio));
        }
        if let Some(dist) = &self.delay_distribution {
            dist.validate()?;
        }
        if let Some(stakes) = &self.stakes {
            if stakes.len() != self.num_nodes {
                return Err(ConfigError::InvalidStakes {
                    expected: self.num_nodes,
                    got: stakes.len(),
                });
            }
            if stakes.iter().sum::<Stake>() == 0 {
                return Err(ConfigError::InvalidStakes {
                    expected: self.num_nodes,
                    got: stakes.len(),
                });
            }
        }
        if let Some(count) = self.authority_count {
            if count < 2 || count > self.num_nodes {
                return Err(ConfigError::InvalidAuthorities {
                    nodes: self.num_nodes,
                    got: count,
                });
            }
        }
        Ok(())
    }

    /// Stake table with the equal-stake default applied.
    pub fn stake_table(&self) -> Vec<Stake> {
        self.stakes
            .clone()
            .unwrap_or_else(|| vec![100; self.num_nodes])
    }

    /// Number of malicious nodes (the last ids in the cluster).
    pub fn malicious_count(&self) -> usize {
        (self.malicious_ratio * self.num_nodes as f64).floor() as usize
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(ProtocolKind::Pbft)
    }
}

/// Rejected `start` parameters. Surfaced synchronously; the simulation
/// is never started with an invalid configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{protocol} requires at least {required} nodes, got {got}")]
    TooFewNodes {
        protocol: ProtocolKind,
        required: usize,
        got: usize,
    },

    #[error("delay must be finite and non-negative, got {0}")]
    InvalidDelay(f64),

    #[error("round timeout must be finite and positive, got {0}")]
    InvalidTimeout(f64),

    #[error("drop rate must be within [0, 1], got {0}")]
    InvalidDropRate(f64),

    #[error("malicious ratio must be within [0, 1), got {0}")]
    InvalidMaliciousRatio(f64),

    #[error("delay distribution is invalid: {0}")]
    InvalidDistribution(String),

    #[error("stake table must hold {expected} positive entries, got {got}")]
    InvalidStakes { expected: usize, got: usize },

    #[error("authority count must be within [2, {nodes}], got {got}")]
    InvalidAuthorities { nodes: usize, got: usize },
}

/// Simulation errors. Protocol-level anomalies (timeouts, unreachable
/// quorums) are events exposed through `status()`, not errors; only
/// configuration problems and invariant violations surface here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("simulation is already running")]
    AlreadyRunning,

    #[error("no simulation is loaded")]
    NotRunning,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Result type for simulation operations.
pub type SimResult<T> = Result<T, SimError>;

//! # Simulation Engine
//!
//! Drives one consensus run: round after round, each round is a
//! sequence of views that ends with a finalized block or, after every
//! node has had a turn as leader, with an unreachable quorum. The
//! engine owns the clock, the nodes, the network model, reputation and
//! metrics; protocol handlers only ever see delivered envelopes.
//!
//! Malice is applied on the wire, not in the handlers: when a node
//! with a strategy broadcasts, the engine withholds votes, crafts
//! per-recipient conflicting proposals, or inflates delays before the
//! scheduler ever sees the message. The reputation engine observes the
//! same stream of sends and deliveries.

use std::collections::{BTreeSet, VecDeque};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::network::NetworkModel;
use crate::node::{MaliciousStrategy, NodeOutput, NodeState, Role};
use crate::protocol::ConsensusProtocol;
use crate::reputation::{BehaviorEvent, ReputationEngine};
use crate::scheduler::{ProtocolTimer, ScheduledEvent, Scheduler};
use crate::{
    block_id, sim_time_from_secs, sim_time_to_secs, Block, BlockId, Envelope, Height, MessageKind,
    NodeId, ProtocolMessage, SimConfig, SimError, SimResult, SimTime, ViewNumber,
};

/// How many recent events `status()` retains.
const EVENT_LOG_CAP: usize = 256;

/// Result of driving one round to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Finalized {
        block: Block,
        view: ViewNumber,
        latency: SimTime,
    },
    /// No view out of `views_attempted` gathered a quorum. The height
    /// is retried on the next round.
    QuorumUnreachable {
        height: Height,
        views_attempted: u64,
    },
}

/// Notable happenings, kept in a bounded log for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimEvent {
    LeaderSelected {
        height: Height,
        view: ViewNumber,
        leader: NodeId,
    },
    BlockProposed {
        height: Height,
        view: ViewNumber,
        proposer: NodeId,
        block: BlockId,
    },
    BlockFinalized {
        height: Height,
        block: BlockId,
        proposer: NodeId,
    },
    ProtocolTimeout {
        height: Height,
        view: ViewNumber,
        leader: NodeId,
    },
    QuorumUnreachable {
        height: Height,
        views_attempted: u64,
    },
    MessageDropped {
        from: NodeId,
        to: NodeId,
        kind: &'static str,
    },
    Equivocation {
        node: NodeId,
        height: Height,
        view: ViewNumber,
    },
    VoteWithheld {
        node: NodeId,
        kind: &'static str,
    },
    DelayChanged {
        delay_secs: f64,
    },
    Halted {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub time_secs: f64,
    #[serde(flatten)]
    pub event: SimEvent,
}

#[derive(Debug, Default)]
struct EventLog {
    buf: VecDeque<EventRecord>,
}

impl EventLog {
    fn push(&mut self, now: SimTime, event: SimEvent) {
        if self.buf.len() == EVENT_LOG_CAP {
            self.buf.pop_front();
        }
        self.buf.push_back(EventRecord {
            time_secs: sim_time_to_secs(now),
            event,
        });
    }

    fn recent(&self) -> Vec<EventRecord> {
        self.buf.iter().cloned().collect()
    }
}

/// One finalized block as reported by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct BlockSummary {
    pub height: Height,
    pub id: BlockId,
    pub proposer: NodeId,
    pub view: ViewNumber,
    pub tx_count: u32,
}

/// One node's standing as reported by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub role: &'static str,
    pub score: f64,
    pub timely_responses: u64,
    pub violations: u64,
    pub sent: u64,
    pub received: u64,
    pub stale: u64,
    pub chain_height: Height,
}

/// Point-in-time view of a run, safe to serialize for observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub protocol: Option<String>,
    /// Height of the last finalized block.
    pub height: Height,
    /// View the engine last operated in.
    pub view: ViewNumber,
    pub sim_time_secs: f64,
    pub pending_deliveries: usize,
    pub halted: Option<String>,
    pub chain: Vec<BlockSummary>,
    pub nodes: Vec<NodeSummary>,
    pub recent_events: Vec<EventRecord>,
    pub metrics: MetricsSnapshot,
}

impl StatusSnapshot {
    /// Snapshot reported when no simulation is loaded.
    pub fn idle() -> Self {
        Self {
            running: false,
            protocol: None,
            height: 0,
            view: 0,
            sim_time_secs: 0.0,
            pending_deliveries: 0,
            halted: None,
            chain: Vec::new(),
            nodes: Vec::new(),
            recent_events: Vec::new(),
            metrics: MetricsSnapshot::default(),
        }
    }
}

pub struct Simulation {
    config: SimConfig,
    protocol: ConsensusProtocol,
    network: NetworkModel,
    scheduler: Scheduler,
    reputation: ReputationEngine,
    metrics: MetricsAggregator,
    events: EventLog,
    rng: ChaCha8Rng,
    nodes: Vec<NodeState>,
    /// Canonical chain: the first finalization per height wins, and
    /// every later local finalization must agree with it.
    finalized: Vec<Block>,
    current_view: ViewNumber,
    current_leader: NodeId,
    round_started_at: SimTime,
    round_decided: Option<Block>,
    /// Commit-phase voters observed this round, rewarded on finalization.
    round_commit_voters: BTreeSet<NodeId>,
    halted: Option<String>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        let network = NetworkModel::from_config(&config).map_err(SimError::Config)?;
        let protocol = ConsensusProtocol::from_config(&config);
        let stakes = config.stake_table();
        let malicious = config.malicious_count();
        let honest = config.num_nodes - malicious;

        let nodes = (0..config.num_nodes)
            .map(|id| {
                let role = if id >= honest {
                    let strategy = config
                        .malicious_strategy
                        .unwrap_or_else(|| MaliciousStrategy::preset(id - honest));
                    Role::Malicious(strategy)
                } else {
                    Role::Honest
                };
                NodeState::new(id as NodeId, role, stakes[id])
            })
            .collect();

        tracing::info!(
            protocol = %config.protocol,
            nodes = config.num_nodes,
            malicious,
            seed = config.seed,
            "simulation created"
        );

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            reputation: ReputationEngine::new(config.num_nodes, config.reputation),
            protocol,
            network,
            scheduler: Scheduler::new(),
            metrics: MetricsAggregator::new(),
            events: EventLog::default(),
            nodes,
            finalized: Vec::new(),
            current_view: 0,
            current_leader: 0,
            round_started_at: 0,
            round_decided: None,
            round_commit_voters: BTreeSet::new(),
            halted: None,
            config,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn finalized_chain(&self) -> &[Block] {
        &self.finalized
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn pending_deliveries(&self) -> usize {
        self.scheduler.pending()
    }

    /// Drop all in-flight messages and timers.
    pub fn clear_pending(&mut self) {
        self.scheduler.clear();
    }

    /// Change the base network delay mid-run.
    pub fn set_delay(&mut self, secs: f64) -> SimResult<()> {
        self.network.set_base_delay(secs).map_err(SimError::Config)?;
        self.events
            .push(self.scheduler.now(), SimEvent::DelayChanged { delay_secs: secs });
        tracing::info!(delay_secs = secs, "network delay reconfigured");
        Ok(())
    }

    /// Run one round: rotate through views until a block finalizes or
    /// every node has failed a turn as leader.
    pub fn run_round(&mut self) -> SimResult<RoundOutcome> {
        if let Some(reason) = &self.halted {
            return Err(SimError::InvariantViolation(reason.clone()));
        }
        let height = self.finalized.len() as Height + 1;
        self.round_started_at = self.scheduler.now();
        self.round_decided = None;
        self.round_commit_voters.clear();

        let max_views = self.nodes.len() as ViewNumber;
        for view in 0..max_views {
            self.begin_view(height, view)?;
            if self.drive_view(height, view)? {
                let Some(block) = self.round_decided.take() else {
                    return Err(self.halt("round decided without a block".to_owned()));
                };
                let latency = self.scheduler.now() - self.round_started_at;
                tracing::info!(
                    height,
                    view,
                    block = block.id,
                    proposer = block.proposer,
                    latency_secs = sim_time_to_secs(latency),
                    "block finalized"
                );
                return Ok(RoundOutcome::Finalized { block, view, latency });
            }
        }

        self.metrics.record_quorum_failure();
        self.events.push(
            self.scheduler.now(),
            SimEvent::QuorumUnreachable {
                height,
                views_attempted: max_views,
            },
        );
        tracing::warn!(height, views = max_views, "quorum unreachable, height will be retried");
        Ok(RoundOutcome::QuorumUnreachable {
            height,
            views_attempted: max_views,
        })
    }

    /// Serialize current state for observers.
    pub fn status_snapshot(&self, running: bool) -> StatusSnapshot {
        let chain = self
            .finalized
            .iter()
            .map(|b| BlockSummary {
                height: b.height,
                id: b.id,
                proposer: b.proposer,
                view: b.view,
                tx_count: b.tx_count,
            })
            .collect();
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let record = &self.reputation.records()[n.id as usize];
                NodeSummary {
                    id: n.id,
                    role: n.role.as_str(),
                    score: record.score,
                    timely_responses: record.timely_responses,
                    violations: record.violations,
                    sent: n.counters.sent,
                    received: n.counters.received,
                    stale: n.counters.stale,
                    chain_height: n.chain_height(),
                }
            })
            .collect();
        StatusSnapshot {
            running,
            protocol: Some(self.config.protocol.as_str().to_owned()),
            height: self.finalized.len() as Height,
            view: self.current_view,
            sim_time_secs: sim_time_to_secs(self.scheduler.now()),
            pending_deliveries: self.scheduler.pending(),
            halted: self.halted.clone(),
            chain,
            nodes,
            recent_events: self.events.recent(),
            metrics: self.metrics.snapshot(self.scheduler.now()),
        }
    }

    /// Full reputation records, scores and histories included.
    pub fn reputation(&self) -> &ReputationEngine {
        &self.reputation
    }

    fn begin_view(&mut self, height: Height, view: ViewNumber) -> SimResult<()> {
        for node in &mut self.nodes {
            node.enter_view(view);
        }
        let leader = self.protocol.select_leader(height, view, &mut self.rng);
        self.current_leader = leader;
        self.current_view = view;
        self.events
            .push(self.scheduler.now(), SimEvent::LeaderSelected { height, view, leader });
        tracing::debug!(height, view, leader, "view opened");

        // a withholding leader also withholds its proposal; the view
        // then runs out its timer and rotates
        let withholds = self.nodes[leader as usize]
            .role
            .strategy()
            .map_or(false, |s| s.withhold_votes);
        if !withholds {
            let block = self.make_block(height, view, leader);
            self.events.push(
                self.scheduler.now(),
                SimEvent::BlockProposed {
                    height,
                    view,
                    proposer: leader,
                    block: block.id,
                },
            );
            let outputs = self
                .protocol
                .start_round(&mut self.nodes[leader as usize], block);
            self.dispatch_outputs(leader, outputs)?;
        }

        self.scheduler.schedule_timer(
            leader,
            ProtocolTimer::Round { height, view },
            sim_time_from_secs(self.config.round_timeout),
        );
        Ok(())
    }

    /// Pump events until the round decides (true) or the view timer
    /// fires (false).
    fn drive_view(&mut self, height: Height, view: ViewNumber) -> SimResult<bool> {
        loop {
            let Some((_, event)) = self.scheduler.pop_next() else {
                return Ok(false);
            };
            match event {
                ScheduledEvent::Timer {
                    timer: ProtocolTimer::Round { height: h, view: v },
                    ..
                } => {
                    if h != height || v != view {
                        continue;
                    }
                    self.metrics.record_view_change();
                    self.events.push(
                        self.scheduler.now(),
                        SimEvent::ProtocolTimeout {
                            height,
                            view,
                            leader: self.current_leader,
                        },
                    );
                    // a stalled view is only the leader's fault when it
                    // withheld its proposal; honest leaders let down by
                    // their peers keep their score
                    let leader_withheld = self.nodes[self.current_leader as usize]
                        .role
                        .strategy()
                        .map_or(false, |s| s.withhold_votes);
                    if leader_withheld {
                        self.reputation
                            .observe(self.current_leader, BehaviorEvent::MissedVote);
                    }
                    tracing::debug!(height, view, leader = self.current_leader, "view timed out");
                    return Ok(false);
                }
                ScheduledEvent::Deliver(env) => {
                    self.deliver(env, height, view)?;
                    if self.round_decided.is_some() {
                        self.scheduler
                            .cancel_timer(self.current_leader, ProtocolTimer::Round { height, view });
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn deliver(&mut self, env: Envelope, height: Height, view: ViewNumber) -> SimResult<()> {
        let to = env.recipient as usize;
        let kind = env.msg.kind();
        self.nodes[to].counters.received += 1;
        self.metrics.record_delivered(kind);

        if self.nodes[to].is_stale(&env.msg) {
            self.nodes[to].counters.stale += 1;
            self.metrics.record_stale();
            // lateness is only held against senders who injected it
            let laggard = self.nodes[env.sender as usize]
                .role
                .strategy()
                .map_or(false, |s| s.extra_delay.is_some());
            if laggard {
                self.reputation.observe(env.sender, BehaviorEvent::LateResponse);
            }
            return Ok(());
        }

        if env.msg.is_vote() && env.msg.height() == height && env.msg.view() == view {
            self.reputation.observe(env.sender, BehaviorEvent::TimelyVote);
            if matches!(kind, MessageKind::Commit | MessageKind::Vote) {
                self.round_commit_voters.insert(env.sender);
            }
        }

        let outputs = self.protocol.on_message(&mut self.nodes[to], &env);
        self.dispatch_outputs(env.recipient, outputs)
    }

    fn dispatch_outputs(&mut self, from: NodeId, outputs: Vec<NodeOutput>) -> SimResult<()> {
        for output in outputs {
            match output {
                NodeOutput::Broadcast(msg) => self.broadcast(from, msg),
                NodeOutput::Finalized(block) => self.note_local_finalize(block)?,
            }
        }
        Ok(())
    }

    /// Fan a message out to every other node, applying the sender's
    /// malicious strategy and the network model per recipient.
    fn broadcast(&mut self, from: NodeId, msg: ProtocolMessage) {
        let kind = msg.kind();
        let strategy = self.nodes[from as usize].role.strategy().copied();

        if let Some(s) = strategy {
            if s.withhold_votes && msg.is_vote() {
                self.reputation.observe(from, BehaviorEvent::MissedVote);
                self.events.push(
                    self.scheduler.now(),
                    SimEvent::VoteWithheld {
                        node: from,
                        kind: kind.as_str(),
                    },
                );
                tracing::trace!(node = from, kind = kind.as_str(), "vote withheld");
                return;
            }
        }

        // equivocators send a conflicting candidate to odd-numbered
        // peers; both variants are real proposals and split the vote
        let variant = if strategy.map_or(false, |s| s.equivocate) && msg.is_proposal() {
            self.equivocation_variant(&msg)
        } else {
            None
        };

        for to in 0..self.nodes.len() as NodeId {
            if to == from {
                continue;
            }
            let payload = match &variant {
                Some(alt) if to % 2 == 1 => alt.clone(),
                _ => msg.clone(),
            };
            if self.network.should_drop(from, to, &mut self.rng) {
                self.metrics.record_dropped(kind);
                self.events.push(
                    self.scheduler.now(),
                    SimEvent::MessageDropped {
                        from,
                        to,
                        kind: kind.as_str(),
                    },
                );
                continue;
            }
            let mut delay = self.network.sample_delay(from, to, &mut self.rng);
            if let Some(extra) = strategy.and_then(|s| s.extra_delay) {
                delay += sim_time_from_secs(extra);
            }
            let env = Envelope {
                sender: from,
                recipient: to,
                sent_at: self.scheduler.now(),
                delivered_at: 0,
                msg: payload,
            };
            self.scheduler.schedule_delivery(env, delay);
            self.metrics.record_sent(kind);
            self.nodes[from as usize].counters.sent += 1;
        }
    }

    fn equivocation_variant(&mut self, msg: &ProtocolMessage) -> Option<ProtocolMessage> {
        let (view, block) = match msg {
            ProtocolMessage::PrePrepare { view, block } | ProtocolMessage::Proposal { view, block } => {
                (*view, block)
            }
            _ => return None,
        };
        let alt = Block {
            id: block_id(block.height, block.proposer, view, 1),
            ..block.clone()
        };
        self.reputation.observe(block.proposer, BehaviorEvent::Equivocation);
        self.events.push(
            self.scheduler.now(),
            SimEvent::Equivocation {
                node: block.proposer,
                height: block.height,
                view,
            },
        );
        tracing::debug!(node = block.proposer, height = block.height, view, "equivocation");
        Some(match msg {
            ProtocolMessage::PrePrepare { .. } => ProtocolMessage::PrePrepare { view, block: alt },
            _ => ProtocolMessage::Proposal { view, block: alt },
        })
    }

    fn make_block(&mut self, height: Height, view: ViewNumber, proposer: NodeId) -> Block {
        Block {
            height,
            view,
            proposer,
            parent: self.finalized.last().map(|b| b.id).unwrap_or(0),
            id: block_id(height, proposer, view, 0),
            tx_count: self.rng.gen_range(1..=8),
            proposed_at: self.scheduler.now(),
        }
    }

    /// Record a node's local finalization against the canonical chain.
    ///
    /// The first finalization of a height establishes the canonical
    /// block; a later conflicting one is a safety violation and halts
    /// the run. Agreement from lagging nodes is a no-op.
    fn note_local_finalize(&mut self, block: Block) -> SimResult<()> {
        let idx = (block.height as usize).saturating_sub(1);
        if let Some(existing) = self.finalized.get(idx) {
            if existing.id != block.id {
                return Err(self.halt(format!(
                    "conflicting finalization at height {}: {} vs {}",
                    block.height, existing.id, block.id
                )));
            }
            return Ok(());
        }
        if block.height != self.finalized.len() as Height + 1 {
            return Err(self.halt(format!(
                "non-contiguous finalization: height {} after {}",
                block.height,
                self.finalized.len()
            )));
        }

        for voter in self.round_commit_voters.clone() {
            self.reputation.observe(voter, BehaviorEvent::CommitParticipation);
        }
        self.reputation
            .observe(block.proposer, BehaviorEvent::CommitParticipation);

        let latency = self.scheduler.now() - self.round_started_at;
        self.metrics.record_finalized(latency);
        self.events.push(
            self.scheduler.now(),
            SimEvent::BlockFinalized {
                height: block.height,
                block: block.id,
                proposer: block.proposer,
            },
        );
        self.finalized.push(block.clone());
        self.round_decided = Some(block);
        Ok(())
    }

    fn halt(&mut self, reason: String) -> SimError {
        tracing::error!(reason = %reason, "simulation halted");
        self.events.push(self.scheduler.now(), SimEvent::Halted { reason: reason.clone() });
        self.scheduler.clear();
        self.halted = Some(reason.clone());
        SimError::InvariantViolation(reason)
    }
}

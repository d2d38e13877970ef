//! PBFT three-phase commit: PRE-PREPARE from the view's primary,
//! PREPARE and COMMIT broadcast by replicas. A replica commits after
//! `2f + 1` matching prepares and finalizes after `2f + 1` matching
//! commits for a proposal it has seen. The primary's PRE-PREPARE
//! doubles as its prepare vote.

use crate::node::{NodeOutput, NodeState, Phase};
use crate::{BlockId, Block, Envelope, Height, ProtocolMessage, ViewNumber};

use super::ConsensusProtocol;

pub(super) fn start_round(leader: &mut NodeState, block: Block) -> Vec<NodeOutput> {
    let height = block.height;
    let view = block.view;
    let id = block.id;
    leader.proposals.insert((height, view), block.clone());
    leader
        .prepares
        .entry((height, view, id))
        .or_default()
        .insert(leader.id);
    leader.phase = Phase::Voting;
    vec![NodeOutput::Broadcast(ProtocolMessage::PrePrepare {
        view,
        block,
    })]
}

pub(super) fn on_message(
    proto: &ConsensusProtocol,
    node: &mut NodeState,
    env: &Envelope,
) -> Vec<NodeOutput> {
    let mut out = Vec::new();
    match &env.msg {
        ProtocolMessage::PrePrepare { view, block } => {
            let key = (block.height, *view);
            let id = block.id;
            if node.proposals.contains_key(&key) {
                // re-proposal of a retried slot: re-examine the votes
                // already on hand instead of voting again
                try_commit(proto, node, block.height, *view, id, &mut out);
                try_finalize(proto, node, block.height, *view, id, &mut out);
                return out;
            }
            node.proposals.insert(key, block.clone());
            node.phase = Phase::Voting;
            // primary's pre-prepare counts as its prepare vote
            let prepares = node.prepares.entry((block.height, *view, id)).or_default();
            prepares.insert(env.sender);
            prepares.insert(node.id);
            out.push(NodeOutput::Broadcast(ProtocolMessage::Prepare {
                height: block.height,
                view: *view,
                block: id,
            }));
            try_commit(proto, node, block.height, *view, id, &mut out);
            // votes may have raced ahead of the proposal
            try_finalize(proto, node, block.height, *view, id, &mut out);
        }
        ProtocolMessage::Prepare { height, view, block } => {
            node.prepares
                .entry((*height, *view, *block))
                .or_default()
                .insert(env.sender);
            try_commit(proto, node, *height, *view, *block, &mut out);
        }
        ProtocolMessage::Commit { height, view, block } => {
            node.commits
                .entry((*height, *view, *block))
                .or_default()
                .insert(env.sender);
            try_finalize(proto, node, *height, *view, *block, &mut out);
        }
        _ => {
            node.counters.stale += 1;
        }
    }
    out
}

fn try_commit(
    proto: &ConsensusProtocol,
    node: &mut NodeState,
    height: Height,
    view: ViewNumber,
    block: BlockId,
    out: &mut Vec<NodeOutput>,
) {
    if node.sent_commit.contains(&(height, view)) {
        return;
    }
    // the prepared predicate needs the pre-prepare itself, not just
    // a prepare quorum for its id
    let has_proposal = node
        .proposals
        .get(&(height, view))
        .map_or(false, |p| p.id == block);
    if !has_proposal {
        return;
    }
    let prepared = node
        .prepares
        .get(&(height, view, block))
        .map(|voters| proto.quorum_satisfied(voters))
        .unwrap_or(false);
    if !prepared {
        return;
    }
    node.sent_commit.insert((height, view));
    node.commits
        .entry((height, view, block))
        .or_default()
        .insert(node.id);
    out.push(NodeOutput::Broadcast(ProtocolMessage::Commit {
        height,
        view,
        block,
    }));
    // own commit vote may complete the commit quorum
    try_finalize(proto, node, height, view, block, out);
}

fn try_finalize(
    proto: &ConsensusProtocol,
    node: &mut NodeState,
    height: Height,
    view: ViewNumber,
    block: BlockId,
    out: &mut Vec<NodeOutput>,
) {
    if height != node.chain_height() + 1 {
        return;
    }
    let committed = node
        .commits
        .get(&(height, view, block))
        .map(|voters| proto.quorum_satisfied(voters))
        .unwrap_or(false);
    if !committed {
        return;
    }
    // a vote quorum alone is not enough: the full block must have
    // arrived through a matching pre-prepare
    let Some(proposal) = node.proposals.get(&(height, view)) else {
        return;
    };
    if proposal.id != block {
        return;
    }
    let finalized = proposal.clone();
    node.finalize(finalized.clone());
    out.push(NodeOutput::Finalized(finalized));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Role;
    use crate::protocol::PbftParams;
    use crate::{block_id, MessageKind};

    fn proto() -> ConsensusProtocol {
        ConsensusProtocol::Pbft(PbftParams::new(4))
    }

    fn block(height: Height, view: ViewNumber, proposer: u32) -> Block {
        Block {
            height,
            view,
            proposer,
            parent: 0,
            id: block_id(height, proposer, view, 0),
            tx_count: 1,
            proposed_at: 0,
        }
    }

    fn deliver(node: &mut NodeState, sender: u32, msg: ProtocolMessage) -> Vec<NodeOutput> {
        let env = Envelope {
            sender,
            recipient: node.id,
            sent_at: 0,
            delivered_at: 0,
            msg,
        };
        proto().on_message(node, &env)
    }

    #[test]
    fn replica_prepares_on_pre_prepare() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let out = deliver(
            &mut node,
            0,
            ProtocolMessage::PrePrepare {
                view: 0,
                block: block(1, 0, 0),
            },
        );
        assert_eq!(out.len(), 1);
        let NodeOutput::Broadcast(msg) = &out[0] else {
            panic!("expected a broadcast");
        };
        assert_eq!(msg.kind(), MessageKind::Prepare);
        assert_eq!(node.phase, Phase::Voting);
    }

    #[test]
    fn full_phase_sequence_finalizes() {
        // node 1 in a 4-node cluster; primary 0, peers 2 and 3
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0, 0);
        let id = b.id;

        deliver(&mut node, 0, ProtocolMessage::PrePrepare { view: 0, block: b });
        // prepares: {0 (primary), 1 (self)}; one more reaches 2f+1 = 3
        let out = deliver(
            &mut node,
            2,
            ProtocolMessage::Prepare { height: 1, view: 0, block: id },
        );
        assert!(matches!(
            &out[0],
            NodeOutput::Broadcast(ProtocolMessage::Commit { .. })
        ));

        // commits: {1 (self)}; two more finalize
        deliver(&mut node, 2, ProtocolMessage::Commit { height: 1, view: 0, block: id });
        let out = deliver(
            &mut node,
            3,
            ProtocolMessage::Commit { height: 1, view: 0, block: id },
        );
        assert!(matches!(&out[0], NodeOutput::Finalized(b) if b.id == id));
        assert_eq!(node.chain_height(), 1);
    }

    #[test]
    fn commit_sent_at_most_once_per_view() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0, 0);
        let id = b.id;
        deliver(&mut node, 0, ProtocolMessage::PrePrepare { view: 0, block: b });
        let first = deliver(
            &mut node,
            2,
            ProtocolMessage::Prepare { height: 1, view: 0, block: id },
        );
        assert_eq!(first.len(), 1);
        let second = deliver(
            &mut node,
            3,
            ProtocolMessage::Prepare { height: 1, view: 0, block: id },
        );
        assert!(second.is_empty());
    }

    #[test]
    fn prepare_quorum_alone_does_not_commit() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let id = block_id(1, 0, 0, 0);
        // a full prepare quorum arrives before the pre-prepare
        for sender in [0, 2, 3] {
            let out = deliver(
                &mut node,
                sender,
                ProtocolMessage::Prepare { height: 1, view: 0, block: id },
            );
            assert!(out.is_empty());
        }
        assert!(!node.sent_commit.contains(&(1, 0)));

        // the late pre-prepare completes the prepared predicate
        let out = deliver(
            &mut node,
            0,
            ProtocolMessage::PrePrepare { view: 0, block: block(1, 0, 0) },
        );
        assert!(out
            .iter()
            .any(|o| matches!(o, NodeOutput::Broadcast(ProtocolMessage::Commit { .. }))));
    }

    #[test]
    fn commit_quorum_without_proposal_does_not_finalize() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let id = block_id(1, 0, 0, 0);
        for sender in [0, 2, 3] {
            let out = deliver(
                &mut node,
                sender,
                ProtocolMessage::Commit { height: 1, view: 0, block: id },
            );
            assert!(out.is_empty());
        }
        assert_eq!(node.chain_height(), 0);
    }

    #[test]
    fn conflicting_prepares_split_by_block() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0, 0);
        let other = block_id(1, 0, 0, 1);
        deliver(&mut node, 0, ProtocolMessage::PrePrepare { view: 0, block: b });
        // prepares for a different candidate never merge with ours
        deliver(&mut node, 2, ProtocolMessage::Prepare { height: 1, view: 0, block: other });
        let out = deliver(
            &mut node,
            3,
            ProtocolMessage::Prepare { height: 1, view: 0, block: other },
        );
        assert!(out.is_empty());
        assert!(!node.sent_commit.contains(&(1, 0)));
    }
}

//! Proof-of-Authority: a fixed authority set rotates the proposer
//! role round-robin; a block finalizes on votes from a strict majority
//! of authorities. Non-authority nodes observe: they track proposals
//! and votes and finalize alongside, but never vote, and proposals
//! from outside the authority set are rejected outright.

use crate::node::{NodeOutput, NodeState, Phase};
use crate::{Block, BlockId, Envelope, Height, ProtocolMessage, ViewNumber};

use super::{ConsensusProtocol, PoaParams};

fn params(proto: &ConsensusProtocol) -> &PoaParams {
    match proto {
        ConsensusProtocol::ProofOfAuthority(p) => p,
        _ => unreachable!("poa handler dispatched for a different protocol"),
    }
}

pub(super) fn start_round(leader: &mut NodeState, block: Block) -> Vec<NodeOutput> {
    let height = block.height;
    let view = block.view;
    let id = block.id;
    leader.proposals.insert((height, view), block.clone());
    leader
        .votes
        .entry((height, view, id))
        .or_default()
        .insert(leader.id);
    leader.phase = Phase::Voting;
    vec![NodeOutput::Broadcast(ProtocolMessage::Proposal {
        view,
        block,
    })]
}

pub(super) fn on_message(
    proto: &ConsensusProtocol,
    node: &mut NodeState,
    env: &Envelope,
) -> Vec<NodeOutput> {
    let poa = params(proto);
    let mut out = Vec::new();
    match &env.msg {
        ProtocolMessage::Proposal { view, block } => {
            if !poa.is_authority(env.sender) {
                node.counters.stale += 1;
                return out;
            }
            let key = (block.height, *view);
            let id = block.id;
            if node.proposals.contains_key(&key) {
                try_finalize(proto, node, block.height, *view, id, &mut out);
                return out;
            }
            node.proposals.insert(key, block.clone());
            node.phase = Phase::Voting;
            let votes = node.votes.entry((block.height, *view, id)).or_default();
            votes.insert(env.sender);
            if poa.is_authority(node.id) {
                votes.insert(node.id);
                out.push(NodeOutput::Broadcast(ProtocolMessage::Vote {
                    height: block.height,
                    view: *view,
                    block: id,
                }));
            }
            try_finalize(proto, node, block.height, *view, id, &mut out);
        }
        ProtocolMessage::Vote { height, view, block } => {
            if !poa.is_authority(env.sender) {
                node.counters.stale += 1;
                return out;
            }
            node.votes
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
    let quorum = node
        .votes
        .get(&(height, view, block))
        .map(|voters| proto.quorum_satisfied(voters))
        .unwrap_or(false);
    if !quorum {
        return;
    }
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
    use crate::block_id;
    use crate::node::Role;

    fn proto() -> ConsensusProtocol {
        // authorities 0..3 in a 5-node cluster; majority is 2
        ConsensusProtocol::ProofOfAuthority(PoaParams::new(3))
    }

    fn block(height: Height, proposer: u32) -> Block {
        Block {
            height,
            view: 0,
            proposer,
            parent: 0,
            id: block_id(height, proposer, 0, 0),
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
    fn authority_votes_and_finalizes_on_majority() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0);
        let id = b.id;
        // proposer 0 + self 1 is already a majority of 3 authorities
        let out = deliver(&mut node, 0, ProtocolMessage::Proposal { view: 0, block: b });
        assert!(out
            .iter()
            .any(|o| matches!(o, NodeOutput::Broadcast(ProtocolMessage::Vote { .. }))));
        assert!(out.iter().any(|o| matches!(o, NodeOutput::Finalized(f) if f.id == id)));
    }

    #[test]
    fn observer_tracks_but_never_votes() {
        let mut node = NodeState::new(4, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0);
        let id = b.id;
        let out = deliver(&mut node, 0, ProtocolMessage::Proposal { view: 0, block: b });
        assert!(out.is_empty(), "observers stay silent");

        // the proposer's implicit vote plus one more is a majority
        let out = deliver(&mut node, 1, ProtocolMessage::Vote { height: 1, view: 0, block: id });
        assert!(out.iter().any(|o| matches!(o, NodeOutput::Finalized(_))));
        assert_eq!(node.chain_height(), 1);
    }

    #[test]
    fn proposal_from_non_authority_is_rejected() {
        let mut node = NodeState::new(1, Role::Honest, 100);
        node.enter_view(0);
        let out = deliver(&mut node, 4, ProtocolMessage::Proposal { view: 0, block: block(1, 4) });
        assert!(out.is_empty());
        assert!(node.proposals.is_empty());
        assert_eq!(node.counters.stale, 1);
    }

    #[test]
    fn votes_from_non_authorities_do_not_count() {
        let mut node = NodeState::new(4, Role::Honest, 100);
        node.enter_view(0);
        let b = block(1, 0);
        let id = b.id;
        deliver(&mut node, 0, ProtocolMessage::Proposal { view: 0, block: b });
        // one authority vote (the proposer) plus outsider noise
        for outsider in [5, 6, 7] {
            deliver(&mut node, outsider, ProtocolMessage::Vote { height: 1, view: 0, block: id });
        }
        assert_eq!(node.chain_height(), 0);
    }
}

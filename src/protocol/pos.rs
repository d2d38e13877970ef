//! Proof-of-Stake voting: a stake-weighted leader proposes, every
//! validator votes, and a block finalizes once the voters behind it
//! hold strictly more than two thirds of total stake. The proposal
//! carries the leader's implicit vote.

use crate::node::{NodeOutput, NodeState, Phase};
use crate::{Block, BlockId, Envelope, Height, ProtocolMessage, ViewNumber};

use super::ConsensusProtocol;

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
    let mut out = Vec::new();
    match &env.msg {
        ProtocolMessage::Proposal { view, block } => {
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
            votes.insert(node.id);
            out.push(NodeOutput::Broadcast(ProtocolMessage::Vote {
                height: block.height,
                view: *view,
                block: id,
            }));
            try_finalize(proto, node, block.height, *view, id, &mut out);
        }
        ProtocolMessage::Vote { height, view, block } => {
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

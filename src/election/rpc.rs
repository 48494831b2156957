use crate::election::state::{ElectionRole, ElectionState};
use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut ElectionState,
    req: &VoteRequest,
    my_id: u64,
    group: &str,
) -> VoteResponse {
    if req.group != group {
        tracing::debug!(node_id = my_id, group = %req.group, "Vote request from foreign group");
        return VoteResponse {
            term: state.current_term,
            vote_granted: false,
        };
    }

    state.observe_term(req.term);

    let vote_granted = if state.holds_lease() {
        // Leased leadership is never put up for election
        false
    } else if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle Heartbeat RPC
pub fn handle_heartbeat(
    state: &mut ElectionState,
    req: &HeartbeatRequest,
    my_id: u64,
    group: &str,
) -> HeartbeatResponse {
    if req.group != group {
        return HeartbeatResponse {
            term: state.current_term,
            success: false,
        };
    }

    state.observe_term(req.term);

    if req.term < state.current_term || state.holds_lease() {
        return HeartbeatResponse {
            term: state.current_term,
            success: false,
        };
    }

    // Valid heartbeat from the leader of this term
    if state.role != ElectionRole::Follower {
        state.become_follower(req.term);
    }
    if state.leader_id != Some(req.leader_id) {
        tracing::info!(node_id = my_id, leader = req.leader_id, leader_uri = %req.leader_uri, term = req.term, "Following new leader");
    }
    state.leader_id = Some(req.leader_id);
    state.leader_uri = Some(req.leader_uri.clone());

    HeartbeatResponse {
        term: state.current_term,
        success: true,
    }
}

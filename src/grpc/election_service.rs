use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::election::ElectionNode;
use crate::proto::election_service_server::ElectionService;
use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};

/// gRPC service for leader election between nodes
pub struct ElectionServiceImpl {
    election_node: Arc<ElectionNode>,
}

impl ElectionServiceImpl {
    pub fn new(election_node: Arc<ElectionNode>) -> Self {
        Self { election_node }
    }
}

#[tonic::async_trait]
impl ElectionService for ElectionServiceImpl {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            "Received RequestVote"
        );

        let response = self.election_node.handle_vote_request(req).await;
        Ok(Response::new(response))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(leader = req.leader_id, term = req.term, "Received Heartbeat");

        let response = self.election_node.handle_heartbeat(req).await;
        Ok(Response::new(response))
    }
}

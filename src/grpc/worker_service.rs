use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

use crate::election::ElectionStrategy;
use crate::node::NodeStatus;
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    IsProcessingRequest, IsProcessingResponse, NextBucketRequest, NextBucketResponse,
};
use crate::scheduler::LeaderDuties;

/// Dispatch and liveness RPCs of a worker node
pub struct WorkerServiceImpl {
    duties: Arc<LeaderDuties>,
    election: Arc<dyn ElectionStrategy>,
    status: NodeStatus,
    idle_wait: Duration,
}

impl WorkerServiceImpl {
    pub fn new(
        duties: Arc<LeaderDuties>,
        election: Arc<dyn ElectionStrategy>,
        status: NodeStatus,
        idle_wait: Duration,
    ) -> Self {
        Self {
            duties,
            election,
            status,
            idle_wait,
        }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn request_next_bucket(
        &self,
        request: Request<NextBucketRequest>,
    ) -> Result<Response<NextBucketResponse>, Status> {
        let req = request.into_inner();

        if !self.election.is_leader().await {
            let leader = self.election.leader_uri().await;
            return Err(Status::failed_precondition(format!(
                "Not leader. Current leader: {:?}",
                leader
            )));
        }

        let bucket_id = self
            .duties
            .assign_next_bucket(&req.requestor_uri)
            .await
            .map_err(|e| {
                tracing::warn!(requestor = %req.requestor_uri, error = %e, "Failed to assign bucket");
                Status::unavailable(e.to_string())
            })?;

        let retry_after_ms = if bucket_id.is_some() {
            0
        } else {
            self.idle_wait.as_millis() as u64
        };
        Ok(Response::new(NextBucketResponse {
            bucket_id,
            retry_after_ms,
        }))
    }

    async fn is_processing(
        &self,
        request: Request<IsProcessingRequest>,
    ) -> Result<Response<IsProcessingResponse>, Status> {
        let bucket_id = request.into_inner().bucket_id;
        let state = self.status.get().await;
        let processing = self.status.is_processing(bucket_id).await;
        tracing::debug!(bucket_id, state = %state, processing, "Answering processing query");
        Ok(Response::new(IsProcessingResponse { processing }))
    }
}

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::error::{FarmError, Result};
use crate::model::BucketId;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::{IsProcessingRequest, NextBucketRequest};
use crate::scheduler::LivenessProbe;

/// Worker service clients keyed by node URI, created lazily.
#[derive(Default)]
struct WorkerClients {
    pool: Mutex<HashMap<String, WorkerServiceClient<Channel>>>,
}

impl WorkerClients {
    async fn client(
        &self,
        uri: &str,
        connect_timeout: Duration,
    ) -> Result<WorkerServiceClient<Channel>> {
        let mut pool = self.pool.lock().await;
        if let Some(client) = pool.get(uri) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(uri.to_string())
            .map_err(|e| FarmError::Internal(format!("Invalid worker URI {}: {}", uri, e)))?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        let client = WorkerServiceClient::new(channel);
        pool.insert(uri.to_string(), client.clone());
        Ok(client)
    }

    async fn forget(&self, uri: &str) {
        self.pool.lock().await.remove(uri);
    }
}

/// Answer of the leader to a bucket request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextBucket {
    pub bucket_id: Option<BucketId>,
    pub retry_after: Duration,
}

/// Requests buckets from the leader over gRPC.
pub struct RemoteDispatcher {
    clients: WorkerClients,
    timeout: Duration,
}

impl RemoteDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: WorkerClients::default(),
            timeout,
        }
    }

    pub async fn request_next_bucket(
        &self,
        leader_uri: &str,
        requestor_uri: &str,
    ) -> Result<NextBucket> {
        let mut client = self.clients.client(leader_uri, self.timeout).await?;
        let request = NextBucketRequest {
            requestor_uri: requestor_uri.to_string(),
        };
        match client.request_next_bucket(request).await {
            Ok(response) => {
                let response = response.into_inner();
                Ok(NextBucket {
                    bucket_id: response.bucket_id,
                    retry_after: Duration::from_millis(response.retry_after_ms),
                })
            }
            Err(status) if status.code() == tonic::Code::FailedPrecondition => {
                Err(FarmError::NotLeader(None))
            }
            Err(status) => {
                if status.code() == tonic::Code::Unavailable {
                    self.clients.forget(leader_uri).await;
                }
                Err(FarmError::GrpcError(status))
            }
        }
    }
}

/// Asks a worker's gRPC service whether it is processing a bucket.
pub struct GrpcLivenessProbe {
    clients: WorkerClients,
    timeout: Duration,
}

impl GrpcLivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: WorkerClients::default(),
            timeout,
        }
    }

    async fn ask(&self, worker_uri: &str, bucket_id: BucketId) -> Result<bool> {
        let mut client = self.clients.client(worker_uri, self.timeout).await?;
        let response = client
            .is_processing(IsProcessingRequest { bucket_id })
            .await?;
        Ok(response.into_inner().processing)
    }
}

#[async_trait]
impl LivenessProbe for GrpcLivenessProbe {
    async fn is_processing(&self, worker_uri: &str, bucket_id: BucketId) -> bool {
        match tokio::time::timeout(self.timeout, self.ask(worker_uri, bucket_id)).await {
            Ok(Ok(processing)) => processing,
            Ok(Err(e)) => {
                tracing::debug!(worker = worker_uri, bucket_id, error = %e, "Worker unreachable");
                self.clients.forget(worker_uri).await;
                false
            }
            Err(_) => {
                tracing::debug!(worker = worker_uri, bucket_id, "Worker did not answer in time");
                false
            }
        }
    }
}

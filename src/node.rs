use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::boundary::{FailureBoundary, FailureScope};
use crate::checkout::SourceCheckout;
use crate::config::NodeConfig;
use crate::election::timer::dispatch_jitter;
use crate::election::{ElectionStrategy, Role};
use crate::error::{FarmError, Result};
use crate::grpc::{GrpcLivenessProbe, GrpcServer, RemoteDispatcher, WorkerServiceImpl};
use crate::model::{BucketId, BucketStatus};
use crate::notify::Notifier;
use crate::scheduler::{LeaderDuties, LivenessProbe};
use crate::store::EntityStore;
use crate::worker::{TaskPipeline, TaskRunner};

/// Pause after an election round that found no leader.
const NO_LEADER_WAIT: Duration = Duration::from_millis(500);

/// What a worker node is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    AwaitingElection,
    Leader,
    Follower,
    Processing(BucketId),
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Idle => write!(f, "idle"),
            NodeState::AwaitingElection => write!(f, "awaiting election"),
            NodeState::Leader => write!(f, "leader"),
            NodeState::Follower => write!(f, "follower"),
            NodeState::Processing(id) => write!(f, "processing bucket {}", id),
        }
    }
}

/// Shared handle on a node's [`NodeState`], read by the liveness RPC.
#[derive(Debug, Clone)]
pub struct NodeStatus(Arc<RwLock<NodeState>>);

impl Default for NodeStatus {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(NodeState::Idle)))
    }
}

impl NodeStatus {
    pub async fn get(&self) -> NodeState {
        *self.0.read().await
    }

    pub async fn set(&self, state: NodeState) {
        *self.0.write().await = state;
    }

    pub async fn is_processing(&self, bucket_id: BucketId) -> bool {
        self.get().await == NodeState::Processing(bucket_id)
    }
}

/// Result of one request-and-process round of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A bucket was processed; `status` is `None` when processing failed.
    Processed {
        bucket_id: BucketId,
        status: Option<BucketStatus>,
    },
    /// No bucket was available, ask again after the given wait.
    Idle(Duration),
    NoLeader,
}

/// A build farm node: worker for every node, dispatcher when elected.
pub struct WorkerNode {
    config: NodeConfig,
    uri: String,
    election: Arc<dyn ElectionStrategy>,
    duties: Arc<LeaderDuties>,
    pipeline: TaskPipeline,
    boundary: FailureBoundary,
    probe: Arc<dyn LivenessProbe>,
    remote: RemoteDispatcher,
    status: NodeStatus,
    was_leader: AtomicBool,
}

impl WorkerNode {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn EntityStore>,
        checkout: Arc<dyn SourceCheckout>,
        notifier: Arc<dyn Notifier>,
        election: Arc<dyn ElectionStrategy>,
    ) -> Self {
        let uri = config.uri();
        let runner = TaskRunner::new(
            store.clone(),
            config.build_tool.clone(),
            config.log_polling_interval(),
        );
        let pipeline = TaskPipeline::new(store.clone(), checkout.clone(), notifier.clone(), runner);
        let duties = Arc::new(LeaderDuties::new(
            store.clone(),
            checkout,
            uri.clone(),
            config.max_bucket_dispatches,
        ));
        let boundary = FailureBoundary::new(store, notifier, election.clone(), uri.clone())
            .with_admin_email(config.admin_email.clone())
            .with_retry_delay(config.transient_retry_delay());

        Self {
            probe: Arc::new(GrpcLivenessProbe::new(config.liveness_timeout())),
            remote: RemoteDispatcher::new(config.liveness_timeout()),
            config,
            uri,
            election,
            duties,
            pipeline,
            boundary,
            status: NodeStatus::default(),
            was_leader: AtomicBool::new(false),
        }
    }

    /// Replace the gRPC liveness probe the leader uses on workers.
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> NodeStatus {
        self.status.clone()
    }

    pub fn duties(&self) -> Arc<LeaderDuties> {
        self.duties.clone()
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// Spawns the election transport, the gRPC server and the leader cycle,
    /// then runs the worker loop on the current task.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server failed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        if let Some(transport) = self.election.transport() {
            transport.connect_to_peers().await;
            let election_shutdown = shutdown.clone();
            tokio::spawn(async move {
                transport.run(election_shutdown).await;
            });
        }

        let server = GrpcServer::new(
            self.config.listen_addr,
            self.election.transport(),
            WorkerServiceImpl::new(
                self.duties.clone(),
                self.election.clone(),
                self.status.clone(),
                self.config.idle_wait(),
            ),
        );
        let server_shutdown = shutdown.clone();
        let server_handle = tokio::spawn(async move { server.run(server_shutdown).await });

        let leader = self.clone();
        let leader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            leader.leader_loop(leader_shutdown).await;
        });

        self.worker_loop(shutdown).await;

        match server_handle.await {
            Ok(result) => result.map_err(FarmError::from),
            Err(e) => Err(FarmError::Internal(format!("gRPC server task failed: {}", e))),
        }
    }

    async fn worker_loop(&self, shutdown: CancellationToken) {
        tracing::info!(uri = %self.uri, "Worker loop started");
        while !shutdown.is_cancelled() {
            let wait = match self.work_once().await {
                WorkOutcome::Processed { .. } => continue,
                WorkOutcome::Idle(wait) => wait,
                WorkOutcome::NoLeader => NO_LEADER_WAIT,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        self.status.set(NodeState::Idle).await;
        tracing::info!("Worker loop stopped");
    }

    async fn leader_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.leader_cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.leader_cycle().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// One round of the leader's bucket computation. Returns `false` without
    /// doing anything when this node does not lead.
    pub async fn leader_cycle(&self) -> bool {
        let leader = self.election.is_leader().await;
        self.observe_leadership(leader).await;
        if !leader {
            return false;
        }
        self.boundary
            .protect("updating buckets failed", FailureScope::General, || {
                self.duties.update_buckets(self.probe.as_ref(), &self.boundary)
            })
            .await;
        true
    }

    /// Get one bucket, from the local dispatcher when leading or from the
    /// leader otherwise, and process it.
    pub async fn work_once(&self) -> WorkOutcome {
        self.status.set(NodeState::AwaitingElection).await;
        let role = self
            .election
            .acquire_leadership(self.config.election_wait())
            .await;

        let bucket_id = match role {
            Role::Leader => {
                self.observe_leadership(true).await;
                self.status.set(NodeState::Leader).await;
                self.boundary
                    .protect("requesting bucket failed", FailureScope::General, || {
                        self.duties.assign_next_bucket(&self.uri)
                    })
                    .await
                    .flatten()
            }
            Role::Follower => {
                self.observe_leadership(false).await;
                self.status.set(NodeState::Follower).await;
                match self.request_from_leader().await {
                    Ok(bucket_id) => bucket_id,
                    Err(outcome) => return outcome,
                }
            }
            Role::Undecided => {
                tracing::debug!(uri = %self.uri, "No leader elected yet");
                return WorkOutcome::NoLeader;
            }
        };

        let bucket_id = match bucket_id {
            Some(id) => id,
            None => return WorkOutcome::Idle(self.config.idle_wait()),
        };

        self.status.set(NodeState::Processing(bucket_id)).await;
        let status = self
            .boundary
            .protect(
                "processing bucket failed",
                FailureScope::Bucket(bucket_id),
                || self.pipeline.perform(bucket_id),
            )
            .await;
        self.status.set(NodeState::Idle).await;

        tracing::info!(bucket_id, status = ?status, "Bucket processed");
        WorkOutcome::Processed { bucket_id, status }
    }

    async fn request_from_leader(&self) -> std::result::Result<Option<BucketId>, WorkOutcome> {
        tokio::time::sleep(dispatch_jitter(self.config.dispatch_jitter_max_ms)).await;
        let leader_uri = match self.election.leader_uri().await {
            Some(uri) => uri,
            None => return Err(WorkOutcome::NoLeader),
        };

        match self
            .remote
            .request_next_bucket(&leader_uri, &self.uri)
            .await
        {
            Ok(next) if next.bucket_id.is_some() => Ok(next.bucket_id),
            Ok(next) => Err(WorkOutcome::Idle(next.retry_after)),
            Err(FarmError::NotLeader(_)) => {
                tracing::info!(leader = %leader_uri, "Leader stepped down");
                Err(WorkOutcome::NoLeader)
            }
            Err(e) => {
                tracing::warn!(leader = %leader_uri, error = %e, "Requesting bucket from leader failed");
                Err(WorkOutcome::Idle(self.config.idle_wait()))
            }
        }
    }

    /// Reset the dispatcher whenever this node gains leadership, so buckets of
    /// a previous term are recomputed from storage.
    async fn observe_leadership(&self, leader: bool) {
        let was_leader = self.was_leader.swap(leader, Ordering::SeqCst);
        if leader && !was_leader {
            tracing::info!(uri = %self.uri, "Became leader, resetting dispatcher");
            self.duties.reset().await;
        } else if !leader && was_leader {
            tracing::info!(uri = %self.uri, "Lost leadership");
            self.duties.reset().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::LocalCheckout;
    use crate::election::StaticElection;
    use crate::model::{BucketGroup, BucketTasks, Project, Repository, TaskDefinition};
    use crate::notify::LogNotifier;
    use crate::store::memory::MemoryStore;
    use crate::worker::BuildTool;
    use async_trait::async_trait;

    struct NobodyProcessing;

    #[async_trait]
    impl LivenessProbe for NobodyProcessing {
        async fn is_processing(&self, _worker_uri: &str, _bucket_id: BucketId) -> bool {
            false
        }
    }

    fn project(task: &str) -> Project {
        let mut project = Project::new(
            "demo",
            Repository::default(),
            TaskDefinition {
                groups: vec![BucketGroup {
                    name: "main".into(),
                    buckets: vec![BucketTasks {
                        name: "check".into(),
                        tasks: vec![task.into()],
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        project.build_requested = true;
        project
    }

    fn leader_node(store: Arc<MemoryStore>, root: &std::path::Path) -> WorkerNode {
        let mut config = NodeConfig::default().with_build_tool(BuildTool::shell());
        config.log_polling_interval_ms = 50;
        config.idle_wait_ms = 1_000;
        WorkerNode::new(
            config,
            store,
            Arc::new(LocalCheckout::new(root)),
            Arc::new(LogNotifier),
            Arc::new(StaticElection::leader("http://127.0.0.1:50051")),
        )
        .with_probe(Arc::new(NobodyProcessing))
    }

    #[tokio::test]
    async fn node_status_tracks_processing() {
        let status = NodeStatus::default();
        assert_eq!(status.get().await, NodeState::Idle);
        status.set(NodeState::Processing(4)).await;
        assert!(status.is_processing(4).await);
        assert!(!status.is_processing(5).await);
    }

    #[tokio::test]
    async fn leader_without_work_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let node = leader_node(store, dir.path());
        assert_eq!(
            node.work_once().await,
            WorkOutcome::Idle(Duration::from_millis(1_000))
        );
    }

    #[tokio::test]
    async fn leader_processes_its_own_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.register_project(&project("true")).unwrap();
        let node = leader_node(store.clone(), dir.path());

        assert!(node.leader_cycle().await);
        let outcome = node.work_once().await;
        let bucket_id = match outcome {
            WorkOutcome::Processed { bucket_id, status } => {
                assert_eq!(status, Some(BucketStatus::Done));
                bucket_id
            }
            other => panic!("unexpected outcome {:?}", other),
        };

        let bucket = store.bucket(bucket_id).unwrap();
        assert_eq!(bucket.status, BucketStatus::Done);
        assert_eq!(bucket.worker_uri.as_deref(), Some("http://127.0.0.1:50051"));
        assert_eq!(node.status().get().await, NodeState::Idle);
    }

    #[tokio::test]
    async fn follower_does_not_run_leader_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.register_project(&project("true")).unwrap();
        let node = WorkerNode::new(
            NodeConfig::default(),
            store.clone(),
            Arc::new(LocalCheckout::new(dir.path())),
            Arc::new(LogNotifier),
            Arc::new(StaticElection::follower("http://127.0.0.1:1")),
        );
        assert!(!node.leader_cycle().await);
        assert!(store.last_build("demo").unwrap().is_none());
    }
}

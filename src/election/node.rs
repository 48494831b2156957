use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::election::rpc::{handle_heartbeat, handle_request_vote};
use crate::election::state::{ElectionRole, ElectionState};
use crate::election::timer::random_election_timeout;
use crate::proto::election_service_client::ElectionServiceClient;
use crate::proto::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};

const PEER_RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Elects one leader among the nodes of a group.
///
/// Term and vote handling follows Raft's leader election; there is no log to
/// replicate, heartbeats only carry the leader's URI.
pub struct ElectionNode {
    pub id: u64,
    uri: String,
    group: String,
    pub state: Arc<RwLock<ElectionState>>,
    config: NodeConfig,
    peers: Arc<Mutex<HashMap<u64, ElectionServiceClient<Channel>>>>,
    last_heartbeat: Arc<RwLock<Instant>>,
}

impl ElectionNode {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            id: config.node_id,
            uri: config.uri(),
            group: config.group.clone(),
            state: Arc::new(RwLock::new(ElectionState::new())),
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Set up clients for the peer nodes. Connections are made on first use.
    pub async fn connect_to_peers(&self) {
        let mut peers = self.peers.lock().await;
        for peer_config in &self.config.peers {
            let addr = format!("http://{}", peer_config.addr);
            match Endpoint::from_shared(addr.clone()) {
                Ok(endpoint) => {
                    let channel = endpoint.connect_timeout(PEER_RPC_TIMEOUT).connect_lazy();
                    tracing::info!(peer_id = peer_config.node_id, addr = %addr, "Registered peer");
                    peers.insert(peer_config.node_id, ElectionServiceClient::new(channel));
                }
                Err(e) => {
                    tracing::warn!(
                        peer_id = peer_config.node_id,
                        addr = %addr,
                        error = %e,
                        "Invalid peer address"
                    );
                }
            }
        }
    }

    /// Run the election loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(node_id = self.id, "Election loop stopped");
                    return;
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != ElectionRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Heartbeat interval (for leaders)
                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)), if role == ElectionRole::Leader => {
                    self.send_heartbeats().await;
                }
            }
        }
    }

    /// Start a new election
    async fn start_election(&self) {
        let mut state = self.state.write().await;
        state.become_candidate(self.id);
        let term = state.current_term;
        let total_nodes = self.config.peers.len() + 1; // peers + self
        let majority = (total_nodes / 2) + 1;
        drop(state);

        tracing::info!(node_id = self.id, term, group = %self.group, "Starting election");

        let req = VoteRequest {
            group: self.group.clone(),
            term,
            candidate_id: self.id,
        };

        let peers = self.peers.lock().await;
        let mut vote_count = 1u64; // Vote for self

        for (peer_id, client) in peers.iter() {
            let mut client = client.clone();
            match timeout(PEER_RPC_TIMEOUT, client.request_vote(req.clone())).await {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        // Higher term seen, become follower
                        self.state.write().await.observe_term(resp.term);
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                        tracing::debug!(
                            node_id = self.id,
                            peer_id,
                            votes = vote_count,
                            "Received vote"
                        );
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer_id, "Vote request timed out");
                }
            }
        }
        drop(peers);

        // Check if we won
        let mut state = self.state.write().await;
        if state.role == ElectionRole::Candidate && state.current_term == term {
            state.votes_received = vote_count;
            if vote_count >= majority as u64 {
                state.become_leader(self.id, &self.uri);
                tracing::info!(node_id = self.id, term, votes = vote_count, "Became leader");
            } else {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    votes = vote_count,
                    needed = majority,
                    "Election failed, not enough votes"
                );
            }
        }
    }

    /// Send heartbeats to all followers (leader only)
    async fn send_heartbeats(&self) {
        let state = self.state.read().await;
        if state.role != ElectionRole::Leader {
            return;
        }
        let req = HeartbeatRequest {
            group: self.group.clone(),
            term: state.current_term,
            leader_id: self.id,
            leader_uri: self.uri.clone(),
        };
        drop(state);

        let peers = self.peers.lock().await;
        for (peer_id, client) in peers.iter() {
            let mut client = client.clone();
            let peer_id = *peer_id;
            let state = self.state.clone();
            let req = req.clone();

            tokio::spawn(async move {
                match timeout(PEER_RPC_TIMEOUT, client.heartbeat(req)).await {
                    Ok(Ok(response)) => {
                        let resp = response.into_inner();
                        let mut state = state.write().await;
                        if resp.term > state.current_term {
                            let was_leader = state.role == ElectionRole::Leader;
                            state.observe_term(resp.term);
                            if was_leader && state.role != ElectionRole::Leader {
                                tracing::info!(peer_id, term = resp.term, "Stepped down as leader");
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "Heartbeat failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "Heartbeat timed out");
                    }
                }
            });
        }
    }

    /// Become leader immediately and keep leadership for `lease`.
    pub async fn seize_leadership(&self, lease: Duration) {
        let mut state = self.state.write().await;
        state.seize(self.id, &self.uri, lease);
        tracing::info!(
            node_id = self.id,
            term = state.current_term,
            lease_secs = lease.as_secs(),
            "Seized leadership"
        );
        drop(state);
        self.send_heartbeats().await;
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let response = handle_request_vote(&mut state, &req, self.id, &self.group);

        // Reset election timeout if we granted vote
        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming Heartbeat RPC
    pub async fn handle_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        let mut state = self.state.write().await;
        let response = handle_heartbeat(&mut state, &req, self.id, &self.group);

        // Reset election timeout on a valid heartbeat
        if response.success {
            drop(state);
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    pub async fn role(&self) -> ElectionRole {
        self.state.read().await.role
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == ElectionRole::Leader
    }

    /// URI of the current leader, if known
    pub async fn leader_uri(&self) -> Option<String> {
        let state = self.state.read().await;
        if state.role == ElectionRole::Leader {
            Some(self.uri.clone())
        } else {
            state.leader_uri.clone()
        }
    }

    pub async fn holds_lease(&self) -> bool {
        self.state.read().await.holds_lease()
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::command::BuildTool;

/// Leadership lease taken by a tyrant node, effectively forever.
pub const TYRANT_LEASE_SECS: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    /// URI other nodes use to reach this node. Defaults to `http://<listen_addr>`.
    pub advertise_uri: Option<String>,
    /// Election group; only nodes of the same group elect each other.
    pub group: String,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Seize leadership on startup instead of waiting for an election.
    pub tyrant: bool,
    pub tyrant_lease_secs: u64,
    /// Period of the leader's bucket computation and health sweep.
    pub leader_cycle_interval_ms: u64,
    /// Wait before asking again when no bucket was available.
    pub idle_wait_ms: u64,
    /// Upper bound of the random delay a follower waits before each request.
    pub dispatch_jitter_max_ms: u64,
    pub liveness_timeout_ms: u64,
    pub log_polling_interval_ms: u64,
    pub transient_retry_delay_ms: u64,
    /// Dispatches after which a stalled bucket is no longer requeued.
    pub max_bucket_dispatches: u32,
    pub admin_email: Option<String>,
    pub checkout_root: PathBuf,
    pub build_tool: BuildTool,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            advertise_uri: None,
            group: "buildfarm".to_string(),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            tyrant: false,
            tyrant_lease_secs: TYRANT_LEASE_SECS,
            leader_cycle_interval_ms: 10_000,
            idle_wait_ms: 10_000,
            dispatch_jitter_max_ms: 2_100,
            liveness_timeout_ms: 2_000,
            log_polling_interval_ms: 10_000,
            transient_retry_delay_ms: 3_000,
            max_bucket_dispatches: 2,
            admin_email: None,
            checkout_root: PathBuf::from("checkouts"),
            build_tool: BuildTool::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_build_tool(mut self, build_tool: BuildTool) -> Self {
        self.build_tool = build_tool;
        self
    }

    /// URI identifying this node towards the leader and the store.
    pub fn uri(&self) -> String {
        self.advertise_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.listen_addr))
    }

    pub fn log_polling_interval(&self) -> Duration {
        Duration::from_millis(self.log_polling_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn leader_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.leader_cycle_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }

    /// Time a node waits for an election to resolve before asking again.
    pub fn election_wait(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms * 4)
    }
}

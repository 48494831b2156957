//! Leader election among the worker nodes of one group.
//!
//! A [`WorkerNode`](crate::node::WorkerNode) only talks to an
//! [`ElectionStrategy`]. Three strategies are provided:
//!
//! - [`MajorityElection`]: term based majority election over gRPC, carried
//!   out by an [`ElectionNode`]
//! - [`TyrantElection`]: seizes leadership for a long lease on top of an
//!   [`ElectionNode`], so the node stays leader while it lives
//! - [`StaticElection`]: fixed roles, for single nodes and tests

pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::ElectionNode;
pub use state::{ElectionRole, ElectionState};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::TYRANT_LEASE_SECS;

/// Outcome of waiting for leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    /// No leader known yet.
    Undecided,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Undecided => write!(f, "undecided"),
        }
    }
}

#[async_trait]
pub trait ElectionStrategy: Send + Sync {
    /// Wait up to `timeout` for this node to lead or to learn the leader.
    async fn acquire_leadership(&self, timeout: Duration) -> Role;

    async fn is_leader(&self) -> bool;

    async fn leader_uri(&self) -> Option<String>;

    /// Election transport to serve over gRPC, if the strategy has one.
    fn transport(&self) -> Option<Arc<ElectionNode>> {
        None
    }
}

const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Majority election through an [`ElectionNode`].
pub struct MajorityElection {
    node: Arc<ElectionNode>,
}

impl MajorityElection {
    pub fn new(node: Arc<ElectionNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl ElectionStrategy for MajorityElection {
    async fn acquire_leadership(&self, timeout: Duration) -> Role {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.node.role().await {
                ElectionRole::Leader => return Role::Leader,
                ElectionRole::Follower if self.node.leader_uri().await.is_some() => {
                    return Role::Follower
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Role::Undecided;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    async fn leader_uri(&self) -> Option<String> {
        self.node.leader_uri().await
    }

    fn transport(&self) -> Option<Arc<ElectionNode>> {
        Some(self.node.clone())
    }
}

/// Takes leadership without an election and keeps it for a lease.
pub struct TyrantElection {
    node: Arc<ElectionNode>,
    lease: Duration,
}

impl TyrantElection {
    pub fn new(node: Arc<ElectionNode>) -> Self {
        Self::with_lease(node, Duration::from_secs(TYRANT_LEASE_SECS))
    }

    pub fn with_lease(node: Arc<ElectionNode>, lease: Duration) -> Self {
        tracing::debug!(lease_secs = lease.as_secs(), "Becoming tyrant");
        Self { node, lease }
    }
}

#[async_trait]
impl ElectionStrategy for TyrantElection {
    async fn acquire_leadership(&self, _timeout: Duration) -> Role {
        if !self.node.holds_lease().await {
            self.node.seize_leadership(self.lease).await;
        }
        Role::Leader
    }

    async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    async fn leader_uri(&self) -> Option<String> {
        self.node.leader_uri().await
    }

    fn transport(&self) -> Option<Arc<ElectionNode>> {
        Some(self.node.clone())
    }
}

/// Fixed role, decided at construction.
#[derive(Debug, Clone)]
pub struct StaticElection {
    leader: bool,
    leader_uri: Option<String>,
}

impl StaticElection {
    /// This node leads and is reachable at `uri`.
    pub fn leader(uri: impl Into<String>) -> Self {
        Self {
            leader: true,
            leader_uri: Some(uri.into()),
        }
    }

    /// This node follows the leader at `leader_uri`.
    pub fn follower(leader_uri: impl Into<String>) -> Self {
        Self {
            leader: false,
            leader_uri: Some(leader_uri.into()),
        }
    }
}

#[async_trait]
impl ElectionStrategy for StaticElection {
    async fn acquire_leadership(&self, _timeout: Duration) -> Role {
        if self.leader {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    async fn is_leader(&self) -> bool {
        self.leader
    }

    async fn leader_uri(&self) -> Option<String> {
        self.leader_uri.clone()
    }
}

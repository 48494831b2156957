use tokio::time::{Duration, Instant};

/// Election role of a node within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for ElectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionRole::Follower => write!(f, "follower"),
            ElectionRole::Candidate => write!(f, "candidate"),
            ElectionRole::Leader => write!(f, "leader"),
        }
    }
}

/// Term and vote bookkeeping of one node.
///
/// At most one leader is elected per term: every node votes for at most one
/// candidate per term (`voted_for`) and a candidate needs a majority.
///
/// A node holding a lease (see [`ElectionState::seize`]) stays leader until the
/// lease runs out, whatever terms its peers announce.
#[derive(Debug)]
pub struct ElectionState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub role: ElectionRole,
    pub leader_id: Option<u64>,
    pub leader_uri: Option<String>,
    pub votes_received: u64,
    pub lease_until: Option<Instant>,
}

impl ElectionState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            role: ElectionRole::Follower,
            leader_id: None,
            leader_uri: None,
            votes_received: 0,
            lease_until: None,
        }
    }

    pub fn holds_lease(&self) -> bool {
        self.lease_until.is_some_and(|until| Instant::now() < until)
    }

    /// Adopt a higher term seen from a peer, stepping down unless leased.
    pub fn observe_term(&mut self, term: u64) {
        if term <= self.current_term {
            return;
        }
        if self.holds_lease() {
            self.current_term = term;
            self.voted_for = None;
        } else {
            self.become_follower(term);
        }
    }

    /// Transition to follower state
    pub fn become_follower(&mut self, term: u64) {
        self.role = ElectionRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.votes_received = 0;
        self.lease_until = None;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = ElectionRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
        self.leader_uri = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, my_uri: &str) {
        self.role = ElectionRole::Leader;
        self.leader_id = Some(my_id);
        self.leader_uri = Some(my_uri.to_string());
    }

    /// Take leadership for `lease` in a fresh term, without an election.
    pub fn seize(&mut self, my_id: u64, my_uri: &str, lease: Duration) {
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.become_leader(my_id, my_uri);
        self.lease_until = Instant::now().checked_add(lease).or_else(|| {
            // Far future, clamped to what the platform clock can represent
            Instant::now().checked_add(Duration::from_secs(u32::MAX as u64))
        });
    }
}

impl Default for ElectionState {
    fn default() -> Self {
        Self::new()
    }
}

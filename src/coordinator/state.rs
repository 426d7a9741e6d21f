use crate::node::NodeDetail;

/// Local view of this node's role in its group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    Follower,
    Candidate,
    Coordinator,
}

impl std::fmt::Display for CoordinatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorRole::Follower => write!(f, "follower"),
            CoordinatorRole::Candidate => write!(f, "candidate"),
            CoordinatorRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// In-process state of one strategy instance.
///
/// This is only a cache of what the store says. The coordinator lock row is
/// the source of truth; `role` can lag it by up to one election or heartbeat
/// interval.
#[derive(Debug)]
pub struct CoordinatorState {
    pub role: CoordinatorRole,
    pub joined: bool,

    // Coordinator id as last seen by the election task
    pub leader_id: Option<String>,

    // Last coordinator returned to a caller; served when the store is unreachable
    pub last_known_leader: Option<NodeDetail>,

    pub consecutive_heartbeat_failures: u32,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self {
            role: CoordinatorRole::Follower,
            joined: false,
            leader_id: None,
            last_known_leader: None,
            consecutive_heartbeat_failures: 0,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == CoordinatorRole::Coordinator
    }

    /// Enter the group as a follower
    pub fn join(&mut self) {
        self.joined = true;
        self.role = CoordinatorRole::Follower;
        self.leader_id = None;
        self.consecutive_heartbeat_failures = 0;
    }

    pub fn leave(&mut self) {
        self.joined = false;
        self.role = CoordinatorRole::Follower;
        self.leader_id = None;
        self.consecutive_heartbeat_failures = 0;
    }

    /// Returns the previous role
    pub fn become_candidate(&mut self) -> CoordinatorRole {
        std::mem::replace(&mut self.role, CoordinatorRole::Candidate)
    }

    /// Returns the previous role
    ///
    /// Heartbeat failures are left alone: re-confirming the role every election
    /// round must not hide a coordinator that cannot write its heartbeat.
    pub fn become_coordinator(&mut self, my_id: &str) -> CoordinatorRole {
        self.leader_id = Some(my_id.to_string());
        std::mem::replace(&mut self.role, CoordinatorRole::Coordinator)
    }

    /// Returns the previous role
    pub fn become_follower(&mut self, leader_id: Option<String>) -> CoordinatorRole {
        self.leader_id = leader_id;
        std::mem::replace(&mut self.role, CoordinatorRole::Follower)
    }

    pub fn record_heartbeat_success(&mut self) {
        self.consecutive_heartbeat_failures = 0;
    }

    /// Returns the number of consecutive failures including this one
    pub fn record_heartbeat_failure(&mut self) -> u32 {
        self.consecutive_heartbeat_failures += 1;
        self.consecutive_heartbeat_failures
    }

    /// A coordinator that cannot reach the store must not keep the group waiting.
    pub fn should_relinquish(&self, max_failures: u32) -> bool {
        self.is_coordinator() && self.consecutive_heartbeat_failures >= max_failures
    }
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self::new()
    }
}

use std::fmt::Display;
use std::time::Duration;

use hacake_membership::NodeId;

pub static DEFAULT_GROUP: &str = "__DEFAULT__";

const DEFAULT_QUORUM_SIZE: usize = 1;
const DEFAULT_CHECK_INTERVAL: Duration = if cfg!(any(test, feature = "test-utils")) {
    Duration::from_millis(100)
} else {
    Duration::from_secs(1)
};
const DEFAULT_OPERATION_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_secs(2)
} else {
    Duration::from_secs(30)
};

#[derive(Debug, Clone)]
/// The settings of a single HA node.
pub struct HaConfig {
    /// The id of the local node, must match the id the membership view reports.
    pub node_id: NodeId,
    /// The HA group the node participates in.
    ///
    /// Quorum is counted and failover candidates are elected within a group.
    pub group: String,
    /// The minimum number of live same-group nodes required before HA
    /// deployments are activated.
    ///
    /// Values of `0` or `1` disable quorum gating.
    pub quorum_size: usize,
    /// The time between each reconciliation tick.
    pub check_interval: Duration,
    /// The maximum time a single driver or ledger call may take.
    pub operation_timeout: Duration,
}

impl HaConfig {
    /// Create a new config for the given node in the default group.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            group: DEFAULT_GROUP.to_string(),
            quorum_size: DEFAULT_QUORUM_SIZE,
            check_interval: DEFAULT_CHECK_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Set the HA group the node belongs to.
    pub fn with_group(mut self, group: impl Display) -> Self {
        self.group = group.to_string();
        self
    }

    /// Set the quorum size.
    pub fn with_quorum_size(mut self, quorum_size: usize) -> Self {
        self.quorum_size = quorum_size;
        self
    }

    /// Set the reconciliation tick period.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the timeout applied to each driver and ledger call.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[inline]
    /// Returns if quorum gating is disabled.
    pub fn quorum_disabled(&self) -> bool {
        self.quorum_size <= 1
    }
}

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the HA coordinator.
pub struct HaStatistics(Arc<HaStatisticsInner>);

impl Deref for HaStatistics {
    type Target = HaStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct HaStatisticsInner {
    /// The number of units the node has started.
    pub(crate) num_deployments_started: Counter,
    /// The number of units the node has stopped.
    pub(crate) num_deployments_stopped: Counter,
    /// The number of HA deploys which were deferred awaiting quorum.
    pub(crate) num_deferred_deploys: Counter,
    /// The number of HA units stopped because quorum was lost.
    pub(crate) num_quorum_undeploys: Counter,
    /// The number of failover replays executed by this node.
    pub(crate) num_failovers: Counter,
    /// The number of units this node redeployed on behalf of departed nodes.
    pub(crate) num_units_claimed: Counter,
    /// The number of times this node observed quorum being lost.
    pub(crate) num_quorum_losses: Counter,
    pub(crate) num_publish_failures: Counter,
}

impl HaStatisticsInner {
    /// The number of units the node has started.
    pub fn num_deployments_started(&self) -> u64 {
        self.num_deployments_started.load(Ordering::Relaxed)
    }

    /// The number of units the node has stopped.
    pub fn num_deployments_stopped(&self) -> u64 {
        self.num_deployments_stopped.load(Ordering::Relaxed)
    }

    /// The number of HA deploys which were deferred awaiting quorum.
    pub fn num_deferred_deploys(&self) -> u64 {
        self.num_deferred_deploys.load(Ordering::Relaxed)
    }

    /// The number of HA units stopped because quorum was lost.
    pub fn num_quorum_undeploys(&self) -> u64 {
        self.num_quorum_undeploys.load(Ordering::Relaxed)
    }

    /// The number of failover replays executed by this node.
    pub fn num_failovers(&self) -> u64 {
        self.num_failovers.load(Ordering::Relaxed)
    }

    /// The number of units this node redeployed on behalf of departed nodes.
    pub fn num_units_claimed(&self) -> u64 {
        self.num_units_claimed.load(Ordering::Relaxed)
    }

    /// The number of times this node observed quorum being lost.
    pub fn num_quorum_losses(&self) -> u64 {
        self.num_quorum_losses.load(Ordering::Relaxed)
    }

    /// The number of failed attempts to publish the node's record.
    pub fn num_publish_failures(&self) -> u64 {
        self.num_publish_failures.load(Ordering::Relaxed)
    }
}

#[inline]
pub(crate) fn incr(counter: &Counter) {
    counter.fetch_add(1, Ordering::Relaxed);
}

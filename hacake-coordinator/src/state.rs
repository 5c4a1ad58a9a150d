use std::collections::{BTreeSet, VecDeque};

use hacake_ledger::{DeploymentRecord, NodeRecord};
use hacake_membership::NodeId;

use crate::tasks::{DeployTask, FailoverTask, PendingTask};

/// The mutable HA state of the local node.
///
/// Guarded by a single mutex which is never held across an await point.
pub(crate) struct NodeState {
    /// The node's own ledger record, the source of truth for what it publishes.
    pub(crate) record: NodeRecord,
    pub(crate) attained_quorum: bool,
    pub(crate) deploy_queue: VecDeque<DeployTask>,
    pub(crate) failover_queue: VecDeque<FailoverTask>,
    /// Departed nodes with a replay queued or running.
    pub(crate) scheduled_failovers: BTreeSet<NodeId>,
    /// Departures whose ledger snapshot could not be read.
    pub(crate) unprocessed_leaves: BTreeSet<NodeId>,
    /// External ids currently being started by the driver.
    pub(crate) in_flight: BTreeSet<String>,
    /// Bumped on every change to `record`.
    pub(crate) version: u64,
    /// Set when the latest version of `record` has not been written.
    pub(crate) dirty: bool,
    /// Set once the node has cleanly left, nothing is published afterwards.
    pub(crate) closed: bool,
}

impl NodeState {
    pub(crate) fn new(record: NodeRecord, attained_quorum: bool) -> Self {
        Self {
            record,
            attained_quorum,
            deploy_queue: VecDeque::new(),
            failover_queue: VecDeque::new(),
            scheduled_failovers: BTreeSet::new(),
            unprocessed_leaves: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            version: 0,
            dirty: true,
            closed: false,
        }
    }

    /// Returns if the external id is owned, queued or being started locally.
    pub(crate) fn is_known(&self, external_id: &str) -> bool {
        self.record.contains(external_id)
            || self.in_flight.contains(external_id)
            || self.is_deferred(external_id)
    }

    pub(crate) fn is_deferred(&self, external_id: &str) -> bool {
        self.deploy_queue
            .iter()
            .any(|task| task.external_id == external_id)
    }

    /// Removes a deferred deploy from the queue.
    pub(crate) fn cancel_deferred(&mut self, external_id: &str) -> Option<DeployTask> {
        let pos = self
            .deploy_queue
            .iter()
            .position(|task| task.external_id == external_id)?;
        self.deploy_queue.remove(pos)
    }

    pub(crate) fn add_deployment(&mut self, deployment: DeploymentRecord) {
        self.record.push(deployment);
        self.mark_changed();
    }

    pub(crate) fn remove_deployment(&mut self, external_id: &str) -> Option<DeploymentRecord> {
        let removed = self.record.remove(external_id)?;
        self.mark_changed();
        Some(removed)
    }

    /// A copy of every active HA deployment in the record.
    pub(crate) fn ha_deployments(&self) -> Vec<DeploymentRecord> {
        self.record.ha_deployments().cloned().collect()
    }

    /// Returns if the record holds the deployment under the given driver handle.
    pub(crate) fn owns(&self, external_id: &str, internal_id: &str) -> bool {
        self.record
            .find(external_id)
            .map(|dep| dep.internal_id == internal_id)
            .unwrap_or(false)
    }

    /// Schedules a failover replay unless one is already queued or running.
    pub(crate) fn schedule_failover(&mut self, task: FailoverTask) -> bool {
        if !self.scheduled_failovers.insert(task.departed.clone()) {
            return false;
        }
        self.failover_queue.push_back(task);
        true
    }

    /// Re-queues replays at the front of the queue, keeping their order.
    pub(crate) fn requeue_failovers(&mut self, tasks: Vec<FailoverTask>) {
        for task in tasks.into_iter().rev() {
            self.failover_queue.push_front(task);
        }
    }

    /// Every queued task, failovers first as that is the order they execute in.
    pub(crate) fn pending_tasks(&self) -> Vec<PendingTask> {
        self.failover_queue
            .iter()
            .cloned()
            .map(PendingTask::from)
            .chain(self.deploy_queue.iter().cloned().map(PendingTask::from))
            .collect()
    }

    fn mark_changed(&mut self) {
        self.version += 1;
        self.dirty = true;
    }
}

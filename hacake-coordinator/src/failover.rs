use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hacake_ledger::{DeploymentRecord, Ledger, LedgerSnapshot};
use hacake_membership::{MembershipChange, MembershipView, NodeId};
use tokio::task::JoinHandle;

use crate::node::HaCore;
use crate::statistics::incr;
use crate::tasks::FailoverTask;
use crate::{DeploymentDriver, HaError};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Emitted once this node has claimed the deployments of a departed node.
pub struct FailoverEvent {
    /// The node whose deployments were failed over.
    pub departed: NodeId,
    /// If every HA deployment of the departed node was redeployed.
    pub succeeded: bool,
}

/// The nodes eligible to claim the deployments of `departed`.
///
/// Candidates are the live nodes with a ledger entry in `group`, excluding
/// the departed node itself, in node id order. Two nodes observing the same
/// snapshot and live set always produce the same list.
pub fn failover_candidates(
    snapshot: &LedgerSnapshot,
    group: &str,
    departed: &str,
    live_nodes: &BTreeSet<NodeId>,
) -> Vec<NodeId> {
    snapshot
        .group_members(group)
        .filter(|node_id| node_id.as_str() != departed)
        .filter(|node_id| live_nodes.contains(*node_id))
        .cloned()
        .collect()
}

/// Selects the single node responsible for failing over `departed`.
pub fn choose_claimant<'a>(candidates: &'a [NodeId], departed: &str) -> Option<&'a NodeId> {
    if candidates.is_empty() {
        return None;
    }

    let hash = crc32fast::hash(departed.as_bytes()) as usize;
    candidates.get(hash % candidates.len())
}

enum FailoverOutcome {
    /// The replay no longer applies or another node is the claimant.
    Skipped,
    Completed { succeeded: bool },
    Retry(FailoverTask),
}

/// Starts the task which forwards membership changes to the coordinator.
pub(crate) fn start_membership_watcher<M, L, D>(
    core: Arc<HaCore<M, L, D>>,
    changes: flume::Receiver<MembershipChange>,
    kill_switch: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    tokio::spawn(async move {
        while let Ok(change) = changes.recv_async().await {
            if kill_switch.load(Ordering::Relaxed) {
                break;
            }

            core.handle_membership_change(change).await;
        }

        debug!(node_id = %core.node_id(), "Membership watcher has shut down.");
    })
}

impl<M, L, D> HaCore<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    pub(crate) async fn handle_membership_change(&self, change: MembershipChange) {
        if !change.joined.is_empty() {
            debug!(node_id = %self.node_id(), joined = ?change.joined, "Nodes joined.");
        }

        let mut scheduled = false;
        for departed in change.left {
            if departed == self.config.node_id {
                continue;
            }

            scheduled |= self.schedule_departure(&departed).await;
        }

        let attained = self.check_quorum().await;
        if scheduled && attained {
            let _guard = self.reconcile_lock.lock().await;
            self.drain_failovers().await;
        }
    }

    /// Schedules replays for the departed node and any other stale entries.
    ///
    /// Returns if any new replay was queued. If the ledger cannot be read the
    /// departure is remembered and retried on the next tick.
    pub(crate) async fn schedule_departure(&self, departed: &str) -> bool {
        info!(node_id = %self.node_id(), departed = %departed, "Node has left the cluster.");
        self.schedule_stale_entries(Some(departed)).await
    }

    /// Schedules a replay for every ledger entry whose node is no longer live.
    pub(crate) async fn schedule_stale_entries(&self, departed: Option<&str>) -> bool {
        let snapshot = match self.read_ledger().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    node_id = %self.node_id(),
                    departed = ?departed,
                    error = ?e,
                    "Unable to read ledger for stale entries, retrying next tick."
                );
                if let Some(departed) = departed {
                    self.state.lock().unprocessed_leaves.insert(departed.to_string());
                }
                return false;
            },
        };

        let live_nodes = self.membership.live_nodes();
        let mut state = self.state.lock();
        let mut scheduled = false;
        for (node_id, record) in snapshot.iter() {
            if node_id == &self.config.node_id {
                continue;
            }

            if Some(node_id.as_str()) == departed || !live_nodes.contains(node_id) {
                let task = FailoverTask {
                    departed: node_id.clone(),
                    record: record.clone(),
                };

                if state.schedule_failover(task) {
                    debug!(node_id = %self.node_id(), departed = %node_id, "Scheduled failover.");
                    scheduled = true;
                }
            }
        }

        scheduled
    }

    pub(crate) async fn retry_unprocessed_leaves(&self) {
        let departed = std::mem::take(&mut self.state.lock().unprocessed_leaves);
        for node_id in departed {
            self.schedule_departure(&node_id).await;
        }
    }

    /// Executes every queued failover replay.
    ///
    /// Callers must hold the reconcile lock.
    pub(crate) async fn drain_failovers(&self) {
        let mut retries = Vec::new();

        loop {
            let task = self.state.lock().failover_queue.pop_front();
            let task = match task {
                Some(task) => task,
                None => break,
            };

            let departed = task.departed.clone();
            match self.run_failover(task).await {
                FailoverOutcome::Retry(task) => retries.push(task),
                FailoverOutcome::Completed { succeeded } => {
                    self.state.lock().scheduled_failovers.remove(&departed);
                    incr(&self.statistics.num_failovers);
                    let _ = self.events.send(FailoverEvent {
                        departed,
                        succeeded,
                    });
                },
                FailoverOutcome::Skipped => {
                    self.state.lock().scheduled_failovers.remove(&departed);
                },
            }
        }

        if !retries.is_empty() {
            self.state.lock().requeue_failovers(retries);
        }
    }

    async fn run_failover(&self, task: FailoverTask) -> FailoverOutcome {
        if self.membership.is_live(&task.departed) {
            debug!(
                node_id = %self.node_id(),
                departed = %task.departed,
                "Departed node has rejoined, dropping failover."
            );
            return FailoverOutcome::Skipped;
        }

        let snapshot = match self.read_ledger().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    node_id = %self.node_id(),
                    departed = %task.departed,
                    error = ?e,
                    "Unable to read ledger for failover, retrying next tick."
                );
                return FailoverOutcome::Retry(task);
            },
        };

        let live_nodes = self.membership.live_nodes();
        let candidates =
            failover_candidates(&snapshot, &task.record.group, &task.departed, &live_nodes);
        let chosen = match choose_claimant(&candidates, &task.departed) {
            Some(chosen) => chosen,
            None => {
                info!(
                    node_id = %self.node_id(),
                    departed = %task.departed,
                    "No failover candidates are available."
                );
                return FailoverOutcome::Skipped;
            },
        };

        if chosen != &self.config.node_id {
            debug!(
                node_id = %self.node_id(),
                departed = %task.departed,
                claimant = %chosen,
                "Another node is claiming the departed node's deployments."
            );
            return FailoverOutcome::Skipped;
        }

        info!(
            node_id = %self.node_id(),
            departed = %task.departed,
            num_deployments = task.record.deployments.len(),
            "Claiming deployments of departed node."
        );

        let mut succeeded = true;
        for deployment in task.record.deployments.iter() {
            if !deployment.ha {
                debug!(
                    external_id = %deployment.external_id,
                    "Dropping non-HA deployment of departed node."
                );
                continue;
            }

            if let Err(e) = self.claim_deployment(deployment).await {
                error!(
                    node_id = %self.node_id(),
                    departed = %task.departed,
                    external_id = %deployment.external_id,
                    error = ?e,
                    "Failed to redeploy deployment of departed node."
                );
                succeeded = false;
            }
        }

        if let Err(e) = self.delete_entry(&task.departed).await {
            warn!(
                node_id = %self.node_id(),
                departed = %task.departed,
                error = ?e,
                "Failed to remove departed node's ledger entry, retrying next tick."
            );
            return FailoverOutcome::Retry(task.deletion_only());
        }

        info!(
            node_id = %self.node_id(),
            departed = %task.departed,
            succeeded = succeeded,
            "Failover complete."
        );
        FailoverOutcome::Completed { succeeded }
    }

    async fn claim_deployment(&self, deployment: &DeploymentRecord) -> Result<(), HaError> {
        if self.state.lock().is_known(&deployment.external_id) {
            debug!(
                external_id = %deployment.external_id,
                "Deployment is already owned locally, skipping."
            );
            return Ok(());
        }

        if !self.driver.supports_failover(deployment.spec.kind) {
            return Err(HaError::UnsupportedOperation(format!(
                "failover of {:?} deployments",
                deployment.spec.kind
            )));
        }

        self.state
            .lock()
            .in_flight
            .insert(deployment.external_id.clone());
        let res = self.run_unit(&deployment.spec).await;

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&deployment.external_id);
            let internal_id = res?;
            state.add_deployment(DeploymentRecord::new(
                deployment.external_id.clone(),
                deployment.spec.clone(),
                true,
                internal_id,
            ));
        }
        incr(&self.statistics.num_units_claimed);

        self.publish_or_defer().await;
        Ok(())
    }
}

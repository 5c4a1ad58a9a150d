use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hacake_ledger::{DeploymentRecord, Ledger, LedgerSnapshot};
use hacake_membership::{MembershipView, NodeId};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::node::HaCore;
use crate::statistics::incr;
use crate::tasks::DeployTask;
use crate::DeploymentDriver;

/// Counts the live nodes of `group` which have published a ledger entry.
pub fn count_group_members(
    snapshot: &LedgerSnapshot,
    group: &str,
    live_nodes: &BTreeSet<NodeId>,
) -> usize {
    snapshot
        .group_members(group)
        .filter(|node_id| live_nodes.contains(*node_id))
        .count()
}

/// Starts the reconciliation cycle task.
///
/// Each tick re-evaluates quorum and then either drains the deferred work
/// or stops the HA units which can no longer run.
pub(crate) fn start_reconciliation_cycle<M, L, D>(
    core: Arc<HaCore<M, L, D>>,
    kill_switch: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    tokio::spawn(reconciliation_cycle(core, kill_switch))
}

async fn reconciliation_cycle<M, L, D>(core: Arc<HaCore<M, L, D>>, kill_switch: Arc<AtomicBool>)
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    let mut interval = interval(core.config.check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        if kill_switch.load(Ordering::Relaxed) {
            break;
        }

        let _guard = core.reconcile_lock.lock().await;
        core.tick().await;
    }

    debug!(node_id = %core.node_id(), "Reconciliation cycle has shut down.");
}

impl<M, L, D> HaCore<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    /// A single reconciliation pass.
    ///
    /// Callers must hold the reconcile lock.
    pub(crate) async fn tick(&self) {
        let dirty = self.state.lock().dirty;
        if dirty {
            self.publish_or_defer().await;
        }

        self.retry_unprocessed_leaves().await;

        if self.check_quorum().await {
            self.drain_failovers().await;
            self.drain_deploys().await;
        } else {
            self.undeploy_on_quorum_loss().await;
        }
    }

    /// Re-evaluates whether the node's group has quorum.
    ///
    /// If the ledger cannot be read the previous state is kept.
    pub(crate) async fn check_quorum(&self) -> bool {
        if self.config.quorum_disabled() {
            return self.set_attained_quorum(true);
        }

        let snapshot = match self.read_ledger().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    node_id = %self.node_id(),
                    error = ?e,
                    "Unable to read ledger for quorum check, keeping previous state."
                );
                return self.state.lock().attained_quorum;
            },
        };

        let live_nodes = self.membership.live_nodes();
        let count = count_group_members(&snapshot, &self.config.group, &live_nodes);
        self.set_attained_quorum(count >= self.config.quorum_size)
    }

    fn set_attained_quorum(&self, attained: bool) -> bool {
        let mut state = self.state.lock();
        if state.attained_quorum == attained {
            return attained;
        }
        state.attained_quorum = attained;

        if attained {
            info!(
                node_id = %self.node_id(),
                group = %self.config.group,
                quorum_size = self.config.quorum_size,
                "Quorum attained."
            );
        } else {
            incr(&self.statistics.num_quorum_losses);
            warn!(
                node_id = %self.node_id(),
                group = %self.config.group,
                quorum_size = self.config.quorum_size,
                "Quorum lost, HA deployments will be undeployed."
            );
        }

        attained
    }

    /// Runs every deferred deploy in FIFO order.
    ///
    /// A deploy which fails is logged and dropped.
    pub(crate) async fn drain_deploys(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                let task = state.deploy_queue.pop_front();
                if let Some(task) = task.as_ref() {
                    state.in_flight.insert(task.external_id.clone());
                }
                task
            };

            let task = match task {
                Some(task) => task,
                None => break,
            };

            let res = self.run_unit(&task.spec).await;

            {
                let mut state = self.state.lock();
                state.in_flight.remove(&task.external_id);
                match res {
                    Ok(internal_id) => {
                        info!(
                            node_id = %self.node_id(),
                            external_id = %task.external_id,
                            internal_id = %internal_id,
                            "Deferred deployment is now active."
                        );
                        state.add_deployment(DeploymentRecord::new(
                            task.external_id,
                            task.spec,
                            true,
                            internal_id,
                        ));
                    },
                    Err(e) => {
                        error!(
                            node_id = %self.node_id(),
                            external_id = %task.external_id,
                            error = ?e,
                            "Failed to run deferred deployment."
                        );
                        continue;
                    },
                }
            }

            self.publish_or_defer().await;
        }
    }

    /// Stops every active HA unit, deferring each until quorum is regained.
    ///
    /// A record is only removed once its unit has stopped. Units which fail
    /// to stop stay in the record and are retried next tick.
    pub(crate) async fn undeploy_on_quorum_loss(&self) {
        let deployments = self.state.lock().ha_deployments();
        if deployments.is_empty() {
            return;
        }

        let mut changed = false;
        for deployment in deployments {
            if let Err(e) = self.stop_unit(&deployment.internal_id).await {
                error!(
                    node_id = %self.node_id(),
                    external_id = %deployment.external_id,
                    error = ?e,
                    "Failed to undeploy HA deployment, retrying next tick."
                );
                continue;
            }

            let deferred = {
                let mut state = self.state.lock();
                // The deployment may have been undeployed while it was stopping.
                let owned = state.owns(&deployment.external_id, &deployment.internal_id);
                if owned {
                    state.remove_deployment(&deployment.external_id);
                    state.deploy_queue.push_back(DeployTask {
                        external_id: deployment.external_id.clone(),
                        spec: deployment.spec,
                    });
                }
                owned
            };

            if !deferred {
                continue;
            }

            changed = true;
            incr(&self.statistics.num_quorum_undeploys);
            info!(
                node_id = %self.node_id(),
                external_id = %deployment.external_id,
                "Undeployed HA deployment due to lack of quorum."
            );
        }

        if changed {
            self.publish_or_defer().await;
        }
    }
}

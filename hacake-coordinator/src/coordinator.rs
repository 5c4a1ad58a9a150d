use std::sync::Arc;

use hacake_ledger::{DeploymentRecord, Ledger, UnitSpec};
use hacake_membership::{MembershipView, NodeId};
use tokio::sync::broadcast;

use crate::failover::FailoverEvent;
use crate::node::HaCore;
use crate::statistics::incr;
use crate::tasks::{DeployTask, PendingTask};
use crate::{DeploymentDriver, HaError, HaStatistics};

#[derive(Debug, Clone, PartialEq, Eq)]
/// The result of an accepted deploy request.
pub enum DeployOutcome {
    /// The unit is running on this node.
    Active { internal_id: String },
    /// The unit is HA and quorum is absent, it will be started once
    /// quorum is attained.
    Deferred,
}

/// A cheap to clone handle for deploying and inspecting units.
pub struct HaHandle<M, L, D> {
    pub(crate) core: Arc<HaCore<M, L, D>>,
}

impl<M, L, D> Clone for HaHandle<M, L, D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<M, L, D> HaHandle<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    /// The id of the local node.
    pub fn node_id(&self) -> &str {
        self.core.node_id()
    }

    /// Deploys a unit on this node under a cluster-wide unique id.
    ///
    /// Non-HA units are always started immediately. HA units are only started
    /// while the node's group has quorum, otherwise they are queued and
    /// [DeployOutcome::Deferred] is returned.
    ///
    /// If the id is already in use anywhere in the ledger, or by this node's
    /// queued work, [HaError::DuplicateDeployment] is returned and nothing
    /// is changed.
    ///
    /// Waits for any in-progress reconciliation pass before touching the
    /// node's record.
    pub async fn deploy_as(
        &self,
        external_id: impl Into<String>,
        spec: UnitSpec,
        ha: bool,
    ) -> Result<DeployOutcome, HaError> {
        let external_id = external_id.into();
        spec.validate()?;

        let _guard = self.core.reconcile_lock.lock().await;
        let snapshot = self.core.read_ledger().await?;
        if snapshot.contains_deployment(&external_id) {
            return Err(HaError::DuplicateDeployment(external_id));
        }

        {
            let mut state = self.core.state.lock();
            if state.is_known(&external_id) {
                return Err(HaError::DuplicateDeployment(external_id));
            }

            if ha && !state.attained_quorum {
                info!(
                    node_id = %self.node_id(),
                    external_id = %external_id,
                    "Quorum not attained, deferring HA deployment."
                );
                state.deploy_queue.push_back(DeployTask { external_id, spec });
                incr(&self.core.statistics.num_deferred_deploys);
                return Ok(DeployOutcome::Deferred);
            }

            state.in_flight.insert(external_id.clone());
        }

        let res = self.core.run_unit(&spec).await;

        let internal_id = {
            let mut state = self.core.state.lock();
            state.in_flight.remove(&external_id);
            let internal_id = res?;
            state.add_deployment(DeploymentRecord::new(
                external_id.clone(),
                spec,
                ha,
                internal_id.clone(),
            ));
            internal_id
        };

        info!(
            node_id = %self.node_id(),
            external_id = %external_id,
            internal_id = %internal_id,
            ha = ha,
            "Deployment is active."
        );

        self.core.publish_or_defer().await;
        Ok(DeployOutcome::Active { internal_id })
    }

    /// Undeploys a unit owned by this node.
    ///
    /// The deployment is removed from the node's record even if the driver
    /// fails to stop it, in which case the driver error is returned.
    /// A deferred deployment is simply cancelled.
    pub async fn undeploy_as(&self, external_id: &str) -> Result<(), HaError> {
        let _guard = self.core.reconcile_lock.lock().await;
        let deployment = {
            let mut state = self.core.state.lock();
            if state.cancel_deferred(external_id).is_some() {
                info!(
                    node_id = %self.node_id(),
                    external_id = %external_id,
                    "Cancelled deferred deployment."
                );
                return Ok(());
            }

            state.remove_deployment(external_id)
        };

        let deployment = deployment
            .ok_or_else(|| HaError::UnknownDeployment(external_id.to_string()))?;

        let res = self.core.stop_unit(&deployment.internal_id).await;
        if let Err(e) = res.as_ref() {
            error!(
                node_id = %self.node_id(),
                external_id = %external_id,
                error = ?e,
                "Failed to stop deployment, removing it regardless."
            );
        }

        self.core.publish_or_defer().await;
        res
    }

    /// Returns if the unit is running or expected to run.
    ///
    /// This is the case when a ledger record exists whose owner is live,
    /// when the record is HA (it will be failed over if the owner is gone),
    /// or when it is waiting in this node's deferred queue.
    pub async fn is_deployed(&self, external_id: &str) -> Result<bool, HaError> {
        if self.core.state.lock().is_deferred(external_id) {
            return Ok(true);
        }

        let snapshot = self.core.read_ledger().await?;
        let deployed = snapshot
            .find(external_id)
            .map(|(owner, deployment)| {
                deployment.ha || self.core.membership.is_live(&owner.node_id)
            })
            .unwrap_or(false);

        Ok(deployed)
    }

    /// The node whose ledger record currently holds the deployment.
    pub async fn owner_of(&self, external_id: &str) -> Result<Option<NodeId>, HaError> {
        let snapshot = self.core.read_ledger().await?;
        Ok(snapshot
            .find(external_id)
            .map(|(owner, _)| owner.node_id.clone()))
    }

    /// The ledger record of the deployment.
    pub async fn deployment_info(
        &self,
        external_id: &str,
    ) -> Result<Option<DeploymentRecord>, HaError> {
        let snapshot = self.core.read_ledger().await?;
        Ok(snapshot
            .find(external_id)
            .map(|(_, deployment)| deployment.clone()))
    }

    /// Returns if this node currently believes its group has quorum.
    pub fn attained_quorum(&self) -> bool {
        self.core.state.lock().attained_quorum
    }

    /// The work queued on this node, in execution order.
    pub fn pending_tasks(&self) -> Vec<PendingTask> {
        self.core.state.lock().pending_tasks()
    }

    /// The deployments currently active on this node.
    pub fn local_deployments(&self) -> Vec<DeploymentRecord> {
        self.core.state.lock().record.deployments.clone()
    }

    /// Resolves a driver handle of a local deployment to its external id.
    pub fn external_id_of(&self, internal_id: &str) -> Option<String> {
        self.core
            .state
            .lock()
            .record
            .external_id_of(internal_id)
            .map(String::from)
    }

    /// Live statistics of this node's coordinator.
    pub fn statistics(&self) -> HaStatistics {
        self.core.statistics.clone()
    }

    /// Subscribes to the failovers this node completes as the claimant.
    pub fn failover_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.core.events.subscribe()
    }
}

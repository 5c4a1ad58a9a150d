//! # hacake coordinator
//! Quorum gated deployment coordination and deterministic failover for HA workloads.
//!
//! Every node runs an [HaManager] which owns a single record in the replicated
//! deployment ledger. Units are deployed through the [HaHandle], HA units are
//! only activated while the node's group has at least `quorum_size` live
//! members, they are stopped again when quorum is lost and restarted once it
//! is regained.
//!
//! When a node departs, each surviving member of its group independently
//! computes the same claimant from the canonically ordered candidate list.
//! Only the claimant redeploys the departed node's HA units and removes
//! its ledger entry.
//!
//! ## Basic Example
//!
//! ```rust
//! use hacake_coordinator::test_utils::MemDriver;
//! use hacake_coordinator::{DeployOutcome, HaConfig, HaManager};
//! use hacake_ledger::test_utils::MemLedger;
//! use hacake_ledger::UnitSpec;
//! use hacake_membership::LocalMembership;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let membership = LocalMembership::with_members(["node-1"]);
//!     let manager = HaManager::start(
//!         HaConfig::new("node-1"),
//!         membership,
//!         MemLedger::default(),
//!         MemDriver::default(),
//!     )
//!     .await?;
//!
//!     let handle = manager.handle();
//!     let outcome = handle
//!         .deploy_as("my-service", UnitSpec::verticle("app.js"), true)
//!         .await?;
//!     assert!(matches!(outcome, DeployOutcome::Active { .. }));
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod config;
mod coordinator;
mod driver;
mod error;
mod failover;
mod node;
mod quorum;
mod state;
mod statistics;
mod tasks;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use config::{HaConfig, DEFAULT_GROUP};
pub use coordinator::{DeployOutcome, HaHandle};
pub use driver::DeploymentDriver;
pub use error::{HaError, OperationTimeout};
pub use failover::{choose_claimant, failover_candidates, FailoverEvent};
use futures::future::join_all;
use hacake_ledger::Ledger;
use hacake_membership::MembershipView;
pub use quorum::count_group_members;
pub use statistics::HaStatistics;
pub use tasks::{DeployTask, FailoverTask, PendingTask};
use tokio::task::JoinHandle;

use crate::node::HaCore;

/// The HA coordinator of a single node.
///
/// Dropping the manager stops its background tasks but leaves the node's
/// ledger entry in place, exactly as if the node had crashed. Use
/// [HaManager::shutdown] to leave the cluster cleanly.
pub struct HaManager<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    handle: HaHandle<M, L, D>,
    tasks: BackgroundTasks,
}

impl<M, L, D> HaManager<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    /// Joins the HA cluster.
    ///
    /// The node publishes its (empty) record, evaluates quorum once, schedules
    /// failovers for entries left behind by nodes which are no longer live and
    /// then starts the reconciliation cycle and the membership watcher.
    pub async fn start(
        config: HaConfig,
        membership: M,
        ledger: L,
        driver: D,
    ) -> Result<Self, HaError> {
        let changes = membership.subscribe();
        let core = Arc::new(HaCore::new(config, membership, ledger, driver));

        core.publish().await?;
        let attained = core.check_quorum().await;
        core.schedule_stale_entries(None).await;

        let kill_switch = Arc::new(AtomicBool::new(false));
        let cycle = quorum::start_reconciliation_cycle(core.clone(), kill_switch.clone());
        let watcher =
            failover::start_membership_watcher(core.clone(), changes, kill_switch.clone());

        info!(
            node_id = %core.config.node_id,
            group = %core.config.group,
            quorum_size = core.config.quorum_size,
            attained_quorum = attained,
            "HA manager started."
        );

        Ok(Self {
            handle: HaHandle { core },
            tasks: BackgroundTasks {
                kill_switch,
                handles: vec![cycle, watcher],
            },
        })
    }

    /// Gets a handle for deploying and inspecting units.
    pub fn handle(&self) -> HaHandle<M, L, D> {
        self.handle.clone()
    }

    /// Cleanly leaves the HA cluster.
    ///
    /// Background tasks are stopped, every local deployment is stopped and
    /// the node's ledger entry is removed so the other nodes do not fail
    /// over its deployments.
    pub async fn shutdown(self) -> Result<(), HaError> {
        let core = self.handle.core.clone();

        self.tasks.kill_switch.store(true, Ordering::Relaxed);
        {
            let _guard = core.reconcile_lock.lock().await;
            self.tasks.abort();
        }

        let deployments = std::mem::take(&mut core.state.lock().record.deployments);
        let results = join_all(
            deployments
                .iter()
                .map(|deployment| core.stop_unit(&deployment.internal_id)),
        )
        .await;

        for (deployment, res) in deployments.iter().zip(results) {
            if let Err(e) = res {
                warn!(
                    node_id = %core.config.node_id,
                    external_id = %deployment.external_id,
                    error = ?e,
                    "Failed to stop deployment during shutdown."
                );
            }
        }

        core.close().await?;

        info!(node_id = %core.config.node_id, "HA manager has left the cluster.");
        Ok(())
    }
}

impl<M, L, D> Deref for HaManager<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    type Target = HaHandle<M, L, D>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<M, L, D> Drop for HaManager<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    fn drop(&mut self) {
        self.tasks.kill_switch.store(true, Ordering::Relaxed);
        self.tasks.abort();
    }
}

struct BackgroundTasks {
    kill_switch: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn abort(&self) {
        for handle in self.handles.iter() {
            handle.abort();
        }
    }
}

use std::future::Future;

use hacake_ledger::{Ledger, LedgerSnapshot, NodeRecord, UnitSpec};
use hacake_membership::MembershipView;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::error::OperationTimeout;
use crate::failover::FailoverEvent;
use crate::state::NodeState;
use crate::statistics::incr;
use crate::{DeploymentDriver, HaConfig, HaError, HaStatistics};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The state and collaborators shared by the API, the reconciliation
/// cycle and the membership watcher.
pub(crate) struct HaCore<M, L, D> {
    pub(crate) config: HaConfig,
    pub(crate) membership: M,
    pub(crate) ledger: L,
    pub(crate) driver: D,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) statistics: HaStatistics,
    pub(crate) events: broadcast::Sender<FailoverEvent>,
    /// Serialises ticks, failover drains and API changes to the own record.
    pub(crate) reconcile_lock: tokio::sync::Mutex<()>,
    publish_lock: tokio::sync::Mutex<()>,
}

impl<M, L, D> HaCore<M, L, D>
where
    M: MembershipView,
    L: Ledger,
    D: DeploymentDriver,
{
    pub(crate) fn new(config: HaConfig, membership: M, ledger: L, driver: D) -> Self {
        let record = NodeRecord::new(config.node_id.clone(), config.group.clone());
        let state = NodeState::new(record, config.quorum_disabled());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            membership,
            ledger,
            driver,
            state: Mutex::new(state),
            statistics: HaStatistics::default(),
            events,
            reconcile_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Starts a unit via the local driver.
    pub(crate) async fn run_unit(&self, spec: &UnitSpec) -> Result<String, HaError> {
        let internal_id = self
            .bounded(self.driver.run(spec), HaError::Driver)
            .await?;
        incr(&self.statistics.num_deployments_started);
        Ok(internal_id)
    }

    /// Stops a unit via the local driver.
    pub(crate) async fn stop_unit(&self, internal_id: &str) -> Result<(), HaError> {
        self.bounded(self.driver.stop(internal_id), HaError::Driver)
            .await?;
        incr(&self.statistics.num_deployments_stopped);
        Ok(())
    }

    pub(crate) async fn read_ledger(&self) -> Result<LedgerSnapshot, HaError> {
        self.bounded(self.ledger.read_all(), HaError::Ledger).await
    }

    pub(crate) async fn delete_entry(&self, node_id: &str) -> Result<(), HaError> {
        self.bounded(self.ledger.delete(node_id), HaError::Ledger)
            .await
    }

    /// Writes the latest version of the node's record to the ledger.
    ///
    /// Publishes are serialised so an older record can never overwrite a
    /// newer one. On failure the record is left marked as dirty and the
    /// reconciliation cycle retries it.
    pub(crate) async fn publish(&self) -> Result<(), HaError> {
        let _guard = self.publish_lock.lock().await;

        let (record, version) = {
            let state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            (state.record.clone(), state.version)
        };

        let res = self
            .bounded(
                self.ledger.write(&self.config.node_id, &record),
                HaError::Ledger,
            )
            .await;

        let mut state = self.state.lock();
        match res {
            Ok(()) => {
                if state.version == version {
                    state.dirty = false;
                }
                trace!(node_id = %self.config.node_id, version = version, "Published node record.");
                Ok(())
            },
            Err(e) => {
                state.dirty = true;
                incr(&self.statistics.num_publish_failures);
                Err(e)
            },
        }
    }

    /// Publishes the record, logging rather than returning any failure.
    pub(crate) async fn publish_or_defer(&self) {
        if let Err(e) = self.publish().await {
            warn!(
                node_id = %self.config.node_id,
                error = ?e,
                "Failed to publish node record, it will be retried next tick."
            );
        }
    }

    /// Marks the node as having left cleanly and removes its ledger entry.
    ///
    /// Waits for any in-progress publish so it cannot resurrect the entry.
    pub(crate) async fn close(&self) -> Result<(), HaError> {
        self.state.lock().closed = true;
        let _guard = self.publish_lock.lock().await;
        self.delete_entry(&self.config.node_id).await
    }

    async fn bounded<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
        wrap: fn(anyhow::Error) -> HaError,
    ) -> Result<T, HaError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match timeout(self.config.operation_timeout, fut).await {
            Ok(res) => res.map_err(|e| wrap(anyhow::Error::new(e))),
            Err(_) => Err(wrap(anyhow::Error::new(OperationTimeout(
                self.config.operation_timeout,
            )))),
        }
    }
}

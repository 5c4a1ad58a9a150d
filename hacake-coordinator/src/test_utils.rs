use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hacake_ledger::test_utils::MemLedger;
use hacake_ledger::{DeploymentKind, UnitSpec};
use hacake_membership::LocalMembership;
use parking_lot::Mutex;

use crate::{DeploymentDriver, HaConfig, HaError, HaManager};

/// A manager running entirely on in-memory collaborators.
pub type MemHaManager = HaManager<LocalMembership, MemLedger, MemDriver>;

#[derive(Debug, thiserror::Error)]
pub enum MemDriverError {
    #[error("Failed to run unit {0:?}.")]
    RunFailed(String),

    #[error("Failed to stop unit {0:?}.")]
    StopFailed(String),

    #[error("Unit {0:?} is not running.")]
    NotRunning(String),
}

#[derive(Clone, Default)]
/// A deployment driver which only keeps track of what it was asked to run.
///
/// Internal ids are issued as `{unit_name}-{n}` where `n` increases with
/// every run, so a redeployed unit always gets a fresh id.
pub struct MemDriver {
    inner: Arc<MemDriverInner>,
}

#[derive(Default)]
struct MemDriverInner {
    next_id: AtomicUsize,
    running: Mutex<BTreeMap<String, UnitSpec>>,
    runs: Mutex<Vec<UnitSpec>>,
    stops: Mutex<Vec<String>>,
    fail_runs: AtomicBool,
    fail_stops: AtomicBool,
    run_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    no_failover: Mutex<Vec<DeploymentKind>>,
}

impl MemDriver {
    /// Makes every subsequent run fail.
    pub fn set_fail_runs(&self, fail: bool) {
        self.inner.fail_runs.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent stop fail.
    pub fn set_fail_stops(&self, fail: bool) {
        self.inner.fail_stops.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent run take at least `delay` to complete.
    pub fn set_run_delay(&self, delay: Option<Duration>) {
        *self.inner.run_delay.lock() = delay;
    }

    /// Makes every subsequent stop take at least `delay` to complete.
    pub fn set_stop_delay(&self, delay: Option<Duration>) {
        *self.inner.stop_delay.lock() = delay;
    }

    /// Refuses to fail over units of the given kind.
    pub fn disable_failover(&self, kind: DeploymentKind) {
        self.inner.no_failover.lock().push(kind);
    }

    /// Every spec the driver has been asked to run, including failed runs.
    pub fn runs(&self) -> Vec<UnitSpec> {
        self.inner.runs.lock().clone()
    }

    pub fn num_runs(&self) -> usize {
        self.inner.runs.lock().len()
    }

    /// Every internal id the driver has been asked to stop.
    pub fn stops(&self) -> Vec<String> {
        self.inner.stops.lock().clone()
    }

    /// The internal ids of every running unit.
    pub fn running(&self) -> Vec<String> {
        self.inner.running.lock().keys().cloned().collect()
    }

    pub fn is_running(&self, internal_id: &str) -> bool {
        self.inner.running.lock().contains_key(internal_id)
    }

    /// The number of running units with the given unit name.
    pub fn num_running_units(&self, unit_name: &str) -> usize {
        self.inner
            .running
            .lock()
            .values()
            .filter(|spec| spec.unit_name == unit_name)
            .count()
    }
}

#[async_trait]
impl DeploymentDriver for MemDriver {
    type Error = MemDriverError;

    async fn run(&self, spec: &UnitSpec) -> Result<String, Self::Error> {
        self.inner.runs.lock().push(spec.clone());

        let delay = *self.inner.run_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_runs.load(Ordering::Relaxed) {
            return Err(MemDriverError::RunFailed(spec.unit_name.clone()));
        }

        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let internal_id = format!("{}-{}", spec.unit_name, n);
        self.inner
            .running
            .lock()
            .insert(internal_id.clone(), spec.clone());

        Ok(internal_id)
    }

    async fn stop(&self, internal_id: &str) -> Result<(), Self::Error> {
        self.inner.stops.lock().push(internal_id.to_string());

        let delay = *self.inner.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_stops.load(Ordering::Relaxed) {
            return Err(MemDriverError::StopFailed(internal_id.to_string()));
        }

        self.inner
            .running
            .lock()
            .remove(internal_id)
            .map(|_| ())
            .ok_or_else(|| MemDriverError::NotRunning(internal_id.to_string()))
    }

    fn supports_failover(&self, kind: DeploymentKind) -> bool {
        !self.inner.no_failover.lock().contains(&kind)
    }
}

#[derive(Clone)]
/// An in-process cluster sharing a single membership registry and ledger.
pub struct MemCluster {
    pub membership: LocalMembership,
    pub ledger: MemLedger,
    group: String,
    quorum_size: usize,
}

impl MemCluster {
    /// Creates an empty cluster whose nodes all belong to `group`.
    pub fn new(group: impl Into<String>, quorum_size: usize) -> Self {
        Self {
            membership: LocalMembership::default(),
            ledger: MemLedger::default(),
            group: group.into(),
            quorum_size,
        }
    }

    /// The config a node of this cluster is started with.
    pub fn config(&self, node_id: &str) -> HaConfig {
        HaConfig::new(node_id)
            .with_group(&self.group)
            .with_quorum_size(self.quorum_size)
    }

    /// Marks the node as live and starts its manager with a fresh driver.
    pub async fn start_node(&self, node_id: &str) -> Result<(MemHaManager, MemDriver), HaError> {
        self.start_node_with_config(self.config(node_id)).await
    }

    /// Marks the node as live and starts its manager with the given config.
    pub async fn start_node_with_config(
        &self,
        config: HaConfig,
    ) -> Result<(MemHaManager, MemDriver), HaError> {
        let driver = MemDriver::default();
        self.membership.join(config.node_id.clone());
        let manager = HaManager::start(
            config,
            self.membership.clone(),
            self.ledger.clone(),
            driver.clone(),
        )
        .await?;
        Ok((manager, driver))
    }

    /// Simulates a node crashing, its ledger entry is left behind.
    pub fn crash_node(&self, manager: MemHaManager) {
        let node_id = manager.node_id().to_string();
        drop(manager);
        self.membership.leave(&node_id);
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hacake_coordinator::test_utils::{MemCluster, MemDriver, MemHaManager};
use hacake_coordinator::{choose_claimant, FailoverEvent, HaConfig, HaManager, PendingTask};
use hacake_ledger::test_utils::{MemLedger, MemLedgerError};
use hacake_ledger::{DeploymentKind, Ledger, LedgerSnapshot, NodeRecord, UnitSpec};
use hacake_membership::{LocalMembership, MembershipChange};
use test_helper::{wait_until, wait_until_async};

const WAIT: Duration = Duration::from_secs(3);

fn expected_claimant(candidates: &[&str], departed: &str) -> String {
    let candidates = candidates
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>();
    choose_claimant(&candidates, departed)
        .cloned()
        .expect("Candidates should not be empty.")
}

async fn wait_for_owner(node: &MemHaManager, external_id: &str, expected: &str) -> bool {
    wait_until_async(WAIT, move || async move {
        matches!(node.owner_of(external_id).await, Ok(Some(owner)) if owner == expected)
    })
    .await
}

fn total_running(drivers: &[&MemDriver], unit_name: &str) -> usize {
    drivers
        .iter()
        .map(|driver| driver.num_running_units(unit_name))
        .sum()
}

#[tokio::test]
async fn test_failover_to_deterministic_claimant() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = MemCluster::new("g", 2);
    let (node_a, driver_a) = cluster.start_node("node-a").await?;
    let (node_b, driver_b) = cluster.start_node("node-b").await?;
    let (node_c, driver_c) = cluster.start_node("node-c").await?;

    let all_attained = wait_until(WAIT, || {
        node_a.attained_quorum() && node_b.attained_quorum() && node_c.attained_quorum()
    })
    .await;
    assert!(all_attained);

    let spec = UnitSpec::verticle("x").with_config_entry("zone", "eu");
    node_b.deploy_as("X", spec.clone(), true).await?;
    node_b.deploy_as("Z", UnitSpec::verticle("z"), false).await?;
    assert_eq!(driver_b.num_running_units("x"), 1);

    let claimant = expected_claimant(&["node-a", "node-c"], "node-b");
    let (claimant_node, claimant_driver, other_driver) = if claimant == "node-a" {
        (&node_a, &driver_a, &driver_c)
    } else {
        (&node_c, &driver_c, &driver_a)
    };
    let mut events = claimant_node.failover_events();

    cluster.crash_node(node_b);

    let claimed = wait_for_owner(&node_a, "X", &claimant).await;
    assert!(claimed, "The claimant should own the deployment.");

    let removed = wait_until(WAIT, || cluster.ledger.raw_entry("node-b").is_none()).await;
    assert!(removed, "The departed node's entry should be removed.");

    assert_eq!(claimant_driver.num_running_units("x"), 1);
    assert_eq!(other_driver.num_running_units("x"), 0);
    assert_eq!(claimant_driver.runs().len(), 1);
    assert_eq!(other_driver.runs().len(), 0);

    let info = node_c
        .deployment_info("X")
        .await?
        .expect("Deployment should be in the ledger.");
    assert_eq!(info.spec, spec);
    assert!(info.ha);

    // Non-HA deployments are not migrated.
    assert_eq!(node_a.owner_of("Z").await?, None);
    assert_eq!(total_running(&[&driver_a, &driver_c], "z"), 0);

    let event = events.recv().await?;
    assert_eq!(
        event,
        FailoverEvent {
            departed: "node-b".to_string(),
            succeeded: true,
        }
    );
    assert_eq!(claimant_node.statistics().num_units_claimed(), 1);

    // Duplicate notifications are no-ops.
    cluster.membership.notify(MembershipChange::left("node-b"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(total_running(&[&driver_a, &driver_c], "x"), 1);
    assert_eq!(claimant_driver.runs().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_failover_waits_for_quorum() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = MemCluster::new("g", 3);
    let (node_a, driver_a) = cluster.start_node("node-a").await?;
    let (node_b, _driver_b) = cluster.start_node("node-b").await?;
    let (node_c, driver_c) = cluster.start_node("node-c").await?;
    assert!(wait_until(WAIT, || node_a.attained_quorum() && node_c.attained_quorum()).await);

    node_b.deploy_as("X", UnitSpec::verticle("x"), true).await?;

    cluster.crash_node(node_b);
    assert!(wait_until(WAIT, || !node_a.attained_quorum() && !node_c.attained_quorum()).await);

    let scheduled = wait_until(WAIT, || {
        node_a
            .pending_tasks()
            .iter()
            .any(|task| matches!(task, PendingTask::Failover(t) if t.departed == "node-b"))
    })
    .await;
    assert!(scheduled, "Failover should be queued while quorum is absent.");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(total_running(&[&driver_a, &driver_c], "x"), 0);
    assert!(cluster.ledger.raw_entry("node-b").is_some());
    assert!(
        node_a.is_deployed("X").await?,
        "HA deployments of absent owners are still considered deployed."
    );

    let (node_d, driver_d) = cluster.start_node("node-d").await?;
    let claimant = expected_claimant(&["node-a", "node-c", "node-d"], "node-b");

    let claimed = wait_for_owner(&node_d, "X", &claimant).await;
    assert!(claimed, "The claimant should own the deployment once quorum is regained.");
    assert!(wait_until(WAIT, || cluster.ledger.raw_entry("node-b").is_none()).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(total_running(&[&driver_a, &driver_c, &driver_d], "x"), 1);
    assert!(node_a.pending_tasks().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_unsupported_kind_is_skipped() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = MemCluster::new("g", 1);
    let (node_a, driver_a) = cluster.start_node("node-a").await?;
    let (node_b, _driver_b) = cluster.start_node("node-b").await?;
    driver_a.disable_failover(DeploymentKind::Module);

    node_b
        .deploy_as("M", UnitSpec::module("io.example~m~1.0"), true)
        .await?;
    node_b.deploy_as("V", UnitSpec::verticle("v"), true).await?;

    let mut events = node_a.failover_events();
    cluster.crash_node(node_b);

    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(
        event,
        FailoverEvent {
            departed: "node-b".to_string(),
            succeeded: false,
        }
    );

    assert_eq!(node_a.owner_of("V").await?, Some("node-a".to_string()));
    assert_eq!(node_a.owner_of("M").await?, None);
    assert_eq!(driver_a.num_running_units("v"), 1);
    assert_eq!(driver_a.num_running_units("io.example~m~1.0"), 0);
    assert!(cluster.ledger.raw_entry("node-b").is_none());

    Ok(())
}

#[tokio::test]
async fn test_failed_redeploy_does_not_stop_others() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = MemCluster::new("g", 1);
    let (node_a, driver_a) = cluster.start_node("node-a").await?;
    let (node_b, _driver_b) = cluster.start_node("node-b").await?;

    node_b.deploy_as("X", UnitSpec::verticle("x"), true).await?;
    node_b.deploy_as("Y", UnitSpec::verticle("y"), true).await?;

    let mut events = node_a.failover_events();
    driver_a.set_fail_runs(true);
    cluster.crash_node(node_b);

    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert!(!event.succeeded);
    assert_eq!(driver_a.runs().len(), 2, "Every HA deployment should be attempted.");
    assert!(cluster.ledger.raw_entry("node-b").is_none());

    Ok(())
}

#[tokio::test]
async fn test_rejoined_node_is_not_failed_over() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cluster = MemCluster::new("g", 1);
    let (node_a, driver_a) = cluster.start_node("node-a").await?;
    let (node_b, driver_b) = cluster.start_node("node-b").await?;
    node_b.deploy_as("X", UnitSpec::verticle("x"), true).await?;

    // The departure is reported but the node is still live.
    cluster.membership.notify(MembershipChange::left("node-b"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(driver_a.num_runs(), 0);
    assert_eq!(driver_b.num_running_units("x"), 1);
    assert_eq!(node_a.owner_of("X").await?, Some("node-b".to_string()));
    assert!(node_a.pending_tasks().is_empty());

    Ok(())
}

#[derive(Clone, Default)]
/// A shared ledger whose reads and deletes can be rejected on demand.
struct FlakyLedger {
    inner: MemLedger,
    reject_reads: Arc<AtomicBool>,
    /// Reads which still succeed while reads are rejected.
    read_allowance: Arc<AtomicUsize>,
    reject_deletes: Arc<AtomicBool>,
}

impl FlakyLedger {
    fn read_rejected(&self) -> bool {
        if !self.reject_reads.load(Ordering::SeqCst) {
            return false;
        }

        self.read_allowance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    type Error = MemLedgerError;

    async fn write(&self, node_id: &str, record: &NodeRecord) -> Result<(), Self::Error> {
        self.inner.write(node_id, record).await
    }

    async fn read_all(&self) -> Result<LedgerSnapshot, Self::Error> {
        if self.read_rejected() {
            return Err(MemLedgerError::Unavailable);
        }
        self.inner.read_all().await
    }

    async fn delete(&self, node_id: &str) -> Result<(), Self::Error> {
        if self.reject_deletes.load(Ordering::SeqCst) {
            return Err(MemLedgerError::Unavailable);
        }
        self.inner.delete(node_id).await
    }
}

type FlakyHaManager = HaManager<LocalMembership, FlakyLedger, MemDriver>;

/// Starts `node-a` on the plain ledger and `node-b`, the only possible
/// claimant, on the flaky view of the same ledger.
async fn start_flaky_pair(
    ledger: &FlakyLedger,
) -> anyhow::Result<(LocalMembership, MemHaManager, FlakyHaManager, MemDriver)> {
    let membership = LocalMembership::with_members(["node-a", "node-b"]);
    let config = |node_id: &str| HaConfig::new(node_id).with_group("g").with_quorum_size(1);

    let node_a = HaManager::start(
        config("node-a"),
        membership.clone(),
        ledger.inner.clone(),
        MemDriver::default(),
    )
    .await?;

    let driver_b = MemDriver::default();
    let node_b = HaManager::start(
        config("node-b"),
        membership.clone(),
        ledger.clone(),
        driver_b.clone(),
    )
    .await?;

    Ok((membership, node_a, node_b, driver_b))
}

fn has_replay_for(node: &FlakyHaManager, departed: &str) -> bool {
    node.pending_tasks()
        .iter()
        .any(|task| matches!(task, PendingTask::Failover(t) if t.departed == departed))
}

#[tokio::test]
async fn test_departure_retried_when_ledger_unreadable() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let ledger = FlakyLedger::default();
    let (membership, node_a, node_b, driver_b) = start_flaky_pair(&ledger).await?;
    node_a.deploy_as("X", UnitSpec::verticle("x"), true).await?;
    let mut events = node_b.failover_events();

    ledger.reject_reads.store(true, Ordering::SeqCst);
    drop(node_a);
    membership.leave("node-a");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(driver_b.num_runs(), 0);
    assert!(ledger.inner.raw_entry("node-a").is_some());

    ledger.reject_reads.store(false, Ordering::SeqCst);
    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(
        event,
        FailoverEvent {
            departed: "node-a".to_string(),
            succeeded: true,
        }
    );
    assert!(ledger.inner.raw_entry("node-a").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver_b.num_runs(), 1);
    assert_eq!(driver_b.num_running_units("x"), 1);
    assert!(node_b.pending_tasks().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_replay_requeued_when_snapshot_unreadable() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let ledger = FlakyLedger::default();
    let (membership, node_a, node_b, driver_b) = start_flaky_pair(&ledger).await?;
    node_a.deploy_as("X", UnitSpec::verticle("x"), true).await?;
    let mut events = node_b.failover_events();

    // Scheduling the departure reads fine, running the replay does not.
    ledger.read_allowance.store(1, Ordering::SeqCst);
    ledger.reject_reads.store(true, Ordering::SeqCst);
    drop(node_a);
    membership.leave("node-a");

    let queued = wait_until(WAIT, || has_replay_for(&node_b, "node-a")).await;
    assert!(queued, "Replay should be queued.");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(has_replay_for(&node_b, "node-a"), "Replay should stay queued.");
    assert_eq!(driver_b.num_runs(), 0);
    assert!(ledger.inner.raw_entry("node-a").is_some());

    ledger.reject_reads.store(false, Ordering::SeqCst);
    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert!(event.succeeded);
    assert!(ledger.inner.raw_entry("node-a").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver_b.num_runs(), 1);
    assert!(node_b.pending_tasks().is_empty());
    assert_eq!(node_b.owner_of("X").await?, Some("node-b".to_string()));

    Ok(())
}

#[tokio::test]
async fn test_failed_delete_is_retried_without_redeploying() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let ledger = FlakyLedger::default();
    let (membership, node_a, node_b, driver_b) = start_flaky_pair(&ledger).await?;
    node_a.deploy_as("X", UnitSpec::verticle("x"), true).await?;
    let mut events = node_b.failover_events();

    ledger.reject_deletes.store(true, Ordering::SeqCst);
    drop(node_a);
    membership.leave("node-a");

    let claimed = wait_until(WAIT, || driver_b.num_running_units("x") == 1).await;
    assert!(claimed, "The claimant should redeploy before removing the entry.");

    let deletion_queued = wait_until(WAIT, || {
        node_b.pending_tasks().iter().any(|task| {
            matches!(
                task,
                PendingTask::Failover(t) if t.departed == "node-a" && t.record.deployments.is_empty()
            )
        })
    })
    .await;
    assert!(deletion_queued, "Only the entry removal should be retried.");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ledger.inner.raw_entry("node-a").is_some());
    assert_eq!(driver_b.num_runs(), 1);
    assert!(events.try_recv().is_err(), "Failover is not complete yet.");

    ledger.reject_deletes.store(false, Ordering::SeqCst);
    let event = tokio::time::timeout(WAIT, events.recv()).await??;
    assert_eq!(event.departed, "node-a");
    assert!(ledger.inner.raw_entry("node-a").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver_b.num_runs(), 1);
    assert_eq!(driver_b.num_running_units("x"), 1);
    assert!(node_b.pending_tasks().is_empty());
    assert!(events.try_recv().is_err(), "Failover should complete exactly once.");

    Ok(())
}

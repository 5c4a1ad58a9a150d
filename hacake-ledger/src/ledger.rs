use std::collections::BTreeMap;
use std::ops::Deref;

use async_trait::async_trait;
use hacake_membership::NodeId;

use crate::record::{DeploymentRecord, NodeRecord};

#[async_trait]
/// The replicated mapping of node id to the node's published [NodeRecord].
///
/// The ledger provides no transactions. Every node only ever writes its own
/// entry and always writes it in full, reads are snapshots which may be
/// stale relative to concurrent writers on other nodes.
pub trait Ledger: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Replaces the entry for `node_id` with the given record.
    async fn write(&self, node_id: &str, record: &NodeRecord) -> Result<(), Self::Error>;

    /// Retrieves a snapshot of every entry currently in the ledger.
    async fn read_all(&self) -> Result<LedgerSnapshot, Self::Error>;

    /// Removes the entry for `node_id`.
    ///
    /// Removing an entry which does not exist should be a no-op.
    async fn delete(&self, node_id: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A point in time copy of the ledger.
///
/// Entries iterate in node id order, giving every node the same
/// canonical view of an identical snapshot.
pub struct LedgerSnapshot(BTreeMap<NodeId, NodeRecord>);

impl LedgerSnapshot {
    /// Finds a deployment anywhere in the ledger, returning the owning record.
    pub fn find(&self, external_id: &str) -> Option<(&NodeRecord, &DeploymentRecord)> {
        self.0
            .values()
            .find_map(|record| record.find(external_id).map(|dep| (record, dep)))
    }

    /// Returns if a deployment with the given id exists in any entry.
    pub fn contains_deployment(&self, external_id: &str) -> bool {
        self.find(external_id).is_some()
    }

    /// The ids of every node whose record belongs to `group`, in node id order.
    pub fn group_members<'a>(
        &'a self,
        group: &'a str,
    ) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.0
            .iter()
            .filter(move |(_, record)| record.group == group)
            .map(|(node_id, _)| node_id)
    }

    pub fn into_inner(self) -> BTreeMap<NodeId, NodeRecord> {
        self.0
    }
}

impl Deref for LedgerSnapshot {
    type Target = BTreeMap<NodeId, NodeRecord>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<BTreeMap<NodeId, NodeRecord>> for LedgerSnapshot {
    fn from(entries: BTreeMap<NodeId, NodeRecord>) -> Self {
        Self(entries)
    }
}

impl FromIterator<NodeRecord> for LedgerSnapshot {
    fn from_iter<T: IntoIterator<Item = NodeRecord>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|record| (record.node_id.clone(), record))
                .collect(),
        )
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use crate::{CodecError, Ledger, LedgerSnapshot, NodeId, NodeRecord};

#[derive(Debug, thiserror::Error)]
pub enum MemLedgerError {
    #[error("The ledger is currently unavailable.")]
    Unavailable,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Clone, Default)]
/// An in-memory ledger shared between every clone.
///
/// Entries are stored encoded, exactly as a key-value substrate would hold
/// them, and every write is immediately visible to all clones. Handing a
/// clone to each node of an in-process cluster behaves like a perfectly
/// replicated ledger.
pub struct MemLedger {
    inner: Arc<MemLedgerInner>,
}

#[derive(Default)]
struct MemLedgerInner {
    entries: RwLock<BTreeMap<NodeId, Vec<u8>>>,
    unavailable: AtomicBool,
    num_writes: AtomicUsize,
    num_deletes: AtomicUsize,
}

impl MemLedger {
    /// Makes every subsequent operation fail until set back to `true`.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Relaxed);
    }

    /// The number of successful writes.
    pub fn num_writes(&self) -> usize {
        self.inner.num_writes.load(Ordering::Relaxed)
    }

    /// The number of successful deletes.
    pub fn num_deletes(&self) -> usize {
        self.inner.num_deletes.load(Ordering::Relaxed)
    }

    /// The encoded entry for a given node, if it exists.
    pub fn raw_entry(&self, node_id: &str) -> Option<Vec<u8>> {
        self.inner.entries.read().get(node_id).cloned()
    }

    /// Inserts an encoded entry as-is.
    pub fn insert_raw(&self, node_id: impl Into<NodeId>, bytes: Vec<u8>) {
        self.inner.entries.write().insert(node_id.into(), bytes);
    }

    /// Decodes the entry for a given node.
    pub fn entry(&self, node_id: &str) -> Result<Option<NodeRecord>, MemLedgerError> {
        self.raw_entry(node_id)
            .map(|bytes| NodeRecord::from_bytes(&bytes))
            .transpose()
            .map_err(MemLedgerError::from)
    }

    fn check_available(&self) -> Result<(), MemLedgerError> {
        if self.inner.unavailable.load(Ordering::Relaxed) {
            Err(MemLedgerError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for MemLedger {
    type Error = MemLedgerError;

    async fn write(&self, node_id: &str, record: &NodeRecord) -> Result<(), Self::Error> {
        self.check_available()?;

        let bytes = record.to_bytes()?;
        self.inner
            .entries
            .write()
            .insert(node_id.to_string(), bytes);
        self.inner.num_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_all(&self) -> Result<LedgerSnapshot, Self::Error> {
        self.check_available()?;

        let lock = self.inner.entries.read();
        let mut entries = BTreeMap::new();
        for (node_id, bytes) in lock.iter() {
            let record = NodeRecord::from_bytes(bytes)?;
            entries.insert(node_id.clone(), record);
        }

        Ok(LedgerSnapshot::from(entries))
    }

    async fn delete(&self, node_id: &str) -> Result<(), Self::Error> {
        self.check_available()?;

        if self.inner.entries.write().remove(node_id).is_some() {
            self.inner.num_deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// A wrapping type around another `Ledger` implementation that
/// logs all the activity going into and out of the ledger.
pub struct InstrumentedLedger<L: Ledger>(pub L);

impl<L: Ledger + Clone> Clone for InstrumentedLedger<L> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[async_trait]
impl<L: Ledger> Ledger for InstrumentedLedger<L> {
    type Error = L::Error;

    async fn write(&self, node_id: &str, record: &NodeRecord) -> Result<(), Self::Error> {
        info!(node_id = node_id, record = ?record, "write");
        self.0.write(node_id, record).await
    }

    async fn read_all(&self) -> Result<LedgerSnapshot, Self::Error> {
        let res = self.0.read_all().await;
        if let Ok(snapshot) = res.as_ref() {
            info!(num_entries = snapshot.len(), "read_all");
        }
        res
    }

    async fn delete(&self, node_id: &str) -> Result<(), Self::Error> {
        info!(node_id = node_id, "delete");
        self.0.delete(node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeploymentRecord, UnitSpec};

    #[tokio::test]
    async fn test_mem_ledger_full_replace() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let ledger = InstrumentedLedger(MemLedger::default());
        let replica = ledger.0.clone();

        let mut record = NodeRecord::new("node-1", "group-a");
        record.push(DeploymentRecord::new(
            "dep-1",
            UnitSpec::verticle("main"),
            true,
            "internal-1",
        ));
        ledger.write("node-1", &record).await?;

        let snapshot = replica.read_all().await?;
        assert_eq!(snapshot.get("node-1"), Some(&record));

        // Writes replace rather than merge.
        let empty = NodeRecord::new("node-1", "group-a");
        ledger.write("node-1", &empty).await?;
        let snapshot = replica.read_all().await?;
        assert_eq!(snapshot.get("node-1"), Some(&empty));
        assert_eq!(replica.num_writes(), 2);

        ledger.delete("node-1").await?;
        ledger.delete("node-1").await?;
        assert!(replica.read_all().await?.is_empty());
        assert_eq!(replica.num_deletes(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_mem_ledger_unavailable() -> anyhow::Result<()> {
        let ledger = MemLedger::default();
        ledger.set_available(false);

        let record = NodeRecord::new("node-1", "group-a");
        let res = ledger.write("node-1", &record).await;
        assert!(matches!(res, Err(MemLedgerError::Unavailable)));
        assert!(ledger.read_all().await.is_err());

        ledger.set_available(true);
        ledger.write("node-1", &record).await?;
        assert_eq!(ledger.entry("node-1")?, Some(record));

        Ok(())
    }

    #[tokio::test]
    async fn test_mem_ledger_corrupted_entry() {
        let ledger = MemLedger::default();
        ledger.insert_raw("node-1", vec![1, 2, 3]);

        let res = ledger.read_all().await;
        assert!(matches!(res, Err(MemLedgerError::Codec(_))));
    }
}

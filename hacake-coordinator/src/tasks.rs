use hacake_ledger::{aligned_copy, CodecError, NodeRecord, UnitSpec};
use hacake_membership::NodeId;
use rkyv::{Archive, Deserialize, Serialize};

const SCRATCH_SPACE: usize = 1024;

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// An HA deploy waiting for quorum.
pub struct DeployTask {
    pub external_id: String,
    pub spec: UnitSpec,
}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// A replay of a departed node's record.
pub struct FailoverTask {
    /// The node whose record is being failed over.
    pub departed: NodeId,
    /// The departed node's record as observed when the replay was scheduled.
    pub record: NodeRecord,
}

impl FailoverTask {
    /// A replay which only removes the departed node's ledger entry.
    pub(crate) fn deletion_only(&self) -> Self {
        Self {
            departed: self.departed.clone(),
            record: NodeRecord::new(self.departed.clone(), self.record.group.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Archive, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
/// Work deferred until quorum is attained.
///
/// Each task is consumed exactly once, in the order it was queued.
pub enum PendingTask {
    Deploy(DeployTask),
    Failover(FailoverTask),
}

impl PendingTask {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        rkyv::to_bytes::<_, SCRATCH_SPACE>(self)
            .map(|buf| buf.to_vec())
            .map_err(|_| CodecError::Serialize)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let aligned = aligned_copy(bytes);
        rkyv::from_bytes::<Self>(&aligned)
            .map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

impl From<DeployTask> for PendingTask {
    fn from(task: DeployTask) -> Self {
        Self::Deploy(task)
    }
}

impl From<FailoverTask> for PendingTask {
    fn from(task: FailoverTask) -> Self {
        Self::Failover(task)
    }
}

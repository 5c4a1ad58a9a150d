//! # hacake ledger
//! The replicated deployment ledger shared by every HA node.
//!
//! Each node publishes a single [NodeRecord] describing its HA group and the
//! deployments it currently owns. The records are replicated by the clustering
//! substrate behind the [Ledger] trait, this crate only defines the record
//! types, their encoding and the access contract.

mod ledger;
mod record;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use hacake_membership::NodeId;
pub use ledger::{Ledger, LedgerSnapshot};
pub use record::{
    aligned_copy,
    CodecError,
    DeploymentKind,
    DeploymentRecord,
    InvalidSpec,
    NodeRecord,
    UnitConfig,
    UnitSpec,
};

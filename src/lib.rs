//! # hacake
//! Quorum gated deployment coordination and failover for peer-to-peer clusters.
//!
//! This is a convenience package which includes all of the sub-projects within
//! hacake, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `hacake_membership` - The membership view contract and an in-process membership registry.
//! - `hacake_ledger` - The replicated per-node deployment ledger and its record types.
//! - `hacake_coordinator` - The quorum evaluator, failover coordinator and deployment API.

#[cfg(feature = "hacake-coordinator")]
pub use hacake_coordinator as coordinator;
#[cfg(feature = "hacake-ledger")]
pub use hacake_ledger as ledger;
#[cfg(feature = "hacake-membership")]
pub use hacake_membership as membership;

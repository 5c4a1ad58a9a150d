//! # hacake membership
//! The read-only view of cluster membership consumed by the HA coordinator.
//!
//! Membership detection itself is not performed here, a gossip layer or any
//! other clustering substrate decides who is alive. This crate defines the
//! contract the coordinator relies on ([MembershipView]) and ships
//! [LocalMembership], an in-process registry which the embedding application
//! drives by reporting joins and departures.

mod local;

use std::collections::BTreeSet;

pub use local::LocalMembership;

/// A stable, cluster-wide unique identifier of a node.
pub type NodeId = String;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// A batch of membership transitions observed by the substrate.
pub struct MembershipChange {
    pub joined: Vec<NodeId>,
    pub left: Vec<NodeId>,
}

impl MembershipChange {
    /// A change containing a single joined node.
    pub fn joined(node_id: impl Into<NodeId>) -> Self {
        Self {
            joined: vec![node_id.into()],
            left: Vec::new(),
        }
    }

    /// A change containing a single departed node.
    pub fn left(node_id: impl Into<NodeId>) -> Self {
        Self {
            joined: Vec::new(),
            left: vec![node_id.into()],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Access to the set of currently live nodes and their join/leave events.
///
/// Notifications are delivered at-least-once per transition, subscribers must
/// tolerate duplicated and concurrent events.
pub trait MembershipView: Send + Sync + 'static {
    /// The ids of every node currently believed to be alive, including
    /// the local node.
    fn live_nodes(&self) -> BTreeSet<NodeId>;

    /// Registers a new subscriber for membership changes.
    ///
    /// Each subscriber receives every change published after it subscribed.
    fn subscribe(&self) -> flume::Receiver<MembershipChange>;

    #[inline]
    /// Returns if the given node is currently live.
    fn is_live(&self, node_id: &str) -> bool {
        self.live_nodes().contains(node_id)
    }
}

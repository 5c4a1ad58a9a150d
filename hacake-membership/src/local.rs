use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{MembershipChange, MembershipView, NodeId};

#[derive(Clone, Default)]
/// An in-process membership registry.
///
/// The registry is driven externally, the embedding application reports
/// joins and departures (for example from its own gossip layer) and every
/// subscriber is notified of the transition.
///
/// This handle is cheap to clone, clones share the same registry.
pub struct LocalMembership {
    inner: Arc<LocalMembershipInner>,
}

#[derive(Default)]
struct LocalMembershipInner {
    members: RwLock<BTreeSet<NodeId>>,
    subscribers: Mutex<Vec<flume::Sender<MembershipChange>>>,
}

impl LocalMembership {
    /// Creates a new registry with an initial set of live members.
    ///
    /// No notifications are produced for the initial members.
    pub fn with_members(members: impl IntoIterator<Item = impl Into<NodeId>>) -> Self {
        let slf = Self::default();
        {
            let mut lock = slf.inner.members.write();
            lock.extend(members.into_iter().map(|id| id.into()));
        }
        slf
    }

    /// Marks a node as live.
    ///
    /// Returns `false` if the node was already live, in which case no
    /// notification is sent.
    pub fn join(&self, node_id: impl Into<NodeId>) -> bool {
        let node_id = node_id.into();
        let inserted = self.inner.members.write().insert(node_id.clone());
        if inserted {
            info!(node_id = %node_id, "Node has joined the cluster.");
            self.publish(MembershipChange::joined(node_id));
        }
        inserted
    }

    /// Marks a node as departed.
    ///
    /// Returns `false` if the node was not live, in which case no
    /// notification is sent.
    pub fn leave(&self, node_id: &str) -> bool {
        let removed = self.inner.members.write().remove(node_id);
        if removed {
            info!(node_id = %node_id, "Node is no longer part of cluster.");
            self.publish(MembershipChange::left(node_id));
        }
        removed
    }

    /// Replaces the live member set, notifying subscribers of the difference.
    pub fn set_members(&self, members: impl IntoIterator<Item = impl Into<NodeId>>) {
        let new_set = members
            .into_iter()
            .map(|id| id.into())
            .collect::<BTreeSet<NodeId>>();

        let change = {
            let mut lock = self.inner.members.write();
            let change = MembershipChange {
                joined: new_set.difference(&lock).cloned().collect(),
                left: lock.difference(&new_set).cloned().collect(),
            };
            *lock = new_set;
            change
        };

        if !change.is_empty() {
            info!(
                num_joined = change.joined.len(),
                num_left = change.left.len(),
                "Cluster membership has changed."
            );
            self.publish(change);
        }
    }

    /// Re-sends a notification without changing the live set.
    ///
    /// Substrates are allowed to deliver the same transition more than once,
    /// this lets callers reproduce that behaviour.
    pub fn notify(&self, change: MembershipChange) {
        self.publish(change);
    }

    /// The number of currently live members.
    pub fn num_live_members(&self) -> usize {
        self.inner.members.read().len()
    }

    fn publish(&self, change: MembershipChange) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        debug!(num_subscribers = subscribers.len(), "Published membership change.");
    }
}

impl MembershipView for LocalMembership {
    fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.inner.members.read().clone()
    }

    fn subscribe(&self) -> flume::Receiver<MembershipChange> {
        let (tx, rx) = flume::unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn is_live(&self, node_id: &str) -> bool {
        self.inner.members.read().contains(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_leave_notify_subscribers() {
        let _ = tracing_subscriber::fmt::try_init();

        let membership = LocalMembership::with_members(["node-1"]);
        let rx = membership.subscribe();

        assert!(membership.join("node-2"));
        assert!(!membership.join("node-2"), "Duplicate join should be a no-op.");
        assert!(membership.leave("node-1"));
        assert!(!membership.leave("node-1"), "Duplicate leave should be a no-op.");

        assert_eq!(rx.try_recv().unwrap(), MembershipChange::joined("node-2"));
        assert_eq!(rx.try_recv().unwrap(), MembershipChange::left("node-1"));
        assert!(rx.try_recv().is_err());

        assert_eq!(
            membership.live_nodes(),
            BTreeSet::from_iter(["node-2".to_string()])
        );
        assert!(membership.is_live("node-2"));
        assert!(!membership.is_live("node-1"));
    }

    #[test]
    fn test_set_members_diff() {
        let membership = LocalMembership::with_members(["node-1", "node-2"]);
        let rx = membership.subscribe();

        membership.set_members(["node-2", "node-3"]);

        let change = rx.try_recv().unwrap();
        assert_eq!(change.joined, vec!["node-3".to_string()]);
        assert_eq!(change.left, vec!["node-1".to_string()]);
        assert_eq!(membership.num_live_members(), 2);

        membership.set_members(["node-2", "node-3"]);
        assert!(rx.try_recv().is_err(), "No change should produce no event.");
    }

    #[test]
    fn test_dropped_subscribers_are_removed() {
        let membership = LocalMembership::default();
        let rx = membership.subscribe();
        drop(membership.subscribe());

        membership.join("node-1");
        assert_eq!(membership.inner.subscribers.lock().len(), 1);
        assert_eq!(rx.try_recv().unwrap(), MembershipChange::joined("node-1"));
    }
}

//! Node identity, bounded node lists, and the membership seam.
//!
//! Membership truth (who is in the cluster, who is alive, where they listen)
//! originates outside the fabric. The fabric consumes it through the
//! [`Membership`] trait and layers per-node activity tracking on top via
//! [`NodeDirectory`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;

/// Maximum supported cluster size; bounds every [`NodeList`].
pub const MAX_CLUSTER_SIZE: usize = 256;

/// Stable opaque identifier of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(
    /// Raw identifier value.
    pub u64,
);

impl NodeId {
    /// Raw identifier value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Bounded ordered collection of node identifiers.
///
/// Capacity is fixed at [`MAX_CLUSTER_SIZE`]; a corrupt or oversized source
/// can never make this collection exhaust memory.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: Vec<NodeId>,
}

impl NodeList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Appends a node; returns `false` when the list is at capacity.
    pub fn push(&mut self, node: NodeId) -> bool {
        if self.nodes.len() >= MAX_CLUSTER_SIZE {
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Number of nodes in the list.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the list contains `node`.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// The nodes as a slice, in insertion order.
    pub fn as_slice(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Iterates over the nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }
}

/// External membership source consumed by the fabric.
///
/// Implementations must tolerate being called concurrently and may change
/// their answers between calls; the fabric revalidates per operation.
pub trait Membership: Send + Sync + 'static {
    /// Snapshot of the current cluster members.
    fn nodes(&self) -> NodeList;

    /// Whether `node` is currently considered alive.
    fn is_alive(&self, node: NodeId) -> bool;

    /// Listening endpoint for `node`, if known.
    fn endpoint(&self, node: NodeId) -> Option<SocketAddr>;
}

/// Fixed-table membership for tests and static topologies.
#[derive(Debug, Default)]
pub struct StaticMembership {
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl StaticMembership {
    /// Creates an empty membership table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or updates a member endpoint.
    pub fn add_node(&self, node: NodeId, addr: SocketAddr) {
        self.peers
            .write()
            .expect("membership table lock poisoned")
            .insert(node, addr);
    }

    /// Removes a member.
    pub fn remove_node(&self, node: NodeId) {
        self.peers
            .write()
            .expect("membership table lock poisoned")
            .remove(&node);
    }
}

impl Membership for StaticMembership {
    fn nodes(&self) -> NodeList {
        let peers = self.peers.read().expect("membership table lock poisoned");
        let mut list = NodeList::new();
        let mut ids: Vec<NodeId> = peers.keys().copied().collect();
        ids.sort();
        for id in ids {
            if !list.push(id) {
                break;
            }
        }
        list
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.peers
            .read()
            .expect("membership table lock poisoned")
            .contains_key(&node)
    }

    fn endpoint(&self, node: NodeId) -> Option<SocketAddr> {
        self.peers
            .read()
            .expect("membership table lock poisoned")
            .get(&node)
            .copied()
    }
}

/// Read-only view over the membership source plus per-node activity state.
pub struct NodeDirectory {
    membership: Arc<dyn Membership>,
    last_activity_ms: DashMap<NodeId, u64>,
    epoch: Instant,
}

impl NodeDirectory {
    /// Wraps a membership source.
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self {
            membership,
            last_activity_ms: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Resolves a node to its endpoint; `None` when the node is not a live
    /// member or has no known endpoint.
    pub fn resolve(&self, node: NodeId) -> Option<SocketAddr> {
        if !self.membership.is_alive(node) {
            return None;
        }
        self.membership.endpoint(node)
    }

    /// Current membership snapshot.
    pub fn snapshot(&self) -> NodeList {
        self.membership.nodes()
    }

    /// Records traffic to or from `node` at the current instant.
    ///
    /// The stored timestamp is monotonically non-decreasing per node.
    pub fn touch(&self, node: NodeId) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let mut entry = self.last_activity_ms.entry(node).or_insert(0);
        if now_ms > *entry {
            *entry = now_ms;
        }
    }

    /// Milliseconds since fabric start of the last observed traffic with
    /// `node`; `None` when no traffic has been seen.
    pub fn last_activity_ms(&self, node: NodeId) -> Option<u64> {
        self.last_activity_ms.get(&node).map(|e| *e)
    }
}

impl fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDirectory")
            .field("tracked_nodes", &self.last_activity_ms.len())
            .finish()
    }
}

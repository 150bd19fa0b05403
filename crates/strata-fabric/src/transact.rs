//! Transact: exactly-once-completion request/response bookkeeping.
//!
//! The [`PendingTable`] is the heart of the contract: removal from the table
//! is the single atomic arbiter of a transaction's terminal transition.
//! Whichever of reply arrival, transport failure, or reaper expiry removes
//! the entry runs the completion callback; every other path finds the entry
//! gone and is a no-op. Callbacks are always invoked outside the table lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{FabricError, Result};
use crate::fabric::Fabric;
use crate::node::NodeId;
use crate::pool::PooledMsg;

/// High bit of the field-0 value: set on replies, clear on requests.
/// The low 63 bits carry the transaction id.
pub const TRANSACT_REPLY_BIT: u64 = 1 << 63;

/// Completion callback for one transact request; invoked exactly once with
/// the matched reply or a terminal error (timeout, transport failure).
pub type TransactComplete = Box<dyn FnOnce(Result<PooledMsg>) + Send + 'static>;

/// Responder callback for inbound transact requests.
///
/// Runs on a transport-owned receive worker and is expected to eventually
/// call [`Fabric::transact_reply`] with the context.
pub trait TransactHandler: Send + Sync + 'static {
    /// Called with the decoded request, its source, and a single-use reply
    /// context.
    fn on_request(&self, fabric: &Fabric, from: NodeId, msg: PooledMsg, ctx: TransactContext);
}

impl<F> TransactHandler for F
where
    F: Fn(&Fabric, NodeId, PooledMsg, TransactContext) + Send + Sync + 'static,
{
    fn on_request(&self, fabric: &Fabric, from: NodeId, msg: PooledMsg, ctx: TransactContext) {
        self(fabric, from, msg, ctx)
    }
}

/// Opaque reply state captured from an inbound request; consumed exactly
/// once by [`Fabric::transact_reply`].
#[derive(Debug)]
pub struct TransactContext {
    pub(crate) node: NodeId,
    pub(crate) tid: u64,
}

impl TransactContext {
    /// Node that issued the request.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Transaction id assigned by the requester.
    pub fn tid(&self) -> u64 {
        self.tid
    }
}

struct Pending {
    node: NodeId,
    deadline: Instant,
    timeout_ms: u64,
    complete: TransactComplete,
}

/// In-flight transact requests keyed by transaction id.
pub struct PendingTable {
    entries: Mutex<HashMap<u64, Pending>>,
    next_tid: AtomicU64,
}

impl PendingTable {
    /// Creates an empty table; tids start at 1.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_tid: AtomicU64::new(1),
        }
    }

    /// Records a new pending transaction and returns its fresh tid.
    ///
    /// Tids come from a monotone 63-bit counter, so a live tid can never
    /// collide within a process lifetime and never carries the reply bit.
    pub fn begin(&self, node: NodeId, timeout: Duration, complete: TransactComplete) -> u64 {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed) & !TRANSACT_REPLY_BIT;
        let pending = Pending {
            node,
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            complete,
        };
        self.entries
            .lock()
            .expect("pending table lock poisoned")
            .insert(tid, pending);
        tid
    }

    /// Terminally completes `tid` with `outcome`.
    ///
    /// Returns `false` when the transaction already reached its terminal
    /// state (late or duplicate reply); the outcome is then dropped.
    pub fn complete(&self, tid: u64, outcome: Result<PooledMsg>) -> bool {
        let removed = self
            .entries
            .lock()
            .expect("pending table lock poisoned")
            .remove(&tid);
        match removed {
            Some(pending) => {
                (pending.complete)(outcome);
                true
            }
            None => false,
        }
    }

    /// Expires every transaction whose deadline has passed, completing each
    /// with a timeout error.
    pub fn reap(&self, now: Instant) {
        let expired: Vec<(u64, Pending)> = {
            let mut entries = self.entries.lock().expect("pending table lock poisoned");
            let tids: Vec<u64> = entries
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(tid, _)| *tid)
                .collect();
            tids.into_iter()
                .filter_map(|tid| entries.remove(&tid).map(|p| (tid, p)))
                .collect()
        };
        for (tid, pending) in expired {
            debug!(tid, node = %pending.node, "transact timed out");
            (pending.complete)(Err(FabricError::Timeout {
                tid,
                timeout_ms: pending.timeout_ms,
            }));
        }
    }

    /// Terminally fails every pending transaction; used at fabric teardown
    /// so no completion is ever silently dropped.
    pub fn drain(&self, reason: &str) {
        let drained: Vec<(u64, Pending)> = {
            let mut entries = self.entries.lock().expect("pending table lock poisoned");
            entries.drain().collect()
        };
        for (tid, pending) in drained {
            debug!(tid, "draining pending transaction: {reason}");
            (pending.complete)(Err(FabricError::Unknown(reason.to_string())));
        }
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("pending table lock poisoned")
            .len()
    }

    /// Whether no transactions are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.len())
            .finish()
    }
}

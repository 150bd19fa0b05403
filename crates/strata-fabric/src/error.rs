//! Fabric error taxonomy.

use thiserror::Error;

use crate::msg::MsgType;
use crate::node::NodeId;

/// Errors surfaced by the fabric and transact layers.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The per-peer send queue is saturated; back off and retry or drop.
    #[error("send queue full for node {node}")]
    QueueFull {
        /// Destination whose queue is saturated.
        node: NodeId,
    },

    /// The destination is not a live member of the cluster.
    #[error("unknown node {node}")]
    NoSuchNode {
        /// The unresolvable destination.
        node: NodeId,
    },

    /// The message is malformed at the schema level; it is dropped, the
    /// connection is kept.
    #[error("bad message: {reason}")]
    BadMessage {
        /// What disagreed with the registered template.
        reason: String,
    },

    /// The fabric has not been started; a programming error, fail fast.
    #[error("fabric not started")]
    Uninitialized,

    /// A transact request expired before its reply arrived.
    #[error("transaction {tid} timed out after {timeout_ms}ms")]
    Timeout {
        /// Identifier of the expired transaction.
        tid: u64,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A second registration was attempted for an already-registered type.
    #[error("duplicate registration for message type {0}")]
    DuplicateType(MsgType),

    /// No template is registered for the requested type.
    #[error("no template registered for message type {0}")]
    UnregisteredType(MsgType),

    /// Registration was attempted after the transport started.
    #[error("type registry is sealed after fabric start")]
    RegistrySealed,

    /// Socket-level fault; handled internally by reconnection and surfaced
    /// only as eventual send or transact failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unclassified internal error.
    #[error("{0}")]
    Unknown(String),
}

/// Fabric result alias.
pub type Result<T> = std::result::Result<T, FabricError>;

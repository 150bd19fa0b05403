#![warn(missing_docs)]

//! Strata internode fabric: channel-multiplexed typed messaging between
//! cluster nodes, plus the reliable transact request/response layer.
//!
//! The fabric moves pooled, template-typed messages over four independent
//! traffic-class channels so bulk migration can never head-of-line-block
//! latency-sensitive replica writes. Transact layers exactly-once-completion
//! request/response on top: every request terminates in one completion
//! callback, whether a reply arrived, the transport failed, or the deadline
//! reaper fired first.
//!
//! Cluster membership is consumed through the [`Membership`] seam; the
//! fabric owns framing, connection lifecycle, dispatch, and backpressure.

pub mod channel;
pub mod config;
pub mod error;
pub mod fabric;
pub mod frame;
pub mod metrics;
pub mod msg;
pub mod node;
pub mod pool;
pub mod registry;
pub mod transact;

pub use channel::{FabricChannel, MAX_CHANNEL_RECV_WORKERS, MAX_CHANNEL_SOCKETS};
pub use config::FabricConfig;
pub use error::{FabricError, Result};
pub use fabric::Fabric;
pub use metrics::{FabricMetrics, FabricRate};
pub use msg::{FieldKind, FieldValue, Msg, MsgTemplate, MsgType};
pub use node::{Membership, NodeDirectory, NodeId, NodeList, StaticMembership, MAX_CLUSTER_SIZE};
pub use pool::{MsgPool, PoolDepth, PooledMsg};
pub use registry::{MsgHandler, TypeRegistry};
pub use transact::{TransactComplete, TransactContext, TransactHandler};

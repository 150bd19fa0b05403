//! Message pool: per-type free lists with in-flight accounting.
//!
//! [`MsgPool::acquire`] hands out a [`PooledMsg`] guard; dropping the guard
//! clears the message and returns it to its type's free list. Ownership
//! transfer is by move, so releasing twice or touching a released message is
//! unrepresentable. In-flight counts are tracked separately from free-list
//! depth so a leak (a guard parked forever) is visible in diagnostics.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::{FabricError, Result};
use crate::msg::{Msg, MsgType};
use crate::registry::TypeRegistry;

#[derive(Default)]
struct PoolSlot {
    free: Vec<Msg>,
    in_flight: usize,
}

struct PoolShared {
    slots: Mutex<HashMap<MsgType, PoolSlot>>,
}

impl PoolShared {
    fn release(&self, mut msg: Msg) {
        msg.clear();
        let mut slots = self.slots.lock().expect("msg pool lock poisoned");
        let slot = slots.entry(msg.msg_type()).or_default();
        slot.in_flight = slot.in_flight.saturating_sub(1);
        slot.free.push(msg);
    }
}

/// Per-type pool depth, for leak detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDepth {
    /// Message type the depths belong to.
    pub msg_type: MsgType,
    /// Messages available for reuse.
    pub free: usize,
    /// Messages currently held by callers or the transport.
    pub in_flight: usize,
}

/// Reusable typed message buffers keyed by registered type.
pub struct MsgPool {
    registry: Arc<TypeRegistry>,
    shared: Arc<PoolShared>,
}

impl MsgPool {
    /// Creates a pool backed by `registry` for template lookup.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            shared: Arc::new(PoolShared {
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires a cleared message of `msg_type`, reusing a pooled one when
    /// available. Fails with [`FabricError::UnregisteredType`] when no
    /// template is registered.
    pub fn acquire(&self, msg_type: MsgType) -> Result<PooledMsg> {
        let registration = self
            .registry
            .lookup(msg_type)
            .ok_or(FabricError::UnregisteredType(msg_type))?;
        let mut slots = self.shared.slots.lock().expect("msg pool lock poisoned");
        let slot = slots.entry(msg_type).or_default();
        let msg = slot
            .free
            .pop()
            .unwrap_or_else(|| Msg::new(msg_type, registration.template.clone()));
        slot.in_flight += 1;
        drop(slots);
        Ok(PooledMsg {
            msg: Some(msg),
            shared: self.shared.clone(),
        })
    }

    /// Current per-type depths, sorted by type.
    pub fn depths(&self) -> Vec<PoolDepth> {
        let slots = self.shared.slots.lock().expect("msg pool lock poisoned");
        let mut depths: Vec<PoolDepth> = slots
            .iter()
            .map(|(msg_type, slot)| PoolDepth {
                msg_type: *msg_type,
                free: slot.free.len(),
                in_flight: slot.in_flight,
            })
            .collect();
        depths.sort_by_key(|d| d.msg_type);
        depths
    }

    /// Logs per-type depths.
    pub fn dump(&self) {
        for depth in self.depths() {
            info!(
                msg_type = depth.msg_type,
                free = depth.free,
                in_flight = depth.in_flight,
                "msg pool depth"
            );
        }
    }
}

impl std::fmt::Debug for MsgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgPool").field("depths", &self.depths()).finish()
    }
}

/// Exclusive ownership of a pooled message; returns it cleared on drop.
pub struct PooledMsg {
    msg: Option<Msg>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledMsg {
    type Target = Msg;

    fn deref(&self) -> &Msg {
        self.msg.as_ref().expect("pooled msg already returned")
    }
}

impl DerefMut for PooledMsg {
    fn deref_mut(&mut self) -> &mut Msg {
        self.msg.as_mut().expect("pooled msg already returned")
    }
}

impl Drop for PooledMsg {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            self.shared.release(msg);
        }
    }
}

impl std::fmt::Debug for PooledMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledMsg").field("msg", &self.msg).finish()
    }
}

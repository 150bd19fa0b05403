//! Type registry: templates, scratch hints, and dispatch handlers.
//!
//! One registration per message type for the process lifetime, consulted by
//! the pool to size buffers and by the receive path to locate the decode
//! schema and the handler. Registrations are rare and dispatches frequent,
//! so the map sits behind an `RwLock`. The registry seals when the transport
//! starts; late registration is rejected rather than left undefined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{FabricError, Result};
use crate::fabric::Fabric;
use crate::msg::{MsgTemplate, MsgType};
use crate::node::NodeId;
use crate::pool::PooledMsg;
use crate::transact::TransactHandler;

/// Receiver callback for fire-and-forget fabric messages.
///
/// Runs on a transport-owned receive worker; it must not block indefinitely
/// or it starves that worker's assigned connections.
pub trait MsgHandler: Send + Sync + 'static {
    /// Called with the decoded message and its source node.
    fn on_msg(&self, fabric: &Fabric, from: NodeId, msg: PooledMsg);
}

impl<F> MsgHandler for F
where
    F: Fn(&Fabric, NodeId, PooledMsg) + Send + Sync + 'static,
{
    fn on_msg(&self, fabric: &Fabric, from: NodeId, msg: PooledMsg) {
        self(fabric, from, msg)
    }
}

/// How inbound messages of a type are dispatched.
#[derive(Clone)]
pub enum HandlerKind {
    /// Plain fabric message handler.
    Msg(Arc<dyn MsgHandler>),
    /// Transact responder; field 0 carries the transaction id.
    Transact(Arc<dyn TransactHandler>),
}

/// One registered message type.
#[derive(Clone)]
pub struct Registration {
    /// Field schema used by encode, decode, and pool sizing.
    pub template: Arc<MsgTemplate>,
    /// Decode-side buffer size hint, surfaced in diagnostics.
    pub scratch_size: usize,
    /// Dispatch target.
    pub kind: HandlerKind,
}

/// Message-type registrations, keyed by [`MsgType`].
pub struct TypeRegistry {
    entries: RwLock<HashMap<MsgType, Registration>>,
    sealed: AtomicBool,
}

impl TypeRegistry {
    /// Creates an empty, unsealed registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Registers a fire-and-forget message type.
    pub fn register(
        &self,
        msg_type: MsgType,
        template: MsgTemplate,
        scratch_size: usize,
        handler: Arc<dyn MsgHandler>,
    ) -> Result<()> {
        self.insert(msg_type, template, scratch_size, HandlerKind::Msg(handler))
    }

    /// Registers a transact responder type.
    ///
    /// Transact templates must reserve field 0 as a `u64` transaction id.
    pub fn register_transact(
        &self,
        msg_type: MsgType,
        template: MsgTemplate,
        scratch_size: usize,
        handler: Arc<dyn TransactHandler>,
    ) -> Result<()> {
        if template.field_kind(0) != Some(crate::msg::FieldKind::U64) {
            return Err(FabricError::BadMessage {
                reason: format!("transact type {msg_type} must reserve field 0 as u64"),
            });
        }
        self.insert(
            msg_type,
            template,
            scratch_size,
            HandlerKind::Transact(handler),
        )
    }

    fn insert(
        &self,
        msg_type: MsgType,
        template: MsgTemplate,
        scratch_size: usize,
        kind: HandlerKind,
    ) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(FabricError::RegistrySealed);
        }
        let mut entries = self.entries.write().expect("type registry lock poisoned");
        if entries.contains_key(&msg_type) {
            return Err(FabricError::DuplicateType(msg_type));
        }
        entries.insert(
            msg_type,
            Registration {
                template: Arc::new(template),
                scratch_size,
                kind,
            },
        );
        Ok(())
    }

    /// Looks up the registration for `msg_type`.
    pub fn lookup(&self, msg_type: MsgType) -> Option<Registration> {
        self.entries
            .read()
            .expect("type registry lock poisoned")
            .get(&msg_type)
            .cloned()
    }

    /// Seals the registry; called once at transport start.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("type registry lock poisoned")
            .len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.len())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FieldKind;
    use crate::transact::TransactContext;

    struct NopHandler;

    impl MsgHandler for NopHandler {
        fn on_msg(&self, _fabric: &Fabric, _from: NodeId, _msg: PooledMsg) {}
    }

    struct NopTransactHandler;

    impl TransactHandler for NopTransactHandler {
        fn on_request(
            &self,
            _fabric: &Fabric,
            _from: NodeId,
            _msg: PooledMsg,
            _ctx: TransactContext,
        ) {
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TypeRegistry::new();
        registry
            .register(10, MsgTemplate::new(&[FieldKind::U32]), 32, Arc::new(NopHandler))
            .unwrap();

        let registration = registry.lookup(10).unwrap();
        assert_eq!(registration.template.len(), 1);
        assert_eq!(registration.scratch_size, 32);
        assert!(matches!(registration.kind, HandlerKind::Msg(_)));
        assert!(registry.lookup(11).is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = TypeRegistry::new();
        registry
            .register(10, MsgTemplate::new(&[FieldKind::U32]), 32, Arc::new(NopHandler))
            .unwrap();
        let err = registry
            .register(10, MsgTemplate::new(&[FieldKind::U64]), 32, Arc::new(NopHandler))
            .unwrap_err();
        assert!(matches!(err, FabricError::DuplicateType(10)));
    }

    #[test]
    fn test_registration_after_seal_rejected() {
        let registry = TypeRegistry::new();
        registry.seal();
        let err = registry
            .register(10, MsgTemplate::new(&[FieldKind::U32]), 32, Arc::new(NopHandler))
            .unwrap_err();
        assert!(matches!(err, FabricError::RegistrySealed));
    }

    #[test]
    fn test_transact_registration_requires_u64_field_0() {
        let registry = TypeRegistry::new();
        let err = registry
            .register_transact(
                20,
                MsgTemplate::new(&[FieldKind::U32]),
                32,
                Arc::new(NopTransactHandler),
            )
            .unwrap_err();
        assert!(matches!(err, FabricError::BadMessage { .. }));

        registry
            .register_transact(
                20,
                MsgTemplate::new(&[FieldKind::U64, FieldKind::Str]),
                32,
                Arc::new(NopTransactHandler),
            )
            .unwrap();
        assert!(matches!(
            registry.lookup(20).unwrap().kind,
            HandlerKind::Transact(_)
        ));
    }
}

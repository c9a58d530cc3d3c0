//! Per-process runtime aggregate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::id::InstanceIdentifier;
use crate::instance::InstanceRegistry;
use crate::registry::TypeRegistry;
use crate::remotable::Remotable;
use crate::service::ServiceContainer;
use crate::value::ObjRef;

/// Everything one endpoint of a remoting deployment shares across its
/// connections: its identity, the instance and type registries, the
/// well-known services and the termination token.
///
/// A process normally holds exactly one runtime; tests spin up two with
/// distinct identifiers to keep both ends of a connection in-process.
pub struct Runtime {
    identifier: InstanceIdentifier,
    pub instances: InstanceRegistry,
    pub types: TypeRegistry,
    pub services: ServiceContainer,
    running: Arc<AtomicBool>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Self::with_identifier(InstanceIdentifier::local())
    }

    pub fn with_identifier(identifier: InstanceIdentifier) -> Arc<Self> {
        Arc::new(Self {
            instances: InstanceRegistry::new(identifier.clone()),
            types: TypeRegistry::new(),
            services: ServiceContainer::new(),
            running: Arc::new(AtomicBool::new(true)),
            identifier,
        })
    }

    pub fn identifier(&self) -> &InstanceIdentifier {
        &self.identifier
    }

    /// Shared termination token. Reader loops and blocked call sites poll
    /// this flag and wind down once it flips.
    pub fn run_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("runtime {} shutting down", self.identifier);
            self.services.clear();
        }
    }

    /// Wraps an object for embedding into a by-value payload.
    pub fn obj_ref(&self, obj: Arc<dyn Remotable>) -> ObjRef {
        ObjRef::new(&self.instances, obj)
    }
}

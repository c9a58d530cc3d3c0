//! Container for well-known services.
//!
//! A small table of singleton objects addressable by type name. Populated
//! at bootstrap, resolved by service-reference requests, torn down with
//! the runtime.

use std::sync::Arc;

use dashmap::DashMap;

use crate::remotable::Remotable;

pub struct ServiceContainer {
    services: DashMap<String, Arc<dyn Remotable>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Registers a service under its own type name.
    pub fn register(&self, service: Arc<dyn Remotable>) {
        let name = service.type_name().to_string();
        self.register_as(&name, service);
    }

    pub fn register_as(&self, name: &str, service: Arc<dyn Remotable>) {
        info!("registering well-known service: {}", name);
        self.services.insert(name.to_string(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Remotable>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        self.services.clear();
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

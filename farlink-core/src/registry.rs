//! Registry of remotable types.
//!
//! The descriptor table is what replaces runtime proxy synthesis and
//! reflection-based method resolution: every type that crosses the wire by
//! reference registers its method table, a proxy factory for the receiving
//! side, and optionally constructors for remote instantiation.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::remotable::{MethodToken, ProxyHandle, Remotable};
use crate::value::Argument;

pub type ProxyFactory = Arc<dyn Fn(ProxyHandle) -> Arc<dyn Remotable> + Send + Sync>;
pub type Constructor = Arc<dyn Fn(Vec<Argument>) -> Result<Arc<dyn Remotable>> + Send + Sync>;

#[derive(Clone)]
pub struct MethodDesc {
    pub token: MethodToken,
    pub name: String,
}

#[derive(Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub methods: Vec<MethodDesc>,
    proxy: Option<ProxyFactory>,
    ctor: Option<Constructor>,
    default_ctor: Option<Constructor>,
}

impl TypeDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: Vec::new(),
            proxy: None,
            ctor: None,
            default_ctor: None,
        }
    }

    pub fn method(mut self, token: MethodToken, name: &str) -> Self {
        self.methods.push(MethodDesc {
            token,
            name: name.to_string(),
        });
        self
    }

    pub fn proxy(mut self, factory: ProxyFactory) -> Self {
        self.proxy = Some(factory);
        self
    }

    pub fn constructor(mut self, ctor: Constructor) -> Self {
        self.ctor = Some(ctor);
        self
    }

    pub fn default_constructor(mut self, ctor: Constructor) -> Self {
        self.default_ctor = Some(ctor);
        self
    }

    pub fn method_name(&self, token: MethodToken) -> Option<&str> {
        self.methods
            .iter()
            .find(|m| m.token == token)
            .map(|m| m.name.as_str())
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn make_proxy(&self, handle: ProxyHandle) -> Result<Arc<dyn Remotable>> {
        let factory = self.proxy.as_ref().ok_or_else(|| {
            Error::ProxyManagement(format!("no proxy stub registered for type {}", self.name))
        })?;
        Ok(factory(handle))
    }

    pub fn construct(&self, args: Vec<Argument>, default: bool) -> Result<Arc<dyn Remotable>> {
        let ctor = if default { &self.default_ctor } else { &self.ctor };
        let ctor = ctor.as_ref().ok_or_else(|| {
            Error::UnsupportedOperation(format!("type {} is not remotely constructible", self.name))
        })?;
        ctor(args)
    }
}

pub struct TypeRegistry {
    types: DashMap<String, Arc<TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    pub fn register(&self, descriptor: TypeDescriptor) {
        self.types
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.types.get(name).map(|entry| entry.value().clone())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

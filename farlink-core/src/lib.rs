//! This library implements the core object model of the farlink remoting
//! runtime.
//!
//! Programming interface is centered around the [`Runtime`] structure,
//! which aggregates everything one endpoint shares across its
//! connections: the instance registry mapping stable object ids to live
//! objects or proxies, the registry of remotable types with their method
//! tables and stub factories, and the container of well-known services.
//!
//! # Networking
//!
//! By itself, this library does not provide any networking capability.
//! Only the structures and traits needed to express remote objects are
//! provided: the [`Remotable`] dispatch trait, the [`Argument`] value
//! model and the [`CallChannel`] seam that proxy stubs forward through.
//! For the wire protocol and connection handling see `farlink-net`.

#![allow(unused)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod error;
pub mod id;
pub mod instance;
pub mod registry;
pub mod remotable;
pub mod service;
pub mod value;

mod runtime;

pub use error::{Error, Result};
pub use id::{InstanceIdentifier, ObjectId};
pub use instance::{InstanceEntry, InstanceRegistry};
pub use registry::{Constructor, MethodDesc, ProxyFactory, TypeDescriptor, TypeRegistry};
pub use remotable::{
    downcast, same_object, CallChannel, CallSpec, ForwardingProxy, Invocation, MethodToken,
    Outcome, ProxyHandle, ReferenceResolver, Remotable, ReturnValues,
};
pub use runtime::Runtime;
pub use service::ServiceContainer;
pub use value::{enter_marshal_scope, Argument, Delegate, ListValue, MarshalScope, ObjRef};

//! Dispatch trait and proxy plumbing for pass-by-reference objects.
//!
//! The source of truth for "what can be called remotely" is the
//! [`Remotable`] trait. Originals implement it with a real method body
//! behind every token; proxy stubs implement it by forwarding the call
//! through a [`CallChannel`]. Stubs are ordinary generated (or
//! hand-written) types registered in the type registry, which is what
//! stands in for runtime proxy synthesis in a static language.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::value::{enter_marshal_scope, Argument};

/// Identifies a method within its declaring type, as carried on the wire.
pub type MethodToken = i32;

/// Marker and dispatch surface of every object that crosses process
/// boundaries by reference.
pub trait Remotable: Send + Sync + 'static {
    /// Full name of the type, as registered with the type registry.
    fn type_name(&self) -> &str;

    /// Executes the method identified by the invocation's token.
    fn dispatch(&self, call: Invocation) -> Result<Outcome>;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// `Some(_)` when this object is a stand-in for a remote original.
    fn proxy_target(&self) -> Option<&ProxyHandle> {
        None
    }
}

impl fmt::Debug for dyn Remotable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remotable({})", self.type_name())
    }
}

/// Reference equality over trait objects. Two handles to the same proxy
/// compare equal here, which is what the instance registry relies on.
pub fn same_object(a: &Arc<dyn Remotable>, b: &Arc<dyn Remotable>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Recovers the concrete type behind a remotable handle.
pub fn downcast<T: Remotable>(obj: Arc<dyn Remotable>) -> Option<Arc<T>> {
    obj.as_any_arc().downcast::<T>().ok()
}

/// A single decoded method call, as handed to [`Remotable::dispatch`].
pub struct Invocation {
    pub method: MethodToken,
    pub generic_args: Vec<String>,
    pub args: Vec<Argument>,
}

impl Invocation {
    pub fn new(method: MethodToken, args: Vec<Argument>) -> Self {
        Self {
            method,
            generic_args: Vec::new(),
            args,
        }
    }

    /// Takes the argument at `index` out of the invocation, leaving null.
    pub fn take(&mut self, index: usize) -> Argument {
        match self.args.get_mut(index) {
            Some(slot) => std::mem::replace(slot, Argument::Null),
            None => Argument::Null,
        }
    }
}

/// What a dispatched method hands back: an optional return value plus the
/// final values of its by-ref parameters, keyed by parameter position.
#[derive(Default)]
pub struct Outcome {
    pub ret: Option<Argument>,
    pub by_ref: Vec<(usize, Argument)>,
}

impl Outcome {
    pub fn void() -> Self {
        Self::default()
    }

    pub fn with_ret(ret: Argument) -> Self {
        Self {
            ret: Some(ret),
            by_ref: Vec::new(),
        }
    }
}

/// Client-side description of an outgoing call.
///
/// `by_ref` lists the positions of parameters whose updated values the
/// reply will carry; together with `wants_return` it fixes the shape of
/// the reply frame, which is not self-delimiting on the wire.
pub struct CallSpec {
    /// Declaring type name; empty means "resolve on the instance itself".
    pub declaring_type: String,
    pub method: MethodToken,
    pub generic_args: Vec<String>,
    pub args: Vec<Argument>,
    pub by_ref: Vec<usize>,
    pub wants_return: bool,
}

impl CallSpec {
    pub fn new(declaring_type: &str, method: MethodToken) -> Self {
        Self {
            declaring_type: declaring_type.to_string(),
            method,
            generic_args: Vec::new(),
            args: Vec::new(),
            by_ref: Vec::new(),
            wants_return: false,
        }
    }

    pub fn arg(mut self, arg: Argument) -> Self {
        self.args.push(arg);
        self
    }

    /// Appends an argument whose updated value travels back in the reply.
    pub fn by_ref_arg(mut self, arg: Argument) -> Self {
        self.by_ref.push(self.args.len());
        self.args.push(arg);
        self
    }

    pub fn generic_arg(mut self, type_name: &str) -> Self {
        self.generic_args.push(type_name.to_string());
        self
    }

    pub fn returns(mut self) -> Self {
        self.wants_return = true;
        self
    }
}

/// Decoded reply to a [`CallSpec`].
pub struct ReturnValues {
    pub ret: Option<Argument>,
    pub by_ref: Vec<Argument>,
}

impl ReturnValues {
    pub fn expect_ret(self) -> Result<Argument> {
        self.ret
            .ok_or_else(|| Error::Protocol("reply carried no return value".to_string()))
    }
}

/// Resolves an object id to a live handle, synthesizing a proxy when the
/// id names a remote original not seen before. Implemented by the
/// connection layer; consumed by embedded-reference decoding.
pub trait ReferenceResolver: Send + Sync {
    fn resolve(&self, id: &ObjectId, type_name: &str) -> Result<Arc<dyn Remotable>>;
}

/// Outbound call surface of one connection, as seen from proxy stubs.
pub trait CallChannel: Send + Sync + 'static {
    /// Sends a method call and blocks until the sequenced reply arrives.
    fn call(&self, target: &ObjectId, spec: CallSpec) -> Result<ReturnValues>;

    /// Asks the peer to construct an instance with explicit arguments.
    fn create_instance(&self, type_name: &str, args: Vec<Argument>)
        -> Result<Arc<dyn Remotable>>;

    /// Asks the peer to construct an instance with its default constructor.
    fn create_instance_default(&self, type_name: &str) -> Result<Arc<dyn Remotable>>;

    /// Obtains a reference to one of the peer's well-known services.
    fn request_service(&self, type_name: &str) -> Result<Arc<dyn Remotable>>;

    fn resolver(&self) -> Arc<dyn ReferenceResolver>;
}

/// Ties a proxy stub to the remote original it stands in for.
#[derive(Clone)]
pub struct ProxyHandle {
    pub id: ObjectId,
    pub channel: Arc<dyn CallChannel>,
}

impl ProxyHandle {
    pub fn new(id: ObjectId, channel: Arc<dyn CallChannel>) -> Self {
        Self { id, channel }
    }

    pub fn call(&self, spec: CallSpec) -> Result<ReturnValues> {
        self.channel.call(&self.id, spec)
    }

    /// Deserializes a by-value argument inside a marshalling scope, so
    /// object references embedded in the payload resolve against this
    /// connection.
    pub fn unmarshal<T: DeserializeOwned>(&self, arg: Argument) -> Result<T> {
        let _scope = enter_marshal_scope(self.channel.resolver());
        arg.take()
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyHandle({})", self.id)
    }
}

/// Interface-only proxy that forwards every dispatched call verbatim to
/// the remote original, expecting no return value. Covers callback
/// receivers and other fire-and-acknowledge surfaces without a dedicated
/// stub type.
pub struct ForwardingProxy {
    handle: ProxyHandle,
    type_name: String,
}

impl ForwardingProxy {
    pub fn new(handle: ProxyHandle, type_name: &str) -> Arc<dyn Remotable> {
        Arc::new(Self {
            handle,
            type_name: type_name.to_string(),
        })
    }

    pub fn factory(type_name: &str) -> crate::registry::ProxyFactory {
        let name = type_name.to_string();
        Arc::new(move |handle| {
            Arc::new(ForwardingProxy {
                handle,
                type_name: name.clone(),
            }) as Arc<dyn Remotable>
        })
    }
}

impl Remotable for ForwardingProxy {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn dispatch(&self, call: Invocation) -> Result<Outcome> {
        let mut spec = CallSpec::new("", call.method);
        spec.generic_args = call.generic_args;
        spec.args = call.args;
        self.handle.call(spec)?;
        Ok(Outcome::void())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn proxy_target(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

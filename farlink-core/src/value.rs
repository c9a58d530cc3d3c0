//! Runtime value model for call arguments.
//!
//! Every value crossing the wire is classified at construction time into
//! one of the [`Argument`] variants; the marshaller in the net layer maps
//! those onto wire tags. By-value payloads are opaque serialized blobs,
//! everything else keeps enough structure for the connection layer to
//! preserve object identity.

use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::instance::InstanceRegistry;
use crate::remotable::{same_object, Invocation, MethodToken, ReferenceResolver, Remotable};

#[derive(Clone)]
pub enum Argument {
    Null,
    /// Opaque by-value payload produced by the value serializer.
    Value(Vec<u8>),
    /// Pass-by-reference object, original or proxy.
    Object(Arc<dyn Remotable>),
    /// Bound method reference.
    Delegate(Delegate),
    /// System type token.
    TypeToken(String),
    TypeTokenList(Vec<String>),
    /// Well-known network address record.
    Address(SocketAddr),
    /// Container whose elements may themselves be pass-by-reference.
    List(ListValue),
}

impl Argument {
    /// Runs the value serializer over `v`. A failing `Serialize` impl
    /// surfaces as [`Error::SerializationFailure`].
    pub fn value<T: Serialize + ?Sized>(v: &T) -> Result<Argument> {
        let bytes =
            bincode::serialize(v).map_err(|e| Error::SerializationFailure(e.to_string()))?;
        Ok(Argument::Value(bytes))
    }

    pub fn object(obj: Arc<dyn Remotable>) -> Argument {
        Argument::Object(obj)
    }

    /// Deserializes a by-value payload. Embedded object references only
    /// resolve inside a marshalling scope, see [`enter_marshal_scope`].
    pub fn take<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Argument::Value(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::SerializationFailure(e.to_string())),
            other => Err(Error::SerializationFailure(format!(
                "expected a by-value payload, found {:?}",
                other
            ))),
        }
    }

    pub fn into_object(self) -> Result<Arc<dyn Remotable>> {
        match self {
            Argument::Object(obj) => Ok(obj),
            other => Err(Error::ProxyManagement(format!(
                "expected an object reference, found {:?}",
                other
            ))),
        }
    }

    /// Null decodes to `None`; a second event removal is a no-op.
    pub fn into_delegate(self) -> Result<Option<Delegate>> {
        match self {
            Argument::Delegate(d) => Ok(Some(d)),
            Argument::Null => Ok(None),
            other => Err(Error::ProxyManagement(format!(
                "expected a delegate, found {:?}",
                other
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Argument::Null)
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Null => write!(f, "Null"),
            Argument::Value(bytes) => write!(f, "Value({} bytes)", bytes.len()),
            Argument::Object(obj) => write!(f, "Object({})", obj.type_name()),
            Argument::Delegate(d) => write!(f, "Delegate({}#{})", d.declaring_type, d.method),
            Argument::TypeToken(name) => write!(f, "TypeToken({})", name),
            Argument::TypeTokenList(names) => write!(f, "TypeTokenList(len {})", names.len()),
            Argument::Address(addr) => write!(f, "Address({})", addr),
            Argument::List(list) => write!(f, "List({}, len {})", list.element, list.items.len()),
        }
    }
}

/// Container argument. The element type name rides along so the receiving
/// side can rebuild a typed collection.
#[derive(Clone)]
pub struct ListValue {
    pub container: String,
    pub element: String,
    pub items: Vec<Argument>,
}

impl ListValue {
    pub fn new(container: &str, element: &str) -> Self {
        Self {
            container: container.to_string(),
            element: element.to_string(),
            items: Vec::new(),
        }
    }
}

/// A method reference bound to a target object.
///
/// On the sending side the target is a local original (an event handler
/// receiver); decoded on the other side, the target is a callback stub
/// forwarding invocations back to the originating peer. A delegate with no
/// target models a static-target method reference and is rejected at
/// marshal time.
#[derive(Clone)]
pub struct Delegate {
    pub target: Option<Arc<dyn Remotable>>,
    pub method: MethodToken,
    pub declaring_type: String,
    id_cell: Arc<OnceLock<ObjectId>>,
}

impl Delegate {
    pub fn bound(target: Arc<dyn Remotable>, method: MethodToken, declaring_type: &str) -> Self {
        Self {
            target: Some(target),
            method,
            declaring_type: declaring_type.to_string(),
            id_cell: Arc::new(OnceLock::new()),
        }
    }

    pub fn unbound(method: MethodToken, declaring_type: &str) -> Self {
        Self {
            target: None,
            method,
            declaring_type: declaring_type.to_string(),
            id_cell: Arc::new(OnceLock::new()),
        }
    }

    /// Invokes the bound method, discarding any outcome.
    pub fn invoke(&self, args: Vec<Argument>) -> Result<()> {
        let target = self.target.as_ref().ok_or_else(|| {
            Error::UnsupportedOperation("delegate has no bound target".to_string())
        })?;
        target.dispatch(Invocation::new(self.method, args))?;
        Ok(())
    }

    /// Whether both delegates name the same sink, by reference equality of
    /// targets plus the method token. This is what event removal matches
    /// on.
    pub fn same_sink(&self, other: &Delegate) -> bool {
        if self.method != other.method {
            return false;
        }
        match (&self.target, &other.target) {
            (Some(a), Some(b)) => same_object(a, b),
            _ => false,
        }
    }

    /// Id of the delegate itself, allocated lazily and stable across
    /// repeated marshalling of the same delegate instance.
    pub fn wire_id(&self, registry: &InstanceRegistry) -> ObjectId {
        self.id_cell
            .get_or_init(|| registry.allocate_id(&self.declaring_type))
            .clone()
    }
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Delegate({}#{}, {})",
            self.declaring_type,
            self.method,
            if self.target.is_some() {
                "bound"
            } else {
                "unbound"
            }
        )
    }
}

/// Object reference embedded inside a by-value payload.
///
/// Serializes as the object's id, so a proxy can never leak into a
/// serialized graph as anything but a reference token. Deserialization
/// resolves the id against the active marshalling scope, synthesizing a
/// proxy when the object lives on the other side.
pub struct ObjRef {
    id: ObjectId,
    obj: Arc<dyn Remotable>,
}

impl ObjRef {
    pub fn new(registry: &InstanceRegistry, obj: Arc<dyn Remotable>) -> Self {
        let id = registry.id_for(&obj);
        Self { id, obj }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn get(&self) -> Arc<dyn Remotable> {
        self.obj.clone()
    }

    pub fn downcast<T: Remotable>(&self) -> Option<Arc<T>> {
        crate::remotable::downcast(self.obj.clone())
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            obj: self.obj.clone(),
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.id)
    }
}

impl Serialize for ObjRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for ObjRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let id: ObjectId = raw.parse().map_err(serde::de::Error::custom)?;
        let resolver = current_resolver().ok_or_else(|| {
            serde::de::Error::custom("object reference decoded outside a marshalling scope")
        })?;
        let obj = resolver
            .resolve(&id, id.type_name().unwrap_or(""))
            .map_err(serde::de::Error::custom)?;
        Ok(Self { id, obj })
    }
}

thread_local! {
    static ACTIVE_RESOLVER: RefCell<Vec<Arc<dyn ReferenceResolver>>> = RefCell::new(Vec::new());
}

/// Scope guard making a resolver available to embedded-reference decoding
/// on the current thread. Scopes nest; the innermost wins.
pub struct MarshalScope(());

pub fn enter_marshal_scope(resolver: Arc<dyn ReferenceResolver>) -> MarshalScope {
    ACTIVE_RESOLVER.with(|stack| stack.borrow_mut().push(resolver));
    MarshalScope(())
}

impl Drop for MarshalScope {
    fn drop(&mut self) {
        ACTIVE_RESOLVER.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn current_resolver() -> Option<Arc<dyn ReferenceResolver>> {
    ACTIVE_RESOLVER.with(|stack| stack.borrow().last().cloned())
}

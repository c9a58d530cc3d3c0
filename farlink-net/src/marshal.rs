//! Tagged-argument marshalling against the instance registry.
//!
//! One marshaller lives on each connection, shared by the call client and
//! the dispatcher reading the companion stream. It owns the delegate
//! registration table and the proxy synthesis path, and acts as the
//! resolver for object references embedded in by-value payloads.

use std::convert::TryFrom;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Weak};

use fnv::FnvHashMap;

use farlink_core::{
    Argument, CallChannel, Delegate, Error, ForwardingProxy, ListValue, MarshalScope, ObjectId,
    ProxyHandle, ReferenceResolver, Remotable, Result, Runtime,
};

use crate::codec::{FrameReader, FrameWriter};
use crate::msg::RemotingTag;

pub struct Marshaller {
    runtime: Arc<Runtime>,
    channel: Weak<dyn CallChannel>,
    // registrations per (target, method) key; repeat additions stack
    delegates: Mutex<FnvHashMap<String, Vec<Delegate>>>,
}

impl Marshaller {
    pub fn new(runtime: Arc<Runtime>, channel: Weak<dyn CallChannel>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            channel,
            delegates: Mutex::new(FnvHashMap::default()),
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn channel(&self) -> Result<Arc<dyn CallChannel>> {
        self.channel.upgrade().ok_or(Error::ConnectionLost)
    }

    /// Makes this connection the resolver for embedded references decoded
    /// on the current thread.
    pub fn enter_scope(self: &Arc<Self>) -> MarshalScope {
        farlink_core::enter_marshal_scope(self.clone() as Arc<dyn ReferenceResolver>)
    }

    /// Drops all delegate registrations. Connection teardown path.
    pub fn clear_delegates(&self) {
        self.delegates.lock().unwrap().clear();
    }

    pub fn write_argument<W: Write>(
        &self,
        w: &mut FrameWriter<W>,
        arg: &Argument,
    ) -> Result<()> {
        match arg {
            Argument::Null => w.write_i32(RemotingTag::NullPointer as i32),
            Argument::TypeToken(name) => {
                w.write_i32(RemotingTag::InstanceOfSystemType as i32)?;
                w.write_str(name)
            }
            Argument::TypeTokenList(names) => {
                w.write_i32(RemotingTag::ArrayOfSystemType as i32)?;
                w.write_i32(names.len() as i32)?;
                for name in names {
                    w.write_str(name)?;
                }
                Ok(())
            }
            Argument::Address(addr) => {
                w.write_i32(RemotingTag::IpAddress as i32)?;
                w.write_str(&addr.to_string())
            }
            Argument::List(list) => {
                w.write_i32(RemotingTag::ContainerType as i32)?;
                w.write_str(&list.container)?;
                w.write_str(&list.element)?;
                for item in &list.items {
                    w.write_bool(true)?;
                    self.write_argument(w, item)?;
                }
                w.write_bool(false)
            }
            Argument::Delegate(delegate) => {
                let target = delegate.target.as_ref().ok_or_else(|| {
                    Error::UnsupportedOperation(
                        "cannot marshal a method reference without a bound target".to_string(),
                    )
                })?;
                let target_id = self.runtime.instances.id_for(target);
                let delegate_id = delegate.wire_id(&self.runtime.instances);
                w.write_i32(RemotingTag::MethodPointer as i32)?;
                w.write_str(target_id.as_str())?;
                w.write_str(delegate_id.as_str())?;
                w.write_str(&delegate.declaring_type)?;
                w.write_i32(delegate.method)
            }
            Argument::Object(obj) => {
                w.write_i32(RemotingTag::RemoteReference as i32)?;
                if let Some(handle) = obj.proxy_target() {
                    // the peer owns this one already; an empty type name
                    // says so
                    w.write_str(handle.id.as_str())?;
                    w.write_str("")
                } else {
                    let id = self.runtime.instances.id_for(obj);
                    w.write_str(id.as_str())?;
                    w.write_str(obj.type_name())
                }
            }
            Argument::Value(bytes) => {
                w.write_i32(RemotingTag::SerializedItem as i32)?;
                w.write_bytes(bytes)
            }
        }
    }

    /// Total over the tag set. `calling_method` carries the name of the
    /// method whose argument list is being decoded, which is what pairs
    /// `add_*`/`remove_*` event accessors with their delegate
    /// registrations; `static_type` is the declared parameter type, when
    /// the call site knows one.
    pub fn read_argument<R: Read>(
        &self,
        r: &mut FrameReader<R>,
        calling_method: Option<&str>,
        static_type: Option<&str>,
    ) -> Result<Argument> {
        let raw = r.read_i32()?;
        let tag = RemotingTag::try_from(raw)
            .map_err(|_| Error::UnsupportedOperation(format!("unknown argument tag: {}", raw)))?;
        match tag {
            RemotingTag::NullPointer => Ok(Argument::Null),
            RemotingTag::SerializedItem => Ok(Argument::Value(r.read_bytes()?)),
            RemotingTag::InstanceOfSystemType => Ok(Argument::TypeToken(r.read_str()?)),
            RemotingTag::ArrayOfSystemType => {
                let count = r.read_i32()?;
                let mut names = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    names.push(r.read_str()?);
                }
                Ok(Argument::TypeTokenList(names))
            }
            RemotingTag::IpAddress => {
                let text = r.read_str()?;
                let addr = text
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad address form: {}", text)))?;
                Ok(Argument::Address(addr))
            }
            RemotingTag::ContainerType => {
                let container = r.read_str()?;
                let element = r.read_str()?;
                let mut items = Vec::new();
                while r.read_bool()? {
                    items.push(self.read_argument(r, calling_method, Some(&element))?);
                }
                Ok(Argument::List(ListValue {
                    container,
                    element,
                    items,
                }))
            }
            RemotingTag::RemoteReference => {
                let id: ObjectId = r.read_str()?.parse()?;
                let type_name = r.read_str()?;
                let obj = self.resolve_reference(&id, &type_name, static_type)?;
                Ok(Argument::Object(obj))
            }
            RemotingTag::MethodPointer => {
                let target_id: ObjectId = r.read_str()?.parse()?;
                let delegate_id: ObjectId = r.read_str()?.parse()?;
                let declaring = r.read_str()?;
                let method = r.read_i32()?;
                self.read_method_pointer(target_id, delegate_id, declaring, method, calling_method)
            }
        }
    }

    /// Resolves a reference token to a live object, synthesizing and
    /// weakly recording a proxy when the original lives on the other
    /// side. An id that parses as local but has no entry means the peer
    /// invented it; that tears the connection down.
    pub fn resolve_reference(
        &self,
        id: &ObjectId,
        type_name: &str,
        static_type: Option<&str>,
    ) -> Result<Arc<dyn Remotable>> {
        if let Some(existing) = self.runtime.instances.try_get(id) {
            return Ok(existing);
        }
        if id.is_owned_by(self.runtime.identifier()) {
            return Err(Error::Protocol(format!(
                "peer referenced unknown local object {}",
                id
            )));
        }

        // declared parameter type first, transmitted runtime type second,
        // the id's own type segment as a last resort
        let types = &self.runtime.types;
        let descriptor = static_type
            .and_then(|name| types.get(name))
            .filter(|d| d.has_proxy())
            .or_else(|| {
                if type_name.is_empty() {
                    None
                } else {
                    types.get(type_name).filter(|d| d.has_proxy())
                }
            })
            .or_else(|| id.type_name().and_then(|name| types.get(name)));
        let descriptor = descriptor.ok_or_else(|| {
            Error::ProxyManagement(format!(
                "cannot resolve a stub type for remote reference {} ({:?})",
                id, type_name
            ))
        })?;

        let handle = ProxyHandle::new(id.clone(), self.channel()?);
        let proxy = descriptor.make_proxy(handle)?;
        self.runtime
            .instances
            .add_or_replace(proxy.clone(), id.clone());
        debug!("synthesized {} stub for {}", descriptor.name, id);
        Ok(proxy)
    }

    fn read_method_pointer(
        &self,
        target_id: ObjectId,
        delegate_id: ObjectId,
        declaring: String,
        method: i32,
        calling_method: Option<&str>,
    ) -> Result<Argument> {
        let handle = ProxyHandle::new(target_id.clone(), self.channel()?);
        let sink = ForwardingProxy::new(handle, &declaring);
        // reachable under both ids the peer may use for it; a live entry
        // (an earlier registration of the same sink) must not be clobbered
        // by this short-lived decode
        if self.runtime.instances.try_get(&target_id).is_none() {
            self.runtime
                .instances
                .add_or_replace(sink.clone(), target_id.clone());
        }
        if self.runtime.instances.try_get(&delegate_id).is_none() {
            self.runtime.instances.add_or_replace(sink.clone(), delegate_id);
        }

        let delegate = Delegate::bound(sink, method, &declaring);
        let key = format!("{}.{}", target_id, method);
        match calling_method {
            Some(name) if name.starts_with("add_") => {
                debug!("registering event sink {}", key);
                let mut table = self.delegates.lock().unwrap();
                let entry = table.entry(key).or_default();
                // repeat registrations of the same handler must compare
                // equal later, so they all share the first decoded sink
                let delegate = entry.first().cloned().unwrap_or(delegate);
                entry.push(delegate.clone());
                Ok(Argument::Delegate(delegate))
            }
            Some(name) if name.starts_with("remove_") => {
                // a removal with no prior registration decodes to null;
                // the extra remove is a no-op
                let mut table = self.delegates.lock().unwrap();
                match table.get_mut(&key) {
                    Some(stack) if !stack.is_empty() => {
                        let registered = stack.pop().unwrap();
                        if stack.is_empty() {
                            table.remove(&key);
                        }
                        Ok(Argument::Delegate(registered))
                    }
                    _ => Ok(Argument::Null),
                }
            }
            _ => Ok(Argument::Delegate(delegate)),
        }
    }
}

impl ReferenceResolver for Marshaller {
    fn resolve(&self, id: &ObjectId, type_name: &str) -> Result<Arc<dyn Remotable>> {
        self.resolve_reference(id, type_name, None)
    }
}

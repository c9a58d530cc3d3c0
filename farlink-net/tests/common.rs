//! Shared fixture for the loopback suites: a small remotable service with
//! callbacks and events, its hand-written stubs, and the two-runtime
//! wiring. The stub types here are what a build-time generator would
//! emit from the service interface.

#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use farlink_core::{
    downcast, Argument, CallSpec, Delegate, Error, ForwardingProxy, InstanceIdentifier,
    Invocation, MethodToken, ObjRef, Outcome, ProxyHandle, Remotable, Result, Runtime,
    TypeDescriptor,
};
use farlink_net::{ClientConfig, Connection, Server, ServerConfig};

pub const RECKONER: &str = "farlink.tests.Reckoner";
pub const WIDGET: &str = "farlink.tests.Widget";
pub const CALLBACK: &str = "farlink.tests.CallbackReceiver";
pub const TICK_SINK: &str = "farlink.tests.TickSink";

pub const M_IDENTITY: MethodToken = 1;
pub const M_BUMP: MethodToken = 2;
pub const M_REGISTER_CALLBACK: MethodToken = 3;
pub const M_RUN_CALLBACKS: MethodToken = 4;
pub const M_ADD_ON_TICK: MethodToken = 5;
pub const M_REMOVE_ON_TICK: MethodToken = 6;
pub const M_RAISE_TICK: MethodToken = 7;
pub const M_ECHO: MethodToken = 8;
pub const M_COMPONENT: MethodToken = 9;
pub const M_CALL_COUNT: MethodToken = 10;
pub const M_BAD_RETURN: MethodToken = 11;
pub const M_OPEN_ENVELOPE: MethodToken = 12;

pub const W_PING: MethodToken = 1;
pub const CB_NOTIFY: MethodToken = 1;
pub const SINK_ON_TICK: MethodToken = 1;

/// A by-value payload with an embedded object reference.
#[derive(Serialize, Deserialize)]
pub struct Envelope {
    pub label: String,
    pub payload: ObjRef,
}

/// A value whose serializer always refuses.
pub struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: serde::Serializer>(
        &self,
        _serializer: S,
    ) -> core::result::Result<S::Ok, S::Error> {
        Err(<S::Error as serde::ser::Error>::custom(
            "deliberately not serializable",
        ))
    }
}

// ---------------------------------------------------------------------------
// server-side originals
// ---------------------------------------------------------------------------

pub struct Widget;

impl Remotable for Widget {
    fn type_name(&self) -> &str {
        WIDGET
    }

    fn dispatch(&self, call: Invocation) -> Result<Outcome> {
        match call.method {
            W_PING => Ok(Outcome::void()),
            other => Err(Error::ProxyManagement(format!(
                "widget has no method {}",
                other
            ))),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct Reckoner {
    identity: String,
    calls: AtomicU32,
    component: Arc<Widget>,
    callbacks: Mutex<Vec<Arc<dyn Remotable>>>,
    handlers: Mutex<Vec<Delegate>>,
}

impl Reckoner {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            calls: AtomicU32::new(0),
            component: Arc::new(Widget),
            callbacks: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl Remotable for Reckoner {
    fn type_name(&self) -> &str {
        RECKONER
    }

    fn dispatch(&self, mut call: Invocation) -> Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match call.method {
            M_IDENTITY => Ok(Outcome::with_ret(Argument::value(&self.identity)?)),
            M_BUMP => {
                let value: i32 = call.take(0).take()?;
                Ok(Outcome {
                    ret: None,
                    by_ref: vec![(0, Argument::value(&(value + 2))?)],
                })
            }
            M_REGISTER_CALLBACK => {
                let receiver = call.take(0).into_object()?;
                self.callbacks.lock().unwrap().push(receiver);
                Ok(Outcome::void())
            }
            M_RUN_CALLBACKS => {
                let callbacks = self.callbacks.lock().unwrap().clone();
                for receiver in callbacks {
                    receiver.dispatch(Invocation::new(CB_NOTIFY, vec![]))?;
                }
                Ok(Outcome::void())
            }
            M_ADD_ON_TICK => {
                if let Some(handler) = call.take(0).into_delegate()? {
                    self.handlers.lock().unwrap().push(handler);
                }
                Ok(Outcome::void())
            }
            M_REMOVE_ON_TICK => {
                if let Some(handler) = call.take(0).into_delegate()? {
                    let mut handlers = self.handlers.lock().unwrap();
                    if let Some(pos) = handlers.iter().position(|h| h.same_sink(&handler)) {
                        handlers.remove(pos);
                    }
                }
                Ok(Outcome::void())
            }
            M_RAISE_TICK => {
                let text: String = call.take(0).take()?;
                let handlers = self.handlers.lock().unwrap().clone();
                for handler in handlers {
                    handler.invoke(vec![Argument::value(&text)?])?;
                }
                Ok(Outcome::void())
            }
            M_ECHO => {
                let text: String = call.take(0).take()?;
                Ok(Outcome::with_ret(Argument::value(&text)?))
            }
            M_COMPONENT => Ok(Outcome::with_ret(Argument::object(self.component.clone()))),
            M_CALL_COUNT => Ok(Outcome::with_ret(Argument::value(
                &self.calls.load(Ordering::SeqCst),
            )?)),
            M_BAD_RETURN => Ok(Outcome::with_ret(Argument::value(&Unserializable)?)),
            M_OPEN_ENVELOPE => {
                let envelope: Envelope = call.take(0).take()?;
                envelope
                    .payload
                    .get()
                    .dispatch(Invocation::new(CB_NOTIFY, vec![]))?;
                Ok(Outcome::void())
            }
            other => Err(Error::ProxyManagement(format!(
                "reckoner has no method {}",
                other
            ))),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// client-side originals
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CallbackReceiver {
    pub called: AtomicBool,
}

impl Remotable for CallbackReceiver {
    fn type_name(&self) -> &str {
        CALLBACK
    }

    fn dispatch(&self, call: Invocation) -> Result<Outcome> {
        match call.method {
            CB_NOTIFY => {
                self.called.store(true, Ordering::SeqCst);
                Ok(Outcome::void())
            }
            other => Err(Error::ProxyManagement(format!(
                "receiver has no method {}",
                other
            ))),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Default)]
pub struct TickSink {
    pub seen: Mutex<Vec<String>>,
}

impl Remotable for TickSink {
    fn type_name(&self) -> &str {
        TICK_SINK
    }

    fn dispatch(&self, mut call: Invocation) -> Result<Outcome> {
        match call.method {
            SINK_ON_TICK => {
                let text: String = call.take(0).take()?;
                self.seen.lock().unwrap().push(text);
                Ok(Outcome::void())
            }
            other => Err(Error::ProxyManagement(format!(
                "sink has no method {}",
                other
            ))),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// client-side stub
// ---------------------------------------------------------------------------

pub struct ReckonerProxy {
    remote: ProxyHandle,
}

impl ReckonerProxy {
    pub fn identity(&self) -> Result<String> {
        let reply = self.remote.call(CallSpec::new(RECKONER, M_IDENTITY).returns())?;
        reply.expect_ret()?.take()
    }

    pub fn bump(&self, value: &mut i32) -> Result<()> {
        let mut reply = self.remote.call(
            CallSpec::new(RECKONER, M_BUMP).by_ref_arg(Argument::value(value)?),
        )?;
        *value = reply.by_ref.remove(0).take()?;
        Ok(())
    }

    pub fn register_callback(&self, receiver: Arc<dyn Remotable>) -> Result<()> {
        self.remote.call(
            CallSpec::new(RECKONER, M_REGISTER_CALLBACK).arg(Argument::object(receiver)),
        )?;
        Ok(())
    }

    pub fn run_callbacks(&self) -> Result<()> {
        self.remote.call(CallSpec::new(RECKONER, M_RUN_CALLBACKS))?;
        Ok(())
    }

    pub fn add_on_tick(&self, handler: Delegate) -> Result<()> {
        self.remote
            .call(CallSpec::new(RECKONER, M_ADD_ON_TICK).arg(Argument::Delegate(handler)))?;
        Ok(())
    }

    pub fn remove_on_tick(&self, handler: Delegate) -> Result<()> {
        self.remote
            .call(CallSpec::new(RECKONER, M_REMOVE_ON_TICK).arg(Argument::Delegate(handler)))?;
        Ok(())
    }

    pub fn raise_tick(&self, text: &str) -> Result<()> {
        self.remote
            .call(CallSpec::new(RECKONER, M_RAISE_TICK).arg(Argument::value(text)?))?;
        Ok(())
    }

    pub fn echo(&self, text: &str) -> Result<String> {
        let reply = self.remote.call(
            CallSpec::new(RECKONER, M_ECHO)
                .returns()
                .arg(Argument::value(text)?),
        )?;
        reply.expect_ret()?.take()
    }

    pub fn send_anything<T: Serialize>(&self, value: &T) -> Result<()> {
        self.remote.call(
            CallSpec::new(RECKONER, M_ECHO)
                .returns()
                .arg(Argument::value(value)?),
        )?;
        Ok(())
    }

    pub fn component(&self) -> Result<Arc<dyn Remotable>> {
        let reply = self
            .remote
            .call(CallSpec::new(RECKONER, M_COMPONENT).returns())?;
        reply.expect_ret()?.into_object()
    }

    pub fn call_count(&self) -> Result<u32> {
        let reply = self
            .remote
            .call(CallSpec::new(RECKONER, M_CALL_COUNT).returns())?;
        reply.expect_ret()?.take()
    }

    pub fn bad_return(&self) -> Result<String> {
        let reply = self
            .remote
            .call(CallSpec::new(RECKONER, M_BAD_RETURN).returns())?;
        reply.expect_ret()?.take()
    }

    pub fn open_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.remote.call(
            CallSpec::new(RECKONER, M_OPEN_ENVELOPE).arg(Argument::value(envelope)?),
        )?;
        Ok(())
    }
}

impl Remotable for ReckonerProxy {
    fn type_name(&self) -> &str {
        RECKONER
    }

    fn dispatch(&self, call: Invocation) -> Result<Outcome> {
        let mut spec = CallSpec::new(RECKONER, call.method);
        spec.generic_args = call.generic_args;
        spec.args = call.args;
        self.remote.call(spec)?;
        Ok(Outcome::void())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn proxy_target(&self) -> Option<&ProxyHandle> {
        Some(&self.remote)
    }
}

// ---------------------------------------------------------------------------
// registration and wiring
// ---------------------------------------------------------------------------

fn reckoner_methods(descriptor: TypeDescriptor) -> TypeDescriptor {
    descriptor
        .method(M_IDENTITY, "identity")
        .method(M_BUMP, "bump")
        .method(M_REGISTER_CALLBACK, "register_callback")
        .method(M_RUN_CALLBACKS, "run_callbacks")
        .method(M_ADD_ON_TICK, "add_on_tick")
        .method(M_REMOVE_ON_TICK, "remove_on_tick")
        .method(M_RAISE_TICK, "raise_tick")
        .method(M_ECHO, "echo")
        .method(M_COMPONENT, "component")
        .method(M_CALL_COUNT, "call_count")
        .method(M_BAD_RETURN, "bad_return")
        .method(M_OPEN_ENVELOPE, "open_envelope")
}

pub fn register_server_types(runtime: &Runtime) {
    let identity = runtime.identifier().to_string();
    runtime.types.register(
        reckoner_methods(TypeDescriptor::new(RECKONER)).default_constructor(Arc::new(
            move |_args| Ok(Arc::new(Reckoner::new(&identity)) as Arc<dyn Remotable>),
        )),
    );
    runtime.types.register(TypeDescriptor::new(WIDGET).method(W_PING, "ping"));
    // stubs for objects arriving from the calling side
    runtime
        .types
        .register(TypeDescriptor::new(CALLBACK).proxy(ForwardingProxy::factory(CALLBACK)));
    runtime
        .types
        .register(TypeDescriptor::new(TICK_SINK).proxy(ForwardingProxy::factory(TICK_SINK)));
}

pub fn register_client_types(runtime: &Runtime) {
    runtime.types.register(
        reckoner_methods(TypeDescriptor::new(RECKONER)).proxy(Arc::new(|handle| {
            Arc::new(ReckonerProxy { remote: handle }) as Arc<dyn Remotable>
        })),
    );
    runtime.types.register(
        TypeDescriptor::new(WIDGET)
            .method(W_PING, "ping")
            .proxy(ForwardingProxy::factory(WIDGET)),
    );
    // originals living on this side, dispatched to by callbacks
    runtime
        .types
        .register(TypeDescriptor::new(CALLBACK).method(CB_NOTIFY, "notify"));
    runtime
        .types
        .register(TypeDescriptor::new(TICK_SINK).method(SINK_ON_TICK, "on_tick"));
}

pub struct Loopback {
    pub server_runtime: Arc<Runtime>,
    pub client_runtime: Arc<Runtime>,
    pub server: Server,
    pub connection: Connection,
}

/// Spins up a serving runtime on a loopback port and connects a second
/// runtime to it. The two runtimes carry distinct instance identifiers,
/// the way two separate processes would.
pub fn loopback(name: &str) -> Loopback {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
    );

    let server_runtime =
        Runtime::with_identifier(InstanceIdentifier::new(&format!("{}-server", name), 1));
    let client_runtime =
        Runtime::with_identifier(InstanceIdentifier::new(&format!("{}-client", name), 2));
    register_server_types(&server_runtime);
    register_client_types(&client_runtime);
    server_runtime
        .services
        .register(Arc::new(Reckoner::new(&server_runtime.identifier().to_string())));

    let server = Server::bind("127.0.0.1:0", server_runtime.clone(), ServerConfig::default())
        .expect("failed binding test server");
    server.start().expect("failed starting accept loop");

    let connection = Connection::connect(
        &server.local_addr().to_string(),
        client_runtime.clone(),
        ClientConfig::default(),
    )
    .expect("failed connecting");

    Loopback {
        server_runtime,
        client_runtime,
        server,
        connection,
    }
}

impl Loopback {
    pub fn reckoner(&self) -> Arc<ReckonerProxy> {
        let obj = self
            .connection
            .create_remote_instance(RECKONER)
            .expect("failed creating remote instance");
        downcast::<ReckonerProxy>(obj).expect("expected a reckoner stub")
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.connection.close();
        self.server.shutdown();
    }
}

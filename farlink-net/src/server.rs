//! Acceptor and per-connection dispatcher.
//!
//! The server listens on a single address. Primary-role sockets get the
//! identifier exchange and a dispatcher of their own; reverse-role
//! sockets park in a pending map until the owning connection claims them
//! through an `OpenReverseChannel` frame and turns them into the
//! callback path. Invocations are executed on worker threads, never on
//! the reader, so a method that calls back into its originating client
//! cannot deadlock the connection.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fnv::{FnvHashMap, FnvHashSet};

use farlink_core::{
    Argument, CallChannel, CallSpec, Error, InstanceIdentifier, Invocation, ObjectId, Outcome,
    ReferenceResolver, Remotable, Result, ReturnValues, Runtime, TypeDescriptor,
};

use crate::client::{Client, ClientConfig};
use crate::codec::{FrameReader, FrameWriter, SharedWriter};
use crate::marshal::Marshaller;
use crate::msg::{
    parse_auth_token, CallHeader, Function, RemoteException, AUTH_SUCCEEDED, AUTH_TOKEN_LEN,
    ROLE_PRIMARY, ROLE_REVERSE,
};

/// Configuration settings for the server.
pub struct ServerConfig {
    /// Delay between polls for new incoming connections.
    pub accept_poll: Duration,
    /// Poll interval while waiting for a matching reverse socket.
    pub reverse_poll: Duration,
    /// Give up waiting for the reverse socket after this long. `None`
    /// waits forever.
    pub reverse_deadline: Option<Duration>,
    /// Flip the process-wide termination token when a primary channel is
    /// lost.
    pub terminate_on_disconnect: bool,
    /// Settings for the callback clients opened over reverse sockets.
    pub callback_config: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_poll: Duration::from_millis(20),
            reverse_poll: Duration::from_millis(10),
            reverse_deadline: Some(Duration::from_secs(30)),
            terminate_on_disconnect: false,
            callback_config: ClientConfig::default(),
        }
    }
}

#[derive(Clone)]
struct DispatchOptions {
    reverse_poll: Duration,
    reverse_deadline: Option<Duration>,
    terminate_on_disconnect: bool,
    callback_config: ClientConfig,
}

impl ServerConfig {
    fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            reverse_poll: self.reverse_poll,
            reverse_deadline: self.reverse_deadline,
            terminate_on_disconnect: self.terminate_on_disconnect,
            callback_config: self.callback_config.clone(),
        }
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        ServerConfig::default().dispatch_options()
    }
}

/// Connection entry point for remote peers.
pub struct Server {
    runtime: Arc<Runtime>,
    options: DispatchOptions,
    accept_poll: Duration,
    listener: TcpListener,
    address: SocketAddr,
    pending_reverse: Arc<Mutex<FnvHashMap<u32, TcpStream>>>,
    connections: Arc<Mutex<Vec<Weak<Mutex<FrameWriter<TcpStream>>>>>>,
}

impl Server {
    pub fn bind(addr: &str, runtime: Arc<Runtime>, config: ServerConfig) -> Result<Server> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        info!("listening on {}", address);
        Ok(Server {
            runtime,
            options: config.dispatch_options(),
            accept_poll: config.accept_poll,
            listener,
            address,
            pending_reverse: Arc::new(Mutex::new(FnvHashMap::default())),
            connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Starts the accept loop on its own thread. Incoming connections are
    /// each served by a dedicated reader; the loop winds down when the
    /// termination token flips.
    pub fn start(&self) -> Result<()> {
        let listener = self.listener.try_clone()?;
        let runtime = self.runtime.clone();
        let options = self.options.clone();
        let accept_poll = self.accept_poll;
        let pending_reverse = self.pending_reverse.clone();
        let connections = self.connections.clone();
        thread::Builder::new()
            .name("farlink-accept".to_string())
            .spawn(move || loop {
                if !runtime.is_running() {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer_addr)) => {
                        debug!("incoming connection from {}", peer_addr);
                        let runtime = runtime.clone();
                        let options = options.clone();
                        let pending_reverse = pending_reverse.clone();
                        let connections = connections.clone();
                        let spawned = thread::Builder::new()
                            .name("farlink-handshake".to_string())
                            .spawn(move || {
                                if let Err(e) = handle_incoming(
                                    stream,
                                    runtime,
                                    options,
                                    pending_reverse,
                                    connections,
                                ) {
                                    warn!("connection from {} failed: {}", peer_addr, e);
                                }
                            });
                        if let Err(e) = spawned {
                            error!("failed spawning handshake thread: {}", e);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(accept_poll),
                    Err(e) => {
                        error!("accept failed: {}", e);
                        break;
                    }
                }
            })?;
        Ok(())
    }

    /// Announces shutdown to every live peer and flips the process-wide
    /// termination token.
    pub fn shutdown(&self) {
        let mut connections = self.connections.lock().unwrap();
        for weak in connections.drain(..) {
            if let Some(writer) = weak.upgrade() {
                let mut w = writer.lock().unwrap();
                let _ = CallHeader::new(Function::ServerShuttingDown, 0).write(&mut w);
                let _ = w.flush();
            }
        }
        drop(connections);
        self.runtime.shutdown();
    }
}

fn handle_incoming(
    stream: TcpStream,
    runtime: Arc<Runtime>,
    options: DispatchOptions,
    pending_reverse: Arc<Mutex<FnvHashMap<u32, TcpStream>>>,
    connections: Arc<Mutex<Vec<Weak<Mutex<FrameWriter<TcpStream>>>>>>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let mut reader = FrameReader::new(stream.try_clone()?);
    let mut token = [0u8; AUTH_TOKEN_LEN];
    reader.read_raw(&mut token)?;
    let (role, connection_id) = parse_auth_token(&token);

    match role {
        ROLE_PRIMARY => {
            let peer: InstanceIdentifier = reader.read_str()?.parse()?;
            {
                let mut writer = FrameWriter::new(stream.try_clone()?);
                writer.write_i32(AUTH_SUCCEEDED)?;
                writer.write_str(&runtime.identifier().to_string())?;
                writer.flush()?;
            }
            info!("peer {} connected (connection {:#x})", peer, connection_id);

            let writer = SharedWriter::new(stream.try_clone()?);
            connections.lock().unwrap().push(writer.downgrade());

            let callback = Arc::new(LazyChannel::new());
            let channel: Arc<dyn CallChannel> = callback.clone();
            let marshaller = Marshaller::new(runtime.clone(), Arc::downgrade(&channel));
            callback.bind_resolver(&marshaller);

            let dispatcher = Arc::new(Dispatcher {
                runtime,
                peer,
                writer,
                marshaller,
                callback,
                pending_reverse: Some(pending_reverse),
                assemblies: Mutex::new(FnvHashSet::default()),
                options,
            });
            dispatcher.run(reader);
            Ok(())
        }
        ROLE_REVERSE => {
            debug!("parking reverse socket for connection {:#x}", connection_id);
            pending_reverse.lock().unwrap().insert(connection_id, stream);
            Ok(())
        }
        other => Err(Error::Protocol(format!("unknown channel role: {}", other))),
    }
}

/// Starts the embedded dispatcher an initiator runs over its reverse
/// stream, sharing the primary client's marshaller so delegate
/// registrations and proxies agree across both streams.
pub(crate) fn spawn_reverse_dispatcher(
    runtime: Arc<Runtime>,
    peer: InstanceIdentifier,
    stream: TcpStream,
    client: Arc<Client>,
) -> Result<()> {
    let writer = SharedWriter::new(stream.try_clone()?);
    let reader = FrameReader::new(stream);
    let callback = Arc::new(LazyChannel::new());
    callback.set_client(client.clone());
    let marshaller = client.marshaller();
    callback.bind_resolver(&marshaller);

    let dispatcher = Arc::new(Dispatcher {
        runtime,
        peer,
        writer,
        marshaller,
        callback,
        pending_reverse: None,
        assemblies: Mutex::new(FnvHashSet::default()),
        options: DispatchOptions::default(),
    });
    thread::Builder::new()
        .name("farlink-reverse".to_string())
        .spawn(move || dispatcher.run(reader))?;
    Ok(())
}

/// Callback channel slot, empty until the reverse socket is claimed.
pub(crate) struct LazyChannel {
    client: OnceLock<Arc<Client>>,
    resolver: OnceLock<Weak<Marshaller>>,
}

impl LazyChannel {
    fn new() -> Self {
        Self {
            client: OnceLock::new(),
            resolver: OnceLock::new(),
        }
    }

    fn bind_resolver(&self, marshaller: &Arc<Marshaller>) {
        let _ = self.resolver.set(Arc::downgrade(marshaller));
    }

    fn set_client(&self, client: Arc<Client>) {
        let _ = self.client.set(client);
    }

    fn client(&self) -> Option<Arc<Client>> {
        self.client.get().cloned()
    }

    fn active(&self) -> Result<Arc<Client>> {
        self.client().ok_or(Error::ConnectionLost)
    }
}

impl CallChannel for LazyChannel {
    fn call(&self, target: &ObjectId, spec: CallSpec) -> Result<ReturnValues> {
        self.active()?.call(target, spec)
    }

    fn create_instance(
        &self,
        type_name: &str,
        args: Vec<Argument>,
    ) -> Result<Arc<dyn Remotable>> {
        self.active()?.create_instance(type_name, args)
    }

    fn create_instance_default(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        self.active()?.create_instance_default(type_name)
    }

    fn request_service(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        self.active()?.request_service(type_name)
    }

    fn resolver(&self) -> Arc<dyn ReferenceResolver> {
        match self.resolver.get().and_then(Weak::upgrade) {
            Some(marshaller) => marshaller,
            None => Arc::new(DeadResolver),
        }
    }
}

struct DeadResolver;

impl ReferenceResolver for DeadResolver {
    fn resolve(&self, _id: &ObjectId, _type_name: &str) -> Result<Arc<dyn Remotable>> {
        Err(Error::ConnectionLost)
    }
}

struct Dispatcher {
    runtime: Arc<Runtime>,
    peer: InstanceIdentifier,
    writer: SharedWriter,
    marshaller: Arc<Marshaller>,
    callback: Arc<LazyChannel>,
    pending_reverse: Option<Arc<Mutex<FnvHashMap<u32, TcpStream>>>>,
    assemblies: Mutex<FnvHashSet<String>>,
    options: DispatchOptions,
}

impl Dispatcher {
    fn run(self: Arc<Self>, mut reader: FrameReader<TcpStream>) {
        match Self::read_requests(&self, &mut reader) {
            Ok(()) => info!("connection to {} closed", self.peer),
            Err(Error::Io(e)) => debug!("request stream from {} ended: {}", self.peer, e),
            Err(e) => warn!("connection to {} torn down: {}", self.peer, e),
        }
        self.marshaller.clear_delegates();
        if let Some(callback) = self.callback.client() {
            callback.shutdown_channel();
        }
        if self.options.terminate_on_disconnect {
            self.runtime.shutdown();
        }
    }

    fn read_requests(this: &Arc<Self>, reader: &mut FrameReader<TcpStream>) -> Result<()> {
        loop {
            let header = CallHeader::read(reader)?;
            trace!("frame {:?} seq {}", header.function, header.sequence);
            match header.function {
                Function::OpenReverseChannel => this.handle_open_reverse(reader)?,
                Function::ClientDisconnecting => {
                    let peer = reader.read_str()?;
                    info!("peer {} disconnecting", peer);
                    return Ok(());
                }
                Function::LoadClientAssemblyIntoServer => {
                    let name = reader.read_str()?;
                    debug!("peer announced assembly {}", name);
                    this.assemblies.lock().unwrap().insert(name);
                }
                Function::GcCleanup => {
                    let count = reader.read_i32()?;
                    debug!("cleanup notice for {} object(s)", count);
                    for _ in 0..count {
                        let id: ObjectId = reader.read_str()?.parse()?;
                        this.runtime.instances.remove(&id);
                    }
                }
                Function::ShutdownServer => {
                    info!("peer {} requested shutdown", this.peer);
                    this.runtime.shutdown();
                    let mut writer = this.writer.lock();
                    let _ = CallHeader::new(Function::ServerShuttingDown, 0).write(&mut writer);
                    let _ = writer.flush();
                    return Ok(());
                }
                Function::MethodCall
                | Function::CreateInstance
                | Function::CreateInstanceWithDefaultCtor
                | Function::RequestServiceReference => {
                    Self::handle_invocation(this, header, reader)?;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected function on request stream: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Claims the pre-accepted companion socket carrying the same
    /// connection identifier and turns it into the callback channel.
    fn handle_open_reverse(&self, reader: &mut FrameReader<TcpStream>) -> Result<()> {
        let _ip = reader.read_str()?;
        let _port = reader.read_i32()?;
        let peer: InstanceIdentifier = reader.read_str()?.parse()?;
        let connection_id = reader.read_i32()? as u32;

        let pending = self.pending_reverse.as_ref().ok_or_else(|| {
            Error::Protocol("reverse channel requested on a reverse stream".to_string())
        })?;

        let started = Instant::now();
        let stream = loop {
            if let Some(stream) = pending.lock().unwrap().remove(&connection_id) {
                break stream;
            }
            if let Some(deadline) = self.options.reverse_deadline {
                if started.elapsed() > deadline {
                    return Err(Error::Protocol(format!(
                        "reverse socket for connection {:#x} never arrived",
                        connection_id
                    )));
                }
            }
            if !self.runtime.is_running() {
                return Err(Error::ConnectionLost);
            }
            thread::sleep(self.options.reverse_poll);
        };

        let client = Client::start(
            self.runtime.clone(),
            peer.clone(),
            stream,
            Some(self.marshaller.clone()),
            &self.options.callback_config,
        )?;
        self.callback.set_client(client);
        info!("callback channel to {} established", peer);
        Ok(())
    }

    /// Reads one invocation frame and hands execution to a worker thread.
    /// Arguments are decoded here in full regardless of whether the
    /// target resolves, to keep the stream framed.
    fn handle_invocation(
        this: &Arc<Self>,
        header: CallHeader,
        reader: &mut FrameReader<TcpStream>,
    ) -> Result<()> {
        let target_raw = reader.read_str()?;
        let declaring = reader.read_str()?;
        let method = reader.read_i32()?;
        let generic_count = reader.read_i32()?;
        let mut generic_args = Vec::with_capacity(generic_count.max(0) as usize);
        for _ in 0..generic_count {
            generic_args.push(reader.read_str()?);
        }

        let target: Option<ObjectId> = if target_raw.is_empty() {
            None
        } else {
            Some(target_raw.parse()?)
        };
        let instance = target
            .as_ref()
            .and_then(|id| this.runtime.instances.try_get(id));

        let descriptor = match header.function {
            Function::MethodCall => {
                let name = if declaring.is_empty() {
                    instance.as_ref().map(|i| i.type_name().to_string())
                } else {
                    Some(declaring.clone())
                };
                name.and_then(|n| this.runtime.types.get(&n))
            }
            _ => this.runtime.types.get(&declaring),
        };
        let calling_method = descriptor
            .as_ref()
            .and_then(|d| d.method_name(method))
            .map(str::to_string);

        let arg_count = reader.read_i32()?;
        let mut args = Vec::with_capacity(arg_count.max(0) as usize);
        for _ in 0..arg_count {
            args.push(
                this.marshaller
                    .read_argument(reader, calling_method.as_deref(), None)?,
            );
        }

        let dispatcher = this.clone();
        thread::Builder::new()
            .name("farlink-worker".to_string())
            .spawn(move || {
                let result = dispatcher.invoke(
                    header.function,
                    target,
                    instance,
                    descriptor,
                    declaring,
                    method,
                    generic_args,
                    args,
                );
                dispatcher.send_reply(header.sequence, result);
            })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        function: Function,
        target: Option<ObjectId>,
        instance: Option<Arc<dyn Remotable>>,
        descriptor: Option<Arc<TypeDescriptor>>,
        declaring: String,
        method: i32,
        generic_args: Vec<String>,
        args: Vec<Argument>,
    ) -> Result<Outcome> {
        match function {
            Function::MethodCall => {
                let id = target
                    .ok_or_else(|| Error::Protocol("method call without a target id".to_string()))?;
                let instance = instance.ok_or_else(|| {
                    Error::ProxyManagement(format!("no instance registered under {}", id))
                })?;
                let descriptor = descriptor.ok_or_else(|| {
                    Error::ProxyManagement(format!(
                        "type {} is not registered",
                        if declaring.is_empty() {
                            instance.type_name()
                        } else {
                            declaring.as_str()
                        }
                    ))
                })?;
                if descriptor.method_name(method).is_none() {
                    return Err(Error::ProxyManagement(format!(
                        "type {} has no method with token {}",
                        descriptor.name, method
                    )));
                }
                let _scope = self.marshaller.enter_scope();
                let mut call = Invocation::new(method, args);
                call.generic_args = generic_args;
                instance.dispatch(call)
            }
            Function::CreateInstance | Function::CreateInstanceWithDefaultCtor => {
                let descriptor = descriptor.ok_or_else(|| {
                    Error::ProxyManagement(format!("type {} is not registered", declaring))
                })?;
                let _scope = self.marshaller.enter_scope();
                let obj = descriptor
                    .construct(args, function == Function::CreateInstanceWithDefaultCtor)?;
                Ok(Outcome::with_ret(Argument::object(obj)))
            }
            Function::RequestServiceReference => {
                let service = self.runtime.services.get(&declaring).ok_or_else(|| {
                    Error::ProxyManagement(format!(
                        "no well-known service registered for {}",
                        declaring
                    ))
                })?;
                Ok(Outcome::with_ret(Argument::object(service)))
            }
            other => Err(Error::Protocol(format!(
                "function {:?} is not an invocation",
                other
            ))),
        }
    }

    fn send_reply(&self, sequence: u32, result: Result<Outcome>) {
        let frame = match &result {
            Ok(outcome) => self.encode_reply(sequence, outcome),
            Err(e) => {
                debug!("invocation seq {} failed: {}", sequence, e);
                self.encode_exception(sequence, e)
            }
        };
        // a reply that itself fails to serialize is replaced wholesale by
        // an exception frame; the staged buffer is simply discarded
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => match self.encode_exception(sequence, &e) {
                Ok(frame) => frame,
                Err(e2) => {
                    error!("failed encoding exception reply: {}", e2);
                    return;
                }
            },
        };
        let mut writer = self.writer.lock();
        if writer.write_raw(&frame).and_then(|_| writer.flush()).is_err() {
            warn!("failed writing reply for sequence {}", sequence);
        }
    }

    fn encode_reply(&self, sequence: u32, outcome: &Outcome) -> Result<Vec<u8>> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::MethodReply, sequence).write(&mut frame)?;
        if let Some(ret) = &outcome.ret {
            self.marshaller.write_argument(&mut frame, ret)?;
        }
        let mut by_ref: Vec<&(usize, Argument)> = outcome.by_ref.iter().collect();
        by_ref.sort_by_key(|(index, _)| *index);
        for (_, arg) in by_ref {
            self.marshaller.write_argument(&mut frame, arg)?;
        }
        Ok(frame.into_inner())
    }

    fn encode_exception(&self, sequence: u32, err: &Error) -> Result<Vec<u8>> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::ExceptionReturn, sequence).write(&mut frame)?;
        let payload = bincode::serialize(&RemoteException::from_error(err))
            .map_err(|e| Error::SerializationFailure(e.to_string()))?;
        frame.write_bytes(&payload)?;
        Ok(frame.into_inner())
    }
}

//! Per-peer call client and the initiator side of connection setup.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use fnv::FnvHashMap;

use farlink_core::{
    Argument, CallChannel, CallSpec, Error, InstanceIdentifier, ObjectId, ReferenceResolver,
    Remotable, Result, ReturnValues, Runtime,
};

use crate::codec::{FrameReader, FrameWriter, SharedWriter};
use crate::marshal::Marshaller;
use crate::msg::{
    auth_token, connection_identifier, CallHeader, Function, RemoteException, AUTH_SUCCEEDED,
    ROLE_PRIMARY, ROLE_REVERSE,
};

#[derive(Clone)]
pub struct ClientConfig {
    /// How often blocked call sites re-check the termination token.
    pub reply_poll: Duration,
    /// Interval for the sweeper that reports released proxies to the
    /// peer. `None` leaves collection entirely to explicit calls.
    pub gc_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_poll: Duration::from_millis(50),
            gc_interval: None,
        }
    }
}

struct PendingCall {
    wants_return: bool,
    by_ref: usize,
    tx: Sender<Result<ReturnValues>>,
}

/// Outbound half of one connection: turns intercepted proxy calls into
/// sequenced request frames and parks the caller until the matching reply
/// arrives. Replies may come back in any order; correlation is solely by
/// sequence number.
pub struct Client {
    runtime: Arc<Runtime>,
    peer: InstanceIdentifier,
    writer: SharedWriter,
    sequence: AtomicU32,
    pending: Mutex<FnvHashMap<u32, PendingCall>>,
    marshaller: OnceLock<Arc<Marshaller>>,
    alive: Arc<AtomicBool>,
    reply_poll: Duration,
}

impl Client {
    /// Starts a call client over an established stream, spawning the
    /// reply reader and, when configured, the release sweeper. Passing an
    /// existing marshaller shares the delegate table with a dispatcher
    /// reading the companion stream.
    pub fn start(
        runtime: Arc<Runtime>,
        peer: InstanceIdentifier,
        stream: TcpStream,
        marshaller: Option<Arc<Marshaller>>,
        config: &ClientConfig,
    ) -> Result<Arc<Client>> {
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        let client = Arc::new(Client {
            runtime: runtime.clone(),
            peer,
            writer: SharedWriter::new(stream),
            sequence: AtomicU32::new(0),
            pending: Mutex::new(FnvHashMap::default()),
            marshaller: OnceLock::new(),
            alive: Arc::new(AtomicBool::new(true)),
            reply_poll: config.reply_poll,
        });

        let marshaller = match marshaller {
            Some(m) => m,
            None => {
                let channel: Arc<dyn CallChannel> = client.clone();
                Marshaller::new(runtime, Arc::downgrade(&channel))
            }
        };
        let _ = client.marshaller.set(marshaller);

        let reader = client.clone();
        thread::Builder::new()
            .name("farlink-replies".to_string())
            .spawn(move || reader.read_replies(read_stream))?;

        if let Some(interval) = config.gc_interval {
            let sweeper = client.clone();
            thread::Builder::new()
                .name("farlink-sweeper".to_string())
                .spawn(move || loop {
                    thread::sleep(interval);
                    if !sweeper.is_alive() || !sweeper.runtime.is_running() {
                        break;
                    }
                    if let Err(e) = sweeper.collect_garbage() {
                        warn!("release sweep failed: {}", e);
                        break;
                    }
                })?;
        }

        Ok(client)
    }

    pub fn peer(&self) -> &InstanceIdentifier {
        &self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn marshaller(&self) -> Arc<Marshaller> {
        self.marshaller.get().unwrap().clone()
    }

    /// Fails every pending call with a connection-lost error and marks
    /// the channel dead. Idempotent.
    pub fn shutdown_channel(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let mut pending = self.pending.lock().unwrap();
            for (_, slot) in pending.drain() {
                let _ = slot.tx.send(Err(Error::ConnectionLost));
            }
        }
    }

    fn read_replies(self: Arc<Self>, stream: TcpStream) {
        let mut reader = FrameReader::new(stream);
        loop {
            let header = match CallHeader::read(&mut reader) {
                Ok(header) => header,
                Err(e) => {
                    if self.is_alive() {
                        debug!("reply stream to {} closed: {}", self.peer, e);
                    }
                    break;
                }
            };
            match header.function {
                Function::MethodReply => {
                    let slot = self.pending.lock().unwrap().remove(&header.sequence);
                    match slot {
                        Some(slot) => {
                            let result = self.decode_reply(&mut reader, &slot);
                            // a decode failure leaves the stream desynced
                            let desynced = result.is_err();
                            let _ = slot.tx.send(result);
                            if desynced {
                                break;
                            }
                        }
                        None => {
                            // without the call shape the frame cannot even
                            // be skipped
                            error!("reply for unknown sequence {}", header.sequence);
                            break;
                        }
                    }
                }
                Function::ExceptionReturn => {
                    let payload = match reader.read_bytes() {
                        Ok(bytes) => bytes,
                        Err(_) => break,
                    };
                    let err = match bincode::deserialize::<RemoteException>(&payload) {
                        Ok(exception) => exception.into_error(),
                        Err(e) => Error::SerializationFailure(e.to_string()),
                    };
                    if let Some(slot) = self.pending.lock().unwrap().remove(&header.sequence) {
                        let _ = slot.tx.send(Err(err));
                    }
                }
                Function::ServerShuttingDown => {
                    info!("peer {} announced shutdown", self.peer);
                    break;
                }
                other => {
                    error!("unexpected function on reply stream: {:?}", other);
                    break;
                }
            }
        }
        self.shutdown_channel();
    }

    fn decode_reply<R: std::io::Read>(
        &self,
        reader: &mut FrameReader<R>,
        slot: &PendingCall,
    ) -> Result<ReturnValues> {
        let marshaller = self.marshaller();
        let ret = if slot.wants_return {
            Some(marshaller.read_argument(reader, None, None)?)
        } else {
            None
        };
        let mut by_ref = Vec::with_capacity(slot.by_ref);
        for _ in 0..slot.by_ref {
            by_ref.push(marshaller.read_argument(reader, None, None)?);
        }
        Ok(ReturnValues { ret, by_ref })
    }

    fn send_request(
        &self,
        function: Function,
        target: &str,
        spec: &CallSpec,
    ) -> Result<Receiver<Result<ReturnValues>>> {
        if !self.is_alive() {
            return Err(Error::ConnectionLost);
        }
        let marshaller = self.marshaller();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        // stage the whole frame first; a marshalling error must not leave
        // half a frame on the wire
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(function, seq).write(&mut frame)?;
        frame.write_str(target)?;
        frame.write_str(&spec.declaring_type)?;
        frame.write_i32(spec.method)?;
        frame.write_i32(spec.generic_args.len() as i32)?;
        for name in &spec.generic_args {
            frame.write_str(name)?;
        }
        frame.write_i32(spec.args.len() as i32)?;
        for arg in &spec.args {
            marshaller.write_argument(&mut frame, arg)?;
        }
        let frame = frame.into_inner();

        let (tx, rx) = channel();
        self.pending.lock().unwrap().insert(
            seq,
            PendingCall {
                wants_return: spec.wants_return,
                by_ref: spec.by_ref.len(),
                tx,
            },
        );
        trace!("request seq {} ({:?}) to {}", seq, function, self.peer);
        if let Err(e) = self.write_frame(&frame) {
            self.pending.lock().unwrap().remove(&seq);
            return Err(e);
        }
        Ok(rx)
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.write_raw(frame).and_then(|_| writer.flush()).is_err() {
            drop(writer);
            self.shutdown_channel();
            return Err(Error::ConnectionLost);
        }
        Ok(())
    }

    fn wait_reply(&self, rx: Receiver<Result<ReturnValues>>) -> Result<ReturnValues> {
        loop {
            match rx.recv_timeout(self.reply_poll) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.runtime.is_running() || !self.is_alive() {
                        return Err(Error::ConnectionLost);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ConnectionLost),
            }
        }
    }

    /// Sweeps proxies of this peer's objects and ships the released ids
    /// as a single cleanup notice.
    pub fn collect_garbage(&self) -> Result<()> {
        let released = self.runtime.instances.collect_released(&self.peer);
        if released.is_empty() {
            return Ok(());
        }
        info!(
            "reporting {} released object(s) to {}",
            released.len(),
            self.peer
        );
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::GcCleanup, 0).write(&mut frame)?;
        frame.write_i32(released.len() as i32)?;
        for id in &released {
            frame.write_str(id.as_str())?;
        }
        self.write_frame(&frame.into_inner())
    }

    /// Announces an orderly disconnect to the peer.
    pub fn notify_disconnecting(&self) -> Result<()> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::ClientDisconnecting, 0).write(&mut frame)?;
        frame.write_str(&self.runtime.identifier().to_string())?;
        self.write_frame(&frame.into_inner())
    }

    /// Asks the peer process to terminate.
    pub fn send_shutdown_server(&self) -> Result<()> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::ShutdownServer, 0).write(&mut frame)?;
        self.write_frame(&frame.into_inner())
    }

    /// Announces a type-resolution hint; the peer caches the name.
    pub fn announce_assembly(&self, name: &str) -> Result<()> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::LoadClientAssemblyIntoServer, 0).write(&mut frame)?;
        frame.write_str(name)?;
        self.write_frame(&frame.into_inner())
    }

    fn send_open_reverse_channel(
        &self,
        ip: &str,
        port: u16,
        instance_id: &str,
        connection_id: u32,
    ) -> Result<()> {
        let mut frame = FrameWriter::new(Vec::new());
        CallHeader::new(Function::OpenReverseChannel, 0).write(&mut frame)?;
        frame.write_str(ip)?;
        frame.write_i32(port as i32)?;
        frame.write_str(instance_id)?;
        frame.write_i32(connection_id as i32)?;
        self.write_frame(&frame.into_inner())
    }
}

impl CallChannel for Client {
    fn call(&self, target: &ObjectId, spec: CallSpec) -> Result<ReturnValues> {
        let rx = self.send_request(Function::MethodCall, target.as_str(), &spec)?;
        self.wait_reply(rx)
    }

    fn create_instance(
        &self,
        type_name: &str,
        args: Vec<Argument>,
    ) -> Result<Arc<dyn Remotable>> {
        let mut spec = CallSpec::new(type_name, 0).returns();
        spec.args = args;
        let rx = self.send_request(Function::CreateInstance, "", &spec)?;
        self.wait_reply(rx)?.expect_ret()?.into_object()
    }

    fn create_instance_default(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        let spec = CallSpec::new(type_name, 0).returns();
        let rx = self.send_request(Function::CreateInstanceWithDefaultCtor, "", &spec)?;
        self.wait_reply(rx)?.expect_ret()?.into_object()
    }

    fn request_service(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        let spec = CallSpec::new(type_name, 0).returns();
        let rx = self.send_request(Function::RequestServiceReference, "", &spec)?;
        self.wait_reply(rx)?.expect_ret()?.into_object()
    }

    fn resolver(&self) -> Arc<dyn ReferenceResolver> {
        self.marshaller()
    }
}

/// One established remoting connection, initiator side: the primary
/// channel for outgoing calls plus the embedded dispatcher serving
/// callbacks on the reverse stream.
pub struct Connection {
    runtime: Arc<Runtime>,
    client: Arc<Client>,
    peer: InstanceIdentifier,
}

impl Connection {
    /// Dials a listening peer and performs the full dual-stream setup:
    /// authenticate and exchange identifiers on the primary stream, open
    /// the companion stream under the same connection identifier, then
    /// announce it so the peer can route callbacks this way.
    pub fn connect(addr: &str, runtime: Arc<Runtime>, config: ClientConfig) -> Result<Connection> {
        let own_id = runtime.identifier().to_string();
        let connection_id = connection_identifier(&own_id);

        info!("dialing peer at {}", addr);
        let primary = TcpStream::connect(addr)?;
        primary.set_nodelay(true)?;
        {
            let mut writer = FrameWriter::new(primary.try_clone()?);
            writer.write_raw(&auth_token(ROLE_PRIMARY, connection_id))?;
            writer.write_str(&own_id)?;
            writer.flush()?;
        }
        let peer: InstanceIdentifier = {
            let mut reader = FrameReader::new(primary.try_clone()?);
            let ack = reader.read_i32()?;
            if ack != AUTH_SUCCEEDED {
                return Err(Error::Protocol(format!(
                    "authentication rejected: {:#x}",
                    ack
                )));
            }
            reader.read_str()?.parse()?
        };
        info!("connected to peer {}", peer);

        // companion stream for callbacks flowing toward us
        let reverse = TcpStream::connect(addr)?;
        reverse.set_nodelay(true)?;
        {
            let mut writer = FrameWriter::new(reverse.try_clone()?);
            writer.write_raw(&auth_token(ROLE_REVERSE, connection_id))?;
            writer.flush()?;
        }
        let reverse_addr = reverse.local_addr()?;

        let client = Client::start(runtime.clone(), peer.clone(), primary, None, &config)?;
        client.send_open_reverse_channel(
            &reverse_addr.ip().to_string(),
            reverse_addr.port(),
            &own_id,
            connection_id,
        )?;

        // embedded dispatcher, so the peer can invoke callbacks on
        // objects owned here
        crate::server::spawn_reverse_dispatcher(
            runtime.clone(),
            peer.clone(),
            reverse,
            client.clone(),
        )?;

        Ok(Connection {
            runtime,
            client,
            peer,
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn peer(&self) -> &InstanceIdentifier {
        &self.peer
    }

    pub fn create_remote_instance(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        self.client.create_instance_default(type_name)
    }

    pub fn create_remote_instance_with(
        &self,
        type_name: &str,
        args: Vec<Argument>,
    ) -> Result<Arc<dyn Remotable>> {
        self.client.create_instance(type_name, args)
    }

    pub fn get_service(&self, type_name: &str) -> Result<Arc<dyn Remotable>> {
        self.client.request_service(type_name)
    }

    pub fn collect_garbage(&self) -> Result<()> {
        self.client.collect_garbage()
    }

    /// Announces the disconnect and fails anything still pending.
    pub fn close(&self) {
        if self.client.is_alive() {
            let _ = self.client.notify_disconnecting();
            self.client.shutdown_channel();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

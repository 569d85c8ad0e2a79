use crate::config::{ServerConfig, ServiceProtocolConfig};
use crate::engine::{Endpoint, EndpointHandler, EndpointId, Engine};
use crate::error::{Error, Result};
use crate::frame::{ClientToServer, ServerToClient};
use crate::logging::{debug, o, trace, Logger};
use crate::timer::{Due, OwnerTag};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Identity of the process behind an accepted connection, as reported by
/// the transport's peer-credentials mechanism. Transports without that
/// mechanism report uid and gid as zero.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientIdentity {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Per-connection user object handling a session's messages; an
/// alternative to the server-wide callbacks.
pub trait ConnectionHandler: Send + Sync {
    /// A fire-and-forget message arrived. An error drops the connection.
    fn on_message(&self, connection: &ServerConnection, message: &[u8]) -> Result<()>;
    /// A reply-bearing message arrived; the handler is expected to call
    /// `reply` at some point. An error drops the connection.
    fn on_message_with_reply(&self, connection: &ServerConnection, message: &[u8]) -> Result<()>;
    /// The session ended.
    fn on_disconnect(&self, connection: &ServerConnection);
}

/// Session state chosen by the connect callback: an opaque tag dispatched
/// through the server-wide callbacks, or an owned per-connection handler.
pub enum UserData {
    Tag(u64),
    Handler(Box<dyn ConnectionHandler>),
}

#[derive(Clone)]
struct ServerCallbacks {
    connect: Arc<dyn Fn(&ServerConnection) -> Result<UserData> + Send + Sync>,
    disconnect: Arc<dyn Fn(&ServerConnection) + Send + Sync>,
    sent: Arc<dyn Fn(&ServerConnection, &[u8]) -> Result<()> + Send + Sync>,
    sent_with_reply: Arc<dyn Fn(&ServerConnection, &[u8]) -> Result<()> + Send + Sync>,
}

struct ServerShared {
    engine: Arc<Engine>,
    log: Logger,
    service_name: String,
    max_request_size: usize,
    max_reply_size: usize,
    max_notify_size: usize,
    server_config: ServerConfig,
    listener_fd: AtomicI32,
    callbacks: Mutex<Option<ServerCallbacks>>,
}

/// Server side of the IPC channel: listens under an identifier and runs
/// one `ServerConnection` per accepted client session. All callbacks of
/// one session are serialized on the engine thread.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(
        engine: Arc<Engine>,
        protocol_config: &ServiceProtocolConfig,
        server_config: ServerConfig,
    ) -> Result<Server> {
        protocol_config.validate()?;
        server_config.validate()?;
        let service_name = protocol_config.service_name()?.to_string();

        let log = engine
            .logger()
            .new(o!("context" => "server", "service" => service_name.clone()));

        Ok(Server {
            shared: Arc::new(ServerShared {
                engine,
                log,
                service_name,
                max_request_size: protocol_config.max_send_size as usize,
                max_reply_size: protocol_config.max_reply_size as usize,
                max_notify_size: protocol_config.max_notify_size as usize,
                server_config,
                listener_fd: AtomicI32::new(-1),
                callbacks: Mutex::new(None),
            }),
        })
    }

    /// Creates the listening endpoint under the service identifier.
    ///
    /// The connect callback decides the fate of each accepted connection:
    /// `Ok(UserData)` accepts it, an error rejects it and closes the
    /// session immediately. The remaining callbacks serve connections
    /// whose user data is not an owned handler.
    pub fn start_listening<C, D, M, R>(
        &self,
        connect_callback: C,
        disconnect_callback: D,
        sent_callback: M,
        sent_with_reply_callback: R,
    ) -> Result<()>
    where
        C: Fn(&ServerConnection) -> Result<UserData> + Send + Sync + 'static,
        D: Fn(&ServerConnection) + Send + Sync + 'static,
        M: Fn(&ServerConnection, &[u8]) -> Result<()> + Send + Sync + 'static,
        R: Fn(&ServerConnection, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        let shared = &self.shared;
        *shared.callbacks.lock().unwrap() = Some(ServerCallbacks {
            connect: Arc::new(connect_callback),
            disconnect: Arc::new(disconnect_callback),
            sent: Arc::new(sent_callback),
            sent_with_reply: Arc::new(sent_with_reply_callback),
        });

        let fd = shared.engine.create_listener(&shared.service_name)?;
        shared.listener_fd.store(fd, Ordering::Release);
        debug!(shared.log, "listening"; "fd" => fd);

        let registering = shared.clone();
        shared.engine.enqueue_command(
            Due::Immediate,
            Box::new(move |_| {
                registering.engine.register_posix_endpoint(Endpoint {
                    owner: registering.owner_tag(),
                    fd,
                    max_receive_size: 0,
                    handler: Arc::new(ListenerHandler {
                        server: registering.clone(),
                    }),
                });
            }),
            shared.owner_tag(),
        );

        Ok(())
    }

    /// Drops the listening endpoint and every live connection, blocking
    /// until all per-server callbacks have finished. Must not be called
    /// from one of those callbacks' own stack frames off the engine
    /// thread.
    pub fn stop_listening(&self) {
        let fd = self.shared.listener_fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return;
        }

        self.shared.engine.clean_up_owner(self.shared.owner_tag());
        self.shared.engine.close_descriptor(fd);
        *self.shared.callbacks.lock().unwrap() = None;
        debug!(self.shared.log, "stopped listening");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

impl ServerShared {
    #[inline]
    fn owner_tag(&self) -> OwnerTag {
        OwnerTag::from_addr(self as *const ServerShared)
    }

    fn process_connect(server: &Arc<ServerShared>) {
        let listener_fd = server.listener_fd.load(Ordering::Acquire);
        if listener_fd < 0 {
            return;
        }

        let fd = match server.engine.accept_client(listener_fd) {
            Ok(fd) => fd,
            Err(error) => {
                trace!(server.log, "accept failed"; "error" => ?error);
                return;
            }
        };

        let cred = match server.engine.peer_credentials(fd) {
            Ok(cred) => cred,
            Err(error) => {
                debug!(server.log, "peer credentials unavailable"; "error" => ?error);
                server.engine.close_descriptor(fd);
                return;
            }
        };

        let connection = Arc::new(ServerConnection {
            server: server.clone(),
            log: server.log.new(o!("peer_pid" => cred.pid)),
            identity: ClientIdentity {
                pid: cred.pid,
                uid: cred.uid,
                gid: cred.gid,
            },
            fd,
            user_data: OnceLock::new(),
            endpoint_id: Mutex::new(None),
            weak_self: OnceLock::new(),
            outbound: Mutex::new(Outbound::with_limits(
                server.max_reply_size,
                server.max_notify_size,
                server.server_config.max_queued_notifies as usize,
            )),
        });
        drop(connection.weak_self.set(Arc::downgrade(&connection)));

        let connect = match server.callbacks.lock().unwrap().as_ref().map(|callbacks| callbacks.connect.clone()) {
            Some(connect) => connect,
            None => return,
        };

        match (*connect)(&connection) {
            Ok(user_data) => {
                if connection.user_data.set(user_data).is_err() {
                    unreachable!();
                }
                debug!(connection.log, "connection accepted"; "fd" => fd);
                // The endpoint table holds the reference keeping the
                // session alive; unregistration releases it.
                let id = server.engine.register_posix_endpoint(Endpoint {
                    owner: server.owner_tag(),
                    fd,
                    max_receive_size: server.max_request_size,
                    handler: connection.clone(),
                });
                *connection.endpoint_id.lock().unwrap() = Some(id);
            }
            Err(error) => {
                // Dropping the rejected connection closes its descriptor;
                // the disconnect callback is skipped as no session began.
                debug!(connection.log, "connection rejected"; "error" => ?error);
            }
        }
    }
}

struct ListenerHandler {
    server: Arc<ServerShared>,
}

impl EndpointHandler for ListenerHandler {
    fn on_input(&self) {
        ServerShared::process_connect(&self.server);
    }
}

enum OutItem {
    Reply,
    Notify(usize),
}

/// Outbound state of one connection: the single reply slot, the bounded
/// notify pool and the FIFO of frames awaiting transmission. Slot storage
/// is allocated once, at connection setup.
struct Outbound {
    reply: Vec<u8>,
    reply_queued: bool,
    notify_slots: Box<[Vec<u8>]>,
    notify_free: Vec<usize>,
    queue: VecDeque<OutItem>,
    drain_scheduled: bool,
}

impl Outbound {
    fn with_limits(max_reply_size: usize, max_notify_size: usize, max_queued_notifies: usize) -> Outbound {
        let notify_slots: Vec<Vec<u8>> = (0..max_queued_notifies)
            .map(|_| Vec::with_capacity(max_notify_size))
            .collect();

        Outbound {
            reply: Vec::with_capacity(max_reply_size),
            reply_queued: false,
            notify_slots: notify_slots.into_boxed_slice(),
            notify_free: (0..max_queued_notifies).collect(),
            queue: VecDeque::with_capacity(max_queued_notifies + 1),
            drain_scheduled: false,
        }
    }
}

/// One accepted client session. Reply and notify may be called from any
/// thread; frames are drained to the transport on the engine thread in
/// submission order.
pub struct ServerConnection {
    server: Arc<ServerShared>,
    log: Logger,
    identity: ClientIdentity,
    fd: RawFd,
    user_data: OnceLock<UserData>,
    endpoint_id: Mutex<Option<EndpointId>>,
    weak_self: OnceLock<Weak<ServerConnection>>,
    outbound: Mutex<Outbound>,
}

impl ServerConnection {
    #[inline]
    pub fn client_identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The user data chosen by the connect callback; None only inside the
    /// connect callback itself.
    #[inline]
    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.get()
    }

    /// Queues a reply to the most recent request. Fails with `NoMemory`
    /// when the message exceeds the reply size limit or the reply slot is
    /// still awaiting transmission.
    pub fn reply(&self, message: &[u8]) -> Result<()> {
        if message.len() > self.server.max_reply_size {
            return Err(Error::NoMemory);
        }

        let mut outbound = self.outbound.lock().unwrap();
        if outbound.reply_queued {
            return Err(Error::NoMemory);
        }
        outbound.reply.clear();
        outbound.reply.extend_from_slice(message);
        outbound.reply_queued = true;
        outbound.queue.push_back(OutItem::Reply);
        self.schedule_drain(&mut outbound);
        Ok(())
    }

    /// Queues a notification. Fails with `NoMemory` when the message
    /// exceeds the notify size limit or all notify slots are in flight;
    /// the caller observes backpressure instead of silent dropping.
    pub fn notify(&self, message: &[u8]) -> Result<()> {
        if message.len() > self.server.max_notify_size {
            return Err(Error::NoMemory);
        }

        let mut outbound = self.outbound.lock().unwrap();
        let index = match outbound.notify_free.pop() {
            Some(index) => index,
            None => return Err(Error::NoMemory),
        };
        outbound.notify_slots[index].clear();
        outbound.notify_slots[index].extend_from_slice(message);
        outbound.queue.push_back(OutItem::Notify(index));
        self.schedule_drain(&mut outbound);
        Ok(())
    }

    /// Asks the engine to drop this session. The disconnect callback runs
    /// on the engine thread once the endpoint is released.
    pub fn request_disconnect(&self) {
        let id = self.endpoint_id.lock().unwrap().take();
        if let Some(id) = id {
            if self.server.engine.is_on_callback_thread() {
                self.server.engine.unregister_posix_endpoint(id);
            } else {
                let engine = self.server.engine.clone();
                self.server.engine.enqueue_command(
                    Due::Immediate,
                    Box::new(move |_| engine.unregister_posix_endpoint(id)),
                    self.server.owner_tag(),
                );
            }
        }
    }

    fn schedule_drain(&self, outbound: &mut Outbound) {
        if outbound.drain_scheduled {
            return;
        }
        outbound.drain_scheduled = true;

        // A weak reference: a drain pending across teardown must not
        // resurrect the session.
        let draining = match self.weak_self.get() {
            Some(weak) => weak.clone(),
            None => Weak::new(),
        };
        self.server.engine.enqueue_command(
            Due::Immediate,
            Box::new(move |_| {
                if let Some(connection) = draining.upgrade() {
                    connection.drain_outbound();
                }
            }),
            self.server.owner_tag(),
        );
    }

    /// Writes queued frames to the transport, returning notify slots to
    /// the pool as each frame is consumed. Runs on the engine thread.
    fn drain_outbound(&self) {
        let mut outbound = self.outbound.lock().unwrap();
        outbound.drain_scheduled = false;

        let mut failed = false;
        while let Some(item) = outbound.queue.pop_front() {
            let result = match item {
                OutItem::Reply => {
                    let result = self.server.engine.send_protocol_message(
                        self.fd,
                        ServerToClient::Reply.into(),
                        &outbound.reply,
                    );
                    outbound.reply_queued = false;
                    result
                }
                OutItem::Notify(index) => {
                    let result = self.server.engine.send_protocol_message(
                        self.fd,
                        ServerToClient::Notify.into(),
                        &outbound.notify_slots[index],
                    );
                    outbound.notify_free.push(index);
                    result
                }
            };

            if let Err(error) = result {
                debug!(self.log, "outbound transmit failed"; "error" => ?error);
                failed = true;
                break;
            }
        }
        drop(outbound);

        if failed {
            let id = self.endpoint_id.lock().unwrap().take();
            if let Some(id) = id {
                self.server.engine.unregister_posix_endpoint(id);
            }
        }
    }

    /// Reads and dispatches one inbound frame. Returns false when the
    /// connection must be dropped.
    fn process_input(&self) -> bool {
        let (code, message) = match self.server.engine.receive_protocol_message(self.fd) {
            Ok(received) => received,
            Err(error) => {
                debug!(self.log, "receive failed"; "error" => ?error);
                return false;
            }
        };

        let callbacks = match self.server.callbacks.lock().unwrap().clone() {
            Some(callbacks) => callbacks,
            None => return false,
        };

        match ClientToServer::decode(code) {
            Ok(ClientToServer::Request) => match self.user_data.get() {
                Some(UserData::Handler(handler)) => handler.on_message_with_reply(self, message).is_ok(),
                _ => (*callbacks.sent_with_reply)(self, message).is_ok(),
            },
            Ok(ClientToServer::Send) => match self.user_data.get() {
                Some(UserData::Handler(handler)) => handler.on_message(self, message).is_ok(),
                _ => (*callbacks.sent)(self, message).is_ok(),
            },
            // Unrecognised opcode; drop the connection
            Err(_) => false,
        }
    }
}

impl EndpointHandler for ServerConnection {
    fn on_input(&self) {
        if !self.process_input() {
            let id = self.endpoint_id.lock().unwrap().take();
            if let Some(id) = id {
                self.server.engine.unregister_posix_endpoint(id);
            }
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some(user_data) = self.user_data.get() {
            match user_data {
                UserData::Handler(handler) => handler.on_disconnect(self),
                _ => {
                    let disconnect = self
                        .server
                        .callbacks
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|callbacks| callbacks.disconnect.clone());
                    if let Some(disconnect) = disconnect {
                        (*disconnect)(self);
                    }
                }
            }
        }
        self.server.engine.close_descriptor(self.fd);
        trace!(self.log, "connection closed"; "fd" => self.fd);
    }
}

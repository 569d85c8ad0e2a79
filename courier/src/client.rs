use crate::config::{ClientConfig, ServiceProtocolConfig};
use crate::engine::{Endpoint, EndpointHandler, EndpointId, Engine};
use crate::error::{Error, Result};
use crate::frame::{ClientToServer, ServerToClient};
use crate::logging::{debug, o, trace, Logger};
use crate::sync::Rendezvous;
use crate::timer::{Due, OwnerTag};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const CONNECT_RETRY_MS_START: u32 = 50;
// new_delay = prev_delay * (1 + 1/T)
const CONNECT_RETRY_T: u32 = 3;
const CONNECT_RETRY_MS_MAX: u32 = 5000;

/// Computes the delay for the connect attempt after one delayed by
/// `delay` milliseconds.
#[inline]
fn next_retry_delay(delay: u32) -> u32 {
    let grown = delay + (delay + CONNECT_RETRY_T - 1) / CONNECT_RETRY_T;
    if grown > CONNECT_RETRY_MS_MAX {
        CONNECT_RETRY_MS_MAX
    } else {
        grown
    }
}

/// Connection lifecycle states.
///
/// ```text
/// Stopped --> Starting: start() or restart()
/// Starting --> Ready: connect succeeded
/// Starting --> Stopping: connect failed for good, or stop()
/// Ready --> Stopping: connection dropped, or stop()
/// Stopping --> Stopped: background activity has drained
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum State {
    /// The connection can be safely destructed or restarted.
    Stopped = 0,
    /// Still trying to reach the server.
    Starting = 1,
    /// Messages are most likely to be delivered.
    Ready = 2,
    /// No more messages or callbacks are accepted.
    Stopping = 3,
}

impl State {
    #[inline]
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Stopped,
            1 => State::Starting,
            2 => State::Ready,
            3 => State::Stopping,
            _ => unreachable!(),
        }
    }
}

/// Why the connection is stopping or stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum StopReason {
    /// The connection is not stopping.
    None = 0,
    /// The connection has not been started yet.
    Init = 1,
    /// The user called `stop`.
    UserRequested = 2,
    /// Access rights were not sufficient to reach the server.
    Permission = 3,
    /// The other side closed the connection.
    ClosedByPeer = 4,
    /// A communication error prevents continuation.
    IoError = 5,
    /// The underlying resources are gone; restart is not possible.
    Shutdown = 6,
}

impl StopReason {
    #[inline]
    fn from_u8(value: u8) -> StopReason {
        match value {
            0 => StopReason::None,
            1 => StopReason::Init,
            2 => StopReason::UserRequested,
            3 => StopReason::Permission,
            4 => StopReason::ClosedByPeer,
            5 => StopReason::IoError,
            6 => StopReason::Shutdown,
            _ => unreachable!(),
        }
    }
}

pub type StateCallback = Arc<dyn Fn(State) + Send + Sync>;
pub type NotifyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Called exactly once per accepted request, with the reply payload or
/// with the error that ended the connection.
pub type ReplyCallback = Box<dyn FnOnce(Result<&[u8]>) + Send>;

struct SendSlot {
    message: Vec<u8>,
    callback: Option<ReplyCallback>,
}

struct SendState {
    slots: Box<[SendSlot]>,
    free: Vec<usize>,
    queue: VecDeque<usize>,
    /// Occupied while a request is outstanding. The inner `None` marks a
    /// scheduled background drain that has not transmitted yet.
    waiting_for_reply: Option<Option<ReplyCallback>>,
}

impl SendState {
    fn with_capacity(capacity: usize, max_message_size: usize) -> SendState {
        let slots: Vec<SendSlot> = (0..capacity)
            .map(|_| SendSlot {
                message: Vec::with_capacity(max_message_size),
                callback: None,
            })
            .collect();

        SendState {
            slots: slots.into_boxed_slice(),
            free: (0..capacity).collect(),
            queue: VecDeque::with_capacity(capacity),
            waiting_for_reply: None,
        }
    }

    /// Borrows a pool slot for the message, keeping call order in the
    /// queue. Fails when the pool is exhausted.
    fn try_queue(&mut self, message: &[u8], callback: Option<ReplyCallback>) -> bool {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.message.clear();
                slot.message.extend_from_slice(message);
                slot.callback = callback;
                self.queue.push_back(index);
                true
            }
            None => false,
        }
    }
}

/// Reentrancy-aware gate synchronizing destruction against an in-flight
/// state callback. The thread delivering the callback holds the gate; any
/// other thread entering waits, while the holder may re-enter.
struct FinalizeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

struct GateState {
    holder: Option<ThreadId>,
    depth: u32,
}

impl FinalizeGate {
    fn new() -> FinalizeGate {
        FinalizeGate {
            state: Mutex::new(GateState { holder: None, depth: 0 }),
            cond: Condvar::new(),
        }
    }

    fn enter(&self) {
        let me = thread::current().id();
        let mut gate = self.state.lock().unwrap();
        loop {
            match gate.holder {
                None => {
                    gate.holder = Some(me);
                    gate.depth = 1;
                    return;
                }
                Some(holder) if holder == me => {
                    gate.depth += 1;
                    return;
                }
                _ => gate = self.cond.wait(gate).unwrap(),
            }
        }
    }

    fn exit(&self) {
        let mut gate = self.state.lock().unwrap();
        gate.depth -= 1;
        if gate.depth == 0 {
            gate.holder = None;
            self.cond.notify_all();
        }
    }

    /// Waits until no other thread holds the gate.
    fn synchronize(&self) {
        self.enter();
        self.exit();
    }
}

struct ClientShared {
    engine: Arc<Engine>,
    log: Logger,
    service_name: String,
    max_send_size: usize,
    max_receive_size: usize,
    config: ClientConfig,
    fd: AtomicI32,
    state: AtomicU8,
    stop_reason: AtomicU8,
    connect_retry_ms: AtomicU32,
    disconnect_armed: AtomicBool,
    endpoint_id: Mutex<Option<EndpointId>>,
    state_callback: Mutex<Option<StateCallback>>,
    notify_callback: Mutex<Option<NotifyCallback>>,
    send: Mutex<SendState>,
    finalize: FinalizeGate,
}

/// Client side of the asynchronous client-server IPC channel.
///
/// All public methods may be called from any thread. Callbacks run
/// sequentially on the engine thread, except the `Starting` and
/// `Stopping` state callbacks, which may run on the thread calling
/// `start`/`stop`. Dropping a connection that is not stopped stops it
/// first and waits for the transition to finish.
pub struct ClientConnection {
    shared: Arc<ClientShared>,
}

impl ClientConnection {
    pub fn new(
        engine: Arc<Engine>,
        protocol_config: &ServiceProtocolConfig,
        client_config: ClientConfig,
    ) -> Result<ClientConnection> {
        protocol_config.validate()?;
        client_config.validate()?;
        let service_name = protocol_config.service_name()?.to_string();

        let max_send_size = protocol_config.max_send_size as usize;
        let max_receive_size = protocol_config.max_reply_size.max(protocol_config.max_notify_size) as usize;
        let capacity = (client_config.max_queued_sends + client_config.max_async_replies) as usize;

        let log = engine
            .logger()
            .new(o!("context" => "client", "service" => service_name.clone()));

        let shared = Arc::new(ClientShared {
            engine,
            log,
            service_name,
            max_send_size,
            max_receive_size,
            config: client_config,
            fd: AtomicI32::new(-1),
            state: AtomicU8::new(State::Stopped as u8),
            stop_reason: AtomicU8::new(StopReason::Init as u8),
            connect_retry_ms: AtomicU32::new(CONNECT_RETRY_MS_START),
            disconnect_armed: AtomicBool::new(false),
            endpoint_id: Mutex::new(None),
            state_callback: Mutex::new(None),
            notify_callback: Mutex::new(None),
            send: Mutex::new(SendState::with_capacity(capacity, max_send_size)),
            finalize: FinalizeGate::new(),
        });

        Ok(ClientConnection { shared })
    }

    #[inline]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    #[inline]
    pub fn stop_reason(&self) -> StopReason {
        self.shared.stop_reason()
    }

    /// Starts the connection. The captured state outlives the callbacks
    /// until the connection has returned to `Stopped`.
    pub fn start<S, N>(&self, state_callback: S, notify_callback: N)
    where
        S: Fn(State) + Send + Sync + 'static,
        N: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.shared.state_callback.lock().unwrap() = Some(Arc::new(state_callback));
        *self.shared.notify_callback.lock().unwrap() = Some(Arc::new(notify_callback));

        ClientShared::do_restart(&self.shared, true);
    }

    /// Stops the connection. Repeated calls observe the first latched
    /// reason and do nothing.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.try_set_stop_reason(StopReason::UserRequested) {
            return;
        }

        shared.process_state_change(State::Stopping);
        if shared.engine.is_on_callback_thread() {
            shared.switch_to_stop_state();
        } else {
            let stopping = shared.clone();
            shared.engine.enqueue_command(
                Due::Immediate,
                Box::new(move |_| stopping.switch_to_stop_state()),
                shared.owner_tag(),
            );
        }
    }

    /// Tries to restart a stopped connection; a no-op unless the state is
    /// `Stopped` with a restartable reason.
    pub fn restart(&self) {
        if self.shared.state() != State::Stopped || self.shared.stop_reason() == StopReason::Shutdown {
            return;
        }

        ClientShared::do_restart(&self.shared, false);
    }

    /// Sends a message without expecting a reply.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let shared = &self.shared;
        if message.len() > shared.max_send_size {
            return Err(Error::NoMemory);
        }
        if shared.state() != State::Ready {
            return Err(Error::Invalid);
        }

        let fd = shared.fd.load(Ordering::Acquire);
        if !shared.config.fully_ordered && !shared.config.truly_async {
            return shared
                .engine
                .send_protocol_message(fd, ClientToServer::Send.into(), message);
        }

        let mut send = shared.send.lock().unwrap();
        if shared.state() != State::Ready {
            return Err(Error::Invalid);
        }
        if send.waiting_for_reply.is_none() {
            if shared.config.truly_async {
                if !send.try_queue(message, None) {
                    return Err(Error::NoMemory);
                }
                send.waiting_for_reply = Some(None);
                ClientShared::schedule_send_drain(shared);
            } else {
                return shared
                    .engine
                    .send_protocol_message(fd, ClientToServer::Send.into(), message);
            }
        } else if !send.try_queue(message, None) {
            return Err(Error::NoMemory);
        }
        Ok(())
    }

    /// Sends a message and registers a callback for the reply. The call
    /// itself does not block; if the server dies before replying, the
    /// callback receives the error instead.
    pub fn send_with_callback<C>(&self, message: &[u8], callback: C) -> Result<()>
    where
        C: FnOnce(Result<&[u8]>) + Send + 'static,
    {
        let shared = &self.shared;
        if message.len() > shared.max_send_size {
            return Err(Error::NoMemory);
        }
        if shared.state() != State::Ready {
            return Err(Error::Invalid);
        }

        let fd = shared.fd.load(Ordering::Acquire);
        let mut send = shared.send.lock().unwrap();
        if shared.state() != State::Ready {
            return Err(Error::Invalid);
        }

        if send.waiting_for_reply.is_some() {
            if !send.try_queue(message, Some(Box::new(callback))) {
                return Err(Error::NoMemory);
            }
            return Ok(());
        }

        if shared.config.truly_async {
            if !send.try_queue(message, Some(Box::new(callback))) {
                return Err(Error::NoMemory);
            }
            send.waiting_for_reply = Some(None);
            ClientShared::schedule_send_drain(shared);
            return Ok(());
        }

        shared
            .engine
            .send_protocol_message(fd, ClientToServer::Request.into(), message)?;
        send.waiting_for_reply = Some(Some(Box::new(callback)));
        Ok(())
    }

    /// Sends a message and blocks until the reply lands in `reply`.
    /// Returns the filled prefix of `reply`. Fails with `TryAgain` on the
    /// engine thread, where blocking would deadlock.
    pub fn send_wait_reply<'b>(&self, message: &[u8], reply: &'b mut [u8]) -> Result<&'b [u8]> {
        let shared = &self.shared;
        if shared.engine.is_on_callback_thread() {
            return Err(Error::TryAgain);
        }
        if message.len() > shared.max_send_size {
            return Err(Error::NoMemory);
        }
        if shared.state() != State::Ready {
            return Err(Error::Invalid);
        }

        struct ReplyTarget(*mut u8);
        unsafe impl Send for ReplyTarget {}

        let rendezvous: Rendezvous<Result<usize>> = Rendezvous::new();
        let handle = unsafe { rendezvous.handle() };
        let target = ReplyTarget(reply.as_mut_ptr());
        let capacity = reply.len();

        let callback: ReplyCallback = Box::new(move |message_expected: Result<&[u8]>| {
            let outcome = match message_expected {
                Ok(reply_message) => {
                    if reply_message.len() > capacity {
                        Err(Error::NoMemory)
                    } else {
                        // The waiter's frame is parked until complete()
                        unsafe {
                            std::ptr::copy_nonoverlapping(reply_message.as_ptr(), target.0, reply_message.len());
                        }
                        Ok(reply_message.len())
                    }
                }
                Err(error) => Err(error),
            };
            handle.complete(outcome);
        });

        {
            let fd = shared.fd.load(Ordering::Acquire);
            let mut send = shared.send.lock().unwrap();
            if shared.state() != State::Ready {
                return Err(Error::Invalid);
            }
            if send.waiting_for_reply.is_some() {
                if !send.try_queue(message, Some(callback)) {
                    return Err(Error::NoMemory);
                }
            } else {
                shared
                    .engine
                    .send_protocol_message(fd, ClientToServer::Request.into(), message)?;
                send.waiting_for_reply = Some(Some(callback));
            }
        }

        let length = rendezvous.wait()?;
        Ok(&reply[..length])
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if self.shared.state() != State::Stopped {
            self.stop();
            while self.shared.state() != State::Stopped {
                thread::sleep(Duration::from_millis(10));
            }
        }
        // A state callback may still be in flight on another thread
        self.shared.finalize.synchronize();
    }
}

impl EndpointHandler for ClientShared {
    fn on_input(&self) {
        if let Some(reason) = self.process_input_event() {
            if self.try_set_stop_reason(reason) {
                self.process_state_change(State::Stopping);
                let id = self.endpoint_id.lock().unwrap().take();
                if let Some(id) = id {
                    self.engine.unregister_posix_endpoint(id);
                }
            }
        }
    }

    fn on_disconnect(&self) {
        if self.disconnect_armed.swap(false, Ordering::AcqRel) {
            self.switch_to_stop_state();
        }
    }
}

impl ClientShared {
    #[inline]
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn stop_reason(&self) -> StopReason {
        StopReason::from_u8(self.stop_reason.load(Ordering::Acquire))
    }

    #[inline]
    fn owner_tag(&self) -> OwnerTag {
        OwnerTag::from_addr(self as *const ClientShared)
    }

    /// Latches the first stop reason of a stop cycle. A concurrent stop
    /// and I/O failure race here; the later attempt is ignored along with
    /// its follow-up teardown.
    fn try_set_stop_reason(&self, reason: StopReason) -> bool {
        self.stop_reason
            .compare_exchange(
                StopReason::None as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn do_restart(shared: &Arc<ClientShared>, first_start: bool) {
        shared.stop_reason.store(StopReason::None as u8, Ordering::Release);
        shared.process_state_change(State::Starting);
        shared
            .connect_retry_ms
            .store(CONNECT_RETRY_MS_START, Ordering::Relaxed);

        debug!(shared.log, "connecting"; "sync_first" => shared.config.sync_first_connect);

        if first_start && shared.config.sync_first_connect && !shared.engine.is_on_callback_thread() {
            ClientShared::try_connect_sync(shared);
        } else {
            let connecting = shared.clone();
            shared.engine.enqueue_command(
                Due::Immediate,
                Box::new(move |_| ClientShared::try_connect(&connecting)),
                shared.owner_tag(),
            );
        }
    }

    /// One connect attempt on the engine thread.
    fn try_connect(shared: &Arc<ClientShared>) {
        if shared.stop_reason() != StopReason::None {
            // A stop raced ahead; its command owns the teardown
            return;
        }

        match shared.engine.try_open_client_connection(&shared.service_name) {
            Ok(fd) => ClientShared::install_connection(shared, fd),
            Err(error) => ClientShared::handle_connect_error(shared, error, false),
        }
    }

    /// First connect attempt on the thread calling `start`. A successful
    /// descriptor is handed to the engine thread for installation.
    fn try_connect_sync(shared: &Arc<ClientShared>) {
        match shared.engine.try_open_client_connection(&shared.service_name) {
            Ok(fd) => {
                let installing = shared.clone();
                shared.engine.enqueue_command(
                    Due::Immediate,
                    Box::new(move |_| {
                        if installing.stop_reason() != StopReason::None {
                            installing.engine.close_descriptor(fd);
                            return;
                        }
                        ClientShared::install_connection(&installing, fd);
                    }),
                    shared.owner_tag(),
                );
            }
            Err(error) => ClientShared::handle_connect_error(shared, error, true),
        }
    }

    fn install_connection(shared: &Arc<ClientShared>, fd: RawFd) {
        shared.fd.store(fd, Ordering::Release);
        shared.disconnect_armed.store(true, Ordering::Release);

        let id = shared.engine.register_posix_endpoint(Endpoint {
            owner: shared.owner_tag(),
            fd,
            max_receive_size: shared.max_receive_size,
            handler: shared.clone(),
        });
        *shared.endpoint_id.lock().unwrap() = Some(id);

        debug!(shared.log, "connected"; "fd" => fd);
        shared.process_state_change(State::Ready);
    }

    fn handle_connect_error(shared: &Arc<ClientShared>, error: Error, off_thread: bool) {
        match error {
            Error::WouldBlock | Error::Refused | Error::NotFound => {
                let delay = shared.connect_retry_ms.load(Ordering::Relaxed);
                shared
                    .connect_retry_ms
                    .store(next_retry_delay(delay), Ordering::Relaxed);
                trace!(shared.log, "connect attempt failed"; "error" => ?error, "retry_ms" => delay);

                let retrying = shared.clone();
                shared.engine.enqueue_command(
                    Due::At(Instant::now() + Duration::from_millis(delay as u64)),
                    Box::new(move |_| ClientShared::try_connect(&retrying)),
                    shared.owner_tag(),
                );
            }
            _ => {
                let reason = if error == Error::AccessDenied {
                    StopReason::Permission
                } else {
                    StopReason::IoError
                };
                debug!(shared.log, "connect failed"; "error" => ?error, "reason" => ?reason);
                if shared.try_set_stop_reason(reason) {
                    shared.process_state_change(State::Stopping);
                    if off_thread {
                        let stopping = shared.clone();
                        shared.engine.enqueue_command(
                            Due::Immediate,
                            Box::new(move |_| stopping.switch_to_stop_state()),
                            shared.owner_tag(),
                        );
                    } else {
                        shared.switch_to_stop_state();
                    }
                }
            }
        }
    }

    fn schedule_send_drain(shared: &Arc<ClientShared>) {
        let draining = shared.clone();
        shared.engine.enqueue_command(
            Due::Immediate,
            Box::new(move |_| {
                let fd = draining.fd.load(Ordering::Acquire);
                let mut send = draining.send.lock().unwrap();
                draining.process_send_queue(&mut send, fd);
            }),
            shared.owner_tag(),
        );
    }

    /// Transmits queued messages until a request takes the reply slot or
    /// the queue drains, in which case the slot is released. Runs under
    /// the send lock.
    fn process_send_queue(&self, send: &mut SendState, fd: RawFd) {
        while let Some(index) = send.queue.pop_front() {
            let callback = send.slots[index].callback.take();
            let is_request = callback.is_some();
            let code = if is_request {
                ClientToServer::Request.into()
            } else {
                ClientToServer::Send.into()
            };

            let result = self.engine.send_protocol_message(fd, code, &send.slots[index].message);
            if let Err(error) = result {
                // The input path notices the dead descriptor and fails
                // the connection; queued callbacks are drained there.
                trace!(self.log, "queued transmit failed"; "error" => ?error);
            }
            send.free.push(index);

            if is_request {
                send.waiting_for_reply = Some(callback);
                return;
            }
        }
        send.waiting_for_reply = None;
    }

    fn process_input_event(&self) -> Option<StopReason> {
        let fd = self.fd.load(Ordering::Acquire);
        let (code, message) = match self.engine.receive_protocol_message(fd) {
            Ok(received) => received,
            Err(Error::BrokenPipe) => return Some(StopReason::ClosedByPeer),
            Err(_) => return Some(StopReason::IoError),
        };

        match ServerToClient::decode(code) {
            Ok(ServerToClient::Reply) => {
                let pending = {
                    let mut send = self.send.lock().unwrap();
                    match send.waiting_for_reply.take() {
                        Some(pending) => {
                            self.process_send_queue(&mut send, fd);
                            pending
                        }
                        // A reply nobody asked for
                        None => return Some(StopReason::IoError),
                    }
                };
                if let Some(callback) = pending {
                    callback(Ok(message));
                }
                None
            }
            Ok(ServerToClient::Notify) => {
                let notify = self.notify_callback.lock().unwrap().clone();
                if let Some(notify) = notify {
                    (*notify)(message);
                }
                None
            }
            Err(_) => Some(StopReason::IoError),
        }
    }

    /// Final teardown step, run on the engine thread: drops everything the
    /// engine holds for this connection, closes the transport, fails the
    /// pending reply callbacks and delivers the `Stopped` state.
    fn switch_to_stop_state(&self) {
        // Cleanup below must not re-enter through the disconnect hook
        self.disconnect_armed.store(false, Ordering::Release);
        self.engine.clean_up_owner(self.owner_tag());
        *self.endpoint_id.lock().unwrap() = None;

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            self.engine.close_descriptor(fd);
        }

        let mut send = self.send.lock().unwrap();
        if let Some(pending) = send.waiting_for_reply.take() {
            drop(send);
            if let Some(callback) = pending {
                callback(Err(Error::BrokenPipe));
            }
            send = self.send.lock().unwrap();
        }
        loop {
            let callback = match send.queue.pop_front() {
                Some(index) => {
                    send.free.push(index);
                    send.slots[index].callback.take()
                }
                None => break,
            };
            if let Some(callback) = callback {
                drop(send);
                callback(Err(Error::BrokenPipe));
                send = self.send.lock().unwrap();
            }
        }
        drop(send);

        debug!(self.log, "stopped"; "reason" => ?self.stop_reason());
        self.process_state_change(State::Stopped);
    }

    fn process_state_change(&self, state: State) {
        trace!(self.log, "state change"; "state" => ?state);

        if state != State::Stopped {
            self.state.store(state as u8, Ordering::Release);
            let callback = self.state_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                (*callback)(state);
            }
        } else {
            // The gate lets the connection be dropped from inside the
            // callback while keeping other threads out until it returns.
            self.finalize.enter();
            self.state.store(State::Stopped as u8, Ordering::Release);
            let callback = self.state_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                (*callback)(State::Stopped);
            }
            self.finalize.exit();
        }
    }
}

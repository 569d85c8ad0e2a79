use crate::error::{Error, Result};
use crate::frame;
use crate::logging::{self, debug, o, trace, Logger};
use crate::sync::{ReactorCell, Rendezvous};
use crate::timer::{Due, OwnerTag, QueuedCallback, TimerQueue};
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Namespace prefix for service names in the abstract socket namespace.
const SOCKET_PREFIX: &str = "courier/";

/// Arbitrary value: a client refused because it did not fit the backlog
/// queue reconnects after a delay anyway.
const LISTEN_BACKLOG: i32 = 20;

const PIPE_QUIT: u8 = 0;
const PIPE_TIMER: u8 = 1;

/// Hooks of a file descriptor registered with the engine. Both hooks run
/// on the engine thread only.
pub(crate) trait EndpointHandler: Send + Sync {
    /// The descriptor is ready to read.
    fn on_input(&self);
    /// The endpoint was deactivated by unregistration or owner cleanup.
    fn on_disconnect(&self) {}
}

/// A registered endpoint: a descriptor, its owner tag for bulk cleanup,
/// and the callbacks driving it. The handler reference held here keeps
/// the owning session alive while the endpoint is registered.
pub(crate) struct Endpoint {
    pub owner: OwnerTag,
    pub fd: RawFd,
    pub max_receive_size: usize,
    pub handler: Arc<dyn EndpointHandler>,
}

/// Identifies a registration; the token guards against a table slot being
/// reused while a dispatch round still refers to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct EndpointId {
    index: usize,
    token: u64,
}

struct Slot {
    token: u64,
    endpoint: Option<Endpoint>,
}

/// State owned by the engine thread: the endpoint table and the shared
/// receive buffer.
struct Reactor {
    slots: Vec<Slot>,
    receive_buffer: Vec<u8>,
}

struct EngineShared {
    log: Logger,
    pipe_fds: [RawFd; 2],
    quit: AtomicBool,
    next_token: AtomicU64,
    timer_queue: TimerQueue,
    reactor: ReactorCell<Reactor>,
}

/// The shared resource engine: one background thread multiplexing every
/// registered endpoint, the wakeup pipe and the timed command queue, and
/// serializing all callback execution onto itself.
///
/// An engine is shared between any number of clients and servers through
/// a reference-counted handle and outlives all of them. Several engines,
/// each with its own thread, can co-exist in one process.
pub struct Engine {
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Creates the engine and starts its background thread. Failure to
    /// acquire the wakeup channel or the thread aborts the process.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Engine {
        let log = logging::child_or_discard(log.into(), o!("context" => "engine"));

        let mut pipe_fds = [-1 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc < 0 {
            panic!("Failed to create engine wakeup channel: {:?}", Error::last_os_error());
        }
        // A full wakeup pipe already guarantees a pending wakeup
        unsafe {
            let flags = libc::fcntl(pipe_fds[1], libc::F_GETFL);
            libc::fcntl(pipe_fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let shared = Arc::new(EngineShared {
            log,
            pipe_fds,
            quit: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            timer_queue: TimerQueue::new(),
            reactor: ReactorCell::new(Reactor {
                slots: Vec::new(),
                receive_buffer: Vec::new(),
            }),
        });

        // Termination signals are handled elsewhere in the process; keep
        // them masked on the engine thread. The spawned thread inherits
        // the mask, which is restored afterwards.
        let thread = unsafe {
            let mut new_set: libc::sigset_t = mem::zeroed();
            let mut old_set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut new_set);
            libc::sigaddset(&mut new_set, libc::SIGTERM);
            libc::pthread_sigmask(libc::SIG_BLOCK, &new_set, &mut old_set);

            let (ready_send, ready_recv) = mpsc::channel();
            let thread_shared = shared.clone();
            let thread = thread::Builder::new()
                .name("courier-engine".into())
                .spawn(move || thread_shared.run_on_thread(ready_send))
                .expect("Failed to spawn engine thread");

            libc::pthread_sigmask(libc::SIG_SETMASK, &old_set, std::ptr::null_mut());

            ready_recv.recv().expect("Engine thread died during startup");
            thread
        };

        debug!(shared.log, "engine started");

        Engine {
            shared,
            thread: Some(thread),
        }
    }

    /// Returns true when called from the engine's callback thread.
    #[inline]
    pub fn is_on_callback_thread(&self) -> bool {
        self.shared.reactor.is_bound_thread()
    }

    #[inline]
    pub(crate) fn logger(&self) -> &Logger {
        &self.shared.log
    }

    /// Schedules a callback on the engine thread; `Due::Immediate` runs on
    /// the next pass. Callable from any thread.
    pub(crate) fn enqueue_command(&self, due: Due, callback: QueuedCallback, owner: OwnerTag) {
        match due {
            Due::Immediate => self.shared.timer_queue.register_immediate(callback, owner),
            Due::At(until) => self.shared.timer_queue.register_timed(until, callback, owner),
        }
        self.shared.send_pipe_event(PIPE_TIMER);
    }

    /// Registers an endpoint for input readiness. Engine thread only.
    #[inline]
    pub(crate) fn register_posix_endpoint(&self, endpoint: Endpoint) -> EndpointId {
        self.shared.register_endpoint(endpoint)
    }

    /// Removes an endpoint and fires its disconnect hook. Engine thread
    /// only. Stale ids (already removed or replaced) are ignored.
    #[inline]
    pub(crate) fn unregister_posix_endpoint(&self, id: EndpointId) {
        self.shared.unregister_endpoint(id)
    }

    /// Removes every endpoint and queued command belonging to `owner`.
    ///
    /// On the engine thread the cleanup runs inline; from any other thread
    /// the call blocks until the engine thread has performed it, after
    /// which none of the owner's callbacks can run anymore.
    pub(crate) fn clean_up_owner(&self, owner: OwnerTag) {
        if owner.is_none() {
            return;
        }

        if self.is_on_callback_thread() {
            self.shared.process_cleanup(owner);
            return;
        }

        let rendezvous = Rendezvous::new();
        let handle = unsafe { rendezvous.handle() };
        let shared = self.shared.clone();
        // Registered without an owner: a concurrent cleanup must not be
        // able to cancel the command the waiter below depends on.
        self.shared.timer_queue.register_immediate(
            Box::new(move |_| {
                shared.process_cleanup(owner);
                handle.complete(());
            }),
            OwnerTag::NONE,
        );
        self.shared.send_pipe_event(PIPE_TIMER);
        rendezvous.wait();
    }

    /// Opens a blocking stream connection to the named service.
    pub(crate) fn try_open_client_connection(&self, name: &str) -> Result<RawFd> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let (addr, addr_len) = socket_address(name);
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            let error = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(error);
        }
        Ok(fd)
    }

    pub(crate) fn close_descriptor(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    /// Creates a listening socket under the service name.
    pub(crate) fn create_listener(&self, name: &str) -> Result<RawFd> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let (addr, addr_len) = socket_address(name);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            let error = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(error);
        }

        let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
        if rc < 0 {
            let error = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(error);
        }
        Ok(fd)
    }

    /// Accepts one pending connection on a listener.
    pub(crate) fn accept_client(&self, listener_fd: RawFd) -> Result<RawFd> {
        loop {
            let fd = unsafe { libc::accept(listener_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                return Ok(fd);
            }
            let error = Error::last_os_error();
            if error != Error::Io(std::io::ErrorKind::Interrupted) {
                return Err(error);
            }
        }
    }

    /// Reads the peer credentials of a connected stream socket.
    pub(crate) fn peer_credentials(&self, fd: RawFd) -> Result<libc::ucred> {
        let mut cred: libc::ucred = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut libc::ucred as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 || len as usize != mem::size_of::<libc::ucred>() {
            return Err(Error::last_os_error());
        }
        Ok(cred)
    }

    /// Writes one framed message to a connected socket as a single
    /// gathered send. Callable from any thread.
    pub(crate) fn send_protocol_message(&self, fd: RawFd, code: u8, message: &[u8]) -> Result<()> {
        let header = frame::encode_header(code, message.len());
        write_gathered(fd, &header, message)
    }

    /// Reads one framed message into the engine receive buffer and returns
    /// the opcode and payload. Engine thread only.
    ///
    /// The returned span aliases the engine buffer; it is valid until the
    /// next receive, which cannot happen before the current input callback
    /// returns.
    #[inline]
    pub(crate) fn receive_protocol_message(&self, fd: RawFd) -> Result<(u8, &[u8])> {
        self.shared.receive_protocol_message(fd)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.send_pipe_event(PIPE_QUIT);
        if let Some(thread) = self.thread.take() {
            thread.join().expect("Engine thread panicked");
        }
        unsafe {
            libc::close(self.shared.pipe_fds[0]);
            libc::close(self.shared.pipe_fds[1]);
        }
        debug!(self.shared.log, "engine stopped");
    }
}

struct PipeHandler {
    shared: Arc<EngineShared>,
}

impl EndpointHandler for PipeHandler {
    fn on_input(&self) {
        let mut event = 0u8;
        let rc = unsafe {
            libc::read(
                self.shared.pipe_fds[0],
                &mut event as *mut u8 as *mut libc::c_void,
                1,
            )
        };
        if rc == 1 && event == PIPE_QUIT {
            self.shared.quit.store(true, Ordering::Release);
        }
        // TIMER events only force a poll timeout recalculation
    }
}

impl EngineShared {
    fn send_pipe_event(&self, event: u8) {
        unsafe {
            libc::write(self.pipe_fds[1], &event as *const u8 as *const libc::c_void, 1);
        }
    }

    fn register_endpoint(&self, endpoint: Endpoint) -> EndpointId {
        trace!(self.log, "registering endpoint"; "fd" => endpoint.fd);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;

        self.reactor.with(|reactor| {
            if reactor.receive_buffer.len() < endpoint.max_receive_size {
                reactor.receive_buffer.resize(endpoint.max_receive_size, 0);
            }

            let endpoint = Some(endpoint);
            match reactor.slots.iter().position(|slot| slot.endpoint.is_none()) {
                Some(index) => {
                    reactor.slots[index] = Slot { token, endpoint };
                    EndpointId { index, token }
                }
                None => {
                    reactor.slots.push(Slot { token, endpoint });
                    EndpointId {
                        index: reactor.slots.len() - 1,
                        token,
                    }
                }
            }
        })
    }

    fn unregister_endpoint(&self, id: EndpointId) {
        let removed = self.reactor.with(|reactor| {
            let slot = &mut reactor.slots[id.index];
            if slot.token == id.token {
                slot.endpoint.take()
            } else {
                None
            }
        });

        if let Some(endpoint) = removed {
            trace!(self.log, "endpoint unregistered"; "fd" => endpoint.fd);
            endpoint.handler.on_disconnect();
        }
    }

    fn process_cleanup(&self, owner: OwnerTag) {
        loop {
            let removed = self.reactor.with(|reactor| {
                reactor
                    .slots
                    .iter_mut()
                    .find(|slot| slot.endpoint.as_ref().map_or(false, |endpoint| endpoint.owner == owner))
                    .and_then(|slot| slot.endpoint.take())
            });

            match removed {
                Some(endpoint) => endpoint.handler.on_disconnect(),
                None => break,
            }
        }
        self.timer_queue.clean_up_owner(owner);
    }

    fn receive_protocol_message(&self, fd: RawFd) -> Result<(u8, &[u8])> {
        let mut header = [0u8; frame::HEADER_SIZE];
        recv_exact(fd, &mut header, true)?;
        let (code, size) = frame::decode_header(&header);

        if size == 0 {
            return Ok((code, &[]));
        }

        let (ptr, len) = self.reactor.with(|reactor| -> Result<(*const u8, usize)> {
            if size > reactor.receive_buffer.len() {
                return Err(Error::MessageTooLarge);
            }
            recv_exact(fd, &mut reactor.receive_buffer[..size], false)?;
            Ok((reactor.receive_buffer.as_ptr(), size))
        })?;

        // Only the engine thread writes the buffer, and not before the
        // next receive; the span stays valid until then.
        Ok((code, unsafe { std::slice::from_raw_parts(ptr, len) }))
    }

    /// Drains due commands and converts the next deadline into a poll
    /// timeout in milliseconds.
    fn process_timer_queue(&self) -> libc::c_int {
        let now = Instant::now();
        match self.timer_queue.process(now) {
            None => -1,
            Some(at) => {
                let millis = at.saturating_duration_since(Instant::now()).as_millis() + 1;
                if millis > libc::c_int::max_value() as u128 {
                    libc::c_int::max_value()
                } else {
                    millis as libc::c_int
                }
            }
        }
    }

    fn run_on_thread(self: Arc<Self>, ready: mpsc::Sender<()>) {
        self.reactor.bind();

        let command_endpoint = self.register_endpoint(Endpoint {
            owner: OwnerTag::NONE,
            fd: self.pipe_fds[0],
            max_receive_size: 0,
            handler: Arc::new(PipeHandler { shared: self.clone() }),
        });

        // The creating thread blocks until the wakeup channel is armed
        drop(ready.send(()));

        let mut poll_fds: Vec<libc::pollfd> = Vec::new();
        let mut poll_ids: Vec<EndpointId> = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            let timeout = self.process_timer_queue();

            poll_fds.clear();
            poll_ids.clear();
            self.reactor.with(|reactor| {
                for (index, slot) in reactor.slots.iter().enumerate() {
                    if let Some(endpoint) = &slot.endpoint {
                        poll_fds.push(libc::pollfd {
                            fd: endpoint.fd,
                            events: libc::POLLIN,
                            revents: 0,
                        });
                        poll_ids.push(EndpointId {
                            index,
                            token: slot.token,
                        });
                    }
                }
            });

            let num = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout) };
            if num < 0 {
                let error = Error::last_os_error();
                if error == Error::Io(std::io::ErrorKind::Interrupted) {
                    continue;
                }
                panic!("Engine poll failed: {:?}", error);
            }
            if num == 0 {
                continue;
            }

            for (position, &id) in poll_ids.iter().enumerate() {
                if poll_fds[position].revents == 0 {
                    continue;
                }
                // A callback earlier in this round may have swapped the
                // slot out; the token check skips stale entries. The
                // handler is cloned out so no table borrow is held while
                // user code runs.
                let handler = self.reactor.with(|reactor| {
                    let slot = &reactor.slots[id.index];
                    if slot.token == id.token {
                        slot.endpoint.as_ref().map(|endpoint| endpoint.handler.clone())
                    } else {
                        None
                    }
                });
                if let Some(handler) = handler {
                    handler.on_input();
                }
            }
        }

        self.unregister_endpoint(command_endpoint);
    }
}

/// Builds the abstract-namespace address for a service name. Names longer
/// than the address buffer are truncated identically on both sides.
fn socket_address(name: &str) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let base = mem::size_of::<libc::sockaddr_un>() - addr.sun_path.len();

    // sun_path[0] stays zero: abstract namespace
    let mut used = 1;
    for &byte in SOCKET_PREFIX.as_bytes().iter().chain(name.as_bytes()) {
        if used >= addr.sun_path.len() {
            break;
        }
        addr.sun_path[used] = byte as libc::c_char;
        used += 1;
    }

    (addr, (base + used) as libc::socklen_t)
}

/// Receives exactly `buffer.len()` bytes. A clean shutdown before the
/// first byte maps to a broken pipe; one mid-message is a framing error.
fn recv_exact(fd: RawFd, buffer: &mut [u8], at_frame_start: bool) -> Result<()> {
    let mut done = 0usize;
    while done < buffer.len() {
        let num = unsafe {
            libc::recv(
                fd,
                buffer[done..].as_mut_ptr() as *mut libc::c_void,
                buffer.len() - done,
                libc::MSG_WAITALL,
            )
        };
        if num < 0 {
            let error = Error::last_os_error();
            if error == Error::Io(std::io::ErrorKind::Interrupted) {
                continue;
            }
            return Err(error);
        }
        if num == 0 {
            return if at_frame_start && done == 0 {
                Err(Error::BrokenPipe)
            } else {
                Err(Error::Io(std::io::ErrorKind::UnexpectedEof))
            };
        }
        done += num as usize;
    }
    Ok(())
}

/// Writes a header and payload as one gathered send, finishing any
/// partial transmission so the frame reaches the peer intact.
fn write_gathered(fd: RawFd, header: &[u8], payload: &[u8]) -> Result<()> {
    let total = header.len() + payload.len();
    let mut sent = 0usize;

    while sent < total {
        let mut io: [libc::iovec; 2] = unsafe { mem::zeroed() };
        let count: usize;
        if sent < header.len() {
            io[0].iov_base = header[sent..].as_ptr() as *mut libc::c_void;
            io[0].iov_len = header.len() - sent;
            io[1].iov_base = payload.as_ptr() as *mut libc::c_void;
            io[1].iov_len = payload.len();
            count = if payload.is_empty() { 1 } else { 2 };
        } else {
            let offset = sent - header.len();
            io[0].iov_base = payload[offset..].as_ptr() as *mut libc::c_void;
            io[0].iov_len = payload.len() - offset;
            count = 1;
        }

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = io.as_mut_ptr();
        msg.msg_iovlen = count as _;

        let num = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if num < 0 {
            let error = Error::last_os_error();
            if error == Error::Io(std::io::ErrorKind::Interrupted) {
                continue;
            }
            return Err(error);
        }
        sent += num as usize;
    }
    Ok(())
}

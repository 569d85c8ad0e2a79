use std::io;

/// Errors surfaced by the messaging API and the underlying transport.
///
/// Local, recoverable failures (pool exhaustion, wrong state, oversize
/// payloads) are returned straight to the caller. Failures that end a
/// connection reach the user exactly once through the connection's state
/// callback; any reply callback still pending at that point is failed with
/// `BrokenPipe`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// A bounded slot pool is exhausted or the payload exceeds its limit.
    NoMemory,
    /// The operation is not valid in the current state or configuration.
    Invalid,
    /// A blocking call was issued from the engine callback thread.
    TryAgain,
    /// The connection was lost while a request was pending.
    BrokenPipe,
    /// The OS refused access to the transport name.
    AccessDenied,
    /// No server is attached to the transport name.
    NotFound,
    /// The peer refused the connection.
    Refused,
    /// The operation would block.
    WouldBlock,
    /// An inbound frame is larger than the negotiated receive limit.
    MessageTooLarge,
    /// The peer sent a frame that does not fit the wire protocol.
    Protocol,
    /// Any other transport failure.
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::PermissionDenied => Error::AccessDenied,
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::ConnectionRefused => Error::Refused,
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::ConnectionReset => Error::BrokenPipe,
            kind => Error::Io(kind),
        }
    }
}

impl Error {
    /// Maps a raw errno as returned by libc calls.
    #[inline]
    pub(crate) fn from_errno(errno: i32) -> Error {
        io::Error::from_raw_os_error(errno).into()
    }

    /// Maps the errno left behind by the last failing libc call.
    #[inline]
    pub(crate) fn last_os_error() -> Error {
        Error::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

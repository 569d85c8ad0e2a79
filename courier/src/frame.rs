use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Frames travelling from a client to its server.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ClientToServer {
    /// Fire-and-forget payload.
    Send = 0,
    /// Payload expecting a single reply.
    Request = 1,
}

/// Frames travelling from a server to one of its clients.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ServerToClient {
    /// Response to the most recent request on the connection.
    Reply = 0,
    /// Unsolicited event payload.
    Notify = 1,
}

impl From<ClientToServer> for u8 {
    #[inline]
    fn from(code: ClientToServer) -> Self {
        code as u8
    }
}

impl From<ServerToClient> for u8 {
    #[inline]
    fn from(code: ServerToClient) -> Self {
        code as u8
    }
}

impl ClientToServer {
    #[inline]
    pub fn decode(code: u8) -> Result<ClientToServer> {
        match code {
            0 => Ok(ClientToServer::Send),
            1 => Ok(ClientToServer::Request),
            _ => Err(Error::Protocol),
        }
    }
}

impl ServerToClient {
    #[inline]
    pub fn decode(code: u8) -> Result<ServerToClient> {
        match code {
            0 => Ok(ServerToClient::Reply),
            1 => Ok(ServerToClient::Notify),
            _ => Err(Error::Protocol),
        }
    }
}

/// Size of the stream frame header: opcode byte plus little-endian length.
pub(crate) const HEADER_SIZE: usize = 3;

/// Packs the stream frame header for a payload of `len` bytes.
#[inline]
pub(crate) fn encode_header(code: u8, len: usize) -> [u8; HEADER_SIZE] {
    debug_assert!(len <= u16::max_value() as usize);

    let mut header = [0u8; HEADER_SIZE];
    header[0] = code;
    LittleEndian::write_u16(&mut header[1..], len as u16);
    header
}

/// Unpacks a stream frame header into its opcode and payload length.
#[inline]
pub(crate) fn decode_header(header: &[u8; HEADER_SIZE]) -> (u8, usize) {
    (header[0], LittleEndian::read_u16(&header[1..]) as usize)
}

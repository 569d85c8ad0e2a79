use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Longest accepted service identifier, in bytes, after the optional
/// leading slash is stripped.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Largest payload the wire format can carry (the length field is u16).
pub const MAX_WIRE_PAYLOAD: u32 = u16::max_value() as u32;

/// The part of the configuration shared by a server and its clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProtocolConfig {
    /// The server name in the service namespace.
    pub identifier: String,
    /// Maximum size in bytes for a message from client to server.
    pub max_send_size: u32,
    /// Maximum size in bytes for a reply from server to client.
    pub max_reply_size: u32,
    /// Maximum size in bytes for a notification from server to client.
    pub max_notify_size: u32,
}

impl ServiceProtocolConfig {
    /// Loads the protocol configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> ServiceProtocolConfig {
        serdeconv::from_toml_file(path).expect("Error loading service protocol configuration file")
    }

    /// Returns the identifier stripped of one leading slash, after checking
    /// the naming rules.
    pub(crate) fn service_name(&self) -> Result<&str> {
        let name = match self.identifier.strip_prefix('/') {
            Some(stripped) => stripped,
            None => self.identifier.as_str(),
        };

        if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::Invalid);
        }

        Ok(name)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.service_name()?;

        if self.max_send_size > MAX_WIRE_PAYLOAD
            || self.max_reply_size > MAX_WIRE_PAYLOAD
            || self.max_notify_size > MAX_WIRE_PAYLOAD
        {
            return Err(Error::Invalid);
        }

        Ok(())
    }
}

/// Client connection tuning knobs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum number of reply-bearing messages issued concurrently.
    /// 0 if async replies are not used.
    pub max_async_replies: u32,
    /// Maximum number of fire-and-forget messages queued on the client
    /// side. 0 if there is no client side queue.
    pub max_queued_sends: u32,
    /// true if delivery is serialized across delivery types
    /// (fire-and-forget and reply-bearing share one queue).
    pub fully_ordered: bool,
    /// true if sends always transmit on the background thread
    /// (requires a nonzero `max_queued_sends`).
    pub truly_async: bool,
    /// true if the first connection attempt runs on the thread calling
    /// `start` (can deadlock if starting from within a callback).
    pub sync_first_connect: bool,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_async_replies: 1,
            max_queued_sends: 1,
            fully_ordered: false,
            truly_async: false,
            sync_first_connect: false,
        }
    }
}

impl ClientConfig {
    /// Loads the client configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading client configuration file")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.truly_async && self.max_queued_sends == 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

/// Server tuning knobs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of client messages queued on the server side;
    /// at least 1. Stream transports buffer in the kernel, so the value
    /// only bounds transports with explicit input queues.
    pub max_queued_sends: u32,
    /// Number of preallocated server connections. 0 disables
    /// preallocation; only meaningful on transports with monotonic
    /// allocation.
    pub pre_alloc_connections: u32,
    /// Maximum number of notifications per connection queued on the
    /// server side. 0 if notifications are not used, otherwise at
    /// least 1.
    pub max_queued_notifies: u32,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_queued_sends: 1,
            pre_alloc_connections: 0,
            max_queued_notifies: 1,
        }
    }
}

impl ServerConfig {
    /// Loads the server configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_queued_sends == 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

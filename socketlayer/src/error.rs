use std::fmt::{Display, Formatter};
use crate::connection::ConnectionState;

/// Errors that callers of the socket layer can react to. Malformed incoming packets are not
///  reported this way: they are logged and dropped at the receive boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketLayerError {
    /// The send window has no free slot. This is fatal for the connection that hit it.
    BufferFull { capacity: usize },
    /// Sending requires a connection that is connected or connecting
    NotConnected { state: ConnectionState },
    /// The message does not fit into the packets available for its channel
    MessageTooBig { len: usize, max: usize },
}

impl Display for SocketLayerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketLayerError::BufferFull { capacity } => write!(f, "send buffer is full ({} packets in flight)", capacity),
            SocketLayerError::NotConnected { state } => write!(f, "connection is not connected, state is {:?}", state),
            SocketLayerError::MessageTooBig { len, max } => write!(f, "message of {} bytes exceeds the maximum of {} bytes", len, max),
        }
    }
}

impl std::error::Error for SocketLayerError {}

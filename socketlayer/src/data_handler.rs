#[cfg(test)] use mockall::automock;
use crate::connection::Connection;

/// The channel a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Notify,
    Unreliable,
}

/// Application callback for received messages.
///
/// Messages are delivered synchronously from the connection's receive path, and the handler
///  gets mutable access to the connection, e.g. to send a reply or to disconnect. If the
///  handler disconnects, the rest of the packet's messages are dropped.
#[cfg_attr(test, automock)]
pub trait DataHandler: Send + Sync + 'static {
    fn on_message(&self, connection: &mut Connection, channel: Channel, message: &[u8]);
}

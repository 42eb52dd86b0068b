use crate::ack_system::{AckSystem, ReliableMessage};
use crate::config::SocketLayerConfig;
use crate::data_handler::{Channel, DataHandler};
use crate::error::SocketLayerError;
use crate::message_header::BatchReader;
use crate::metrics::ConnectionMetrics;
use crate::notify::{NotifyCallback, NotifyOutcome, NotifyToken};
use crate::packet_header::{DisconnectReason, PacketType, RejectReason, PACKET_TYPE_SIZE};
use crate::send_socket::SendSocket;
use crate::trackers::{ConnectingTracker, DisconnectedTracker, KeepAliveTracker, TimeoutTracker};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnected,
    Removing,
    Destroyed,
}

/// Things the owner of a connection needs to react to. They are queued by the connection and
///  drained by the owner via [Connection::pop_event].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    FailedToConnect(RejectReason),
    Disconnected(DisconnectReason),
    /// the connection is done and wants to be removed and destroyed
    RemoveRequested,
}

/// The state of the link to a single remote peer: handshake, liveness, and the reliability
///  layer for data exchanged with that peer.
pub struct Connection {
    config: Arc<SocketLayerConfig>,
    remote_addr: SocketAddr,
    state: ConnectionState,

    send_socket: Arc<dyn SendSocket>,
    data_handler: Arc<dyn DataHandler>,
    ack_system: AckSystem,

    connecting_tracker: ConnectingTracker,
    timeout_tracker: TimeoutTracker,
    keep_alive_tracker: KeepAliveTracker,
    disconnected_tracker: DisconnectedTracker,

    events: VecDeque<ConnectionEvent>,
    metrics: ConnectionMetrics,
}
impl Connection {
    pub fn new(config: Arc<SocketLayerConfig>, remote_addr: SocketAddr, send_socket: Arc<dyn SendSocket>, data_handler: Arc<dyn DataHandler>, now: Instant) -> Connection {
        Connection {
            ack_system: AckSystem::new(config.clone()),
            connecting_tracker: ConnectingTracker::new(&config),
            timeout_tracker: TimeoutTracker::new(&config, now),
            keep_alive_tracker: KeepAliveTracker::new(&config, now),
            disconnected_tracker: DisconnectedTracker::new(&config),
            config,
            remote_addr,
            state: ConnectionState::Created,
            send_socket,
            data_handler,
            events: VecDeque::new(),
            metrics: ConnectionMetrics::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn pop_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    fn set_state(&mut self, new_state: ConnectionState) -> bool {
        use ConnectionState::*;

        let is_legal = matches!((self.state, new_state),
            (Created, Connecting)
            | (Created | Connecting, Connected)
            | (Connected, Disconnected)
            | (Created | Connecting | Disconnected, Removing)
            | (Removing, Destroyed)
        );
        if !is_legal {
            error!("illegal state transition for connection to {:?}: {:?} -> {:?}", self.remote_addr, self.state, new_state);
            debug_assert!(false, "illegal state transition {:?} -> {:?}", self.state, new_state);
            return false;
        }

        debug!("connection to {:?}: {:?} -> {:?}", self.remote_addr, self.state, new_state);
        self.state = new_state;
        true
    }

    fn send_raw(&mut self, packet: &[u8], now: Instant) {
        self.send_socket.send_packet(self.remote_addr, packet);
        self.metrics.on_packet_sent(packet);
        self.keep_alive_tracker.set_send_time(now);
    }

    fn send_control(&mut self, packet_type: PacketType, reason: Option<u8>, now: Instant) {
        let mut packet: Vec<u8> = vec![packet_type.into()];
        packet.extend(reason);
        self.send_raw(&packet, now);
    }

    fn flush_outgoing(&mut self, now: Instant) {
        while let Some(packet) = self.ack_system.pop_outgoing() {
            self.send_raw(&packet, now);
        }
    }

    /// Starts the handshake with the remote peer
    pub fn connect(&mut self, now: Instant) {
        if !self.set_state(ConnectionState::Connecting) {
            return;
        }
        self.send_connect_request(now);
    }

    fn send_connect_request(&mut self, now: Instant) {
        self.connecting_tracker.on_attempt(now);
        debug!("sending connect request #{} to {:?}", self.connecting_tracker.attempt_count(), self.remote_addr);

        let mut packet: Vec<u8> = Vec::with_capacity(PACKET_TYPE_SIZE + self.config.connect_key.len());
        packet.push(PacketType::ConnectRequest.into());
        packet.extend_from_slice(&self.config.connect_key);
        self.send_raw(&packet, now);
    }

    /// Accepts a remote peer's connect request. The caller is responsible for checking that
    ///  the request is acceptable.
    pub fn accept(&mut self, now: Instant) {
        if !self.set_state(ConnectionState::Connected) {
            return;
        }
        self.send_control(PacketType::ConnectionAccepted, None, now);
        self.on_connected(now);
    }

    fn on_connected(&mut self, now: Instant) {
        self.timeout_tracker.set_receive_time(now);
        self.events.push_back(ConnectionEvent::Connected);
    }

    /// A remote peer sent a connect request for an existing connection
    pub fn on_connect_request(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connected => {
                debug!("duplicate connect request from {:?} - re-sending acceptance", self.remote_addr);
                self.send_control(PacketType::ConnectionAccepted, None, now);
            }
            ConnectionState::Disconnected => {
                debug!("connect request from {:?} while the connection is winding down - rejecting", self.remote_addr);
                self.send_control(PacketType::ConnectionRejected, Some(RejectReason::ClosedByPeer.into()), now);
            }
            state => {
                debug!("ignoring connect request from {:?} in state {:?}", self.remote_addr, state);
            }
        }
    }

    /// Local request to end the connection. Calling this more than once has no effect.
    pub fn disconnect(&mut self, now: Instant) {
        self.disconnect_with_reason(DisconnectReason::RequestedByLocalPeer, now);
    }

    /// Ends the connection, telling the remote peer the reason unless it is the one that
    ///  asked for the disconnect. A connection that is still connecting fails instead.
    pub fn disconnect_with_reason(&mut self, reason: DisconnectReason, now: Instant) {
        match self.state {
            ConnectionState::Connected => {
                self.do_disconnect(reason, now);
            }
            ConnectionState::Connecting => {
                debug!("aborting connection to {:?} before it was established: {:?}", self.remote_addr, reason);
                self.fail_to_connect(RejectReason::ClosedByPeer);
            }
            ConnectionState::Created => {
                self.request_removal();
            }
            _ => {
                trace!("disconnect for connection to {:?} in state {:?} - ignoring", self.remote_addr, self.state);
            }
        }
    }

    /// Asks the owner to remove this connection right away, skipping the grace period of a
    ///  disconnected connection. Has no effect on connections that are connected or already
    ///  being removed.
    pub fn request_removal(&mut self) {
        match self.state {
            ConnectionState::Created | ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Removing);
                self.events.push_back(ConnectionEvent::RemoveRequested);
            }
            _ => {}
        }
    }

    fn do_disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        if !self.set_state(ConnectionState::Disconnected) {
            return;
        }
        debug!("connection to {:?} disconnected: {:?}", self.remote_addr, reason);
        if reason != DisconnectReason::RequestedByRemotePeer {
            self.send_control(PacketType::Disconnect, Some(reason.into()), now);
        }
        self.disconnected_tracker.on_disconnect(now);
        self.events.push_back(ConnectionEvent::Disconnected(reason));
    }

    fn fail_to_connect(&mut self, reason: RejectReason) {
        if !self.set_state(ConnectionState::Removing) {
            return;
        }
        debug!("connecting to {:?} failed: {:?}", self.remote_addr, reason);
        self.events.push_back(ConnectionEvent::FailedToConnect(reason));
        self.events.push_back(ConnectionEvent::RemoveRequested);
    }

    /// Releases the connection's resources. Notify sends that are still in flight resolve
    ///  as lost.
    pub fn destroy(&mut self) {
        if !self.set_state(ConnectionState::Destroyed) {
            return;
        }
        self.ack_system.clear_and_release();
    }

    fn check_can_send(&self) -> Result<(), SocketLayerError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
            state => Err(SocketLayerError::NotConnected { state }),
        }
    }

    fn on_send_result<T>(&mut self, result: Result<T, SocketLayerError>, now: Instant) -> Result<T, SocketLayerError> {
        self.flush_outgoing(now);
        if let Err(SocketLayerError::BufferFull { .. }) = &result {
            warn!("send buffer for {:?} is full - disconnecting", self.remote_addr);
            if self.state == ConnectionState::Connected {
                self.do_disconnect(DisconnectReason::SendBufferFull, now);
            }
            else {
                self.fail_to_connect(RejectReason::Timeout);
            }
        }
        result
    }

    fn on_message_send_result<T>(&mut self, channel: Channel, len: usize, result: Result<T, SocketLayerError>, now: Instant) -> Result<T, SocketLayerError> {
        if result.is_ok() {
            self.metrics.on_message_sent(channel, len);
        }
        self.on_send_result(result, now)
    }

    /// Sends a message that is delivered exactly once and in order, unless the connection
    ///  breaks down. A full send window is fatal for the connection: it is disconnected, and
    ///  the error is returned.
    pub fn send_reliable(&mut self, message: &[u8], now: Instant) -> Result<(), SocketLayerError> {
        self.check_can_send()?;
        let result = self.ack_system.send_reliable(message, now);
        self.on_message_send_result(Channel::Reliable, message.len(), result, now)
    }

    /// Sends a message that is delivered at most once, and reports the outcome through the
    ///  returned token
    pub fn send_notify(&mut self, message: &[u8], now: Instant) -> Result<NotifyToken, SocketLayerError> {
        self.check_can_send()?;
        let result = self.ack_system.send_notify(message, None);
        self.on_message_send_result(Channel::Notify, message.len(), result, now)
    }

    pub fn send_notify_with_callback(&mut self, message: &[u8], callback: impl FnOnce(NotifyOutcome) + Send + 'static, now: Instant) -> Result<NotifyToken, SocketLayerError> {
        self.check_can_send()?;
        let callback: NotifyCallback = Box::new(callback);
        let result = self.ack_system.send_notify(message, Some(callback));
        self.on_message_send_result(Channel::Notify, message.len(), result, now)
    }

    /// Sends a message without any delivery guarantees
    pub fn send_unreliable(&mut self, message: &[u8], now: Instant) -> Result<(), SocketLayerError> {
        self.check_can_send()?;
        let max = self.config.max_packet_size - PACKET_TYPE_SIZE;
        if message.len() > max {
            return Err(SocketLayerError::MessageTooBig { len: message.len(), max });
        }

        let mut packet: Vec<u8> = Vec::with_capacity(PACKET_TYPE_SIZE + message.len());
        packet.push(PacketType::Unreliable.into());
        packet.extend_from_slice(message);
        self.send_raw(&packet, now);
        self.metrics.on_message_sent(Channel::Unreliable, message.len());
        Ok(())
    }

    /// Handles a packet received from the remote peer. Malformed packets are logged and dropped.
    pub fn receive_packet(&mut self, packet: Bytes, now: Instant) {
        let packet_type = match PacketType::of_packet(&packet) {
            Ok(t) => t,
            Err(e) => {
                warn!("dropping packet from {:?}: {}", self.remote_addr, e);
                return;
            }
        };
        self.metrics.on_packet_received(packet_type, packet.len());

        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            state => {
                trace!("dropping {:?} packet from {:?} in state {:?}", packet_type, self.remote_addr, state);
                return;
            }
        }
        self.timeout_tracker.set_receive_time(now);

        match packet_type {
            PacketType::ConnectRequest => self.on_connect_request(now),
            PacketType::ConnectionAccepted => {
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                    self.on_connected(now);
                }
                else {
                    trace!("duplicate connection acceptance from {:?}", self.remote_addr);
                }
            }
            PacketType::ConnectionRejected => {
                if self.state != ConnectionState::Connecting {
                    warn!("connection rejection from {:?} in state {:?} - ignoring", self.remote_addr, self.state);
                    return;
                }
                match packet.get(PACKET_TYPE_SIZE).map(|&r| RejectReason::try_from(r)) {
                    Some(Ok(reason)) => self.fail_to_connect(reason),
                    _ => warn!("dropping connection rejection with missing or invalid reason from {:?}", self.remote_addr),
                }
            }
            PacketType::Disconnect => {
                if self.state != ConnectionState::Connected {
                    return;
                }
                // the remote peer's reason is informational
                if let Some(reason) = packet.get(PACKET_TYPE_SIZE) {
                    debug!("remote peer {:?} disconnected with reason {:?}", self.remote_addr, DisconnectReason::try_from(*reason));
                }
                self.do_disconnect(DisconnectReason::RequestedByRemotePeer, now);
            }
            PacketType::KeepAlive => {
                trace!("keep-alive from {:?}", self.remote_addr);
            }
            PacketType::Unreliable => {
                if self.is_connected() {
                    self.deliver(Channel::Unreliable, &packet[PACKET_TYPE_SIZE..]);
                }
            }
            PacketType::Notify | PacketType::Reliable | PacketType::ReliableFragment | PacketType::Ack => {
                if !self.is_connected() {
                    trace!("dropping {:?} packet from {:?}: not connected yet", packet_type, self.remote_addr);
                    return;
                }
                if let Some(notify_payload) = self.ack_system.on_packet(packet, now) {
                    self.deliver(Channel::Notify, &notify_payload);
                }
                self.deliver_reliable();
            }
        }
        self.flush_outgoing(now);
    }

    fn deliver(&mut self, channel: Channel, message: &[u8]) {
        self.metrics.on_message_received(channel, message.len());
        let handler = self.data_handler.clone();
        handler.on_message(self, channel, message);
    }

    fn deliver_reliable(&mut self) {
        while self.is_connected() {
            let Some(message) = self.ack_system.next_reliable_message() else {
                return;
            };
            match message {
                ReliableMessage::Fragmented(message) => self.deliver(Channel::Reliable, &message),
                ReliableMessage::Batch(batch) => self.deliver_batch(batch),
            }
        }
    }

    fn deliver_batch(&mut self, batch: Bytes) {
        for message in BatchReader::new(batch) {
            if !self.is_connected() {
                debug!("connection to {:?} is no longer connected - dropping the rest of the batch", self.remote_addr);
                return;
            }
            match message {
                Ok(message) => self.deliver(Channel::Reliable, &message),
                Err(e) => warn!("malformed batch from {:?}: {} - dropping the rest", self.remote_addr, e),
            }
        }
    }

    /// Time-based work, called once per tick
    pub fn update(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                if self.connecting_tracker.time_attempt(now) {
                    if self.connecting_tracker.max_attempts() {
                        debug!("no reply from {:?} after {} connect attempts", self.remote_addr, self.connecting_tracker.attempt_count());
                        self.fail_to_connect(RejectReason::Timeout);
                    }
                    else {
                        self.send_connect_request(now);
                    }
                }
            }
            ConnectionState::Connected => {
                if self.timeout_tracker.time_to_disconnect(now) {
                    debug!("no packets received from {:?} for {:?}", self.remote_addr, self.config.timeout_duration);
                    self.do_disconnect(DisconnectReason::Timeout, now);
                    return;
                }

                let result = self.ack_system.update(now);
                if self.on_send_result(result, now).is_err() {
                    return;
                }

                if self.keep_alive_tracker.time_to_send(now) {
                    trace!("sending keep-alive to {:?}", self.remote_addr);
                    self.send_control(PacketType::KeepAlive, None, now);
                }
            }
            ConnectionState::Disconnected => {
                if self.disconnected_tracker.time_to_remove(now) {
                    self.request_removal();
                }
            }
            ConnectionState::Created | ConnectionState::Removing | ConnectionState::Destroyed => {}
        }
    }
}

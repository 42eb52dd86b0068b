use crate::config::SocketLayerConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::data_handler::DataHandler;
use crate::packet_header::{PacketType, RejectReason, DisconnectReason, PACKET_TYPE_SIZE};
use crate::send_socket::{ReceiveSocket, SendSocket};
#[cfg(test)] use mockall::automock;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// Application callbacks for the lifecycle of connections
#[cfg_attr(test, automock)]
pub trait PeerEvents: Send + Sync + 'static {
    fn on_connected(&self, addr: SocketAddr);
    fn on_connection_failed(&self, addr: SocketAddr, reason: RejectReason);
    fn on_disconnected(&self, addr: SocketAddr, reason: DisconnectReason);
}

/// A Peer is the place where everything comes together: it owns the connections to all
///  remote peers, routes incoming packets to them by remote address, answers connect requests,
///  and drives the connections' time-based work.
///
/// A Peer is single threaded: the receive path and the tick must be called from the same
///  task, which is what [Peer::run] does.
pub struct Peer {
    config: Arc<SocketLayerConfig>,
    send_socket: Arc<dyn SendSocket>,
    data_handler: Arc<dyn DataHandler>,
    events: Arc<dyn PeerEvents>,
    connections: FxHashMap<SocketAddr, Connection>,
}
impl Peer {
    pub fn new(config: Arc<SocketLayerConfig>, send_socket: Arc<dyn SendSocket>, data_handler: Arc<dyn DataHandler>, events: Arc<dyn PeerEvents>) -> anyhow::Result<Peer> {
        config.validate()?;

        Ok(Peer {
            config,
            send_socket,
            data_handler,
            events,
            connections: FxHashMap::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.send_socket.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    /// Access to a connection for sending. Events caused by a send (e.g. a disconnect because
    ///  the send buffer is full) are processed on the next call to [Peer::update] or
    ///  [Peer::receive_packet].
    pub fn connection_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(addr)
    }

    /// Starts connecting to a remote peer. The outcome is reported through [PeerEvents].
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> anyhow::Result<()> {
        match self.connections.entry(addr) {
            Entry::Occupied(e) => bail!("there is already a connection to {:?} in state {:?}", addr, e.get().state()),
            Entry::Vacant(e) => {
                info!("connecting to {:?}", addr);
                let connection = e.insert(Connection::new(self.config.clone(), addr, self.send_socket.clone(), self.data_handler.clone(), now));
                connection.connect(now);
            }
        }
        Ok(())
    }

    /// Handles a datagram received on the socket. Malformed packets and packets from unknown
    ///  addresses are logged and dropped.
    pub fn receive_packet(&mut self, from: SocketAddr, packet: Bytes, now: Instant) {
        if packet.len() > self.config.max_packet_size {
            warn!("received packet of {} bytes from {:?}, exceeding the maximum packet size - dropping", packet.len(), from);
            return;
        }
        let packet_type = match PacketType::of_packet(&packet) {
            Ok(t) => t,
            Err(e) => {
                warn!("dropping packet from {:?}: {}", from, e);
                return;
            }
        };

        match self.connections.get_mut(&from) {
            Some(connection) => {
                if packet_type == PacketType::ConnectRequest {
                    connection.on_connect_request(now);
                }
                else {
                    connection.receive_packet(packet, now);
                }
            }
            None => {
                if packet_type == PacketType::ConnectRequest {
                    self.on_connect_request(from, &packet[PACKET_TYPE_SIZE..], now);
                }
                else {
                    debug!("received {:?} packet from {:?} without a connection - dropping", packet_type, from);
                }
            }
        }
        self.process_events();
    }

    fn on_connect_request(&mut self, from: SocketAddr, connect_key: &[u8], now: Instant) {
        if connect_key != self.config.connect_key.as_slice() {
            info!("rejecting connect request from {:?}: invalid key", from);
            self.send_rejection(from, RejectReason::KeyInvalid);
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            info!("rejecting connect request from {:?}: {} connections already", from, self.connections.len());
            self.send_rejection(from, RejectReason::ServerFull);
            return;
        }

        info!("accepting connection from {:?}", from);
        let mut connection = Connection::new(self.config.clone(), from, self.send_socket.clone(), self.data_handler.clone(), now);
        connection.accept(now);
        self.connections.insert(from, connection);
    }

    fn send_rejection(&self, to: SocketAddr, reason: RejectReason) {
        self.send_socket.send_packet(to, &[PacketType::ConnectionRejected.into(), reason.into()]);
    }

    /// Drives the time-based work of all connections
    pub fn update(&mut self, now: Instant) {
        for connection in self.connections.values_mut() {
            connection.update(now);
        }
        self.process_events();
    }

    fn process_events(&mut self) {
        let mut to_remove = Vec::new();

        for (addr, connection) in self.connections.iter_mut() {
            while let Some(evt) = connection.pop_event() {
                match evt {
                    ConnectionEvent::Connected => self.events.on_connected(*addr),
                    ConnectionEvent::FailedToConnect(reason) => self.events.on_connection_failed(*addr, reason),
                    ConnectionEvent::Disconnected(reason) => self.events.on_disconnected(*addr, reason),
                    ConnectionEvent::RemoveRequested => to_remove.push(*addr),
                }
            }
        }

        for addr in to_remove {
            if let Some(mut connection) = self.connections.remove(&addr) {
                debug!("removing connection to {:?}", addr);
                connection.destroy();
            }
        }
    }

    /// Disconnects all connections and releases their resources
    pub fn close(&mut self, now: Instant) {
        info!("closing {} connections", self.connections.len());
        for connection in self.connections.values_mut() {
            connection.disconnect_with_reason(DisconnectReason::ClosedByPeer, now);
            connection.request_removal();
        }
        self.process_events();
        debug_assert!(self.connections.is_empty());
    }

    /// Receive loop and tick timer, until the shutdown signal fires (or its sender is dropped)
    pub async fn run(&mut self, receive_socket: Arc<dyn ReceiveSocket>, tick_interval: Duration, mut shutdown: oneshot::Receiver<()>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.max_packet_size + 1];
        let mut ticks = interval(tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let received = select! {
                result = receive_socket.receive_packet(&mut buf) => Some(result),
                _ = ticks.tick() => {
                    self.update(Instant::now());
                    None
                }
                _ = &mut shutdown => {
                    info!("shutting down");
                    self.close(Instant::now());
                    return;
                }
            };

            let (num_read, from) = match received {
                None => continue,
                Some(Ok(x)) => x,
                Some(Err(e)) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received packet of {} bytes from {:?}", num_read, from);
            self.receive_packet(from, Bytes::copy_from_slice(&buf[..num_read]), Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_handler::Channel;
    use crate::send_socket::MockSendSocket;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Wire = Arc<Mutex<VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>>>;

    /// all peers of a test share a single 'wire'
    struct WireSendSocket {
        addr: SocketAddr,
        wire: Wire,
    }
    impl SendSocket for WireSendSocket {
        fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
            self.wire.lock().unwrap().push_back((self.addr, to, packet_buf.to_vec()));
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
    }

    #[derive(Default)]
    struct CollectingDataHandler {
        messages: Mutex<Vec<(SocketAddr, Channel, Vec<u8>)>>,
    }
    impl DataHandler for CollectingDataHandler {
        fn on_message(&self, connection: &mut Connection, channel: Channel, message: &[u8]) {
            self.messages.lock().unwrap().push((connection.remote_addr(), channel, message.to_vec()));
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Evt {
        Connected(SocketAddr),
        Failed(SocketAddr, RejectReason),
        Disconnected(SocketAddr, DisconnectReason),
    }

    #[derive(Default)]
    struct CollectingPeerEvents {
        events: Mutex<Vec<Evt>>,
    }
    impl PeerEvents for CollectingPeerEvents {
        fn on_connected(&self, addr: SocketAddr) {
            self.events.lock().unwrap().push(Evt::Connected(addr));
        }
        fn on_connection_failed(&self, addr: SocketAddr, reason: RejectReason) {
            self.events.lock().unwrap().push(Evt::Failed(addr, reason));
        }
        fn on_disconnected(&self, addr: SocketAddr, reason: DisconnectReason) {
            self.events.lock().unwrap().push(Evt::Disconnected(addr, reason));
        }
    }
    impl CollectingPeerEvents {
        fn take(&self) -> Vec<Evt> {
            self.events.lock().unwrap().drain(..).collect()
        }
    }

    struct TestPeer {
        peer: Peer,
        messages: Arc<CollectingDataHandler>,
        events: Arc<CollectingPeerEvents>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn test_peer(config: SocketLayerConfig, port: u16, wire: &Wire) -> TestPeer {
        let messages = Arc::new(CollectingDataHandler::default());
        let events = Arc::new(CollectingPeerEvents::default());
        let socket = Arc::new(WireSendSocket { addr: addr(port), wire: wire.clone() });
        let peer = Peer::new(Arc::new(config), socket, messages.clone(), events.clone()).unwrap();
        TestPeer { peer, messages, events }
    }

    /// delivers packets on the wire until it is empty
    fn transfer(wire: &Wire, peers: &mut [&mut TestPeer], now: Instant) {
        loop {
            let Some((from, to, packet)) = wire.lock().unwrap().pop_front() else {
                return;
            };
            if let Some(target) = peers.iter_mut().find(|p| p.peer.local_addr() == to) {
                target.peer.receive_packet(from, Bytes::from(packet), now);
            }
        }
    }

    #[test]
    fn test_connect_and_exchange_data() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut client = test_peer(SocketLayerConfig::default(), 1, &wire);
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        client.peer.connect(addr(2), now).unwrap();
        transfer(&wire, &mut [&mut client, &mut server], now);

        assert_eq!(client.events.take(), vec![Evt::Connected(addr(2))]);
        assert_eq!(server.events.take(), vec![Evt::Connected(addr(1))]);
        assert!(client.peer.connection(&addr(2)).unwrap().is_connected());

        let big = vec![7u8; 3000];
        let connection = client.peer.connection_mut(&addr(2)).unwrap();
        connection.send_reliable(b"hi", now).unwrap();
        connection.send_reliable(&big, now).unwrap();
        connection.send_unreliable(b"fast", now).unwrap();
        client.peer.update(now);
        transfer(&wire, &mut [&mut client, &mut server], now);

        let received = server.messages.messages.lock().unwrap().clone();
        assert_eq!(received, vec![
            (addr(1), Channel::Reliable, b"hi".to_vec()),
            (addr(1), Channel::Reliable, big),
            (addr(1), Channel::Unreliable, b"fast".to_vec()),
        ]);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut client = test_peer(SocketLayerConfig { connect_key: b"other".to_vec(), ..Default::default() }, 1, &wire);
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        client.peer.connect(addr(2), now).unwrap();
        transfer(&wire, &mut [&mut client, &mut server], now);

        assert_eq!(client.events.take(), vec![Evt::Failed(addr(2), RejectReason::KeyInvalid)]);
        assert_eq!(client.peer.connection_count(), 0);
        assert_eq!(server.peer.connection_count(), 0);
        assert!(server.events.take().is_empty());
    }

    #[test]
    fn test_server_full() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut client_1 = test_peer(SocketLayerConfig::default(), 1, &wire);
        let mut client_2 = test_peer(SocketLayerConfig::default(), 3, &wire);
        let mut server = test_peer(SocketLayerConfig { max_connections: 1, ..Default::default() }, 2, &wire);

        client_1.peer.connect(addr(2), now).unwrap();
        client_2.peer.connect(addr(2), now).unwrap();
        transfer(&wire, &mut [&mut client_1, &mut client_2, &mut server], now);

        assert_eq!(client_1.events.take(), vec![Evt::Connected(addr(2))]);
        assert_eq!(client_2.events.take(), vec![Evt::Failed(addr(2), RejectReason::ServerFull)]);
        assert_eq!(server.peer.connection_count(), 1);
    }

    #[test]
    fn test_duplicate_connect_request_is_answered() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        let mut request: Vec<u8> = vec![PacketType::ConnectRequest.into()];
        request.extend_from_slice(&SocketLayerConfig::default().connect_key);

        server.peer.receive_packet(addr(1), Bytes::from(request.clone()), now);
        server.peer.receive_packet(addr(1), Bytes::from(request), now);

        let answers: Vec<_> = wire.lock().unwrap().drain(..).map(|(_, to, p)| (to, p)).collect();
        assert_eq!(answers, vec![(addr(1), vec![2u8]), (addr(1), vec![2u8])]);
        assert_eq!(server.peer.connection_count(), 1);
        assert_eq!(server.events.take(), vec![Evt::Connected(addr(1))]);
    }

    #[test]
    fn test_connect_timeout() {
        let start = Instant::now();
        let wire = Wire::default();
        let config = SocketLayerConfig::default();
        let interval = config.connect_attempt_interval + Duration::from_millis(1);
        let max_attempts = config.max_connect_attempts;
        let mut client = test_peer(config, 1, &wire);

        client.peer.connect(addr(2), start).unwrap();
        for i in 1..=max_attempts {
            client.peer.update(start + interval * i);
        }

        assert_eq!(wire.lock().unwrap().len(), max_attempts as usize);
        assert_eq!(client.events.take(), vec![Evt::Failed(addr(2), RejectReason::Timeout)]);
        assert_eq!(client.peer.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_timeout_and_removal() {
        let start = Instant::now();
        let wire = Wire::default();
        let mut client = test_peer(SocketLayerConfig::default(), 1, &wire);
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        client.peer.connect(addr(2), start).unwrap();
        transfer(&wire, &mut [&mut client, &mut server], start);
        client.events.take();
        server.events.take();

        // the client goes silent
        let after_timeout = start + Duration::from_millis(5001);
        server.peer.update(after_timeout);
        assert_eq!(server.events.take(), vec![Evt::Disconnected(addr(1), DisconnectReason::Timeout)]);
        assert_eq!(server.peer.connection_count(), 1);

        // late packets are ignored during the grace period
        wire.lock().unwrap().clear();
        server.peer.receive_packet(addr(1), Bytes::from_static(&[5, 1]), after_timeout);
        assert!(server.messages.messages.lock().unwrap().is_empty());

        server.peer.update(after_timeout + Duration::from_millis(1001));
        assert_eq!(server.peer.connection_count(), 0);
    }

    #[test]
    fn test_remote_disconnect() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut client = test_peer(SocketLayerConfig::default(), 1, &wire);
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        client.peer.connect(addr(2), now).unwrap();
        transfer(&wire, &mut [&mut client, &mut server], now);
        client.events.take();
        server.events.take();

        client.peer.connection_mut(&addr(2)).unwrap().disconnect(now);
        client.peer.update(now);
        transfer(&wire, &mut [&mut client, &mut server], now);

        assert_eq!(client.events.take(), vec![Evt::Disconnected(addr(2), DisconnectReason::RequestedByLocalPeer)]);
        assert_eq!(server.events.take(), vec![Evt::Disconnected(addr(1), DisconnectReason::RequestedByRemotePeer)]);
    }

    #[test]
    fn test_close() {
        let now = Instant::now();
        let wire = Wire::default();
        let mut client = test_peer(SocketLayerConfig::default(), 1, &wire);
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        client.peer.connect(addr(2), now).unwrap();
        transfer(&wire, &mut [&mut client, &mut server], now);
        client.events.take();
        server.events.take();

        client.peer.close(now);
        assert_eq!(client.events.take(), vec![Evt::Disconnected(addr(2), DisconnectReason::ClosedByPeer)]);
        assert_eq!(client.peer.connection_count(), 0);

        transfer(&wire, &mut [&mut client, &mut server], now);
        assert_eq!(server.events.take(), vec![Evt::Disconnected(addr(1), DisconnectReason::RequestedByRemotePeer)]);
    }

    #[test]
    fn test_unknown_and_oversized_packets_are_dropped() {
        let now = Instant::now();
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_send_packet().never();
        send_socket.expect_local_addr().return_const(addr(2));

        let events = Arc::new(MockPeerEvents::new());
        let mut peer = Peer::new(Arc::new(SocketLayerConfig::default()), Arc::new(send_socket), Arc::new(CollectingDataHandler::default()), events).unwrap();

        peer.receive_packet(addr(1), Bytes::from_static(&[5, 1, 2, 3]), now);
        peer.receive_packet(addr(1), Bytes::from_static(&[]), now);
        peer.receive_packet(addr(1), Bytes::from_static(&[77]), now);
        peer.receive_packet(addr(1), Bytes::from(vec![1u8; 1201]), now);
        assert_eq!(peer.connection_count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Peer::new(
            Arc::new(SocketLayerConfig { sequence_window_bits: 0, ..Default::default() }),
            Arc::new(MockSendSocket::new()),
            Arc::new(CollectingDataHandler::default()),
            Arc::new(MockPeerEvents::new()),
        );
        assert!(result.is_err());
    }

    /// hands out a fixed list of packets, and then blocks forever
    struct ListReceiveSocket {
        packets: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    }
    #[async_trait::async_trait]
    impl ReceiveSocket for ListReceiveSocket {
        async fn receive_packet(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            let next = self.packets.lock().unwrap().pop_front();
            match next {
                Some((from, packet)) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok((packet.len(), from))
                }
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let wire = Wire::default();
        let mut server = test_peer(SocketLayerConfig::default(), 2, &wire);

        let mut request: Vec<u8> = vec![PacketType::ConnectRequest.into()];
        request.extend_from_slice(&SocketLayerConfig::default().connect_key);
        let receive_socket = Arc::new(ListReceiveSocket {
            packets: Mutex::new(VecDeque::from([(addr(1), request), (addr(1), vec![5, 42])])),
        });

        let (shutdown_send, shutdown_recv) = oneshot::channel();
        let shutdown_later = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_send.send(()).unwrap();
        };
        tokio::join!(
            server.peer.run(receive_socket, Duration::from_millis(10), shutdown_recv),
            shutdown_later,
        );

        assert_eq!(server.peer.connection_count(), 0);
        assert_eq!(server.events.take(), vec![
            Evt::Connected(addr(1)),
            Evt::Disconnected(addr(1), DisconnectReason::ClosedByPeer),
        ]);
        assert_eq!(server.messages.messages.lock().unwrap().clone(), vec![(addr(1), Channel::Unreliable, vec![42u8])]);

        let sent: Vec<_> = wire.lock().unwrap().drain(..).map(|(_, to, p)| (to, p)).collect();
        assert_eq!(sent, vec![(addr(1), vec![2u8]), (addr(1), vec![4u8, 5])]);
    }
}

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socketlayer::config::SocketLayerConfig;
use socketlayer::connection::Connection;
use socketlayer::data_handler::{Channel, DataHandler};
use socketlayer::packet_header::{DisconnectReason, RejectReason};
use socketlayer::peer::{Peer, PeerEvents};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{info, Level};

struct EchoHandler {}
impl DataHandler for EchoHandler {
    fn on_message(&self, connection: &mut Connection, channel: Channel, message: &[u8]) {
        info!("server received {:?} message of {} bytes", channel, message.len());
        if channel == Channel::Reliable {
            connection.send_reliable(message, Instant::now()).ok();
        }
    }
}

struct PrintingHandler {}
impl DataHandler for PrintingHandler {
    fn on_message(&self, _connection: &mut Connection, channel: Channel, message: &[u8]) {
        info!("client received {:?}: {}", channel, String::from_utf8_lossy(message));
    }
}

struct LoggingEvents { name: &'static str }
impl PeerEvents for LoggingEvents {
    fn on_connected(&self, addr: SocketAddr) {
        info!("{}: connected to {:?}", self.name, addr);
    }
    fn on_connection_failed(&self, addr: SocketAddr, reason: RejectReason) {
        info!("{}: connection to {:?} failed: {:?}", self.name, addr, reason);
    }
    fn on_disconnected(&self, addr: SocketAddr, reason: DisconnectReason) {
        info!("{}: disconnected from {:?}: {:?}", self.name, addr, reason);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Arc::new(SocketLayerConfig::default());

    let server_socket = Arc::new(UdpSocket::bind(SocketAddr::from_str("127.0.0.1:9810")?).await?);
    let client_socket = Arc::new(UdpSocket::bind(SocketAddr::from_str("127.0.0.1:9811")?).await?);
    let server_addr = server_socket.local_addr()?;

    let mut server = Peer::new(config.clone(), Arc::new(server_socket.clone()), Arc::new(EchoHandler {}), Arc::new(LoggingEvents { name: "server" }))?;
    let (shutdown_server, shutdown) = oneshot::channel();
    let server_task = tokio::spawn(async move {
        server.run(Arc::new(server_socket), Duration::from_millis(10), shutdown).await;
    });

    let mut client = Peer::new(config.clone(), Arc::new(client_socket.clone()), Arc::new(PrintingHandler {}), Arc::new(LoggingEvents { name: "client" }))?;
    client.connect(server_addr, Instant::now())?;

    let mut buf = vec![0u8; config.max_packet_size + 1];
    let mut num_sent = 0;
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(received) = timeout(Duration::from_millis(10), client_socket.recv_from(&mut buf)).await {
            let (len, from) = received?;
            client.receive_packet(from, Bytes::copy_from_slice(&buf[..len]), Instant::now());
        }
        client.update(Instant::now());

        if let Some(connection) = client.connection_mut(&server_addr) {
            if connection.is_connected() && num_sent < 10 {
                connection.send_reliable(format!("hello #{}", num_sent).as_bytes(), Instant::now())?;
                num_sent += 1;
            }
        }
    }

    client.close(Instant::now());
    shutdown_server.send(()).ok();
    server_task.await?;
    Ok(())
}

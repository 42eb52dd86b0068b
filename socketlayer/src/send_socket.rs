use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O
///  part away for testing.
///
/// Sending is synchronous and must not block: it is called from a connection's tick, and a
///  datagram that can not be sent right away is treated like one that was lost on the wire.
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

impl SendSocket for Arc<UdpSocket> {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet of {} bytes to {:?}", packet_buf.len(), to);

        if let Err(e) = self.try_send_to(packet_buf, to) {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The receiving counterpart of [SendSocket]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveSocket: Send + Sync + 'static {
    async fn receive_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl ReceiveSocket for Arc<UdpSocket> {
    async fn receive_packet(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

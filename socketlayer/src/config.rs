use std::time::Duration;
use anyhow::bail;
use crate::packet_header::MIN_RELIABLE_FRAGMENT_HEADER_SIZE;
use crate::sequencer::Sequencer;

pub struct SocketLayerConfig {
    /// This is the payload size inside UDP packets that the socket layer assumes. Packets are
    ///  never bigger than this, big reliable messages are split into fragments instead.
    ///
    /// With full Ethernet frames and no optional IP headers, the maximum would be
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default leaves
    ///  room for tunnels and other surprising network hardware on the route.
    pub max_packet_size: usize,

    /// The number of packets that can be in flight (sent but not acknowledged), and the number
    ///  of reliable messages that can be buffered on the receiving side, is `2^sequence_window_bits`.
    ///
    /// Sequence numbers on the wire have 16 bits, and the window must stay below half of that
    ///  space.
    pub sequence_window_bits: u32,

    /// Upper bound for the number of fragments a single reliable message is split into. This
    ///  limits both the maximum message size and the memory a peer can tie up in reassembly.
    pub max_reliable_fragments: u8,

    /// If set, small reliable messages are combined into a single packet that is sent once per
    ///  tick; otherwise every reliable message is sent in its own packet right away.
    pub send_as_batch: bool,

    pub time_before_resend: Duration,
    pub time_before_empty_ack: Duration,
    pub receives_before_empty_ack: u32,

    pub connect_attempt_interval: Duration,
    pub max_connect_attempts: u32,

    /// a connection without incoming packets for this long is disconnected
    pub timeout_duration: Duration,
    /// a keep-alive packet is sent if nothing else was sent for this long
    pub keep_alive_interval: Duration,
    /// time a disconnected connection lingers, ignoring late packets, before it is removed
    pub disconnected_wait_time: Duration,

    pub max_connections: usize,
    pub connect_key: Vec<u8>,
}

impl Default for SocketLayerConfig {
    fn default() -> Self {
        SocketLayerConfig {
            max_packet_size: 1200,
            sequence_window_bits: 10,
            max_reliable_fragments: 5,
            send_as_batch: true,
            time_before_resend: Duration::from_millis(200),
            time_before_empty_ack: Duration::from_millis(100),
            receives_before_empty_ack: 8,
            connect_attempt_interval: Duration::from_millis(250),
            max_connect_attempts: 10,
            timeout_duration: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(1),
            disconnected_wait_time: Duration::from_secs(1),
            max_connections: 100,
            connect_key: b"socketlayer-v1".to_vec(),
        }
    }
}

impl SocketLayerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < 100 {
            bail!("max packet size is too small");
        }
        if self.max_packet_size > u16::MAX as usize {
            bail!("max packet size must fit into a 16 bit length prefix");
        }
        if self.sequence_window_bits == 0 || self.sequence_window_bits >= Sequencer::WIRE_BITS {
            bail!("sequence window bits must be between 1 and {}, was {}", Sequencer::WIRE_BITS - 1, self.sequence_window_bits);
        }
        if self.max_reliable_fragments == 0 {
            bail!("at least one reliable fragment per message is required");
        }
        if self.max_reliable_fragments as usize > self.window_capacity() {
            bail!("max reliable fragments ({}) exceed the sequence window ({})", self.max_reliable_fragments, self.window_capacity());
        }
        if self.keep_alive_interval >= self.timeout_duration {
            bail!("keep alive interval must be shorter than the timeout, otherwise idle connections time out");
        }
        if self.connect_key.len() > self.max_packet_size - 1 {
            bail!("connect key does not fit into a packet");
        }
        Ok(())
    }

    pub fn window_capacity(&self) -> usize {
        1 << self.sequence_window_bits
    }

    /// payload bytes that fit into a single reliable fragment
    pub fn fragment_payload_size(&self) -> usize {
        self.max_packet_size - MIN_RELIABLE_FRAGMENT_HEADER_SIZE
    }

    /// the biggest reliable message that can be sent
    pub fn max_reliable_message_size(&self) -> usize {
        self.fragment_payload_size() * self.max_reliable_fragments as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(SocketLayerConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::packet_too_small(SocketLayerConfig { max_packet_size: 99, ..Default::default() })]
    #[case::packet_too_big(SocketLayerConfig { max_packet_size: 70_000, ..Default::default() })]
    #[case::no_window(SocketLayerConfig { sequence_window_bits: 0, ..Default::default() })]
    #[case::window_too_big(SocketLayerConfig { sequence_window_bits: 16, ..Default::default() })]
    #[case::no_fragments(SocketLayerConfig { max_reliable_fragments: 0, ..Default::default() })]
    #[case::fragments_exceed_window(SocketLayerConfig { sequence_window_bits: 2, max_reliable_fragments: 5, ..Default::default() })]
    #[case::keep_alive_too_slow(SocketLayerConfig { keep_alive_interval: Duration::from_secs(5), ..Default::default() })]
    fn test_invalid(#[case] config: SocketLayerConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_sizes() {
        let config = SocketLayerConfig::default();
        assert_eq!(config.window_capacity(), 1024);
        assert_eq!(config.fragment_payload_size(), 1200 - 16);
        assert_eq!(config.max_reliable_message_size(), 5 * (1200 - 16));
    }
}

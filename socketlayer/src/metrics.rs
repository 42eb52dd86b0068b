use crate::data_handler::Channel;
use crate::packet_header::PacketType;
use rustc_hash::FxHashMap;

/// Number of packets (or messages) and their total size in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCount {
    pub count: u64,
    pub bytes: u64,
}
impl TrafficCount {
    fn add(&mut self, len: usize) {
        self.count += 1;
        self.bytes += len as u64;
    }
}

/// Traffic counters of a single connection. Packets are counted by type with their full size
///  on the wire, messages by the channel they were sent or delivered on with their payload size.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    packets_sent: FxHashMap<PacketType, TrafficCount>,
    packets_received: FxHashMap<PacketType, TrafficCount>,
    messages_sent: FxHashMap<Channel, TrafficCount>,
    messages_received: FxHashMap<Channel, TrafficCount>,
}

impl ConnectionMetrics {
    pub(crate) fn on_packet_sent(&mut self, packet: &[u8]) {
        if let Ok(packet_type) = PacketType::of_packet(packet) {
            self.packets_sent.entry(packet_type).or_default().add(packet.len());
        }
    }

    pub(crate) fn on_packet_received(&mut self, packet_type: PacketType, len: usize) {
        self.packets_received.entry(packet_type).or_default().add(len);
    }

    pub(crate) fn on_message_sent(&mut self, channel: Channel, len: usize) {
        self.messages_sent.entry(channel).or_default().add(len);
    }

    pub(crate) fn on_message_received(&mut self, channel: Channel, len: usize) {
        self.messages_received.entry(channel).or_default().add(len);
    }

    pub fn packets_sent(&self, packet_type: PacketType) -> TrafficCount {
        self.packets_sent.get(&packet_type).copied().unwrap_or_default()
    }

    pub fn packets_received(&self, packet_type: PacketType) -> TrafficCount {
        self.packets_received.get(&packet_type).copied().unwrap_or_default()
    }

    pub fn messages_sent(&self, channel: Channel) -> TrafficCount {
        self.messages_sent.get(&channel).copied().unwrap_or_default()
    }

    pub fn messages_received(&self, channel: Channel) -> TrafficCount {
        self.messages_received.get(&channel).copied().unwrap_or_default()
    }

    pub fn total_packets_sent(&self) -> TrafficCount {
        Self::total(&self.packets_sent)
    }

    pub fn total_packets_received(&self) -> TrafficCount {
        Self::total(&self.packets_received)
    }

    fn total<K>(counts: &FxHashMap<K, TrafficCount>) -> TrafficCount {
        counts.values()
            .fold(TrafficCount::default(), |acc, c| TrafficCount {
                count: acc.count + c.count,
                bytes: acc.bytes + c.bytes,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_type_and_channel() {
        let mut metrics = ConnectionMetrics::default();

        metrics.on_packet_sent(&[PacketType::Unreliable.into(), 1, 2, 3]);
        metrics.on_packet_sent(&[PacketType::Unreliable.into()]);
        metrics.on_packet_sent(&[PacketType::KeepAlive.into()]);
        metrics.on_packet_sent(&[]);
        metrics.on_packet_received(PacketType::Ack, 11);
        metrics.on_message_sent(Channel::Reliable, 100);
        metrics.on_message_received(Channel::Notify, 7);
        metrics.on_message_received(Channel::Notify, 3);

        assert_eq!(metrics.packets_sent(PacketType::Unreliable), TrafficCount { count: 2, bytes: 5 });
        assert_eq!(metrics.packets_sent(PacketType::KeepAlive), TrafficCount { count: 1, bytes: 1 });
        assert_eq!(metrics.packets_sent(PacketType::Reliable), TrafficCount::default());
        assert_eq!(metrics.total_packets_sent(), TrafficCount { count: 3, bytes: 6 });
        assert_eq!(metrics.packets_received(PacketType::Ack), TrafficCount { count: 1, bytes: 11 });
        assert_eq!(metrics.total_packets_received(), TrafficCount { count: 1, bytes: 11 });
        assert_eq!(metrics.messages_sent(Channel::Reliable), TrafficCount { count: 1, bytes: 100 });
        assert_eq!(metrics.messages_received(Channel::Notify), TrafficCount { count: 2, bytes: 10 });
        assert_eq!(metrics.messages_received(Channel::Unreliable), TrafficCount::default());
    }
}

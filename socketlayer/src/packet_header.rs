use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const PACKET_TYPE_SIZE: usize = size_of::<u8>();
pub const SEQUENCE_SIZE: usize = size_of::<u16>();
pub const ACK_FIELDS_SIZE: usize = size_of::<u16>() + size_of::<u64>();
pub const RELIABLE_ORDER_SIZE: usize = size_of::<u16>();
pub const FRAGMENT_INDEX_SIZE: usize = size_of::<u8>();

/// an ack-only packet: packet type and ack fields
pub const ACK_PACKET_SIZE: usize = PACKET_TYPE_SIZE + ACK_FIELDS_SIZE;
pub const NOTIFY_HEADER_SIZE: usize = PACKET_TYPE_SIZE + SEQUENCE_SIZE + ACK_FIELDS_SIZE;
pub const MIN_RELIABLE_HEADER_SIZE: usize = NOTIFY_HEADER_SIZE + RELIABLE_ORDER_SIZE;
pub const MIN_RELIABLE_FRAGMENT_HEADER_SIZE: usize = MIN_RELIABLE_HEADER_SIZE + FRAGMENT_INDEX_SIZE;

/// The first byte of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    ConnectRequest = 1,
    ConnectionAccepted = 2,
    ConnectionRejected = 3,
    Disconnect = 4,
    Unreliable = 5,
    Notify = 6,
    Reliable = 7,
    ReliableFragment = 8,
    Ack = 9,
    KeepAlive = 10,
}
impl PacketType {
    pub fn of_packet(packet: &[u8]) -> anyhow::Result<PacketType> {
        let Some(&raw) = packet.first() else {
            bail!("empty packet");
        };
        match PacketType::try_from(raw) {
            Ok(packet_type) => Ok(packet_type),
            Err(_) => bail!("unknown packet type {}", raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    /// no packets were received for the configured timeout
    Timeout = 1,
    RequestedByRemotePeer = 2,
    RequestedByLocalPeer = 3,
    /// the send window filled up, i.e. the peer stopped acknowledging packets
    SendBufferFull = 4,
    /// the local peer is shutting down and closes all its connections
    ClosedByPeer = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    /// no reply from the server after the configured number of attempts
    Timeout = 1,
    ServerFull = 2,
    ClosedByPeer = 3,
    KeyInvalid = 4,
}

/// Acknowledgement fields carried by every notify, reliable and ack packet: the most recent
///  packet sequence received, and a mask where bit `i` acknowledges `ack_sequence - i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckFields {
    pub ack_sequence: u16,
    pub ack_mask: u64,
}
impl AckFields {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.ack_sequence);
        buf.put_u64(self.ack_mask);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckFields> {
        if buf.remaining() < ACK_FIELDS_SIZE {
            bail!("packet too short for ack fields");
        }
        Ok(AckFields {
            ack_sequence: buf.get_u16(),
            ack_mask: buf.get_u64(),
        })
    }
}

/// Header of packets that take part in acknowledgement: packet type, packet sequence and
///  the sender's ack fields. Reliable packets extend this with their reliable order and
///  (for fragments) the fragment index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedHeader {
    pub packet_type: PacketType,
    pub sequence: u16,
    pub ack: AckFields,
    pub reliable: Option<ReliableFields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableFields {
    pub order: u16,
    /// only present for fragments; fragments of a message are numbered in descending order,
    ///  the last fragment having index 0
    pub fragment_index: Option<u8>,
}

impl SequencedHeader {
    pub fn serialized_len(packet_type: PacketType) -> usize {
        match packet_type {
            PacketType::Reliable => MIN_RELIABLE_HEADER_SIZE,
            PacketType::ReliableFragment => MIN_RELIABLE_FRAGMENT_HEADER_SIZE,
            _ => NOTIFY_HEADER_SIZE,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type.into());
        buf.put_u16(self.sequence);
        self.ack.ser(buf);
        if let Some(reliable) = &self.reliable {
            buf.put_u16(reliable.order);
            if let Some(fragment_index) = reliable.fragment_index {
                buf.put_u8(fragment_index);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SequencedHeader> {
        if buf.remaining() < PACKET_TYPE_SIZE + SEQUENCE_SIZE {
            bail!("packet too short for a sequenced header");
        }
        let raw_type = buf.get_u8();
        let packet_type = match PacketType::try_from(raw_type) {
            Ok(t @ (PacketType::Notify | PacketType::Reliable | PacketType::ReliableFragment)) => t,
            _ => bail!("packet type {} is not sequenced", raw_type),
        };
        let sequence = buf.get_u16();
        let ack = AckFields::deser(buf)?;

        let reliable = match packet_type {
            PacketType::Notify => None,
            _ => {
                if buf.remaining() < RELIABLE_ORDER_SIZE {
                    bail!("packet too short for reliable order");
                }
                let order = buf.get_u16();
                let fragment_index = if packet_type == PacketType::ReliableFragment {
                    if !buf.has_remaining() {
                        bail!("packet too short for fragment index");
                    }
                    Some(buf.get_u8())
                }
                else {
                    None
                };
                Some(ReliableFields { order, fragment_index })
            }
        };

        Ok(SequencedHeader {
            packet_type,
            sequence,
            ack,
            reliable,
        })
    }

    /// Overwrites sequence and ack fields of an already serialized packet, e.g. before
    ///  re-sending it
    pub fn patch_sequence_and_ack(buf: &mut [u8], sequence: u16, ack: AckFields) {
        let mut target = &mut buf[PACKET_TYPE_SIZE..NOTIFY_HEADER_SIZE];
        target.put_u16(sequence);
        ack.ser(&mut target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::notify(SequencedHeader { packet_type: PacketType::Notify, sequence: 3, ack: AckFields { ack_sequence: 5, ack_mask: 0b101 }, reliable: None },
        vec![6, 0,3, 0,5, 0,0,0,0,0,0,0,5])]
    #[case::reliable(SequencedHeader { packet_type: PacketType::Reliable, sequence: 0x1234, ack: AckFields { ack_sequence: 1, ack_mask: 1 }, reliable: Some(ReliableFields { order: 9, fragment_index: None }) },
        vec![7, 0x12,0x34, 0,1, 0,0,0,0,0,0,0,1, 0,9])]
    #[case::fragment(SequencedHeader { packet_type: PacketType::ReliableFragment, sequence: 1, ack: AckFields { ack_sequence: 65535, ack_mask: u64::MAX }, reliable: Some(ReliableFields { order: 2, fragment_index: Some(4) }) },
        vec![8, 0,1, 255,255, 255,255,255,255,255,255,255,255, 0,2, 4])]
    fn test_ser(#[case] header: SequencedHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), SequencedHeader::serialized_len(header.packet_type));

        let mut parse_buf: &[u8] = &buf;
        let deser = SequencedHeader::deser(&mut parse_buf).unwrap();
        assert!(parse_buf.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::not_sequenced(vec![5, 0,1, 0,0, 0,0,0,0,0,0,0,0])]
    #[case::unknown_type(vec![99, 0,1, 0,0, 0,0,0,0,0,0,0,0])]
    #[case::short_ack(vec![6, 0,1, 0,0, 0,0,0])]
    #[case::missing_order(vec![7, 0,1, 0,0, 0,0,0,0,0,0,0,0, 1])]
    #[case::missing_fragment_index(vec![8, 0,1, 0,0, 0,0,0,0,0,0,0,0, 0,1])]
    fn test_deser_invalid(#[case] packet: Vec<u8>) {
        let mut parse_buf: &[u8] = &packet;
        assert!(SequencedHeader::deser(&mut parse_buf).is_err());
    }

    #[test]
    fn test_patch_sequence_and_ack() {
        let mut buf = BytesMut::new();
        SequencedHeader {
            packet_type: PacketType::Reliable,
            sequence: 1,
            ack: AckFields::default(),
            reliable: Some(ReliableFields { order: 7, fragment_index: None }),
        }.ser(&mut buf);
        buf.put_slice(&[1, 2, 3]);

        SequencedHeader::patch_sequence_and_ack(&mut buf, 500, AckFields { ack_sequence: 3, ack_mask: 0xff });
        assert_eq!(buf.as_ref(), &[7, 1,244, 0,3, 0,0,0,0,0,0,0,255, 0,7, 1,2,3]);
    }

    #[rstest]
    #[case::connect(vec![1, 7], Some(PacketType::ConnectRequest))]
    #[case::keep_alive(vec![10], Some(PacketType::KeepAlive))]
    #[case::zero(vec![0], None)]
    #[case::unknown(vec![11], None)]
    #[case::empty(vec![], None)]
    fn test_of_packet(#[case] packet: Vec<u8>, #[case] expected: Option<PacketType>) {
        assert_eq!(PacketType::of_packet(&packet).ok(), expected);
    }
}

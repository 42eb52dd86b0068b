use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The payload of a regular reliable packet is a batch of messages, each preceded by its
///  length as a u16.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_len: u16,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>();

    /// Appends a message with its length prefix. The caller checks that the message fits.
    pub(crate) fn write_record(buf: &mut impl BufMut, message: &[u8]) {
        MessageHeader { message_len: message.len().prechecked_cast() }.ser(buf);
        buf.put_slice(message);
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.message_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete message header");
        }
        Ok(MessageHeader {
            message_len: buf.get_u16(),
        })
    }
}

/// Iterates over the messages of a batch. A malformed record is reported once, and ends the
///  iteration.
pub(crate) struct BatchReader {
    remaining: Bytes,
}
impl BatchReader {
    pub fn new(batch: Bytes) -> BatchReader {
        BatchReader { remaining: batch }
    }

    fn read_record(&mut self) -> anyhow::Result<Bytes> {
        let header = MessageHeader::deser(&mut self.remaining)?;
        let message_len: usize = header.message_len.safe_cast();
        if message_len > self.remaining.len() {
            bail!("message length {} exceeds the remaining {} bytes of the batch", message_len, self.remaining.len());
        }
        Ok(self.remaining.split_to(message_len))
    }
}

impl Iterator for BatchReader {
    type Item = anyhow::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let result = self.read_record();
        if result.is_err() {
            self.remaining.clear();
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(1199)]
    #[case(u16::MAX)]
    fn test_ser(#[case] len: u16) {
        let original = MessageHeader { message_len: len };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_too_short() {
        let mut b: &[u8] = &[1];
        assert!(MessageHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_batch_reader() {
        let mut buf = BytesMut::new();
        MessageHeader::write_record(&mut buf, b"abc");
        MessageHeader::write_record(&mut buf, b"");
        MessageHeader::write_record(&mut buf, b"defgh");

        let messages = BatchReader::new(buf.freeze())
            .map(|m| m.unwrap().to_vec())
            .collect::<Vec<_>>();
        assert_eq!(messages, vec![b"abc".to_vec(), vec![], b"defgh".to_vec()]);
    }

    #[rstest]
    #[case::truncated_header(vec![0, 1, b'a', 0])]
    #[case::length_beyond_end(vec![0, 1, b'a', 0, 5, b'x'])]
    fn test_batch_reader_stops_at_malformed_record(#[case] batch: Vec<u8>) {
        let mut reader = BatchReader::new(Bytes::from(batch));
        assert_eq!(reader.next().unwrap().unwrap().as_ref(), b"a");
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}

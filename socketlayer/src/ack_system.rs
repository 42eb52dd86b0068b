//! The reliability engine of a connection.
//!
//! [AckSystem] assigns packet sequences to outgoing notify, reliable and fragment packets,
//!  keeps them in flight until they are acknowledged or judged lost, and re-sends reliable data
//!  that is not acknowledged in time. On the receiving side it maintains the ack header that is
//!  piggy-backed on outgoing packets, buffers reliable packets by their order number and hands
//!  them out in order, reassembling fragmented messages.
//!
//! There are two sequence spaces:
//! * every ackable packet has a packet *sequence*. Acknowledgements refer to these, and a
//!   re-sent packet gets a fresh one.
//! * reliable packets additionally have an *order* number which determines delivery order at
//!   the receiver. A re-sent packet keeps its order number.
//!
//! The ack system does no I/O: outgoing packets are queued, and the owning connection
//!  drains them with [AckSystem::pop_outgoing].

use crate::config::SocketLayerConfig;
use crate::error::SocketLayerError;
use crate::message_header::MessageHeader;
use crate::notify::{NotifyCallback, NotifyOutcome, NotifyResolver, NotifyToken};
use crate::packet_header::{AckFields, PacketType, ReliableFields, SequencedHeader, ACK_PACKET_SIZE, MIN_RELIABLE_FRAGMENT_HEADER_SIZE, MIN_RELIABLE_HEADER_SIZE, NOTIFY_HEADER_SIZE};
use crate::ring_buffer::RingBuffer;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sequencer::Sequencer;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// number of packets an ack header covers
const ACK_MASK_BITS: i64 = u64::BITS as i64;

enum InFlight {
    Reliable { order: u64 },
    Notify(NotifyResolver),
}

struct OutgoingReliable {
    order: u64,
    /// the serialized packet, header included - sequence and ack fields are patched when
    ///  re-sending
    packet: BytesMut,
    /// packet sequence of the most recent transmission, `None` if that transmission was
    ///  judged lost
    sequence: Option<u64>,
    last_sent: Instant,
}

struct ReceivedReliable {
    fragment_index: Option<u8>,
    payload: Bytes,
}

/// A reliable packet at the head of the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliablePacket {
    pub payload: Bytes,
    /// `None` for a (batched) regular packet, otherwise the index of the message's first
    ///  fragment, which is also the number of fragments that follow
    pub fragment_index: Option<u8>,
}

/// A reliable unit that is ready for delivery, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliableMessage {
    /// a sequence of length prefixed messages
    Batch(Bytes),
    /// a single message that was reassembled from fragments
    Fragmented(Bytes),
}

pub struct AckSystem {
    config: Arc<SocketLayerConfig>,
    sequencer: Sequencer,

    /// ackable packets by packet sequence. The write cursor is the next packet sequence.
    in_flight: RingBuffer<InFlight>,
    /// reliable packets that were not acknowledged yet, by order. The write cursor is the
    ///  next order number.
    reliable_out: RingBuffer<OutgoingReliable>,
    /// the newest ack header received from the peer
    latest_ack_received: Option<u64>,

    /// small reliable messages waiting to be sent together, as length prefixed records
    batch: BytesMut,

    /// reliable packets received from the peer, by order. The read cursor is the next order to
    ///  be delivered.
    reliable_in: RingBuffer<ReceivedReliable>,
    /// fragments of the message currently being read via [AckSystem::get_next_fragment]
    fragments_remaining: u8,

    /// the newest packet sequence received from the peer, and a mask of received packets where
    ///  bit `i` stands for `latest_received - i`. A mask of 0 means nothing was received yet.
    latest_received: u64,
    receive_mask: u64,
    /// set when an ackable packet was received and no packet carried the ack header since
    first_unacked_receive: Option<Instant>,
    receives_since_ack: u32,

    outbox: VecDeque<Bytes>,
}
impl AckSystem {
    pub fn new(config: Arc<SocketLayerConfig>) -> AckSystem {
        let sequencer = Sequencer::new(Sequencer::WIRE_BITS);
        let window_bits = config.sequence_window_bits;

        AckSystem {
            config,
            sequencer,
            in_flight: RingBuffer::new(window_bits, sequencer),
            reliable_out: RingBuffer::new(window_bits, sequencer),
            latest_ack_received: None,
            batch: BytesMut::new(),
            reliable_in: RingBuffer::new(window_bits, sequencer),
            fragments_remaining: 0,
            latest_received: 0,
            receive_mask: 0,
            first_unacked_receive: None,
            receives_since_ack: 0,
            outbox: VecDeque::new(),
        }
    }

    /// number of ackable packets sent and neither acknowledged nor judged lost
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count()
    }

    /// number of reliable packets the peer did not acknowledge yet
    pub fn unacked_reliable_count(&self) -> usize {
        self.reliable_out.count()
    }

    pub fn has_pending_batch(&self) -> bool {
        !self.batch.is_empty()
    }

    pub fn pop_outgoing(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    fn batch_budget(&self) -> usize {
        self.config.max_packet_size - MIN_RELIABLE_HEADER_SIZE
    }

    fn free_reliable_slots(&self) -> usize {
        self.in_flight.free_slots().min(self.reliable_out.free_slots())
    }

    fn ensure_reliable_slots(&self, required: usize) -> Result<(), SocketLayerError> {
        if self.free_reliable_slots() < required {
            debug!("send window is full: {} packets in flight, {} reliable packets unacknowledged", self.in_flight.count(), self.reliable_out.count());
            return Err(SocketLayerError::BufferFull { capacity: self.in_flight.capacity() });
        }
        Ok(())
    }

    fn current_ack_fields(&self) -> AckFields {
        AckFields {
            ack_sequence: self.latest_received.prechecked_cast(),
            ack_mask: self.receive_mask,
        }
    }

    /// the current ack header is going out to the peer
    fn on_ack_sent(&mut self) {
        self.first_unacked_receive = None;
        self.receives_since_ack = 0;
    }

    /// Sends a message on the reliable channel. Small messages are batched (if configured),
    ///  big messages are split into fragments.
    ///
    /// Capacity is checked before anything is changed, so a message is either fully accepted
    ///  or rejected.
    pub fn send_reliable(&mut self, message: &[u8], now: Instant) -> Result<(), SocketLayerError> {
        let record_len = MessageHeader::SERIALIZED_LEN + message.len();

        if record_len <= self.batch_budget() {
            if !self.config.send_as_batch {
                self.ensure_reliable_slots(1)?;
                let mut record = BytesMut::with_capacity(record_len);
                MessageHeader::write_record(&mut record, message);
                self.send_reliable_packet(None, &record, now);
                return Ok(());
            }

            if self.batch.len() + record_len > self.batch_budget() {
                self.flush_batch(now)?;
            }
            trace!("adding message of {} bytes to batch", message.len());
            MessageHeader::write_record(&mut self.batch, message);
            return Ok(());
        }

        let fragment_size = self.config.fragment_payload_size();
        let num_fragments = message.len().div_ceil(fragment_size);
        if num_fragments > self.config.max_reliable_fragments.safe_cast() {
            return Err(SocketLayerError::MessageTooBig { len: message.len(), max: self.config.max_reliable_message_size() });
        }

        let batch_slots = if self.batch.is_empty() { 0 } else { 1 };
        self.ensure_reliable_slots(num_fragments + batch_slots)?;
        self.flush_batch(now)?;

        debug!("sending message of {} bytes as {} fragments", message.len(), num_fragments);
        for (i, chunk) in message.chunks(fragment_size).enumerate() {
            let fragment_index: u8 = (num_fragments - 1 - i).prechecked_cast();
            self.send_reliable_packet(Some(fragment_index), chunk, now);
        }
        Ok(())
    }

    /// Sends pending batched messages as a single reliable packet
    pub fn flush_batch(&mut self, now: Instant) -> Result<(), SocketLayerError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.ensure_reliable_slots(1)?;

        let batch = self.batch.split().freeze();
        trace!("flushing batch of {} bytes", batch.len());
        self.send_reliable_packet(None, &batch, now);
        Ok(())
    }

    /// NB: the caller must have checked capacity
    fn send_reliable_packet(&mut self, fragment_index: Option<u8>, payload: &[u8], now: Instant) {
        let order = self.reliable_out.write();
        let sequence = self.in_flight.write();

        let header = SequencedHeader {
            packet_type: if fragment_index.is_some() { PacketType::ReliableFragment } else { PacketType::Reliable },
            sequence: sequence.prechecked_cast(),
            ack: self.current_ack_fields(),
            reliable: Some(ReliableFields {
                order: order.prechecked_cast(),
                fragment_index,
            }),
        };
        let mut packet = BytesMut::with_capacity(SequencedHeader::serialized_len(header.packet_type) + payload.len());
        header.ser(&mut packet);
        packet.put_slice(payload);

        trace!("sending reliable packet: sequence {}, order {}, fragment {:?}, {} bytes", sequence, order, fragment_index, packet.len());
        self.outbox.push_back(Bytes::copy_from_slice(&packet));
        self.on_ack_sent();

        let in_flight_result = self.in_flight.enqueue(InFlight::Reliable { order });
        let out_result = self.reliable_out.enqueue(OutgoingReliable {
            order,
            packet,
            sequence: Some(sequence),
            last_sent: now,
        });
        debug_assert!(in_flight_result.is_ok() && out_result.is_ok(), "capacity should have been checked");
    }

    /// Sends a packet on the notify channel: it is not re-sent, but its outcome is reported
    ///  through the returned token (and the callback, if there is one)
    pub fn send_notify(&mut self, payload: &[u8], callback: Option<NotifyCallback>) -> Result<NotifyToken, SocketLayerError> {
        let max = self.config.max_packet_size - NOTIFY_HEADER_SIZE;
        if payload.len() > max {
            return Err(SocketLayerError::MessageTooBig { len: payload.len(), max });
        }
        if self.in_flight.is_full() {
            debug!("send window is full, rejecting notify packet");
            return Err(SocketLayerError::BufferFull { capacity: self.in_flight.capacity() });
        }

        let sequence = self.in_flight.write();
        let header = SequencedHeader {
            packet_type: PacketType::Notify,
            sequence: sequence.prechecked_cast(),
            ack: self.current_ack_fields(),
            reliable: None,
        };
        let mut packet = BytesMut::with_capacity(NOTIFY_HEADER_SIZE + payload.len());
        header.ser(&mut packet);
        packet.put_slice(payload);

        let (resolver, token) = NotifyResolver::new(callback);
        self.in_flight.enqueue(InFlight::Notify(resolver))?;

        trace!("sending notify packet: sequence {}, {} bytes", sequence, packet.len());
        self.outbox.push_back(packet.freeze());
        self.on_ack_sent();
        Ok(token)
    }

    /// Periodic work: flushes the batch, re-sends reliable packets that were lost or not
    ///  acknowledged in time, and sends an ack-only packet if acknowledgements are overdue
    pub fn update(&mut self, now: Instant) -> Result<(), SocketLayerError> {
        self.flush_batch(now)?;
        self.resend_reliable(now)?;

        if let Some(first_unacked) = self.first_unacked_receive {
            if first_unacked + self.config.time_before_empty_ack < now || self.receives_since_ack >= self.config.receives_before_empty_ack {
                self.send_ack();
            }
        }
        Ok(())
    }

    fn resend_reliable(&mut self, now: Instant) -> Result<(), SocketLayerError> {
        for order in self.reliable_out.occupied_sequences() {
            let Some(entry) = self.reliable_out.get(order) else { continue };
            if entry.sequence.is_some() && entry.last_sent + self.config.time_before_resend >= now {
                continue;
            }
            let previous_sequence = entry.sequence;

            if let Some(previous) = previous_sequence {
                self.in_flight.remove_at(previous);
                self.in_flight.move_read_to_next_non_empty();
            }

            let sequence = self.in_flight.write();
            if let Err(e) = self.in_flight.enqueue(InFlight::Reliable { order }) {
                if let Some(entry) = self.reliable_out.get_mut(order) {
                    entry.sequence = None;
                }
                return Err(e);
            }

            let ack = self.current_ack_fields();
            if let Some(entry) = self.reliable_out.get_mut(order) {
                debug!("re-sending reliable packet with order {}: sequence {:?} -> {}", order, previous_sequence, sequence);
                SequencedHeader::patch_sequence_and_ack(&mut entry.packet, sequence.prechecked_cast(), ack);
                entry.sequence = Some(sequence);
                entry.last_sent = now;
                self.outbox.push_back(Bytes::copy_from_slice(&entry.packet));
            }
            self.on_ack_sent();
        }
        Ok(())
    }

    fn send_ack(&mut self) {
        let mut packet = BytesMut::with_capacity(ACK_PACKET_SIZE);
        packet.put_u8(PacketType::Ack.into());
        self.current_ack_fields().ser(&mut packet);

        trace!("sending ack packet for sequence {}", self.latest_received);
        self.outbox.push_back(packet.freeze());
        self.on_ack_sent();
    }

    /// Checks if a packet is a malformed fragment: too short to hold a fragment header, or with
    ///  a fragment index that exceeds the configured maximum
    pub fn invalid_fragment(&self, packet: &[u8]) -> bool {
        if packet.len() < MIN_RELIABLE_FRAGMENT_HEADER_SIZE {
            return true;
        }
        packet[MIN_RELIABLE_FRAGMENT_HEADER_SIZE - 1] >= self.config.max_reliable_fragments
    }

    /// Handles an incoming packet of one of the types this ack system is responsible for
    ///  (notify, reliable, fragment, ack). Returns the payload of a notify packet, which is
    ///  delivered right away; reliable data is buffered and available through
    ///  [AckSystem::next_reliable_message].
    ///
    /// Malformed packets are logged and dropped.
    pub fn on_packet(&mut self, packet: Bytes, now: Instant) -> Option<Bytes> {
        match PacketType::of_packet(&packet) {
            Ok(PacketType::Ack) => {
                self.on_ack_packet(&packet);
                None
            }
            Ok(PacketType::Notify | PacketType::Reliable | PacketType::ReliableFragment) => {
                self.on_sequenced_packet(packet, now)
            }
            Ok(other) => {
                warn!("packet type {:?} is not handled by the ack system - dropping", other);
                None
            }
            Err(e) => {
                warn!("dropping packet: {}", e);
                None
            }
        }
    }

    fn on_ack_packet(&mut self, packet: &[u8]) {
        let mut buf = &packet[1..];
        match AckFields::deser(&mut buf) {
            Ok(ack) => self.on_ack_fields(ack),
            Err(e) => warn!("dropping malformed ack packet: {}", e),
        }
    }

    fn on_sequenced_packet(&mut self, packet: Bytes, now: Instant) -> Option<Bytes> {
        let header = match SequencedHeader::deser(&mut packet.as_ref()) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping malformed packet: {}", e);
                return None;
            }
        };
        if header.packet_type == PacketType::ReliableFragment && self.invalid_fragment(&packet) {
            warn!("dropping invalid fragment {:?}", header.reliable);
            return None;
        }

        self.on_ack_fields(header.ack);

        if let Some(reliable) = header.reliable {
            if self.beyond_receive_window(reliable.order.safe_cast()) {
                // not acknowledged, so the sender keeps re-sending it until there is room
                trace!("reliable packet with order {} is beyond the receive window - dropping", reliable.order);
                return None;
            }
        }

        let is_new = self.set_ack_values(header.sequence.safe_cast());
        if self.first_unacked_receive.is_none() {
            self.first_unacked_receive = Some(now);
        }
        self.receives_since_ack += 1;

        let payload = packet.slice(SequencedHeader::serialized_len(header.packet_type)..);
        match header.reliable {
            None => {
                if is_new {
                    Some(payload)
                }
                else {
                    trace!("dropping duplicate notify packet {}", header.sequence);
                    None
                }
            }
            Some(reliable) => {
                self.insert_reliable(reliable, payload);
                None
            }
        }
    }

    /// Registers a received packet sequence in the ack header. Returns `false` for packets that
    ///  were received before or that are too old to tell.
    fn set_ack_values(&mut self, sequence: u64) -> bool {
        if self.receive_mask == 0 {
            self.latest_received = sequence;
            self.receive_mask = 1;
            return true;
        }

        let distance = self.sequencer.distance(sequence, self.latest_received);
        if distance > 0 {
            self.receive_mask = if distance >= ACK_MASK_BITS {
                1
            }
            else {
                (self.receive_mask << distance) | 1
            };
            self.latest_received = sequence;
            return true;
        }

        let back = -distance;
        if back >= ACK_MASK_BITS {
            return false;
        }
        let bit = 1u64 << back;
        if self.receive_mask & bit != 0 {
            return false;
        }
        self.receive_mask |= bit;
        true
    }

    /// A reliable packet that is too far ahead of the next order to be delivered can not be
    ///  buffered. Packets behind the read cursor were delivered before and are acknowledged
    ///  again.
    fn beyond_receive_window(&self, order: u64) -> bool {
        let distance = self.reliable_in.distance_to_read(order);
        distance >= 0 && distance as usize >= self.reliable_in.capacity()
    }

    fn insert_reliable(&mut self, reliable: ReliableFields, payload: Bytes) {
        let order: u64 = reliable.order.safe_cast();
        if self.reliable_in.distance_to_read(order) < 0 {
            trace!("reliable packet with order {} was delivered before - dropping", order);
            return;
        }
        if self.reliable_in.exists(order) {
            trace!("duplicate reliable packet with order {} - dropping", order);
            return;
        }
        self.reliable_in.insert_at(order, ReceivedReliable {
            fragment_index: reliable.fragment_index,
            payload,
        });
    }

    fn on_ack_fields(&mut self, ack: AckFields) {
        if ack.ack_mask == 0 {
            return;
        }
        let ack_sequence: u64 = ack.ack_sequence.safe_cast();
        if self.sequencer.distance(ack_sequence, self.in_flight.write()) >= 0 {
            warn!("peer acknowledged sequence {} which was not sent yet - ignoring", ack_sequence);
            return;
        }

        let is_newest = match self.latest_ack_received {
            None => true,
            Some(latest) => self.sequencer.distance(ack_sequence, latest) > 0,
        };

        for sequence in self.in_flight.occupied_sequences() {
            let behind = self.sequencer.distance(ack_sequence, sequence);
            if behind < 0 {
                continue;
            }
            if behind < ACK_MASK_BITS && ack.ack_mask & (1u64 << behind) != 0 {
                self.on_delivered(sequence);
            }
            else if is_newest && behind > 0 {
                self.on_lost(sequence);
            }
        }

        if is_newest {
            self.latest_ack_received = Some(ack_sequence);
        }
        self.in_flight.move_read_to_next_non_empty();
        self.reliable_out.move_read_to_next_non_empty();
    }

    fn on_delivered(&mut self, sequence: u64) {
        match self.in_flight.remove_at(sequence) {
            Some(InFlight::Notify(resolver)) => {
                trace!("notify packet {} was delivered", sequence);
                resolver.resolve(NotifyOutcome::Delivered);
            }
            Some(InFlight::Reliable { order }) => {
                if self.reliable_out.get(order).map(|e| e.order) == Some(order) {
                    trace!("reliable packet {} with order {} was acknowledged", sequence, order);
                    self.reliable_out.remove_at(order);
                }
            }
            None => {}
        }
    }

    fn on_lost(&mut self, sequence: u64) {
        match self.in_flight.remove_at(sequence) {
            Some(InFlight::Notify(resolver)) => {
                debug!("notify packet {} was lost", sequence);
                resolver.resolve(NotifyOutcome::Lost);
            }
            Some(InFlight::Reliable { order }) => {
                if let Some(entry) = self.reliable_out.get_mut(order) {
                    if entry.order == order && entry.sequence == Some(sequence) {
                        debug!("reliable packet {} with order {} was lost - scheduling for re-send", sequence, order);
                        entry.sequence = None;
                    }
                }
            }
            None => {}
        }
    }

    /// Returns the reliable packet at the head of the receive buffer if it can be delivered:
    ///  a regular packet as soon as it is there, the first fragment of a message only when all
    ///  of the message's fragments are there. The remaining fragments are then available
    ///  through [AckSystem::get_next_fragment].
    pub fn next_reliable_packet(&mut self) -> Option<ReliablePacket> {
        while self.get_next_fragment().is_some() {
            debug!("skipping unread fragment");
        }

        loop {
            let head_index = self.reliable_in.try_peek()?.fragment_index;
            let Some(first_index) = head_index else {
                let head = self.reliable_in.dequeue()?;
                return Some(ReliablePacket {
                    payload: head.payload,
                    fragment_index: None,
                });
            };

            match self.check_fragments_complete(first_index) {
                FragmentCheck::Incomplete => return None,
                FragmentCheck::Mismatch => {
                    warn!("fragment sequence at order {} is inconsistent - dropping fragment", self.reliable_in.read());
                    self.reliable_in.dequeue();
                }
                FragmentCheck::Complete => {
                    let head = self.reliable_in.dequeue()?;
                    self.fragments_remaining = first_index;
                    return Some(ReliablePacket {
                        payload: head.payload,
                        fragment_index: Some(first_index),
                    });
                }
            }
        }
    }

    fn check_fragments_complete(&self, first_index: u8) -> FragmentCheck {
        let read = self.reliable_in.read();
        for offset in 1..=first_index {
            let order = self.sequencer.add(read, offset.into());
            match self.reliable_in.get(order) {
                None => return FragmentCheck::Incomplete,
                Some(fragment) => {
                    if fragment.fragment_index != Some(first_index - offset) {
                        return FragmentCheck::Mismatch;
                    }
                }
            }
        }
        FragmentCheck::Complete
    }

    /// The next fragment of the message whose first fragment was returned by
    ///  [AckSystem::next_reliable_packet], `None` after the last fragment (index 0)
    pub fn get_next_fragment(&mut self) -> Option<Bytes> {
        if self.fragments_remaining == 0 {
            return None;
        }
        self.fragments_remaining -= 1;
        self.reliable_in.dequeue().map(|f| f.payload)
    }

    /// The next reliable unit in order, with fragmented messages reassembled
    pub fn next_reliable_message(&mut self) -> Option<ReliableMessage> {
        let packet = self.next_reliable_packet()?;
        if packet.fragment_index.is_none() {
            return Some(ReliableMessage::Batch(packet.payload));
        }

        let mut message = BytesMut::from(packet.payload.as_ref());
        while let Some(fragment) = self.get_next_fragment() {
            message.put_slice(&fragment);
        }
        Some(ReliableMessage::Fragmented(message.freeze()))
    }

    /// Releases all buffered data. Notify packets that are still in flight are resolved as lost.
    pub fn clear_and_release(&mut self) {
        self.in_flight.clear_and_release(|item| {
            if let InFlight::Notify(resolver) = item {
                resolver.resolve(NotifyOutcome::Lost);
            }
        });
        self.reliable_out.clear_and_release(|_| {});
        self.reliable_in.clear_and_release(|_| {});
        self.fragments_remaining = 0;
        self.batch.clear();
        self.outbox.clear();
    }
}

enum FragmentCheck {
    Complete,
    Incomplete,
    Mismatch,
}

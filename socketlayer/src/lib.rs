//! A reliability layer on top of UDP for latency sensitive applications, e.g. games: a peer
//!  keeps connections to remote peers and offers three delivery channels per connection.
//!
//! * *reliable*: messages are delivered exactly once and in the order they were sent. Small
//!   messages are batched into a single packet, big messages are split into fragments that are
//!   re-assembled by the receiver. Lost packets are re-sent.
//! * *notify*: a packet is delivered at most once, and the sender learns whether it arrived
//!   (or was judged lost). There is no re-sending: this is for data that is obsolete by the
//!   time a re-send would arrive, but where the sender wants to know what the receiver has.
//! * *unreliable*: plain datagrams without any bookkeeping
//!
//! ## Design goals
//!
//! * Explicit handshake with a connect key, so stray traffic does not create connections
//! * Acknowledgements are piggy-backed on outgoing traffic as a bit mask relative to the most
//!   recently received packet. A single header acknowledges up to 64 packets, which makes
//!   losing individual acks cheap. Ack-only packets are sent only if there is no traffic
//!   in the other direction for a while.
//! * Bounded memory: send and receive windows have a fixed size (configured as a power of two).
//!   If the send window fills up, the peer is not keeping up (or gone), and the connection is
//!   closed rather than buffering without limit.
//! * Messages are never fragmented at the IP level: packets are at most the configured packet
//!   size, and the layer does its own fragmentation.
//! * Liveness: a connection that receives nothing for a configured timeout is disconnected,
//!   and idle connections send keep-alives.
//! * Time is passed in explicitly everywhere, making the protocol logic deterministic and
//!   testable without real time passing.
//!
//! ## Packets
//!
//! The first byte of every packet is its type. All numbers are in network byte order (BE).
//!
//! ```ascii
//! 1  CONNECT_REQUEST      connect key (remainder of the packet)
//! 2  CONNECTION_ACCEPTED  -
//! 3  CONNECTION_REJECTED  reason (u8): 1 timeout, 2 server full, 3 closed by peer, 4 key invalid
//! 4  DISCONNECT           reason (u8): 1 timeout, 2 requested by remote peer,
//!                                      3 requested by local peer, 4 send buffer full,
//!                                      5 closed by peer
//! 5  UNRELIABLE           payload
//! 6  NOTIFY               sequenced header, payload
//! 7  RELIABLE             sequenced header, order (u16), batch
//! 8  RELIABLE_FRAGMENT    sequenced header, order (u16), fragment index (u8), payload
//! 9  ACK                  ack fields
//! 10 KEEP_ALIVE           -
//! ```
//!
//! The sequenced header is shared by all packets that are acknowledged:
//!
//! ```ascii
//! 0: packet type (u8)
//! 1: sequence (u16) - incremented for every acknowledged packet, re-sent packets included
//! 3: ack fields:
//!    3: ack sequence (u16) - the most recent sequence received from the peer
//!    5: ack mask (u64) - bit i acknowledges `ack sequence - i`. 0 means 'nothing received'
//! ```
//!
//! ### Reliable order
//!
//! Reliable packets carry an *order* number in addition to their sequence. The sequence is
//!  what acknowledgements refer to, and a re-sent packet gets a new one. The order is what the
//!  receiver uses to deliver data in sequence, and it stays the same when a packet is re-sent.
//!
//! A reliable packet's payload is a batch of messages, each prefixed with its length (u16).
//!
//! ### Fragments
//!
//! A message that is too big for a single packet is split into fragments, each sent with its
//!  own order number. Fragment indexes count down, so the first fragment's index is the number
//!  of fragments that follow, and the last fragment has index 0. The receiver delivers the
//!  message once all fragments are there. Fragment indexes at or above the configured maximum
//!  are invalid, which limits the memory tied up by re-assembly.
//!
//! ### Loss detection
//!
//! When an ack header arrives that is newer than all previous ones, every packet in flight that
//!  is older than its ack sequence and not acknowledged by it is judged lost. A lost notify
//!  packet is reported as lost, a lost reliable packet is re-sent on the next tick. Reliable
//!  packets are also re-sent if they are not acknowledged within a configured interval.

pub mod ack_system;
pub mod bit_packing;
pub mod config;
pub mod connection;
pub mod data_handler;
pub mod error;
mod message_header;
pub mod metrics;
pub mod notify;
pub mod packet_header;
pub mod peer;
pub mod ring_buffer;
pub mod safe_converter;
pub mod send_socket;
pub mod sequencer;
pub mod trackers;

use crate::error::SocketLayerError;
use crate::sequencer::Sequencer;
use tracing::trace;

/// A fixed-capacity window of slots addressed by sequence number.
///
/// The buffer holds `2^window_bits` slots, and a sequence number is stored in slot
///  `sequence mod capacity`. The read and write cursors are sequence numbers in the
///  (bigger) space of the buffer's [Sequencer], so the buffer can tell 'one full window
///  ahead' apart from 'empty'.
///
/// Slots are explicitly optional, so any value can be stored. Items can be appended at the
///  write cursor or inserted / removed at arbitrary positions for out-of-order bookkeeping.
pub struct RingBuffer<T> {
    sequencer: Sequencer,
    slots: Vec<Option<T>>,
    index_mask: u64,
    /// oldest item
    read: u64,
    /// position of the next enqueued item
    write: u64,
    /// number of occupied slots - this differs from the distance between read and write
    ///  when items are inserted or removed out of order
    count: usize,
}
impl<T> RingBuffer<T> {
    pub fn new(window_bits: u32, sequencer: Sequencer) -> RingBuffer<T> {
        assert!(window_bits < sequencer.bits(), "window of {} bits does not fit into a sequence space of {} bits", window_bits, sequencer.bits());

        let capacity = 1usize << window_bits;
        RingBuffer {
            sequencer,
            slots: (0..capacity).map(|_| None).collect(),
            index_mask: capacity as u64 - 1,
            read: 0,
            write: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// number of occupied slots
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn read(&self) -> u64 {
        self.read
    }

    pub fn write(&self) -> u64 {
        self.write
    }

    /// number of sequence numbers between the read and write cursors, i.e. the part of the
    ///  window that is in use
    pub fn span(&self) -> usize {
        self.sequencer.distance(self.write, self.read).max(0) as usize
    }

    pub fn free_slots(&self) -> usize {
        self.capacity() - self.span()
    }

    pub fn is_full(&self) -> bool {
        self.span() >= self.capacity()
    }

    pub fn distance_to_read(&self, from: u64) -> i64 {
        self.sequencer.distance(from, self.read)
    }

    fn slot(&self, sequence: u64) -> usize {
        (sequence & self.index_mask) as usize
    }

    /// Appends an item at the write cursor, returning its sequence number
    pub fn enqueue(&mut self, item: T) -> Result<u64, SocketLayerError> {
        if self.is_full() {
            trace!("ring buffer is full: read {} write {}", self.read, self.write);
            return Err(SocketLayerError::BufferFull { capacity: self.capacity() });
        }

        let sequence = self.write;
        let slot = self.slot(sequence);
        debug_assert!(self.slots[slot].is_none(), "slot for sequence {} should be free", sequence);
        self.slots[slot] = Some(item);
        self.write = self.sequencer.next_after(self.write);
        self.count += 1;
        Ok(sequence)
    }

    /// the item at the read cursor, if there is one
    pub fn try_peek(&self) -> Option<&T> {
        self.slots[self.slot(self.read)].as_ref()
    }

    /// Checks if the slot for a sequence number is occupied. The sequence number is moved
    ///  into bounds first.
    pub fn exists(&self, sequence: u64) -> bool {
        let sequence = self.sequencer.move_in_bounds(sequence);
        self.slots[self.slot(sequence)].is_some()
    }

    pub fn get(&self, sequence: u64) -> Option<&T> {
        self.slots[self.slot(sequence)].as_ref()
    }

    pub fn get_mut(&mut self, sequence: u64) -> Option<&mut T> {
        let slot = self.slot(sequence);
        self.slots[slot].as_mut()
    }

    /// Removes the item at the read cursor (if any) and advances the read cursor by one
    pub fn dequeue(&mut self) -> Option<T> {
        let slot = self.slot(self.read);
        let item = self.slots[slot].take();
        if item.is_some() {
            self.count -= 1;
        }
        self.read = self.sequencer.next_after(self.read);
        item
    }

    /// Removes the item at the read cursor and advances the read cursor. Leaves the buffer
    ///  unchanged if the slot at the read cursor is empty.
    pub fn try_dequeue(&mut self) -> Option<T> {
        if self.try_peek().is_some() {
            self.dequeue()
        }
        else {
            None
        }
    }

    /// Stores an item at an arbitrary position, returning the previous item in that slot
    ///  if there was one
    pub fn insert_at(&mut self, sequence: u64, item: T) -> Option<T> {
        let slot = self.slot(sequence);
        let previous = self.slots[slot].replace(item);
        if previous.is_none() {
            self.count += 1;
        }
        previous
    }

    pub fn remove_at(&mut self, sequence: u64) -> Option<T> {
        let slot = self.slot(sequence);
        let removed = self.slots[slot].take();
        if removed.is_some() {
            self.count -= 1;
        }
        removed
    }

    /// Moves the read cursor forward to the next occupied slot, stopping at the write cursor.
    ///  This is used after removing items out of order.
    pub fn move_read_to_next_non_empty(&mut self) {
        while self.read != self.write && self.slots[self.slot(self.read)].is_none() {
            self.read = self.sequencer.next_after(self.read);
        }
    }

    /// sequence numbers of all occupied slots between read and write cursor, oldest first
    pub fn occupied_sequences(&self) -> Vec<u64> {
        let mut result = Vec::with_capacity(self.count);
        let mut sequence = self.read;
        while sequence != self.write {
            if self.slots[self.slot(sequence)].is_some() {
                result.push(sequence);
            }
            sequence = self.sequencer.next_after(sequence);
        }
        result
    }

    /// Drains all occupied slots, handing each item to `release`, and leaves the buffer
    ///  empty with the read cursor at the write cursor
    pub fn clear_and_release(&mut self, mut release: impl FnMut(T)) {
        for slot in self.slots.iter_mut() {
            if let Some(item) = slot.take() {
                release(item);
            }
        }
        self.count = 0;
        self.read = self.write;
    }
}

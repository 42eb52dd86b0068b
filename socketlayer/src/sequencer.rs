/// Wraparound arithmetic for sequence numbers with a fixed number of bits.
///
/// All sequence numbers live in `[0, 2^bits)`. Distances between them are signed and
///  normalized into `(-2^(bits-1), 2^(bits-1)]`, so comparisons keep working across the
///  wraparound point as long as the two numbers are less than half the sequence space apart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sequencer {
    bits: u32,
    mask: u64,
}
impl Sequencer {
    /// bit count of the sequence numbers on the wire
    pub const WIRE_BITS: u32 = 16;

    pub fn new(bits: u32) -> Sequencer {
        assert!(bits > 0 && bits < 64, "sequence bit count must be between 1 and 63, was {}", bits);
        Sequencer {
            bits,
            mask: (1u64 << bits) - 1,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// the number of distinct sequence numbers, i.e. `2^bits`
    pub fn size(&self) -> u64 {
        self.mask + 1
    }

    pub fn next_after(&self, sequence: u64) -> u64 {
        self.move_in_bounds(sequence.wrapping_add(1))
    }

    pub fn move_in_bounds(&self, value: u64) -> u64 {
        value & self.mask
    }

    /// `from - to`, taking wraparound into account
    pub fn distance(&self, from: u64, to: u64) -> i64 {
        let raw = from.wrapping_sub(to) & self.mask;
        let half = self.size() >> 1;
        if raw > half {
            raw as i64 - self.size() as i64
        }
        else {
            raw as i64
        }
    }

    /// `sequence + delta`, moved into bounds
    pub fn add(&self, sequence: u64, delta: i64) -> u64 {
        self.move_in_bounds(sequence.wrapping_add(delta as u64))
    }
}

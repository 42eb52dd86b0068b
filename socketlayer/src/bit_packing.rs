//! Bit level encoding of integers for applications that pack their messages tightly.
//!
//! A [BitCountPacker] describes how a single integer field is encoded: it is offset by an
//!  (optional) minimum value, zig-zag encoded if it can be negative, and then written with a
//!  fixed number of bits. Several fields share a [BitWriter] / [BitReader], so fields need not
//!  be byte aligned.
//!
//! The socket layer's own packet headers are byte aligned and do not go through this module.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

/// Writes integers with an arbitrary number of bits, least significant bit first
pub struct BitWriter {
    buf: BytesMut,
    scratch: u128,
    scratch_bits: u32,
}
impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter {
            buf: BytesMut::new(),
            scratch: 0,
            scratch_bits: 0,
        }
    }

    /// Writes the lowest `bits` bits of `value`, ignoring all higher bits
    pub fn write_bits(&mut self, value: u64, bits: u32) {
        assert!(bits <= 64, "at most 64 bits can be written at a time, was {}", bits);
        if bits == 0 {
            return;
        }

        let masked = if bits == 64 { value } else { value & ((1u64 << bits) - 1) };
        self.scratch |= (masked as u128) << self.scratch_bits;
        self.scratch_bits += bits;

        while self.scratch_bits >= 8 {
            self.buf.put_u8(self.scratch as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    pub fn bit_len(&self) -> usize {
        self.buf.len() * 8 + self.scratch_bits as usize
    }

    /// Returns the written bits, padding the last byte with zeros
    pub fn finish(mut self) -> Bytes {
        if self.scratch_bits > 0 {
            self.buf.put_u8(self.scratch as u8);
        }
        self.buf.freeze()
    }
}
impl Default for BitWriter {
    fn default() -> Self {
        BitWriter::new()
    }
}

/// Reads what a [BitWriter] wrote, in the same order
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}
impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader {
            data,
            bit_pos: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.bit_pos
    }

    pub fn read_bits(&mut self, bits: u32) -> anyhow::Result<u64> {
        if bits > 64 {
            bail!("at most 64 bits can be read at a time, was {}", bits);
        }
        if (bits as usize) > self.remaining_bits() {
            bail!("tried to read {} bits with only {} remaining", bits, self.remaining_bits());
        }

        let mut result = 0u64;
        let mut done = 0u32;
        while done < bits {
            let byte = self.data[self.bit_pos / 8];
            let offset_in_byte = (self.bit_pos % 8) as u32;
            let chunk = (8 - offset_in_byte).min(bits - done);

            let chunk_value = (byte >> offset_in_byte) as u64 & ((1u64 << chunk) - 1);
            result |= chunk_value << done;

            done += chunk;
            self.bit_pos += chunk as usize;
        }
        Ok(result)
    }
}

pub fn zig_zag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zig_zag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Encoding of a single integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCountPacker {
    pub bit_count: u32,
    pub zig_zag: bool,
    /// subtracted before encoding, for value ranges that do not start at zero
    pub min_value: i64,
}
impl BitCountPacker {
    pub fn plain(bit_count: u32) -> BitCountPacker {
        assert!(bit_count > 0 && bit_count <= 64);
        BitCountPacker {
            bit_count,
            zig_zag: false,
            min_value: 0,
        }
    }

    pub fn zig_zag(bit_count: u32) -> BitCountPacker {
        BitCountPacker {
            zig_zag: true,
            ..BitCountPacker::plain(bit_count)
        }
    }

    pub fn with_min_value(self, min_value: i64) -> BitCountPacker {
        BitCountPacker {
            min_value,
            ..self
        }
    }

    fn max_raw(&self) -> u64 {
        if self.bit_count == 64 { u64::MAX } else { (1u64 << self.bit_count) - 1 }
    }

    pub fn pack(&self, writer: &mut BitWriter, value: i64) -> anyhow::Result<()> {
        let offset = value as i128 - self.min_value as i128;

        let raw = if self.zig_zag {
            let Ok(offset) = i64::try_from(offset) else {
                bail!("value {} is out of range for min value {}", value, self.min_value);
            };
            zig_zag_encode(offset)
        }
        else {
            let Ok(raw) = u64::try_from(offset) else {
                bail!("value {} is below the min value {}", value, self.min_value);
            };
            raw
        };

        if raw > self.max_raw() {
            bail!("value {} does not fit into {} bits", value, self.bit_count);
        }
        writer.write_bits(raw, self.bit_count);
        Ok(())
    }

    pub fn unpack(&self, reader: &mut BitReader) -> anyhow::Result<i64> {
        let raw = reader.read_bits(self.bit_count)?;

        let offset = if self.zig_zag {
            zig_zag_decode(raw) as i128
        }
        else {
            raw as i128
        };

        let value = offset + self.min_value as i128;
        match i64::try_from(value) {
            Ok(v) => Ok(v),
            Err(_) => bail!("decoded value {} is out of range", value),
        }
    }

    /// Unpacks a value and converts it into the field's actual type
    pub fn unpack_as<T: TryFrom<i64>>(&self, reader: &mut BitReader) -> anyhow::Result<T> {
        let value = self.unpack(reader)?;
        match T::try_from(value) {
            Ok(v) => Ok(v),
            Err(_) => bail!("decoded value {} does not fit into {}", value, std::any::type_name::<T>()),
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Bit streams read from their end toward their start.

The writer accumulates bits least significant first and flushes whole bytes
forward. It terminates the stream with a single `1` bit. The reader starts
at that end mark and walks backward, so the last bits written are the first
bits read.

Reader state lives in a [BitCursor] which is passed by value through
[BitReader::load] and the `read` helpers. Nothing is shared between steps.
*/

use {
    crate::{CompressionResult, Error},
    byteorder::{ByteOrder, LittleEndian},
};

const SIZE_OF_LONG: usize = 8;

fn highest_bit(value: u8) -> u32 {
    7 - value.leading_zeros()
}

/// Read up to 7 bytes as a little endian integer.
fn read_tail(input: &[u8]) -> u64 {
    input
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)))
}

/// Position of a backward bit reader.
///
/// `bits` is a 64-bit window whose most significant bit is the next unread
/// bit once `consumed` bits have been skipped. `current` is the index of the
/// first byte of the window within the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitCursor {
    pub bits: u64,
    pub current: usize,
    pub consumed: u32,
}

impl BitCursor {
    /// Obtain the next `count` bits without consuming them.
    ///
    /// Once the window is fully consumed this yields zeros.
    #[inline]
    pub fn peek(&self, count: u32) -> u64 {
        peek_bits(self.consumed, self.bits, count)
    }

    /// Consume `count` bits, returning them in the low bits of the value.
    #[inline]
    pub fn read(self, count: u32) -> (Self, u64) {
        let value = self.peek(count);

        (
            Self {
                consumed: self.consumed + count,
                ..self
            },
            value,
        )
    }
}

/// Extract `count` bits from `bits` after skipping `consumed` from the top.
#[inline]
pub fn peek_bits(consumed: u32, bits: u64, count: u32) -> u64 {
    if consumed >= 64 {
        return 0;
    }

    ((bits << consumed) >> 1) >> (63 - count)
}

/// Outcome of refilling a [BitCursor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    /// More input remains before the window.
    Unfinished,
    /// The window now starts at the beginning of the input.
    Exhausted,
    /// More bits were consumed than the stream contains.
    Overflow,
}

/// Backward reader over a complete bit stream.
#[derive(Clone, Copy, Debug)]
pub struct BitReader<'a> {
    input: &'a [u8],
}

impl<'a> BitReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Locate the end mark and load the first window.
    pub fn initialize(&self) -> CompressionResult<BitCursor> {
        let last = match self.input.last() {
            Some(b) => *b,
            None => return Err(Error::malformed(0, "bitstream is empty")),
        };

        if last == 0 {
            return Err(Error::malformed(
                self.input.len() - 1,
                "bitstream end mark not present",
            ));
        }

        let consumed = SIZE_OF_LONG as u32 - highest_bit(last);

        Ok(if self.input.len() >= SIZE_OF_LONG {
            let current = self.input.len() - SIZE_OF_LONG;
            BitCursor {
                bits: LittleEndian::read_u64(&self.input[current..]),
                current,
                consumed,
            }
        } else {
            BitCursor {
                bits: read_tail(self.input),
                current: 0,
                consumed: consumed + (SIZE_OF_LONG - self.input.len()) as u32 * 8,
            }
        })
    }

    /// Slide the window backward over fully consumed bytes.
    pub fn load(&self, cursor: BitCursor) -> (BitCursor, LoadStatus) {
        if cursor.consumed > 64 {
            return (cursor, LoadStatus::Overflow);
        } else if cursor.current == 0 {
            return (cursor, LoadStatus::Exhausted);
        }

        let bytes = (cursor.consumed >> 3) as usize;

        if cursor.current >= SIZE_OF_LONG {
            let current = cursor.current - bytes;

            (
                BitCursor {
                    bits: LittleEndian::read_u64(&self.input[current..]),
                    current,
                    consumed: cursor.consumed & 0b111,
                },
                LoadStatus::Unfinished,
            )
        } else if cursor.current < bytes {
            let bytes = cursor.current;

            (
                BitCursor {
                    bits: LittleEndian::read_u64(self.input),
                    current: 0,
                    consumed: cursor.consumed - bytes as u32 * 8,
                },
                LoadStatus::Exhausted,
            )
        } else {
            let current = cursor.current - bytes;

            (
                BitCursor {
                    bits: LittleEndian::read_u64(&self.input[current..]),
                    current,
                    consumed: cursor.consumed - bytes as u32 * 8,
                },
                LoadStatus::Unfinished,
            )
        }
    }
}

/// Forward bit writer into a fixed size buffer.
///
/// The final 8 bytes of the buffer are scratch space for whole-word stores.
/// If the stream reaches them, [BitWriter::close] reports that nothing fits.
pub struct BitWriter<'a> {
    output: &'a mut [u8],
    limit: usize,
    container: u64,
    bit_count: u32,
    current: usize,
}

impl<'a> BitWriter<'a> {
    pub fn new(output: &'a mut [u8]) -> Self {
        let limit = output.len().saturating_sub(SIZE_OF_LONG);

        Self {
            output,
            limit,
            container: 0,
            bit_count: 0,
            current: 0,
        }
    }

    /// Append the low `count` bits of `value`. `count` must be at most 32.
    #[inline]
    pub fn add_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 32);
        let mask = (1u64 << count) - 1;
        self.container |= (value & mask) << self.bit_count;
        self.bit_count += count;
    }

    /// Emit completed bytes.
    pub fn flush(&mut self) {
        let bytes = (self.bit_count >> 3) as usize;

        if self.output.len() < SIZE_OF_LONG {
            self.bit_count &= 7;
            return;
        }

        LittleEndian::write_u64(
            &mut self.output[self.current..self.current + SIZE_OF_LONG],
            self.container,
        );
        self.current = (self.current + bytes).min(self.limit);

        self.bit_count &= 7;
        self.container = self.container.checked_shr(bytes as u32 * 8).unwrap_or(0);
    }

    /// Terminate the stream and return its length in bytes.
    ///
    /// Returns 0 if the output buffer was too small.
    pub fn close(mut self) -> usize {
        self.add_bits(1, 1);
        self.flush();

        if self.output.len() < SIZE_OF_LONG || self.current >= self.limit {
            return 0;
        }

        self.current + usize::from(self.bit_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fields(fields: &[(u64, u32)], capacity: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; capacity];
        let mut writer = BitWriter::new(&mut buffer);
        for (value, count) in fields {
            writer.add_bits(*value, *count);
            writer.flush();
        }
        let size = writer.close();
        buffer.truncate(size);
        buffer
    }

    #[test]
    fn test_empty_and_unterminated() {
        let reader = BitReader::new(&[]);
        assert!(reader.initialize().is_err());

        let reader = BitReader::new(&[0x12, 0x00]);
        let err = reader.initialize().unwrap_err();
        assert_eq!(err, Error::malformed(1, "bitstream end mark not present"));
    }

    #[test]
    fn test_initialize_short() -> CompressionResult<()> {
        let reader = BitReader::new(&[0b0000_0001]);
        let cursor = reader.initialize()?;
        assert_eq!(cursor.current, 0);
        assert_eq!(cursor.consumed, 64);
        assert_eq!(reader.load(cursor).1, LoadStatus::Exhausted);

        Ok(())
    }

    #[test]
    fn test_writer_too_small() {
        let mut buffer = [0u8; 7];
        let writer = BitWriter::new(&mut buffer);
        assert_eq!(writer.close(), 0);

        let mut buffer = [0u8; 9];
        let mut writer = BitWriter::new(&mut buffer);
        for _ in 0..4 {
            writer.add_bits(0xffff, 16);
            writer.flush();
        }
        assert_eq!(writer.close(), 0);
    }

    #[test]
    fn test_backward_read_order() -> CompressionResult<()> {
        // Fields are read back in reverse order of writing.
        let fields = (0..40u64)
            .map(|i| ((i * 2654435761) & 0x1fff, (i % 13 + 1) as u32))
            .collect::<Vec<_>>();

        let data = write_fields(&fields, 256);
        assert!(!data.is_empty());

        let reader = BitReader::new(&data);
        let mut cursor = reader.initialize()?;

        for (value, count) in fields.iter().rev() {
            let (next, got) = cursor.read(*count);
            assert_eq!(got, value & ((1 << count) - 1));
            let (next, status) = reader.load(next);
            assert_ne!(status, LoadStatus::Overflow);
            cursor = next;
        }

        // Every bit has been consumed: any further read overflows.
        assert_eq!(cursor.current, 0);
        assert_eq!(cursor.consumed, 64);
        let (cursor, _) = cursor.read(1);
        assert_eq!(reader.load(cursor).1, LoadStatus::Overflow);

        Ok(())
    }

    #[test]
    fn test_peek_does_not_consume() -> CompressionResult<()> {
        let data = write_fields(&[(0b101, 3), (0b11, 2)], 16);
        let reader = BitReader::new(&data);
        let cursor = reader.initialize()?;

        assert_eq!(cursor.peek(2), 0b11);
        assert_eq!(cursor.peek(2), 0b11);
        let (cursor, v) = cursor.read(2);
        assert_eq!(v, 0b11);
        assert_eq!(cursor.peek(3), 0b101);
        assert_eq!(cursor.peek(0), 0);

        Ok(())
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Variable length encoding of unsigned 32-bit integers.

Values are emitted 7 bits at a time, least significant group first. Every
byte except the last has its high bit set.
*/

use crate::{CompressionResult, Error};

const CONTINUATION_BIT: u8 = 0b1000_0000;
const VALUE_MASK: u8 = 0b0111_1111;

/// Bits 28..32 of a `u32` are all that remain for the 5th byte.
const TAIL_VALUE_MASK: u8 = 0b0000_1111;

/// Maximum number of bytes a single value occupies.
pub const MAX_ENCODED_LENGTH: usize = 5;

/// Append the encoding of `value` to `dest`.
pub fn encode_into(mut value: u32, dest: &mut Vec<u8>) {
    loop {
        let mut b = (value as u8) & VALUE_MASK;
        value >>= 7;

        if value != 0 {
            b |= CONTINUATION_BIT;
        }

        dest.push(b);

        if value == 0 {
            break;
        }
    }
}

pub fn encode(value: u32) -> Vec<u8> {
    let mut res = Vec::with_capacity(MAX_ENCODED_LENGTH);
    encode_into(value, &mut res);
    res
}

/// Number of bytes [encode] would produce for `value`.
pub fn encoded_length(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Decode a value starting at `*offset`, advancing `offset` past it.
pub fn decode(data: &[u8], offset: &mut usize) -> CompressionResult<u32> {
    let start = *offset;
    let mut res = 0u32;

    for i in 0..MAX_ENCODED_LENGTH - 1 {
        let b = *data
            .get(*offset)
            .ok_or_else(|| Error::malformed(*offset, "truncated varint"))?;
        *offset += 1;

        let value = b & VALUE_MASK;
        res |= (value as u32) << (7 * i);

        if b == value {
            return Ok(res);
        }
    }

    let b = *data
        .get(*offset)
        .ok_or_else(|| Error::malformed(*offset, "truncated varint"))?;

    if b & !TAIL_VALUE_MASK != 0 {
        return Err(Error::malformed(
            start,
            format!("varint tail byte 0x{:02x} out of range", b),
        ));
    }

    *offset += 1;

    Ok(res | ((b as u32) << 28))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values() {
        assert_eq!(encode(0), vec![0]);
        assert_eq!(encode(1), vec![1]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
    }

    #[test]
    fn test_round_trip_boundaries() -> CompressionResult<()> {
        let values = [
            0u32,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            0x1f_ffff,
            0x20_0000,
            0x0fff_ffff,
            0x1000_0000,
            i32::MAX as u32,
            u32::MAX,
        ];

        for value in values {
            let encoded = encode(value);
            assert!(encoded.len() <= MAX_ENCODED_LENGTH);
            assert_eq!(encoded.len(), encoded_length(value));

            let mut offset = 0;
            assert_eq!(decode(&encoded, &mut offset)?, value);
            assert_eq!(offset, encoded.len());
        }

        Ok(())
    }

    #[test]
    fn test_sequential_decode() -> CompressionResult<()> {
        let mut data = vec![];
        for value in [5u32, 70000, 0, 1 << 30] {
            encode_into(value, &mut data);
        }

        let mut offset = 0;
        assert_eq!(decode(&data, &mut offset)?, 5);
        assert_eq!(decode(&data, &mut offset)?, 70000);
        assert_eq!(decode(&data, &mut offset)?, 0);
        assert_eq!(decode(&data, &mut offset)?, 1 << 30);
        assert_eq!(offset, data.len());

        Ok(())
    }

    #[test]
    fn test_truncated() {
        let mut offset = 0;
        let err = decode(&[0x80, 0x80], &mut offset).unwrap_err();
        assert_eq!(err, Error::malformed(2, "truncated varint"));
    }

    #[test]
    fn test_unterminated() {
        let mut offset = 0;
        let err = decode(&[0xff, 0xff, 0xff, 0xff, 0x1f], &mut offset).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedData);

        let mut offset = 0;
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0x80, 0x00], &mut offset).is_err());
    }
}

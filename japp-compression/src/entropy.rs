// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Self describing entropy blocks.

A block starts with a mode byte:

* `0` raw: the payload is the data.
* `1` RLE: a single byte repeated to the expected length.
* `2` FSE: `table_log: u8`, `max_symbol: u8`, then `max_symbol + 1`
  varints holding `normalized_count + 1`, then an FSE bit stream.

The decoded length is not stored; callers always know it.
*/

use {
    crate::{
        fse::{self, CompressionTable, DecodingTable},
        varint, CompressionResult, Error,
    },
    std::convert::TryFrom,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockMode {
    Raw = 0,
    Rle = 1,
    Fse = 2,
}

impl From<BlockMode> for u8 {
    fn from(mode: BlockMode) -> Self {
        match mode {
            BlockMode::Raw => 0,
            BlockMode::Rle => 1,
            BlockMode::Fse => 2,
        }
    }
}

impl TryFrom<u8> for BlockMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlockMode::Raw),
            1 => Ok(BlockMode::Rle),
            2 => Ok(BlockMode::Fse),
            _ => Err(Error::UnsupportedFormat(format!(
                "unknown entropy block mode 0x{:02x}",
                value
            ))),
        }
    }
}

fn raw_block(data: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(data.len() + 1);
    res.push(BlockMode::Raw.into());
    res.extend_from_slice(data);
    res
}

/// Encode `data` as an entropy block.
///
/// The smallest of the three modes is chosen, so the output is never more
/// than one byte larger than the input.
pub fn compress(data: &[u8]) -> CompressionResult<Vec<u8>> {
    let (counts, max_symbol) = fse::count_symbols(data);
    let distinct = counts.iter().filter(|c| **c > 0).count();

    if distinct == 1 && data.len() > 2 {
        return Ok(vec![BlockMode::Rle.into(), data[0]]);
    }

    if distinct < 2 || data.len() < 8 {
        return Ok(raw_block(data));
    }

    let table_log = fse::optimal_table_log(fse::MAX_TABLE_LOG, data.len(), max_symbol);
    let normalized = fse::normalize_counts(&counts[..=max_symbol], table_log)?;
    let table = CompressionTable::build(&normalized, table_log)?;

    let mut header = vec![BlockMode::Fse.into(), table_log as u8, max_symbol as u8];
    for count in &normalized {
        varint::encode_into((*count + 1) as u32, &mut header);
    }

    if header.len() >= data.len() {
        return Ok(raw_block(data));
    }

    // Anything that would not beat a raw block is abandoned by the bit writer.
    let mut stream = vec![0u8; data.len() + 8 - header.len()];
    let size = fse::compress(&table, data, &mut stream);

    if size == 0 {
        return Ok(raw_block(data));
    }

    header.extend_from_slice(&stream[..size]);

    Ok(header)
}

/// Decode an entropy block holding exactly `output.len()` bytes.
pub fn decompress_into(block: &[u8], output: &mut [u8]) -> CompressionResult<()> {
    let mode = *block
        .first()
        .ok_or_else(|| Error::malformed(0, "empty entropy block"))?;
    let payload = &block[1..];

    match BlockMode::try_from(mode)? {
        BlockMode::Raw => {
            if payload.len() != output.len() {
                return Err(Error::malformed(
                    1,
                    format!(
                        "raw block holds {} bytes; expected {}",
                        payload.len(),
                        output.len()
                    ),
                ));
            }

            output.copy_from_slice(payload);
        }
        BlockMode::Rle => {
            if payload.len() != 1 {
                return Err(Error::malformed(1, "RLE block must hold exactly one byte"));
            }

            output.fill(payload[0]);
        }
        BlockMode::Fse => {
            if payload.len() < 2 {
                return Err(Error::malformed(1, "truncated FSE block header"));
            }

            let table_log = payload[0] as u32;
            let max_symbol = payload[1] as usize;

            let mut offset = 3;
            let mut normalized = Vec::with_capacity(max_symbol + 1);
            for _ in 0..=max_symbol {
                let value = varint::decode(block, &mut offset)?;
                if value > (1 << fse::MAX_TABLE_LOG) + 1 {
                    return Err(Error::malformed(offset, "normalized count out of range"));
                }
                normalized.push(value as i16 - 1);
            }

            let table = DecodingTable::build(&normalized, table_log).map_err(|e| match e {
                Error::MalformedData { message, .. } => Error::malformed(1, message),
                e => e,
            })?;

            let stream = &block[offset..];
            let decoded =
                fse::decompress(&table, stream, output).map_err(|e| e.offset_by(offset))?;

            if decoded != output.len() {
                return Err(Error::malformed(
                    offset,
                    format!(
                        "FSE stream decoded to {} bytes; expected {}",
                        decoded,
                        output.len()
                    ),
                ));
            }
        }
    }

    Ok(())
}

/// Decode an entropy block holding `size` bytes.
pub fn decompress(block: &[u8], size: usize) -> CompressionResult<Vec<u8>> {
    let mut output = vec![0u8; size];
    decompress_into(block, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes() -> CompressionResult<()> {
        assert_eq!(compress(b"")?, vec![0]);
        assert_eq!(compress(b"ab")?, vec![0, b'a', b'b']);
        assert_eq!(compress(&[7u8; 1000])?, vec![1, 7]);

        let text =
            b"abababababababababababababababbbbbbbbbbbbbbbbbbbaaaaaaaaaaaaaaaaaaaaaaa".repeat(8);
        let block = compress(&text)?;
        assert_eq!(block[0], u8::from(BlockMode::Fse));
        assert!(block.len() < text.len() / 2);
        assert_eq!(decompress(&block, text.len())?, text);

        Ok(())
    }

    #[test]
    fn test_incompressible_stays_raw() -> CompressionResult<()> {
        let data = (0..=255u8).collect::<Vec<_>>();
        let block = compress(&data)?;
        assert_eq!(block[0], u8::from(BlockMode::Raw));
        assert_eq!(block.len(), data.len() + 1);
        assert_eq!(decompress(&block, data.len())?, data);

        Ok(())
    }

    #[test]
    fn test_round_trip_sizes() -> CompressionResult<()> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        for size in [3usize, 8, 9, 17, 100, 1000, 70000] {
            let data = (0..size)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    // Skewed towards a handful of letters.
                    b"eeeeeeeettaaoinshrdlu"[(state % 21) as usize]
                })
                .collect::<Vec<_>>();

            let block = compress(&data)?;
            assert_eq!(decompress(&block, size)?, data, "size {}", size);
        }

        Ok(())
    }

    #[test]
    fn test_wrong_size_rejected() -> CompressionResult<()> {
        let data = b"hello hello hello hello hello hello".to_vec();
        let block = compress(&data)?;

        assert!(decompress(&block, data.len() - 1).is_err());
        assert!(decompress(&block, data.len() + 5).is_err());
        assert!(decompress(&[0, 1, 2], 3).is_err());
        assert!(decompress(&[1], 2).is_err());

        let err = decompress(&[9, 1], 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedFormat);

        Ok(())
    }

    #[test]
    fn test_corrupt_table_rejected() {
        // Counts summing to 30 instead of 32.
        let block = [2u8, 5, 1, 16, 16, 0x01];
        let err = decompress(&block, 4).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedData);
    }
}

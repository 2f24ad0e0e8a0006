// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! LZ77 block codec using the LZ4 token format.

A block is a series of sequences. Each sequence has a token byte whose high
nibble is a literal run length and whose low nibble is a match length minus
[MIN_MATCH]. A nibble of 15 is extended by following bytes: every `0xff`
adds 255 and the first byte below `0xff` is added and ends the length.
Literals follow the (extended) literal length, then a 16-bit little endian
match distance, then the extended match length. The final sequence holds
literals only.

Two match finders produce blocks: [compress_fast] probes a single hash slot
per position and [compress_high] walks hash chains with lazy evaluation of
overlapping candidates. Both emit streams [decompress] accepts.
*/

use {
    crate::{CompressionResult, Error},
    byteorder::{ByteOrder, LittleEndian},
};

pub use crate::lz4_hc::compress_high;

pub const MIN_MATCH: usize = 4;

const COPY_LENGTH: usize = 8;
pub(crate) const LAST_LITERALS: usize = 5;
pub(crate) const MF_LIMIT: usize = COPY_LENGTH + MIN_MATCH;
const MIN_LENGTH: usize = MF_LIMIT + 1;

const ML_BITS: u32 = 4;
pub(crate) const ML_MASK: usize = (1 << ML_BITS) - 1;
const RUN_MASK: usize = (1 << (8 - ML_BITS)) - 1;

const SKIP_STRENGTH: u32 = 6;

const HASH_LOG: u32 = 12;
const HASH_LOG_64K: u32 = 13;
pub(crate) const HASH_LOG_HC: u32 = 15;

/// Matches must start strictly less than this many bytes back.
pub const MAX_DISTANCE: usize = 1 << 16;

const LZ4_64K_LIMIT: usize = (1 << 16) + (MF_LIMIT - 1);

/// Worst case size of a compressed block for `length` input bytes.
pub fn max_compressed_length(length: usize) -> usize {
    length + length / 255 + 16
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

#[inline]
pub(crate) fn hash(value: u32, log: u32) -> usize {
    (value.wrapping_mul(2654435761) >> (32 - log)) as usize
}

/// Count equal bytes at `reference` and `offset`, stopping before `limit`.
pub(crate) fn common_bytes(src: &[u8], mut reference: usize, mut offset: usize, limit: usize) -> usize {
    let mut len = 0;

    while offset + 8 <= limit {
        let a = LittleEndian::read_u64(&src[offset..offset + 8]);
        let b = LittleEndian::read_u64(&src[reference..reference + 8]);

        if a == b {
            len += 8;
            reference += 8;
            offset += 8;
        } else {
            return len + ((a ^ b).trailing_zeros() >> 3) as usize;
        }
    }

    while offset < limit && src[reference] == src[offset] {
        len += 1;
        reference += 1;
        offset += 1;
    }

    len
}

/// Count equal bytes preceding `o1` and `o2`, not moving below `l1`/`l2`.
pub(crate) fn common_bytes_backward(
    src: &[u8],
    mut o1: usize,
    mut o2: usize,
    l1: usize,
    l2: usize,
) -> usize {
    let mut count = 0;

    while o1 > l1 && o2 > l2 && src[o1 - 1] == src[o2 - 1] {
        o1 -= 1;
        o2 -= 1;
        count += 1;
    }

    count
}

fn write_len(mut len: usize, dest: &mut Vec<u8>) {
    while len >= 0xff {
        dest.push(0xff);
        len -= 0xff;
    }
    dest.push(len as u8);
}

/// Emit literals `src[anchor..match_offset]` followed by a match.
pub(crate) fn encode_sequence(
    src: &[u8],
    anchor: usize,
    match_offset: usize,
    match_reference: usize,
    match_len: usize,
    dest: &mut Vec<u8>,
) {
    let run_len = match_offset - anchor;
    let token_offset = dest.len();
    dest.push(0);

    let mut token = if run_len >= RUN_MASK {
        write_len(run_len - RUN_MASK, dest);
        (RUN_MASK << ML_BITS) as u8
    } else {
        (run_len << ML_BITS) as u8
    };

    dest.extend_from_slice(&src[anchor..match_offset]);

    let distance = (match_offset - match_reference) as u16;
    dest.extend_from_slice(&distance.to_le_bytes());

    let match_len = match_len - MIN_MATCH;
    if match_len >= ML_MASK {
        token |= ML_MASK as u8;
        write_len(match_len - ML_MASK, dest);
    } else {
        token |= match_len as u8;
    }

    dest[token_offset] = token;
}

/// Emit the trailing literal-only sequence.
pub(crate) fn last_literals(src: &[u8], anchor: usize, dest: &mut Vec<u8>) {
    let run_len = src.len() - anchor;

    if run_len >= RUN_MASK {
        dest.push((RUN_MASK << ML_BITS) as u8);
        write_len(run_len - RUN_MASK, dest);
    } else {
        dest.push((run_len << ML_BITS) as u8);
    }

    dest.extend_from_slice(&src[anchor..]);
}

/// Compress with a single hash probe per position.
pub fn compress_fast(src: &[u8]) -> Vec<u8> {
    let mut dest = Vec::with_capacity(max_compressed_length(src.len()));
    let src_end = src.len();
    let mut anchor = 0usize;

    if src_end >= MIN_LENGTH {
        let hash_log = if src_end < LZ4_64K_LIMIT {
            HASH_LOG_64K
        } else {
            HASH_LOG
        };
        let src_limit = src_end - LAST_LITERALS;
        let mf_limit = src_end - MF_LIMIT;

        let mut table = vec![0u32; 1 << hash_log];
        let mut s_off = 1usize;

        'main: loop {
            let mut forward = s_off;
            let mut step = 1;
            let mut search_match_nb = 1usize << SKIP_STRENGTH;

            let mut reference = loop {
                s_off = forward;
                forward += step;
                step = search_match_nb >> SKIP_STRENGTH;
                search_match_nb += 1;

                if forward > mf_limit {
                    break 'main;
                }

                let h = hash(read_u32(src, s_off), hash_log);
                let candidate = table[h] as usize;
                table[h] = s_off as u32;

                if s_off - candidate < MAX_DISTANCE
                    && read_u32(src, candidate) == read_u32(src, s_off)
                {
                    break candidate;
                }
            };

            let excess = common_bytes_backward(src, reference, s_off, 0, anchor);
            s_off -= excess;
            reference -= excess;

            let run_len = s_off - anchor;
            let mut token_offset = dest.len();
            dest.push(0);

            if run_len >= RUN_MASK {
                dest[token_offset] = (RUN_MASK << ML_BITS) as u8;
                write_len(run_len - RUN_MASK, &mut dest);
            } else {
                dest[token_offset] = (run_len << ML_BITS) as u8;
            }

            dest.extend_from_slice(&src[anchor..s_off]);

            loop {
                dest.extend_from_slice(&((s_off - reference) as u16).to_le_bytes());

                s_off += MIN_MATCH;
                let match_len = common_bytes(src, reference + MIN_MATCH, s_off, src_limit);
                s_off += match_len;

                if match_len >= ML_MASK {
                    dest[token_offset] |= ML_MASK as u8;
                    write_len(match_len - ML_MASK, &mut dest);
                } else {
                    dest[token_offset] |= match_len as u8;
                }

                if s_off > mf_limit {
                    anchor = s_off;
                    break 'main;
                }

                table[hash(read_u32(src, s_off - 2), hash_log)] = (s_off - 2) as u32;

                let h = hash(read_u32(src, s_off), hash_log);
                reference = table[h] as usize;
                table[h] = s_off as u32;

                if s_off - reference >= MAX_DISTANCE
                    || read_u32(src, reference) != read_u32(src, s_off)
                {
                    break;
                }

                // Immediate follow-up match: zero length literal run.
                token_offset = dest.len();
                dest.push(0);
            }

            anchor = s_off;
            s_off += 1;
        }
    }

    last_literals(src, anchor, &mut dest);

    dest
}

fn read_byte(src: &[u8], offset: usize) -> CompressionResult<u8> {
    src.get(offset)
        .copied()
        .ok_or_else(|| Error::malformed(offset, "truncated LZ4 block"))
}

fn read_extended_len(src: &[u8], offset: &mut usize, mut len: usize) -> CompressionResult<usize> {
    loop {
        let b = read_byte(src, *offset)?;
        *offset += 1;
        len += b as usize;

        if b != 0xff {
            return Ok(len);
        }
    }
}

/// Decompress a block into `dest`, which must be exactly the original size.
///
/// Returns the number of bytes of `src` consumed.
pub fn decompress_into(src: &[u8], dest: &mut [u8]) -> CompressionResult<usize> {
    let dest_end = dest.len();

    if dest_end == 0 {
        return match src.first() {
            Some(0) => Ok(1),
            _ => Err(Error::malformed(0, "empty block must be a single zero token")),
        };
    }

    let mut s_off = 0usize;
    let mut d_off = 0usize;

    loop {
        let token = read_byte(src, s_off)? as usize;
        s_off += 1;

        let mut literal_len = token >> ML_BITS;
        if literal_len == RUN_MASK {
            literal_len = read_extended_len(src, &mut s_off, literal_len)?;
        }

        let literal_end = d_off + literal_len;
        if literal_end > dest_end {
            return Err(Error::malformed(s_off, "literal run exceeds output size"));
        }
        if s_off + literal_len > src.len() {
            return Err(Error::malformed(s_off, "truncated literal run"));
        }

        dest[d_off..literal_end].copy_from_slice(&src[s_off..s_off + literal_len]);
        s_off += literal_len;
        d_off = literal_end;

        if d_off == dest_end {
            break;
        }

        if s_off + 2 > src.len() {
            return Err(Error::malformed(s_off, "truncated match distance"));
        }
        let distance = LittleEndian::read_u16(&src[s_off..s_off + 2]) as usize;
        s_off += 2;

        if distance == 0 || distance > d_off {
            return Err(Error::malformed(
                s_off - 2,
                "match refers to data before start of output",
            ));
        }

        let mut match_len = token & ML_MASK;
        if match_len == ML_MASK {
            match_len = read_extended_len(src, &mut s_off, match_len)?;
        }
        match_len += MIN_MATCH;

        let match_end = d_off + match_len;
        if match_end > dest_end {
            return Err(Error::malformed(s_off, "match exceeds output size"));
        }

        let match_start = d_off - distance;
        if distance >= match_len {
            dest.copy_within(match_start..match_start + match_len, d_off);
        } else {
            // Overlapping copy repeats the most recent `distance` bytes.
            for i in 0..match_len {
                dest[d_off + i] = dest[match_start + i];
            }
        }

        d_off = match_end;
    }

    Ok(s_off)
}

/// Decompress a block holding exactly `size` bytes.
pub fn decompress(src: &[u8], size: usize) -> CompressionResult<Vec<u8>> {
    let mut dest = vec![0u8; size];
    let read = decompress_into(src, &mut dest)?;

    if read != src.len() {
        return Err(Error::malformed(read, "trailing data after LZ4 block"));
    }

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn corpus() -> Vec<Vec<u8>> {
        let mut text = vec![];
        for i in 0..2000 {
            text.extend_from_slice(format!("line {} of the sample text; ", i % 37).as_bytes());
        }

        vec![
            vec![],
            b"a".to_vec(),
            b"abcdefghijkl".to_vec(),
            b"abcdefghijklm".to_vec(),
            vec![0x41; 100_000],
            b"abcabcabcabcabcabcabcabcabcabcabcabcabc".to_vec(),
            pseudo_random(10_000, 42),
            pseudo_random(100_000, 7),
            text,
            // Larger than the 64 KiB table variant with repetition at long range.
            [pseudo_random(70_000, 1), pseudo_random(70_000, 1)].concat(),
        ]
    }

    #[test]
    fn test_round_trip_fast() -> CompressionResult<()> {
        for data in corpus() {
            let compressed = compress_fast(&data);
            assert!(compressed.len() <= max_compressed_length(data.len()));
            assert_eq!(decompress(&compressed, data.len())?, data);
        }

        Ok(())
    }

    #[test]
    fn test_round_trip_high() -> CompressionResult<()> {
        for data in corpus() {
            let compressed = compress_high(&data);
            assert!(compressed.len() <= max_compressed_length(data.len()));
            assert_eq!(decompress(&compressed, data.len())?, data);
        }

        Ok(())
    }

    #[test]
    fn test_repetitive_input_shrinks() {
        let data = vec![0x41u8; 100_000];
        assert!(compress_fast(&data).len() < 1000);
        assert!(compress_high(&data).len() < 1000);
    }

    #[test]
    fn test_empty_block() -> CompressionResult<()> {
        assert_eq!(compress_fast(&[]), vec![0]);
        assert_eq!(decompress(&[0], 0)?, Vec::<u8>::new());
        assert!(decompress(&[0x10, 0x41], 0).is_err());

        Ok(())
    }

    #[test]
    fn test_hand_built_overlapping_match() -> CompressionResult<()> {
        // Literal "ab", then a 10 byte match at distance 2, then 5 literals.
        let block = [0x26, b'a', b'b', 0x02, 0x00, 0x50, b'v', b'w', b'x', b'y', b'z'];
        assert_eq!(decompress(&block, 17)?, b"ababababababvwxyz".to_vec());

        Ok(())
    }

    #[test]
    fn test_extended_lengths() -> CompressionResult<()> {
        // 15 + 255 + 30 = 300 literals.
        let mut block = vec![0xf0, 0xff, 30];
        block.extend(std::iter::repeat(b'q').take(300));
        assert_eq!(decompress(&block, 300)?, vec![b'q'; 300]);

        Ok(())
    }

    #[test]
    fn test_malformed_blocks() {
        // Distance reaching before the output start.
        let block = [0x10, b'a', 0x02, 0x00, 0x00];
        let err = decompress(&block, 10).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MalformedData);

        // Literal run longer than the declared size.
        assert!(decompress(&[0x50, 1, 2, 3, 4, 5], 4).is_err());

        // Match running past the declared size.
        assert!(decompress(&[0x1f, b'a', 0x01, 0x00, 0x10], 20).is_err());

        // Truncated input.
        assert!(decompress(&[0x50, 1, 2], 5).is_err());

        // Trailing bytes after the final literals.
        assert!(decompress(&[0x10, b'a', 0x00], 1).is_err());
    }
}

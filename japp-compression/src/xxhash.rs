// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! One-shot XxHash64.

Checksums stored in containers are produced by this function, so its output
must be identical to the reference XXH64 for every input and seed.
*/

use byteorder::{ByteOrder, LittleEndian};

const PRIME64_1: u64 = 0x9E37_79B1_85EB_CA87;
const PRIME64_2: u64 = 0xC2B2_AE3D_27D4_EB4F;
const PRIME64_3: u64 = 0x1656_67B1_9E37_79F9;
const PRIME64_4: u64 = 0x85EB_CA77_C2B2_AE63;
const PRIME64_5: u64 = 0x27D4_EB2F_1656_67C5;

#[inline]
fn round(acc: u64, lane: u64) -> u64 {
    acc.wrapping_add(lane.wrapping_mul(PRIME64_2))
        .rotate_left(31)
        .wrapping_mul(PRIME64_1)
}

#[inline]
fn merge_round(hash: u64, acc: u64) -> u64 {
    (hash ^ round(0, acc))
        .wrapping_mul(PRIME64_1)
        .wrapping_add(PRIME64_4)
}

fn avalanche(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(PRIME64_2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(PRIME64_3);
    hash ^= hash >> 32;
    hash
}

/// Compute the XxHash64 of `data` with the given `seed`.
pub fn xxhash64_with_seed(data: &[u8], seed: u64) -> u64 {
    let mut remaining = data;

    let mut hash = if data.len() >= 32 {
        let mut v1 = seed.wrapping_add(PRIME64_1).wrapping_add(PRIME64_2);
        let mut v2 = seed.wrapping_add(PRIME64_2);
        let mut v3 = seed;
        let mut v4 = seed.wrapping_sub(PRIME64_1);

        while remaining.len() >= 32 {
            v1 = round(v1, LittleEndian::read_u64(&remaining[0..8]));
            v2 = round(v2, LittleEndian::read_u64(&remaining[8..16]));
            v3 = round(v3, LittleEndian::read_u64(&remaining[16..24]));
            v4 = round(v4, LittleEndian::read_u64(&remaining[24..32]));
            remaining = &remaining[32..];
        }

        let mut hash = v1
            .rotate_left(1)
            .wrapping_add(v2.rotate_left(7))
            .wrapping_add(v3.rotate_left(12))
            .wrapping_add(v4.rotate_left(18));

        hash = merge_round(hash, v1);
        hash = merge_round(hash, v2);
        hash = merge_round(hash, v3);
        merge_round(hash, v4)
    } else {
        seed.wrapping_add(PRIME64_5)
    };

    hash = hash.wrapping_add(data.len() as u64);

    while remaining.len() >= 8 {
        let k = round(0, LittleEndian::read_u64(&remaining[0..8]));
        hash = (hash ^ k)
            .rotate_left(27)
            .wrapping_mul(PRIME64_1)
            .wrapping_add(PRIME64_4);
        remaining = &remaining[8..];
    }

    if remaining.len() >= 4 {
        let k = (LittleEndian::read_u32(&remaining[0..4]) as u64).wrapping_mul(PRIME64_1);
        hash = (hash ^ k)
            .rotate_left(23)
            .wrapping_mul(PRIME64_2)
            .wrapping_add(PRIME64_3);
        remaining = &remaining[4..];
    }

    for &b in remaining {
        hash = (hash ^ (b as u64).wrapping_mul(PRIME64_5))
            .rotate_left(11)
            .wrapping_mul(PRIME64_1);
    }

    avalanche(hash)
}

/// Compute the XxHash64 of `data` with seed 0.
///
/// This is the checksum persisted in resource records and group headers.
pub fn xxhash64(data: &[u8]) -> u64 {
    xxhash64_with_seed(data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(xxhash64(b""), 0xEF46_DB37_51D8_E999);
        assert_eq!(xxhash64(b"a"), 0xD24E_C4F1_A98C_6E5B);
        assert_eq!(xxhash64(b"abc"), 0x44BC_2CF5_AD77_0999);
        assert_eq!(
            xxhash64(b"The quick brown fox jumps over the lazy dog"),
            0x0B24_2D36_1FDA_71BC
        );
    }

    #[test]
    fn test_deterministic_and_sensitive() {
        let data = (0..1000u32).map(|i| (i * 7 + 3) as u8).collect::<Vec<_>>();

        let first = xxhash64(&data);
        assert_eq!(first, xxhash64(&data));

        let mut flipped = data.clone();
        flipped[517] ^= 0x10;
        assert_ne!(first, xxhash64(&flipped));

        assert_ne!(first, xxhash64_with_seed(&data, 1));
    }

    #[test]
    fn test_all_tail_lengths_distinct() {
        let data = [0x5au8; 64];
        let hashes = (0..=data.len())
            .map(|len| xxhash64(&data[..len]))
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(hashes.len(), data.len() + 1);
    }
}

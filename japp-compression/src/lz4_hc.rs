// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High compression LZ4 match finder using hash chains.

use crate::lz4::{
    common_bytes, common_bytes_backward, encode_sequence, hash, last_literals,
    max_compressed_length, read_u32, HASH_LOG_HC, LAST_LITERALS, MAX_DISTANCE, MF_LIMIT,
    MIN_MATCH, ML_MASK,
};

const MAX_ATTEMPTS: usize = 256;
const OPTIMAL_ML: isize = (ML_MASK - 1 + MIN_MATCH) as isize;
const CHAIN_MASK: usize = MAX_DISTANCE - 1;

const MIN_MATCH_I: isize = MIN_MATCH as isize;

/// A candidate match. Positions are signed so the lazy evaluation below can
/// transiently shrink lengths below zero without wrapping.
#[derive(Clone, Copy, Debug, Default)]
struct Match {
    start: isize,
    reference: isize,
    len: isize,
}

impl Match {
    fn fix(&mut self, correction: isize) {
        self.start += correction;
        self.reference += correction;
        self.len -= correction;
    }

    fn end(&self) -> isize {
        self.start + self.len
    }
}

struct HashTable<'a> {
    src: &'a [u8],
    next_to_update: isize,
    heads: Vec<isize>,
    chain: Vec<u16>,
}

impl<'a> HashTable<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            next_to_update: 0,
            heads: vec![-1; 1 << HASH_LOG_HC],
            chain: vec![0; MAX_DISTANCE],
        }
    }

    fn word(&self, offset: isize) -> u32 {
        read_u32(self.src, offset as usize)
    }

    fn words_equal(&self, a: isize, b: isize) -> bool {
        self.word(a) == self.word(b)
    }

    fn head(&self, offset: isize) -> isize {
        self.heads[hash(self.word(offset), HASH_LOG_HC)]
    }

    fn next(&self, offset: isize) -> isize {
        offset - self.chain[offset as usize & CHAIN_MASK] as isize
    }

    fn add_hash(&mut self, offset: isize) {
        let h = hash(self.word(offset), HASH_LOG_HC);
        let delta = (offset - self.heads[h]).min(MAX_DISTANCE as isize - 1);

        self.chain[offset as usize & CHAIN_MASK] = delta as u16;
        self.heads[h] = offset;
    }

    fn insert(&mut self, offset: isize) {
        while self.next_to_update < offset {
            self.add_hash(self.next_to_update);
            self.next_to_update += 1;
        }
    }

    fn forward_len(&self, reference: isize, offset: isize, match_limit: isize) -> isize {
        MIN_MATCH_I
            + common_bytes(
                self.src,
                (reference + MIN_MATCH_I) as usize,
                (offset + MIN_MATCH_I) as usize,
                match_limit as usize,
            ) as isize
    }

    fn in_window(reference: isize, offset: isize) -> bool {
        reference >= 0.max(offset - MAX_DISTANCE as isize + 1) && reference <= offset
    }

    fn insert_and_find_best_match(&mut self, offset: isize, match_limit: isize, m: &mut Match) -> bool {
        m.start = offset;
        m.len = 0;
        let mut delta = 0;
        let mut repeat_len = 0;

        self.insert(offset);

        let mut reference = self.head(offset);

        // Short distance repetition, such as runs of a single byte.
        if reference >= 0 && reference >= offset - 4 && reference <= offset {
            if self.words_equal(reference, offset) {
                delta = offset - reference;
                repeat_len = self.forward_len(reference, offset, match_limit);
                m.len = repeat_len;
                m.reference = reference;
            }
            reference = self.next(reference);
        }

        for _ in 0..MAX_ATTEMPTS {
            if !Self::in_window(reference, offset) {
                break;
            }

            if self.words_equal(reference, offset) {
                let len = self.forward_len(reference, offset, match_limit);
                if len > m.len {
                    m.reference = reference;
                    m.len = len;
                }
            }

            reference = self.next(reference);
        }

        if repeat_len != 0 {
            let mut ptr = offset;
            let end = offset + repeat_len - (MIN_MATCH_I - 1);

            while ptr < end - delta {
                self.chain[ptr as usize & CHAIN_MASK] = delta as u16;
                ptr += 1;
            }

            loop {
                self.chain[ptr as usize & CHAIN_MASK] = delta as u16;
                let h = hash(self.word(ptr), HASH_LOG_HC);
                self.heads[h] = ptr;
                ptr += 1;

                if ptr >= end {
                    break;
                }
            }

            self.next_to_update = end;
        }

        m.len != 0
    }

    fn insert_and_find_wider_match(
        &mut self,
        offset: isize,
        start_limit: isize,
        match_limit: isize,
        min_len: isize,
        m: &mut Match,
    ) -> bool {
        m.len = min_len;

        self.insert(offset);

        let mut reference = self.head(offset);

        for _ in 0..MAX_ATTEMPTS {
            if !Self::in_window(reference, offset) {
                break;
            }

            if self.words_equal(reference, offset) {
                let forward = self.forward_len(reference, offset, match_limit);
                let backward = common_bytes_backward(
                    self.src,
                    reference as usize,
                    offset as usize,
                    0,
                    start_limit as usize,
                ) as isize;

                if backward + forward > m.len {
                    m.len = backward + forward;
                    m.reference = reference - backward;
                    m.start = offset - backward;
                }
            }

            reference = self.next(reference);
        }

        m.len > min_len
    }
}

fn encode(src: &[u8], anchor: isize, m: &Match, dest: &mut Vec<u8>) -> isize {
    encode_sequence(
        src,
        anchor as usize,
        m.start as usize,
        m.reference as usize,
        m.len as usize,
        dest,
    );

    m.end()
}

/// Compress with hash chain search and lazy match selection.
///
/// Slower than [crate::lz4::compress_fast] but typically smaller output.
pub fn compress_high(src: &[u8]) -> Vec<u8> {
    let mut dest = Vec::with_capacity(max_compressed_length(src.len()));

    let src_end = src.len() as isize;
    let mf_limit = src_end - MF_LIMIT as isize;
    let match_limit = src_end - LAST_LITERALS as isize;

    let mut s_off = 1isize;
    let mut anchor = 0isize;

    let mut table = HashTable::new(src);
    let mut m0: Match;
    let mut m1 = Match::default();
    let mut m2 = Match::default();
    let mut m3 = Match::default();

    'main: while s_off < mf_limit {
        if !table.insert_and_find_best_match(s_off, match_limit, &mut m1) {
            s_off += 1;
            continue;
        }

        m0 = m1;

        'search2: loop {
            if m1.end() >= mf_limit
                || !table.insert_and_find_wider_match(
                    m1.end() - 2,
                    m1.start + 1,
                    match_limit,
                    m1.len,
                    &mut m2,
                )
            {
                anchor = encode(src, anchor, &m1, &mut dest);
                s_off = anchor;
                continue 'main;
            }

            if m0.start < m1.start && m2.start < m1.start + m0.len {
                m1 = m0;
            }

            if m2.start - m1.start < 3 {
                m1 = m2;
                continue 'search2;
            }

            'search3: loop {
                if m2.start - m1.start < OPTIMAL_ML {
                    let mut new_len = m1.len.min(OPTIMAL_ML);
                    if m1.start + new_len > m2.end() - MIN_MATCH_I {
                        new_len = m2.start - m1.start + m2.len - MIN_MATCH_I;
                    }

                    let correction = new_len - (m2.start - m1.start);
                    if correction > 0 {
                        m2.fix(correction);
                    }
                }

                if m2.start + m2.len >= mf_limit
                    || !table.insert_and_find_wider_match(
                        m2.end() - 3,
                        m2.start,
                        match_limit,
                        m2.len,
                        &mut m3,
                    )
                {
                    // Two sequences left to emit.
                    if m2.start < m1.end() {
                        m1.len = m2.start - m1.start;
                    }

                    anchor = encode(src, anchor, &m1, &mut dest);
                    anchor = encode(src, anchor, &m2, &mut dest);
                    s_off = anchor;
                    continue 'main;
                }

                if m3.start < m1.end() + 3 {
                    if m3.start >= m1.end() {
                        // The second match is dropped; the third becomes the first.
                        if m2.start < m1.end() {
                            m2.fix(m1.end() - m2.start);
                            if m2.len < MIN_MATCH_I {
                                m2 = m3;
                            }
                        }

                        anchor = encode(src, anchor, &m1, &mut dest);
                        m1 = m3;
                        m0 = m2;
                        continue 'search2;
                    }

                    m2 = m3;
                    continue 'search3;
                }

                // Three ascending matches: the first can be written.
                if m2.start < m1.end() {
                    if m2.start - m1.start < ML_MASK as isize {
                        m1.len = m1.len.min(OPTIMAL_ML);
                        if m1.end() > m2.end() - MIN_MATCH_I {
                            m1.len = m2.end() - m1.start - MIN_MATCH_I;
                        }
                        m2.fix(m1.end() - m2.start);
                    } else {
                        m1.len = m2.start - m1.start;
                    }
                }

                anchor = encode(src, anchor, &m1, &mut dest);
                m1 = m2;
                m2 = m3;
            }
        }
    }

    last_literals(src, anchor as usize, &mut dest);

    dest
}

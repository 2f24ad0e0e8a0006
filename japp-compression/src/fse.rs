// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Finite state entropy (tANS) tables and codec.

Both directions are driven by a normalized distribution: one entry per
symbol value, summing to `1 << table_log`. A count of `-1` marks a symbol
whose real probability is below `1 / table_size`; it occupies a single
slot at the top of the table.

Table layout (the spread of symbols over states) is shared by
[DecodingTable::build] and [CompressionTable::build] and must not change,
or previously written streams stop decoding.
*/

use crate::{
    bitstream::{BitReader, BitWriter, LoadStatus},
    CompressionResult, Error,
};

pub const MIN_TABLE_LOG: u32 = 5;
pub const MAX_TABLE_LOG: u32 = 12;
pub const DEFAULT_TABLE_LOG: u32 = 11;
pub const MAX_SYMBOL: usize = 255;

fn highest_bit(value: u32) -> u32 {
    31 - value.leading_zeros()
}

fn table_step(table_size: usize) -> usize {
    (table_size >> 1) + (table_size >> 3) + 3
}

/// Validate a normalized distribution, returning the table size.
fn validate_normalized(normalized: &[i16], table_log: u32) -> CompressionResult<usize> {
    if !(MIN_TABLE_LOG..=MAX_TABLE_LOG).contains(&table_log) {
        return Err(Error::malformed(
            0,
            format!("table log {} out of range", table_log),
        ));
    }
    if normalized.is_empty() || normalized.len() > MAX_SYMBOL + 1 {
        return Err(Error::malformed(0, "invalid symbol count"));
    }

    let table_size = 1usize << table_log;
    let mut total = 0usize;
    for count in normalized {
        total += match *count {
            -1 => 1,
            c if c >= 0 => c as usize,
            c => {
                return Err(Error::malformed(
                    0,
                    format!("invalid normalized count {}", c),
                ))
            }
        };
    }

    if total != table_size {
        return Err(Error::malformed(
            0,
            format!(
                "normalized counts sum to {} instead of {}",
                total, table_size
            ),
        ));
    }

    Ok(table_size)
}

/// Distribute symbols over table slots.
///
/// Low probability symbols fill slots from the top down. Every other symbol
/// is placed `count` times, advancing by a fixed step and skipping those
/// reserved top slots.
fn spread_symbols(normalized: &[i16], table_size: usize) -> CompressionResult<Vec<u8>> {
    let mask = table_size - 1;
    let mut high_threshold = table_size - 1;
    let mut table_symbol = vec![0u8; table_size];

    for (symbol, count) in normalized.iter().enumerate() {
        if *count == -1 {
            table_symbol[high_threshold] = symbol as u8;
            high_threshold = high_threshold.wrapping_sub(1);
        }
    }

    let step = table_step(table_size);
    let mut position = 0usize;

    for (symbol, count) in normalized.iter().enumerate() {
        for _ in 0..(*count).max(0) {
            table_symbol[position] = symbol as u8;
            position = (position + step) & mask;
            while position > high_threshold {
                position = (position + step) & mask;
            }
        }
    }

    if position != 0 {
        return Err(Error::malformed(0, "normalized counts do not fill table"));
    }

    Ok(table_symbol)
}

/// Per-state decode instructions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodingTable {
    pub log2_size: u32,
    pub symbol: Vec<u8>,
    pub number_of_bits: Vec<u8>,
    pub new_state: Vec<u16>,
}

impl DecodingTable {
    pub fn build(normalized: &[i16], table_log: u32) -> CompressionResult<Self> {
        let table_size = validate_normalized(normalized, table_log)?;
        let symbol = spread_symbols(normalized, table_size)?;

        let mut symbol_next = normalized
            .iter()
            .map(|c| if *c == -1 { 1u32 } else { *c as u32 })
            .collect::<Vec<_>>();

        let mut number_of_bits = vec![0u8; table_size];
        let mut new_state = vec![0u16; table_size];

        for (u, s) in symbol.iter().enumerate() {
            let next_state = symbol_next[*s as usize];
            symbol_next[*s as usize] += 1;

            let bits = table_log - highest_bit(next_state);
            number_of_bits[u] = bits as u8;
            new_state[u] = ((next_state << bits) as usize - table_size) as u16;
        }

        Ok(Self {
            log2_size: table_log,
            symbol,
            number_of_bits,
            new_state,
        })
    }
}

/// Decode a bit stream into `output`, returning the number of bytes produced.
///
/// The stream encodes its own length. A destination too small to hold it is
/// an error.
pub fn decompress(
    table: &DecodingTable,
    input: &[u8],
    output: &mut [u8],
) -> CompressionResult<usize> {
    let reader = BitReader::new(input);
    let log = table.log2_size;
    let symbols = &table.symbol;
    let bits = &table.number_of_bits;
    let states = &table.new_state;

    let cursor = reader.initialize()?;

    let (cursor, value) = cursor.read(log);
    let mut state1 = value as usize;
    let (cursor, _) = reader.load(cursor);

    let (cursor, value) = cursor.read(log);
    let mut state2 = value as usize;
    let (mut cursor, mut status) = reader.load(cursor);

    let limit = output.len();
    let mut op = 0usize;

    macro_rules! decode_symbol {
        ($state:ident) => {{
            let symbol = symbols[$state];
            let (next, value) = cursor.read(bits[$state] as u32);
            cursor = next;
            $state = states[$state] as usize + value as usize;
            symbol
        }};
    }

    while status == LoadStatus::Unfinished && op + 4 <= limit {
        output[op] = decode_symbol!(state1);
        output[op + 1] = decode_symbol!(state2);
        output[op + 2] = decode_symbol!(state1);
        output[op + 3] = decode_symbol!(state2);
        op += 4;

        (cursor, status) = reader.load(cursor);
    }

    loop {
        if op + 2 > limit {
            return Err(Error::malformed(
                cursor.current,
                "output buffer is too small",
            ));
        }
        output[op] = decode_symbol!(state1);
        op += 1;

        (cursor, status) = reader.load(cursor);
        if status == LoadStatus::Overflow {
            output[op] = symbols[state2];
            op += 1;
            break;
        }

        if op + 2 > limit {
            return Err(Error::malformed(
                cursor.current,
                "output buffer is too small",
            ));
        }
        output[op] = decode_symbol!(state2);
        op += 1;

        (cursor, status) = reader.load(cursor);
        if status == LoadStatus::Overflow {
            output[op] = symbols[state1];
            op += 1;
            break;
        }
    }

    Ok(op)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SymbolTransform {
    delta_nb_bits: u32,
    delta_find_state: i32,
}

/// Encoding counterpart of [DecodingTable].
#[derive(Clone, Debug)]
pub struct CompressionTable {
    table_log: u32,
    state_table: Vec<u16>,
    symbol_tt: Vec<SymbolTransform>,
}

impl CompressionTable {
    pub fn build(normalized: &[i16], table_log: u32) -> CompressionResult<Self> {
        let table_size = validate_normalized(normalized, table_log)?;
        let table_symbol = spread_symbols(normalized, table_size)?;

        let mut cumul = Vec::with_capacity(normalized.len() + 1);
        cumul.push(0usize);
        for count in normalized {
            let previous = cumul[cumul.len() - 1];
            cumul.push(previous + if *count == -1 { 1 } else { *count as usize });
        }

        let mut state_table = vec![0u16; table_size];
        for (u, s) in table_symbol.iter().enumerate() {
            let slot = &mut cumul[*s as usize];
            state_table[*slot] = (table_size + u) as u16;
            *slot += 1;
        }

        let mut total = 0i32;
        let symbol_tt = normalized
            .iter()
            .map(|count| match *count {
                0 => SymbolTransform {
                    delta_nb_bits: ((table_log + 1) << 16) - (1 << table_log),
                    delta_find_state: 0,
                },
                -1 | 1 => {
                    let tt = SymbolTransform {
                        delta_nb_bits: (table_log << 16) - (1 << table_log),
                        delta_find_state: total - 1,
                    };
                    total += 1;
                    tt
                }
                count => {
                    let count = count as u32;
                    let max_bits_out = table_log - highest_bit(count - 1);
                    let min_state_plus = count << max_bits_out;
                    let tt = SymbolTransform {
                        delta_nb_bits: (max_bits_out << 16) - min_state_plus,
                        delta_find_state: total - count as i32,
                    };
                    total += count as i32;
                    tt
                }
            })
            .collect();

        Ok(Self {
            table_log,
            state_table,
            symbol_tt,
        })
    }

    /// Starting state for the final symbol of a stream.
    ///
    /// Picks the smallest state of `symbol` so decoding it costs the fewest bits.
    fn initial_state(&self, symbol: u8) -> u32 {
        let tt = self.symbol_tt[symbol as usize];
        let nb_bits_out = (tt.delta_nb_bits + (1 << 15)) >> 16;
        let value = (nb_bits_out << 16).wrapping_sub(tt.delta_nb_bits);
        let index = (value >> nb_bits_out) as i32 + tt.delta_find_state;
        self.state_table[index as usize] as u32
    }

    fn encode_symbol(&self, writer: &mut BitWriter, state: &mut u32, symbol: u8) {
        let tt = self.symbol_tt[symbol as usize];
        let nb_bits_out = (*state + tt.delta_nb_bits) >> 16;
        writer.add_bits(*state as u64, nb_bits_out);
        let index = (*state >> nb_bits_out) as i32 + tt.delta_find_state;
        *state = self.state_table[index as usize] as u32;
    }

    fn flush_state(&self, writer: &mut BitWriter, state: u32) {
        writer.add_bits(state as u64, self.table_log);
        writer.flush();
    }
}

/// Encode `input` into `output`, returning the stream length.
///
/// Every symbol of `input` must have a non-zero normalized count and
/// `input` must hold at least 2 symbols. Returns 0 if `output` is too small.
pub fn compress(table: &CompressionTable, input: &[u8], output: &mut [u8]) -> usize {
    let n = input.len();
    if n < 2 {
        return 0;
    }

    let mut writer = BitWriter::new(output);
    let mut states = [0u32; 2];

    // Symbol i is always decoded from state i % 2.
    states[(n - 1) % 2] = table.initial_state(input[n - 1]);
    states[(n - 2) % 2] = table.initial_state(input[n - 2]);

    for i in (0..n - 2).rev() {
        table.encode_symbol(&mut writer, &mut states[i % 2], input[i]);
        writer.flush();
    }

    table.flush_state(&mut writer, states[1]);
    table.flush_state(&mut writer, states[0]);

    writer.close()
}

/// Histogram of `data`, returning counts and the largest symbol present.
pub fn count_symbols(data: &[u8]) -> ([u32; 256], usize) {
    let mut counts = [0u32; 256];
    for b in data {
        counts[*b as usize] += 1;
    }

    let max_symbol = counts.iter().rposition(|c| *c > 0).unwrap_or(0);

    (counts, max_symbol)
}

/// Pick a table log suited to `source_size` bytes over `max_symbol + 1` symbols.
pub fn optimal_table_log(max_table_log: u32, source_size: usize, max_symbol: usize) -> u32 {
    let source_size = source_size.max(2) as u32;
    let max_bits_source = highest_bit(source_size - 1) as i64 - 2;
    let min_bits_source = highest_bit(source_size) + 1;
    let min_bits_symbols = highest_bit(max_symbol.max(1) as u32) + 2;
    let min_bits = min_bits_source.min(min_bits_symbols) as i64;

    let mut table_log = if max_table_log == 0 {
        DEFAULT_TABLE_LOG
    } else {
        max_table_log
    } as i64;

    if max_bits_source < table_log {
        table_log = max_bits_source;
    }
    if min_bits > table_log {
        table_log = min_bits;
    }

    table_log.clamp(MIN_TABLE_LOG as i64, MAX_TABLE_LOG as i64) as u32
}

const RTB_TABLE: [u64; 8] = [0, 473195, 504333, 520860, 550000, 700000, 750000, 830000];

/// Scale raw symbol counts to a distribution summing to `1 << table_log`.
///
/// `counts` must contain at least two non-zero entries.
pub fn normalize_counts(counts: &[u32], table_log: u32) -> CompressionResult<Vec<i16>> {
    let total = counts.iter().map(|c| *c as u64).sum::<u64>();
    let present = counts.iter().filter(|c| **c > 0).count();

    if present < 2 {
        return Err(Error::malformed(0, "at least two symbols are required"));
    }
    if present > 1 << table_log {
        return Err(Error::malformed(0, "too many symbols for table log"));
    }

    let scale = 62 - table_log as u64;
    let step = (1u64 << 62) / total;
    let v_step = 1u64 << (scale - 20);
    let low_threshold = total >> table_log;

    let mut normalized = vec![0i16; counts.len()];
    let mut still_to_distribute = 1i32 << table_log;
    let mut largest = 0usize;
    let mut largest_p = 0i16;

    for (s, count) in counts.iter().enumerate() {
        let count = *count as u64;

        if count == 0 {
            continue;
        }

        if count <= low_threshold {
            normalized[s] = -1;
            still_to_distribute -= 1;
        } else {
            let mut proba = ((count * step) >> scale) as i16;
            if proba < 8 {
                let rest_to_beat = v_step * RTB_TABLE[proba as usize];
                if (count * step) - ((proba as u64) << scale) > rest_to_beat {
                    proba += 1;
                }
            }
            if proba > largest_p {
                largest_p = proba;
                largest = s;
            }
            normalized[s] = proba;
            still_to_distribute -= proba as i32;
        }
    }

    if -still_to_distribute >= (normalized[largest] >> 1) as i32 {
        return Ok(normalize_proportional(counts, total, table_log));
    }

    normalized[largest] += still_to_distribute as i16;

    Ok(normalized)
}

/// Fallback normalization used when rounding leaves the largest symbol
/// unable to absorb the error.
fn normalize_proportional(counts: &[u32], total: u64, table_log: u32) -> Vec<i16> {
    let table_size = 1i64 << table_log;

    let mut normalized = counts
        .iter()
        .map(|c| {
            if *c == 0 {
                0i16
            } else {
                ((*c as u64 * table_size as u64 / total) as i16).max(1)
            }
        })
        .collect::<Vec<_>>();

    let mut remaining = table_size - normalized.iter().map(|c| *c as i64).sum::<i64>();

    while remaining != 0 {
        // Adjust whichever symbol absorbs the change with the least relative error.
        let index = match normalized
            .iter()
            .enumerate()
            .filter(|(_, c)| if remaining > 0 { **c > 0 } else { **c > 1 })
            .max_by_key(|(_, c)| **c)
        {
            Some((index, _)) => index,
            None => break,
        };

        if remaining > 0 {
            normalized[index] += 1;
            remaining -= 1;
        } else {
            normalized[index] -= 1;
            remaining += 1;
        }
    }

    normalized
}

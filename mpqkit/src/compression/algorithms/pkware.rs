//! PKWare Data Compression Library (implode/explode)
//!
//! Stream layout: `[literal mode][dictionary bits]` followed by an LSB-first
//! bit stream. Huffman codes are canonical and stored MSB-first with every
//! bit inverted.

use super::bits::{BitReader, BitWriter};
use crate::{Error, Result};
use once_cell::sync::Lazy;

/// Longest code in any of the three tables
const MAX_BITS: usize = 13;

/// Length value that terminates the stream
const END_OF_STREAM: u32 = 519;

/// Longest copy the encoder emits
const MAX_MATCH: usize = 518;

/// Shortest copy the encoder emits
const MIN_MATCH: usize = 3;

/// Dictionary size used by the encoder (6 bits: 4 KiB window)
const ENCODER_DICT_BITS: u8 = 6;

/// Hash chain steps tried per position
const MAX_CHAIN: usize = 64;

const LITERAL_LENGTHS: [u8; 98] = [
    11, 124, 8, 7, 28, 7, 188, 13, 76, 4, 10, 8, 12, 10, 12, 10, 8, 23, 8, 9, 7, 6, 7, 8, 7, 6,
    55, 8, 23, 24, 12, 11, 7, 9, 11, 12, 6, 7, 22, 5, 7, 24, 6, 11, 9, 6, 7, 22, 7, 11, 38, 7, 9,
    8, 25, 11, 8, 11, 9, 12, 8, 12, 5, 38, 5, 38, 5, 11, 7, 5, 6, 21, 6, 10, 53, 8, 7, 24, 10, 27,
    44, 253, 253, 253, 252, 252, 252, 13, 12, 45, 12, 45, 12, 61, 12, 45, 44, 173,
];
const LENGTH_LENGTHS: [u8; 6] = [2, 35, 36, 53, 38, 23];
const DISTANCE_LENGTHS: [u8; 7] = [2, 20, 53, 230, 247, 151, 248];

const LENGTH_BASE: [u16; 16] = [3, 2, 4, 5, 6, 7, 8, 9, 10, 12, 16, 24, 40, 72, 136, 264];
const LENGTH_EXTRA: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];

/// Canonical Huffman code usable in both directions
#[derive(Debug)]
struct CodeTable {
    /// Number of codes of each length
    count: [u16; MAX_BITS + 1],
    /// Symbols ordered by code
    symbols: Vec<u16>,
    /// Per-symbol (code, length)
    codes: Vec<(u16, u8)>,
}

impl CodeTable {
    /// Build from the compact representation: each byte holds a code length
    /// in its low nibble and a repeat count minus one in its high nibble.
    fn from_compact(compact: &[u8]) -> Self {
        let lengths: Vec<u8> = compact
            .iter()
            .flat_map(|&b| std::iter::repeat(b & 0x0F).take((b >> 4) as usize + 1))
            .collect();

        let mut count = [0u16; MAX_BITS + 1];
        for &len in &lengths {
            count[len as usize] += 1;
        }

        let mut offsets = [0usize; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + count[len] as usize;
        }
        let mut symbols = vec![0u16; offsets[MAX_BITS + 1]];
        let mut next_code = [0u16; MAX_BITS + 1];
        let mut code = 0u16;
        for len in 1..=MAX_BITS {
            next_code[len] = code;
            code = (code + count[len]) << 1;
        }

        let mut codes = vec![(0u16, 0u8); lengths.len()];
        for (symbol, &len) in lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let len = len as usize;
            symbols[offsets[len]] = symbol as u16;
            offsets[len] += 1;
            codes[symbol] = (next_code[len], len as u8);
            next_code[len] += 1;
        }

        Self {
            count,
            symbols,
            codes,
        }
    }

    fn decode(&self, reader: &mut BitReader<'_>) -> Result<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;

        for len in 1..=MAX_BITS {
            code |= (reader.bit()? ^ 1) as i32;
            let count = self.count[len] as i32;
            if code - first < count {
                return Ok(self.symbols[(index + code - first) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }

        Err(Error::compression("invalid PKWare Huffman code"))
    }

    fn encode(&self, writer: &mut BitWriter, symbol: usize) {
        let (code, len) = self.codes[symbol];
        for shift in (0..len).rev() {
            writer.bit((((code >> shift) & 1) ^ 1) as u32);
        }
    }
}

static LITERAL_CODES: Lazy<CodeTable> = Lazy::new(|| CodeTable::from_compact(&LITERAL_LENGTHS));
static LENGTH_CODES: Lazy<CodeTable> = Lazy::new(|| CodeTable::from_compact(&LENGTH_LENGTHS));
static DISTANCE_CODES: Lazy<CodeTable> =
    Lazy::new(|| CodeTable::from_compact(&DISTANCE_LENGTHS));

/// Decompress a PKWare DCL stream, stopping one byte past `limit`
pub(crate) fn explode(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    if data.len() < 2 {
        return Err(Error::compression("PKWare stream too short"));
    }

    let coded_literals = match data[0] {
        0 => false,
        1 => true,
        other => {
            return Err(Error::compression(format!(
                "invalid PKWare literal mode {}",
                other
            )))
        }
    };
    let dict_bits = data[1] as u32;
    if !(4..=6).contains(&dict_bits) {
        return Err(Error::compression(format!(
            "invalid PKWare dictionary size {}",
            dict_bits
        )));
    }

    let mut reader = BitReader::new(&data[2..]);
    let mut out = super::output_buffer(limit);

    while out.len() <= limit {
        if reader.bit()? == 1 {
            let symbol = LENGTH_CODES.decode(&mut reader)? as usize;
            let length = LENGTH_BASE[symbol] as u32 + reader.bits(LENGTH_EXTRA[symbol] as u32)?;
            if length == END_OF_STREAM {
                break;
            }

            let shift = if length == 2 { 2 } else { dict_bits };
            let distance = ((DISTANCE_CODES.decode(&mut reader)? as u32) << shift)
                + reader.bits(shift)?
                + 1;
            let distance = distance as usize;
            if distance > out.len() {
                return Err(Error::compression(format!(
                    "PKWare distance {} reaches before start of output ({} bytes)",
                    distance,
                    out.len()
                )));
            }

            let start = out.len() - distance;
            for i in 0..length as usize {
                let byte = out[start + i];
                out.push(byte);
            }
        } else {
            let literal = if coded_literals {
                LITERAL_CODES.decode(&mut reader)? as u8
            } else {
                reader.bits(8)? as u8
            };
            out.push(literal);
        }
    }

    out.truncate(limit.saturating_add(1));
    Ok(out)
}

/// Hash chains over 3-byte prefixes
struct MatchFinder {
    head: Vec<usize>,
    prev: Vec<usize>,
}

impl MatchFinder {
    const HASH_BITS: u32 = 12;
    const NONE: usize = usize::MAX;

    fn new(len: usize) -> Self {
        Self {
            head: vec![Self::NONE; 1 << Self::HASH_BITS],
            prev: vec![Self::NONE; len],
        }
    }

    fn hash(data: &[u8], pos: usize) -> usize {
        let v = (data[pos] as u32) << 16 | (data[pos + 1] as u32) << 8 | data[pos + 2] as u32;
        (v.wrapping_mul(2654435761) >> (32 - Self::HASH_BITS)) as usize
    }

    fn insert(&mut self, data: &[u8], pos: usize) {
        if pos + MIN_MATCH <= data.len() {
            let h = Self::hash(data, pos);
            self.prev[pos] = self.head[h];
            self.head[h] = pos;
        }
    }

    /// Longest earlier match within `window`, as (length, distance)
    fn longest(&self, data: &[u8], pos: usize, window: usize) -> (usize, usize) {
        if pos + MIN_MATCH > data.len() {
            return (0, 0);
        }

        let max_len = (data.len() - pos).min(MAX_MATCH);
        let mut best = (0, 0);
        let mut candidate = self.head[Self::hash(data, pos)];
        let mut steps = 0;

        while candidate != Self::NONE && pos - candidate <= window && steps < MAX_CHAIN {
            let len = data[candidate..]
                .iter()
                .zip(&data[pos..pos + max_len])
                .take_while(|(a, b)| a == b)
                .count();
            if len > best.0 {
                best = (len, pos - candidate);
                if len == max_len {
                    break;
                }
            }
            candidate = self.prev[candidate];
            steps += 1;
        }

        best
    }
}

fn write_length(writer: &mut BitWriter, length: u32) {
    let symbol = (0..LENGTH_BASE.len())
        .find(|&s| {
            let base = LENGTH_BASE[s] as u32;
            length >= base && length < base + (1 << LENGTH_EXTRA[s])
        })
        .unwrap_or(LENGTH_BASE.len() - 1);
    LENGTH_CODES.encode(writer, symbol);
    writer.bits(
        length - LENGTH_BASE[symbol] as u32,
        LENGTH_EXTRA[symbol] as u32,
    );
}

/// Compress with binary literals and a 4 KiB dictionary
pub(crate) fn implode(data: &[u8]) -> Result<Vec<u8>> {
    let dict_bits = ENCODER_DICT_BITS as u32;
    let window = 64usize << dict_bits;
    let mut writer = BitWriter::with_prefix(&[0, ENCODER_DICT_BITS], data.len() / 2 + 8);
    let mut finder = MatchFinder::new(data.len());

    let mut pos = 0;
    while pos < data.len() {
        let (len, dist) = finder.longest(data, pos, window);

        if len >= MIN_MATCH {
            writer.bit(1);
            write_length(&mut writer, len as u32);
            let dist = (dist - 1) as u32;
            DISTANCE_CODES.encode(&mut writer, (dist >> dict_bits) as usize);
            writer.bits(dist & ((1 << dict_bits) - 1), dict_bits);

            for p in pos..pos + len {
                finder.insert(data, p);
            }
            pos += len;
        } else {
            writer.bit(0);
            writer.bits(data[pos] as u32, 8);
            finder.insert(data, pos);
            pos += 1;
        }
    }

    writer.bit(1);
    write_length(&mut writer, END_OF_STREAM);

    Ok(writer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_complete() {
        assert_eq!(LITERAL_CODES.codes.len(), 256);
        assert_eq!(LENGTH_CODES.codes.len(), 16);
        assert_eq!(DISTANCE_CODES.codes.len(), 64);
    }

    #[test]
    fn test_explode_reference_stream() {
        let data = [0x00, 0x04, 0x82, 0x24, 0x25, 0x8f, 0x80, 0x7f];
        assert_eq!(explode(&data, 13).unwrap(), b"AIAIAIAIAIAIA");
    }

    #[test]
    fn test_implode_known_output() {
        let packed = implode(b"AIAIAIAIAIAIA").unwrap();
        assert_eq!(packed, vec![0x00, 0x06, 0x82, 0x24, 0x25, 0x0f, 0x02, 0xfe, 0x01]);
    }

    #[test]
    fn test_round_trip() {
        let inputs: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"a".to_vec(),
            b"abc".repeat(1000),
            (0..5000u32).map(|i| (i * 7 % 251) as u8).collect(),
            (0..20000u32).map(|i| b"ab "[(i * i % 3) as usize]).collect(),
        ];

        for input in inputs {
            let packed = implode(&input).unwrap();
            assert_eq!(explode(&packed, input.len()).unwrap(), input);
        }
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let input = vec![0x42u8; 4096];
        let packed = implode(&input).unwrap();
        assert!(packed.len() < 64);
    }

    #[test]
    fn test_explode_stops_past_limit() {
        let packed = implode(&vec![0x42u8; 100_000]).unwrap();
        assert_eq!(explode(&packed, 4096).unwrap().len(), 4097);
    }

    #[test]
    fn test_explode_rejects_bad_header() {
        assert!(explode(&[0x02, 0x06, 0x00], 0).is_err());
        assert!(explode(&[0x00, 0x07, 0x00], 0).is_err());
        assert!(explode(&[0x00], 0).is_err());
    }

    #[test]
    fn test_explode_truncated_stream() {
        let packed = implode(b"hello hello hello").unwrap();
        assert!(explode(&packed[..packed.len() - 2], 17).is_err());
    }
}

//! LZ77+Huffman block codec.
//!
//! A block is self-describing: a 16-bit little-endian symbol count (always
//! 512), 512 code lengths packed two per byte, then the Huffman-coded item
//! stream. Symbols 0–255 are literals, 256 ends the block, 257–511 encode
//! match lengths 3–257; match distances follow their length symbol as raw
//! 16-bit little-endian values, allowing the full 64 KiB window.

use crate::{
    bitio::{BitReader, BitWriter},
    error::Error,
    huffman::{HuffmanDecoder, HuffmanEncoder, MAX_CODE_LENGTH, build_code_lengths},
    lz::{MIN_MATCH, MatchFinder, SlidingWindow},
};

const SYMBOL_COUNT: usize = 512;
const END_OF_BLOCK: usize = 256;
const MATCH_SYMBOL_BASE: usize = 257;
/// Distances are 16-bit, so the decoder window spans 64 KiB.
const DECODE_WINDOW_SIZE: usize = 64 * 1024;

enum Item {
    Literal(u8),
    Match { distance: u16, length: usize },
}

/// Encodes `input` as one self-contained block.
pub fn encode_block(input: &[u8]) -> Vec<u8> {
    let mut finder = MatchFinder::new();
    let mut items = Vec::new();
    let mut freqs = vec![0u64; SYMBOL_COUNT];

    let mut pos = 0;
    while pos < input.len() {
        match finder.find_match(input, pos) {
            Some(m) => {
                freqs[MATCH_SYMBOL_BASE + m.length - MIN_MATCH] += 1;
                items.push(Item::Match {
                    distance: m.distance as u16,
                    length: m.length,
                });
                for p in pos..pos + m.length {
                    finder.insert(input, p);
                }
                pos += m.length;
            }
            None => {
                freqs[input[pos] as usize] += 1;
                items.push(Item::Literal(input[pos]));
                finder.insert(input, pos);
                pos += 1;
            }
        }
    }
    freqs[END_OF_BLOCK] += 1;

    let lengths = build_code_lengths(&freqs, MAX_CODE_LENGTH);

    let mut out = Vec::with_capacity(2 + SYMBOL_COUNT / 2 + input.len() / 2);
    out.extend_from_slice(&(SYMBOL_COUNT as u16).to_le_bytes());
    // Two 4-bit lengths per byte, even symbol in the low nibble.
    for pair in lengths.chunks(2) {
        out.push(pair[0] | (pair[1] << 4));
    }

    let encoder = HuffmanEncoder::from_lengths(&lengths);
    let mut writer = BitWriter::new();
    for item in items {
        match item {
            Item::Literal(byte) => encoder.write_symbol(&mut writer, byte as usize),
            Item::Match { distance, length } => {
                encoder.write_symbol(&mut writer, MATCH_SYMBOL_BASE + length - MIN_MATCH);
                let [lo, hi] = distance.to_le_bytes();
                writer.write_bits(lo as u32, 8);
                writer.write_bits(hi as u32, 8);
            }
        }
    }
    encoder.write_symbol(&mut writer, END_OF_BLOCK);
    out.extend_from_slice(&writer.finish());
    out
}

/// Decodes one block.
///
/// Decoding stops at the end-of-block symbol or once `max_output` bytes
/// have been produced. Running out of input mid-stream yields the partial
/// output rather than an error; the caller is expected to validate the
/// result against a declared unpacked size.
pub fn decode_block(data: &[u8], max_output: Option<usize>) -> Result<Vec<u8>, Error> {
    let header_len = 2 + SYMBOL_COUNT / 2;
    if data.len() < header_len {
        return Err(Error::UnexpectedEof);
    }
    let symbol_count = u16::from_le_bytes([data[0], data[1]]) as usize;
    if symbol_count != SYMBOL_COUNT {
        return Err(Error::corrupt("bad symbol count in block header"));
    }
    let mut lengths = Vec::with_capacity(SYMBOL_COUNT);
    for &byte in &data[2..header_len] {
        lengths.push(byte & 0x0F);
        lengths.push(byte >> 4);
    }

    let decoder = HuffmanDecoder::from_lengths(&lengths)?;
    let mut reader = BitReader::new(&data[header_len..]);
    let mut window = SlidingWindow::new(DECODE_WINDOW_SIZE);
    let mut out = Vec::new();

    loop {
        if let Some(max) = max_output {
            if out.len() >= max {
                break;
            }
        }
        let symbol = match decoder.decode_symbol(&mut reader) {
            Ok(symbol) => symbol as usize,
            Err(Error::UnexpectedEof) => break,
            Err(e) => return Err(e),
        };
        match symbol {
            END_OF_BLOCK => break,
            literal if literal < END_OF_BLOCK => {
                window.append(literal as u8);
                out.push(literal as u8);
            }
            length_symbol => {
                let length = length_symbol - MATCH_SYMBOL_BASE + MIN_MATCH;
                let (lo, hi) = match (reader.read_bits(8), reader.read_bits(8)) {
                    (Ok(lo), Ok(hi)) => (lo, hi),
                    (Err(Error::UnexpectedEof), _) | (_, Err(Error::UnexpectedEof)) => break,
                    (Err(e), _) | (_, Err(e)) => return Err(e),
                };
                let distance = u16::from_le_bytes([lo as u8, hi as u8]) as usize;
                window.copy_match(distance, length, &mut out)?;
            }
        }
    }

    if let Some(max) = max_output {
        out.truncate(max);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) {
        let block = encode_block(input);
        let decoded = decode_block(&block, None).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(crc32fast::hash(&decoded), crc32fast::hash(input));
    }

    #[test]
    fn empty_input_is_a_valid_block() {
        let block = encode_block(&[]);
        // header (count + packed lengths) plus at least the EOB bits
        assert!(block.len() > 2 + SYMBOL_COUNT / 2);
        assert_eq!(&block[..2], &0x0200u16.to_le_bytes());
        assert_eq!(decode_block(&block, None).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn repeated_pattern_roundtrip() {
        let block = encode_block(b"ABABABABAB");
        assert_eq!(&block[..2], &[0x00, 0x02]);
        assert_eq!(decode_block(&block, None).unwrap(), b"ABABABABAB");
    }

    #[test]
    fn assorted_payloads_roundtrip() {
        roundtrip(b"hello world");
        roundtrip(&[0u8; 1000]);
        roundtrip(b"abcdefghijklmnopqrstuvwxyz");
        let mixed: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        roundtrip(&mixed);
        let runs: Vec<u8> = std::iter::repeat_n(b"0123456789", 200)
            .flatten()
            .copied()
            .collect();
        roundtrip(&runs);
    }

    #[test]
    fn max_output_truncates() {
        let block = encode_block(b"ABABABABAB");
        assert_eq!(decode_block(&block, Some(4)).unwrap(), b"ABAB");
    }

    #[test]
    fn truncated_stream_yields_partial_output() {
        let block = encode_block(b"the quick brown fox jumps over the lazy dog");
        let cut = block.len() - 4;
        let partial = decode_block(&block[..cut], None).unwrap();
        assert!(partial.len() < 43);
        assert_eq!(&partial[..], &b"the quick brown fox jumps over the lazy dog"[..partial.len()]);
    }

    #[test]
    fn truncated_header_is_eof() {
        assert!(matches!(
            decode_block(&[0x00, 0x02, 0xAB], None),
            Err(Error::UnexpectedEof)
        ));
    }
}

//! XZ container support: whole-buffer encode and decode of single-block
//! streams with a CRC-32 integrity check and a Delta/BCJ filter chain in
//! front of LZMA2.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use lzma_rust2::{LZMA2Reader, LZMA2Writer, LZMA2Options};

use crate::{
    encoder::lzma2_dict_size_property,
    error::Error,
    filter::{ContainerFormat, Filter, FilterSpec},
};

const STREAM_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];
const CHECK_CRC32: u8 = 0x01;
const FILTER_ID_LZMA2: u64 = 0x21;
/// XZ allows four filters per block; the last one must be the compressor.
const MAX_CHAIN_FILTERS: usize = 3;

fn write_multibyte(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push(value as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_multibyte(data: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let mut value = 0u64;
    for shift in 0..9 {
        let byte = *data.get(*pos).ok_or(Error::UnexpectedEof)?;
        *pos += 1;
        value |= ((byte & 0x7F) as u64) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::corrupt("multibyte integer too long"))
}

/// Compresses `data` into a single-block XZ stream, running `filters`
/// (in application order) before LZMA2.
pub fn encode_xz(data: &[u8], filters: &[FilterSpec]) -> Result<Vec<u8>, Error> {
    if filters.len() > MAX_CHAIN_FILTERS {
        return Err(Error::argument("xz blocks carry at most three filters"));
    }

    // Preprocess with the whole buffer in hand; positions start at zero.
    let mut filtered = data.to_vec();
    for spec in filters {
        let mut filter = Filter::new(*spec, ContainerFormat::Xz)?;
        filtered = filter.encode(&filtered, 0);
    }

    let lzma_options = LZMA2Options::with_preset(6);
    let dict_prop = lzma2_dict_size_property(lzma_options.dict_size);
    let mut compressed = Vec::with_capacity(filtered.len() / 2 + 64);
    {
        let mut writer = LZMA2Writer::new(&mut compressed, &lzma_options);
        writer.write_all(&filtered).map_err(Error::io)?;
        writer.finish().map_err(Error::io)?;
    }

    let mut out = Vec::with_capacity(compressed.len() + 128);

    // Stream header: magic, flags, CRC-32 of the flags.
    out.extend_from_slice(&STREAM_MAGIC);
    let stream_flags = [0x00, CHECK_CRC32];
    out.extend_from_slice(&stream_flags);
    out.extend_from_slice(&crc32fast::hash(&stream_flags).to_le_bytes());

    // Block header: filter list, zero-padded to a multiple of four, CRC'd.
    let mut fields = Vec::with_capacity(32);
    fields.push(filters.len() as u8); // (n + 1) filters, no size fields
    for spec in filters {
        let props = spec.properties();
        write_multibyte(&mut fields, spec.xz_id()?);
        write_multibyte(&mut fields, props.len() as u64);
        fields.extend_from_slice(&props);
    }
    write_multibyte(&mut fields, FILTER_ID_LZMA2);
    write_multibyte(&mut fields, 1);
    fields.push(dict_prop);

    let real_size = 1 + fields.len() + 4;
    let padded_size = real_size.div_ceil(4) * 4;
    let mut block_header = Vec::with_capacity(padded_size);
    block_header.push((padded_size / 4 - 1) as u8);
    block_header.extend_from_slice(&fields);
    block_header.resize(padded_size - 4, 0);
    let header_crc = crc32fast::hash(&block_header);
    block_header.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(&block_header);

    out.extend_from_slice(&compressed);
    let block_padding = (4 - (block_header.len() + compressed.len()) % 4) % 4;
    out.extend_from_slice(&[0u8; 3][..block_padding]);
    out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());

    // Index: one record, then its own padding and CRC.
    let unpadded_size = (block_header.len() + compressed.len() + 4) as u64;
    let mut index = Vec::with_capacity(16);
    index.push(0x00);
    write_multibyte(&mut index, 1);
    write_multibyte(&mut index, unpadded_size);
    write_multibyte(&mut index, data.len() as u64);
    while index.len() % 4 != 0 {
        index.push(0);
    }
    let index_crc = crc32fast::hash(&index);
    index.extend_from_slice(&index_crc.to_le_bytes());
    out.extend_from_slice(&index);

    // Stream footer: CRC over backward size + flags, then the magic.
    let backward_size = (index.len() as u32 / 4) - 1;
    let mut footer_fields = [0u8; 6];
    LittleEndian::write_u32(&mut footer_fields[..4], backward_size);
    footer_fields[4..].copy_from_slice(&stream_flags);
    out.extend_from_slice(&crc32fast::hash(&footer_fields).to_le_bytes());
    out.extend_from_slice(&footer_fields);
    out.extend_from_slice(&FOOTER_MAGIC);

    Ok(out)
}

/// Decompresses a single-block XZ stream produced by [`encode_xz`] (or any
/// writer restricted to the same feature set: one block, CRC-32 check).
pub fn decode_xz(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() < 12 + 12 + 8 {
        return Err(Error::UnexpectedEof);
    }
    if data[..6] != STREAM_MAGIC {
        return Err(Error::corrupt("bad xz stream magic"));
    }
    let stream_flags = [data[6], data[7]];
    let flags_crc = LittleEndian::read_u32(&data[8..12]);
    let actual = crc32fast::hash(&stream_flags);
    if actual != flags_crc {
        return Err(Error::checksum(flags_crc, actual, "xz stream header"));
    }
    if stream_flags[0] != 0 {
        return Err(Error::corrupt("reserved xz stream flags set"));
    }
    if stream_flags[1] != CHECK_CRC32 {
        return Err(Error::unsupported("only the CRC-32 check is supported"));
    }

    // Footer first: it locates the index, which locates the block.
    let footer = &data[data.len() - 12..];
    if footer[10..] != FOOTER_MAGIC {
        return Err(Error::corrupt("bad xz footer magic"));
    }
    let footer_crc = LittleEndian::read_u32(&footer[..4]);
    let actual = crc32fast::hash(&footer[4..10]);
    if actual != footer_crc {
        return Err(Error::checksum(footer_crc, actual, "xz stream footer"));
    }
    if footer[8..10] != stream_flags {
        return Err(Error::corrupt("xz footer flags disagree with the header"));
    }
    let index_size = (LittleEndian::read_u32(&footer[4..8]) as usize + 1) * 4;
    let index_start = data
        .len()
        .checked_sub(12 + index_size)
        .ok_or(Error::UnexpectedEof)?;
    let index = &data[index_start..data.len() - 12];
    let index_crc = LittleEndian::read_u32(&index[index_size - 4..]);
    let actual = crc32fast::hash(&index[..index_size - 4]);
    if actual != index_crc {
        return Err(Error::checksum(index_crc, actual, "xz index"));
    }
    if index[0] != 0x00 {
        return Err(Error::corrupt("bad xz index indicator"));
    }
    let mut pos = 1usize;
    let record_count = read_multibyte(index, &mut pos)?;
    if record_count != 1 {
        return Err(Error::unsupported("multi-block xz streams"));
    }
    let unpadded_size = read_multibyte(index, &mut pos)? as usize;
    let uncompressed_size = read_multibyte(index, &mut pos)? as usize;

    // Block header.
    let block_start = 12usize;
    let header_size = (*data.get(block_start).ok_or(Error::UnexpectedEof)? as usize + 1) * 4;
    if header_size < 8 || block_start + header_size > index_start {
        return Err(Error::corrupt("bad xz block header size"));
    }
    let block_header = &data[block_start..block_start + header_size];
    let header_crc = LittleEndian::read_u32(&block_header[header_size - 4..]);
    let actual = crc32fast::hash(&block_header[..header_size - 4]);
    if actual != header_crc {
        return Err(Error::checksum(header_crc, actual, "xz block header"));
    }
    let block_flags = block_header[1];
    if block_flags & 0xC0 != 0 {
        return Err(Error::unsupported("xz block size fields"));
    }
    if block_flags & 0x3C != 0 {
        return Err(Error::corrupt("reserved xz block flags set"));
    }
    let num_filters = (block_flags & 0x03) as usize + 1;

    let mut pos = 2usize;
    let mut filters = Vec::with_capacity(num_filters.saturating_sub(1));
    let mut dict_size = None;
    for filter_index in 0..num_filters {
        let id = read_multibyte(block_header, &mut pos)?;
        let props_len = read_multibyte(block_header, &mut pos)? as usize;
        let props = block_header
            .get(pos..pos + props_len)
            .ok_or(Error::UnexpectedEof)?;
        pos += props_len;
        if filter_index == num_filters - 1 {
            if id != FILTER_ID_LZMA2 {
                return Err(Error::UnsupportedCoder(vec![id as u8]));
            }
            let prop = *props
                .first()
                .ok_or_else(|| Error::corrupt("missing LZMA2 dictionary property"))?;
            dict_size = Some(decode_dict_size(prop)?);
        } else {
            filters.push(FilterSpec::from_xz_id(id, props)?);
        }
    }
    let dict_size = dict_size.ok_or_else(|| Error::corrupt("xz block without compressor"))?;

    // Compressed payload, located by the index record.
    let compressed_size = unpadded_size
        .checked_sub(header_size + 4)
        .ok_or_else(|| Error::corrupt("xz unpadded size smaller than its header"))?;
    let comp_start = block_start + header_size;
    let comp_end = comp_start + compressed_size;
    let padding = (4 - (header_size + compressed_size) % 4) % 4;
    let check_start = comp_end + padding;
    if check_start + 4 > index_start {
        return Err(Error::UnexpectedEof);
    }
    if data[comp_end..check_start].iter().any(|&b| b != 0) {
        return Err(Error::corrupt("nonzero xz block padding"));
    }

    let mut output = Vec::with_capacity(uncompressed_size);
    let mut reader = LZMA2Reader::new(&data[comp_start..comp_end], dict_size, None);
    reader.read_to_end(&mut output).map_err(Error::from)?;

    // Undo the filter chain back to front.
    for spec in filters.iter().rev() {
        let mut filter = Filter::new(*spec, ContainerFormat::Xz)?;
        output = filter.decode(&output, 0);
    }

    if output.len() != uncompressed_size {
        return Err(Error::corrupt("xz uncompressed size mismatch"));
    }
    let check = LittleEndian::read_u32(&data[check_start..check_start + 4]);
    let actual = crc32fast::hash(&output);
    if actual != check {
        return Err(Error::checksum(check, actual, "xz block check"));
    }

    Ok(output)
}

fn decode_dict_size(prop: u8) -> Result<u32, Error> {
    let bits = prop as u32;
    if bits & !0x3F != 0 {
        return Err(Error::corrupt("unsupported LZMA2 property bits"));
    }
    if bits > 40 {
        return Err(Error::corrupt("dictionary larger than 4GiB maximum size"));
    }
    if bits == 40 {
        return Ok(0xFFFF_FFFF);
    }
    Ok((2 | (bits & 1)) << (bits / 2 + 11))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterArch;

    #[test]
    fn plain_roundtrip() {
        let data = b"xz containers carry filtered lzma2 payloads".repeat(20);
        let encoded = encode_xz(&data, &[]).unwrap();
        assert_eq!(&encoded[..6], &STREAM_MAGIC);
        assert_eq!(&encoded[encoded.len() - 2..], &FOOTER_MAGIC);
        assert_eq!(decode_xz(&encoded).unwrap(), data);
    }

    #[test]
    fn empty_roundtrip() {
        let encoded = encode_xz(&[], &[]).unwrap();
        assert_eq!(decode_xz(&encoded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn delta_filter_roundtrip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i / 7) as u8).collect();
        let filters = [FilterSpec::Delta { distance: 1 }];
        let encoded = encode_xz(&data, &filters).unwrap();
        assert_eq!(decode_xz(&encoded).unwrap(), data);
    }

    #[test]
    fn bcj_chain_roundtrip() {
        let mut data = Vec::new();
        for i in 0..500u32 {
            data.push(0xE8);
            data.extend_from_slice(&i.to_le_bytes());
        }
        let filters = [
            FilterSpec::Delta { distance: 4 },
            FilterSpec::Bcj(FilterArch::X86),
        ];
        let encoded = encode_xz(&data, &filters).unwrap();
        assert_eq!(decode_xz(&encoded).unwrap(), data);
    }

    #[test]
    fn arm64_is_rejected() {
        let err = encode_xz(b"data", &[FilterSpec::Bcj(FilterArch::Arm64)]).unwrap_err();
        assert!(matches!(err, Error::FilterUnsupportedInFormat { .. }));
    }

    #[test]
    fn corrupted_check_is_detected() {
        let data = b"detect me".repeat(100);
        let mut encoded = encode_xz(&data, &[]).unwrap();
        // flip a byte in the compressed payload
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0x01;
        assert!(decode_xz(&encoded).is_err());
    }
}

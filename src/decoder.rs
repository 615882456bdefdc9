use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use lzma_rust2::{LZMA2Reader, LZMAReader};

use crate::{
    archive::CoderId,
    error::Error,
    filter::{BcjReader, DeltaReader, FilterArch},
    folder::Coder,
};

/// The closed set of coders a folder chain may decode through.
#[allow(clippy::large_enum_variant)]
pub(crate) enum Decoder<R: Read> {
    Copy(R),
    Lzma(Box<LZMAReader<R>>),
    Lzma2(Box<LZMA2Reader<R>>),
    Delta(DeltaReader<R>),
    Bcj(Box<BcjReader<R>>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Decoder::Copy(r) => r.read(buf),
            Decoder::Lzma(r) => r.read(buf),
            Decoder::Lzma2(r) => r.read(buf),
            Decoder::Delta(r) => r.read(buf),
            Decoder::Bcj(r) => r.read(buf),
        }
    }
}

pub(crate) fn add_decoder<I: Read>(
    input: I,
    uncompressed_len: usize,
    coder: &Coder,
) -> Result<Decoder<I>, Error> {
    let method =
        CoderId::by_id(coder.method_id()).ok_or_else(|| Error::UnsupportedCoder(coder.method_id().to_vec()))?;
    match method.id() {
        CoderId::ID_COPY => Ok(Decoder::Copy(input)),
        CoderId::ID_LZMA => {
            if coder.properties.is_empty() {
                return Err(Error::corrupt("LZMA properties too short"));
            }
            let props = coder.properties[0];
            let dict_size = lzma_dict_size(coder)?;
            let lzma =
                LZMAReader::new_with_props(input, uncompressed_len as _, props, dict_size, None)
                    .map_err(Error::io)?;
            Ok(Decoder::Lzma(Box::new(lzma)))
        }
        CoderId::ID_LZMA2 => {
            let dict_size = lzma2_dict_size(coder)?;
            Ok(Decoder::Lzma2(Box::new(LZMA2Reader::new(
                input, dict_size, None,
            ))))
        }
        CoderId::ID_DELTA => {
            let distance = if coder.properties.is_empty() {
                1
            } else {
                coder.properties[0] as usize + 1
            };
            Ok(Decoder::Delta(DeltaReader::new(input, distance)))
        }
        CoderId::ID_BCJ_X86 => Ok(bcj(input, FilterArch::X86)),
        CoderId::ID_BCJ_ARM => Ok(bcj(input, FilterArch::Arm)),
        CoderId::ID_BCJ_ARM_THUMB => Ok(bcj(input, FilterArch::ArmThumb)),
        CoderId::ID_BCJ_ARM64 => Ok(bcj(input, FilterArch::Arm64)),
        CoderId::ID_BCJ_PPC => Ok(bcj(input, FilterArch::Ppc)),
        CoderId::ID_BCJ_IA64 => Ok(bcj(input, FilterArch::Ia64)),
        CoderId::ID_BCJ_SPARC => Ok(bcj(input, FilterArch::Sparc)),
        _ => Err(Error::UnsupportedCoder(coder.method_id().to_vec())),
    }
}

fn bcj<I: Read>(input: I, arch: FilterArch) -> Decoder<I> {
    Decoder::Bcj(Box::new(BcjReader::new(input, arch, 0)))
}

fn lzma2_dict_size(coder: &Coder) -> Result<u32, Error> {
    if coder.properties.is_empty() {
        return Err(Error::corrupt("LZMA2 properties too short"));
    }
    let dict_size_bits = 0xFF & coder.properties[0] as u32;
    if (dict_size_bits & !0x3F) != 0 {
        return Err(Error::corrupt("unsupported LZMA2 property bits"));
    }
    if dict_size_bits > 40 {
        return Err(Error::corrupt("dictionary larger than 4GiB maximum size"));
    }
    if dict_size_bits == 40 {
        return Ok(0xFFFF_FFFF);
    }
    Ok((2 | (dict_size_bits & 0x1)) << (dict_size_bits / 2 + 11))
}

fn lzma_dict_size(coder: &Coder) -> Result<u32, Error> {
    if coder.properties.len() < 5 {
        return Err(Error::corrupt("LZMA properties too short"));
    }
    let mut props = &coder.properties[1..5];
    props.read_u32::<LittleEndian>().map_err(|e: io::Error| Error::io(e))
}

use std::io::Write;

use lzma_rust2::{LZMA2Writer, LZMAWriter};

use crate::{
    archive::CoderId,
    coder_options::{CoderConfiguration, CoderOptions, DeltaOptions, Lzma2Options, LzmaOptions},
    error::Error,
    filter::{BcjWriter, DeltaWriter, FilterArch},
    writer::CountingWriter,
};

/// The closed set of coders a folder chain may encode through.
pub(crate) enum Encoder<W: Write> {
    Copy(CountingWriter<W>),
    Delta(DeltaWriter<CountingWriter<W>>),
    Bcj(Option<BcjWriter<CountingWriter<W>>>),
    Lzma(Option<LZMAWriter<CountingWriter<W>>>),
    Lzma2(Option<LZMA2Writer<CountingWriter<W>>>),
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // Encoders that buffer internally need an explicit finish. Dynamic
        // dispatch over `Write` leaves no better channel, so an empty write
        // means "finish and propagate the finish downstream".
        match self {
            Encoder::Copy(w) => w.write(buf),
            Encoder::Delta(w) => w.write(buf),
            Encoder::Bcj(w) => match buf.is_empty() {
                true => {
                    let writer = w.take().unwrap();
                    let mut inner = writer.finish()?;
                    inner.write(buf)?;
                    Ok(0)
                }
                false => w.as_mut().unwrap().write(buf),
            },
            Encoder::Lzma(w) => match buf.is_empty() {
                true => {
                    let writer = w.take().unwrap();
                    let mut inner = writer.finish()?;
                    let _ = inner.write(buf);
                    Ok(0)
                }
                false => w.as_mut().unwrap().write(buf),
            },
            Encoder::Lzma2(w) => match buf.is_empty() {
                true => {
                    let writer = w.take().unwrap();
                    let mut inner = writer.finish()?;
                    let _ = inner.write(buf);
                    Ok(0)
                }
                false => w.as_mut().unwrap().write(buf),
            },
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Copy(w) => w.flush(),
            Encoder::Delta(w) => w.flush(),
            Encoder::Bcj(w) => w.as_mut().unwrap().flush(),
            Encoder::Lzma(w) => w.as_mut().unwrap().flush(),
            Encoder::Lzma2(w) => w.as_mut().unwrap().flush(),
        }
    }
}

pub(crate) fn add_encoder<W: Write>(
    input: CountingWriter<W>,
    config: &CoderConfiguration,
) -> Result<Encoder<W>, Error> {
    match config.method.id() {
        CoderId::ID_COPY => Ok(Encoder::Copy(input)),
        CoderId::ID_DELTA => {
            let options = match config.options {
                Some(CoderOptions::Delta(options)) => options,
                _ => DeltaOptions::default(),
            };
            Ok(Encoder::Delta(DeltaWriter::new(input, options.0 as usize)))
        }
        CoderId::ID_BCJ_X86 => Ok(bcj(input, FilterArch::X86)),
        CoderId::ID_BCJ_ARM => Ok(bcj(input, FilterArch::Arm)),
        CoderId::ID_BCJ_ARM_THUMB => Ok(bcj(input, FilterArch::ArmThumb)),
        CoderId::ID_BCJ_ARM64 => Ok(bcj(input, FilterArch::Arm64)),
        CoderId::ID_BCJ_PPC => Ok(bcj(input, FilterArch::Ppc)),
        CoderId::ID_BCJ_IA64 => Ok(bcj(input, FilterArch::Ia64)),
        CoderId::ID_BCJ_SPARC => Ok(bcj(input, FilterArch::Sparc)),
        CoderId::ID_BCJ2 => Err(Error::unsupported("BCJ2 encoding is not supported")),
        CoderId::ID_LZMA => {
            let options = match &config.options {
                Some(CoderOptions::Lzma(options)) => options.clone(),
                _ => LzmaOptions::default(),
            };
            let lzma = LZMAWriter::new_no_header(input, &options.0, false).map_err(Error::io)?;
            Ok(Encoder::Lzma(Some(lzma)))
        }
        CoderId::ID_LZMA2 => {
            let options = match &config.options {
                Some(CoderOptions::Lzma2(options)) => options.clone(),
                _ => Lzma2Options::default(),
            };
            Ok(Encoder::Lzma2(Some(LZMA2Writer::new(input, &options.0))))
        }
        _ => Err(Error::UnsupportedCoder(config.method.id().to_vec())),
    }
}

fn bcj<W: Write>(input: CountingWriter<W>, arch: FilterArch) -> Encoder<W> {
    Encoder::Bcj(Some(BcjWriter::new(input, arch, 0)))
}

/// Serializes a coder's options into its on-disk properties blob.
pub(crate) fn options_as_properties<'a>(
    method: CoderId,
    options: Option<&CoderOptions>,
    out: &'a mut [u8],
) -> &'a [u8] {
    match method.id() {
        CoderId::ID_DELTA => {
            let options = match options {
                Some(CoderOptions::Delta(options)) => *options,
                _ => DeltaOptions::default(),
            };
            out[0] = options.0.saturating_sub(1) as u8;
            &out[0..1]
        }
        CoderId::ID_LZMA2 => {
            let options = match options {
                Some(CoderOptions::Lzma2(options)) => options.clone(),
                _ => Lzma2Options::default(),
            };
            out[0] = lzma2_dict_size_property(options.0.dict_size);
            &out[0..1]
        }
        CoderId::ID_LZMA => {
            let options = match options {
                Some(CoderOptions::Lzma(options)) => options.clone(),
                _ => LzmaOptions::default(),
            };
            out[0] = options.0.get_props();
            out[1..5].copy_from_slice(&options.0.dict_size.to_le_bytes());
            &out[0..5]
        }
        _ => &[],
    }
}

pub(crate) fn lzma2_dict_size_property(dict_size: u32) -> u8 {
    let lead = dict_size.leading_zeros();
    let second_bit = (dict_size >> 30u32.wrapping_sub(lead)).wrapping_sub(2);
    (19u32.wrapping_sub(lead) * 2 + second_bit) as u8
}

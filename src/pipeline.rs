//! Byte-level coder pipelines: an ordered stack of reversible filters in
//! front of one terminal compression codec. Encoding runs outermost-in
//! (filters first, codec last); decoding reverses the order.

use crate::{
    error::Error,
    filter::{ContainerFormat, Filter, FilterSpec},
    lzh,
};

/// The terminal codec of a [`FilterPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineCodec {
    /// Pass bytes through unchanged.
    Copy,
    /// The LZ77+Huffman block codec.
    #[default]
    LzHuffman,
}

/// A reusable filters-plus-codec configuration for in-memory byte streams.
pub struct FilterPipeline {
    filters: Vec<FilterSpec>,
    codec: PipelineCodec,
    format: ContainerFormat,
}

impl FilterPipeline {
    /// Builds a pipeline; `format` picks the Delta variant and validates
    /// the filter set the way that container would.
    pub fn new(
        filters: Vec<FilterSpec>,
        codec: PipelineCodec,
        format: ContainerFormat,
    ) -> Result<Self, Error> {
        // Fail early on pairings the format cannot express.
        for spec in &filters {
            Filter::new(*spec, format)?;
        }
        Ok(Self {
            filters,
            codec,
            format,
        })
    }

    /// Filters then compresses `data`.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut current = data.to_vec();
        for spec in &self.filters {
            let mut filter = Filter::new(*spec, self.format)?;
            current = filter.encode(&current, 0);
        }
        Ok(match self.codec {
            PipelineCodec::Copy => current,
            PipelineCodec::LzHuffman => lzh::encode_block(&current),
        })
    }

    /// Decompresses then unfilters `data`. `max_output` bounds the codec
    /// stage the way a folder's declared unpack size would.
    pub fn decode(&self, data: &[u8], max_output: Option<usize>) -> Result<Vec<u8>, Error> {
        let mut current = match self.codec {
            PipelineCodec::Copy => data.to_vec(),
            PipelineCodec::LzHuffman => lzh::decode_block(data, max_output)?,
        };
        for spec in self.filters.iter().rev() {
            let mut filter = Filter::new(*spec, self.format)?;
            current = filter.decode(&current, 0);
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterArch;

    #[test]
    fn filters_then_codec_roundtrip() {
        let mut data = Vec::new();
        for i in 0..400u32 {
            data.push(0xE8);
            data.extend_from_slice(&(i * 16).to_le_bytes());
            data.push((i % 251) as u8);
        }
        let pipeline = FilterPipeline::new(
            vec![
                FilterSpec::Bcj(FilterArch::X86),
                FilterSpec::Delta { distance: 2 },
            ],
            PipelineCodec::LzHuffman,
            ContainerFormat::SevenZ,
        )
        .unwrap();
        let encoded = pipeline.encode(&data).unwrap();
        assert_eq!(pipeline.decode(&encoded, None).unwrap(), data);
    }

    #[test]
    fn copy_codec_applies_only_filters() {
        let data = [0x01, 0x02, 0x04, 0x07, 0x0B, 0x10];
        let pipeline = FilterPipeline::new(
            vec![FilterSpec::Delta { distance: 2 }],
            PipelineCodec::Copy,
            ContainerFormat::SevenZ,
        )
        .unwrap();
        let encoded = pipeline.encode(&data).unwrap();
        assert_eq!(encoded, [0x01, 0x02, 0x03, 0x05, 0x07, 0x09]);
        assert_eq!(pipeline.decode(&encoded, None).unwrap(), data);
    }

    #[test]
    fn invalid_pairings_fail_at_construction() {
        assert!(FilterPipeline::new(
            vec![FilterSpec::Bcj(FilterArch::Arm64)],
            PipelineCodec::Copy,
            ContainerFormat::Xz,
        )
        .is_err());
    }
}

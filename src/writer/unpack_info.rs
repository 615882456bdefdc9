use std::{io::Write, sync::Arc};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::{
    archive::{K_CODERS_UNPACK_SIZE, K_CRC, K_END, K_FOLDER, K_NUM_UNPACK_STREAM, K_SIZE,
        K_SUB_STREAMS_INFO, K_UNPACK_INFO},
    coder_options::CoderConfiguration,
    encoder,
};

use super::write_u64;

/// The folder table as the writer accumulates it: one [`FolderInfo`] per
/// emitted folder, serialized as UnpackInfo + SubStreamsInfo.
#[derive(Debug, Clone, Default)]
pub(crate) struct UnpackInfo {
    pub(crate) folders: Vec<FolderInfo>,
}

impl UnpackInfo {
    pub(crate) fn add(
        &mut self,
        methods: Arc<Vec<CoderConfiguration>>,
        sizes: Vec<u64>,
        crc: u32,
    ) {
        self.folders.push(FolderInfo {
            methods,
            sizes,
            crc,
            num_sub_streams: 1,
            ..Default::default()
        })
    }

    pub(crate) fn add_multiple(
        &mut self,
        methods: Arc<Vec<CoderConfiguration>>,
        sizes: Vec<u64>,
        crc: u32,
        sub_stream_sizes: Vec<u64>,
        sub_stream_crcs: Vec<u32>,
    ) {
        self.folders.push(FolderInfo {
            methods,
            sizes,
            crc,
            num_sub_streams: sub_stream_sizes.len() as u64,
            sub_stream_sizes,
            sub_stream_crcs,
        })
    }

    pub(crate) fn write_to<H: Write>(&self, header: &mut H) -> std::io::Result<()> {
        header.write_u8(K_UNPACK_INFO)?;
        header.write_u8(K_FOLDER)?;
        write_u64(header, self.folders.len() as u64)?;
        header.write_u8(0)?;
        let mut cache = Vec::with_capacity(32);
        for folder in self.folders.iter() {
            folder.write_to(header, &mut cache)?;
        }
        header.write_u8(K_CODERS_UNPACK_SIZE)?;
        for folder in self.folders.iter() {
            for size in folder.sizes.iter().copied() {
                write_u64(header, size)?;
            }
        }
        header.write_u8(K_CRC)?;
        header.write_u8(1)?; // all defined
        for folder in self.folders.iter() {
            header.write_u32::<LittleEndian>(folder.crc)?;
        }
        header.write_u8(K_END)?;
        Ok(())
    }

    pub(crate) fn write_substreams<H: Write>(&self, header: &mut H) -> std::io::Result<()> {
        header.write_u8(K_SUB_STREAMS_INFO)?;

        header.write_u8(K_NUM_UNPACK_STREAM)?;
        for folder in &self.folders {
            write_u64(header, folder.num_sub_streams)?;
        }
        header.write_u8(K_SIZE)?;
        for folder in &self.folders {
            if folder.sub_stream_sizes.len() <= 1 {
                continue;
            }
            // the last substream size is implied by the folder size
            for size in &folder.sub_stream_sizes[..folder.sub_stream_sizes.len() - 1] {
                write_u64(header, *size)?;
            }
        }
        header.write_u8(K_CRC)?;
        header.write_u8(1)?; // all defined
        for folder in &self.folders {
            if folder.sub_stream_crcs.len() <= 1 && folder.crc != 0 {
                continue;
            }
            for crc in folder.sub_stream_crcs.iter().copied() {
                header.write_u32::<LittleEndian>(crc)?;
            }
        }
        header.write_u8(K_END)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FolderInfo {
    pub(crate) methods: Arc<Vec<CoderConfiguration>>,
    pub(crate) sizes: Vec<u64>,
    pub(crate) crc: u32,
    pub(crate) num_sub_streams: u64,
    pub(crate) sub_stream_sizes: Vec<u64>,
    pub(crate) sub_stream_crcs: Vec<u32>,
}

impl FolderInfo {
    fn write_to<W: Write>(&self, header: &mut W, cache: &mut Vec<u8>) -> std::io::Result<()> {
        cache.clear();
        for config in self.methods.iter() {
            Self::write_single_coder(config, cache)?;
        }
        let num_coders = self.methods.len();
        write_u64(header, num_coders as u64)?;
        header.write_all(cache)?;
        // linear chain: coder i+1 consumes coder i's output
        for i in 0..num_coders - 1 {
            write_u64(header, i as u64 + 1)?;
            write_u64(header, i as u64)?;
        }
        Ok(())
    }

    fn write_single_coder<H: Write>(
        config: &CoderConfiguration,
        out: &mut H,
    ) -> std::io::Result<()> {
        let id = config.method.id();
        let mut temp = [0u8; 16];
        let props =
            encoder::options_as_properties(config.method, config.options.as_ref(), &mut temp);
        let mut coder_flags = id.len() as u8;
        if !props.is_empty() {
            coder_flags |= 0x20;
        }
        out.write_u8(coder_flags)?;
        out.write_all(id)?;
        if !props.is_empty() {
            out.write_u8(props.len() as u8)?;
            out.write_all(props)?;
        }
        Ok(())
    }
}

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::archive::{K_CRC, K_END, K_PACK_INFO, K_SIZE};

use super::write_u64;

/// The pack area bookkeeping: position plus per-stream sizes and CRCs.
#[derive(Debug, Clone, Default)]
pub(crate) struct PackInfo {
    pub(crate) pos: u64,
    sizes: Vec<u64>,
    crcs: Vec<u32>,
}

impl PackInfo {
    pub(crate) fn add_stream(&mut self, size: u64, crc: u32) {
        self.sizes.push(size);
        self.crcs.push(crc);
    }

    pub(crate) fn len(&self) -> usize {
        self.sizes.len()
    }

    pub(crate) fn write_to<H: Write>(&self, header: &mut H) -> std::io::Result<()> {
        header.write_u8(K_PACK_INFO)?;
        write_u64(header, self.pos)?;
        write_u64(header, self.sizes.len() as u64)?;
        header.write_u8(K_SIZE)?;
        for size in self.sizes.iter().copied() {
            write_u64(header, size)?;
        }
        header.write_u8(K_CRC)?;
        header.write_u8(1)?; // all defined
        for crc in self.crcs.iter().copied() {
            header.write_u32::<LittleEndian>(crc)?;
        }
        header.write_u8(K_END)?;
        Ok(())
    }
}

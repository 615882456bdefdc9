use std::io::Read;

use crc32fast::Hasher;

/// Tracks the byte count and CRC-32 of everything read through it.
///
/// The writer wraps each entry's content in one of these to record the
/// per-substream digests.
pub struct SourceReader<R> {
    reader: R,
    size: usize,
    crc: Hasher,
    crc_value: u32,
}

impl<R> From<R> for SourceReader<R> {
    fn from(value: R) -> Self {
        Self::new(value)
    }
}

impl<R: Read> Read for SourceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.reader.read(buf)?;
        if self.crc_value == 0 {
            if n > 0 {
                self.size += n;
                self.crc.update(&buf[..n]);
            } else {
                let crc = std::mem::replace(&mut self.crc, Hasher::new());
                self.crc_value = crc.finalize();
            }
        }
        Ok(n)
    }
}

impl<R> SourceReader<R> {
    /// Wraps `reader` with fresh counters.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            size: 0,
            crc: Hasher::new(),
            crc_value: 0,
        }
    }

    /// Bytes read so far.
    pub fn read_count(&self) -> usize {
        self.size
    }

    /// CRC-32 of the data; finalized once the reader hits EOF.
    pub fn crc_value(&self) -> u32 {
        self.crc_value
    }
}

//! Branch/call/jump address rewriters.
//!
//! Each architecture scans for its branch encodings and converts the
//! displacement between relative and absolute form using the running
//! absolute stream position, which makes repeated calls to the same target
//! byte-identical and therefore compressible. All converters are exact
//! inverses of themselves with the direction flag flipped.

use std::io::{Read, Write};

use super::FilterArch;

#[inline]
fn test86_ms_byte(b: u8) -> bool {
    b == 0x00 || b == 0xFF
}

/// One architecture's rewriter with its carried state.
pub(crate) struct BcjFilter {
    is_encoder: bool,
    pos: usize,
    prev_mask: u32,
    filter: fn(&mut BcjFilter, &mut [u8]) -> usize,
}

impl BcjFilter {
    pub(crate) fn for_arch(arch: FilterArch, start_pos: usize, encoder: bool) -> Self {
        match arch {
            FilterArch::X86 => Self::new_x86(start_pos, encoder),
            FilterArch::Arm => Self::new_arm(start_pos, encoder),
            FilterArch::ArmThumb => Self::new_arm_thumb(start_pos, encoder),
            FilterArch::Arm64 => Self::new_arm64(start_pos, encoder),
            FilterArch::Ppc => Self::new_ppc(start_pos, encoder),
            FilterArch::Ia64 => Self::new_ia64(start_pos, encoder),
            FilterArch::Sparc => Self::new_sparc(start_pos, encoder),
        }
    }

    pub(crate) fn new_x86(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::x86_code,
        }
    }

    pub(crate) fn new_arm(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos + 8,
            prev_mask: 0,
            filter: Self::arm_code,
        }
    }

    pub(crate) fn new_arm_thumb(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos + 4,
            prev_mask: 0,
            filter: Self::arm_thumb_code,
        }
    }

    pub(crate) fn new_arm64(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::arm64_code,
        }
    }

    pub(crate) fn new_ppc(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::ppc_code,
        }
    }

    pub(crate) fn new_ia64(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::ia64_code,
        }
    }

    pub(crate) fn new_sparc(start_pos: usize, encoder: bool) -> Self {
        Self {
            is_encoder: encoder,
            pos: start_pos,
            prev_mask: 0,
            filter: Self::sparc_code,
        }
    }

    /// Rewrites the processable prefix of `buf` in place and returns its
    /// length. Bytes past the returned length are below one instruction and
    /// must be carried over or passed through verbatim.
    pub(crate) fn apply(&mut self, buf: &mut [u8]) -> usize {
        (self.filter)(self, buf)
    }

    /// x86 CALL/JMP rel32. A 3-bit mask tracks 0x00/0xFF bytes near
    /// consecutive opcodes so that false positives convert identically in
    /// both directions.
    fn x86_code(&mut self, buf: &mut [u8]) -> usize {
        let size = buf.len();
        if size < 5 {
            return 0;
        }
        let scan_end = size - 4;
        let ip = (self.pos as u32).wrapping_add(5);
        let mut mask = self.prev_mask & 7;
        let mut pos = 0usize;
        loop {
            let mut p = pos;
            while p < scan_end && (buf[p] & 0xFE) != 0xE8 {
                p += 1;
            }
            let d = p - pos;
            pos = p;
            if p >= scan_end {
                self.prev_mask = if d > 2 { 0 } else { mask >> d };
                self.pos += pos;
                return pos;
            }
            if d > 2 {
                mask = 0;
            } else {
                mask >>= d;
                if mask != 0
                    && ((mask & 1) != 0 || test86_ms_byte(buf[p + (mask >> 1) as usize + 1]))
                {
                    mask = (mask >> 1) | 4;
                    pos += 1;
                    continue;
                }
            }
            if test86_ms_byte(buf[p + 4]) {
                let mut v = u32::from_le_bytes([buf[p + 1], buf[p + 2], buf[p + 3], buf[p + 4]]);
                let cur = ip.wrapping_add(pos as u32);
                pos += 5;
                if self.is_encoder {
                    v = v.wrapping_add(cur);
                } else {
                    v = v.wrapping_sub(cur);
                }
                if mask != 0 {
                    let sh = (mask & 6) << 2;
                    if test86_ms_byte((v >> sh) as u8) {
                        v ^= (0x100u32 << sh).wrapping_sub(1);
                        if self.is_encoder {
                            v = v.wrapping_add(cur);
                        } else {
                            v = v.wrapping_sub(cur);
                        }
                    }
                    mask = 0;
                }
                buf[p + 1] = v as u8;
                buf[p + 2] = (v >> 8) as u8;
                buf[p + 3] = (v >> 16) as u8;
                buf[p + 4] = 0u8.wrapping_sub(((v >> 24) & 1) as u8);
            } else {
                mask = (mask >> 1) | 4;
                pos += 1;
            }
        }
    }

    /// ARM BL: 24-bit word displacement, little-endian, PC bias of 8.
    fn arm_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            if buf[i + 3] == 0xEB {
                let src = ((buf[i + 2] as u32) << 16 | (buf[i + 1] as u32) << 8 | buf[i] as u32)
                    << 2;
                let p = (self.pos + i) as u32;
                let dest = if self.is_encoder {
                    src.wrapping_add(p)
                } else {
                    src.wrapping_sub(p)
                };
                let dest = dest >> 2;
                buf[i + 2] = (dest >> 16) as u8;
                buf[i + 1] = (dest >> 8) as u8;
                buf[i] = dest as u8;
            }
            i += 4;
        }
        self.pos += i;
        i
    }

    /// ARM Thumb BL pair: 22-bit halfword displacement split across two
    /// 16-bit instructions, PC bias of 4.
    fn arm_thumb_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            if (buf[i + 1] & 0xF8) == 0xF0 && (buf[i + 3] & 0xF8) == 0xF8 {
                let src = (((buf[i + 1] & 7) as u32) << 19
                    | (buf[i] as u32) << 11
                    | ((buf[i + 3] & 7) as u32) << 8
                    | buf[i + 2] as u32)
                    << 1;
                let p = (self.pos + i) as u32;
                let dest = if self.is_encoder {
                    src.wrapping_add(p)
                } else {
                    src.wrapping_sub(p)
                };
                let dest = dest >> 1;
                buf[i + 1] = (0xF0 | ((dest >> 19) & 7)) as u8;
                buf[i] = (dest >> 11) as u8;
                buf[i + 3] = (0xF8 | ((dest >> 8) & 7)) as u8;
                buf[i + 2] = dest as u8;
                i += 2;
            }
            i += 2;
        }
        self.pos += i;
        i
    }

    /// ARM64 BL (26-bit word displacement) and ADRP within ±512 MiB
    /// (21-bit page displacement).
    fn arm64_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            let mut pc = (self.pos + i) as u32;
            let mut instr = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

            if (instr >> 26) == 0x25 {
                let src = instr;
                instr = 0x9400_0000;
                pc >>= 2;
                if !self.is_encoder {
                    pc = 0u32.wrapping_sub(pc);
                }
                instr |= src.wrapping_add(pc) & 0x03FF_FFFF;
                buf[i..i + 4].copy_from_slice(&instr.to_le_bytes());
            } else if (instr & 0x9F00_0000) == 0x9000_0000 {
                let src = ((instr >> 29) & 3) | ((instr >> 3) & 0x001F_FFFC);
                // Only convert page offsets within +-512 MiB, so the
                // rewritten field still fits and the guard is symmetric.
                if (src.wrapping_add(0x0002_0000) & 0x001C_0000) == 0 {
                    instr &= 0x9000_001F;
                    pc >>= 12;
                    if !self.is_encoder {
                        pc = 0u32.wrapping_sub(pc);
                    }
                    let dest = src.wrapping_add(pc);
                    instr |= (dest & 3) << 29;
                    instr |= (dest & 0x0003_FFFC) << 3;
                    instr |= 0u32.wrapping_sub(dest & 0x0002_0000) & 0x00E0_0000;
                    buf[i..i + 4].copy_from_slice(&instr.to_le_bytes());
                }
            }
            i += 4;
        }
        self.pos += i;
        i
    }

    /// PowerPC branch-and-link: big-endian, 24-bit word displacement.
    fn ppc_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            if (buf[i] >> 2) == 0x12 && (buf[i + 3] & 3) == 1 {
                let src = ((buf[i] & 3) as u32) << 24
                    | (buf[i + 1] as u32) << 16
                    | (buf[i + 2] as u32) << 8
                    | (buf[i + 3] & 0xFC) as u32;
                let p = (self.pos + i) as u32;
                let dest = if self.is_encoder {
                    src.wrapping_add(p)
                } else {
                    src.wrapping_sub(p)
                };
                buf[i] = 0x48 | ((dest >> 24) & 3) as u8;
                buf[i + 1] = (dest >> 16) as u8;
                buf[i + 2] = (dest >> 8) as u8;
                buf[i + 3] = (buf[i + 3] & 3) | (dest & 0xFC) as u8;
            }
            i += 4;
        }
        self.pos += i;
        i
    }

    /// SPARC CALL and the two branch-always forms: big-endian, 22 bits
    /// kept with sign folding.
    fn sparc_code(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        if len < 4 {
            return 0;
        }
        let end = len - 4;
        let mut i = 0;
        while i <= end {
            if (buf[i] == 0x40 && (buf[i + 1] & 0xC0) == 0x00)
                || (buf[i] == 0x7F && (buf[i + 1] & 0xC0) == 0xC0)
            {
                let src = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]) << 2;
                let p = (self.pos + i) as u32;
                let mut dest = if self.is_encoder {
                    src.wrapping_add(p)
                } else {
                    src.wrapping_sub(p)
                };
                dest >>= 2;
                dest = (0x4000_0000u32.wrapping_sub(dest & 0x40_0000))
                    | 0x4000_0000
                    | (dest & 0x3F_FFFF);
                buf[i..i + 4].copy_from_slice(&dest.to_be_bytes());
            }
            i += 4;
        }
        self.pos += i;
        i
    }

    /// IA-64 B-type branches inside 16-byte bundles. The template selects
    /// which 41-bit slots hold branches; the 21-bit displacement sits at
    /// bit 13 of the slot with its sign at bit 36.
    fn ia64_code(&mut self, buf: &mut [u8]) -> usize {
        const BRANCH_TABLE: [u32; 32] = [
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 6, 6, 0, 0, 7, 7, 4, 4, 0, 0,
            4, 4, 0, 0,
        ];

        let len = buf.len();
        if len < 16 {
            return 0;
        }
        let mut i = 0;
        while i + 16 <= len {
            let template = (buf[i] & 0x1F) as usize;
            let mask = BRANCH_TABLE[template];
            let mut bit_pos = 5u32;
            for slot in 0..3 {
                if (mask >> slot) & 1 == 0 {
                    bit_pos += 41;
                    continue;
                }
                let byte_pos = (bit_pos >> 3) as usize;
                let bit_res = bit_pos & 7;
                let mut instruction = 0u64;
                for j in 0..6 {
                    instruction |= (buf[i + j + byte_pos] as u64) << (8 * j);
                }
                let mut inst_norm = instruction >> bit_res;
                if ((inst_norm >> 37) & 0xF) == 0x5 && ((inst_norm >> 9) & 0x7FF_FFFF) == 0 {
                    let mut src = ((inst_norm >> 13) & 0xF_FFFF) as u32;
                    src |= (((inst_norm >> 36) & 1) as u32) << 20;
                    src <<= 4;
                    let p = (self.pos + i) as u32;
                    let mut dest = if self.is_encoder {
                        src.wrapping_add(p)
                    } else {
                        src.wrapping_sub(p)
                    };
                    dest >>= 4;
                    inst_norm &= !(0x8F_FFFFu64 << 13);
                    inst_norm |= ((dest & 0xF_FFFF) as u64) << 13;
                    inst_norm |= ((dest & 0x10_0000) as u64) << (36 - 20);
                    instruction &= (1 << bit_res) - 1;
                    instruction |= inst_norm << bit_res;
                    for j in 0..6 {
                        buf[i + j + byte_pos] = (instruction >> (8 * j)) as u8;
                    }
                }
                bit_pos += 41;
            }
            i += 16;
        }
        self.pos += i;
        i
    }
}

const ADAPTER_BUF_SIZE: usize = 16 * 1024;

/// Decodes BCJ-filtered bytes pulled from an inner reader, carrying the
/// unprocessable tail between refills.
pub struct BcjReader<R> {
    inner: R,
    filter: BcjFilter,
    buf: Vec<u8>,
    start: usize,
    ready: usize,
    end: usize,
    eof: bool,
}

impl<R> BcjReader<R> {
    /// Wraps `inner`, decoding for `arch` from absolute `start_pos`.
    pub fn new(inner: R, arch: FilterArch, start_pos: usize) -> Self {
        Self {
            inner,
            filter: BcjFilter::for_arch(arch, start_pos, false),
            buf: vec![0; ADAPTER_BUF_SIZE],
            start: 0,
            ready: 0,
            end: 0,
            eof: false,
        }
    }
}

impl<R: Read> Read for BcjReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.start == self.ready {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
                self.ready = 0;
            }
            while !self.eof && self.end < self.buf.len() {
                let n = self.inner.read(&mut self.buf[self.end..])?;
                if n == 0 {
                    self.eof = true;
                } else {
                    self.end += n;
                }
            }
            if self.end == 0 {
                return Ok(0);
            }
            let processed = self.filter.apply(&mut self.buf[..self.end]);
            self.ready = if processed == 0 && self.eof {
                // Tail below one instruction passes through verbatim.
                self.end
            } else if processed == 0 {
                continue;
            } else {
                processed
            };
        }
        let n = out.len().min(self.ready - self.start);
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }
}

/// BCJ-filters bytes on their way into an inner writer; the trailing
/// partial instruction is flushed verbatim by [`BcjWriter::finish`].
pub struct BcjWriter<W> {
    inner: W,
    filter: BcjFilter,
    pending: Vec<u8>,
}

impl<W: Write> BcjWriter<W> {
    /// Wraps `inner`, encoding for `arch` from absolute `start_pos`.
    pub fn new(inner: W, arch: FilterArch, start_pos: usize) -> Self {
        Self {
            inner,
            filter: BcjFilter::for_arch(arch, start_pos, true),
            pending: Vec::with_capacity(ADAPTER_BUF_SIZE),
        }
    }

    /// Flushes the unprocessable tail and returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.pending.is_empty() {
            self.inner.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for BcjWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        let processed = self.filter.apply(&mut self.pending);
        if processed > 0 {
            self.inner.write_all(&self.pending[..processed])?;
            self.pending.drain(..processed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn x86_call_reference_vector() {
        let mut data = [0xE8, 0x00, 0x00, 0x00, 0x00, 0x90];
        let mut enc = BcjFilter::new_x86(0, true);
        let processed = enc.apply(&mut data);
        assert_eq!(processed, 5);
        assert_eq!(data, [0xE8, 0x05, 0x00, 0x00, 0x00, 0x90]);

        let mut dec = BcjFilter::new_x86(0, false);
        dec.apply(&mut data);
        assert_eq!(data, [0xE8, 0x00, 0x00, 0x00, 0x00, 0x90]);
    }

    #[test]
    fn sub_instruction_input_passes_through() {
        for arch in [
            FilterArch::X86,
            FilterArch::Arm,
            FilterArch::ArmThumb,
            FilterArch::Arm64,
            FilterArch::Ppc,
            FilterArch::Ia64,
            FilterArch::Sparc,
        ] {
            let mut data = [0xE8, 0x01, 0x02];
            let before = data;
            let mut filter = BcjFilter::for_arch(arch, 0, true);
            assert_eq!(filter.apply(&mut data), 0, "{arch:?}");
            assert_eq!(data, before);
        }
    }

    fn roundtrip(arch: FilterArch, data: &[u8], pos: usize) {
        let mut encoded = data.to_vec();
        let mut enc = BcjFilter::for_arch(arch, pos, true);
        enc.apply(&mut encoded);
        let mut dec = BcjFilter::for_arch(arch, pos, false);
        dec.apply(&mut encoded);
        assert_eq!(encoded, data, "{arch:?} at {pos}");
    }

    #[test]
    fn branch_heavy_buffers_roundtrip() {
        // Synthetic instruction soup with plenty of opcode bytes.
        let mut soup = Vec::new();
        for i in 0..512u32 {
            soup.extend_from_slice(&[
                (i % 7) as u8,
                0xE8,
                (i >> 3) as u8,
                0x00,
                0xEB,
                0x48,
                (i % 251) as u8,
                0xFF,
            ]);
        }
        for arch in [
            FilterArch::X86,
            FilterArch::Arm,
            FilterArch::ArmThumb,
            FilterArch::Arm64,
            FilterArch::Ppc,
            FilterArch::Ia64,
            FilterArch::Sparc,
        ] {
            roundtrip(arch, &soup, 0);
            roundtrip(arch, &soup, 0x1000);
        }
    }

    #[test]
    fn arm64_adrp_outside_range_is_untouched() {
        // ADRP with a page offset beyond +-512 MiB must not be rewritten.
        let instr: u32 = 0x9010_0000;
        let mut data = instr.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 4]);
        let before = data.clone();
        let mut enc = BcjFilter::new_arm64(0x4000, true);
        enc.apply(&mut data);
        assert_eq!(data, before);
    }

    #[test]
    fn stream_adapters_match_one_shot() {
        let mut soup = Vec::new();
        for i in 0..2000u32 {
            soup.push(0xE8);
            soup.extend_from_slice(&(i as u32).to_le_bytes());
            soup.push((i % 256) as u8);
        }

        let mut one_shot = soup.clone();
        let mut enc = BcjFilter::new_x86(0, true);
        let n = enc.apply(&mut one_shot);
        assert!(n > 0);

        // Encode through the writer in uneven chunks.
        let mut encoded = Vec::new();
        {
            let mut writer = BcjWriter::new(&mut encoded, FilterArch::X86, 0);
            let mut fed = 0;
            for chunk in soup.chunks(517) {
                writer.write_all(chunk).unwrap();
                fed += chunk.len();
            }
            assert_eq!(fed, soup.len());
            writer.finish().unwrap();
        }
        assert_eq!(encoded, one_shot);

        // Decode through the reader in small reads.
        let mut reader = BcjReader::new(Cursor::new(&encoded), FilterArch::X86, 0);
        let mut decoded = Vec::new();
        let mut buf = [0u8; 97];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            decoded.extend_from_slice(&buf[..n]);
        }
        assert_eq!(decoded, soup);
    }
}

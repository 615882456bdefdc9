//! PAR2 packet framing and the packet types the engine consumes.
//!
//! Every packet is `magic, length, MD5, set id, type, body`; the digest
//! covers everything after itself. Damaged packets are skipped, not fatal:
//! a recovery file is exactly the kind of file that may itself be damaged.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use md5::{Digest, Md5};

use crate::error::Error;

pub(crate) const PACKET_MAGIC: &[u8; 8] = b"PAR2\0PKT";
pub(crate) const HEADER_SIZE: usize = 64;

pub(crate) const TYPE_MAIN: &[u8; 16] = b"PAR 2.0\0Main\0\0\0\0";
pub(crate) const TYPE_FILE_DESC: &[u8; 16] = b"PAR 2.0\0FileDesc";
pub(crate) const TYPE_IFSC: &[u8; 16] = b"PAR 2.0\0IFSC\0\0\0\0";
pub(crate) const TYPE_RECOVERY_SLICE: &[u8; 16] = b"PAR 2.0\0RecvSlic";
pub(crate) const TYPE_CREATOR: &[u8; 16] = b"PAR 2.0\0Creator\0";

/// Set parameters: block size and the member file ids.
#[derive(Debug, Clone)]
pub(crate) struct MainPacket {
    pub(crate) block_size: u64,
    pub(crate) recoverable_ids: Vec<[u8; 16]>,
    pub(crate) non_recoverable_ids: Vec<[u8; 16]>,
}

/// Identity and size of one member file.
#[derive(Debug, Clone)]
pub(crate) struct FileDescPacket {
    pub(crate) file_id: [u8; 16],
    pub(crate) md5: [u8; 16],
    pub(crate) md5_16k: [u8; 16],
    pub(crate) length: u64,
    pub(crate) name: String,
}

/// Per-block MD5 + CRC-32 pairs of one member file.
#[derive(Debug, Clone)]
pub(crate) struct IfscPacket {
    pub(crate) file_id: [u8; 16],
    pub(crate) checksums: Vec<([u8; 16], u32)>,
}

/// One recovery block tagged with its exponent.
#[derive(Debug, Clone)]
pub(crate) struct RecoverySlicePacket {
    pub(crate) exponent: u32,
    pub(crate) data: Vec<u8>,
}

/// Everything collected from one or more recovery files of a set.
#[derive(Debug, Default)]
pub(crate) struct PacketSet {
    pub(crate) set_id: Option<[u8; 16]>,
    pub(crate) main: Option<MainPacket>,
    pub(crate) file_descs: Vec<FileDescPacket>,
    pub(crate) ifsc: Vec<IfscPacket>,
    pub(crate) recovery: Vec<RecoverySlicePacket>,
    pub(crate) damaged_packets: usize,
}

impl PacketSet {
    /// Scans `data` for packets, resynchronizing on the magic after any
    /// damaged region, and merges verified packets into the set.
    pub(crate) fn scan(&mut self, data: &[u8]) {
        let mut pos = 0usize;
        while pos + HEADER_SIZE <= data.len() {
            if &data[pos..pos + 8] != PACKET_MAGIC {
                pos += 1;
                continue;
            }
            match self.parse_packet(&data[pos..]) {
                Some(consumed) => pos += consumed,
                None => {
                    self.damaged_packets += 1;
                    pos += 8;
                }
            }
        }
    }

    /// Parses and verifies one packet; returns its total length, or `None`
    /// when the packet is damaged.
    fn parse_packet(&mut self, data: &[u8]) -> Option<usize> {
        let length = LittleEndian::read_u64(&data[8..16]) as usize;
        if length < HEADER_SIZE || length % 4 != 0 || length > data.len() {
            return None;
        }
        let stored_md5 = &data[16..32];
        let mut hasher = Md5::new();
        hasher.update(&data[32..length]);
        if hasher.finalize().as_slice() != stored_md5 {
            return None;
        }

        let mut set_id = [0u8; 16];
        set_id.copy_from_slice(&data[32..48]);
        match self.set_id {
            None => self.set_id = Some(set_id),
            Some(existing) if existing != set_id => {
                warn!("ignoring packet from a different recovery set");
                return Some(length);
            }
            _ => {}
        }

        let ptype: &[u8; 16] = data[48..64].try_into().unwrap();
        let body = &data[HEADER_SIZE..length];
        match ptype {
            TYPE_MAIN => self.parse_main(body),
            TYPE_FILE_DESC => self.parse_file_desc(body),
            TYPE_IFSC => self.parse_ifsc(body),
            TYPE_RECOVERY_SLICE => self.parse_recovery_slice(body),
            TYPE_CREATOR => {}
            other => {
                debug!("skipping unknown packet type {:02x?}", other);
            }
        }
        Some(length)
    }

    fn parse_main(&mut self, body: &[u8]) {
        if self.main.is_some() || body.len() < 12 {
            return;
        }
        let block_size = LittleEndian::read_u64(&body[..8]);
        let num_recoverable = LittleEndian::read_u32(&body[8..12]) as usize;
        let ids = &body[12..];
        if ids.len() % 16 != 0 || ids.len() / 16 < num_recoverable {
            return;
        }
        let mut all: Vec<[u8; 16]> = ids
            .chunks_exact(16)
            .map(|c| c.try_into().unwrap())
            .collect();
        let non_recoverable = all.split_off(num_recoverable);
        self.main = Some(MainPacket {
            block_size,
            recoverable_ids: all,
            non_recoverable_ids: non_recoverable,
        });
    }

    fn parse_file_desc(&mut self, body: &[u8]) {
        if body.len() < 56 {
            return;
        }
        let file_id: [u8; 16] = body[..16].try_into().unwrap();
        if self.file_descs.iter().any(|fd| fd.file_id == file_id) {
            return;
        }
        let name_bytes = &body[56..];
        let name_end = name_bytes
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let Ok(name) = String::from_utf8(name_bytes[..name_end].to_vec()) else {
            return;
        };
        self.file_descs.push(FileDescPacket {
            file_id,
            md5: body[16..32].try_into().unwrap(),
            md5_16k: body[32..48].try_into().unwrap(),
            length: LittleEndian::read_u64(&body[48..56]),
            name,
        });
    }

    fn parse_ifsc(&mut self, body: &[u8]) {
        if body.len() < 16 || (body.len() - 16) % 20 != 0 {
            return;
        }
        let file_id: [u8; 16] = body[..16].try_into().unwrap();
        if self.ifsc.iter().any(|p| p.file_id == file_id) {
            return;
        }
        let checksums = body[16..]
            .chunks_exact(20)
            .map(|pair| {
                let md5: [u8; 16] = pair[..16].try_into().unwrap();
                (md5, LittleEndian::read_u32(&pair[16..20]))
            })
            .collect();
        self.ifsc.push(IfscPacket { file_id, checksums });
    }

    fn parse_recovery_slice(&mut self, body: &[u8]) {
        if body.len() < 4 {
            return;
        }
        let exponent = LittleEndian::read_u32(&body[..4]);
        if self.recovery.iter().any(|r| r.exponent == exponent) {
            return;
        }
        self.recovery.push(RecoverySlicePacket {
            exponent,
            data: body[4..].to_vec(),
        });
    }
}

/// Emits one packet with its digest over set id, type and body.
pub(crate) fn write_packet<W: Write>(
    out: &mut W,
    set_id: &[u8; 16],
    ptype: &[u8; 16],
    body: &[u8],
) -> Result<(), Error> {
    debug_assert_eq!(body.len() % 4, 0);
    let length = (HEADER_SIZE + body.len()) as u64;
    let mut hasher = Md5::new();
    hasher.update(set_id);
    hasher.update(ptype);
    hasher.update(body);
    let digest = hasher.finalize();

    out.write_all(PACKET_MAGIC).map_err(Error::io)?;
    out.write_all(&length.to_le_bytes()).map_err(Error::io)?;
    out.write_all(&digest).map_err(Error::io)?;
    out.write_all(set_id).map_err(Error::io)?;
    out.write_all(ptype).map_err(Error::io)?;
    out.write_all(body).map_err(Error::io)?;
    Ok(())
}

/// The file id: MD5 over the 16k hash, the length and the unpadded name.
pub(crate) fn compute_file_id(md5_16k: &[u8; 16], length: u64, name: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(md5_16k);
    hasher.update(length.to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.finalize().into()
}

/// The recovery set id: MD5 of the main packet body.
pub(crate) fn compute_set_id(main_body: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(main_body);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_roundtrip_through_scan() {
        let set_id = [7u8; 16];
        let mut body = Vec::new();
        body.extend_from_slice(&1024u64.to_le_bytes());
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&[3u8; 16]);

        let mut buf = Vec::new();
        write_packet(&mut buf, &set_id, TYPE_MAIN, &body).unwrap();

        let mut set = PacketSet::default();
        set.scan(&buf);
        let main = set.main.expect("main packet parsed");
        assert_eq!(main.block_size, 1024);
        assert_eq!(main.recoverable_ids, vec![[3u8; 16]]);
        assert_eq!(set.set_id, Some(set_id));
        assert_eq!(set.damaged_packets, 0);
    }

    #[test]
    fn corrupted_packet_is_skipped_and_scan_resyncs() {
        let set_id = [1u8; 16];
        let mut buf = Vec::new();
        let mut body = Vec::new();
        body.extend_from_slice(&4u32.to_le_bytes());
        body.extend_from_slice(&[0xAB; 8]);
        write_packet(&mut buf, &set_id, TYPE_RECOVERY_SLICE, &body).unwrap();
        let first_len = buf.len();
        write_packet(&mut buf, &set_id, TYPE_RECOVERY_SLICE, &{
            let mut b = Vec::new();
            b.extend_from_slice(&5u32.to_le_bytes());
            b.extend_from_slice(&[0xCD; 8]);
            b
        })
        .unwrap();

        // damage the first packet's body
        buf[first_len - 1] ^= 0xFF;

        let mut set = PacketSet::default();
        set.scan(&buf);
        assert_eq!(set.damaged_packets, 1);
        assert_eq!(set.recovery.len(), 1);
        assert_eq!(set.recovery[0].exponent, 5);
    }

    #[test]
    fn file_id_depends_on_all_inputs() {
        let a = compute_file_id(&[0; 16], 100, "a.bin");
        let b = compute_file_id(&[0; 16], 101, "a.bin");
        let c = compute_file_id(&[0; 16], 100, "b.bin");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}

//! PAR2 recovery sets: creation, verification and repair.
//!
//! A recovery set is a group of `.par2` files next to the data they
//! protect: an index file with the set metadata and volume files carrying
//! Reed–Solomon recovery blocks. Verification checks every data block
//! against its stored MD5/CRC-32 pair; repair solves for missing blocks
//! with the recovery blocks and rewrites the damaged files.

mod matrix;
mod packet;
mod recover;

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use md5::{Digest, Md5};

use crate::{error::Error, gf16::GfTables};

use self::{
    matrix::base_values,
    packet::{
        FileDescPacket, IfscPacket, PacketSet, TYPE_CREATOR, TYPE_FILE_DESC, TYPE_IFSC,
        TYPE_MAIN, TYPE_RECOVERY_SLICE, compute_file_id, compute_set_id, write_packet,
    },
    recover::{ChunkedRecoverer, DEFAULT_CHUNK_SIZE, PresentBlock, RecoveryBlock},
};

/// Verification status of one member file.
#[derive(Debug)]
pub struct FileVerification {
    /// File name as recorded in the recovery set.
    pub name: String,
    /// Whether the file exists on disk at all.
    pub found: bool,
    /// Whether every block checked out.
    pub complete: bool,
    /// Number of blocks the file spans.
    pub total_blocks: usize,
    /// File-local indices of missing or damaged blocks.
    pub missing_blocks: Vec<usize>,
}

/// The outcome of [`par2_verify`].
#[derive(Debug)]
pub struct Verification {
    /// Block size of the recovery set.
    pub block_size: u64,
    /// Usable recovery blocks found across all volumes.
    pub recovery_block_count: usize,
    /// Per-file status, in recovery-set order.
    pub files: Vec<FileVerification>,
    /// Packets that failed their digest while scanning.
    pub damaged_packets: usize,
}

impl Verification {
    /// True when every member file is present and intact.
    pub fn all_ok(&self) -> bool {
        self.files.iter().all(|f| f.found && f.complete)
    }

    /// Total missing or damaged blocks across the set.
    pub fn missing_block_count(&self) -> usize {
        self.files.iter().map(|f| f.missing_blocks.len()).sum()
    }

    /// True when enough recovery blocks exist to repair the damage.
    pub fn repairable(&self) -> bool {
        self.missing_block_count() <= self.recovery_block_count
    }
}

/// The outcome of [`par2_repair`].
#[derive(Debug)]
pub struct RepairResult {
    /// Whether every damaged file was rebuilt and verified.
    pub success: bool,
    /// Blocks reconstructed from recovery data.
    pub recovered_blocks: usize,
    /// Global block indices that could not be reconstructed.
    pub unrecoverable_blocks: Vec<usize>,
}

struct SourceFileInfo {
    desc: FileDescPacket,
    checksums: Vec<([u8; 16], u32)>,
    block_count: usize,
    first_global_block: usize,
}

struct RecoverySet {
    dir: PathBuf,
    block_size: u64,
    files: Vec<SourceFileInfo>,
    packets: PacketSet,
}

/// Strips a `.volAA+BB.par2` or `.par2` suffix down to the set base name.
fn set_base_name(par2_file: &Path) -> String {
    let stem = par2_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match stem.rfind(".vol") {
        Some(pos) if stem[pos + 4..].chars().all(|c| c.is_ascii_digit() || c == '+') => {
            stem[..pos].to_string()
        }
        _ => stem,
    }
}

fn load_recovery_set(par2_file: &Path) -> Result<RecoverySet, Error> {
    let dir = par2_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let base = set_base_name(par2_file);

    let mut packets = PacketSet::default();
    let mut scanned = 0usize;
    for entry in fs::read_dir(&dir).map_err(|e| Error::io_msg(e, "read recovery set dir"))? {
        let entry = entry.map_err(Error::io)?;
        let name = entry.file_name().to_string_lossy().to_string();
        let is_member = name == format!("{base}.par2")
            || (name.starts_with(&format!("{base}.vol")) && name.ends_with(".par2"));
        if !is_member {
            continue;
        }
        let data = fs::read(entry.path())
            .map_err(|e| Error::io_msg(e, format!("read {name}")))?;
        packets.scan(&data);
        scanned += 1;
    }
    if scanned == 0 {
        return Err(Error::argument(format!(
            "no recovery files found for {}",
            par2_file.display()
        )));
    }
    debug!(
        "scanned {scanned} recovery files: {} descs, {} recovery blocks, {} damaged packets",
        packets.file_descs.len(),
        packets.recovery.len(),
        packets.damaged_packets
    );

    let main = packets
        .main
        .take()
        .ok_or_else(|| Error::corrupt("recovery set without a usable main packet"))?;
    if main.block_size == 0 || main.block_size % 4 != 0 {
        return Err(Error::corrupt("recovery set with invalid block size"));
    }

    let mut files = Vec::with_capacity(main.recoverable_ids.len());
    let mut next_global_block = 0usize;
    for id in &main.recoverable_ids {
        let desc = packets
            .file_descs
            .iter()
            .find(|fd| fd.file_id == *id)
            .cloned()
            .ok_or_else(|| Error::corrupt("missing file description packet"))?;
        let checksums = packets
            .ifsc
            .iter()
            .find(|p| p.file_id == *id)
            .map(|p| p.checksums.clone())
            .ok_or_else(|| Error::corrupt("missing block checksum packet"))?;
        let block_count = desc.length.div_ceil(main.block_size) as usize;
        if checksums.len() != block_count {
            return Err(Error::corrupt("block checksum count disagrees with file size"));
        }
        files.push(SourceFileInfo {
            desc,
            checksums,
            block_count,
            first_global_block: next_global_block,
        });
        next_global_block += block_count;
    }

    Ok(RecoverySet {
        dir,
        block_size: main.block_size,
        files,
        packets,
    })
}

/// Checks one file's blocks against their stored digests; returns the
/// file's data (when readable) and the local indices that failed.
fn scan_file_blocks(
    set: &RecoverySet,
    info: &SourceFileInfo,
) -> (Option<Vec<u8>>, Vec<usize>) {
    let path = set.dir.join(&info.desc.name);
    let Ok(data) = fs::read(&path) else {
        return (None, (0..info.block_count).collect());
    };

    let block_size = set.block_size as usize;
    let mut missing = Vec::new();
    let mut padded = vec![0u8; block_size];
    for (index, &(expected_md5, expected_crc)) in info.checksums.iter().enumerate() {
        let start = index * block_size;
        padded.fill(0);
        if start < data.len() {
            let end = (start + block_size).min(data.len());
            padded[..end - start].copy_from_slice(&data[start..end]);
        }
        let crc = crc32fast::hash(&padded);
        let md5: [u8; 16] = Md5::digest(&padded).into();
        if crc != expected_crc || md5 != expected_md5 {
            missing.push(index);
        }
    }
    // Extra or truncated bytes also count as damage to the touched block.
    if data.len() as u64 != info.desc.length {
        let boundary = (info.desc.length.min(data.len() as u64) / set.block_size) as usize;
        if boundary < info.block_count && !missing.contains(&boundary) {
            missing.push(boundary);
            missing.sort_unstable();
        }
    }
    (Some(data), missing)
}

/// Verifies a recovery set against the data files next to it.
pub fn par2_verify(par2_file: impl AsRef<Path>) -> Result<Verification, Error> {
    let set = load_recovery_set(par2_file.as_ref())?;
    let block_size = set.block_size as usize;

    let usable_recovery = set
        .packets
        .recovery
        .iter()
        .filter(|r| r.data.len() == block_size)
        .count();

    let mut files = Vec::with_capacity(set.files.len());
    for info in &set.files {
        let (data, missing) = scan_file_blocks(&set, info);
        files.push(FileVerification {
            name: info.desc.name.clone(),
            found: data.is_some(),
            complete: missing.is_empty(),
            total_blocks: info.block_count,
            missing_blocks: missing,
        });
    }

    Ok(Verification {
        block_size: set.block_size,
        recovery_block_count: usable_recovery,
        files,
        damaged_packets: set.packets.damaged_packets,
    })
}

/// Repairs the recovery set's data files, writing rebuilt files into
/// `output_dir`.
///
/// With nothing missing this is a no-op reporting success. A singular
/// recovery matrix is reported through
/// [`RepairResult::unrecoverable_blocks`], not as an error; too few
/// recovery blocks is [`Error::Par2InsufficientRecovery`].
pub fn par2_repair(
    par2_file: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
) -> Result<RepairResult, Error> {
    let set = load_recovery_set(par2_file.as_ref())?;
    let block_size = set.block_size as usize;

    let mut file_data: Vec<Option<Vec<u8>>> = Vec::with_capacity(set.files.len());
    let mut file_missing: Vec<Vec<usize>> = Vec::with_capacity(set.files.len());
    for info in &set.files {
        let (data, missing) = scan_file_blocks(&set, info);
        file_data.push(data);
        file_missing.push(missing);
    }

    let missing_global: Vec<usize> = set
        .files
        .iter()
        .zip(&file_missing)
        .flat_map(|(info, missing)| missing.iter().map(|&b| info.first_global_block + b))
        .collect();
    if missing_global.is_empty() {
        return Ok(RepairResult {
            success: true,
            recovered_blocks: 0,
            unrecoverable_blocks: Vec::new(),
        });
    }

    let mut recovery: Vec<_> = set
        .packets
        .recovery
        .iter()
        .filter(|r| r.data.len() == block_size)
        .collect();
    recovery.sort_by_key(|r| r.exponent);
    if recovery.len() < missing_global.len() {
        return Err(Error::Par2InsufficientRecovery {
            needed: missing_global.len(),
            have: recovery.len(),
        });
    }

    let total_blocks: usize = set.files.iter().map(|f| f.block_count).sum();
    let gf = GfTables::new();
    let bases = base_values(&gf, total_blocks);

    let mut present = Vec::with_capacity(total_blocks - missing_global.len());
    for (info, data) in set.files.iter().zip(&file_data) {
        let Some(data) = data else { continue };
        for local in 0..info.block_count {
            let global = info.first_global_block + local;
            if missing_global.contains(&global) {
                continue;
            }
            let start = (local * block_size).min(data.len());
            let end = (start + block_size).min(data.len());
            present.push(PresentBlock {
                base: bases[global],
                data: &data[start..end],
            });
        }
    }
    let missing_bases: Vec<u16> = missing_global.iter().map(|&g| bases[g]).collect();
    let recovery_refs: Vec<RecoveryBlock<'_>> = recovery
        .iter()
        .map(|r| RecoveryBlock {
            exponent: r.exponent,
            data: &r.data,
        })
        .collect();

    let recoverer = ChunkedRecoverer::new(&gf, block_size, DEFAULT_CHUNK_SIZE);
    let rebuilt = match recoverer.recover(&present, &missing_bases, &recovery_refs) {
        Ok(blocks) => blocks,
        Err(Error::Par2Singular) => {
            warn!("recovery matrix is singular, {} blocks lost", missing_global.len());
            return Ok(RepairResult {
                success: false,
                recovered_blocks: 0,
                unrecoverable_blocks: missing_global,
            });
        }
        Err(e) => return Err(e),
    };

    // Reassemble each damaged file and check it against its whole-file MD5.
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir).map_err(|e| Error::io_msg(e, "create output dir"))?;
    let mut success = true;
    for (file_index, info) in set.files.iter().enumerate() {
        if file_missing[file_index].is_empty() {
            continue;
        }
        let mut assembled = vec![0u8; info.block_count * block_size];
        if let Some(data) = &file_data[file_index] {
            let take = data.len().min(assembled.len());
            assembled[..take].copy_from_slice(&data[..take]);
        }
        for &local in &file_missing[file_index] {
            let global = info.first_global_block + local;
            let slot = missing_global
                .iter()
                .position(|&g| g == global)
                .expect("missing block was solved");
            assembled[local * block_size..(local + 1) * block_size]
                .copy_from_slice(&rebuilt[slot]);
        }
        assembled.truncate(info.desc.length as usize);

        let md5: [u8; 16] = Md5::digest(&assembled).into();
        if md5 != info.desc.md5 {
            warn!("rebuilt {} failed its whole-file digest", info.desc.name);
            success = false;
        }
        let out_path = output_dir.join(&info.desc.name);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(Error::io)?;
        }
        fs::write(&out_path, &assembled)
            .map_err(|e| Error::io_msg(e, format!("write {}", info.desc.name)))?;
    }

    Ok(RepairResult {
        success,
        recovered_blocks: missing_global.len(),
        unrecoverable_blocks: Vec::new(),
    })
}

/// Creates a recovery set for `source_files`: the index file at
/// `par2_path` plus one volume file holding `recovery_count` recovery
/// blocks. Returns the written paths.
pub fn par2_create(
    source_files: &[impl AsRef<Path>],
    par2_path: impl AsRef<Path>,
    block_size: u64,
    recovery_count: usize,
) -> Result<Vec<PathBuf>, Error> {
    let par2_path = par2_path.as_ref();
    if block_size == 0 || block_size % 4 != 0 {
        return Err(Error::argument("block size must be a positive multiple of 4"));
    }
    if source_files.is_empty() {
        return Err(Error::argument("a recovery set needs at least one file"));
    }

    struct SourceData {
        desc_body: Vec<u8>,
        ifsc_body: Vec<u8>,
        file_id: [u8; 16],
        data: Vec<u8>,
        block_count: usize,
    }

    let bs = block_size as usize;
    let mut sources = Vec::with_capacity(source_files.len());
    for path in source_files {
        let path = path.as_ref();
        let name = path
            .file_name()
            .ok_or_else(|| Error::argument("source path without a file name"))?
            .to_string_lossy()
            .to_string();
        let data = fs::read(path).map_err(|e| Error::io_msg(e, format!("read {name}")))?;

        let md5: [u8; 16] = Md5::digest(&data).into();
        let md5_16k: [u8; 16] = Md5::digest(&data[..data.len().min(16384)]).into();
        let file_id = compute_file_id(&md5_16k, data.len() as u64, &name);

        let mut desc_body = Vec::with_capacity(56 + name.len() + 4);
        desc_body.extend_from_slice(&file_id);
        desc_body.extend_from_slice(&md5);
        desc_body.extend_from_slice(&md5_16k);
        desc_body.extend_from_slice(&(data.len() as u64).to_le_bytes());
        desc_body.extend_from_slice(name.as_bytes());
        while desc_body.len() % 4 != 0 {
            desc_body.push(0);
        }

        let block_count = (data.len() as u64).div_ceil(block_size) as usize;
        let mut ifsc_body = Vec::with_capacity(16 + block_count * 20);
        ifsc_body.extend_from_slice(&file_id);
        let mut padded = vec![0u8; bs];
        for index in 0..block_count {
            let start = index * bs;
            let end = (start + bs).min(data.len());
            padded.fill(0);
            padded[..end - start].copy_from_slice(&data[start..end]);
            let block_md5: [u8; 16] = Md5::digest(&padded).into();
            ifsc_body.extend_from_slice(&block_md5);
            ifsc_body.extend_from_slice(&crc32fast::hash(&padded).to_le_bytes());
        }

        sources.push(SourceData {
            desc_body,
            ifsc_body,
            file_id,
            data,
            block_count,
        });
    }

    // File ids are ordered numerically, the way reference tools emit them.
    sources.sort_by(|a, b| a.file_id.cmp(&b.file_id));

    let mut main_body = Vec::with_capacity(12 + sources.len() * 16);
    main_body.extend_from_slice(&block_size.to_le_bytes());
    main_body.extend_from_slice(&(sources.len() as u32).to_le_bytes());
    for source in &sources {
        main_body.extend_from_slice(&source.file_id);
    }
    let set_id = compute_set_id(&main_body);

    let mut creator_body = b"ironpack 0.3".to_vec();
    while creator_body.len() % 4 != 0 {
        creator_body.push(0);
    }

    let write_metadata = |out: &mut Vec<u8>| -> Result<(), Error> {
        write_packet(out, &set_id, TYPE_MAIN, &main_body)?;
        for source in &sources {
            write_packet(out, &set_id, TYPE_FILE_DESC, &source.desc_body)?;
            write_packet(out, &set_id, TYPE_IFSC, &source.ifsc_body)?;
        }
        write_packet(out, &set_id, TYPE_CREATOR, &creator_body)?;
        Ok(())
    };

    let mut written = Vec::new();

    let mut index_file = Vec::new();
    write_metadata(&mut index_file)?;
    fs::write(par2_path, &index_file)
        .map_err(|e| Error::io_msg(e, format!("write {}", par2_path.display())))?;
    written.push(par2_path.to_path_buf());

    if recovery_count > 0 {
        let total_blocks: usize = sources.iter().map(|s| s.block_count).sum();
        let gf = GfTables::new();
        let bases = base_values(&gf, total_blocks);

        let mut volume = Vec::new();
        let mut padded = vec![0u8; bs];
        for exponent in 0..recovery_count as u32 {
            let mut block = vec![0u8; bs + 4];
            block[..4].copy_from_slice(&exponent.to_le_bytes());
            let mut global = 0usize;
            for source in &sources {
                for index in 0..source.block_count {
                    let start = index * bs;
                    let end = (start + bs).min(source.data.len());
                    padded.fill(0);
                    padded[..end - start].copy_from_slice(&source.data[start..end]);
                    let factor = gf.pow(bases[global], exponent);
                    gf.mul_acc(&mut block[4..], &padded, factor);
                    global += 1;
                }
            }
            write_packet(&mut volume, &set_id, TYPE_RECOVERY_SLICE, &block)?;
        }
        write_metadata(&mut volume)?;

        let base = set_base_name(par2_path);
        let dir = par2_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let volume_path = dir.join(format!("{base}.vol{:02}+{:02}.par2", 0, recovery_count));
        fs::write(&volume_path, &volume)
            .map_err(|e| Error::io_msg(e, format!("write {}", volume_path.display())))?;
        written.push(volume_path);
    }

    debug!(
        "created recovery set: {} files, {} recovery blocks",
        sources.len(),
        recovery_count
    );
    Ok(written)
}

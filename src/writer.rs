mod counting_writer;
mod pack_info;
mod seq_reader;
mod source_reader;
mod unpack_info;

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    rc::Rc,
    cell::Cell,
    sync::Arc,
};

use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher;
use log::debug;

pub(crate) use counting_writer::CountingWriter;
pub use source_reader::SourceReader;

use self::{pack_info::PackInfo, seq_reader::SeqReader, unpack_info::UnpackInfo};
use crate::{
    archive::*,
    bitset::{BitSet, write_bit_set},
    coder_options::{CoderConfiguration, CoderOptions, DeltaOptions, Lzma2Options, LzmaOptions},
    encoder,
    error::Error,
    filter::{FilterArch, FilterSpec},
};

type Result<T> = std::result::Result<T, Error>;

/// The terminal compression coder of a folder chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Store bytes without compression.
    Copy,
    /// LZMA.
    Lzma,
    /// LZMA2 (the default).
    #[default]
    Lzma2,
}

/// Configuration of an [`ArchiveWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Pack all entries into one folder (`true`) or one folder per file.
    pub solid: bool,
    /// Terminal compression coder.
    pub algorithm: Algorithm,
    /// Compression level, 0-9.
    pub level: u32,
    /// Preprocessing filters in the order they are applied before the
    /// terminal coder.
    pub filters: Vec<FilterSpec>,
    /// Store the header itself inside a compressed folder.
    pub compress_header: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            solid: true,
            algorithm: Algorithm::Lzma2,
            level: 6,
            filters: Vec::new(),
            compress_header: true,
        }
    }
}

impl WriterOptions {
    /// A preset: solid LZMA2 at `level` with no filters.
    pub fn preset(level: u32) -> Self {
        Self {
            level: level.min(9),
            ..Default::default()
        }
    }
}

struct PendingEntry {
    entry: ArchiveEntry,
    data: Vec<u8>,
}

/// Writes a 7z archive file.
///
/// Entries are collected in memory and compressed into folders when
/// [`ArchiveWriter::finish`] runs, so the solid grouping policy sees the
/// whole entry set.
pub struct ArchiveWriter<W: Write + Seek> {
    output: W,
    options: WriterOptions,
    content_methods: Arc<Vec<CoderConfiguration>>,
    pending: Vec<PendingEntry>,
}

impl ArchiveWriter<File> {
    /// Creates a 7z archive file at `path`.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        let file = File::create(path.as_ref())
            .map_err(|e| Error::file_open(e, path.as_ref().to_string_lossy().to_string()))?;
        Self::new(file, options)
    }
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Prepares a writer that will emit the archive into `writer`.
    pub fn new(mut writer: W, options: WriterOptions) -> Result<Self> {
        writer.seek(SeekFrom::Start(SIGNATURE_HEADER_SIZE))?;
        let content_methods = Arc::new(Self::build_methods(&options)?);
        Ok(Self {
            output: writer,
            options,
            content_methods,
            pending: Vec::new(),
        })
    }

    /// Maps the options to the coder chain in header order: the terminal
    /// coder first, then the filters from innermost to outermost.
    fn build_methods(options: &WriterOptions) -> Result<Vec<CoderConfiguration>> {
        let mut methods = Vec::with_capacity(1 + options.filters.len());
        methods.push(match options.algorithm {
            Algorithm::Copy => CoderConfiguration::new(CoderId::COPY),
            Algorithm::Lzma => {
                LzmaOptions::from_level(options.level).into()
            }
            Algorithm::Lzma2 => {
                Lzma2Options::from_level(options.level).into()
            }
        });
        for filter in options.filters.iter().rev() {
            methods.push(match filter {
                FilterSpec::Delta { distance } => {
                    if !(1..=256).contains(distance) {
                        return Err(Error::argument("delta distance must be in 1..=256"));
                    }
                    DeltaOptions::from_distance(*distance).into()
                }
                FilterSpec::Bcj(arch) => {
                    let id = match arch {
                        FilterArch::X86 => CoderId::BCJ_X86,
                        FilterArch::Arm => CoderId::BCJ_ARM,
                        FilterArch::ArmThumb => CoderId::BCJ_ARM_THUMB,
                        FilterArch::Arm64 => CoderId::BCJ_ARM64,
                        FilterArch::Ppc => CoderId::BCJ_PPC,
                        FilterArch::Ia64 => CoderId::BCJ_IA64,
                        FilterArch::Sparc => CoderId::BCJ_SPARC,
                    };
                    CoderConfiguration::new(id)
                }
            });
        }
        Ok(methods)
    }

    /// Adds a file entry with content read from `content`.
    pub fn add_file<R: Read>(&mut self, name: &str, mut content: R) -> Result<&mut Self> {
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .map_err(|e| Error::io_msg(e, format!("read content of {name}")))?;
        self.add_entry(ArchiveEntry::new_file(name), data)
    }

    /// Adds an entry with explicit metadata and content bytes.
    pub fn add_entry(&mut self, mut entry: ArchiveEntry, data: Vec<u8>) -> Result<&mut Self> {
        entry.has_stream = !data.is_empty();
        entry.size = data.len() as u64;
        self.pending.push(PendingEntry { entry, data });
        Ok(self)
    }

    /// Adds a directory entry.
    pub fn add_directory(&mut self, name: &str) -> Result<&mut Self> {
        self.add_entry(ArchiveEntry::new_directory(name), Vec::new())
    }

    /// Adds a symlink entry pointing at `target`.
    pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<&mut Self> {
        self.add_entry(ArchiveEntry::new_symlink(name), target.as_bytes().to_vec())
    }

    /// Compresses all folders, emits the header, and patches the signature
    /// header at the front of the file.
    pub fn finish(mut self) -> Result<W> {
        let mut pack_info = PackInfo::default();
        let mut unpack_info = UnpackInfo::default();

        let stream_indices: Vec<usize> = (0..self.pending.len())
            .filter(|&i| self.pending[i].entry.has_stream)
            .collect();
        let groups: Vec<Vec<usize>> = if self.options.solid {
            if stream_indices.is_empty() {
                Vec::new()
            } else {
                vec![stream_indices]
            }
        } else {
            stream_indices.into_iter().map(|i| vec![i]).collect()
        };

        for group in &groups {
            self.write_folder(group, &mut pack_info, &mut unpack_info)?;
        }
        debug!(
            "packed {} folders from {} entries",
            groups.len(),
            self.pending.len()
        );

        let mut header: Vec<u8> = Vec::with_capacity(64 * 1024);
        if self.options.compress_header {
            self.write_compressed_header(&mut header, &pack_info, &unpack_info)?;
        } else {
            self.write_header(&mut header, &pack_info, &unpack_info)?;
        }

        let header_pos = self.output.stream_position()?;
        self.output.write_all(&header)?;
        let header_crc = crc32fast::hash(&header);

        let mut signature = [0u8; SIGNATURE_HEADER_SIZE as usize];
        {
            let mut out = signature.as_mut_slice();
            out.write_all(SEVEN_Z_SIGNATURE)?;
            out.write_u8(0)?;
            out.write_u8(4)?;
            // CRC placeholder at offset 8
            out.write_u32::<LittleEndian>(0)?;
            out.write_u64::<LittleEndian>(header_pos - SIGNATURE_HEADER_SIZE)?;
            out.write_u64::<LittleEndian>(header.len() as u64)?;
            out.write_u32::<LittleEndian>(header_crc)?;
        }
        let start_header_crc = crc32fast::hash(&signature[12..]);
        signature[8..12].copy_from_slice(&start_header_crc.to_le_bytes());

        self.output.seek(SeekFrom::Start(0))?;
        self.output.write_all(&signature)?;
        self.output.flush()?;
        Ok(self.output)
    }

    /// Runs one folder's entries through the coder chain into the pack
    /// area, recording pack/unpack bookkeeping and per-entry digests.
    fn write_folder(
        &mut self,
        group: &[usize],
        pack_info: &mut PackInfo,
        unpack_info: &mut UnpackInfo,
    ) -> Result<()> {
        let methods = Arc::clone(&self.content_methods);
        let mut more_sizes: Vec<Rc<Cell<usize>>> = Vec::with_capacity(methods.len() - 1);

        let mut compressed_len = 0usize;
        let mut compressed = Crc32CountingWriter::new(&mut self.output, &mut compressed_len);

        let sources: Vec<SourceReader<&[u8]>> = group
            .iter()
            .map(|&i| SourceReader::new(self.pending[i].data.as_slice()))
            .collect();
        let mut reader = SeqReader::new(sources);

        let (folder_crc, folder_size) = {
            let mut encoder = Self::create_writer(&methods, &mut compressed, &mut more_sizes)?;
            let mut folder_size = 0usize;
            let mut counted = Crc32CountingWriter::new(&mut encoder, &mut folder_size);
            let mut buf = [0u8; 4096];
            loop {
                let n = reader
                    .read(&mut buf)
                    .map_err(|e| Error::io_msg(e, "read folder input"))?;
                if n == 0 {
                    break;
                }
                counted
                    .write_all(&buf[..n])
                    .map_err(|e| Error::io_msg(e, "encode folder"))?;
            }
            counted.flush().map_err(|e| Error::io_msg(e, "finish folder"))?;
            let _ = counted
                .write(&[])
                .map_err(|e| Error::io_msg(e, "finish folder"))?;
            (counted.crc_value(), folder_size)
        };
        let compressed_crc = compressed.crc_value();

        let mut sub_stream_sizes = Vec::with_capacity(group.len());
        let mut sub_stream_crcs = Vec::with_capacity(group.len());
        for slot in 0..group.len() {
            let source = &reader[slot];
            sub_stream_sizes.push(source.read_count() as u64);
            sub_stream_crcs.push(source.crc_value());
        }
        for (slot, &i) in group.iter().enumerate() {
            let pending = &mut self.pending[i];
            pending.entry.size = sub_stream_sizes[slot];
            pending.entry.crc = sub_stream_crcs[slot] as u64;
            pending.entry.has_crc = true;
            pending.entry.compressed_size = compressed_len as u64;
        }

        pack_info.add_stream(compressed_len as u64, compressed_crc);

        let mut sizes = Vec::with_capacity(more_sizes.len() + 1);
        sizes.extend(more_sizes.iter().map(|s| s.get() as u64));
        sizes.push(folder_size as u64);

        if group.len() == 1 {
            unpack_info.add(methods, sizes, folder_crc);
        } else {
            unpack_info.add_multiple(methods, sizes, folder_crc, sub_stream_sizes, sub_stream_crcs);
        }
        Ok(())
    }

    fn create_writer<'a, O: Write + 'a>(
        methods: &[CoderConfiguration],
        out: O,
        more_sizes: &mut Vec<Rc<Cell<usize>>>,
    ) -> Result<Box<dyn Write + 'a>> {
        let mut encoder: Box<dyn Write> = Box::new(out);
        let mut first = true;
        for config in methods.iter() {
            let counting = CountingWriter::new(encoder);
            if !first {
                more_sizes.push(counting.counting());
            }
            encoder = Box::new(encoder::add_encoder(counting, config)?);
            first = false;
        }
        Ok(encoder)
    }

    fn write_header<H: Write>(
        &self,
        header: &mut H,
        pack_info: &PackInfo,
        unpack_info: &UnpackInfo,
    ) -> Result<()> {
        header.write_u8(K_HEADER)?;
        header.write_u8(K_MAIN_STREAMS_INFO)?;
        if pack_info.len() > 0 {
            pack_info.write_to(header)?;
            unpack_info.write_to(header)?;
            unpack_info.write_substreams(header)?;
        }
        header.write_u8(K_END)?;
        self.write_entries_info(header)?;
        header.write_u8(K_END)?;
        Ok(())
    }

    /// Compresses the header into its own single-folder pack and emits a
    /// kEncodedHeader pointing at it. Falls back to the plain header when
    /// compression does not pay.
    fn write_compressed_header<H: Write>(
        &mut self,
        header: &mut H,
        pack_info: &PackInfo,
        unpack_info: &UnpackInfo,
    ) -> Result<()> {
        let mut raw_header = Vec::with_capacity(64 * 1024);
        self.write_header(&mut raw_header, pack_info, unpack_info)?;

        let raw_size = raw_header.len() as u64;
        let raw_crc = crc32fast::hash(&raw_header);

        let methods = Arc::new(vec![CoderConfiguration::new(CoderId::LZMA)
            .with_options(CoderOptions::Lzma(LzmaOptions::from_level(self.options.level)))]);

        let mut encoded = Vec::with_capacity(raw_header.len() / 2);
        let mut compressed_len = 0usize;
        let mut more_sizes = Vec::new();
        let mut compressed = Crc32CountingWriter::new(&mut encoded, &mut compressed_len);
        {
            let mut encoder = Self::create_writer(&methods, &mut compressed, &mut more_sizes)?;
            encoder.write_all(&raw_header)?;
            encoder.flush()?;
            let _ = encoder.write(&[])?;
        }
        let compressed_crc = compressed.crc_value();

        if compressed_len as u64 + 20 >= raw_size {
            // compression made it worse, store the header as-is
            header.write_all(&raw_header)?;
            return Ok(());
        }

        let mut header_pack = PackInfo::default();
        header_pack.pos = self.output.stream_position()? - SIGNATURE_HEADER_SIZE;
        header_pack.add_stream(compressed_len as u64, compressed_crc);
        self.output.write_all(&encoded[..compressed_len])?;

        let mut header_unpack = UnpackInfo::default();
        let mut sizes = Vec::with_capacity(more_sizes.len() + 1);
        sizes.extend(more_sizes.iter().map(|s: &Rc<Cell<usize>>| s.get() as u64));
        sizes.push(raw_size);
        header_unpack.add(methods, sizes, raw_crc);

        header.write_u8(K_ENCODED_HEADER)?;
        header_pack.write_to(header)?;
        header_unpack.write_to(header)?;
        header_unpack.write_substreams(header)?;
        header.write_u8(K_END)?;
        Ok(())
    }

    fn write_entries_info<H: Write>(&self, header: &mut H) -> Result<()> {
        header.write_u8(K_FILES_INFO)?;
        write_u64(header, self.pending.len() as u64)?;
        self.write_empty_streams(header)?;
        self.write_empty_files(header)?;
        self.write_anti_items(header)?;
        self.write_names(header)?;
        self.write_ctimes(header)?;
        self.write_atimes(header)?;
        self.write_mtimes(header)?;
        self.write_windows_attributes(header)?;
        header.write_u8(K_END)?;
        Ok(())
    }

    fn write_empty_streams<H: Write>(&self, header: &mut H) -> Result<()> {
        if self.pending.iter().all(|p| p.entry.has_stream) {
            return Ok(());
        }
        header.write_u8(K_EMPTY_STREAM)?;
        let mut bits = BitSet::with_capacity(self.pending.len());
        for (i, pending) in self.pending.iter().enumerate() {
            if !pending.entry.has_stream {
                bits.insert(i);
            }
        }
        let mut temp = Vec::with_capacity(self.pending.len() / 8 + 1);
        write_bit_set(&mut temp, &bits)?;
        write_u64(header, temp.len() as u64)?;
        header.write_all(&temp)?;
        Ok(())
    }

    fn write_empty_files<H: Write>(&self, header: &mut H) -> Result<()> {
        let empty_count = self.pending.iter().filter(|p| !p.entry.has_stream).count();
        let mut has_empty_file = false;
        let mut counter = 0;
        // sized to every empty-stream entry so the bit vector length is
        // what the parser expects even when the tail bits are clear
        let mut bits = BitSet::with_capacity(empty_count);
        for pending in self.pending.iter() {
            if !pending.entry.has_stream {
                if !pending.entry.is_directory() {
                    has_empty_file = true;
                    bits.insert(counter);
                }
                counter += 1;
            }
        }
        if has_empty_file {
            header.write_u8(K_EMPTY_FILE)?;
            let mut temp = Vec::with_capacity(counter / 8 + 1);
            write_bit_set(&mut temp, &bits)?;
            write_u64(header, temp.len() as u64)?;
            header.write_all(&temp)?;
        }
        Ok(())
    }

    fn write_anti_items<H: Write>(&self, header: &mut H) -> Result<()> {
        let empty_count = self.pending.iter().filter(|p| !p.entry.has_stream).count();
        let mut has_anti = false;
        let mut counter = 0;
        let mut bits = BitSet::with_capacity(empty_count);
        for pending in self.pending.iter() {
            if !pending.entry.has_stream {
                if pending.entry.is_anti_item {
                    has_anti = true;
                    bits.insert(counter);
                }
                counter += 1;
            }
        }
        if has_anti {
            header.write_u8(K_ANTI)?;
            let mut temp = Vec::with_capacity(counter / 8 + 1);
            write_bit_set(&mut temp, &bits)?;
            write_u64(header, temp.len() as u64)?;
            header.write_all(&temp)?;
        }
        Ok(())
    }

    fn write_names<H: Write>(&self, header: &mut H) -> Result<()> {
        header.write_u8(K_NAME)?;
        let mut temp: Vec<u8> = Vec::with_capacity(128);
        temp.write_u8(0)?;
        for pending in self.pending.iter() {
            for c in pending.entry.name().encode_utf16() {
                temp.write_all(&c.to_le_bytes())?;
            }
            temp.write_all(&[0u8; 2])?;
        }
        write_u64(header, temp.len() as u64)?;
        header.write_all(&temp)?;
        Ok(())
    }

    fn write_time_property<H: Write>(
        &self,
        header: &mut H,
        nid: u8,
        has: impl Fn(&ArchiveEntry) -> bool,
        value: impl Fn(&ArchiveEntry) -> u64,
    ) -> Result<()> {
        let num = self.pending.iter().filter(|p| has(&p.entry)).count();
        if num == 0 {
            return Ok(());
        }
        header.write_u8(nid)?;
        let mut temp: Vec<u8> = Vec::with_capacity(2 + self.pending.len() * 8);
        if num != self.pending.len() {
            temp.write_u8(0)?;
            let mut defined = BitSet::with_capacity(self.pending.len());
            for (i, pending) in self.pending.iter().enumerate() {
                if has(&pending.entry) {
                    defined.insert(i);
                }
            }
            write_bit_set(&mut temp, &defined)?;
        } else {
            temp.write_u8(1)?;
        }
        temp.write_u8(0)?; // not external
        for pending in self.pending.iter() {
            if has(&pending.entry) {
                temp.write_u64::<LittleEndian>(value(&pending.entry))?;
            }
        }
        write_u64(header, temp.len() as u64)?;
        header.write_all(&temp)?;
        Ok(())
    }

    fn write_ctimes<H: Write>(&self, header: &mut H) -> Result<()> {
        self.write_time_property(
            header,
            K_C_TIME,
            |e| e.has_creation_date,
            |e| e.creation_date.into(),
        )
    }

    fn write_atimes<H: Write>(&self, header: &mut H) -> Result<()> {
        self.write_time_property(
            header,
            K_A_TIME,
            |e| e.has_access_date,
            |e| e.access_date.into(),
        )
    }

    fn write_mtimes<H: Write>(&self, header: &mut H) -> Result<()> {
        self.write_time_property(
            header,
            K_M_TIME,
            |e| e.has_last_modified_date,
            |e| e.last_modified_date.into(),
        )
    }

    fn write_windows_attributes<H: Write>(&self, header: &mut H) -> Result<()> {
        let num = self
            .pending
            .iter()
            .filter(|p| p.entry.has_windows_attributes)
            .count();
        if num == 0 {
            return Ok(());
        }
        header.write_u8(K_WIN_ATTRIBUTES)?;
        let mut temp: Vec<u8> = Vec::with_capacity(2 + self.pending.len() * 4);
        if num != self.pending.len() {
            temp.write_u8(0)?;
            let mut defined = BitSet::with_capacity(self.pending.len());
            for (i, pending) in self.pending.iter().enumerate() {
                if pending.entry.has_windows_attributes {
                    defined.insert(i);
                }
            }
            write_bit_set(&mut temp, &defined)?;
        } else {
            temp.write_u8(1)?;
        }
        temp.write_u8(0)?; // not external
        for pending in self.pending.iter() {
            if pending.entry.has_windows_attributes {
                temp.write_u32::<LittleEndian>(pending.entry.windows_attributes)?;
            }
        }
        write_u64(header, temp.len() as u64)?;
        header.write_all(&temp)?;
        Ok(())
    }
}

/// Writes the 7z variable-length UINT64.
pub(crate) fn write_u64<W: Write>(header: &mut W, mut value: u64) -> std::io::Result<()> {
    let mut first = 0;
    let mut mask = 0x80;
    let mut i = 0;
    while i < 8 {
        if value < (1u64 << (7 * (i + 1))) {
            first |= value >> (8 * i);
            break;
        }
        first |= mask;
        mask >>= 1;
        i += 1;
    }
    header.write_u8((first & 0xFF) as u8)?;
    while i > 0 {
        header.write_u8((value & 0xFF) as u8)?;
        value >>= 8;
        i -= 1;
    }
    Ok(())
}

/// Tracks the CRC-32 and byte count of everything written through it.
struct Crc32CountingWriter<'a, W> {
    writer: W,
    crc: Hasher,
    bytes_written: &'a mut usize,
}

impl<'a, W: Write> Crc32CountingWriter<'a, W> {
    fn new(writer: W, bytes_written: &'a mut usize) -> Self {
        Self {
            writer,
            crc: Hasher::new(),
            bytes_written,
        }
    }

    fn crc_value(&mut self) -> u32 {
        std::mem::replace(&mut self.crc, Hasher::new()).finalize()
    }
}

impl<W: Write> Write for Crc32CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.crc.update(&buf[..len]);
        *self.bytes_written += len;
        Ok(len)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

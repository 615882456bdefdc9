use std::{
    borrow::Cow,
    cell::RefCell,
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    rc::Rc,
};

use crc32fast::Hasher;
use log::debug;

use crate::{
    archive::*,
    bitset::BitSet,
    decoder::add_decoder,
    error::Error,
    filter::Bcj2Reader,
    folder::*,
};

/// Serves at most `max_size` bytes from the inner reader.
pub(crate) struct BoundedReader<R: Read> {
    inner: R,
    remain: usize,
}

impl<R: Read> BoundedReader<R> {
    pub(crate) fn new(inner: R, max_size: usize) -> Self {
        Self {
            inner,
            remain: max_size,
        }
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remain == 0 {
            return Ok(0);
        }
        let limit = buf.len().min(self.remain);
        let size = self.inner.read(&mut buf[..limit])?;
        self.remain -= size.min(self.remain);
        Ok(size)
    }
}

/// Restricts reads to a byte range of a seekable source, re-seeking before
/// every read so several bounded views can share one file handle.
#[derive(Clone)]
pub(crate) struct SeekableBoundedReader<R: Read + Seek> {
    inner: R,
    cur: u64,
    bounds: (u64, u64),
}

impl<R: Read + Seek> SeekableBoundedReader<R> {
    pub(crate) fn new(inner: R, bounds: (u64, u64)) -> Self {
        Self {
            inner,
            cur: bounds.0,
            bounds,
        }
    }
}

impl<R: Read + Seek> Seek for SeekableBoundedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(pos) => self.bounds.0 as i64 + pos as i64,
            SeekFrom::End(pos) => self.bounds.1 as i64 + pos,
            SeekFrom::Current(pos) => self.cur as i64 + pos,
        };
        if new_pos < 0 {
            return Err(std::io::Error::other("seek before start"));
        }
        self.cur = new_pos as u64;
        self.inner.seek(SeekFrom::Start(self.cur))
    }
}

impl<R: Read + Seek> Read for SeekableBoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cur >= self.bounds.1 {
            return Ok(0);
        }
        if self.inner.stream_position()? != self.cur {
            self.inner.seek(SeekFrom::Start(self.cur))?;
        }
        let remain = (self.bounds.1 - self.cur) as usize;
        let limit = buf.len().min(remain);
        let size = self.inner.read(&mut buf[..limit])?;
        self.cur += size as u64;
        Ok(size)
    }
}

/// Verifies a CRC-32 once the expected number of bytes has passed through.
pub(crate) struct Crc32VerifyingReader<R> {
    inner: R,
    digest: Hasher,
    expected: u64,
    remaining: i64,
    location: Cow<'static, str>,
}

impl<R: Read> Crc32VerifyingReader<R> {
    pub(crate) fn new(
        inner: R,
        remaining: usize,
        expected: u64,
        location: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            inner,
            digest: Hasher::new(),
            expected,
            remaining: remaining as i64,
            location: location.into(),
        }
    }
}

impl<R: Read> Read for Crc32VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining <= 0 {
            return Ok(0);
        }
        let size = self.inner.read(buf)?;
        if size > 0 {
            self.remaining -= size as i64;
            self.digest.update(&buf[..size]);
        }
        if self.remaining <= 0 {
            let actual = std::mem::replace(&mut self.digest, Hasher::new()).finalize();
            if actual as u64 != self.expected {
                return Err(Error::checksum(
                    self.expected as u32,
                    actual,
                    std::mem::take(&mut self.location),
                )
                .into_io());
            }
        }
        Ok(size)
    }
}

impl Archive {
    /// Opens and parses the 7z file at `path`.
    #[inline]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Archive, Error> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| Error::file_open(e, path.as_ref().to_string_lossy().to_string()))?;
        Self::read(&mut file)
    }

    /// Parses archive structure from `reader`.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Archive, Error> {
        let reader_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut signature = [0; 6];
        reader.read_exact(&mut signature).map_err(Error::from)?;
        if signature != SEVEN_Z_SIGNATURE {
            return Err(Error::BadSignature(signature));
        }
        let mut versions = [0; 2];
        reader.read_exact(&mut versions).map_err(Error::from)?;
        if versions[0] != 0 {
            return Err(Error::UnsupportedVersion {
                major: versions[0],
                minor: versions[1],
            });
        }

        let start_header_crc = read_u32(reader)?;

        let header_valid = if start_header_crc == 0 {
            let current_position = reader.stream_position()?;
            let mut buf = [0; 20];
            reader.read_exact(&mut buf).map_err(Error::from)?;
            reader.seek(SeekFrom::Start(current_position))?;
            buf.iter().any(|b| *b != 0)
        } else {
            true
        };

        if header_valid {
            let start_header = Self::read_start_header(reader, start_header_crc)?;
            Self::init_archive(reader, start_header, true)
        } else {
            Self::try_locate_end_header(reader, reader_len)
        }
    }

    fn read_start_header<R: Read>(
        reader: &mut R,
        start_header_crc: u32,
    ) -> Result<StartHeader, Error> {
        let mut buf = [0; 20];
        reader.read_exact(&mut buf).map_err(Error::from)?;
        let crc32 = crc32fast::hash(&buf);
        if crc32 != start_header_crc {
            return Err(Error::checksum(start_header_crc, crc32, "start header"));
        }
        let mut buf_read = buf.as_slice();
        let offset = read_u64le(&mut buf_read)?;
        let size = read_u64le(&mut buf_read)?;
        let crc = read_u32(&mut buf_read)?;
        Ok(StartHeader {
            next_header_offset: offset,
            next_header_size: size,
            next_header_crc: crc as u64,
        })
    }

    /// Start header zeroed out: scan the file tail for a header token and
    /// try to parse from there.
    fn try_locate_end_header<R: Read + Seek>(
        reader: &mut R,
        reader_len: u64,
    ) -> Result<Self, Error> {
        let search_limit = 1024 * 1024;
        let prev_data_size = reader.stream_position()? + 20;
        let min_pos = if reader.stream_position()? + search_limit > reader_len {
            reader.stream_position()?
        } else {
            reader_len - search_limit
        };
        let mut pos = reader_len - 1;
        while pos > min_pos {
            pos -= 1;
            reader.seek(SeekFrom::Start(pos))?;
            let nid = read_u8(reader)?;
            if nid == K_ENCODED_HEADER || nid == K_HEADER {
                let start_header = StartHeader {
                    next_header_offset: pos - prev_data_size,
                    next_header_size: reader_len - pos,
                    next_header_crc: 0,
                };
                if let Ok(result) = Self::init_archive(reader, start_header, false) {
                    if !result.entries.is_empty() {
                        return Ok(result);
                    }
                }
            }
        }
        Err(Error::corrupt(
            "start header corrupt and unable to guess end header",
        ))
    }

    fn init_archive<R: Read + Seek>(
        reader: &mut R,
        start_header: StartHeader,
        verify_crc: bool,
    ) -> Result<Self, Error> {
        if start_header.next_header_size > usize::MAX as u64 {
            return Err(Error::corrupt("next header size overflows usize"));
        }
        let next_header_size = start_header.next_header_size as usize;

        reader.seek(SeekFrom::Start(
            SIGNATURE_HEADER_SIZE + start_header.next_header_offset,
        ))?;
        let mut buf = vec![0; next_header_size];
        reader.read_exact(&mut buf).map_err(Error::from)?;
        if verify_crc {
            let actual = crc32fast::hash(&buf);
            if actual as u64 != start_header.next_header_crc {
                return Err(Error::checksum(
                    start_header.next_header_crc as u32,
                    actual,
                    "next header",
                ));
            }
        }

        let mut archive = Archive::default();
        let mut buf_reader = buf.as_slice();
        let mut nid = read_u8(&mut buf_reader)?;
        if nid == K_ENCODED_HEADER {
            let (mut decoded_reader, decoded_size) =
                Self::read_encoded_header(&mut buf_reader, reader, &mut archive)?;
            buf.clear();
            buf.resize(decoded_size, 0);
            decoded_reader.read_exact(&mut buf).map_err(Error::from)?;
            archive = Archive::default();
            buf_reader = buf.as_slice();
            nid = read_u8(&mut buf_reader)?;
        }
        let mut header = std::io::Cursor::new(buf_reader);
        if nid != K_HEADER {
            return Err(Error::corrupt("no header token in next header"));
        }
        Self::read_header(&mut header, &mut archive)?;

        archive.is_solid = archive
            .folders
            .iter()
            .any(|folder| folder.num_unpack_sub_streams > 1);

        debug!(
            "parsed archive: {} folders, {} entries, solid={}",
            archive.folders.len(),
            archive.entries.len(),
            archive.is_solid
        );

        Ok(archive)
    }

    fn read_encoded_header<'r, R: Read, RI: 'r + Read + Seek>(
        header: &mut R,
        reader: &'r mut RI,
        archive: &mut Archive,
    ) -> Result<(Box<dyn Read + 'r>, usize), Error> {
        Self::read_streams_info(header, archive)?;
        let folder = archive
            .folders
            .first()
            .ok_or(Error::corrupt("no folders, can't read encoded header"))?;
        if archive.pack_sizes.is_empty() {
            return Err(Error::corrupt("no pack streams, can't read encoded header"));
        }
        let folder_offset = SIGNATURE_HEADER_SIZE + archive.pack_pos;
        let unpack_size = folder.unpack_size() as usize;
        let pack_size = archive.pack_sizes[0] as usize;

        reader.seek(SeekFrom::Start(folder_offset))?;
        let input = SeekableBoundedReader::new(reader, (folder_offset, folder_offset + pack_size as u64));
        let mut decoder: Box<dyn Read> = Box::new(input);
        for (index, coder) in folder.ordered_coder_iter() {
            if coder.num_in_streams != 1 || coder.num_out_streams != 1 {
                return Err(Error::unsupported(
                    "multi-stream coders in the encoded header",
                ));
            }
            let next = add_decoder(
                decoder,
                folder.unpack_size_at_index(index) as usize,
                coder,
            )?;
            decoder = Box::new(next);
        }
        if folder.has_crc {
            decoder = Box::new(Crc32VerifyingReader::new(
                decoder,
                unpack_size,
                folder.crc,
                "encoded header",
            ));
        }
        Ok((decoder, unpack_size))
    }

    fn read_header<R: Read + Seek>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        if nid == K_ARCHIVE_PROPERTIES {
            Self::read_archive_properties(header)?;
            nid = read_u8(header)?;
        }
        if nid == K_ADDITIONAL_STREAMS_INFO {
            return Err(Error::unsupported("additional streams"));
        }
        if nid == K_MAIN_STREAMS_INFO {
            Self::read_streams_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid == K_FILES_INFO {
            Self::read_entries_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::corrupt(format!("badly terminated header: {nid:#04x}")));
        }
        Ok(())
    }

    fn read_archive_properties<R: Read + Seek>(header: &mut R) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        while nid != K_END {
            let property_size = read_usize(header, "property size")?;
            header.seek(SeekFrom::Current(property_size as i64))?;
            nid = read_u8(header)?;
        }
        Ok(())
    }

    fn read_streams_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let mut nid = read_u8(header)?;
        if nid == K_PACK_INFO {
            Self::read_pack_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid == K_UNPACK_INFO {
            Self::read_unpack_info(header, archive)?;
            nid = read_u8(header)?;
        } else {
            archive.folders.clear();
        }
        if nid == K_SUB_STREAMS_INFO {
            Self::read_sub_streams_info(header, archive)?;
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::corrupt(format!(
                "badly terminated streams info: {nid:#04x}"
            )));
        }
        Ok(())
    }

    fn read_pack_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        archive.pack_pos = read_u64(header)?;
        let num_pack_streams = read_usize(header, "num pack streams")?;
        let mut nid = read_u8(header)?;
        if nid == K_SIZE {
            archive.pack_sizes = vec![0u64; num_pack_streams];
            for size in archive.pack_sizes.iter_mut() {
                *size = read_u64(header)?;
            }
            nid = read_u8(header)?;
        }
        if nid == K_CRC {
            archive.pack_crcs_defined = read_all_or_bits(header, num_pack_streams)?;
            archive.pack_crcs = vec![0; num_pack_streams];
            for i in 0..num_pack_streams {
                if archive.pack_crcs_defined.contains(i) {
                    archive.pack_crcs[i] = read_u32(header)? as u64;
                }
            }
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::corrupt(format!(
                "badly terminated pack info: {nid:#04x}"
            )));
        }
        Ok(())
    }

    fn read_unpack_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let nid = read_u8(header)?;
        if nid != K_FOLDER {
            return Err(Error::corrupt(format!("expected kFolder, got {nid:#04x}")));
        }
        let num_folders = read_usize(header, "num folders")?;
        archive.folders.reserve_exact(num_folders);
        let external = read_u8(header)?;
        if external != 0 {
            return Err(Error::unsupported("external unpack info"));
        }
        for _ in 0..num_folders {
            archive.folders.push(Self::read_folder(header)?);
        }

        let nid = read_u8(header)?;
        if nid != K_CODERS_UNPACK_SIZE {
            return Err(Error::corrupt(format!(
                "expected kCodersUnpackSize, got {nid:#04x}"
            )));
        }
        for folder in archive.folders.iter_mut() {
            let total = folder.total_output_streams;
            folder.unpack_sizes.reserve_exact(total);
            for _ in 0..total {
                folder.unpack_sizes.push(read_u64(header)?);
            }
        }

        let mut nid = read_u8(header)?;
        if nid == K_CRC {
            let crcs_defined = read_all_or_bits(header, num_folders)?;
            for i in 0..num_folders {
                if crcs_defined.contains(i) {
                    archive.folders[i].has_crc = true;
                    archive.folders[i].crc = read_u32(header)? as u64;
                } else {
                    archive.folders[i].has_crc = false;
                }
            }
            nid = read_u8(header)?;
        }
        if nid != K_END {
            return Err(Error::corrupt("badly terminated unpack info"));
        }
        Ok(())
    }

    fn read_folder<R: Read>(header: &mut R) -> Result<Folder, Error> {
        let mut folder = Folder::default();

        let num_coders = read_usize(header, "num coders")?;
        let mut coders = Vec::with_capacity(num_coders);
        let mut total_in_streams = 0;
        let mut total_out_streams = 0;
        for _ in 0..num_coders {
            let mut coder = Coder::default();
            let bits = read_u8(header)?;
            let id_size = bits & 0xF;
            let is_simple = (bits & 0x10) == 0;
            let has_attributes = (bits & 0x20) != 0;
            let more_alternative_methods = (bits & 0x80) != 0;
            if more_alternative_methods {
                return Err(Error::unsupported("alternative coder methods"));
            }

            coder.id_size = id_size as usize;
            header.read_exact(coder.method_id_mut()).map_err(Error::from)?;
            if is_simple {
                coder.num_in_streams = 1;
                coder.num_out_streams = 1;
            } else {
                coder.num_in_streams = read_u64(header)?;
                coder.num_out_streams = read_u64(header)?;
            }
            total_in_streams += coder.num_in_streams;
            total_out_streams += coder.num_out_streams;
            if has_attributes {
                let properties_size = read_usize(header, "properties size")?;
                let mut props = vec![0u8; properties_size];
                header.read_exact(&mut props).map_err(Error::from)?;
                coder.properties = props;
            }
            coders.push(coder);
        }
        folder.coders = coders;
        let total_in_streams = assert_usize(total_in_streams, "total in streams")?;
        let total_out_streams = assert_usize(total_out_streams, "total out streams")?;
        folder.total_input_streams = total_in_streams;
        folder.total_output_streams = total_out_streams;

        if total_out_streams == 0 {
            return Err(Error::corrupt("folder without output streams"));
        }
        let num_bind_pairs = total_out_streams - 1;
        let mut bind_pairs = Vec::with_capacity(num_bind_pairs);
        for _ in 0..num_bind_pairs {
            bind_pairs.push(BindPair {
                in_index: read_u64(header)?,
                out_index: read_u64(header)?,
            });
        }
        folder.bind_pairs = bind_pairs;

        if total_in_streams < num_bind_pairs {
            return Err(Error::corrupt(
                "folder with fewer input streams than bind pairs",
            ));
        }
        let num_packed_streams = total_in_streams - num_bind_pairs;
        let mut packed_streams = vec![0; num_packed_streams];
        if num_packed_streams == 1 {
            let index = (0..total_in_streams)
                .find(|&i| folder.find_bind_pair_for_in_stream(i).is_none())
                .ok_or_else(|| Error::corrupt("couldn't find the unbound input stream"))?;
            packed_streams[0] = index as u64;
        } else {
            for packed_stream in packed_streams.iter_mut() {
                *packed_stream = read_u64(header)?;
            }
        }
        folder.packed_streams = packed_streams;

        Ok(folder)
    }

    fn read_sub_streams_info<R: Read>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        for folder in archive.folders.iter_mut() {
            folder.num_unpack_sub_streams = 1;
        }
        let mut total_unpack_streams = archive.folders.len();

        let mut nid = read_u8(header)?;
        if nid == K_NUM_UNPACK_STREAM {
            total_unpack_streams = 0;
            for folder in archive.folders.iter_mut() {
                let num_streams = read_usize(header, "num unpack substreams")?;
                folder.num_unpack_sub_streams = num_streams;
                total_unpack_streams += num_streams;
            }
            nid = read_u8(header)?;
        }

        let mut info = SubStreamsInfo::default();
        info.unpack_sizes.resize(total_unpack_streams, 0);
        info.crcs = vec![0; total_unpack_streams];

        let mut next_unpack_stream = 0;
        for folder in archive.folders.iter() {
            if folder.num_unpack_sub_streams == 0 {
                continue;
            }
            let mut sum = 0;
            if nid == K_SIZE {
                for _ in 0..folder.num_unpack_sub_streams - 1 {
                    let size = read_u64(header)?;
                    info.unpack_sizes[next_unpack_stream] = size;
                    next_unpack_stream += 1;
                    sum += size;
                }
            }
            if sum > folder.unpack_size() {
                return Err(Error::corrupt(
                    "substream sizes exceed the folder unpack size",
                ));
            }
            info.unpack_sizes[next_unpack_stream] = folder.unpack_size() - sum;
            next_unpack_stream += 1;
        }
        if nid == K_SIZE {
            nid = read_u8(header)?;
        }

        let mut num_digests = 0;
        for folder in archive.folders.iter() {
            if folder.num_unpack_sub_streams != 1 || !folder.has_crc {
                num_digests += folder.num_unpack_sub_streams;
            }
        }

        if nid == K_CRC {
            let digests_defined = read_all_or_bits(header, num_digests)?;
            let mut digests = vec![0u64; num_digests];
            for (i, digest) in digests.iter_mut().enumerate() {
                if digests_defined.contains(i) {
                    *digest = read_u32(header)? as u64;
                }
            }
            let mut next_crc = 0;
            let mut next_digest = 0;
            for folder in archive.folders.iter() {
                if folder.num_unpack_sub_streams == 1 && folder.has_crc {
                    info.has_crc.insert(next_crc);
                    info.crcs[next_crc] = folder.crc;
                    next_crc += 1;
                } else {
                    for _ in 0..folder.num_unpack_sub_streams {
                        if digests_defined.contains(next_digest) {
                            info.has_crc.insert(next_crc);
                        } else {
                            info.has_crc.remove(next_crc);
                        }
                        info.crcs[next_crc] = digests[next_digest];
                        next_crc += 1;
                        next_digest += 1;
                    }
                }
            }
            nid = read_u8(header)?;
        }

        if nid != K_END {
            return Err(Error::corrupt("badly terminated substreams info"));
        }
        archive.sub_streams_info = Some(info);
        Ok(())
    }

    fn read_entries_info<R: Read + Seek>(header: &mut R, archive: &mut Archive) -> Result<(), Error> {
        let num_entries = read_usize(header, "num entries")?;
        let mut entries: Vec<ArchiveEntry> = vec![Default::default(); num_entries];

        let mut is_empty_stream: Option<BitSet> = None;
        let mut is_empty_file: Option<BitSet> = None;
        let mut is_anti: Option<BitSet> = None;
        loop {
            let prop_type = read_u8(header)?;
            if prop_type == K_END {
                break;
            }
            let size = read_u64(header)?;
            match prop_type {
                K_EMPTY_STREAM => {
                    is_empty_stream = Some(read_bits(header, num_entries)?);
                }
                K_EMPTY_FILE => {
                    // one bit per empty-stream entry
                    let n = is_empty_stream
                        .as_ref()
                        .ok_or_else(|| {
                            Error::corrupt("kEmptyStream must appear before kEmptyFile")
                        })?
                        .len();
                    is_empty_file = Some(read_bits(header, n)?);
                }
                K_ANTI => {
                    let n = is_empty_stream
                        .as_ref()
                        .ok_or_else(|| Error::corrupt("kEmptyStream must appear before kAnti"))?
                        .len();
                    is_anti = Some(read_bits(header, n)?);
                }
                K_NAME => {
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::unsupported("external names"));
                    }
                    if (size - 1) & 1 != 0 {
                        return Err(Error::corrupt("odd file names length"));
                    }
                    let size = assert_usize(size, "file names length")?;
                    let names_reader = NamesReader::new(header, size - 1);
                    let mut next_entry = 0;
                    for name in names_reader {
                        entries[next_entry].name = name?;
                        next_entry += 1;
                    }
                    if next_entry != entries.len() {
                        return Err(Error::corrupt("wrong number of file names"));
                    }
                }
                K_C_TIME => {
                    let defined = read_all_or_bits(header, num_entries)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::unsupported("external kCTime"));
                    }
                    for (i, entry) in entries.iter_mut().enumerate() {
                        entry.has_creation_date = defined.contains(i);
                        if entry.has_creation_date {
                            entry.creation_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_A_TIME => {
                    let defined = read_all_or_bits(header, num_entries)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::unsupported("external kATime"));
                    }
                    for (i, entry) in entries.iter_mut().enumerate() {
                        entry.has_access_date = defined.contains(i);
                        if entry.has_access_date {
                            entry.access_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_M_TIME => {
                    let defined = read_all_or_bits(header, num_entries)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::unsupported("external kMTime"));
                    }
                    for (i, entry) in entries.iter_mut().enumerate() {
                        entry.has_last_modified_date = defined.contains(i);
                        if entry.has_last_modified_date {
                            entry.last_modified_date = read_u64le(header)?.into();
                        }
                    }
                }
                K_WIN_ATTRIBUTES => {
                    let defined = read_all_or_bits(header, num_entries)?;
                    let external = read_u8(header)?;
                    if external != 0 {
                        return Err(Error::unsupported("external kWinAttributes"));
                    }
                    for (i, entry) in entries.iter_mut().enumerate() {
                        entry.has_windows_attributes = defined.contains(i);
                        if entry.has_windows_attributes {
                            entry.windows_attributes = read_u32(header)?;
                        }
                    }
                }
                K_START_POS => return Err(Error::unsupported("kStartPos")),
                K_DUMMY => {
                    header.seek(SeekFrom::Current(size as i64))?;
                }
                _ => {
                    header.seek(SeekFrom::Current(size as i64))?;
                }
            }
        }

        let mut non_empty_counter = 0;
        let mut empty_counter = 0;
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.has_stream = is_empty_stream
                .as_ref()
                .map(|s| !s.contains(i))
                .unwrap_or(true);
            if entry.has_stream {
                let info = archive.sub_streams_info.as_ref().ok_or_else(|| {
                    Error::corrupt("entry has a stream but there is no substreams info")
                })?;
                if non_empty_counter >= info.unpack_sizes.len() {
                    return Err(Error::corrupt("more stream entries than substreams"));
                }
                entry.is_directory = false;
                entry.is_anti_item = false;
                entry.has_crc = info.has_crc.contains(non_empty_counter);
                entry.crc = info.crcs[non_empty_counter];
                entry.size = info.unpack_sizes[non_empty_counter];
                non_empty_counter += 1;
            } else {
                entry.is_directory = match &is_empty_file {
                    Some(s) => !s.contains(empty_counter),
                    None => true,
                };
                entry.is_anti_item = is_anti
                    .as_ref()
                    .map(|s| s.contains(empty_counter))
                    .unwrap_or(false);
                entry.has_crc = false;
                entry.size = 0;
                empty_counter += 1;
            }
        }
        archive.entries = entries;

        Self::calculate_stream_map(archive)
    }

    fn calculate_stream_map(archive: &mut Archive) -> Result<(), Error> {
        let mut stream_map = StreamMap::default();

        let num_folders = archive.folders.len();
        let mut next_pack_stream_index = 0;
        stream_map.folder_first_pack_stream_index = vec![0; num_folders];
        for i in 0..num_folders {
            stream_map.folder_first_pack_stream_index[i] = next_pack_stream_index;
            next_pack_stream_index += archive.folders[i].packed_streams.len();
        }

        let num_pack_sizes = archive.pack_sizes.len();
        let mut next_pack_offset = 0;
        stream_map.pack_stream_offsets = vec![0; num_pack_sizes];
        for i in 0..num_pack_sizes {
            stream_map.pack_stream_offsets[i] = next_pack_offset;
            next_pack_offset += archive.pack_sizes[i];
        }

        stream_map.folder_first_entry_index = vec![0; num_folders];
        stream_map.entry_folder_index = vec![None; archive.entries.len()];
        let mut next_folder_index = 0;
        let mut next_substream_index = 0;
        for i in 0..archive.entries.len() {
            if !archive.entries[i].has_stream && next_substream_index == 0 {
                stream_map.entry_folder_index[i] = None;
                continue;
            }
            if next_substream_index == 0 {
                while next_folder_index < archive.folders.len() {
                    stream_map.folder_first_entry_index[next_folder_index] = i;
                    if archive.folders[next_folder_index].num_unpack_sub_streams > 0 {
                        break;
                    }
                    next_folder_index += 1;
                }
                if next_folder_index >= archive.folders.len() {
                    return Err(Error::corrupt("too few folders in archive"));
                }
            }
            stream_map.entry_folder_index[i] = Some(next_folder_index);
            if !archive.entries[i].has_stream {
                continue;
            }

            if stream_map.folder_first_entry_index[next_folder_index] == i {
                let first_pack_stream =
                    stream_map.folder_first_pack_stream_index[next_folder_index];
                archive.entries[i].compressed_size = archive.pack_sizes[first_pack_stream];
            }

            next_substream_index += 1;
            if next_substream_index >= archive.folders[next_folder_index].num_unpack_sub_streams {
                next_folder_index += 1;
                next_substream_index = 0;
            }
        }

        archive.stream_map = stream_map;
        Ok(())
    }
}

#[inline]
fn read_usize<R: Read>(reader: &mut R, field: &str) -> Result<usize, Error> {
    let size = read_u64(reader)?;
    assert_usize(size, field)
}

#[inline]
fn assert_usize(size: u64, field: &str) -> Result<usize, Error> {
    if size > usize::MAX as u64 {
        return Err(Error::corrupt(format!("cannot handle {field} {size}")));
    }
    Ok(size as usize)
}

#[inline]
fn read_u64le<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u64::from_le_bytes(buf))
}

/// The 7z variable-length UINT64: the first byte's high bits select how
/// many extra little-endian bytes follow.
pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let first = read_u8(reader)? as u64;
    let mut mask = 0x80_u64;
    let mut value = 0;
    for i in 0..8 {
        if (first & mask) == 0 {
            return Ok(value | ((first & (mask - 1)) << (8 * i)));
        }
        let b = read_u8(reader)? as u64;
        value |= b << (8 * i);
        mask >>= 1;
    }
    Ok(value)
}

#[inline(always)]
fn read_u32<R: Read>(reader: &mut R) -> Result<u32, Error> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf).map_err(Error::from)?;
    Ok(u32::from_le_bytes(buf))
}

#[inline(always)]
fn read_u8<R: Read>(reader: &mut R) -> Result<u8, Error> {
    let mut buf = [0];
    reader.read_exact(&mut buf).map_err(Error::from)?;
    Ok(buf[0])
}

fn read_all_or_bits<R: Read>(header: &mut R, size: usize) -> Result<BitSet, Error> {
    let all = read_u8(header)?;
    if all != 0 {
        let mut bits = BitSet::with_capacity(size);
        for i in 0..size {
            bits.insert(i);
        }
        Ok(bits)
    } else {
        read_bits(header, size)
    }
}

fn read_bits<R: Read>(header: &mut R, size: usize) -> Result<BitSet, Error> {
    let mut bits = BitSet::with_capacity(size);
    let mut mask = 0u32;
    let mut cache = 0u32;
    for i in 0..size {
        if mask == 0 {
            mask = 0x80;
            cache = read_u8(header)? as u32;
        }
        if (cache & mask) != 0 {
            bits.insert(i);
        }
        mask >>= 1;
    }
    Ok(bits)
}

/// Reads the zero-terminated UTF-16LE name list.
struct NamesReader<'a, R: Read> {
    max_bytes: usize,
    read_bytes: usize,
    cache: Vec<u16>,
    reader: &'a mut R,
}

impl<'a, R: Read> NamesReader<'a, R> {
    fn new(reader: &'a mut R, max_bytes: usize) -> Self {
        Self {
            max_bytes,
            reader,
            read_bytes: 0,
            cache: Vec::with_capacity(16),
        }
    }
}

impl<R: Read> Iterator for NamesReader<'_, R> {
    type Item = Result<String, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_bytes <= self.read_bytes {
            return None;
        }
        self.cache.clear();
        let mut buf = [0; 2];
        while self.read_bytes < self.max_bytes {
            let r = self.reader.read_exact(&mut buf).map_err(Error::from);
            self.read_bytes += 2;
            if let Err(e) = r {
                return Some(Err(e));
            }
            let u = u16::from_le_bytes(buf);
            if u == 0 {
                break;
            }
            self.cache.push(u);
        }
        Some(String::from_utf16(&self.cache).map_err(|e| Error::corrupt(e.to_string())))
    }
}

#[derive(Copy, Clone, Debug)]
struct IndexEntry {
    folder_index: Option<usize>,
    entry_index: usize,
}

/// Reads a 7z archive: entry listing and extraction.
#[derive(Debug)]
pub struct ArchiveReader<R: Read + Seek> {
    source: R,
    archive: Archive,
    index: HashMap<String, IndexEntry>,
}

impl ArchiveReader<File> {
    /// Opens the 7z archive file at `path`.
    #[inline]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::file_open(e, path.as_ref().to_string_lossy().to_string()))?;
        Self::new(file)
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Parses the archive structure from `source` and builds the name index.
    pub fn new(mut source: R) -> Result<Self, Error> {
        let archive = Archive::read(&mut source)?;
        let mut index = HashMap::with_capacity(archive.entries.len());
        for (entry_index, entry) in archive.entries.iter().enumerate() {
            index.insert(
                entry.name.clone(),
                IndexEntry {
                    folder_index: archive.stream_map.entry_folder_index[entry_index],
                    entry_index,
                },
            );
        }
        Ok(Self {
            source,
            archive,
            index,
        })
    }

    /// Returns the parsed archive model.
    #[inline]
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Iterates entries in archive order without decoding any bytes.
    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.archive.entries.iter()
    }

    fn build_decode_stack<'r>(
        source: &'r mut R,
        archive: &Archive,
        folder_index: usize,
    ) -> Result<Box<dyn Read + 'r>, Error> {
        let folder = &archive.folders[folder_index];
        if folder.total_input_streams > folder.total_output_streams {
            return Self::build_multi_stream_decode_stack(source, archive, folder_index);
        }
        let first_pack_stream = archive.stream_map.folder_first_pack_stream_index[folder_index];
        let folder_offset = SIGNATURE_HEADER_SIZE
            + archive.pack_pos
            + archive.stream_map.pack_stream_offsets[first_pack_stream];
        let pack_size = archive.pack_sizes[first_pack_stream] as usize;

        source.seek(SeekFrom::Start(folder_offset))?;
        let mut decoder: Box<dyn Read> = Box::new(BoundedReader::new(source, pack_size));
        for (index, coder) in folder.ordered_coder_iter() {
            if coder.num_in_streams != 1 || coder.num_out_streams != 1 {
                return Err(Error::unsupported(
                    "unexpected multi-stream coder in a linear folder",
                ));
            }
            let next = add_decoder(decoder, folder.unpack_size_at_index(index) as usize, coder)?;
            decoder = Box::new(next);
        }
        if folder.has_crc {
            decoder = Box::new(Crc32VerifyingReader::new(
                decoder,
                folder.unpack_size() as usize,
                folder.crc,
                format!("folder {folder_index}"),
            ));
        }
        Ok(decoder)
    }

    /// BCJ2 folders: the only branching coder. Its four bound inputs are
    /// resolved recursively and handed to the 4-stream reader.
    fn build_multi_stream_decode_stack<'r>(
        source: &'r mut R,
        archive: &Archive,
        folder_index: usize,
    ) -> Result<Box<dyn Read + 'r>, Error> {
        const MAX_CODER_COUNT: usize = 32;
        let folder = &archive.folders[folder_index];
        if folder.coders.len() > MAX_CODER_COUNT {
            return Err(Error::unsupported(format!(
                "too many coders: {}",
                folder.coders.len()
            )));
        }
        let source = ReaderPointer::new(source);
        let first_pack_stream = archive.stream_map.folder_first_pack_stream_index[folder_index];
        let start_pos = SIGNATURE_HEADER_SIZE + archive.pack_pos;
        let offsets = &archive.stream_map.pack_stream_offsets[first_pack_stream..];

        let mut pack_sources = Vec::with_capacity(folder.packed_streams.len());
        for (i, offset) in offsets[..folder.packed_streams.len()].iter().enumerate() {
            let pack_pos = start_pos + offset;
            let pack_size = archive.pack_sizes[first_pack_stream + i];
            pack_sources.push(SeekableBoundedReader::new(
                source.clone(),
                (pack_pos, pack_pos + pack_size),
            ));
        }

        let mut coder_to_stream_map = [usize::MAX; MAX_CODER_COUNT];
        let mut stream_index = 0;
        for (i, coder) in folder.coders.iter().enumerate() {
            coder_to_stream_map[i] = stream_index;
            stream_index += coder.num_in_streams as usize;
        }

        let main_coder_index = {
            let mut coder_used = [false; MAX_CODER_COUNT];
            for bp in folder.bind_pairs.iter() {
                coder_used[bp.out_index as usize] = true;
            }
            coder_used[..folder.coders.len()]
                .iter()
                .position(|used| !used)
                .unwrap_or(0)
        };

        let main_coder = &folder.coders[main_coder_index];
        if main_coder.method_id() != CoderId::ID_BCJ2 {
            return Err(Error::UnsupportedCoder(main_coder.method_id().to_vec()));
        }

        let num_in_streams = main_coder.num_in_streams as usize;
        let start = coder_to_stream_map[main_coder_index];
        let mut inputs: Vec<Box<dyn Read + 'r>> = Vec::with_capacity(num_in_streams);
        for i in start..start + num_in_streams {
            inputs.push(Self::input_stream(
                folder,
                &pack_sources,
                &coder_to_stream_map,
                i,
            )?);
        }
        let mut decoder: Box<dyn Read> =
            Box::new(Bcj2Reader::new(inputs, folder.unpack_size())?);
        if folder.has_crc {
            decoder = Box::new(Crc32VerifyingReader::new(
                decoder,
                folder.unpack_size() as usize,
                folder.crc,
                format!("folder {folder_index}"),
            ));
        }
        Ok(decoder)
    }

    fn input_stream<'r>(
        folder: &Folder,
        pack_sources: &[SeekableBoundedReader<ReaderPointer<'r, R>>],
        coder_to_stream_map: &[usize],
        in_stream_index: usize,
    ) -> Result<Box<dyn Read + 'r>, Error>
    where
        R: 'r,
    {
        if let Some(index) = folder
            .packed_streams
            .iter()
            .position(|&i| i == in_stream_index as u64)
        {
            return Ok(Box::new(pack_sources[index].clone()));
        }

        let bp = folder
            .find_bind_pair_for_in_stream(in_stream_index)
            .ok_or_else(|| {
                Error::corrupt(format!("no bind pair for stream {in_stream_index}"))
            })?;
        let coder_index = folder.bind_pairs[bp].out_index as usize;
        let coder = &folder.coders[coder_index];
        if coder.num_in_streams != 1 {
            return Err(Error::unsupported("nested multi-input coders"));
        }
        let start_index = coder_to_stream_map[coder_index];
        if start_index == usize::MAX {
            return Err(Error::corrupt("coder stream index out of range"));
        }
        let input = Self::input_stream(folder, pack_sources, coder_to_stream_map, start_index)?;
        let decoder = add_decoder(
            input,
            folder.unpack_sizes[coder_index] as usize,
            coder,
        )?;
        Ok(Box::new(decoder))
    }

    /// Runs `each` over every entry, streaming decoded content.
    ///
    /// Solid folders decode front to back; the closure returning `false`
    /// stops the walk.
    pub fn for_each_entries<F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<bool, Error>>(
        &mut self,
        mut each: F,
    ) -> Result<(), Error> {
        for folder_index in 0..self.archive.folders.len() {
            let decoder = FolderDecoder::new(folder_index, &self.archive, &mut self.source);
            if !decoder.for_each_entries(&mut each)? {
                return Ok(());
            }
        }
        for entry_index in 0..self.archive.entries.len() {
            if self.archive.stream_map.entry_folder_index[entry_index].is_none() {
                let entry = &self.archive.entries[entry_index];
                let empty: &mut dyn Read = &mut ([0u8; 0].as_slice());
                if !each(entry, empty)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Decodes the entry called `name` into `sink`, verifying its CRC-32.
    ///
    /// In a solid folder everything in front of the entry is decoded and
    /// discarded first.
    pub fn extract<W: Write>(&mut self, name: &str, sink: &mut W) -> Result<(), Error> {
        let index_entry = *self.index.get(name).ok_or_else(|| {
            Error::argument(format!("no entry named {name}"))
        })?;
        let entry = &self.archive.entries[index_entry.entry_index];
        if !entry.has_stream || entry.size == 0 {
            return Ok(());
        }
        let folder_index = index_entry
            .folder_index
            .ok_or_else(|| Error::corrupt("entry has a stream but no folder"))?;

        // Byte offset of this entry inside the folder's decoded output.
        let first = self.archive.stream_map.folder_first_entry_index[folder_index];
        let offset: u64 = self.archive.entries[first..index_entry.entry_index]
            .iter()
            .map(|e| e.size)
            .sum();

        let mut folder_reader =
            Self::build_decode_stack(&mut self.source, &self.archive, folder_index)?;
        skip_fully(&mut folder_reader, offset)?;

        let mut decoder: Box<dyn Read> =
            Box::new(BoundedReader::new(&mut folder_reader, entry.size as usize));
        if entry.has_crc {
            decoder = Box::new(Crc32VerifyingReader::new(
                decoder,
                entry.size as usize,
                entry.crc,
                entry.name.clone(),
            ));
        }
        std::io::copy(&mut decoder, sink).map_err(Error::from)?;
        Ok(())
    }

    /// Returns the decoded content of the entry called `name`.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let size = self
            .index
            .get(name)
            .map(|ie| self.archive.entries[ie.entry_index].size as usize)
            .unwrap_or(0);
        let mut data = Vec::with_capacity(size);
        self.extract(name, &mut data)?;
        Ok(data)
    }
}

fn skip_fully<R: Read + ?Sized>(reader: &mut R, mut count: u64) -> Result<(), Error> {
    let mut scratch = [0u8; 8192];
    while count > 0 {
        let limit = scratch.len().min(count as usize);
        let n = reader.read(&mut scratch[..limit]).map_err(Error::from)?;
        if n == 0 {
            return Err(Error::UnexpectedEof);
        }
        count -= n as u64;
    }
    Ok(())
}

/// Decodes the entries of one folder in order.
pub struct FolderDecoder<'a, R: Read + Seek> {
    folder_index: usize,
    archive: &'a Archive,
    source: &'a mut R,
}

impl<'a, R: Read + Seek> FolderDecoder<'a, R> {
    /// Creates a decoder for `folder_index`.
    pub fn new(folder_index: usize, archive: &'a Archive, source: &'a mut R) -> Self {
        Self {
            folder_index,
            archive,
            source,
        }
    }

    /// Entries stored in this folder, in decode order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        let start = self.archive.stream_map.folder_first_entry_index[self.folder_index];
        let count = self.archive.folders[self.folder_index].num_unpack_sub_streams;
        &self.archive.entries[start..start + count]
    }

    /// Streams each entry of this folder through `each`; returns `false`
    /// when the closure stopped the walk.
    pub fn for_each_entries<F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<bool, Error>>(
        self,
        each: &mut F,
    ) -> Result<bool, Error> {
        let Self {
            folder_index,
            archive,
            source,
        } = self;
        let mut folder_reader =
            ArchiveReader::build_decode_stack(source, archive, folder_index)?;
        let start = archive.stream_map.folder_first_entry_index[folder_index];
        let count = archive.folders[folder_index].num_unpack_sub_streams;

        for entry_index in start..start + count {
            let entry = &archive.entries[entry_index];
            if entry.has_stream && entry.size > 0 {
                let mut decoder: Box<dyn Read> =
                    Box::new(BoundedReader::new(&mut folder_reader, entry.size as usize));
                if entry.has_crc {
                    decoder = Box::new(Crc32VerifyingReader::new(
                        decoder,
                        entry.size as usize,
                        entry.crc,
                        entry.name.clone(),
                    ));
                }
                if !each(entry, &mut decoder)? {
                    return Ok(false);
                }
            } else {
                let empty: &mut dyn Read = &mut ([0u8; 0].as_slice());
                if !each(entry, empty)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Shares one `&mut R` between several bounded views.
#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct ReaderPointer<'a, R>(Rc<RefCell<&'a mut R>>);

impl<R> Clone for ReaderPointer<'_, R> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<'a, R> ReaderPointer<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        Self(Rc::new(RefCell::new(reader)))
    }
}

impl<R: Read> Read for ReaderPointer<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl<R: Seek> Seek for ReaderPointer<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

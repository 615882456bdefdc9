use crate::{NtTime, bitset::BitSet, folder::*};

pub(crate) const SIGNATURE_HEADER_SIZE: u64 = 32;
pub(crate) const SEVEN_Z_SIGNATURE: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

pub(crate) const K_END: u8 = 0x00;
pub(crate) const K_HEADER: u8 = 0x01;
pub(crate) const K_ARCHIVE_PROPERTIES: u8 = 0x02;
pub(crate) const K_ADDITIONAL_STREAMS_INFO: u8 = 0x03;
pub(crate) const K_MAIN_STREAMS_INFO: u8 = 0x04;
pub(crate) const K_FILES_INFO: u8 = 0x05;
pub(crate) const K_PACK_INFO: u8 = 0x06;
pub(crate) const K_UNPACK_INFO: u8 = 0x07;
pub(crate) const K_SUB_STREAMS_INFO: u8 = 0x08;
pub(crate) const K_SIZE: u8 = 0x09;
pub(crate) const K_CRC: u8 = 0x0A;
pub(crate) const K_FOLDER: u8 = 0x0B;
pub(crate) const K_CODERS_UNPACK_SIZE: u8 = 0x0C;
pub(crate) const K_NUM_UNPACK_STREAM: u8 = 0x0D;
pub(crate) const K_EMPTY_STREAM: u8 = 0x0E;
pub(crate) const K_EMPTY_FILE: u8 = 0x0F;
pub(crate) const K_ANTI: u8 = 0x10;
pub(crate) const K_NAME: u8 = 0x11;
pub(crate) const K_C_TIME: u8 = 0x12;
pub(crate) const K_A_TIME: u8 = 0x13;
pub(crate) const K_M_TIME: u8 = 0x14;
pub(crate) const K_WIN_ATTRIBUTES: u8 = 0x15;
#[allow(unused)]
pub(crate) const K_COMMENT: u8 = 0x16;
pub(crate) const K_ENCODED_HEADER: u8 = 0x17;
pub(crate) const K_START_POS: u8 = 0x18;
pub(crate) const K_DUMMY: u8 = 0x19;

/// `FILE_ATTRIBUTE_REPARSE_POINT`: marks symlink entries.
pub(crate) const ATTRIBUTE_SYMLINK: u32 = 0x400;
/// `FILE_ATTRIBUTE_DIRECTORY`.
pub(crate) const ATTRIBUTE_DIRECTORY: u32 = 0x10;
/// Set when the high 16 attribute bits carry a Unix mode.
pub(crate) const ATTRIBUTE_UNIX_EXTENSION: u32 = 0x8000;

/// A coder's variable-length method id plus a display name.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Hash)]
pub struct CoderId(&'static str, &'static [u8]);

impl CoderId {
    /// Method id for COPY (no compression).
    pub const ID_COPY: &'static [u8] = &[0x00];
    /// Method id for the Delta filter.
    pub const ID_DELTA: &'static [u8] = &[0x03];
    /// Method id for LZMA compression.
    pub const ID_LZMA: &'static [u8] = &[0x03, 0x01, 0x01];
    /// Method id for LZMA2 compression.
    pub const ID_LZMA2: &'static [u8] = &[0x21];
    /// Method id for the BCJ x86 filter.
    pub const ID_BCJ_X86: &'static [u8] = &[0x03, 0x03, 0x01, 0x03];
    /// Method id for the BCJ2 x86 filter.
    pub const ID_BCJ2: &'static [u8] = &[0x03, 0x03, 0x01, 0x1B];
    /// Method id for the BCJ PowerPC filter.
    pub const ID_BCJ_PPC: &'static [u8] = &[0x03, 0x03, 0x02, 0x05];
    /// Method id for the BCJ IA-64 filter.
    pub const ID_BCJ_IA64: &'static [u8] = &[0x03, 0x03, 0x04, 0x01];
    /// Method id for the BCJ ARM filter.
    pub const ID_BCJ_ARM: &'static [u8] = &[0x03, 0x03, 0x05, 0x01];
    /// Method id for the BCJ ARM64 filter.
    pub const ID_BCJ_ARM64: &'static [u8] = &[0x03, 0x03, 0x06, 0x01];
    /// Method id for the BCJ ARM Thumb filter.
    pub const ID_BCJ_ARM_THUMB: &'static [u8] = &[0x03, 0x03, 0x07, 0x01];
    /// Method id for the BCJ SPARC filter.
    pub const ID_BCJ_SPARC: &'static [u8] = &[0x03, 0x03, 0x08, 0x05];

    /// COPY coder (no compression).
    pub const COPY: Self = Self("COPY", Self::ID_COPY);
    /// Delta filter coder.
    pub const DELTA: Self = Self("DELTA", Self::ID_DELTA);
    /// LZMA compression coder.
    pub const LZMA: Self = Self("LZMA", Self::ID_LZMA);
    /// LZMA2 compression coder.
    pub const LZMA2: Self = Self("LZMA2", Self::ID_LZMA2);
    /// BCJ x86 filter coder.
    pub const BCJ_X86: Self = Self("BCJ_X86", Self::ID_BCJ_X86);
    /// BCJ2 x86 filter coder (decode only).
    pub const BCJ2: Self = Self("BCJ2", Self::ID_BCJ2);
    /// BCJ PowerPC filter coder.
    pub const BCJ_PPC: Self = Self("BCJ_PPC", Self::ID_BCJ_PPC);
    /// BCJ IA-64 filter coder.
    pub const BCJ_IA64: Self = Self("BCJ_IA64", Self::ID_BCJ_IA64);
    /// BCJ ARM filter coder.
    pub const BCJ_ARM: Self = Self("BCJ_ARM", Self::ID_BCJ_ARM);
    /// BCJ ARM64 filter coder.
    pub const BCJ_ARM64: Self = Self("BCJ_ARM64", Self::ID_BCJ_ARM64);
    /// BCJ ARM Thumb filter coder.
    pub const BCJ_ARM_THUMB: Self = Self("BCJ_ARM_THUMB", Self::ID_BCJ_ARM_THUMB);
    /// BCJ SPARC filter coder.
    pub const BCJ_SPARC: Self = Self("BCJ_SPARC", Self::ID_BCJ_SPARC);

    const KNOWN: &'static [&'static CoderId] = &[
        &Self::COPY,
        &Self::DELTA,
        &Self::LZMA,
        &Self::LZMA2,
        &Self::BCJ_X86,
        &Self::BCJ2,
        &Self::BCJ_PPC,
        &Self::BCJ_IA64,
        &Self::BCJ_ARM,
        &Self::BCJ_ARM64,
        &Self::BCJ_ARM_THUMB,
        &Self::BCJ_SPARC,
    ];

    /// Returns the human-readable name of this coder.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.0
    }

    /// Returns the on-disk method id of this coder.
    #[inline]
    pub const fn id(&self) -> &'static [u8] {
        self.1
    }

    /// Finds a coder by its on-disk method id.
    #[inline]
    pub fn by_id(id: &[u8]) -> Option<Self> {
        Self::KNOWN.iter().find(|item| item.id() == id).copied().copied()
    }
}

/// A parsed 7z archive: folders, entries and the stream bookkeeping that
/// ties them to the pack area.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    /// Offset of the pack area, relative to the end of the signature header.
    pub(crate) pack_pos: u64,
    pub(crate) pack_sizes: Vec<u64>,
    pub(crate) pack_crcs_defined: BitSet,
    pub(crate) pack_crcs: Vec<u64>,
    pub(crate) sub_streams_info: Option<SubStreamsInfo>,
    /// Solid compression units of the archive.
    pub folders: Vec<Folder>,
    /// File, directory and symlink entries.
    pub entries: Vec<ArchiveEntry>,
    /// Mapping between entries, folders, and pack streams.
    pub stream_map: StreamMap,
    /// Whether any folder packs several entries together.
    pub is_solid: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SubStreamsInfo {
    pub(crate) unpack_sizes: Vec<u64>,
    pub(crate) has_crc: BitSet,
    pub(crate) crcs: Vec<u64>,
}

/// One archive member and its metadata.
#[derive(Debug, Default, Clone)]
pub struct ArchiveEntry {
    /// Path inside the archive, `/`-separated.
    pub name: String,
    /// Whether the entry owns bytes in some folder's output.
    pub has_stream: bool,
    /// Whether this entry is a directory.
    pub is_directory: bool,
    /// Whether this is an anti-item (deletion marker in update archives).
    pub is_anti_item: bool,
    /// Whether a creation timestamp is recorded.
    pub has_creation_date: bool,
    /// Whether a last-modified timestamp is recorded.
    pub has_last_modified_date: bool,
    /// Whether an access timestamp is recorded.
    pub has_access_date: bool,
    /// Creation time.
    pub creation_date: NtTime,
    /// Last-modified time.
    pub last_modified_date: NtTime,
    /// Last-access time.
    pub access_date: NtTime,
    /// Whether the attribute word is recorded.
    pub has_windows_attributes: bool,
    /// Windows attribute bits; the high half may carry a Unix mode.
    pub windows_attributes: u32,
    /// Whether a content CRC-32 is recorded.
    pub has_crc: bool,
    /// CRC-32 of the uncompressed content.
    pub crc: u64,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Compressed size in bytes (first entry of a folder carries the pack size).
    pub compressed_size: u64,
}

impl ArchiveEntry {
    /// Creates an entry representing a file.
    pub fn new_file(entry_name: &str) -> Self {
        Self {
            name: entry_name.to_string(),
            has_stream: true,
            ..Default::default()
        }
    }

    /// Creates an entry representing a directory.
    pub fn new_directory(entry_name: &str) -> Self {
        Self {
            name: entry_name.to_string(),
            is_directory: true,
            has_windows_attributes: true,
            windows_attributes: ATTRIBUTE_DIRECTORY,
            ..Default::default()
        }
    }

    /// Creates an entry representing a symlink; the target travels as the
    /// entry's content.
    pub fn new_symlink(entry_name: &str) -> Self {
        Self {
            name: entry_name.to_string(),
            has_stream: true,
            has_windows_attributes: true,
            windows_attributes: ATTRIBUTE_SYMLINK | ATTRIBUTE_UNIX_EXTENSION | (0o120777 << 16),
            ..Default::default()
        }
    }

    /// Creates an entry from filesystem metadata at `path`.
    pub fn from_path(path: impl AsRef<std::path::Path>, entry_name: String) -> Self {
        let path = path.as_ref();
        let mut entry = ArchiveEntry {
            name: entry_name,
            has_stream: path.is_file(),
            is_directory: path.is_dir(),
            ..Default::default()
        };
        if entry.is_directory {
            entry.has_windows_attributes = true;
            entry.windows_attributes = ATTRIBUTE_DIRECTORY;
        }

        if let Ok(meta) = path.metadata() {
            if let Ok(modified) = meta.modified() {
                if let Ok(date) = NtTime::try_from(modified) {
                    entry.last_modified_date = date;
                    entry.has_last_modified_date = date.0 > 0;
                }
            }
            if let Ok(created) = meta.created() {
                if let Ok(date) = NtTime::try_from(created) {
                    entry.creation_date = date;
                    entry.has_creation_date = date.0 > 0;
                }
            }
            if let Ok(accessed) = meta.accessed() {
                if let Ok(date) = NtTime::try_from(accessed) {
                    entry.access_date = date;
                    entry.has_access_date = date.0 > 0;
                }
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = meta.permissions().mode() & 0xFFFF;
                entry.has_windows_attributes = true;
                entry.windows_attributes |= ATTRIBUTE_UNIX_EXTENSION | (mode << 16);
            }
        }
        entry
    }

    /// Returns the path of this entry inside the archive.
    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    /// Returns whether this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Returns whether this entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.has_windows_attributes && self.windows_attributes & ATTRIBUTE_SYMLINK != 0
    }

    /// Returns whether this entry has an associated data stream.
    pub fn has_stream(&self) -> bool {
        self.has_stream
    }

    /// Returns the uncompressed size of this entry in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the last-modified time.
    pub fn last_modified_date(&self) -> NtTime {
        self.last_modified_date
    }

    /// Returns the Unix permission bits, when recorded.
    pub fn unix_mode(&self) -> Option<u32> {
        if self.has_windows_attributes && self.windows_attributes & ATTRIBUTE_UNIX_EXTENSION != 0 {
            Some((self.windows_attributes >> 16) & 0xFFFF)
        } else {
            None
        }
    }

    /// Stores Unix permission bits in the attribute word.
    pub fn set_unix_mode(&mut self, mode: u32) {
        self.has_windows_attributes = true;
        self.windows_attributes =
            (self.windows_attributes & 0xFFFF) | ATTRIBUTE_UNIX_EXTENSION | ((mode & 0xFFFF) << 16);
    }
}

/// Correlates entries, folders, and pack streams.
#[derive(Debug, Default, Clone)]
pub struct StreamMap {
    pub(crate) folder_first_pack_stream_index: Vec<usize>,
    pub(crate) pack_stream_offsets: Vec<u64>,
    /// Index of the first entry of each folder.
    pub folder_first_entry_index: Vec<usize>,
    /// Folder index of each entry (`None` for entries without bytes).
    pub entry_folder_index: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StartHeader {
    pub(crate) next_header_offset: u64,
    pub(crate) next_header_size: u64,
    pub(crate) next_header_crc: u64,
}

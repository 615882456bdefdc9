//! A multi-format archive toolkit written in pure Rust.
//!
//! The crate covers three related jobs:
//!
//! * a **7z archive engine** reading and writing the on-disk 7z structure:
//!   solid folders, coder chains, CRC-32 verification, compressed headers;
//! * an **XZ container** codec and the reversible preprocessing filters
//!   both containers share (Delta and the BCJ branch rewriters), plus a
//!   standalone LZ77+Huffman block codec;
//! * a **PAR2 engine** creating, verifying and repairing Reed–Solomon
//!   recovery sets over GF(2¹⁶).
//!
//! ## Supported coders & filters
//!
//! | Coder         | Decode | Encode |
//! |---------------|--------|--------|
//! | COPY          | ✓      | ✓      |
//! | LZMA          | ✓      | ✓      |
//! | LZMA2         | ✓      | ✓      |
//! | LZ77+Huffman  | ✓      | ✓      |
//!
//! | Filter        | Decode | Encode |
//! |---------------|--------|--------|
//! | DELTA         | ✓      | ✓      |
//! | BCJ X86       | ✓      | ✓      |
//! | BCJ ARM       | ✓      | ✓      |
//! | BCJ ARM_THUMB | ✓      | ✓      |
//! | BCJ ARM64     | ✓      | ✓      |
//! | BCJ PPC       | ✓      | ✓      |
//! | BCJ IA64      | ✓      | ✓      |
//! | BCJ SPARC     | ✓      | ✓      |
//! | BCJ2          | ✓      |        |
#![warn(missing_docs)]

pub(crate) mod archive;
pub mod bitio;
pub(crate) mod bitset;
mod coder_options;
pub(crate) mod decoder;
pub(crate) mod encoder;
mod error;
pub mod filter;
pub(crate) mod folder;
pub mod gf16;
pub mod huffman;
pub mod lz;
pub mod lzh;
pub mod par2;
mod pipeline;
mod reader;
mod time;
mod util;
mod writer;
pub mod xz;

pub use archive::{Archive, ArchiveEntry, CoderId, StreamMap};
pub use coder_options::{
    CoderConfiguration, CoderOptions, DeltaOptions, Lzma2Options, LzmaOptions,
};
pub use error::Error;
pub use folder::{Coder, Folder, OrderedCoderIter};
pub use par2::{
    FileVerification, RepairResult, Verification, par2_create, par2_repair, par2_verify,
};
pub use pipeline::{FilterPipeline, PipelineCodec};
pub use reader::{ArchiveReader, FolderDecoder};
pub use time::{NtTime, NtTimeError};
pub use util::compress::{compress, compress_to_path};
pub use util::decompress::{
    decompress, decompress_file, decompress_with_extract_fn, default_entry_extract_fn,
};
pub use writer::{Algorithm, ArchiveWriter, SourceReader, WriterOptions};
pub use xz::{decode_xz, encode_xz};

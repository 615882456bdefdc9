//! Convenience helpers between the filesystem and archives.

pub mod compress;
pub mod decompress;

//! Filesystem-to-archive helpers.

use std::{
    fs::File,
    io::{Seek, Write},
    path::Path,
};

use crate::{ArchiveEntry, ArchiveWriter, Error, WriterOptions};

/// Compresses a file or directory tree into `dest`.
pub fn compress<W: Write + Seek>(
    src: impl AsRef<Path>,
    dest: W,
    options: WriterOptions,
) -> Result<W, Error> {
    let mut writer = ArchiveWriter::new(dest, options)?;
    let root = if src.as_ref().is_dir() {
        src.as_ref()
    } else {
        src.as_ref().parent().unwrap_or(src.as_ref())
    };
    add_path(src.as_ref(), root, &mut writer)?;
    writer.finish()
}

/// Compresses a file or directory tree into a new archive at `dest`.
pub fn compress_to_path(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    options: WriterOptions,
) -> Result<(), Error> {
    if let Some(parent) = dest.as_ref().parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io_msg(e, format!("create dir {parent:?}")))?;
        }
    }
    let file = File::create(dest.as_ref())
        .map_err(|e| Error::file_open(e, dest.as_ref().to_string_lossy().to_string()))?;
    compress(src, file, options)?;
    Ok(())
}

fn add_path<W: Write + Seek>(
    src: &Path,
    root: &Path,
    writer: &mut ArchiveWriter<W>,
) -> Result<(), Error> {
    let entry_name = src
        .strip_prefix(root)
        .map_err(|e| Error::other(e.to_string()))?
        .to_string_lossy()
        .replace('\\', "/");
    if src.is_dir() {
        if !entry_name.is_empty() {
            writer.add_entry(ArchiveEntry::from_path(src, entry_name), Vec::new())?;
        }
        for child in src
            .read_dir()
            .map_err(|e| Error::io_msg(e, "read source dir"))?
        {
            let child = child.map_err(Error::io)?;
            let file_type = child.file_type().map_err(Error::io)?;
            if file_type.is_dir() || file_type.is_file() {
                add_path(&child.path(), root, writer)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(child.path()).map_err(Error::io)?;
                let name = child
                    .path()
                    .strip_prefix(root)
                    .map_err(|e| Error::other(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                writer.add_symlink(&name, &target.to_string_lossy())?;
            }
        }
    } else {
        let data = std::fs::read(src)
            .map_err(|e| Error::file_open(e, src.to_string_lossy().to_string()))?;
        writer.add_entry(ArchiveEntry::from_path(src, entry_name), data)?;
    }
    Ok(())
}

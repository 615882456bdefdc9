//! Archive-to-filesystem helpers.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek},
    path::{Path, PathBuf},
};

use crate::{ArchiveEntry, ArchiveReader, Error};

/// Extracts the archive at `src_path` into the directory `dest`.
pub fn decompress_file(src_path: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let file = File::open(src_path.as_ref())
        .map_err(|e| Error::file_open(e, src_path.as_ref().to_string_lossy().to_string()))?;
    decompress(file, dest)
}

/// Extracts an archive read from `src_reader` into the directory `dest`.
pub fn decompress<R: Read + Seek>(src_reader: R, dest: impl AsRef<Path>) -> Result<(), Error> {
    decompress_with_extract_fn(src_reader, dest, default_entry_extract_fn)
}

/// Extracts with a custom per-entry function; returning `false` stops the
/// extraction.
pub fn decompress_with_extract_fn<R: Read + Seek>(
    src_reader: R,
    dest: impl AsRef<Path>,
    mut extract_fn: impl FnMut(&ArchiveEntry, &mut dyn Read, &PathBuf) -> Result<bool, Error>,
) -> Result<(), Error> {
    let mut reader = ArchiveReader::new(src_reader)?;
    let dest = PathBuf::from(dest.as_ref());
    if !dest.exists() {
        std::fs::create_dir_all(&dest).map_err(Error::io)?;
    }
    reader.for_each_entries(|entry, content| {
        let dest_path = dest.join(entry.name());
        extract_fn(entry, content, &dest_path)
    })
}

/// The default extraction: directories are created, symlinks recreated on
/// Unix, files written with their recorded permissions.
pub fn default_entry_extract_fn(
    entry: &ArchiveEntry,
    reader: &mut dyn Read,
    dest: &PathBuf,
) -> Result<bool, Error> {
    if entry.is_directory() {
        if !dest.exists() {
            std::fs::create_dir_all(dest).map_err(Error::io)?;
        }
        return Ok(true);
    }

    if let Some(parent) = dest.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(Error::io)?;
        }
    }

    if entry.is_symlink() {
        let mut target = String::new();
        reader.read_to_string(&mut target).map_err(Error::io)?;
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(dest);
            std::os::unix::fs::symlink(&target, dest).map_err(Error::io)?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(dest, target).map_err(Error::io)?;
        }
        return Ok(true);
    }

    let file = File::create(dest)
        .map_err(|e| Error::file_open(e, dest.to_string_lossy().to_string()))?;
    if entry.size() > 0 {
        let mut writer = BufWriter::new(file);
        std::io::copy(reader, &mut writer).map_err(Error::from)?;
    }
    #[cfg(unix)]
    if let Some(mode) = entry.unix_mode() {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode));
    }
    Ok(true)
}

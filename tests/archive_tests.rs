use std::io::Cursor;

use ironpack::*;

fn write_archive(options: WriterOptions, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut writer = ArchiveWriter::new(Cursor::new(&mut bytes), options).unwrap();
        for (name, content) in entries {
            writer.add_file(name, *content).unwrap();
        }
        writer.finish().unwrap();
    }
    bytes
}

#[test]
fn solid_roundtrip_preserves_names_contents_and_crcs() {
    let bytes = write_archive(WriterOptions::default(), &[
        ("a.txt", b"hello"),
        ("b.txt", b"world"),
    ]);

    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    let names: Vec<String> = reader.entries().map(|e| e.name().to_string()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    assert!(reader.archive().is_solid);

    assert_eq!(reader.read_file("a.txt").unwrap(), b"hello");
    assert_eq!(reader.read_file("b.txt").unwrap(), b"world");

    let crcs: Vec<u64> = reader.entries().map(|e| e.crc).collect();
    assert_eq!(crcs[0], crc32fast::hash(b"hello") as u64);
    assert_eq!(crcs[1], crc32fast::hash(b"world") as u64);
}

#[test]
fn non_solid_archives_use_one_folder_per_file() {
    let options = WriterOptions {
        solid: false,
        ..Default::default()
    };
    let bytes = write_archive(options, &[("x.bin", &[1u8; 300]), ("y.bin", &[2u8; 400])]);

    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    assert_eq!(reader.archive().folders.len(), 2);
    assert!(!reader.archive().is_solid);
    assert_eq!(reader.read_file("y.bin").unwrap(), vec![2u8; 400]);
    assert_eq!(reader.read_file("x.bin").unwrap(), vec![1u8; 300]);
}

#[test]
fn filtered_folders_roundtrip() {
    use ironpack::filter::{FilterArch, FilterSpec};

    let mut payload = Vec::new();
    for i in 0..2000u32 {
        payload.push(0xE8);
        payload.extend_from_slice(&(i * 32).to_le_bytes());
        payload.push(0x90);
    }

    for filters in [
        vec![FilterSpec::Delta { distance: 4 }],
        vec![FilterSpec::Bcj(FilterArch::X86)],
        vec![
            FilterSpec::Bcj(FilterArch::X86),
            FilterSpec::Delta { distance: 2 },
        ],
    ] {
        let options = WriterOptions {
            filters: filters.clone(),
            ..Default::default()
        };
        let bytes = write_archive(options, &[("code.bin", &payload)]);
        let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(
            reader.read_file("code.bin").unwrap(),
            payload,
            "filters {filters:?}"
        );
    }
}

#[test]
fn lzma_and_copy_algorithms_roundtrip() {
    for algorithm in [Algorithm::Copy, Algorithm::Lzma, Algorithm::Lzma2] {
        let options = WriterOptions {
            algorithm,
            ..Default::default()
        };
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let bytes = write_archive(options, &[("data.bin", &content)]);
        let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(reader.read_file("data.bin").unwrap(), content, "{algorithm:?}");
    }
}

#[test]
fn directories_symlinks_and_empty_files_survive() {
    let mut bytes = Vec::new();
    {
        let mut writer =
            ArchiveWriter::new(Cursor::new(&mut bytes), WriterOptions::default()).unwrap();
        writer.add_directory("docs").unwrap();
        writer.add_file("docs/readme.txt", &b"content"[..]).unwrap();
        writer.add_entry(ArchiveEntry::new_file("empty.txt"), Vec::new()).unwrap();
        writer.add_symlink("latest", "docs/readme.txt").unwrap();
        writer.finish().unwrap();
    }

    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    let entries: Vec<ArchiveEntry> = reader.entries().cloned().collect();
    assert_eq!(entries.len(), 4);

    let docs = entries.iter().find(|e| e.name() == "docs").unwrap();
    assert!(docs.is_directory());
    assert!(!docs.has_stream());

    let empty = entries.iter().find(|e| e.name() == "empty.txt").unwrap();
    assert!(!empty.is_directory());
    assert!(!empty.has_stream());
    assert_eq!(empty.size(), 0);

    let link = entries.iter().find(|e| e.name() == "latest").unwrap();
    assert!(link.is_symlink());
    assert_eq!(reader.read_file("latest").unwrap(), b"docs/readme.txt");
    assert_eq!(reader.read_file("empty.txt").unwrap(), b"");
}

#[test]
fn timestamps_and_unix_modes_are_recorded() {
    let mut entry = ArchiveEntry::new_file("timed.txt");
    entry.last_modified_date = NtTime::from_unix_seconds(1_600_000_000);
    entry.has_last_modified_date = true;
    entry.set_unix_mode(0o640);

    let mut bytes = Vec::new();
    {
        let mut writer =
            ArchiveWriter::new(Cursor::new(&mut bytes), WriterOptions::default()).unwrap();
        writer.add_entry(entry, b"tick".to_vec()).unwrap();
        writer.finish().unwrap();
    }

    let reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    let entry = reader.entries().next().unwrap();
    assert!(entry.has_last_modified_date);
    assert_eq!(entry.last_modified_date().to_unix_seconds(), Some(1_600_000_000));
    assert_eq!(entry.unix_mode(), Some(0o640));
}

#[test]
fn plain_headers_parse_too() {
    let options = WriterOptions {
        compress_header: false,
        ..Default::default()
    };
    let bytes = write_archive(options, &[("plain.txt", b"plain header")]);
    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    assert_eq!(reader.read_file("plain.txt").unwrap(), b"plain header");
}

#[test]
fn corrupt_folder_fails_extraction_but_not_its_neighbors() {
    // COPY coder and non-solid folders: the damage lands in exactly one
    // folder's pack stream and must surface as a checksum mismatch there.
    let options = WriterOptions {
        solid: false,
        algorithm: Algorithm::Copy,
        ..Default::default()
    };
    let mut bytes = write_archive(options, &[
        ("first.txt", b"aaaaaaaaaaaaaaaa"),
        ("second.txt", b"bbbbbbbbbbbbbbbb"),
    ]);

    // pack area starts right after the 32-byte signature header
    bytes[32 + 3] ^= 0x40;

    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    let mut sink = Vec::new();
    let err = reader.extract("first.txt", &mut sink).unwrap_err();
    assert!(
        matches!(err, Error::ChecksumMismatch { .. }),
        "got {err:?}"
    );

    let mut sink = Vec::new();
    reader.extract("second.txt", &mut sink).unwrap();
    assert_eq!(sink, b"bbbbbbbbbbbbbbbb");
}

#[test]
fn reading_garbage_is_rejected() {
    let err = ArchiveReader::new(Cursor::new(&b"not a sevenz file at all"[..])).unwrap_err();
    assert!(matches!(err, Error::BadSignature(_)));
}

#[test]
fn directory_tree_roundtrip_through_the_filesystem() {
    let temp = tempfile::tempdir().unwrap();
    let tree = temp.path().join("tree");
    std::fs::create_dir_all(tree.join("sub/inner")).unwrap();
    std::fs::write(tree.join("top.txt"), b"top").unwrap();
    std::fs::write(tree.join("sub/mid.txt"), b"middle").unwrap();
    std::fs::write(tree.join("sub/inner/leaf.txt"), b"leaf leaf leaf").unwrap();

    let archive_path = temp.path().join("tree.7z");
    compress_to_path(&tree, &archive_path, WriterOptions::default()).unwrap();

    let out = temp.path().join("out");
    decompress_file(&archive_path, &out).unwrap();
    assert_eq!(std::fs::read(out.join("top.txt")).unwrap(), b"top");
    assert_eq!(std::fs::read(out.join("sub/mid.txt")).unwrap(), b"middle");
    assert_eq!(
        std::fs::read(out.join("sub/inner/leaf.txt")).unwrap(),
        b"leaf leaf leaf"
    );
}

#[test]
fn randomized_solid_roundtrip() {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let files: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| {
            let len = rng.random_range(0..4096);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            (format!("file{i:02}.bin"), data)
        })
        .collect();

    let mut bytes = Vec::new();
    {
        let mut writer =
            ArchiveWriter::new(Cursor::new(&mut bytes), WriterOptions::default()).unwrap();
        for (name, data) in &files {
            writer.add_file(name, data.as_slice()).unwrap();
        }
        writer.finish().unwrap();
    }

    let mut reader = ArchiveReader::new(Cursor::new(bytes.as_slice())).unwrap();
    for (name, data) in &files {
        assert_eq!(&reader.read_file(name).unwrap(), data, "{name}");
    }
}

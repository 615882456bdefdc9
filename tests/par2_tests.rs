use std::fs;

use ironpack::{Error, par2_create, par2_repair, par2_verify};

/// One file of four 1024-byte blocks with recognizable content per block.
fn block_file_content() -> Vec<u8> {
    let mut data = Vec::with_capacity(4 * 1024);
    for block in 0u8..4 {
        data.extend(std::iter::repeat_n(block, 1024));
    }
    data
}

#[test]
fn intact_set_verifies_clean() {
    let temp = tempfile::tempdir().unwrap();
    let data_path = temp.path().join("data.bin");
    fs::write(&data_path, block_file_content()).unwrap();

    let par2_path = temp.path().join("data.par2");
    let written = par2_create(&[&data_path], &par2_path, 1024, 2).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written[1].file_name().unwrap().to_string_lossy().contains(".vol00+02."));

    let verification = par2_verify(&par2_path).unwrap();
    assert!(verification.all_ok());
    assert_eq!(verification.block_size, 1024);
    assert_eq!(verification.recovery_block_count, 2);
    assert_eq!(verification.missing_block_count(), 0);
}

#[test]
fn repair_with_nothing_missing_writes_no_files() {
    let temp = tempfile::tempdir().unwrap();
    let data_path = temp.path().join("data.bin");
    fs::write(&data_path, block_file_content()).unwrap();
    let par2_path = temp.path().join("data.par2");
    par2_create(&[&data_path], &par2_path, 1024, 2).unwrap();

    let out = temp.path().join("repaired");
    let result = par2_repair(&par2_path, &out).unwrap();
    assert!(result.success);
    assert_eq!(result.recovered_blocks, 0);
    assert!(result.unrecoverable_blocks.is_empty());
    assert!(!out.exists());
}

#[test]
fn two_damaged_blocks_are_rebuilt_byte_for_byte() {
    let temp = tempfile::tempdir().unwrap();
    let original = block_file_content();
    let data_path = temp.path().join("data.bin");
    fs::write(&data_path, &original).unwrap();
    let par2_path = temp.path().join("data.par2");
    par2_create(&[&data_path], &par2_path, 1024, 2).unwrap();

    // wreck blocks 1 and 2
    let mut damaged = original.clone();
    for byte in &mut damaged[1024..3072] {
        *byte = 0xEE;
    }
    fs::write(&data_path, &damaged).unwrap();

    let verification = par2_verify(&par2_path).unwrap();
    assert!(!verification.all_ok());
    assert_eq!(verification.missing_block_count(), 2);
    assert!(verification.repairable());
    assert_eq!(verification.files[0].missing_blocks, vec![1, 2]);

    let out = temp.path().join("repaired");
    let result = par2_repair(&par2_path, &out).unwrap();
    assert!(result.success);
    assert_eq!(result.recovered_blocks, 2);
    assert_eq!(fs::read(out.join("data.bin")).unwrap(), original);
}

#[test]
fn a_deleted_file_is_rebuilt_whole() {
    let temp = tempfile::tempdir().unwrap();
    let original: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
    let data_path = temp.path().join("gone.bin");
    fs::write(&data_path, &original).unwrap();
    let par2_path = temp.path().join("gone.par2");
    // 3000 bytes at 1024-byte blocks: three blocks, zero-padded tail
    par2_create(&[&data_path], &par2_path, 1024, 3).unwrap();

    fs::remove_file(&data_path).unwrap();

    let verification = par2_verify(&par2_path).unwrap();
    assert!(!verification.files[0].found);
    assert_eq!(verification.missing_block_count(), 3);

    let out = temp.path().join("repaired");
    let result = par2_repair(&par2_path, &out).unwrap();
    assert!(result.success);
    assert_eq!(result.recovered_blocks, 3);
    assert_eq!(fs::read(out.join("gone.bin")).unwrap(), original);
}

#[test]
fn multi_file_sets_repair_across_files() {
    let temp = tempfile::tempdir().unwrap();
    let first: Vec<u8> = (0..2048u32).map(|i| (i % 7) as u8).collect();
    let second: Vec<u8> = (0..1500u32).map(|i| (i % 11) as u8).collect();
    fs::write(temp.path().join("first.bin"), &first).unwrap();
    fs::write(temp.path().join("second.bin"), &second).unwrap();

    let par2_path = temp.path().join("set.par2");
    par2_create(
        &[temp.path().join("first.bin"), temp.path().join("second.bin")],
        &par2_path,
        1024,
        2,
    )
    .unwrap();

    // damage one block in each file
    let mut damaged = first.clone();
    damaged[100] ^= 0xFF;
    fs::write(temp.path().join("first.bin"), &damaged).unwrap();
    let mut damaged = second.clone();
    damaged[1400] ^= 0xFF;
    fs::write(temp.path().join("second.bin"), &damaged).unwrap();

    let verification = par2_verify(&par2_path).unwrap();
    assert_eq!(verification.missing_block_count(), 2);

    let out = temp.path().join("repaired");
    let result = par2_repair(&par2_path, &out).unwrap();
    assert!(result.success);
    assert_eq!(result.recovered_blocks, 2);
    assert_eq!(fs::read(out.join("first.bin")).unwrap(), first);
    assert_eq!(fs::read(out.join("second.bin")).unwrap(), second);
}

#[test]
fn too_much_damage_reports_insufficient_recovery() {
    let temp = tempfile::tempdir().unwrap();
    let original = block_file_content();
    let data_path = temp.path().join("data.bin");
    fs::write(&data_path, &original).unwrap();
    let par2_path = temp.path().join("data.par2");
    par2_create(&[&data_path], &par2_path, 1024, 2).unwrap();

    let mut damaged = original.clone();
    for byte in &mut damaged[..3072] {
        *byte ^= 0x55;
    }
    fs::write(&data_path, &damaged).unwrap();

    let out = temp.path().join("repaired");
    let err = par2_repair(&par2_path, &out).unwrap_err();
    assert!(matches!(
        err,
        Error::Par2InsufficientRecovery { needed: 3, have: 2 }
    ));
}

#[test]
fn verify_accepts_the_volume_file_as_entry_point() {
    let temp = tempfile::tempdir().unwrap();
    let data_path = temp.path().join("data.bin");
    fs::write(&data_path, block_file_content()).unwrap();
    let par2_path = temp.path().join("data.par2");
    let written = par2_create(&[&data_path], &par2_path, 1024, 2).unwrap();

    // point verification at the recovery volume instead of the index
    let verification = par2_verify(&written[1]).unwrap();
    assert!(verification.all_ok());
    assert_eq!(verification.recovery_block_count, 2);
}

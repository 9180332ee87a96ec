mod common;

use std::io::Cursor;

use common::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tcvol::volume::HIDDEN_HEADER_OFFSET;
use tcvol::{Error, Family, HiddenRequest, HiddenVolume, VolumeCreator, VolumeKind, VolumeOpener};

fn rng() -> StdRng {
    StdRng::seed_from_u64(0x7463_766f)
}

#[test]
fn test_created_volume_opens() {
    let options = options(Family::TrueCrypt)
        .with_prf("Whirlpool")
        .with_cipher("Twofish-Serpent");
    let creator = VolumeCreator::new(&options).unwrap();

    let mut device = Cursor::new(blank_image());
    let created = creator
        .create_with_rng(&mut device, &pool(b"fresh"), None, &mut rng())
        .unwrap();
    assert_eq!(created.outer.encrypted_area_start, OUTER_START);
    assert_eq!(created.outer.encrypted_area_length, OUTER_LEN);

    let opened = VolumeOpener::new(&options)
        .unwrap()
        .open(&mut device, &pool(b"fresh"), HiddenRequest::None)
        .unwrap();
    assert_eq!(opened.outer.prf().name, "Whirlpool");
    assert_eq!(opened.outer.chain().name, "Twofish-Serpent");
    assert_eq!(opened.outer.data_offset(), OUTER_START);
    assert_eq!(opened.outer.data_size(), OUTER_LEN);
    assert_eq!(opened.outer.header().volume_data_size, OUTER_LEN);
}

#[test]
fn test_created_volume_has_backup_header() {
    let options = options(Family::TrueCrypt);
    let creator = VolumeCreator::new(&options).unwrap();
    let mut device = Cursor::new(blank_image());
    creator
        .create_with_rng(&mut device, &pool(b"pw"), None, &mut rng())
        .unwrap();

    let primary = VolumeOpener::new(&options)
        .unwrap()
        .open(&mut device, &pool(b"pw"), HiddenRequest::None)
        .unwrap();

    let mut image = device.into_inner();
    put(&mut image, 0, &[0u8; 512]);

    let mut with_backup = options.clone();
    with_backup.backup_headers = true;
    let restored = VolumeOpener::new(&with_backup)
        .unwrap()
        .open(&mut Cursor::new(image), &pool(b"pw"), HiddenRequest::None)
        .unwrap();
    assert!(restored.outer.from_backup());
    assert_eq!(restored.outer.master_key(), primary.outer.master_key());
    // Backup is sealed under its own salt.
    assert_ne!(restored.outer.header_key(), primary.outer.header_key());
}

#[test]
fn test_created_hidden_volume() {
    let options = options(Family::TrueCrypt);
    let creator = VolumeCreator::new(&options).unwrap();
    let hidden_pool = pool(b"inner");
    let mut device = Cursor::new(blank_image());
    let created = creator
        .create_with_rng(
            &mut device,
            &pool(b"outer"),
            Some(HiddenVolume {
                pool: &hidden_pool,
                size: HIDDEN_LEN,
            }),
            &mut rng(),
        )
        .unwrap();
    assert_eq!(created.hidden.unwrap().encrypted_area_start, HIDDEN_START);

    let opened = VolumeOpener::new(&options)
        .unwrap()
        .open(&mut device, &pool(b"outer"), HiddenRequest::Required(&hidden_pool))
        .unwrap();
    let hidden = opened.hidden.unwrap();
    assert_eq!(hidden.kind(), VolumeKind::Hidden);
    assert_eq!(hidden.header_offset(), HIDDEN_HEADER_OFFSET);
    assert_eq!(hidden.data_offset(), HIDDEN_START);
    assert_eq!(hidden.data_size(), HIDDEN_LEN);
    assert_ne!(hidden.master_key(), opened.outer.master_key());
}

#[test]
fn test_hidden_slot_filled_without_hidden_volume() {
    let options = options(Family::TrueCrypt);
    let creator = VolumeCreator::new(&options).unwrap();
    let mut device = Cursor::new(blank_image());
    creator
        .create_with_rng(&mut device, &pool(b"pw"), None, &mut rng())
        .unwrap();

    let image = device.get_ref();
    let slot = HIDDEN_HEADER_OFFSET as usize;
    assert!(image[slot..slot + 512].iter().any(|&b| b != 0));

    let other = pool(b"other");
    let opened = VolumeOpener::new(&options)
        .unwrap()
        .open(&mut device, &pool(b"pw"), HiddenRequest::Optional(&other))
        .unwrap();
    assert!(opened.hidden.is_none());
}

#[test]
fn test_oversized_hidden_volume_rejected() {
    let options = options(Family::TrueCrypt);
    let creator = VolumeCreator::new(&options).unwrap();
    let hidden_pool = pool(b"inner");
    let result = creator.create_with_rng(
        &mut Cursor::new(blank_image()),
        &pool(b"outer"),
        Some(HiddenVolume {
            pool: &hidden_pool,
            size: OUTER_LEN,
        }),
        &mut rng(),
    );
    assert!(matches!(result, Err(Error::GeometryConflict(_))));
}

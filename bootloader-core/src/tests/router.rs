use super::*;
use crate::error::Error;
use crate::extflash::Mode;
use crate::router::Operation;

#[test]
fn classify_maps_every_region() {
    let config = test_config();
    let router = test_router(&config);

    assert_eq!(router.classify(0).unwrap().kind, RegionKind::InternalFlash);
    assert_eq!(router.classify(EEPROM_START + 4).unwrap().kind, RegionKind::EmulatedEeprom);
    assert_eq!(router.classify(EXTERNAL_START).unwrap().kind, RegionKind::ExternalXip);
    assert_eq!(router.classify(INTERNAL_SIZE), Err(Error::Address));
    assert_eq!(router.classify(EXTERNAL_START + EXTERNAL_SIZE), Err(Error::Address));
}

#[test]
fn odd_sized_write_is_a_length_error() {
    let config = test_config();
    let router = test_router(&config);

    // 3 bytes at an address that is not a multiple of the 512 byte row
    assert_eq!(router.check(APP_START + 3, 3, Operation::Program), Err(Error::Length));
    assert_eq!(router.check(APP_START, 3, Operation::Compare), Err(Error::Length));
    assert_eq!(router.check(APP_START, 0, Operation::Program), Err(Error::Length));
    // Whole rows, but misaligned
    assert_eq!(router.check(APP_START + 4, INTERNAL_ROW, Operation::Program), Err(Error::Address));
}

#[test]
fn zero_length_erase_is_granularity_exempt() {
    let config = test_config();
    let router = test_router(&config);

    let region = router.check(APP_START, 0, Operation::Erase).unwrap();
    assert_eq!(region.kind, RegionKind::InternalFlash);
    assert_eq!(router.check(APP_START + 8, 0, Operation::Erase), Err(Error::Address));
    assert_eq!(router.check(APP_START, 100, Operation::Erase), Err(Error::Length));
}

#[test]
fn running_app_is_refused_for_every_operation() {
    let config = test_config();
    let mut router = test_router(&config);
    router.set_protected(&[LAUNCHER.span()]);

    // Erase and rewrite of the first row
    assert_eq!(router.check(LAUNCHER_START, 0, Operation::Erase), Err(Error::Address));
    assert_eq!(router.check(LAUNCHER_START, INTERNAL_ROW, Operation::Program), Err(Error::Address));

    for address in [LAUNCHER.start, LAUNCHER.start + 0x200, LAUNCHER.footer_address()] {
        let row = address - address % INTERNAL_ROW;
        for op in [Operation::Program, Operation::Erase, Operation::Compare] {
            assert_eq!(router.check(row, INTERNAL_ROW, op), Err(Error::Address));
        }
        assert_eq!(router.check(address, 4, Operation::Read), Err(Error::Address));
    }

    // A write that only touches the row before the image is fine
    assert!(router
        .check(LAUNCHER_START - INTERNAL_ROW, INTERNAL_ROW, Operation::Program)
        .is_ok());
    // One that runs into it is not
    assert_eq!(
        router.check(LAUNCHER_START - INTERNAL_ROW, 2 * INTERNAL_ROW, Operation::Program),
        Err(Error::Address)
    );
}

#[test]
fn staged_addresses_are_translated_into_the_external_window() {
    let config = test_config();
    let router = test_router(&config);

    assert_eq!(router.translate(APP_START + 0x10, AppId::STAGING), EXTERNAL_START + 0x10);
    assert_eq!(router.translate(APP_START + 0x10, AppId::APPLICATION), APP_START + 0x10);
    // Past the remapped slot nothing changes
    assert_eq!(router.translate(APP_START + APP_SIZE, AppId::STAGING), APP_START + APP_SIZE);
}

#[test]
fn rows_round_trip_through_every_region() {
    let config = test_config();
    let mut router = test_router(&config);

    let internal = image(2 * INTERNAL_ROW as usize, 1);
    router.write_rows(APP_START, &internal).unwrap();
    assert_eq!(read_vec(&mut router, APP_START, internal.len() as u32), internal);

    let eeprom = image(EEPROM_ROW as usize, 2);
    router.write_rows(EEPROM_START + EEPROM_ROW, &eeprom).unwrap();
    assert_eq!(read_vec(&mut router, EEPROM_START + EEPROM_ROW, EEPROM_ROW), eeprom);

    let external = image(EXTERNAL_ROW as usize, 3);
    router.write_rows(EXTERNAL_START + EXTERNAL_ROW, &external).unwrap();
    assert_eq!(read_vec(&mut router, EXTERNAL_START + EXTERNAL_ROW, EXTERNAL_ROW), external);
    router.set_external_mode(Mode::MemoryMapped).unwrap();
    assert_eq!(read_vec(&mut router, EXTERNAL_START + EXTERNAL_ROW, EXTERNAL_ROW), external);
}

#[test]
fn rewriting_a_row_erases_it_first() {
    let config = test_config();
    let mut router = test_router(&config);

    router.write_rows(APP_START, &[0x00; 512]).unwrap();
    router.write_rows(APP_START, &[0xA5; 512]).unwrap();
    assert_eq!(read_vec(&mut router, APP_START, 512), [0xA5; 512]);
    assert_eq!(router.internal().erases, 2);
}

#[test]
fn erase_resets_rows_to_erased_state() {
    let config = test_config();
    let mut router = test_router(&config);

    router.write_rows(APP_START, &[0u8; 1024]).unwrap();
    router.erase(APP_START + INTERNAL_ROW, 0).unwrap();
    assert_eq!(read_vec(&mut router, APP_START, 512), [0u8; 512]);
    assert_eq!(read_vec(&mut router, APP_START + 512, 512), [0xFF; 512]);

    router.write_rows(EXTERNAL_START, &[0u8; 4096]).unwrap();
    router.erase(EXTERNAL_START + 0x100, 0).unwrap_err();
    router.erase(EXTERNAL_START, 0).unwrap();
    assert_eq!(read_vec(&mut router, EXTERNAL_START, 16), [0xFF; 16]);
}

#[test]
fn reads_may_not_straddle_regions() {
    let config = test_config();
    let mut router = test_router(&config);

    let mut buf = [0u8; 8];
    assert_eq!(router.read(INTERNAL_SIZE - 4, &mut buf), Err(Error::Address));
}

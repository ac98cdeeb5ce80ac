//! End-to-end programming runs against the target simulator.

use picload::device::{DeviceProfile, Registry};
use picload::flashing::{FlashConfig, Flashing};
use picload::memory::{Image, Page};
use picload::protocol::{Icsp, Protocol, Region};
use picload::sim::IcspTarget;
use picload::{Error, Family};

fn profile(device_id: u16) -> DeviceProfile {
    Registry::load().unwrap().find(device_id).unwrap()
}

/// A small firmware: reset vector page, one more program page, one data
/// page and the two config words.
fn sample_firmware(profile: &DeviceProfile) -> Image {
    let mut image = Image::new();

    let mut page0 = Page::new();
    page0.set_word(0, Some(0x3180)).unwrap();
    page0.set_word(1, Some(0x2805)).unwrap();
    page0.set_word(31, Some(0x0009)).unwrap();
    image.set_page(0, Some(page0));

    let mut page3 = Page::new();
    for offset in 0..8 {
        page3.set_word(offset, Some(0x3000 + offset as u16)).unwrap();
    }
    image.set_page(3, Some(page3));

    let mut data = Page::new();
    data.set_word(0, Some(0x0041)).unwrap();
    data.set_word(1, Some(0x0042)).unwrap();
    image.set_page(profile.min_data + 2, Some(data));

    let mut conf = Page::new();
    conf.set_word(0, Some(0x0001)).unwrap();
    conf.set_word(7, Some(0x09A4)).unwrap();
    conf.set_word(8, Some(0x1613)).unwrap();
    image.set_page(profile.conf_page, Some(conf));

    image
}

#[test]
fn program_and_verify_succeeds() {
    let profile = profile(0x138);
    let firmware = sample_firmware(&profile);

    let target = IcspTarget::with_seed(profile.clone(), Image::new(), 7);
    let config = FlashConfig::default();
    let mut flashing = Flashing::start(Icsp::new(target), config).unwrap();
    assert_eq!(flashing.profile().name, "12F1822");

    let diffs = flashing.flash(&firmware).unwrap();
    assert!(diffs.is_empty());
    flashing.release().unwrap();

    let target = flashing.into_protocol().into_inner();
    assert_eq!(target.usage_errors(), 0);
}

#[test]
fn read_back_matches_what_was_written() {
    let profile = profile(0x138);
    let firmware = sample_firmware(&profile);

    let target = IcspTarget::with_seed(profile.clone(), Image::new(), 11);
    let mut flashing = Flashing::start(Icsp::new(target), FlashConfig::default()).unwrap();

    flashing.flash(&firmware).unwrap();
    let chip = flashing.read_image().unwrap();
    assert_eq!(chip, firmware);
}

#[test]
fn corrupted_write_is_caught_by_verify() {
    let profile = profile(0x138);
    let firmware = sample_firmware(&profile);

    let mut target = IcspTarget::with_seed(profile.clone(), Image::new(), 3);
    target.corrupt_write_on_page(3);

    let mut flashing = Flashing::start(Icsp::new(target), FlashConfig::default()).unwrap();
    let diffs = flashing.flash(&firmware).unwrap();

    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].page_num, 3);
    assert!(diffs[0].file.is_some());
    assert!(diffs[0].chip.is_some());
}

#[test]
fn fast_mode_skips_verify() {
    let profile = profile(0x138);
    let firmware = sample_firmware(&profile);

    // Corrupt a write; fast mode must not notice.
    let mut target = IcspTarget::with_seed(profile.clone(), Image::new(), 3);
    target.corrupt_write_on_page(3);

    let config = FlashConfig {
        fast: true,
        ..FlashConfig::default()
    };
    let mut flashing = Flashing::start(Icsp::new(target), config).unwrap();
    let diffs = flashing.flash(&firmware).unwrap();
    assert!(diffs.is_empty());
}

#[test]
fn full_page_write_batches_latch_commits() {
    // 16F1826: 8 latches, 32-word pages, so 4 commits per full page.
    let profile = profile(0x13C);

    let mut page = Page::new();
    for offset in 0..32 {
        page.set_word(offset, Some(0x2000 + offset as u16)).unwrap();
    }

    let target = IcspTarget::with_seed(profile.clone(), Image::new(), 5);
    let mut icsp = Icsp::new(target);
    icsp.connect().unwrap();
    icsp.reset_address().unwrap();
    icsp.write_page(Region::Program, 0, Some(&page), &profile)
        .unwrap();

    assert_eq!(icsp.into_inner().commit_count(), 4);
}

#[test]
fn read_faults_are_absorbed_by_retries() {
    let profile = profile(0x138);
    let firmware = sample_firmware(&profile);

    // Seed the device with firmware and make 5% of fetches corrupt one
    // byte. Retries with repositioning must still produce a clean image.
    let mut target = IcspTarget::with_seed(profile.clone(), firmware.clone(), 42);
    target.set_read_fault_rate(0.05);

    let mut flashing = Flashing::start(Icsp::new(target), FlashConfig::default()).unwrap();
    let chip = flashing.read_image().unwrap();
    assert_eq!(chip, firmware);
}

#[test]
fn unknown_id_aborts_before_anything_destructive() {
    let profile = profile(0x138);
    let target = IcspTarget::with_seed(profile, Image::new(), 1);

    // Decoding an enhanced id word with midrange rules yields an id the
    // table does not know.
    let config = FlashConfig {
        family: Family::Midrange,
        ..FlashConfig::default()
    };
    match Flashing::start(Icsp::new(target), config) {
        Err(Error::UnknownDevice { id }) => assert_eq!(id, 0x270),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("identification should have failed"),
    }
}

//! Erase/write/verify orchestration.
//!
//! Drives a [`Protocol`] through a full programming run: identify the
//! chip first (an unknown id aborts before anything destructive), then
//! erase, write program/data/config, and read everything back for the
//! verify comparison. Any page operation that survives its local retry
//! budget aborts the whole run; a partially written part is not safe to
//! keep programming.

use indicatif::ProgressBar;

use crate::device::{DeviceProfile, Family, Registry};
use crate::error::Result;
use crate::memory::{Image, Page};
use crate::protocol::{Protocol, Region};

/// Run options fixed at construction time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashConfig {
    /// Programming family used to decode the raw id word.
    pub family: Family,
    /// Skip the verify pass after writing.
    pub fast: bool,
}

/// One verify mismatch, carrying both sides for display.
pub struct PageDiff {
    pub page_num: usize,
    pub file: Option<Page>,
    pub chip: Option<Page>,
}

pub struct Flashing<P: Protocol> {
    proto: P,
    profile: DeviceProfile,
    config: FlashConfig,
}

impl<P: Protocol> Flashing<P> {
    /// Connect and identify the target. Fails without touching the chip
    /// if the id word decodes to nothing in the device table.
    pub fn start(mut proto: P, config: FlashConfig) -> Result<Self> {
        proto.connect()?;

        let raw = proto.read_id_word()?;
        let (device_id, revision) = config.family.decode_id(raw);
        let profile = Registry::load()?.find(device_id)?;
        log::info!("found chip: {} rev 0x{:02X}", profile, revision);

        Ok(Flashing {
            proto,
            profile,
            config,
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn into_protocol(self) -> P {
        self.proto
    }

    /// Erase the device, write `firmware`, and verify. The returned list
    /// is empty on success; in fast mode verification is skipped.
    pub fn flash(&mut self, firmware: &Image) -> Result<Vec<PageDiff>> {
        log::info!("erasing device");
        self.proto.bulk_erase(&self.profile)?;

        log::info!(
            "writing program pages 0x000..=0x{:03X}",
            self.profile.max_page
        );
        self.proto.reset_address()?;
        let defer_zero = self.proto.defers_page_zero() && firmware.page(0).is_some();
        let bar = ProgressBar::new(self.profile.max_page as u64 + 1);
        for page_num in self.profile.program_pages() {
            if defer_zero && page_num == 0 {
                bar.inc(1);
                continue;
            }
            self.proto
                .write_page(Region::Program, page_num, firmware.page(page_num), &self.profile)?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        if let Some(data_pages) = self.profile.data_pages() {
            log::info!(
                "writing data pages 0x{:03X}..=0x{:03X}",
                data_pages.start(),
                data_pages.end()
            );
            self.proto.reset_address()?;
            for page_num in data_pages {
                self.proto
                    .write_page(Region::Data, page_num, firmware.page(page_num), &self.profile)?;
            }
        }

        if self.proto.writes_config() {
            if let Some(conf) = firmware.page(self.profile.conf_page) {
                log::info!("writing config page 0x{:03X}", self.profile.conf_page);
                self.proto.reset_address()?;
                self.proto.write_config(conf, &self.profile)?;
            }
        }

        if defer_zero {
            log::info!("writing deferred page 0x000");
            self.proto
                .write_page(Region::Program, 0, firmware.page(0), &self.profile)?;
        }

        if self.config.fast {
            log::info!("fast mode, skipping verify");
            return Ok(Vec::new());
        }
        self.verify(firmware)
    }

    /// Read everything back and diff it against `firmware`.
    pub fn verify(&mut self, firmware: &Image) -> Result<Vec<PageDiff>> {
        log::info!("verifying");
        let chip = self.read_image()?;

        let mut check = self.profile.check_pages();
        // A dialect that cannot write the config page must not be blamed
        // for its contents.
        if !self.proto.writes_config() {
            check.retain(|&page_num| page_num != self.profile.conf_page);
        }

        let diffs: Vec<PageDiff> = firmware
            .compare(&chip, check)
            .into_iter()
            .map(|page_num| PageDiff {
                page_num,
                file: firmware.page(page_num).cloned(),
                chip: chip.page(page_num).cloned(),
            })
            .collect();

        if diffs.is_empty() {
            log::info!("verify OK");
        } else {
            log::error!("verify failed on {} page(s)", diffs.len());
        }
        Ok(diffs)
    }

    /// Read the full device: program, data and config, with read-only
    /// config fields blanked so the result matches assembler output.
    pub fn read_image(&mut self) -> Result<Image> {
        let mut image = Image::new();

        self.proto.reset_address()?;
        let bar = ProgressBar::new(self.profile.max_page as u64 + 1);
        for page_num in self.profile.program_pages() {
            let page = self.proto.read_page(Region::Program, page_num, &self.profile)?;
            if !page.is_blank() {
                image.set_page(page_num, Some(page));
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        if let Some(data_pages) = self.profile.data_pages() {
            self.proto.reset_address()?;
            for page_num in data_pages {
                let page = self.proto.read_page(Region::Data, page_num, &self.profile)?;
                if !page.is_blank() {
                    image.set_page(page_num, Some(page));
                }
            }
        }

        let mut conf = self.proto.read_config(&self.profile)?;
        conf.blank_where(self.profile.family.program_blank());
        // Reserved words, the chip id and the calibration words are
        // read-only; keeping them would make every verify fail.
        for offset in [4, 5, 6, 9, 10] {
            conf.set_word(offset, None)?;
        }
        if !conf.is_blank() {
            image.set_page(self.profile.conf_page, Some(conf));
        }

        Ok(image)
    }

    /// Let the target run again.
    pub fn release(&mut self) -> Result<()> {
        self.proto.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Dialect stub that records page writes instead of driving a port.
    struct RecordingDialect {
        defer_zero: bool,
        writes: Vec<(Region, usize)>,
    }

    impl RecordingDialect {
        fn new(defer_zero: bool) -> Self {
            RecordingDialect {
                defer_zero,
                writes: Vec::new(),
            }
        }
    }

    impl Protocol for RecordingDialect {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_id_word(&mut self) -> Result<u16> {
            Ok(Family::Enhanced.encode_id(0x138, 5))
        }

        fn bulk_erase(&mut self, _profile: &DeviceProfile) -> Result<()> {
            Ok(())
        }

        fn reset_address(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_page(
            &mut self,
            region: Region,
            page_num: usize,
            page: Option<&Page>,
            _profile: &DeviceProfile,
        ) -> Result<()> {
            if page.is_some() {
                self.writes.push((region, page_num));
            }
            Ok(())
        }

        fn read_page(
            &mut self,
            _region: Region,
            _page_num: usize,
            _profile: &DeviceProfile,
        ) -> Result<Page> {
            Ok(Page::new())
        }

        fn read_config(&mut self, _profile: &DeviceProfile) -> Result<Page> {
            Ok(Page::new())
        }

        fn write_config(&mut self, _page: &Page, _profile: &DeviceProfile) -> Result<()> {
            Ok(())
        }

        fn writes_config(&self) -> bool {
            false
        }

        fn defers_page_zero(&self) -> bool {
            self.defer_zero
        }

        fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn firmware() -> Image {
        let mut page = Page::new();
        page.set_word(0, Some(0x2820)).unwrap();

        let mut image = Image::new();
        image.set_page(0, Some(page.clone()));
        image.set_page(3, Some(page.clone()));
        image.set_page(0x780, Some(page));
        image
    }

    fn fast_config() -> FlashConfig {
        FlashConfig {
            fast: true,
            ..FlashConfig::default()
        }
    }

    #[test]
    fn bootloader_dialect_writes_page_zero_last() {
        let mut flashing = Flashing::start(RecordingDialect::new(true), fast_config()).unwrap();
        flashing.flash(&firmware()).unwrap();

        let writes = &flashing.proto.writes;
        assert_eq!(writes.last(), Some(&(Region::Program, 0)));
        assert!(writes.contains(&(Region::Program, 3)));
        assert!(writes.contains(&(Region::Data, 0x780)));
    }

    #[test]
    fn cursor_dialect_writes_pages_in_order() {
        let mut flashing = Flashing::start(RecordingDialect::new(false), fast_config()).unwrap();
        flashing.flash(&firmware()).unwrap();

        let program: Vec<usize> = flashing
            .proto
            .writes
            .iter()
            .filter(|(region, _)| *region == Region::Program)
            .map(|&(_, page_num)| page_num)
            .collect();
        assert_eq!(program, vec![0, 3]);
    }
}

//! BLoad bootloader dialect.
//!
//! The resident bootloader exposes whole-page commands with absolute
//! addressing: every frame is a command byte, the page's word address as
//! LE16, an optional 64-byte payload and an additive checksum. The target
//! answers each frame with a `K` prompt, or a `CK`/`RK` NAK pair.

use std::thread::sleep;
use std::time::Duration;

use scroll::{LE, Pread};

use super::{
    READ_RETRIES, Protocol, Region, checksum, encode_address, expect_greeting, expect_prompt,
    recv_n, resync, send, wait_prompt,
};
use crate::constants::{PAGE_BYTES, PAGE_WORDS, PROMPT, bload};
use crate::device::{DeviceProfile, Family};
use crate::error::{Error, Result};
use crate::memory::Page;
use crate::transport::Transport;

const INFO_LEN: usize = 16;

/// Bootloader self-description, returned by the `I` command.
///
/// Addresses are word addresses as the bootloader reports them; use
/// [`BootInfo::boot_pages`] for the page-number view.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootInfo {
    pub version: u8,
    pub page_size: u8,
    pub boot_start: u16,
    pub boot_size: u16,
    pub data_start: u16,
    pub data_end: u16,
    pub code_end: u16,
}

impl BootInfo {
    fn parse(raw: &[u8]) -> Result<Self> {
        Ok(BootInfo {
            version: raw.pread_with(0, LE)?,
            page_size: raw.pread_with(1, LE)?,
            boot_start: raw.pread_with(2, LE)?,
            boot_size: raw.pread_with(4, LE)?,
            data_start: raw.pread_with(6, LE)?,
            data_end: raw.pread_with(8, LE)?,
            code_end: raw.pread_with(10, LE)?,
        })
    }

    /// Pages occupied by the bootloader itself. `None` for v1.0 loaders
    /// that never answered the info command.
    pub fn boot_pages(&self) -> Option<std::ops::RangeInclusive<usize>> {
        if self.page_size == 0 || self.boot_size == 0 {
            return None;
        }
        let page_size = self.page_size as usize;
        let start = (self.boot_start as usize & 0x7FFF) / page_size;
        let end = start + self.boot_size as usize / page_size - 1;
        Some(start..=end)
    }

    /// v1.1+ loaders take data pages in the same 64-byte layout as
    /// program pages; v1.0 wants packed low bytes, two pages per frame.
    pub fn paged_data(&self) -> bool {
        self.version >= 0x11
    }
}

/// Result of the `T` address probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    Writable,
    Restricted,
}

pub struct BLoad<T: Transport> {
    com: T,
    info: BootInfo,
    // Buffered low-byte half of a legacy data-page pair.
    pending_data: Option<(usize, Vec<u8>)>,
}

/// Build one command frame: command, LE16 word address, payload, checksum.
fn frame(cmd: u8, page_num: usize, data: &[u8]) -> Vec<u8> {
    let addr = encode_address(page_num);
    let mut raw = Vec::with_capacity(4 + data.len());
    raw.push(cmd);
    raw.extend_from_slice(&addr);
    raw.extend_from_slice(data);
    raw.push(checksum(&raw[1..]));
    raw
}

impl<T: Transport> BLoad<T> {
    pub fn new(com: T) -> Self {
        BLoad {
            com,
            info: BootInfo::default(),
            pending_data: None,
        }
    }

    pub fn info(&self) -> &BootInfo {
        &self.info
    }

    pub fn into_inner(self) -> T {
        self.com
    }

    /// Send a frame and require the `K` ack. NAK pairs map to their error
    /// kinds; writes are never retried here.
    fn write_frame(&mut self, raw: &[u8], page_num: usize) -> Result<()> {
        send(&mut self.com, raw)?;
        let seen = wait_prompt(&mut self.com)?;
        match seen.as_slice() {
            [PROMPT] => Ok(()),
            [bload::NAK_CHECKSUM, PROMPT] => Err(Error::FrameNak),
            [bload::NAK_RANGE, PROMPT] => Err(Error::Address {
                addr: page_num * PAGE_BYTES / 2,
                reason: "outside the bootloader's writable range",
            }),
            [] => Err(Error::ShortRead { want: 1, got: 0 }),
            other => Err(Error::Protocol(format!(
                "unexpected write ack {}",
                hex::encode(other)
            ))),
        }
    }

    /// One read exchange: payload, trailing checksum, prompt.
    fn try_read_block(&mut self, raw_cmd: &[u8]) -> Result<Vec<u8>> {
        send(&mut self.com, raw_cmd)?;

        let data = recv_n(&mut self.com, PAGE_BYTES)?;
        if data.as_slice() == [bload::NAK_CHECKSUM, PROMPT] {
            return Err(Error::FrameNak);
        }
        if data.len() < PAGE_BYTES {
            return Err(Error::ShortRead {
                want: PAGE_BYTES,
                got: data.len(),
            });
        }

        let sum = recv_n(&mut self.com, 1)?;
        let want = checksum(&data);
        match sum.first() {
            None => Err(Error::ShortRead {
                want: PAGE_BYTES + 1,
                got: PAGE_BYTES,
            }),
            Some(&got) if got != want => {
                // The prompt trails the bad checksum; leave the line clean
                // so the resync that follows sees a quiet target.
                wait_prompt(&mut self.com)?;
                Err(Error::Checksum { got, want })
            }
            Some(_) => {
                expect_prompt(&mut self.com)?;
                Ok(data)
            }
        }
    }

    /// Read one 64-byte block with the shared retry/resync policy.
    fn read_block(&mut self, raw_cmd: &[u8], page_num: usize) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_read_block(raw_cmd) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && attempt < READ_RETRIES => {
                    log::warn!("read of page 0x{page_num:03X} failed ({e}), resyncing");
                    resync(&mut self.com, PROMPT)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_info(&mut self) -> Result<BootInfo> {
        send(&mut self.com, &[bload::INFO, 0])?;

        let data = recv_n(&mut self.com, INFO_LEN)?;
        if data.as_slice() == [bload::NAK_CHECKSUM, PROMPT] {
            return Err(Error::FrameNak);
        }
        if data.len() < 4 {
            // Pre-1.1 loaders do not know the command at all.
            log::warn!("no answer to the info command, assuming a v1.0 bootloader");
            return Ok(BootInfo::default());
        }
        if data.len() < INFO_LEN {
            return Err(Error::ShortRead {
                want: INFO_LEN,
                got: data.len(),
            });
        }

        let sum = recv_n(&mut self.com, 1)?;
        let want = checksum(&data);
        match sum.first() {
            None => {
                return Err(Error::ShortRead {
                    want: INFO_LEN + 1,
                    got: INFO_LEN,
                });
            }
            Some(&got) if got != want => {
                wait_prompt(&mut self.com)?;
                return Err(Error::Checksum { got, want });
            }
            Some(_) => expect_prompt(&mut self.com)?,
        }

        BootInfo::parse(&data)
    }

    /// `T` probe: ask whether a page may be written without writing it.
    pub fn probe(&mut self, page_num: usize) -> Result<PageAccess> {
        let raw = frame(bload::PROBE, page_num, &[]);
        send(&mut self.com, &raw)?;

        let first = recv_n(&mut self.com, 1)?;
        match first.first() {
            Some(&PROMPT) => Ok(PageAccess::Writable),
            Some(&bload::NAK_RANGE) => {
                expect_prompt(&mut self.com)?;
                Ok(PageAccess::Restricted)
            }
            Some(&bload::NAK_CHECKSUM) => {
                expect_prompt(&mut self.com)?;
                Err(Error::FrameNak)
            }
            Some(&other) => Err(Error::Protocol(format!("probe answered 0x{other:02X}"))),
            None => Err(Error::ShortRead { want: 1, got: 0 }),
        }
    }

    /// v1.0 data writes pack the low bytes of two consecutive pages into
    /// one 64-byte frame addressed by the pair's offset into the data
    /// region. Even pages are buffered until their companion arrives.
    fn write_data_legacy(
        &mut self,
        page_num: usize,
        page: Option<&Page>,
        profile: &DeviceProfile,
    ) -> Result<()> {
        let low: Vec<u8> = match page {
            Some(p) => p
                .iter()
                .map(|w| w.unwrap_or(Family::DATA_BLANK) as u8)
                .collect(),
            None => vec![0xFF; PAGE_WORDS],
        };

        let rel = page_num - profile.min_data;
        if rel % 2 == 0 {
            if page_num < profile.max_data {
                self.pending_data = Some((rel, low));
                return Ok(());
            }
            // Last page of an odd-length range: no companion will come,
            // so pad the high half with erased bytes and flush now.
            let mut data = low;
            data.resize(PAGE_WORDS * 2, 0xFF);
            let raw = frame(bload::WRITE_DATA, rel, &data);
            return self.write_frame(&raw, rel);
        }

        let (first_rel, mut data) = self
            .pending_data
            .take()
            .unwrap_or_else(|| (rel - 1, vec![0xFF; PAGE_WORDS]));
        data.extend_from_slice(&low);

        let raw = frame(bload::WRITE_DATA, first_rel, &data);
        self.write_frame(&raw, first_rel)
    }
}

impl<T: Transport> Protocol for BLoad<T> {
    fn connect(&mut self) -> Result<()> {
        // DTR resets the target; the break signal then diverts it into
        // the bootloader instead of the application.
        sleep(Duration::from_millis(50));
        self.com.pulse_dtr(250)?;
        sleep(Duration::from_millis(50));
        self.com.flush()?;
        self.com.pulse_break(200)?;

        expect_greeting(&mut self.com)?;

        self.info = self.get_info()?;
        log::info!(
            "bootloader v{}.{}",
            self.info.version >> 4,
            self.info.version & 0x0F
        );
        if let Some(boot) = self.info.boot_pages() {
            log::info!(
                "bootloader region 0x{:03X}..=0x{:03X}",
                boot.start(),
                boot.end()
            );
        }
        Ok(())
    }

    fn read_id_word(&mut self) -> Result<u16> {
        let data = self.read_block(&[bload::READ_CONFIG, 0], 0)?;
        Ok(data.pread_with(crate::constants::icsp::ID_OFFSET * 2, LE)?)
    }

    // The bootloader erases as it writes; absent pages are erased
    // individually in write_page.
    fn bulk_erase(&mut self, _profile: &DeviceProfile) -> Result<()> {
        Ok(())
    }

    // Frames carry absolute addresses; there is no cursor to reset.
    fn reset_address(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_page(
        &mut self,
        region: Region,
        page_num: usize,
        page: Option<&Page>,
        profile: &DeviceProfile,
    ) -> Result<()> {
        if region == Region::Program {
            if let Some(boot) = self.info.boot_pages() {
                if boot.contains(&page_num) {
                    log::warn!("skipping bootloader page 0x{page_num:03X}");
                    return Ok(());
                }
            }
        }

        let raw = match (region, page) {
            (Region::Program, None) => frame(bload::ERASE_PROGRAM, page_num, &[]),
            (Region::Program, Some(p)) => frame(
                bload::WRITE_PROGRAM,
                page_num,
                &p.to_bytes(profile.family.program_blank()),
            ),
            (Region::Data, page) if !self.info.paged_data() => {
                return self.write_data_legacy(page_num, page, profile);
            }
            (Region::Data, None) => frame(bload::WRITE_DATA, page_num, &[0xFF; PAGE_BYTES]),
            (Region::Data, Some(p)) => frame(
                bload::WRITE_DATA,
                page_num,
                &p.to_bytes(Family::DATA_BLANK),
            ),
        };
        self.write_frame(&raw, page_num)
    }

    fn read_page(
        &mut self,
        region: Region,
        page_num: usize,
        profile: &DeviceProfile,
    ) -> Result<Page> {
        let (cmd, blank) = match region {
            Region::Program => (bload::READ_PROGRAM, profile.family.program_blank()),
            Region::Data => (bload::READ_DATA, Family::DATA_BLANK),
        };
        let raw = frame(cmd, page_num, &[]);
        let data = self.read_block(&raw, page_num)?;

        let mut page = Page::from_bytes(&data)?;
        page.blank_where(blank);
        Ok(page)
    }

    fn read_config(&mut self, profile: &DeviceProfile) -> Result<Page> {
        let data = self.read_block(&[bload::READ_CONFIG, 0], profile.conf_page)?;
        Page::from_bytes(&data)
    }

    fn write_config(&mut self, _page: &Page, _profile: &DeviceProfile) -> Result<()> {
        log::debug!("bootloader cannot rewrite the config page");
        Ok(())
    }

    fn writes_config(&self) -> bool {
        false
    }

    // The reset-vector stub on page 0 is what re-enters the bootloader;
    // it must only be replaced once the rest of the image is in place.
    fn defers_page_zero(&self) -> bool {
        true
    }

    fn release(&mut self) -> Result<()> {
        send(&mut self.com, &[bload::RESET, 0])?;
        Ok(())
    }
}

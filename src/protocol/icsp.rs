//! ICSP host-controller dialect.
//!
//! The host controller drives the target's programming pins directly, so
//! addressing is a cursor the target advances on every fetch, load or
//! jump. Each command is acknowledged with a `K` prompt; `F`/`G` fetches
//! answer with the payload, an additive checksum, then the prompt.
//!
//! Because fetches move the cursor, a failed read cannot simply be
//! reissued: the retry path repositions the cursor (address reset plus a
//! forward jump, or a fresh config-segment load) before fetching again.

use std::thread::sleep;
use std::time::Duration;

use scroll::{LE, Pread};

use super::{
    READ_RETRIES, Protocol, Region, checksum, exchange_prompt, expect_greeting, expect_prompt,
    recv_n, resync, send,
};
use crate::constants::{PAGE_WORDS, icsp};
use crate::device::{DeviceProfile, Family};
use crate::error::{Error, Result};
use crate::memory::Page;
use crate::transport::Transport;

/// Minimum physical commit time for a program/erase pulse.
const COMMIT_PAUSE_MS: u64 = 3;

/// Cursor placement for a fetch.
#[derive(Debug, Clone, Copy)]
enum Seek {
    /// Absolute word address, reached by an address reset plus a jump.
    Absolute(usize),
    /// Offset into the config segment, reached by a config load.
    Config(usize),
}

pub struct Icsp<T: Transport> {
    com: T,
    version: String,
}

impl<T: Transport> Icsp<T> {
    pub fn new(com: T) -> Self {
        Icsp {
            com,
            version: String::new(),
        }
    }

    /// Controller firmware version reported at connect time.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn into_inner(self) -> T {
        self.com
    }

    fn exchange(&mut self, raw: &[u8]) -> Result<()> {
        exchange_prompt(&mut self.com, raw)
    }

    /// Target-command subcode behind the `C` opcode.
    fn cmd(&mut self, sub: u8) -> Result<()> {
        self.exchange(&[icsp::COMMAND, sub])
    }

    fn send_word(&mut self, word: u16) -> Result<()> {
        let [lo, hi] = word.to_le_bytes();
        self.exchange(&[icsp::SEND_WORD, lo, hi])
    }

    /// Move the cursor forward `count` words.
    fn jump(&mut self, count: usize) -> Result<()> {
        let [lo, hi] = (count as u16).to_le_bytes();
        self.exchange(&[icsp::JUMP, lo, hi])
    }

    /// Select the config segment and park the cursor at its base.
    fn load_config(&mut self) -> Result<()> {
        self.cmd(icsp::SUB_LOAD_CONFIG)?;
        self.send_word(0)
    }

    /// Fire a program or erase pulse and wait out the physical commit
    /// time before expecting the ack.
    fn pulse(&mut self, sub: u8) -> Result<()> {
        self.cmd(sub)?;
        send(&mut self.com, &[icsp::PAUSE])?;
        sleep(Duration::from_millis(COMMIT_PAUSE_MS));
        expect_prompt(&mut self.com)
    }

    fn program_commit(&mut self) -> Result<()> {
        self.pulse(icsp::SUB_PROGRAM_INT)
    }

    fn seek(&mut self, seek: Seek) -> Result<()> {
        match seek {
            Seek::Absolute(word) => {
                self.cmd(icsp::SUB_RESET_ADDRESS)?;
                if word > 0 {
                    self.jump(word)?;
                }
            }
            Seek::Config(offset) => {
                self.load_config()?;
                if offset > 0 {
                    self.jump(offset)?;
                }
            }
        }
        Ok(())
    }

    /// One fetch exchange: payload, trailing checksum, prompt.
    fn try_fetch(&mut self, op: u8, words: usize) -> Result<Vec<u8>> {
        let [lo, hi] = (words as u16).to_le_bytes();
        send(&mut self.com, &[op, lo, hi])?;

        let want_len = words * 2;
        let data = recv_n(&mut self.com, want_len)?;
        if data.len() < want_len {
            return Err(Error::ShortRead {
                want: want_len,
                got: data.len(),
            });
        }

        let sum = recv_n(&mut self.com, 1)?;
        let want = checksum(&data);
        match sum.first() {
            None => Err(Error::ShortRead {
                want: want_len + 1,
                got: want_len,
            }),
            Some(&got) if got != want => {
                // The prompt trails the bad checksum; drain it so the
                // resync that follows sees a quiet line.
                super::wait_prompt(&mut self.com)?;
                Err(Error::Checksum { got, want })
            }
            Some(_) => {
                expect_prompt(&mut self.com)?;
                Ok(data)
            }
        }
    }

    /// Fetch `words` from `seek`, repositioning and retrying on transient
    /// wire failures.
    fn fetch(&mut self, op: u8, seek: Seek, words: usize) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.seek(seek)?;
            match self.try_fetch(op, words) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && attempt < READ_RETRIES => {
                    log::warn!("fetch at {seek:?} failed ({e}), resyncing");
                    resync(&mut self.com, icsp::SYNC)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_version(&mut self) -> Result<String> {
        send(&mut self.com, &[icsp::VERSION])?;
        let line = self.com.read_line()?;
        expect_prompt(&mut self.com)?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    fn log_status(&mut self) -> Result<()> {
        send(&mut self.com, &[icsp::STATUS])?;
        let status = recv_n(&mut self.com, icsp::STATUS_LEN)?;
        expect_prompt(&mut self.com)?;
        log::debug!("controller lines: {}", hex::encode(&status));
        Ok(())
    }
}

impl<T: Transport> Protocol for Icsp<T> {
    fn connect(&mut self) -> Result<()> {
        sleep(Duration::from_millis(50));
        self.com.flush()?;
        self.com.pulse_dtr(250)?;
        sleep(Duration::from_millis(50));

        expect_greeting(&mut self.com)?;
        self.com.flush()?;

        self.version = self.get_version()?;
        log::info!("controller version {}", self.version);

        // Hold the target in programming mode for the whole session.
        self.exchange(&[icsp::ENGAGE])?;
        self.log_status()?;
        Ok(())
    }

    fn read_id_word(&mut self) -> Result<u16> {
        let data = self.fetch(icsp::FETCH_PROGRAM, Seek::Config(icsp::ID_OFFSET), 1)?;
        Ok(data.pread_with(0, LE)?)
    }

    fn bulk_erase(&mut self, profile: &DeviceProfile) -> Result<()> {
        // Erasing from the config segment wipes the user id words too.
        self.load_config()?;
        self.pulse(icsp::SUB_ERASE_PROGRAM)?;
        if profile.data_pages().is_some() {
            self.pulse(icsp::SUB_ERASE_DATA)?;
        }
        Ok(())
    }

    fn reset_address(&mut self) -> Result<()> {
        self.cmd(icsp::SUB_RESET_ADDRESS)
    }

    fn write_page(
        &mut self,
        region: Region,
        page_num: usize,
        page: Option<&Page>,
        profile: &DeviceProfile,
    ) -> Result<()> {
        // The device is bulk-erased up front, so absent program pages
        // only need the cursor moved past them. Data pages are seeked
        // absolutely, so an absent one needs nothing at all.
        let Some(page) = page else {
            return match region {
                Region::Program => self.jump(PAGE_WORDS),
                Region::Data => Ok(()),
            };
        };

        match region {
            Region::Program => {
                let blank = profile.family.program_blank();
                let latches = profile.num_latches.max(1);
                let total = PAGE_WORDS;
                for (i, word) in page.iter().enumerate() {
                    self.cmd(icsp::SUB_LOAD_PROGRAM)?;
                    self.send_word(word.unwrap_or(blank))?;
                    // Commit once the latch bank is full or the page ends.
                    let count = i + 1;
                    if count % latches == 0 || count == total {
                        self.program_commit()?;
                    }
                    self.cmd(icsp::SUB_INCREMENT)?;
                }
            }
            Region::Data => {
                // Data memory shares the cursor with program memory, so
                // place it on the page explicitly.
                self.seek(Seek::Absolute(page_num * PAGE_WORDS))?;
                for word in page.iter() {
                    self.cmd(icsp::SUB_LOAD_DATA)?;
                    self.send_word(word.unwrap_or(Family::DATA_BLANK))?;
                    self.program_commit()?;
                    self.cmd(icsp::SUB_INCREMENT)?;
                }
            }
        }
        Ok(())
    }

    fn read_page(
        &mut self,
        region: Region,
        page_num: usize,
        profile: &DeviceProfile,
    ) -> Result<Page> {
        let (op, blank) = match region {
            Region::Program => (icsp::FETCH_PROGRAM, profile.family.program_blank()),
            Region::Data => (icsp::GET_DATA, Family::DATA_BLANK),
        };
        let data = self.fetch(op, Seek::Absolute(page_num * PAGE_WORDS), PAGE_WORDS)?;

        let mut page = Page::from_bytes(&data)?;
        page.blank_where(blank);
        Ok(page)
    }

    fn read_config(&mut self, profile: &DeviceProfile) -> Result<Page> {
        let data = self.fetch(icsp::FETCH_PROGRAM, Seek::Config(0), profile.conf_len)?;
        Page::from_bytes(&data)
    }

    fn write_config(&mut self, page: &Page, profile: &DeviceProfile) -> Result<()> {
        let blank = profile.family.program_blank();
        self.load_config()?;
        // Config words latch singly; every word gets its own commit.
        for word in page.iter().take(profile.conf_len) {
            self.cmd(icsp::SUB_LOAD_PROGRAM)?;
            self.send_word(word.unwrap_or(blank))?;
            self.program_commit()?;
            self.cmd(icsp::SUB_INCREMENT)?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.exchange(&[icsp::RELEASE])
    }
}

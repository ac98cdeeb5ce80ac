//! Device-side ICSP simulator.
//!
//! Implements the host-controller wire contract from the target's side of
//! the serial line, behind the same [`Transport`] trait the real port
//! uses. Every host write runs the command machine to completion, so by
//! the time the host reads, the full response is queued; this is the
//! protocol made executable, and what the engine and orchestrator are
//! tested against.
//!
//! Fault injection: independent read-path and write-path corruption rates
//! driven by a seedable RNG, plus a deterministic corrupt-one-page hook
//! for verify tests. Read faults flip a payload byte after the checksum
//! is computed, so the host sees the mismatch; write faults flip a
//! committed word silently, so only verify catches them.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::constants::{PAGE_WORDS, PROMPT, icsp};
use crate::device::{DeviceProfile, Family};
use crate::error::Result;
use crate::memory::Image;
use crate::protocol::checksum;
use crate::transport::Transport;

/// Silicon revision reported in the synthesized id word.
const REVISION: u16 = 0x05;

const VERSION_LINE: &[u8] = b"V1.8\n";

/// Segment selected by a pending load command, consumed by the next `W`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Load {
    Config,
    Program,
    Data,
}

pub struct IcspTarget {
    profile: DeviceProfile,
    image: Image,

    inq: VecDeque<u8>,
    outq: VecDeque<u8>,

    address: usize,
    latches: Vec<Option<u16>>,
    data_latch: Option<u16>,
    pending: Option<Load>,
    engaged: bool,
    halted: bool,

    rng: StdRng,
    read_fault_rate: f64,
    write_fault_rate: f64,
    corrupt_write_page: Option<usize>,

    commit_count: usize,
    usage_errors: usize,
}

impl IcspTarget {
    pub fn new(profile: DeviceProfile, image: Image) -> Self {
        Self::with_seed(profile, image, rand::rng().random())
    }

    pub fn with_seed(profile: DeviceProfile, image: Image, seed: u64) -> Self {
        let latches = vec![None; profile.num_latches.max(1)];
        IcspTarget {
            profile,
            image,
            inq: VecDeque::new(),
            outq: VecDeque::new(),
            address: 0,
            latches,
            data_latch: None,
            pending: None,
            engaged: false,
            halted: false,
            rng: StdRng::seed_from_u64(seed),
            read_fault_rate: 0.0,
            write_fault_rate: 0.0,
            corrupt_write_page: None,
            commit_count: 0,
            usage_errors: 0,
        }
    }

    /// Probability that a fetch response gets one byte flipped.
    pub fn set_read_fault_rate(&mut self, rate: f64) {
        self.read_fault_rate = rate;
    }

    /// Probability that a commit stores one corrupted word.
    pub fn set_write_fault_rate(&mut self, rate: f64) {
        self.write_fault_rate = rate;
    }

    /// Corrupt exactly one commit landing on `page_num`, then disarm.
    pub fn corrupt_write_on_page(&mut self, page_num: usize) {
        self.corrupt_write_page = Some(page_num);
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Program-pulse commits issued so far.
    pub fn commit_count(&self) -> usize {
        self.commit_count
    }

    /// Commands rejected as protocol misuse.
    pub fn usage_errors(&self) -> usize {
        self.usage_errors
    }

    fn prompt(&mut self) {
        self.outq.push_back(PROMPT);
    }

    fn usage_error(&mut self, what: &str) {
        log::debug!("target rejected {what}");
        self.usage_errors += 1;
        self.outq.push_back(b'E');
        self.prompt();
    }

    fn reset(&mut self) {
        self.inq.clear();
        self.outq.clear();
        self.address = 0;
        self.latches.iter_mut().for_each(|slot| *slot = None);
        self.data_latch = None;
        self.pending = None;
        self.engaged = false;
        self.halted = false;
        // Greeting prompt, as the real controller sends out of reset.
        self.prompt();
    }

    fn in_data_region(&self, page_num: usize) -> bool {
        self.profile
            .data_pages()
            .is_some_and(|range| range.contains(&page_num))
    }

    fn read_word(&self, addr: usize) -> u16 {
        if addr == icsp::CONFIG_BASE + icsp::ID_OFFSET {
            return self
                .profile
                .family
                .encode_id(self.profile.device_id as u16, REVISION);
        }

        let page_num = addr / PAGE_WORDS;
        let offset = addr % PAGE_WORDS;
        let stored = self
            .image
            .page(page_num)
            .and_then(|p| p.word(offset).ok().flatten());

        if self.in_data_region(page_num) {
            stored.unwrap_or(Family::DATA_BLANK) & Family::DATA_BLANK
        } else {
            let family = self.profile.family;
            stored.unwrap_or(family.program_blank()) & family.word_mask()
        }
    }

    fn store_word(&mut self, addr: usize, word: u16) -> Result<()> {
        self.image
            .page_entry(addr / PAGE_WORDS)
            .set_word(addr % PAGE_WORDS, Some(word))
    }

    /// Whether this commit should be silently corrupted.
    fn take_write_fault(&mut self, page_num: usize) -> bool {
        if self.corrupt_write_page == Some(page_num) {
            self.corrupt_write_page = None;
            return true;
        }
        self.write_fault_rate > 0.0 && self.rng.random_bool(self.write_fault_rate)
    }

    fn commit(&mut self) -> Result<()> {
        self.commit_count += 1;

        if let Some(byte) = self.data_latch.take() {
            let mut word = byte;
            if self.take_write_fault(self.address / PAGE_WORDS) {
                word ^= 0x15;
            }
            return self.store_word(self.address, word);
        }

        let group_len = self.latches.len();
        let group_base = self.address - self.address % group_len;
        let mut loaded: Vec<(usize, u16)> = self
            .latches
            .iter()
            .enumerate()
            .filter_map(|(slot, word)| word.map(|w| (slot, w)))
            .collect();
        self.latches.iter_mut().for_each(|slot| *slot = None);

        if !loaded.is_empty() && self.take_write_fault(group_base / PAGE_WORDS) {
            loaded[0].1 ^= 0x15;
        }
        for (slot, word) in loaded {
            self.store_word(group_base + slot, word)?;
        }
        Ok(())
    }

    fn erase_program(&mut self) {
        for page_num in self.profile.program_pages() {
            self.image.set_page(page_num, None);
        }
        self.image.set_page(self.profile.conf_page, None);
        self.latches.iter_mut().for_each(|slot| *slot = None);
    }

    fn erase_data(&mut self) {
        if let Some(range) = self.profile.data_pages() {
            for page_num in range {
                self.image.set_page(page_num, None);
            }
        }
    }

    /// Serve a fetch: payload words, clean checksum, prompt. Read faults
    /// are applied after the checksum so the host can detect them.
    fn fetch(&mut self, words: usize, data_region: bool) {
        if data_region {
            let base = self.profile.min_data * PAGE_WORDS;
            if self.address < base {
                self.address = base;
            }
        }

        let mut payload = Vec::with_capacity(words * 2);
        for _ in 0..words {
            payload.extend_from_slice(&self.read_word(self.address).to_le_bytes());
            self.address += 1;
        }
        let sum = checksum(&payload);

        if self.read_fault_rate > 0.0
            && !payload.is_empty()
            && self.rng.random_bool(self.read_fault_rate)
        {
            let victim = self.rng.random_range(0..payload.len());
            payload[victim] ^= 0x80;
            log::trace!("injected read fault at payload byte {victim}");
        }

        self.outq.extend(payload);
        self.outq.push_back(sum);
        self.prompt();
    }

    fn target_command(&mut self, sub: u8) -> Result<()> {
        match sub {
            icsp::SUB_LOAD_CONFIG | icsp::SUB_LOAD_PROGRAM | icsp::SUB_LOAD_DATA => {
                if self.pending.is_some() {
                    self.usage_error("load with a load already pending");
                    return Ok(());
                }
                self.pending = Some(match sub {
                    icsp::SUB_LOAD_CONFIG => {
                        self.address = icsp::CONFIG_BASE;
                        Load::Config
                    }
                    icsp::SUB_LOAD_PROGRAM => Load::Program,
                    _ => Load::Data,
                });
                self.prompt();
            }
            icsp::SUB_INCREMENT => {
                self.address += 1;
                self.prompt();
            }
            icsp::SUB_RESET_ADDRESS => {
                self.address = 0;
                self.prompt();
            }
            icsp::SUB_PROGRAM_INT | icsp::SUB_PROGRAM_EXT => {
                self.commit()?;
                self.prompt();
            }
            icsp::SUB_PROGRAM_END => self.prompt(),
            icsp::SUB_ERASE_PROGRAM => {
                self.erase_program();
                self.prompt();
            }
            icsp::SUB_ERASE_DATA => {
                self.erase_data();
                self.prompt();
            }
            other => self.usage_error(&format!("unknown subcommand 0x{other:02X}")),
        }
        Ok(())
    }

    fn load_word(&mut self, word: u16) {
        match self.pending.take() {
            // The word after a config load is a dummy.
            Some(Load::Config) => {}
            Some(Load::Program) => {
                let slot = self.address % self.latches.len();
                self.latches[slot] = Some(word & self.profile.family.word_mask());
            }
            Some(Load::Data) => self.data_latch = Some(word & Family::DATA_BLANK),
            None => {
                self.usage_error("word with no load pending");
                return;
            }
        }
        self.prompt();
    }

    fn step(&mut self, op: u8, args: &[u8]) -> Result<()> {
        let arg16 = u16::from_le_bytes([
            args.first().copied().unwrap_or(0),
            args.get(1).copied().unwrap_or(0),
        ]) as usize;

        // Only line queries and the session commands work disengaged.
        let gated = matches!(
            op,
            icsp::COMMAND | icsp::SEND_WORD | icsp::JUMP | icsp::FETCH_PROGRAM | icsp::GET_DATA
        );
        if gated && !self.engaged {
            self.usage_error("command while not in programming mode");
            return Ok(());
        }

        match op {
            icsp::VERSION => {
                self.outq.extend(VERSION_LINE);
                self.prompt();
            }
            icsp::ENGAGE => {
                self.engaged = true;
                self.address = 0;
                self.prompt();
            }
            icsp::RELEASE => {
                self.engaged = false;
                self.prompt();
            }
            icsp::SYNC => self.prompt(),
            icsp::PAUSE => self.prompt(),
            icsp::LINE => self.prompt(),
            icsp::STATUS => {
                let lines: [u8; icsp::STATUS_LEN] =
                    [b'0', b'1', if self.engaged { b'1' } else { b'0' }, b'0', b'0', b'0', b'0', b'0'];
                self.outq.extend(lines);
                self.prompt();
            }
            icsp::COMMAND => self.target_command(args[0])?,
            icsp::SEND_WORD => self.load_word(arg16 as u16),
            icsp::JUMP => {
                self.address += arg16;
                self.prompt();
            }
            icsp::FETCH_PROGRAM => self.fetch(arg16, false),
            icsp::GET_DATA => self.fetch(arg16, true),
            other => self.usage_error(&format!("unknown opcode 0x{other:02X}")),
        }
        Ok(())
    }

    /// Drain complete commands from the inbound queue.
    fn run(&mut self) -> Result<()> {
        loop {
            let Some(&op) = self.inq.front() else {
                return Ok(());
            };
            let argc = match op {
                icsp::COMMAND | icsp::LINE => 1,
                icsp::JUMP | icsp::FETCH_PROGRAM | icsp::GET_DATA | icsp::SEND_WORD => 2,
                _ => 0,
            };
            if self.inq.len() < 1 + argc {
                return Ok(());
            }

            self.inq.pop_front();
            let mut args = [0u8; 2];
            for arg in args.iter_mut().take(argc) {
                *arg = self.inq.pop_front().unwrap_or(0);
            }
            self.step(op, &args[..argc])?;
        }
    }
}

impl Transport for IcspTarget {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.outq.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inq.extend(data);
        if !self.halted {
            self.run()?;
        }
        Ok(())
    }

    fn avail(&mut self) -> Result<usize> {
        Ok(self.outq.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.outq.clear();
        Ok(())
    }

    /// The DTR edge is the hardware reset line.
    fn pulse_dtr(&mut self, _millis: u64) -> Result<()> {
        self.reset();
        Ok(())
    }

    /// Break halts the controller until the next reset.
    fn pulse_break(&mut self, _millis: u64) -> Result<()> {
        self.halted = true;
        self.outq.clear();
        Ok(())
    }
}

//! Command framing, checksums and the dialect-independent protocol surface.
//!
//! Two wire dialects talk to a target: the bootloader-resident BLoad
//! protocol and the low-level ICSP pin-control protocol. Both share the
//! framing primitives here and plug into the orchestrator through the
//! [`Protocol`] trait, so erase/write/verify sequencing is written once.

use crate::constants::{PAGE_BYTES, PROMPT};
use crate::device::DeviceProfile;
use crate::error::{Error, Result};
use crate::memory::Page;
use crate::transport::Transport;

pub use self::bload::{BLoad, BootInfo, PageAccess};
pub use self::icsp::Icsp;

pub mod bload;
pub mod icsp;

/// Read attempts per page before the failure escalates.
pub const READ_RETRIES: usize = 5;
/// Consecutive empty reads tolerated while hunting for the prompt.
const IDLE_READS: usize = 3;
/// Upper bound on bytes drained during one prompt hunt.
const MAX_DRAIN: usize = 256;

/// 8-bit additive checksum covering every byte after the command byte.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Word address of a page, as the 16-bit little-endian field both
/// protocols carry after the command byte.
pub fn encode_address(page_num: usize) -> [u8; 2] {
    ((page_num * PAGE_BYTES / 2) as u16).to_le_bytes()
}

pub fn decode_address(raw: [u8; 2]) -> usize {
    u16::from_le_bytes(raw) as usize * 2 / PAGE_BYTES
}

/// Memory region addressed by a page operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Program,
    Data,
}

/// One programming dialect. The orchestrator drives page loops in
/// ascending order from a reset address pointer; implementations with a
/// cursor (ICSP) rely on that, implementations with absolute addressing
/// (BLoad) use the page number directly.
pub trait Protocol {
    /// Reset the target and bring up the command stream.
    fn connect(&mut self) -> Result<()>;

    /// Raw id/revision word from the fixed config offset.
    fn read_id_word(&mut self) -> Result<u16>;

    /// Bulk-erase program memory, and data memory if the part has any.
    /// Dialects without a bulk erase perform per-page erasure during
    /// writes instead.
    fn bulk_erase(&mut self, profile: &DeviceProfile) -> Result<()>;

    /// Return the address pointer to zero.
    fn reset_address(&mut self) -> Result<()>;

    /// Write one page; `None` means the page is wholly absent and may be
    /// skipped or erased, whichever the dialect requires.
    fn write_page(
        &mut self,
        region: Region,
        page_num: usize,
        page: Option<&Page>,
        profile: &DeviceProfile,
    ) -> Result<()>;

    /// Read one page with blank sentinels already converted to absent.
    fn read_page(
        &mut self,
        region: Region,
        page_num: usize,
        profile: &DeviceProfile,
    ) -> Result<Page>;

    /// Read the config page verbatim; read-only field blanking is the
    /// orchestrator's business.
    fn read_config(&mut self, profile: &DeviceProfile) -> Result<Page>;

    /// Write config words. Config bits must commit one word at a time.
    fn write_config(&mut self, page: &Page, profile: &DeviceProfile) -> Result<()>;

    /// Whether this dialect can rewrite the config page at all.
    fn writes_config(&self) -> bool {
        true
    }

    /// Whether page 0 must be written after every other page. Bootloader
    /// dialects keep the reset vector pointing at the loader until the
    /// rest of the image is in place, so an interrupted run still boots
    /// back into the loader.
    fn defers_page_zero(&self) -> bool {
        false
    }

    /// End the session and let the target run.
    fn release(&mut self) -> Result<()>;
}

pub(crate) fn send<T: Transport>(com: &mut T, raw: &[u8]) -> Result<()> {
    log::trace!("=> {}", hex::encode(raw));
    com.write(raw)
}

pub(crate) fn recv_n<T: Transport>(com: &mut T, n: usize) -> Result<Vec<u8>> {
    let data = com.read_n(n)?;
    log::trace!("<= {}", hex::encode(&data));
    Ok(data)
}

/// Drain bytes until the `K` prompt shows up or the idle budget runs out.
/// Returns everything read, prompt included when it was seen.
pub(crate) fn wait_prompt<T: Transport>(com: &mut T) -> Result<Vec<u8>> {
    let mut seen = Vec::new();
    let mut idle = IDLE_READS;

    while seen.len() < MAX_DRAIN {
        let mut byte = [0u8; 1];
        if com.read(&mut byte)? == 0 {
            idle -= 1;
            if idle == 0 {
                break;
            }
            continue;
        }
        seen.push(byte[0]);
        if byte[0] == PROMPT {
            break;
        }
    }
    log::trace!("<= {}", hex::encode(&seen));
    Ok(seen)
}

/// Consume exactly one `K` prompt; anything else on the line is a
/// dialect-level violation.
pub(crate) fn expect_prompt<T: Transport>(com: &mut T) -> Result<()> {
    let seen = wait_prompt(com)?;
    match seen.as_slice() {
        [PROMPT] => Ok(()),
        [] => Err(Error::ShortRead { want: 1, got: 0 }),
        other => Err(Error::Protocol(format!(
            "expected prompt, got {}",
            hex::encode(other)
        ))),
    }
}

/// Send a command and require its `K` ack.
pub(crate) fn exchange_prompt<T: Transport>(com: &mut T, raw: &[u8]) -> Result<()> {
    send(com, raw)?;
    expect_prompt(com)
}

/// Skip power-up zero noise out of reset and require the greeting
/// prompt. The skip is bounded; a line stuck streaming zeros fails
/// instead of spinning.
pub(crate) fn expect_greeting<T: Transport>(com: &mut T) -> Result<()> {
    for _ in 0..MAX_DRAIN {
        let mut byte = [0u8; 1];
        if com.read(&mut byte)? == 0 {
            return Err(Error::Protocol("no greeting prompt from the target".into()));
        }
        match byte[0] {
            0x00 => continue,
            PROMPT => return Ok(()),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected greeting 0x{other:02X}"
                )));
            }
        }
    }
    Err(Error::Sync { drained: MAX_DRAIN })
}

/// Restore a known protocol state: send the no-op sync byte, hunt for the
/// prompt, and insist the line is quiet afterwards. Failure here is not
/// retriable; the target's address and latch state must be assumed lost.
pub(crate) fn resync<T: Transport>(com: &mut T, sync_byte: u8) -> Result<()> {
    send(com, &[sync_byte])?;

    let seen = wait_prompt(com)?;
    if seen.last().copied() != Some(PROMPT) {
        return Err(Error::Sync { drained: seen.len() });
    }

    let leftover = com.avail()?;
    if leftover > 0 {
        com.flush()?;
        return Err(Error::Sync {
            drained: seen.len() + leftover,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::VecDeque;

    use crate::error::Result;
    use crate::transport::Transport;

    /// Transport fed from a fixed byte script, recording what was sent.
    ///
    /// `new` preloads the whole script; `with_exchanges` holds one
    /// response chunk per write, modelling a half-duplex target that only
    /// answers after being asked.
    pub struct ScriptedPort {
        pub input: VecDeque<u8>,
        pub responses: VecDeque<Vec<u8>>,
        pub written: Vec<u8>,
    }

    impl ScriptedPort {
        pub fn new(input: &[u8]) -> Self {
            ScriptedPort {
                input: input.iter().copied().collect(),
                responses: VecDeque::new(),
                written: Vec::new(),
            }
        }

        pub fn with_exchanges(responses: &[&[u8]]) -> Self {
            ScriptedPort {
                input: VecDeque::new(),
                responses: responses.iter().map(|r| r.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Transport for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut count = 0;
            while count < buf.len() {
                match self.input.pop_front() {
                    Some(b) => {
                        buf[count] = b;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written.extend_from_slice(data);
            if let Some(response) = self.responses.pop_front() {
                self.input.extend(response);
            }
            Ok(())
        }

        fn avail(&mut self) -> Result<usize> {
            Ok(self.input.len())
        }

        fn flush(&mut self) -> Result<()> {
            self.input.clear();
            Ok(())
        }

        fn pulse_dtr(&mut self, _millis: u64) -> Result<()> {
            Ok(())
        }

        fn pulse_break(&mut self, _millis: u64) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::ScriptedPort;
    use super::*;

    #[test]
    fn checksum_vectors() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"abcd"), 138);
        assert_eq!(checksum(&[0xFF, 0x01]), 0);
    }

    #[test]
    fn address_encoding() {
        assert_eq!(encode_address(12), [0x80, 0x01]);
        for page_num in 0..0x800 {
            assert_eq!(decode_address(encode_address(page_num)), page_num);
        }
    }

    #[test]
    fn resync_finds_prompt_through_noise() {
        let mut com = ScriptedPort::new(b"\x00\x07K");
        resync(&mut com, PROMPT).unwrap();
        assert_eq!(com.written, b"K");
    }

    #[test]
    fn resync_without_prompt_reports_drained_count() {
        let mut com = ScriptedPort::new(b"\x01\x02\x03");
        match resync(&mut com, PROMPT) {
            Err(Error::Sync { drained }) => assert_eq!(drained, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resync_rejects_leftover_bytes() {
        let mut com = ScriptedPort::new(b"K\xAA\xBB");
        match resync(&mut com, PROMPT) {
            Err(Error::Sync { drained }) => assert_eq!(drained, 3),
            other => panic!("unexpected {other:?}"),
        }
        // Leftovers are discarded so a later attempt starts clean.
        assert_eq!(com.input.len(), 0);
    }

    #[test]
    fn greeting_skips_powerup_zeros() {
        let mut com = ScriptedPort::new(&[0, 0, 0, PROMPT]);
        expect_greeting(&mut com).unwrap();
    }

    #[test]
    fn endless_zero_stream_fails_bounded() {
        let noise = vec![0u8; MAX_DRAIN + 16];
        let mut com = ScriptedPort::new(&noise);
        assert!(matches!(
            expect_greeting(&mut com),
            Err(Error::Sync { drained: MAX_DRAIN })
        ));
    }

    #[test]
    fn resync_on_silent_line_fails() {
        let mut com = ScriptedPort::new(b"");
        assert!(matches!(
            resync(&mut com, PROMPT),
            Err(Error::Sync { drained: 0 })
        ));
    }
}

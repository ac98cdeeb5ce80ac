//! Abstract byte-channel transport.
//!
//! The protocol engines assume nothing about reliability at this layer:
//! reads are counted and may come back short on timeout, and all framing,
//! checksumming and retry lives above. Implemented by the real serial
//! port here and by the target simulator in [`crate::sim`].

use crate::error::Result;

pub use self::serial::SerialTransport;

mod serial;

pub trait Transport {
    /// Counted read. Returns fewer bytes than requested on timeout
    /// instead of blocking indefinitely.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes waiting to be read.
    fn avail(&mut self) -> Result<usize>;

    /// Discard any pending input.
    fn flush(&mut self) -> Result<()>;

    /// Pulse the DTR line, resetting the target.
    fn pulse_dtr(&mut self, millis: u64) -> Result<()>;

    /// Hold a line break, the bootloader's attention signal.
    fn pulse_break(&mut self, millis: u64) -> Result<()>;

    /// Read up to `n` bytes; short on timeout.
    fn read_n(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let count = self.read(&mut buf)?;
        buf.truncate(count);
        Ok(buf)
    }

    /// Read a line up to and including `\n`, or whatever arrived before
    /// the timeout.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            if self.read(&mut byte)? == 0 {
                return Ok(line);
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                return Ok(line);
            }
        }
    }
}

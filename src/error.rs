//! Error kinds shared across the codec, protocol engine and orchestrator.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or checksum-mismatched HEX input. Fatal for the file load.
    #[error("HEX line {line}: {reason}")]
    Format { line: usize, reason: String },

    /// A HEX record could not be rendered on output.
    #[error("cannot serialize HEX record: {0}")]
    Serialize(String),

    /// Wire response failed its trailing checksum. Worth a resync + retry.
    #[error("response checksum mismatch (chip 0x{got:02X}, computed 0x{want:02X})")]
    Checksum { got: u8, want: u8 },

    /// The target acknowledged our frame with a checksum NAK.
    #[error("target reported a frame checksum error")]
    FrameNak,

    /// Counted read came back short of the expected response length.
    #[error("short read: wanted {want} bytes, got {got}")]
    ShortRead { want: usize, got: usize },

    /// Write or erase aimed at a protected or out-of-range address.
    #[error("address 0x{addr:04X} rejected: {reason}")]
    Address { addr: usize, reason: &'static str },

    /// Resynchronization failed; the target's address/latch state is
    /// unknown and the session must not continue.
    #[error("resynchronization failed after draining {drained} bytes")]
    Sync { drained: usize },

    /// Chip id missing from the device table.
    #[error("device id 0x{id:04X} not in device table")]
    UnknownDevice { id: u16 },

    /// Page word index past the end of the page.
    #[error("page offset {offset} out of range ({len} words)")]
    PageIndex { offset: usize, len: usize },

    /// Sub-range write supplied the wrong number of words.
    #[error("span wants {want} words, got {got}")]
    SpanMismatch { want: usize, got: usize },

    /// Dialect-level protocol violation that is not worth retrying.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device table: {0}")]
    DeviceTable(#[from] serde_yaml::Error),

    #[error("packed field: {0}")]
    Packing(#[from] scroll::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures that a resync plus bounded retry may recover from.
    /// Everything else either aborts the operation or the whole session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Checksum { .. } | Error::FrameNak | Error::ShortRead { .. }
        )
    }
}

//! Shared protocol and memory-geometry constants.

/// Words per page. Both wire protocols move memory in these units.
pub const PAGE_WORDS: usize = 32;
/// Bytes per page on the wire (two bytes per word, LSB first).
pub const PAGE_BYTES: usize = PAGE_WORDS * 2;

/// Pages per 64KiB block. Crossing a block boundary forces a new
/// extended-address record in HEX output.
pub const PAGES_PER_BLOCK: usize = 0x400;

/// `K` prompt byte signalling ready/success in both dialects.
pub const PROMPT: u8 = b'K';

/// BLoad bootloader command bytes.
pub mod bload {
    pub const READ_CONFIG: u8 = b'C';
    pub const INFO: u8 = b'I';
    pub const READ_PROGRAM: u8 = b'R';
    pub const WRITE_PROGRAM: u8 = b'W';
    pub const ERASE_PROGRAM: u8 = b'E';
    pub const WRITE_DATA: u8 = b'D';
    pub const READ_DATA: u8 = b'F';
    pub const PROBE: u8 = b'T';
    pub const RESET: u8 = b'Z';

    /// First byte of a `CK` response, the bootloader's frame-checksum NAK.
    pub const NAK_CHECKSUM: u8 = b'C';
    /// Probe response for a restricted (bootloader-reserved) page.
    pub const NAK_RANGE: u8 = b'R';
}

/// ICSP host-controller opcodes and `C` subcodes.
pub mod icsp {
    pub const COMMAND: u8 = b'C';
    pub const JUMP: u8 = b'J';
    pub const FETCH_PROGRAM: u8 = b'F';
    pub const GET_DATA: u8 = b'G';
    pub const LINE: u8 = b'L';
    pub const ENGAGE: u8 = b'U';
    pub const SEND_WORD: u8 = b'W';
    pub const VERSION: u8 = b'V';
    pub const STATUS: u8 = b'Q';
    pub const SYNC: u8 = b'K';
    pub const PAUSE: u8 = b'P';
    pub const RELEASE: u8 = b'Z';

    pub const SUB_LOAD_CONFIG: u8 = 0x00;
    pub const SUB_LOAD_PROGRAM: u8 = 0x02;
    pub const SUB_LOAD_DATA: u8 = 0x03;
    pub const SUB_READ_PROGRAM: u8 = 0x04;
    pub const SUB_INCREMENT: u8 = 0x06;
    pub const SUB_PROGRAM_INT: u8 = 0x08;
    pub const SUB_ERASE_PROGRAM: u8 = 0x09;
    pub const SUB_PROGRAM_END: u8 = 0x0A;
    pub const SUB_ERASE_DATA: u8 = 0x0B;
    pub const SUB_RESET_ADDRESS: u8 = 0x16;
    pub const SUB_PROGRAM_EXT: u8 = 0x18;

    /// Word address selected by a load-config command.
    pub const CONFIG_BASE: usize = 0x8000;
    /// Word offset of the device id/revision word within the config page.
    pub const ID_OFFSET: usize = 6;
    /// Status response length for the `Q` query.
    pub const STATUS_LEN: usize = 8;
}

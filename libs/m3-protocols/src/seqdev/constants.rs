//! Sequence-device command constants

/// Request format code
pub const FORMAT_CODE: u8 = 0xF1;

/// Response requested
pub const RESPONSE_OPTION: u8 = 1;

/// Main code for sequence-device access
pub const MAIN_CODE_SEQDEV: u8 = 0x26;

pub const SUB_CODE_READ: u8 = 0x01;
pub const SUB_CODE_WRITE: u8 = 0x02;

/// Payload size of a read command in bytes
pub const DATA_SIZE_READ: u8 = 10;
/// Payload size of a write command in bytes (read payload + one word)
pub const DATA_SIZE_WRITE: u8 = 12;

/// Word access
pub const ACCESS_TYPE_WORD: u16 = 2;

pub const DEVICE_TYPE_DATA_REGISTER: u16 = 0x04;
pub const DEVICE_TYPE_FILE_REGISTER: u16 = 0x02;

/// One element per transaction
pub const DATA_NUM: u16 = 1;

/// Request header: format, option, src, dest, main, sub, size
pub const REQUEST_HEADER_LEN: usize = 7;

/// Response header: format, option, src, dest, main, sub, error(2), size(2)
pub const RESPONSE_HEADER_LEN: usize = 10;

/// Largest response data block accepted from a gateway
pub const MAX_RESPONSE_DATA: usize = 512;

/// Length prefix on the TCP gateway stream
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Words read by a string-input record (40 bytes)
pub const STRING_BLOCK_WORDS: u16 = 20;

/// Default per-request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default dispatch queue depth
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

// crates/canopen-rs/src/sdo/mod.rs

pub mod client;
pub mod crc;
pub mod server;

pub use client::{SdoClient, SdoClientStatus};
pub use server::SdoServer;

use crate::hal::CanOpenError;
use core::fmt;

/// Default SDO transfer timeout.
pub const SDO_TIMEOUT_US: u32 = 1_000_000;

/// Download size above which the client switches to block transfer
/// (one full sub-block of 127 seven-byte segments).
pub const BLOCK_THRESHOLD: usize = 127 * 7;

/// Largest block size either side will agree to.
pub const BLOCK_SIZE_MAX: u8 = 127;

// Protocol-level abort codes not derived from an OD access.
// (CiA 301, Table 50)
pub const ABORT_TOGGLE: u32 = 0x0503_0000;
pub const ABORT_TIMEOUT: u32 = 0x0504_0000;
pub const ABORT_COMMAND: u32 = 0x0504_0001;
pub const ABORT_BLOCK_SIZE: u32 = 0x0504_0002;
pub const ABORT_SEQUENCE: u32 = 0x0504_0003;
pub const ABORT_CRC: u32 = 0x0504_0004;
pub const ABORT_DATA_LONG: u32 = 0x0607_0012;
pub const ABORT_DATA_SHORT: u32 = 0x0607_0013;
pub const ABORT_GENERAL: u32 = 0x0800_0000;

/// Error reported to SDO client callers: either a local runtime failure or
/// an abort code (remote or locally generated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoError {
    Abort(u32),
    Error(CanOpenError),
}

impl fmt::Display for SdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdoError::Abort(code) => write!(f, "SDO transfer aborted with code {:#010X}", code),
            SdoError::Error(e) => write!(f, "SDO transfer failed: {}", e),
        }
    }
}

impl std::error::Error for SdoError {}

impl From<CanOpenError> for SdoError {
    fn from(e: CanOpenError) -> Self {
        SdoError::Error(e)
    }
}

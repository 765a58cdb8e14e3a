// crates/canopen-rs-gateway/src/error.rs

use canopen_rs::hal::CanOpenError;
use canopen_rs::sdo::SdoError;
use serde_json::{Value, json};

/// Gateway error classes with their CiA 309-5 numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    /// Request not supported (100).
    NotSupported,
    /// Syntax error in the request (101).
    Syntax,
    /// Request not processed due to an internal state (102).
    Internal,
    /// Time-out occurred (103).
    Timeout,
    /// No default net set (104).
    NoDefaultNet,
    /// No default node set (105).
    NoDefaultNode,
    /// Unsupported net (106).
    UnsupportedNet,
    /// Unsupported node (107).
    UnsupportedNode,
    /// Wrong NMT state (204).
    WrongNmtState,
    /// PDO already used (400).
    PdoAlreadyUsed,
    /// PDO length exceeded (401).
    PdoLength,
    /// Out of memory (600).
    OutOfMemory,
    /// CAN interface not available (601).
    CanUnavailable,
    /// Manufacturer-specific error (900).
    Manufacturer,
    /// SDO transfer ended with an abort code.
    SdoAbort(u32),
}

impl GatewayError {
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::NotSupported => 100,
            GatewayError::Syntax => 101,
            GatewayError::Internal => 102,
            GatewayError::Timeout => 103,
            GatewayError::NoDefaultNet => 104,
            GatewayError::NoDefaultNode => 105,
            GatewayError::UnsupportedNet => 106,
            GatewayError::UnsupportedNode => 107,
            GatewayError::WrongNmtState => 204,
            GatewayError::PdoAlreadyUsed => 400,
            GatewayError::PdoLength => 401,
            GatewayError::OutOfMemory => 600,
            GatewayError::CanUnavailable => 601,
            GatewayError::Manufacturer => 900,
            GatewayError::SdoAbort(_) => 0,
        }
    }

    /// The JSON error body defined by CiA 309-5.
    pub fn to_json(&self) -> Value {
        match self {
            GatewayError::SdoAbort(code) => json!({
                "ERROR": { "sdo-abort-code": format!("{:#010X}", code) }
            }),
            other => json!({ "ERROR": other.code() }),
        }
    }
}

impl From<SdoError> for GatewayError {
    fn from(e: SdoError) -> Self {
        match e {
            SdoError::Abort(code) => GatewayError::SdoAbort(code),
            SdoError::Error(CanOpenError::Timeout) => GatewayError::Timeout,
            SdoError::Error(CanOpenError::OutOfMemory) => GatewayError::OutOfMemory,
            SdoError::Error(CanOpenError::WrongNmtState) => GatewayError::WrongNmtState,
            SdoError::Error(_) => GatewayError::Internal,
        }
    }
}

impl From<CanOpenError> for GatewayError {
    fn from(e: CanOpenError) -> Self {
        match e {
            CanOpenError::Timeout => GatewayError::Timeout,
            CanOpenError::TxUnconfigured => GatewayError::CanUnavailable,
            _ => GatewayError::Internal,
        }
    }
}

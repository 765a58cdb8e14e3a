// crates/canopen-rs-eds/src/error.rs

use core::fmt;
use core::num::ParseIntError;
use hex::FromHexError;

/// Errors that can occur while parsing or serializing an EDS file.
#[derive(Debug)]
pub enum EdsError {
    /// A section header is not terminated or otherwise malformed.
    MalformedSection { line: usize },

    /// A `key=value` line is missing its separator.
    MalformedLine { line: usize },

    /// A required key was missing from an object section.
    MissingKey { section: String, key: &'static str },

    /// A numeric key had an invalid format.
    InvalidNumber { section: String, key: &'static str },

    /// The DataType code is not one defined by CiA 306.
    UnknownDataType { section: String, code: u16 },

    /// The AccessType string is not one of ro/wo/rw/rww/rwr/const.
    UnknownAccessType { section: String, value: String },

    /// The ObjectType code is not Variable, Domain, Array or Record.
    UnknownObjectType { section: String, code: u8 },

    /// A DefaultValue/HighLimit/LowLimit could not be converted to the
    /// declared data type.
    InvalidValue { section: String, key: &'static str },

    /// Reading the file from disk failed.
    Io(std::io::Error),
}

impl fmt::Display for EdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedSection { line } => write!(f, "malformed section header at line {}", line),
            Self::MalformedLine { line } => write!(f, "missing '=' at line {}", line),
            Self::MissingKey { section, key } => {
                write!(f, "section [{}] is missing key {}", section, key)
            }
            Self::InvalidNumber { section, key } => {
                write!(f, "section [{}] has an invalid number for {}", section, key)
            }
            Self::UnknownDataType { section, code } => {
                write!(f, "section [{}] uses unknown data type {:#06X}", section, code)
            }
            Self::UnknownAccessType { section, value } => {
                write!(f, "section [{}] uses unknown access type '{}'", section, value)
            }
            Self::UnknownObjectType { section, code } => {
                write!(f, "section [{}] uses unknown object type {}", section, code)
            }
            Self::InvalidValue { section, key } => {
                write!(f, "section [{}] has an unconvertible {}", section, key)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EdsError {}

impl From<std::io::Error> for EdsError {
    fn from(e: std::io::Error) -> Self {
        EdsError::Io(e)
    }
}

/// Context-free conversion helpers used by the parser.
pub(crate) fn number_error(section: &str, key: &'static str) -> impl FnOnce(ParseIntError) -> EdsError {
    let section = section.to_string();
    move |_| EdsError::InvalidNumber { section, key }
}

pub(crate) fn hex_error(section: &str, key: &'static str) -> impl FnOnce(FromHexError) -> EdsError {
    let section = section.to_string();
    move |_| EdsError::InvalidValue { section, key }
}

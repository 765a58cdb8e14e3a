//! EDS (Electronic Data Sheet, CiA 306) support for canopen-rs.
//!
//! The parser turns the INI-shaped EDS text into a populated
//! [`canopen_rs::ObjectDictionary`], expanding `$NODEID` tokens with the
//! concrete node id; the writer is its inverse for the object-describing
//! fields. Device metadata sections (FileInfo, DeviceInfo) are accepted but
//! not interpreted - the core only consumes the resulting dictionary.

mod error;
mod parser;
mod writer;

pub use error::EdsError;
pub use parser::{load_eds_file, load_eds_from_str};
pub use writer::serialize_od;

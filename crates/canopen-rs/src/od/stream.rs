// crates/canopen-rs/src/od/stream.rs

use super::OdError;
use super::entry::{Attribute, Variable};

/// Where an access originates. External accesses (SDO) are subject to the
/// entry's access attributes; internal accesses (services, application) are
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Internal,
    External,
}

/// Outcome of a read or write call: how many bytes moved and whether the
/// transfer is finished. `Partial` is progress, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Complete(usize),
    Partial(usize),
}

impl Transfer {
    pub fn bytes(&self) -> usize {
        match self {
            Transfer::Complete(n) | Transfer::Partial(n) => *n,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Transfer::Complete(_))
    }
}

/// Cursor value marking a PDO stream slot whose mapping failed.
pub(crate) const STREAM_INVALID: usize = 0xFF;

/// The uniform read/write handle over an entry sub-index.
///
/// A stream never borrows the dictionary: it records *where* to access and
/// the access resolves the entry on every call. In the PDO mapping engine
/// `offset` is repurposed: after a successful map it holds the number of
/// mapped bytes for the sub-entry, which may be shorter than `data_len`.
#[derive(Debug, Clone)]
pub struct Stream {
    pub index: u16,
    pub sub_index: u8,
    pub attribute: Attribute,
    /// Full length of the sub-entry value buffer.
    pub data_len: usize,
    /// Progress cursor for chunked transfers (mapped byte count in the PDO
    /// engine).
    pub offset: usize,
    pub origin: Origin,
    /// Set for CiA dummy-entry streams (mapping index below 0x20): reads and
    /// writes only advance the cursor.
    pub dummy: bool,
}

impl Stream {
    /// A dummy stream standing in for CiA dummy entries in a PDO mapping.
    pub(crate) fn dummy(len: usize) -> Self {
        Self {
            index: 0,
            sub_index: 0,
            attribute: Attribute::default(),
            data_len: len,
            offset: len,
            origin: Origin::Internal,
            dummy: true,
        }
    }

    /// Marker stream for a failed PDO mapping slot.
    pub(crate) fn invalid() -> Self {
        Self {
            index: 0,
            sub_index: 0,
            attribute: Attribute::default(),
            data_len: 0,
            offset: STREAM_INVALID,
            origin: Origin::Internal,
            dummy: false,
        }
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.offset == STREAM_INVALID && self.data_len == 0
    }
}

/// Default read: copy `min(buf.len(), data_len - offset)` bytes out of the
/// little-endian entry buffer, advance the cursor, report `Complete` once
/// every byte has been transferred.
pub fn default_read(
    var: &Variable,
    stream: &mut Stream,
    buf: &mut [u8],
) -> Result<Transfer, OdError> {
    if stream.dummy {
        let count = buf.len().min(stream.data_len.saturating_sub(stream.offset));
        buf[..count].fill(0);
        stream.offset += count;
        return Ok(done_or_partial(stream, count));
    }
    if stream.offset > var.data.len() {
        return Err(OdError::DevIncompat);
    }
    let count = buf.len().min(var.data.len() - stream.offset);
    buf[..count].copy_from_slice(&var.data[stream.offset..stream.offset + count]);
    stream.offset += count;
    stream.data_len = var.data.len();
    Ok(done_or_partial(stream, count))
}

/// Default write: copy into the entry buffer at the cursor. Oversized data
/// fails with `DataLong`; single-call length validation (string shortening,
/// `DataShort`) is performed by the one-shot dictionary write on top of this.
pub fn default_write(
    var: &mut Variable,
    stream: &mut Stream,
    data: &[u8],
) -> Result<Transfer, OdError> {
    if stream.dummy {
        let count = data.len().min(stream.data_len.saturating_sub(stream.offset));
        stream.offset += count;
        return Ok(done_or_partial(stream, count));
    }
    if stream.offset > var.data.len() {
        return Err(OdError::DevIncompat);
    }
    let remaining = var.data.len() - stream.offset;
    if data.len() > remaining {
        return Err(OdError::DataLong);
    }
    var.data[stream.offset..stream.offset + data.len()].copy_from_slice(data);
    stream.offset += data.len();
    stream.data_len = var.data.len();
    Ok(done_or_partial(stream, data.len()))
}

fn done_or_partial(stream: &Stream, count: usize) -> Transfer {
    if stream.offset >= stream.data_len {
        Transfer::Complete(count)
    } else {
        Transfer::Partial(count)
    }
}

// crates/canopen-rs/src/hal.rs

use crate::types::CanFrame;
use core::fmt;
use std::collections::BTreeMap;

/// Defines a portable, descriptive runtime error type for the CANopen stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenError {
    /// A function argument is outside its permitted range.
    IllegalArgument,
    /// A buffer or object count could not be allocated.
    OutOfMemory,
    /// A confirmed operation did not finish within its deadline.
    Timeout,
    /// The requested CAN bit rate is not supported by the driver.
    IllegalBaudrate,
    /// An inbound frame was lost because the receive buffer was full.
    RxOverflow,
    /// An outbound frame was lost because the transmit buffer was full.
    TxOverflow,
    /// A frame carried a payload length that the service cannot accept.
    MessageLength,
    /// The mapped PDO payload does not fit the frame.
    PdoLength,
    /// A synchronous PDO could not be delivered inside the sync window.
    PdoWindow,
    /// A transmit object was used before it was configured.
    TxUnconfigured,
    /// Object Dictionary entries required by a service are missing or malformed.
    OdParameters,
    /// Stored or received data failed a consistency check.
    DataCorrupt,
    /// A CRC check failed.
    CrcError,
    /// The transmit path is occupied by a previous request.
    TxBusy,
    /// The operation is not permitted in the current NMT state.
    WrongNmtState,
    /// An operating-system call failed.
    Syscall,
    /// The service is not in a state that permits the operation.
    InvalidState,
    /// The node id has not been configured yet.
    NodeIdUnconfigured,
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalArgument => write!(f, "Illegal argument"),
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::IllegalBaudrate => write!(f, "Illegal CAN bit rate"),
            Self::RxOverflow => write!(f, "CAN receive buffer overflow"),
            Self::TxOverflow => write!(f, "CAN transmit buffer overflow"),
            Self::MessageLength => write!(f, "Wrong CAN message length"),
            Self::PdoLength => write!(f, "Mapped PDO longer than frame"),
            Self::PdoWindow => write!(f, "Synchronous window passed"),
            Self::TxUnconfigured => write!(f, "Transmit object not configured"),
            Self::OdParameters => write!(f, "Invalid Object Dictionary parameters"),
            Self::DataCorrupt => write!(f, "Data corrupt"),
            Self::CrcError => write!(f, "CRC check failed"),
            Self::TxBusy => write!(f, "Transmit path busy"),
            Self::WrongNmtState => write!(f, "Wrong NMT state"),
            Self::Syscall => write!(f, "System call failed"),
            Self::InvalidState => write!(f, "Invalid service state"),
            Self::NodeIdUnconfigured => write!(f, "Node id not configured"),
        }
    }
}

impl std::error::Error for CanOpenError {}

/// Hardware Abstraction Layer for the CAN transport.
///
/// This trait abstracts the physical sending of classical CAN frames (11-bit
/// identifiers, up to 8 data bytes), enabling the core CANopen protocol logic
/// to remain platform-agnostic. Inbound frames are not pulled through this
/// trait: the driver (or a pump thread it owns) pushes them into
/// [`crate::bus::BusManager::handle`] from whatever context it receives on.
pub trait CanInterface: Send {
    /// Brings the interface up. Called once by the bus manager before any
    /// traffic is exchanged.
    fn connect(&mut self) -> Result<(), CanOpenError>;

    /// Queues a single frame for transmission.
    ///
    /// Must not block for longer than the driver's own transmit buffering
    /// requires. A full transmit queue is reported as
    /// [`CanOpenError::TxOverflow`].
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError>;

    /// Returns the driver's CAN controller error-status word
    /// (bus warning / passive / bus-off flags, driver specific layout).
    fn error_status(&self) -> u16 {
        0
    }
}

/// A trait for abstracting the non-volatile storage of OD parameters.
/// Backs the "Store Parameters" (1010h) and "Restore Default Parameters"
/// (1011h) commands, which must persist across device reboots.
pub trait OdStorage: Send {
    /// Loads storable parameters from non-volatile memory.
    /// Returns a map of (Index, SubIndex) -> little-endian value bytes.
    fn load(&mut self) -> Result<BTreeMap<(u16, u8), Vec<u8>>, CanOpenError>;

    /// Saves the given storable parameters to non-volatile memory.
    fn save(&mut self, parameters: &BTreeMap<(u16, u8), Vec<u8>>) -> Result<(), CanOpenError>;

    /// Clears all stored parameters from non-volatile memory.
    fn clear(&mut self) -> Result<(), CanOpenError>;

    /// Checks if a "Restore Defaults" operation was flagged and is pending a
    /// communication reset.
    fn restore_defaults_requested(&self) -> bool;

    /// Sets a persistent flag so defaults are restored on the next reset.
    /// Called when the "load" signature is written to OD entry 1011h.
    fn request_restore_defaults(&mut self) -> Result<(), CanOpenError>;

    /// Clears the persistent "Restore Defaults" flag after the restore
    /// operation has completed.
    fn clear_restore_defaults_flag(&mut self) -> Result<(), CanOpenError>;
}

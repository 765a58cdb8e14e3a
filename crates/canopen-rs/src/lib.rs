// --- Foundation Modules ---
pub mod hal;
pub mod types;

// --- Frame routing ---
pub mod bus;

// --- Object Dictionary ---
pub mod od;
pub mod storage;

// --- Services ---
pub mod emcy;
pub mod heartbeat;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod time;

// --- Aggregates ---
pub mod network;
pub mod node;

// --- Top-level Exports ---
pub use bus::{BusManager, FrameListener, SubscriptionToken};
pub use hal::{CanInterface, CanOpenError, OdStorage};
pub use network::Network;
pub use nmt::{NmtCommand, NmtControl, NmtState, ResetRequest};
pub use node::{Node, NodeConfig};
pub use od::{ObjectDictionary, OdError};
pub use sdo::SdoError;
pub use types::{CanFrame, NodeId};

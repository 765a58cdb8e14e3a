// crates/canopen-rs/src/bus.rs

use crate::hal::{CanInterface, CanOpenError};
use crate::types::{CanFrame, CAN_ID_MAX};
use log::{error, trace};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Receives frames that matched a subscription.
///
/// Implementations must not block: listeners run synchronously inside
/// [`BusManager::handle`], on whatever thread the transport driver delivers
/// frames on. They should only deposit the frame content into per-service
/// state and return.
pub trait FrameListener: Send {
    fn on_frame(&mut self, frame: &CanFrame);
}

/// Cancel handle returned by [`BusManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u32);

struct Subscription {
    token: u32,
    ident: u16,
    mask: u16,
    rtr: bool,
    listener: Arc<Mutex<dyn FrameListener>>,
}

#[derive(Default)]
struct SubscriptionTable {
    entries: Vec<Subscription>,
    next_token: u32,
}

/// Owns the CAN driver, demultiplexes inbound frames by identifier to frame
/// listeners, and sends outbound frames on behalf of every service.
///
/// The subscription table and the driver sit behind separate mutexes so the
/// process loop and the driver's receive context serialize only where they
/// must. `handle` snapshots the matching listeners and dispatches outside the
/// table lock, which keeps subscribe/unsubscribe from inside a listener or an
/// OD hook safe.
pub struct BusManager {
    driver: Mutex<Box<dyn CanInterface>>,
    table: Mutex<SubscriptionTable>,
    tx_errors: AtomicU32,
}

impl BusManager {
    pub fn new(driver: Box<dyn CanInterface>) -> Self {
        Self {
            driver: Mutex::new(driver),
            table: Mutex::new(SubscriptionTable::default()),
            tx_errors: AtomicU32::new(0),
        }
    }

    /// Brings the underlying driver up.
    pub fn connect(&self) -> Result<(), CanOpenError> {
        self.driver.lock().unwrap().connect()
    }

    /// Registers `listener` for frames whose identifier satisfies
    /// `frame.ident & mask == ident & mask` and whose RTR flag equals `rtr`.
    /// A mask of 0x7FF is an exact match. Returns a cancel handle.
    pub fn subscribe(
        &self,
        ident: u16,
        mask: u16,
        rtr: bool,
        listener: Arc<Mutex<dyn FrameListener>>,
    ) -> Result<SubscriptionToken, CanOpenError> {
        if ident > CAN_ID_MAX || mask > CAN_ID_MAX {
            return Err(CanOpenError::IllegalArgument);
        }
        let mut table = self.table.lock().unwrap();
        let token = table.next_token;
        table.next_token = table.next_token.wrapping_add(1);
        table.entries.push(Subscription {
            token,
            ident: ident & mask,
            mask,
            rtr,
            listener,
        });
        Ok(SubscriptionToken(token))
    }

    /// Cancels a previous subscription. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut table = self.table.lock().unwrap();
        table.entries.retain(|s| s.token != token.0);
    }

    /// Sends one frame through the driver. Failures are logged and counted
    /// but do not halt the pipeline; the caller decides whether to escalate
    /// (typically to EMCY).
    pub fn send(&self, frame: &CanFrame) -> Result<(), CanOpenError> {
        let result = self.driver.lock().unwrap().send(frame);
        if let Err(e) = result {
            self.tx_errors.fetch_add(1, Ordering::Relaxed);
            error!("CAN send failed for ident {:#05X}: {}", frame.ident, e);
            return Err(e);
        }
        trace!("tx ident {:#05X} dlc {}", frame.ident, frame.dlc);
        Ok(())
    }

    /// Entry point for the transport driver: dispatches an inbound frame to
    /// every matching listener in subscription order. Must not be called with
    /// any listener lock held.
    pub fn handle(&self, frame: &CanFrame) {
        if frame.ident > CAN_ID_MAX {
            return;
        }
        // Snapshot under the table lock, dispatch outside it.
        let matches: Vec<Arc<Mutex<dyn FrameListener>>> = {
            let table = self.table.lock().unwrap();
            table
                .entries
                .iter()
                .filter(|s| frame.ident & s.mask == s.ident && frame.rtr == s.rtr)
                .map(|s| s.listener.clone())
                .collect()
        };
        for listener in matches {
            listener.lock().unwrap().on_frame(frame);
        }
    }

    /// The driver's CAN controller error-status word.
    pub fn error_status(&self) -> u16 {
        self.driver.lock().unwrap().error_status()
    }

    /// Number of failed transmissions since construction.
    pub fn tx_error_count(&self) -> u32 {
        self.tx_errors.load(Ordering::Relaxed)
    }
}

// crates/canopen-rs/src/emcy.rs

use crate::bus::{BusManager, FrameListener};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CanFrame, COB_EMCY, NodeId};
use log::{trace, warn};
use std::sync::{Arc, Mutex};

/// Error status bits and emergency error codes used across the stack.
pub mod errors {
    // Indices into the 80-bit error status field.
    pub const EM_GENERIC: u8 = 0x00;
    pub const EM_CAN_TX_OVERFLOW: u8 = 0x01;
    pub const EM_CAN_RX_OVERFLOW: u8 = 0x02;
    pub const EM_RX_MSG_WRONG_LENGTH: u8 = 0x03;
    pub const EM_RPDO_WRONG_LENGTH: u8 = 0x04;
    pub const EM_RPDO_TIMEOUT: u8 = 0x05;
    pub const EM_PDO_WRONG_MAPPING: u8 = 0x06;
    pub const EM_SYNC_TIMEOUT: u8 = 0x07;
    pub const EM_SYNC_LENGTH: u8 = 0x08;
    pub const EM_HEARTBEAT_CONSUMER: u8 = 0x09;
    pub const EM_HB_CONSUMER_REMOTE_RESET: u8 = 0x0A;
    pub const EM_NMT_WRONG_COMMAND: u8 = 0x0B;
    pub const EM_EMERGENCY_BUFFER_FULL: u8 = 0x10;

    pub const EM_STATUS_BITS: usize = 80;

    // Emergency error codes. (CiA 301, Table 21)
    pub const ERR_NO_ERROR: u16 = 0x0000;
    pub const ERR_GENERIC: u16 = 0x1000;
    pub const ERR_COMMUNICATION: u16 = 0x8100;
    pub const ERR_CAN_OVERRUN: u16 = 0x8110;
    pub const ERR_HEARTBEAT: u16 = 0x8130;
    pub const ERR_PROTOCOL: u16 = 0x8200;
    pub const ERR_PDO_LENGTH: u16 = 0x8210;
    pub const ERR_PDO_LENGTH_EXCEEDED: u16 = 0x8220;
    pub const ERR_RPDO_TIMEOUT: u16 = 0x8250;
}

use errors::{EM_EMERGENCY_BUFFER_FULL, EM_STATUS_BITS, ERR_CAN_OVERRUN};

/// Callback invoked for every consumed emergency frame:
/// `(source_node, error_code, error_register, status_bit, info)`.
pub type EmcyCallback = Box<dyn FnMut(u8, u16, u8, u8, u32) + Send>;

#[derive(Debug, Clone, Copy, Default)]
struct EmcyRecord {
    msg: u32,
    info: u32,
}

/// Emergency producer and consumer.
///
/// Errors reported by the other services latch status bits; newly set bits
/// push a record into a fixed ring FIFO which the periodic tick drains onto
/// the bus, paced by the inhibit time from OD 1015h. Frames from other
/// producers (identifiers 0x081..0x0FF) are handed to the user callback.
pub struct Emcy {
    node_id: NodeId,
    bus: Arc<BusManager>,
    status: [u8; EM_STATUS_BITS / 8],
    fifo: Vec<EmcyRecord>,
    write_ptr: usize,
    post_ptr: usize,
    /// Overflow marker: 0 = normal, 1 = wrapped, 2 = wrap reported.
    overflow: u8,
    history_count: usize,
    producer_enabled: bool,
    cob_ident: u16,
    inhibit_us: u32,
    inhibit_timer: u32,
    error_register: u8,
    callback: Option<EmcyCallback>,
}

impl Emcy {
    pub fn new(node_id: NodeId, fifo_size: usize, bus: Arc<BusManager>) -> Self {
        Self {
            node_id,
            bus,
            status: [0; EM_STATUS_BITS / 8],
            fifo: vec![EmcyRecord::default(); fifo_size.max(1)],
            write_ptr: 0,
            post_ptr: 0,
            overflow: 0,
            history_count: 0,
            producer_enabled: true,
            cob_ident: COB_EMCY + node_id.0 as u16,
            inhibit_us: 0,
            inhibit_timer: 0,
            error_register: 0,
            callback: None,
        }
    }

    /// Re-reads the producer configuration from the OD, as done at start-up
    /// and after a communication reset.
    pub fn configure_from_od(&mut self, od: &ObjectDictionary) {
        if let Ok(cob) = od.u32(0x1014, 0) {
            self.producer_enabled = cob & 0x8000_0000 == 0;
            self.cob_ident = (cob & 0x7FF) as u16;
        }
        if let Ok(inhibit) = od.u16(0x1015, 0) {
            self.inhibit_us = inhibit as u32 * 100;
        }
        self.inhibit_timer = self.inhibit_us;
    }

    pub fn set_callback(&mut self, callback: EmcyCallback) {
        self.callback = Some(callback);
    }

    pub fn is_error(&self, bit: u8) -> bool {
        let bit = bit as usize;
        bit < EM_STATUS_BITS && self.status[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Latches the status bit and, if it was clear, queues an emergency with
    /// `code` and manufacturer-specific `info`.
    pub fn error_report(&mut self, bit: u8, code: u16, info: u32) {
        if bit as usize >= EM_STATUS_BITS || self.is_error(bit) {
            return;
        }
        self.status[bit as usize / 8] |= 1 << (bit % 8);
        self.push(bit, code, info);
    }

    /// Clears the status bit and, if it was set, queues an error-reset
    /// emergency (code 0x0000).
    pub fn error_reset(&mut self, bit: u8, info: u32) {
        if bit as usize >= EM_STATUS_BITS || !self.is_error(bit) {
            return;
        }
        self.status[bit as usize / 8] &= !(1 << (bit % 8));
        self.push(bit, errors::ERR_NO_ERROR, info);
    }

    fn push(&mut self, bit: u8, code: u16, info: u32) {
        self.fifo[self.write_ptr] = EmcyRecord {
            msg: ((bit as u32) << 24) | code as u32,
            info,
        };
        let next = (self.write_ptr + 1) % self.fifo.len();
        if next == self.post_ptr {
            // The ring is about to swallow unsent history.
            self.overflow = 1;
            self.post_ptr = (self.post_ptr + 1) % self.fifo.len();
        }
        self.write_ptr = next;
        self.history_count = (self.history_count + 1).min(self.fifo.len());
    }

    /// Current error register (OD 1001h) derived from the status bits.
    pub fn error_register(&self) -> u8 {
        self.error_register
    }

    pub fn process(&mut self, dt_us: u32, next_us: &mut u32, od: &ObjectDictionary) {
        self.inhibit_timer = self.inhibit_timer.saturating_add(dt_us);

        // Maintain the error register: generic bit for any latched error,
        // communication bit for the communication class.
        let any = self.status.iter().any(|&b| b != 0);
        let mut register = 0u8;
        if any {
            register |= 0x01;
            if self.status[0] & !0x01 != 0 || self.status[1] != 0 || self.status[2] != 0 {
                register |= 0x10;
            }
        }
        if register != self.error_register {
            self.error_register = register;
            let _ = od.set_u8(0x1001, 0, register);
        }

        // Drain pending records, paced by the inhibit time.
        while self.post_ptr != self.write_ptr && self.inhibit_timer >= self.inhibit_us {
            let record = self.fifo[self.post_ptr];
            let msg = record.msg | ((self.error_register as u32) << 16);
            if self.producer_enabled {
                let info = record.info.to_le_bytes();
                let data = [
                    (msg & 0xFF) as u8,
                    ((msg >> 8) & 0xFF) as u8,
                    ((msg >> 16) & 0xFF) as u8,
                    (msg >> 24) as u8,
                    info[0],
                    info[1],
                    info[2],
                    info[3],
                ];
                let _ = self.bus.send(&CanFrame::new(self.cob_ident, &data));
            }
            self.post_ptr = (self.post_ptr + 1) % self.fifo.len();
            self.inhibit_timer = 0;

            if self.overflow == 1 {
                self.overflow = 2;
                warn!("EMCY FIFO overflowed, history lost");
                self.error_report(
                    EM_EMERGENCY_BUFFER_FULL,
                    ERR_CAN_OVERRUN,
                    0,
                );
            }
        }
        if self.post_ptr == self.write_ptr && self.overflow == 2 {
            self.overflow = 0;
            self.error_reset(EM_EMERGENCY_BUFFER_FULL, 0);
        }

        if self.post_ptr != self.write_ptr && self.inhibit_us > self.inhibit_timer {
            *next_us = (*next_us).min(self.inhibit_us - self.inhibit_timer);
        }
    }

    /// Number of records available to a 1003h history read.
    fn history_len(&self) -> usize {
        self.history_count
    }

    /// The `n`-th newest history record (1-based, as in OD 1003h).
    fn history(&self, n: usize) -> Option<u32> {
        if n == 0 || n > self.history_count {
            return None;
        }
        let pos = (self.write_ptr + self.fifo.len() - n) % self.fifo.len();
        Some(self.fifo[pos].msg)
    }

    fn clear_history(&mut self) {
        self.history_count = 0;
        self.write_ptr = 0;
        self.post_ptr = 0;
        self.overflow = 0;
    }
}

impl FrameListener for Emcy {
    fn on_frame(&mut self, frame: &CanFrame) {
        // The subscription mask covers 0x080..=0x0FF; 0x080 itself is SYNC.
        if frame.ident == COB_EMCY || frame.dlc < 8 {
            return;
        }
        let source = (frame.ident - COB_EMCY) as u8;
        let code = u16::from_le_bytes([frame.data[0], frame.data[1]]);
        let register = frame.data[2];
        let bit = frame.data[3];
        let info = u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
        trace!(
            "EMCY from node {}: code {:#06X} register {:#04X}",
            source, code, register
        );
        if let Some(callback) = self.callback.as_mut() {
            callback(source, code, register, bit, info);
        }
    }
}

/// OD hooks for the emergency entries: 1003h (history), 1014h (COB-ID),
/// 1015h (inhibit time).
pub struct EmcyHook {
    pub emcy: Arc<Mutex<Emcy>>,
}

impl OdExtension for EmcyHook {
    fn read(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        buf: &mut [u8],
    ) -> Result<Transfer, OdError> {
        if stream.index == 0x1003 {
            let emcy = self.emcy.lock().unwrap();
            let value: Vec<u8> = if stream.sub_index == 0 {
                vec![emcy.history_len() as u8]
            } else {
                emcy.history(stream.sub_index as usize)
                    .ok_or(OdError::NoData)?
                    .to_le_bytes()
                    .to_vec()
            };
            let count = buf.len().min(value.len().saturating_sub(stream.offset));
            buf[..count].copy_from_slice(&value[stream.offset..stream.offset + count]);
            stream.offset += count;
            stream.data_len = value.len();
            return Ok(if stream.offset >= value.len() {
                Transfer::Complete(count)
            } else {
                Transfer::Partial(count)
            });
        }
        entry.default_read(stream, buf)
    }

    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        match stream.index {
            0x1003 => {
                // Only "write zero to sub-index 0 clears the history" is
                // allowed.
                if stream.sub_index != 0 {
                    return Err(OdError::ReadOnly);
                }
                if data != [0] {
                    return Err(OdError::InvalidValue);
                }
                self.emcy.lock().unwrap().clear_history();
                entry.default_write(stream, data)
            }
            0x1014 => {
                let result = entry.default_write(stream, data)?;
                if result.is_complete() {
                    let value = entry
                        .variable(0)
                        .map(|v| u32::from_le_bytes([v.data[0], v.data[1], v.data[2], v.data[3]]))
                        .unwrap_or(0);
                    let mut emcy = self.emcy.lock().unwrap();
                    // Bit 31 set disables the producer.
                    emcy.producer_enabled = value & 0x8000_0000 == 0;
                    emcy.cob_ident = (value & 0x7FF) as u16;
                }
                Ok(result)
            }
            0x1015 => {
                let result = entry.default_write(stream, data)?;
                if result.is_complete() {
                    let value = entry
                        .variable(0)
                        .map(|v| u16::from_le_bytes([v.data[0], v.data[1]]))
                        .unwrap_or(0);
                    self.emcy.lock().unwrap().inhibit_us = value as u32 * 100;
                }
                Ok(result)
            }
            _ => entry.default_write(stream, data),
        }
    }
}

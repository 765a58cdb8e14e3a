// crates/canopen-rs/src/pdo/rpdo.rs

use super::{PdoBase, PdoObject, check_cob_id_write, read_mapping_entry};
use crate::bus::{BusManager, FrameListener, SubscriptionToken};
use crate::emcy::{Emcy, errors};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CAN_ID_MASK, CanFrame};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Receive PDO: consumes mapped process data from one configured identifier.
///
/// Reception runs on the bus listener and only fills one of two 8-byte
/// shadow buffers; the periodic tick writes the data into the OD. For
/// synchronous RPDOs the buffers alternate with the SYNC toggle so a frame
/// received in one SYNC period is delivered in the next.
pub struct Rpdo {
    pub(crate) base: PdoBase,
    bus: Arc<BusManager>,
    emcy: Arc<Mutex<Emcy>>,
    sync_toggle: Arc<AtomicBool>,
    shadow: [[u8; 8]; 2],
    fresh: [bool; 2],
    synchronous: bool,
    seen: bool,
    event_time_us: u32,
    event_timer_us: u32,
    timeout_reported: bool,
    rx_too_short: bool,
    rx_too_long: bool,
    length_reported: bool,
    sub_token: Option<SubscriptionToken>,
}

impl Rpdo {
    /// `number` is the zero-based RPDO number (communication parameters at
    /// `0x1400 + number`).
    pub fn new(
        number: u16,
        predefined_ident: u16,
        bus: Arc<BusManager>,
        emcy: Arc<Mutex<Emcy>>,
        sync_toggle: Arc<AtomicBool>,
    ) -> Self {
        Self {
            base: PdoBase::new(0x1400 + number, predefined_ident, true),
            bus,
            emcy,
            sync_toggle,
            shadow: [[0; 8]; 2],
            fresh: [false; 2],
            synchronous: false,
            seen: false,
            event_time_us: 0,
            event_timer_us: 0,
            timeout_reported: false,
            rx_too_short: false,
            rx_too_long: false,
            length_reported: false,
            sub_token: None,
        }
    }

    pub fn configured_ident(&self) -> u16 {
        self.base.configured_ident
    }

    pub fn is_valid(&self) -> bool {
        self.base.valid
    }

    /// Rebuilds mapping, transmission type and identifier from the OD, as
    /// done at start-up and after a communication reset. A broken mapping is
    /// escalated to EMCY by the caller through the returned error.
    pub fn configure_from_od(&mut self, od: &ObjectDictionary) -> Result<(), OdError> {
        let comm = self.base.comm_index;
        let map_index = comm + 0x200;

        let kind = od.u8(comm, 2).unwrap_or(255);
        self.synchronous = kind <= 240;
        self.event_time_us = od.u16(comm, 5).map(|ms| ms as u32 * 1000).unwrap_or(0);
        self.fresh = [false; 2];
        self.seen = false;
        self.event_timer_us = 0;
        self.timeout_reported = false;

        let mapping = od
            .with_entry(map_index, |entry| read_mapping_entry(entry))
            .ok_or(OdError::OdMissing)?;
        let result = self.base.init_mapping(od, &mapping.0, mapping.1);

        let cob = od.u32(comm, 1).unwrap_or(0x8000_0000);
        self.base.apply_cob_id(cob);
        result
    }

    pub(crate) fn take_subscription(&mut self) -> Option<SubscriptionToken> {
        self.sub_token.take()
    }

    /// (Re)registers the bus subscription for the configured identifier.
    pub fn attach(rpdo: &Arc<Mutex<Rpdo>>, bus: &BusManager) {
        let (old, ident, valid) = {
            let mut r = rpdo.lock().unwrap();
            (r.sub_token.take(), r.base.configured_ident, r.base.valid)
        };
        if let Some(token) = old {
            bus.unsubscribe(token);
        }
        if valid {
            let listener: Arc<Mutex<dyn FrameListener>> = rpdo.clone();
            match bus.subscribe(ident, CAN_ID_MASK, false, listener) {
                Ok(token) => rpdo.lock().unwrap().sub_token = Some(token),
                Err(e) => warn!("RPDO subscribe on {:#05X} failed: {}", ident, e),
            }
        }
    }

    /// Delivers buffered frames into the OD and runs the reception timeout.
    pub fn process(
        &mut self,
        dt_us: u32,
        next_us: &mut u32,
        od: &ObjectDictionary,
        operational: bool,
    ) {
        if !self.base.valid || !operational {
            self.fresh = [false; 2];
            self.event_timer_us = 0;
            self.seen = false;
            return;
        }

        if self.rx_too_short || self.rx_too_long {
            if !self.length_reported {
                self.length_reported = true;
                self.emcy.lock().unwrap().error_report(
                    errors::EM_RPDO_WRONG_LENGTH,
                    errors::ERR_PDO_LENGTH,
                    self.base.configured_ident as u32,
                );
            }
        } else if self.length_reported {
            self.length_reported = false;
            self.emcy
                .lock()
                .unwrap()
                .error_reset(errors::EM_RPDO_WRONG_LENGTH, self.base.configured_ident as u32);
        }

        // Synchronous delivery drains the buffer filled in the previous
        // SYNC period (opposite polarity to reception).
        let toggle = self.sync_toggle.load(Ordering::Relaxed);
        let buf_no = if self.synchronous {
            if toggle { 0 } else { 1 }
        } else {
            0
        };

        let mut received = false;
        while self.fresh[buf_no] {
            self.fresh[buf_no] = false;
            let data = self.shadow[buf_no];
            let mut pos = 0usize;
            for i in 0..self.base.mapped_count as usize {
                let mut stream = self.base.streams[i].clone();
                let mapped_len = stream.offset;
                stream.offset = 0;
                if !stream.dummy {
                    if let Err(e) = od.write(&mut stream, &data[pos..pos + mapped_len]) {
                        warn!(
                            "RPDO {:#05X}: OD write {:#06X}:{} failed: {}",
                            self.base.configured_ident, stream.index, stream.sub_index, e
                        );
                    }
                }
                pos += mapped_len;
            }
            received = true;
            self.seen = true;
        }

        if self.event_time_us > 0 && self.seen {
            if received {
                self.event_timer_us = 0;
                if self.timeout_reported {
                    self.timeout_reported = false;
                    self.emcy
                        .lock()
                        .unwrap()
                        .error_reset(errors::EM_RPDO_TIMEOUT, self.base.configured_ident as u32);
                }
            } else {
                self.event_timer_us = self.event_timer_us.saturating_add(dt_us);
                if self.event_timer_us >= self.event_time_us {
                    if !self.timeout_reported {
                        self.timeout_reported = true;
                        self.emcy.lock().unwrap().error_report(
                            errors::EM_RPDO_TIMEOUT,
                            errors::ERR_RPDO_TIMEOUT,
                            self.base.configured_ident as u32,
                        );
                    }
                } else {
                    *next_us = (*next_us).min(self.event_time_us - self.event_timer_us);
                }
            }
        }
    }
}

impl PdoObject for Rpdo {
    fn base(&self) -> &PdoBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut PdoBase {
        &mut self.base
    }
}

impl FrameListener for Rpdo {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr || !self.base.valid {
            return;
        }
        let dlc = frame.dlc as usize;
        if dlc < self.base.data_len {
            self.rx_too_short = true;
            return;
        }
        if dlc > self.base.data_len {
            self.rx_too_long = true;
        } else {
            self.rx_too_short = false;
            self.rx_too_long = false;
        }

        let buf_no = if self.synchronous && self.sync_toggle.load(Ordering::Relaxed) {
            1
        } else {
            0
        };
        self.shadow[buf_no] = frame.data;
        self.fresh[buf_no] = true;
    }
}

/// OD hook for the RPDO communication parameter (1400h+).
pub struct RpdoCommHook {
    pub(crate) rpdo: Arc<Mutex<Rpdo>>,
    pub(crate) bus: Arc<BusManager>,
}

impl OdExtension for RpdoCommHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        match stream.sub_index {
            1 => {
                let value =
                    u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
                let store = {
                    let rpdo = self.rpdo.lock().unwrap();
                    check_cob_id_write(&rpdo.base, value)?
                };
                let result = entry.default_write(stream, &store.to_le_bytes())?;
                {
                    let mut rpdo = self.rpdo.lock().unwrap();
                    rpdo.base.apply_cob_id(store);
                    rpdo.fresh = [false; 2];
                    rpdo.seen = false;
                }
                Rpdo::attach(&self.rpdo, &self.bus);
                Ok(result)
            }
            2 => {
                let kind = *data.first().ok_or(OdError::TypeMismatch)?;
                if (0xF1..=0xFD).contains(&kind) {
                    return Err(OdError::InvalidValue);
                }
                let result = entry.default_write(stream, data)?;
                let mut rpdo = self.rpdo.lock().unwrap();
                rpdo.synchronous = kind <= 240;
                rpdo.fresh = [false; 2];
                Ok(result)
            }
            5 => {
                let result = entry.default_write(stream, data)?;
                if result.is_complete() && data.len() == 2 {
                    let ms = u16::from_le_bytes([data[0], data[1]]);
                    let mut rpdo = self.rpdo.lock().unwrap();
                    rpdo.event_time_us = ms as u32 * 1000;
                    rpdo.event_timer_us = 0;
                }
                Ok(result)
            }
            _ => entry.default_write(stream, data),
        }
    }
}

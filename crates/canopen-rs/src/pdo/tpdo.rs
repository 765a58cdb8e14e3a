// crates/canopen-rs/src/pdo/tpdo.rs

use super::{PdoBase, PdoObject, check_cob_id_write, read_mapping_entry};
use crate::bus::BusManager;
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::sync::{SyncEvent, SyncTick};
use crate::types::CanFrame;
use log::warn;
use std::sync::{Arc, Mutex};

/// Transmission types. (CiA 301, Table 66)
const TT_SYNC_ACYCLIC: u8 = 0;
const TT_SYNC_CYCLIC_MAX: u8 = 240;
const TT_EVENT_MANUFACTURER: u8 = 254;

/// Transmit PDO: assembles mapped process data into one frame, driven by
/// SYNC, the event timer, PDO flag changes or an application request, and
/// gated by the inhibit time.
pub struct Tpdo {
    pub(crate) base: PdoBase,
    bus: Arc<BusManager>,
    transmission_type: u8,
    send_request: bool,
    /// 255 marks an unseeded counter for sync-cyclic operation.
    sync_counter: u8,
    sync_start: u8,
    inhibit_us: u32,
    inhibit_timer_us: u32,
    event_time_us: u32,
    event_timer_us: u32,
}

impl Tpdo {
    /// `number` is the zero-based TPDO number (communication parameters at
    /// `0x1800 + number`).
    pub fn new(number: u16, predefined_ident: u16, bus: Arc<BusManager>) -> Self {
        Self {
            base: PdoBase::new(0x1800 + number, predefined_ident, false),
            bus,
            transmission_type: 255,
            send_request: false,
            sync_counter: 255,
            sync_start: 0,
            inhibit_us: 0,
            inhibit_timer_us: 0,
            event_time_us: 0,
            event_timer_us: 0,
        }
    }

    pub fn configured_ident(&self) -> u16 {
        self.base.configured_ident
    }

    pub fn is_valid(&self) -> bool {
        self.base.valid
    }

    /// Rebuilds mapping and communication parameters from the OD.
    pub fn configure_from_od(&mut self, od: &ObjectDictionary) -> Result<(), OdError> {
        let comm = self.base.comm_index;
        let map_index = comm + 0x200;

        self.transmission_type = od.u8(comm, 2).unwrap_or(255);
        self.inhibit_us = od.u16(comm, 3).map(|v| v as u32 * 100).unwrap_or(0);
        self.event_time_us = od.u16(comm, 5).map(|ms| ms as u32 * 1000).unwrap_or(0);
        self.sync_start = od.u8(comm, 6).unwrap_or(0);
        self.sync_counter = 255;
        self.send_request = false;
        self.event_timer_us = 0;
        self.inhibit_timer_us = self.inhibit_us;

        let mapping = od
            .with_entry(map_index, |entry| read_mapping_entry(entry))
            .ok_or(OdError::OdMissing)?;
        let result = self.base.init_mapping(od, &mapping.0, mapping.1);

        let cob = od.u32(comm, 1).unwrap_or(0x8000_0000);
        self.base.apply_cob_id(cob);
        result
    }

    /// Application request to transmit an event-driven (or sync-acyclic)
    /// TPDO on its next opportunity.
    pub fn request_send(&mut self) {
        self.send_request = true;
    }

    fn event_driven(&self) -> bool {
        self.transmission_type >= TT_EVENT_MANUFACTURER
    }

    pub fn process(
        &mut self,
        dt_us: u32,
        next_us: &mut u32,
        od: &ObjectDictionary,
        operational: bool,
        sync: &SyncTick,
    ) {
        self.inhibit_timer_us = self.inhibit_timer_us.saturating_add(dt_us);

        if !self.base.valid || !operational {
            self.send_request = false;
            self.event_timer_us = 0;
            self.sync_counter = 255;
            return;
        }

        if self.event_driven() {
            if self.event_time_us > 0 {
                self.event_timer_us = self.event_timer_us.saturating_add(dt_us);
                if self.event_timer_us >= self.event_time_us {
                    self.send_request = true;
                } else {
                    *next_us = (*next_us).min(self.event_time_us - self.event_timer_us);
                }
            }
            // A cleared PDO flag marks an OD write to a mapped sub-entry.
            if !self.send_request {
                for i in 0..self.base.mapped_count as usize {
                    if let Some((index, sub_index)) = self.base.flag_refs[i] {
                        if !od.pdo_flag(index, sub_index) {
                            self.send_request = true;
                            break;
                        }
                    }
                }
            }
            if self.send_request {
                if self.inhibit_timer_us >= self.inhibit_us {
                    self.send(od);
                } else {
                    *next_us = (*next_us).min(self.inhibit_us - self.inhibit_timer_us);
                }
            }
        } else {
            match sync.event {
                SyncEvent::PassedWindow => {
                    // Synchronous traffic missed its window: abandon it.
                    self.send_request = false;
                }
                SyncEvent::RxTx => {
                    if self.transmission_type == TT_SYNC_ACYCLIC {
                        if self.send_request {
                            self.send(od);
                        }
                    } else if self.transmission_type <= TT_SYNC_CYCLIC_MAX {
                        if self.sync_counter == 255 {
                            if self.sync_start != 0 {
                                if sync.counter == self.sync_start {
                                    self.sync_counter = self.transmission_type;
                                }
                            } else {
                                self.sync_counter = self.transmission_type / 2 + 1;
                            }
                        }
                        if self.sync_counter != 255 {
                            self.sync_counter -= 1;
                            if self.sync_counter == 0 {
                                self.send(od);
                                self.sync_counter = self.transmission_type;
                            }
                        }
                    }
                }
                SyncEvent::None => {}
            }
        }
    }

    /// Assembles the frame from the mapped streams and puts it on the bus.
    fn send(&mut self, od: &ObjectDictionary) {
        let mut data = [0u8; 8];
        let mut pos = 0usize;
        for i in 0..self.base.mapped_count as usize {
            let mut stream = self.base.streams[i].clone();
            let mapped_len = stream.offset;
            stream.offset = 0;
            if let Err(e) = od.read(&mut stream, &mut data[pos..pos + mapped_len]) {
                warn!(
                    "TPDO {:#05X}: OD read {:#06X}:{} failed: {}",
                    self.base.configured_ident, stream.index, stream.sub_index, e
                );
            }
            pos += mapped_len;
        }
        for flag in self.base.flag_refs.iter().take(self.base.mapped_count as usize) {
            if let Some((index, sub_index)) = flag {
                od.set_pdo_flag(*index, *sub_index);
            }
        }

        let mut frame = CanFrame::new(self.base.configured_ident, &data);
        frame.dlc = self.base.data_len as u8;
        let _ = self.bus.send(&frame);

        self.send_request = false;
        self.event_timer_us = 0;
        self.inhibit_timer_us = 0;
    }
}

impl PdoObject for Tpdo {
    fn base(&self) -> &PdoBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut PdoBase {
        &mut self.base
    }
}

/// OD hook for the TPDO communication parameter (1800h+).
pub struct TpdoCommHook {
    pub(crate) tpdo: Arc<Mutex<Tpdo>>,
}

impl OdExtension for TpdoCommHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let mut tpdo = self.tpdo.lock().unwrap();
        match stream.sub_index {
            1 => {
                let value =
                    u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
                let store = check_cob_id_write(&tpdo.base, value)?;
                let result = entry.default_write(stream, &store.to_le_bytes())?;
                tpdo.base.apply_cob_id(store);
                tpdo.sync_counter = 255;
                if !tpdo.base.valid {
                    tpdo.send_request = false;
                }
                Ok(result)
            }
            2 => {
                let kind = *data.first().ok_or(OdError::TypeMismatch)?;
                if (0xF1..=0xFD).contains(&kind) {
                    return Err(OdError::InvalidValue);
                }
                let result = entry.default_write(stream, data)?;
                tpdo.transmission_type = kind;
                tpdo.sync_counter = 255;
                tpdo.event_timer_us = 0;
                Ok(result)
            }
            3 => {
                // Inhibit time may only change while the PDO is invalid.
                if tpdo.base.valid {
                    return Err(OdError::InvalidValue);
                }
                let result = entry.default_write(stream, data)?;
                if data.len() == 2 {
                    tpdo.inhibit_us = u16::from_le_bytes([data[0], data[1]]) as u32 * 100;
                    tpdo.inhibit_timer_us = tpdo.inhibit_us;
                }
                Ok(result)
            }
            5 => {
                let result = entry.default_write(stream, data)?;
                if data.len() == 2 {
                    tpdo.event_time_us = u16::from_le_bytes([data[0], data[1]]) as u32 * 1000;
                    tpdo.event_timer_us = 0;
                }
                Ok(result)
            }
            6 => {
                if tpdo.base.valid {
                    return Err(OdError::InvalidValue);
                }
                let result = entry.default_write(stream, data)?;
                tpdo.sync_start = *data.first().unwrap_or(&0);
                tpdo.sync_counter = 255;
                Ok(result)
            }
            _ => entry.default_write(stream, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CanInterface, CanOpenError};
    use crate::od::{Attribute, Object, ObjectEntry as Entry, Variable, populate_communication_profile};
    use crate::types::NodeId;

    struct CaptureDriver {
        frames: Arc<Mutex<Vec<CanFrame>>>,
    }
    impl CanInterface for CaptureDriver {
        fn connect(&mut self) -> Result<(), CanOpenError> {
            Ok(())
        }
        fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
            self.frames.lock().unwrap().push(*frame);
            Ok(())
        }
    }

    fn harness() -> (Tpdo, ObjectDictionary, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver {
            frames: frames.clone(),
        })));

        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId(0x10));
        od.insert(
            0x2002,
            Entry::new(
                "Mapped_U16",
                Object::Variable(Variable::unsigned16(
                    Attribute::SDO_RW | Attribute::TPDO,
                    0xBEEF,
                )),
            ),
        );
        od.set_u32(0x1A00, 1, 0x2002_0010).unwrap();
        od.set_u8(0x1A00, 0, 1).unwrap();

        let mut tpdo = Tpdo::new(0, 0x190, bus);
        tpdo.configure_from_od(&od).unwrap();
        (tpdo, od, frames)
    }

    fn no_sync() -> SyncTick {
        SyncTick {
            event: SyncEvent::None,
            counter: 0,
            toggle: false,
        }
    }

    fn sync_tick() -> SyncTick {
        SyncTick {
            event: SyncEvent::RxTx,
            counter: 0,
            toggle: false,
        }
    }

    #[test]
    fn test_event_timer_fires_periodically() {
        let (mut tpdo, od, frames) = harness();
        tpdo.event_time_us = 100_000;
        let mut next = u32::MAX;

        for _ in 0..300 {
            tpdo.process(1000, &mut next, &od, true, &no_sync());
        }
        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].ident, 0x190);
        assert_eq!(sent[0].dlc, 2);
        assert_eq!(&sent[0].data[..2], &0xBEEF_u16.to_le_bytes());
    }

    #[test]
    fn test_od_write_triggers_event_tpdo() {
        let (mut tpdo, od, frames) = harness();
        // Give the mapped entry an extension so flag storage applies.
        struct Passthrough;
        impl OdExtension for Passthrough {}
        od.attach_extension(0x2002, Arc::new(Mutex::new(Passthrough))).unwrap();
        tpdo.configure_from_od(&od).unwrap();

        let mut next = u32::MAX;
        tpdo.process(1000, &mut next, &od, true, &no_sync());
        // First pass sends once (flag bit starts cleared), marking it seen.
        assert_eq!(frames.lock().unwrap().len(), 1);

        tpdo.process(1000, &mut next, &od, true, &no_sync());
        assert_eq!(frames.lock().unwrap().len(), 1);

        // An OD write clears the flag and triggers the next transmission.
        od.set_u16(0x2002, 0, 0x1234).unwrap();
        tpdo.process(1000, &mut next, &od, true, &no_sync());
        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[1].data[..2], &0x1234_u16.to_le_bytes());
    }

    #[test]
    fn test_inhibit_time_gates_transmission() {
        let (mut tpdo, od, frames) = harness();
        tpdo.inhibit_us = 50_000;
        tpdo.inhibit_timer_us = 50_000;
        let mut next = u32::MAX;

        tpdo.request_send();
        tpdo.process(1000, &mut next, &od, true, &no_sync());
        assert_eq!(frames.lock().unwrap().len(), 1);

        // A request right after the send must wait out the inhibit time.
        tpdo.request_send();
        tpdo.process(1000, &mut next, &od, true, &no_sync());
        assert_eq!(frames.lock().unwrap().len(), 1);
        tpdo.process(50_000, &mut next, &od, true, &no_sync());
        assert_eq!(frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_sync_cyclic_every_n_syncs() {
        let (mut tpdo, od, frames) = harness();
        tpdo.transmission_type = 3;
        let mut next = u32::MAX;

        // Seeded with type/2 + 1 = 2: first transmission on the second SYNC,
        // then every third.
        let mut sent_at = Vec::new();
        for n in 0..12 {
            tpdo.process(1000, &mut next, &od, true, &sync_tick());
            if frames.lock().unwrap().len() > sent_at.len() {
                sent_at.push(n);
            }
        }
        assert_eq!(sent_at, vec![1, 4, 7, 10]);
    }

    #[test]
    fn test_sync_acyclic_sends_on_request_only() {
        let (mut tpdo, od, frames) = harness();
        tpdo.transmission_type = 0;
        let mut next = u32::MAX;

        tpdo.process(1000, &mut next, &od, true, &sync_tick());
        assert!(frames.lock().unwrap().is_empty());

        tpdo.request_send();
        tpdo.process(1000, &mut next, &od, true, &no_sync());
        assert!(frames.lock().unwrap().is_empty());
        tpdo.process(1000, &mut next, &od, true, &sync_tick());
        assert_eq!(frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_passed_window_aborts_pending_sync_pdo() {
        let (mut tpdo, od, frames) = harness();
        tpdo.transmission_type = 0;
        tpdo.request_send();
        let mut next = u32::MAX;
        tpdo.process(
            1000,
            &mut next,
            &od,
            true,
            &SyncTick {
                event: SyncEvent::PassedWindow,
                counter: 0,
                toggle: false,
            },
        );
        assert!(!tpdo.send_request);
        tpdo.process(1000, &mut next, &od, true, &sync_tick());
        assert!(frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_not_operational_suppresses_sending(){
        let (mut tpdo, od, frames) = harness();
        tpdo.event_time_us = 1000;
        let mut next = u32::MAX;
        for _ in 0..10 {
            tpdo.process(1000, &mut next, &od, false, &no_sync());
        }
        assert!(frames.lock().unwrap().is_empty());
    }
}

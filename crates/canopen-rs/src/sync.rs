// crates/canopen-rs/src/sync.rs

use crate::bus::{BusManager, FrameListener, SubscriptionToken};
use crate::emcy::{Emcy, errors};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CAN_ID_MASK, CanFrame, COB_SYNC, is_restricted_ident};
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of one SYNC tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    None,
    /// A SYNC was received or produced this tick.
    RxTx,
    /// The synchronous window elapsed without delivery; signalled once per
    /// breach.
    PassedWindow,
}

/// Snapshot handed to the PDO processing stages.
#[derive(Debug, Clone, Copy)]
pub struct SyncTick {
    pub event: SyncEvent,
    /// The most recent SYNC counter value (0 when no counter is configured).
    pub counter: u8,
    pub toggle: bool,
}

/// SYNC producer or consumer (OD 1005/1006/1007/1019).
pub struct SyncObject {
    bus: Arc<BusManager>,
    emcy: Arc<Mutex<Emcy>>,
    producer: bool,
    cob_ident: u16,
    period_us: u32,
    window_us: u32,
    counter_overflow: u8,
    counter: u8,
    timer_us: u32,
    rx_new: bool,
    rx_counter: u8,
    rx_length_err: bool,
    /// Flipped on every SYNC; RPDOs read it from the listener context.
    toggle: Arc<AtomicBool>,
    /// 0 = no cycle seen yet, 1 = running, 2 = timeout reported.
    timeout_state: u8,
    outside_window: bool,
    sub_token: Option<SubscriptionToken>,
}

impl SyncObject {
    pub fn new(bus: Arc<BusManager>, emcy: Arc<Mutex<Emcy>>) -> Self {
        Self {
            bus,
            emcy,
            producer: false,
            cob_ident: COB_SYNC,
            period_us: 0,
            window_us: 0,
            counter_overflow: 0,
            counter: 1,
            timer_us: 0,
            rx_new: false,
            rx_counter: 0,
            rx_length_err: false,
            toggle: Arc::new(AtomicBool::new(false)),
            timeout_state: 0,
            outside_window: false,
            sub_token: None,
        }
    }

    /// Shared toggle handle for RPDO double buffering.
    pub fn toggle_handle(&self) -> Arc<AtomicBool> {
        self.toggle.clone()
    }

    pub fn configure_from_od(&mut self, od: &ObjectDictionary) {
        if let Ok(cob) = od.u32(0x1005, 0) {
            self.cob_ident = (cob & 0x7FF) as u16;
            self.producer = cob & 0x4000_0000 != 0;
        }
        self.period_us = od.u32(0x1006, 0).unwrap_or(0);
        self.window_us = od.u32(0x1007, 0).unwrap_or(0);
        self.counter_overflow = od.u8(0x1019, 0).unwrap_or(0);
        self.counter = 1;
        self.timer_us = 0;
        self.timeout_state = 0;
        self.outside_window = false;
    }

    pub(crate) fn take_subscription(&mut self) -> Option<SubscriptionToken> {
        self.sub_token.take()
    }

    /// (Re)registers the bus subscription for the configured identifier.
    pub fn attach(sync: &Arc<Mutex<SyncObject>>, bus: &BusManager) {
        let (old, ident) = {
            let mut s = sync.lock().unwrap();
            (s.sub_token.take(), s.cob_ident)
        };
        if let Some(token) = old {
            bus.unsubscribe(token);
        }
        let listener: Arc<Mutex<dyn FrameListener>> = sync.clone();
        match bus.subscribe(ident, CAN_ID_MASK, false, listener) {
            Ok(token) => sync.lock().unwrap().sub_token = Some(token),
            Err(e) => warn!("SYNC subscribe on {:#05X} failed: {}", ident, e),
        }
    }

    pub fn process(&mut self, dt_us: u32, next_us: &mut u32, operational: bool) -> SyncTick {
        self.timer_us = self.timer_us.saturating_add(dt_us);
        let mut event = SyncEvent::None;

        if self.rx_new {
            self.rx_new = false;
            self.timer_us = 0;
            self.outside_window = false;
            event = SyncEvent::RxTx;
            if self.rx_length_err {
                self.rx_length_err = false;
                self.emcy.lock().unwrap().error_report(
                    errors::EM_SYNC_LENGTH,
                    errors::ERR_COMMUNICATION,
                    self.rx_counter as u32,
                );
            }
            if self.timeout_state == 2 {
                self.emcy.lock().unwrap().error_reset(errors::EM_SYNC_TIMEOUT, 0);
            }
            self.timeout_state = 1;
        }

        if self.producer && self.period_us > 0 && operational {
            if self.timer_us >= self.period_us {
                self.timer_us = 0;
                self.outside_window = false;
                let frame = if self.counter_overflow == 0 {
                    CanFrame::new(self.cob_ident, &[])
                } else {
                    let frame = CanFrame::new(self.cob_ident, &[self.counter]);
                    self.rx_counter = self.counter;
                    self.counter = if self.counter >= self.counter_overflow {
                        1
                    } else {
                        self.counter + 1
                    };
                    frame
                };
                let _ = self.bus.send(&frame);
                self.toggle.fetch_xor(true, Ordering::Relaxed);
                event = SyncEvent::RxTx;
            }
            *next_us = (*next_us).min(self.period_us - self.timer_us);
        }

        // Consumer-side missing-SYNC supervision at 1.5 cycle periods.
        if !self.producer && self.period_us > 0 && self.timeout_state == 1 {
            let deadline = self.period_us + self.period_us / 2;
            if self.timer_us > deadline {
                self.timeout_state = 2;
                self.emcy.lock().unwrap().error_report(
                    errors::EM_SYNC_TIMEOUT,
                    errors::ERR_COMMUNICATION,
                    0,
                );
            } else {
                *next_us = (*next_us).min(deadline - self.timer_us);
            }
        }

        if event == SyncEvent::None
            && self.window_us > 0
            && self.timer_us > self.window_us
            && !self.outside_window
        {
            // Signalled exactly once per window breach.
            self.outside_window = true;
            event = SyncEvent::PassedWindow;
        }

        SyncTick {
            event,
            counter: self.rx_counter,
            toggle: self.toggle.load(Ordering::Relaxed),
        }
    }
}

impl FrameListener for SyncObject {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr || self.producer {
            return;
        }
        let expected = if self.counter_overflow > 0 { 1 } else { 0 };
        if frame.dlc as usize != expected {
            self.rx_length_err = true;
        }
        if self.counter_overflow > 0 && frame.dlc >= 1 {
            self.rx_counter = frame.data[0];
        }
        self.toggle.fetch_xor(true, Ordering::Relaxed);
        self.rx_new = true;
    }
}

/// OD hooks for the SYNC entries 1005h, 1006h, 1007h and 1019h.
pub struct SyncHook {
    pub sync: Arc<Mutex<SyncObject>>,
    pub bus: Arc<BusManager>,
}

impl OdExtension for SyncHook {
    fn write(
        &mut self,
        od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        match stream.index {
            0x1005 => {
                let value =
                    u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
                let ident = (value & 0x7FF) as u16;
                if value & 0x3FFF_F800 != 0 {
                    return Err(OdError::InvalidValue);
                }
                if ident != COB_SYNC && is_restricted_ident(ident) {
                    return Err(OdError::InvalidValue);
                }
                let result = entry.default_write(stream, data)?;
                let resubscribe = {
                    let mut sync = self.sync.lock().unwrap();
                    sync.producer = value & 0x4000_0000 != 0;
                    let changed = sync.cob_ident != ident;
                    sync.cob_ident = ident;
                    changed
                };
                if resubscribe {
                    SyncObject::attach(&self.sync, &self.bus);
                }
                Ok(result)
            }
            0x1006 => {
                let result = entry.default_write(stream, data)?;
                if data.len() == 4 {
                    let mut sync = self.sync.lock().unwrap();
                    sync.period_us = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    sync.timer_us = 0;
                    sync.timeout_state = 0;
                }
                Ok(result)
            }
            0x1007 => {
                let result = entry.default_write(stream, data)?;
                if data.len() == 4 {
                    self.sync.lock().unwrap().window_us =
                        u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                }
                Ok(result)
            }
            0x1019 => {
                let value = *data.first().ok_or(OdError::TypeMismatch)?;
                if value == 1 || value > 240 {
                    return Err(OdError::InvalidValue);
                }
                // The overflow value may not change while a cycle period is
                // configured.
                if od.u32(0x1006, 0).unwrap_or(0) != 0 {
                    return Err(OdError::DataDevState);
                }
                let result = entry.default_write(stream, data)?;
                let mut sync = self.sync.lock().unwrap();
                sync.counter_overflow = value;
                sync.counter = 1;
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

    fn harness() -> (SyncObject, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver {
            frames: frames.clone(),
        })));
        let emcy = Arc::new(Mutex::new(Emcy::new(NodeId(1), 8, bus.clone())));
        (SyncObject::new(bus, emcy), frames)
    }

    #[test]
    fn test_producer_sends_every_period() {
        let (mut sync, frames) = harness();
        sync.producer = true;
        sync.period_us = 10_000;
        let mut next = u32::MAX;

        for _ in 0..35 {
            sync.process(1000, &mut next, true);
        }
        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].ident, 0x080);
        assert_eq!(sent[0].dlc, 0);
    }

    #[test]
    fn test_producer_counter_wraps_at_overflow() {
        let (mut sync, frames) = harness();
        sync.producer = true;
        sync.period_us = 1000;
        sync.counter_overflow = 3;
        let mut next = u32::MAX;

        for _ in 0..5 {
            sync.process(1000, &mut next, true);
        }
        let sent = frames.lock().unwrap();
        let counters: Vec<u8> = sent.iter().map(|f| f.data[0]).collect();
        assert_eq!(counters, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_consumer_toggle_and_event() {
        let (mut sync, _frames) = harness();
        let mut next = u32::MAX;
        assert!(!sync.toggle_handle().load(Ordering::Relaxed));

        sync.on_frame(&CanFrame::new(0x080, &[]));
        assert!(sync.toggle_handle().load(Ordering::Relaxed));

        let tick = sync.process(1000, &mut next, true);
        assert_eq!(tick.event, SyncEvent::RxTx);
        assert!(tick.toggle);
        assert_eq!(sync.process(1000, &mut next, true).event, SyncEvent::None);
    }

    #[test]
    fn test_window_breach_signalled_once() {
        let (mut sync, _frames) = harness();
        sync.window_us = 5_000;
        let mut next = u32::MAX;
        sync.on_frame(&CanFrame::new(0x080, &[]));
        sync.process(1000, &mut next, true);

        // Window elapses.
        assert_eq!(sync.process(6_000, &mut next, true).event, SyncEvent::PassedWindow);
        // Only signalled on the transition.
        assert_eq!(sync.process(1000, &mut next, true).event, SyncEvent::None);
        // Next SYNC rearms the window.
        sync.on_frame(&CanFrame::new(0x080, &[]));
        sync.process(1000, &mut next, true);
        assert_eq!(sync.process(6_000, &mut next, true).event, SyncEvent::PassedWindow);
    }

    #[test]
    fn test_missing_sync_escalates_to_emcy() {
        let (mut sync, _frames) = harness();
        sync.period_us = 10_000;
        let mut next = u32::MAX;
        sync.on_frame(&CanFrame::new(0x080, &[]));
        sync.process(1000, &mut next, true);

        sync.process(20_000, &mut next, true);
        assert_eq!(sync.timeout_state, 2);
        assert!(sync.emcy.lock().unwrap().is_error(errors::EM_SYNC_TIMEOUT));

        // A returning SYNC clears the error.
        sync.on_frame(&CanFrame::new(0x080, &[]));
        sync.process(1000, &mut next, true);
        assert!(!sync.emcy.lock().unwrap().is_error(errors::EM_SYNC_TIMEOUT));
    }

    #[test]
    fn test_counter_overflow_write_validation() {
        use crate::od::{ObjectDictionary, OdError, Origin, populate_communication_profile};

        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver { frames })));
        let emcy = Arc::new(Mutex::new(Emcy::new(NodeId(1), 8, bus.clone())));
        let sync = Arc::new(Mutex::new(SyncObject::new(bus.clone(), emcy)));

        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId(1));
        let hook = Arc::new(Mutex::new(SyncHook {
            sync: sync.clone(),
            bus,
        }));
        for index in [0x1005, 0x1006, 0x1019] {
            od.attach_extension(index, hook.clone()).unwrap();
        }

        // Only 0 and 2..=240 are acceptable overflow values.
        assert_eq!(
            od.write_value(0x1019, 0, Origin::Internal, &[1]).err(),
            Some(OdError::InvalidValue)
        );
        assert_eq!(
            od.write_value(0x1019, 0, Origin::Internal, &[241]).err(),
            Some(OdError::InvalidValue)
        );
        od.write_value(0x1019, 0, Origin::Internal, &[240]).unwrap();
        assert_eq!(sync.lock().unwrap().counter_overflow, 240);

        // With a cycle period configured the value is frozen.
        od.set_u32(0x1006, 0, 1000).unwrap();
        assert_eq!(
            od.write_value(0x1019, 0, Origin::Internal, &[0]).err(),
            Some(OdError::DataDevState)
        );
    }

    #[test]
    fn test_counter_length_mismatch_reports() {
        let (mut sync, _frames) = harness();
        sync.counter_overflow = 16;
        let mut next = u32::MAX;
        sync.on_frame(&CanFrame::new(0x080, &[]));
        sync.process(1000, &mut next, true);
        assert!(sync.emcy.lock().unwrap().is_error(errors::EM_SYNC_LENGTH));
    }
}

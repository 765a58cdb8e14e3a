// crates/canopen-rs/src/time.rs

use crate::bus::{BusManager, FrameListener, SubscriptionToken};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CAN_ID_MASK, CanFrame, COB_TIME};
use log::warn;
use std::sync::{Arc, Mutex};

/// Milliseconds in one day.
const MS_PER_DAY: u32 = 86_400_000;

/// TIME service: consumes or produces the CANopen TIME_OF_DAY broadcast
/// (milliseconds after midnight, days since 1984-01-01) and keeps a local
/// clock running between frames.
pub struct TimeObject {
    bus: Arc<BusManager>,
    cob_ident: u16,
    consumer: bool,
    producer: bool,
    ms_after_midnight: u32,
    days: u16,
    residual_us: u32,
    producer_period_us: u32,
    producer_timer_us: u32,
    rx: Option<(u32, u16)>,
    sub_token: Option<SubscriptionToken>,
}

impl TimeObject {
    pub fn new(bus: Arc<BusManager>) -> Self {
        Self {
            bus,
            cob_ident: COB_TIME,
            consumer: false,
            producer: false,
            ms_after_midnight: 0,
            days: 0,
            residual_us: 0,
            producer_period_us: 0,
            producer_timer_us: 0,
            rx: None,
            sub_token: None,
        }
    }

    /// Reads COB-ID and consumer/producer flags from OD 1012h
    /// (bit 31 = consume, bit 30 = produce).
    pub fn configure_from_od(&mut self, od: &ObjectDictionary) {
        if let Ok(cob) = od.u32(0x1012, 0) {
            self.cob_ident = (cob & 0x7FF) as u16;
            self.consumer = cob & 0x8000_0000 != 0;
            self.producer = cob & 0x4000_0000 != 0;
        }
        self.producer_timer_us = 0;
    }

    pub(crate) fn take_subscription(&mut self) -> Option<SubscriptionToken> {
        self.sub_token.take()
    }

    /// (Re)registers the bus subscription for the configured identifier.
    pub fn attach(time: &Arc<Mutex<TimeObject>>, bus: &BusManager) {
        let (old, ident) = {
            let mut t = time.lock().unwrap();
            (t.sub_token.take(), t.cob_ident)
        };
        if let Some(token) = old {
            bus.unsubscribe(token);
        }
        let listener: Arc<Mutex<dyn FrameListener>> = time.clone();
        match bus.subscribe(ident, CAN_ID_MASK, false, listener) {
            Ok(token) => time.lock().unwrap().sub_token = Some(token),
            Err(e) => warn!("TIME subscribe on {:#05X} failed: {}", ident, e),
        }
    }

    /// Current timestamp: (milliseconds after midnight, days since
    /// 1984-01-01).
    pub fn timestamp(&self) -> (u32, u16) {
        (self.ms_after_midnight, self.days)
    }

    pub fn set_timestamp(&mut self, ms_after_midnight: u32, days: u16) {
        self.ms_after_midnight = ms_after_midnight % MS_PER_DAY;
        self.days = days;
        self.residual_us = 0;
    }

    pub fn set_producer_interval_ms(&mut self, interval_ms: u32) {
        self.producer_period_us = interval_ms.saturating_mul(1000);
        self.producer_timer_us = 0;
    }

    pub fn process(&mut self, dt_us: u32, next_us: &mut u32) {
        // Advance the internal clock between frames.
        self.residual_us = self.residual_us.saturating_add(dt_us);
        self.ms_after_midnight += self.residual_us / 1000;
        self.residual_us %= 1000;
        while self.ms_after_midnight >= MS_PER_DAY {
            self.ms_after_midnight -= MS_PER_DAY;
            self.days = self.days.wrapping_add(1);
        }

        if let Some((ms, days)) = self.rx.take() {
            self.ms_after_midnight = ms;
            self.days = days;
            self.residual_us = 0;
        }

        if self.producer && self.producer_period_us > 0 {
            self.producer_timer_us = self.producer_timer_us.saturating_add(dt_us);
            if self.producer_timer_us >= self.producer_period_us {
                self.producer_timer_us = 0;
                let ms = self.ms_after_midnight.to_le_bytes();
                let days = self.days.to_le_bytes();
                let data = [ms[0], ms[1], ms[2], ms[3], days[0], days[1]];
                let _ = self.bus.send(&CanFrame::new(self.cob_ident, &data));
            }
            *next_us = (*next_us).min(self.producer_period_us - self.producer_timer_us);
        }
    }
}

impl FrameListener for TimeObject {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr || !self.consumer || frame.dlc < 6 {
            return;
        }
        let ms = u32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]])
            & 0x0FFF_FFFF;
        let days = u16::from_le_bytes([frame.data[4], frame.data[5]]);
        self.rx = Some((ms, days));
    }
}

/// OD hook for 1012h: reconfigures identifier and consumer/producer roles.
pub struct TimeHook {
    pub time: Arc<Mutex<TimeObject>>,
    pub bus: Arc<BusManager>,
}

impl OdExtension for TimeHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let value = u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
        if value & 0x3FFF_F800 != 0 {
            return Err(OdError::InvalidValue);
        }
        let ident = (value & 0x7FF) as u16;
        if ident != COB_TIME && crate::types::is_restricted_ident(ident) {
            return Err(OdError::InvalidValue);
        }
        let result = entry.default_write(stream, data)?;
        let resubscribe = {
            let mut time = self.time.lock().unwrap();
            time.consumer = value & 0x8000_0000 != 0;
            time.producer = value & 0x4000_0000 != 0;
            let changed = time.cob_ident != ident;
            time.cob_ident = ident;
            changed
        };
        if resubscribe {
            TimeObject::attach(&self.time, &self.bus);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CanInterface, CanOpenError};

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

    fn harness() -> (TimeObject, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver {
            frames: frames.clone(),
        })));
        (TimeObject::new(bus), frames)
    }

    #[test]
    fn test_consumed_frame_sets_clock() {
        let (mut time, _frames) = harness();
        time.consumer = true;
        let mut data = [0u8; 6];
        data[..4].copy_from_slice(&0x0123_4567_u32.to_le_bytes());
        data[4..6].copy_from_slice(&15000_u16.to_le_bytes());
        time.on_frame(&CanFrame::new(0x100, &data));

        let mut next = u32::MAX;
        time.process(0, &mut next);
        assert_eq!(time.timestamp(), (0x0123_4567, 15000));
    }

    #[test]
    fn test_top_bits_of_ms_are_masked() {
        let (mut time, _frames) = harness();
        time.consumer = true;
        let mut data = [0u8; 6];
        data[..4].copy_from_slice(&0xF000_0001_u32.to_le_bytes());
        time.on_frame(&CanFrame::new(0x100, &data));
        let mut next = u32::MAX;
        time.process(0, &mut next);
        assert_eq!(time.timestamp().0, 0x1);
    }

    #[test]
    fn test_clock_advances_and_carries_into_days() {
        let (mut time, _frames) = harness();
        time.set_timestamp(MS_PER_DAY - 2, 100);
        let mut next = u32::MAX;
        // 1.5 ms in microsecond steps: carries a day boundary.
        time.process(1500, &mut next);
        time.process(1500, &mut next);
        assert_eq!(time.timestamp(), (1, 101));
    }

    #[test]
    fn test_producer_emits_six_byte_frames() {
        let (mut time, frames) = harness();
        time.producer = true;
        time.set_timestamp(1234, 10);
        time.set_producer_interval_ms(100);

        let mut next = u32::MAX;
        for _ in 0..100 {
            time.process(1000, &mut next);
        }
        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ident, 0x100);
        assert_eq!(sent[0].dlc, 6);
        let ms = u32::from_le_bytes([sent[0].data[0], sent[0].data[1], sent[0].data[2], sent[0].data[3]]);
        assert!(ms >= 1234);
        assert_eq!(u16::from_le_bytes([sent[0].data[4], sent[0].data[5]]), 10);
    }
}

// crates/canopen-rs/src/heartbeat.rs

use crate::bus::FrameListener;
use crate::emcy::{Emcy, errors};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CanFrame, COB_HEARTBEAT, NODE_ID_MAX};
use log::{trace, warn};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct Monitor {
    node_id: u8,
    period_us: u32,
    timer_us: u32,
    last_state: u8,
    /// At least one heartbeat seen since (re)configuration.
    active: bool,
    timed_out: bool,
}

/// Heartbeat consumer: one watchdog row per entry in OD 1016h
/// (`node_id << 16 | period_ms`).
pub struct HeartbeatConsumer {
    monitors: Vec<Monitor>,
    emcy: Arc<Mutex<Emcy>>,
}

impl HeartbeatConsumer {
    pub fn new(emcy: Arc<Mutex<Emcy>>) -> Self {
        Self {
            monitors: Vec::new(),
            emcy,
        }
    }

    pub fn configure_from_od(&mut self, od: &ObjectDictionary) {
        let rows = od
            .with_entry(0x1016, |entry| Self::rows_from_entry(entry))
            .unwrap_or_default();
        self.monitors = rows;
    }

    fn rows_from_entry(entry: &ObjectEntry) -> Vec<Monitor> {
        let mut rows = Vec::new();
        for sub in 1..=entry.sub_count() {
            let Some(var) = entry.variable(sub) else {
                continue;
            };
            if var.data.len() != 4 {
                continue;
            }
            let value = u32::from_le_bytes([var.data[0], var.data[1], var.data[2], var.data[3]]);
            let node_id = ((value >> 16) & 0xFF) as u8;
            let period_ms = (value & 0xFFFF) as u16;
            if (1..=NODE_ID_MAX).contains(&node_id) && period_ms > 0 {
                rows.push(Monitor {
                    node_id,
                    period_us: period_ms as u32 * 1000,
                    timer_us: 0,
                    last_state: 0,
                    active: false,
                    timed_out: false,
                });
            }
        }
        rows
    }

    /// Last reported NMT state and timeout flag for a monitored node.
    pub fn remote_state(&self, node_id: u8) -> Option<(u8, bool)> {
        self.monitors
            .iter()
            .find(|m| m.node_id == node_id)
            .map(|m| (m.last_state, m.timed_out))
    }

    pub fn process(&mut self, dt_us: u32, next_us: &mut u32) {
        for monitor in &mut self.monitors {
            if !monitor.active || monitor.timed_out {
                continue;
            }
            monitor.timer_us = monitor.timer_us.saturating_add(dt_us);
            if monitor.timer_us >= monitor.period_us {
                monitor.timed_out = true;
                warn!("heartbeat from node {} missing", monitor.node_id);
                self.emcy.lock().unwrap().error_report(
                    errors::EM_HEARTBEAT_CONSUMER,
                    errors::ERR_HEARTBEAT,
                    monitor.node_id as u32,
                );
            } else {
                *next_us = (*next_us).min(monitor.period_us - monitor.timer_us);
            }
        }
    }
}

impl FrameListener for HeartbeatConsumer {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr || frame.dlc < 1 || frame.ident <= COB_HEARTBEAT {
            return;
        }
        let node_id = (frame.ident - COB_HEARTBEAT) as u8;
        let state = frame.data[0] & 0x7F;
        let Some(monitor) = self.monitors.iter_mut().find(|m| m.node_id == node_id) else {
            return;
        };

        if state == 0 && monitor.active {
            // Boot-up from a node we were already tracking: it reset.
            trace!("node {} rebooted", node_id);
            self.emcy.lock().unwrap().error_report(
                errors::EM_HB_CONSUMER_REMOTE_RESET,
                errors::ERR_HEARTBEAT,
                node_id as u32,
            );
        } else if monitor.timed_out {
            self.emcy
                .lock()
                .unwrap()
                .error_reset(errors::EM_HEARTBEAT_CONSUMER, node_id as u32);
        }
        monitor.timer_us = 0;
        monitor.last_state = state;
        monitor.active = true;
        monitor.timed_out = false;
    }
}

/// OD hook for 1016h: validates consumer rows and rebuilds the monitor
/// table on every accepted write.
pub struct HeartbeatHook {
    pub consumer: Arc<Mutex<HeartbeatConsumer>>,
}

impl OdExtension for HeartbeatHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        if stream.sub_index >= 1 {
            let value = u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
            let node_id = ((value >> 16) & 0xFF) as u8;
            let period_ms = value & 0xFFFF;
            if value & 0xFF00_0000 != 0 {
                return Err(OdError::InvalidValue);
            }
            if node_id != 0 && period_ms != 0 {
                // The same node must not be monitored twice.
                for sub in 1..=entry.sub_count() {
                    if sub == stream.sub_index {
                        continue;
                    }
                    if let Some(var) = entry.variable(sub) {
                        if var.data.len() == 4 {
                            let other = u32::from_le_bytes([
                                var.data[0],
                                var.data[1],
                                var.data[2],
                                var.data[3],
                            ]);
                            if ((other >> 16) & 0xFF) as u8 == node_id && other & 0xFFFF != 0 {
                                return Err(OdError::ParIncompat);
                            }
                        }
                    }
                }
            }
        }
        let result = entry.default_write(stream, data)?;
        if result.is_complete() {
            let rows = HeartbeatConsumer::rows_from_entry(entry);
            self.consumer.lock().unwrap().monitors = rows;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusManager;
    use crate::hal::{CanInterface, CanOpenError};
    use crate::od::populate_communication_profile;
    use crate::types::NodeId;

    struct NullDriver;
    impl CanInterface for NullDriver {
        fn connect(&mut self) -> Result<(), CanOpenError> {
            Ok(())
        }
        fn send(&mut self, _frame: &CanFrame) -> Result<(), CanOpenError> {
            Ok(())
        }
    }

    fn harness(period_ms: u16, node: u8) -> (HeartbeatConsumer, Arc<Mutex<Emcy>>) {
        let bus = Arc::new(BusManager::new(Box::new(NullDriver)));
        let emcy = Arc::new(Mutex::new(Emcy::new(NodeId(1), 8, bus)));
        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId(1));
        od.set_u32(0x1016, 1, ((node as u32) << 16) | period_ms as u32)
            .unwrap();

        let mut consumer = HeartbeatConsumer::new(emcy.clone());
        consumer.configure_from_od(&od);
        (consumer, emcy)
    }

    #[test]
    fn test_timeout_after_silence() {
        let (mut consumer, emcy) = harness(500, 0x11);
        let mut next = u32::MAX;

        // Three healthy heartbeats.
        for _ in 0..3 {
            consumer.on_frame(&CanFrame::new(0x711, &[5]));
            consumer.process(100_000, &mut next, );
        }
        assert!(!emcy.lock().unwrap().is_error(errors::EM_HEARTBEAT_CONSUMER));

        // 600 ms of silence.
        consumer.process(600_000, &mut next);
        assert!(emcy.lock().unwrap().is_error(errors::EM_HEARTBEAT_CONSUMER));
        assert_eq!(consumer.remote_state(0x11), Some((5, true)));
    }

    #[test]
    fn test_bootup_after_timeout_reports_remote_reset() {
        let (mut consumer, emcy) = harness(500, 0x11);
        let mut next = u32::MAX;
        consumer.on_frame(&CanFrame::new(0x711, &[5]));
        consumer.process(600_000, &mut next);

        consumer.on_frame(&CanFrame::new(0x711, &[0]));
        assert!(emcy.lock().unwrap().is_error(errors::EM_HB_CONSUMER_REMOTE_RESET));
        assert_eq!(consumer.remote_state(0x11), Some((0, false)));
    }

    #[test]
    fn test_monitor_inactive_until_first_heartbeat() {
        let (mut consumer, emcy) = harness(100, 0x11);
        let mut next = u32::MAX;
        consumer.process(10_000_000, &mut next);
        assert!(!emcy.lock().unwrap().is_error(errors::EM_HEARTBEAT_CONSUMER));
    }

    #[test]
    fn test_unmonitored_node_ignored() {
        let (mut consumer, _emcy) = harness(100, 0x11);
        consumer.on_frame(&CanFrame::new(0x722, &[5]));
        assert_eq!(consumer.remote_state(0x22), None);
    }
}

// crates/canopen-rs/tests/simulator/mod.rs
//
// A virtual CAN wire for deterministic protocol tests: every frame a port
// sends is recorded and delivered to the bus managers of all other
// stations on the next `deliver` call.

// Each test binary compiles its own copy; not every helper is used in all
// of them.
#![allow(dead_code)]

use canopen_rs::hal::{CanInterface, CanOpenError};
use canopen_rs::{BusManager, CanFrame};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct WireInner {
    queue: VecDeque<(usize, CanFrame)>,
    taps: Vec<(usize, Arc<BusManager>)>,
    history: Vec<CanFrame>,
    next_port: usize,
}

pub struct VirtualWire {
    inner: Mutex<WireInner>,
}

impl VirtualWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(WireInner::default()),
        })
    }

    /// Creates a new station port. Register the station's bus manager with
    /// [`VirtualWire::register`] under the returned port's id to receive
    /// traffic.
    pub fn port(self: &Arc<Self>) -> VirtualPort {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_port;
        inner.next_port += 1;
        VirtualPort {
            wire: self.clone(),
            id,
        }
    }

    pub fn register(&self, port_id: usize, bus: Arc<BusManager>) {
        self.inner.lock().unwrap().taps.push((port_id, bus));
    }

    /// Drains the wire: each queued frame reaches every station except its
    /// sender, in transmission order.
    pub fn deliver(&self) {
        loop {
            let (frame, sender, taps) = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some((sender, frame)) => (frame, sender, inner.taps.clone()),
                    None => return,
                }
            };
            for (port_id, bus) in taps {
                if port_id != sender {
                    bus.handle(&frame);
                }
            }
        }
    }

    /// Everything transmitted since the last `clear_history`.
    pub fn history(&self) -> Vec<CanFrame> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn history_for(&self, ident: u16) -> Vec<CanFrame> {
        self.history()
            .into_iter()
            .filter(|f| f.ident == ident)
            .collect()
    }

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }
}

pub struct VirtualPort {
    wire: Arc<VirtualWire>,
    id: usize,
}

impl VirtualPort {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl CanInterface for VirtualPort {
    fn connect(&mut self) -> Result<(), CanOpenError> {
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
        let mut inner = self.wire.inner.lock().unwrap();
        inner.history.push(*frame);
        inner.queue.push_back((self.id, *frame));
        Ok(())
    }
}

/// Builds a bus manager attached to the wire and returns it with its port
/// id already registered for reception.
pub fn station(wire: &Arc<VirtualWire>) -> Arc<BusManager> {
    let port = wire.port();
    let id = port.id();
    let bus = Arc::new(BusManager::new(Box::new(port)));
    wire.register(id, bus.clone());
    bus
}

#![cfg(target_os = "linux")]

//! SocketCAN implementation of the canopen-rs transport HAL, plus a receive
//! pump that feeds inbound frames into a [`BusManager`].

use canopen_rs::hal::{CanInterface, CanOpenError};
use canopen_rs::{BusManager, CanFrame};
use log::{error, trace, warn};
use socketcan::{CanFrame as LinuxCanFrame, CanSocket, EmbeddedFrame, Frame, Id, Socket, StandardId};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// CAN driver backed by a SocketCAN network interface (e.g. `can0`,
/// `vcan0`). Only classical frames with 11-bit identifiers are exchanged;
/// anything else on the wire is skipped.
pub struct SocketCanInterface {
    interface: String,
    socket: Option<CanSocket>,
}

impl SocketCanInterface {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            socket: None,
        }
    }
}

impl CanInterface for SocketCanInterface {
    fn connect(&mut self) -> Result<(), CanOpenError> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            error!("opening {} failed: {}", self.interface, e);
            CanOpenError::Syscall
        })?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
        let socket = self.socket.as_ref().ok_or(CanOpenError::InvalidState)?;
        let id = StandardId::new(frame.ident).ok_or(CanOpenError::IllegalArgument)?;
        let linux_frame = if frame.rtr {
            LinuxCanFrame::new_remote(id, frame.dlc as usize)
        } else {
            LinuxCanFrame::new(id, frame.payload())
        }
        .ok_or(CanOpenError::MessageLength)?;

        socket.write_frame(&linux_frame).map_err(|e| {
            warn!("CAN write on {} failed: {}", self.interface, e);
            CanOpenError::TxOverflow
        })
    }
}

/// Converts an inbound SocketCAN frame. Extended identifiers, FD frames and
/// error frames are not part of CANopen classic and yield `None`.
fn convert(frame: &LinuxCanFrame) -> Option<CanFrame> {
    let ident = match frame.id() {
        Id::Standard(id) => id.as_raw(),
        Id::Extended(_) => {
            trace!("skipping frame with 29-bit identifier");
            return None;
        }
    };
    let mut result = CanFrame::new(ident, frame.data());
    if frame.is_remote_frame() {
        result.rtr = true;
        result.dlc = frame.dlc() as u8;
    }
    Some(result)
}

/// Background receive pump: reads frames from its own socket on the same
/// interface and hands them to the bus manager. Dropped handles stop the
/// thread.
pub struct RxPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RxPump {
    /// Opens a receive socket on `interface` and starts pumping frames into
    /// `bus`.
    pub fn start(interface: &str, bus: Arc<BusManager>) -> std::io::Result<RxPump> {
        let socket = CanSocket::open(interface)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match socket.read_frame_timeout(Duration::from_millis(100)) {
                    Ok(frame) => {
                        if let Some(frame) = convert(&frame) {
                            bus.handle(&frame);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!("CAN read failed: {}", e);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });

        Ok(RxPump {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RxPump {
    fn drop(&mut self) {
        self.stop();
    }
}

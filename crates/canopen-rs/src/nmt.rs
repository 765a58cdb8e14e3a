// crates/canopen-rs/src/nmt.rs

use crate::bus::{BusManager, FrameListener};
use crate::emcy::{Emcy, errors};
use crate::hal::CanOpenError;
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CanFrame, COB_HEARTBEAT, COB_NMT, NodeId};
use log::{info, trace};
use std::sync::{Arc, Mutex};

/// NMT states of a CANopen device, with the numeric values used on the wire
/// by the heartbeat protocol. (CiA 301, Section 7.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    Initializing = 0,
    Stopped = 4,
    Operational = 5,
    PreOperational = 127,
}

/// NMT command specifiers carried in byte 0 of a command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    EnterOperational = 1,
    EnterStopped = 2,
    EnterPreOperational = 128,
    ResetNode = 129,
    ResetCommunication = 130,
}

impl TryFrom<u8> for NmtCommand {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(NmtCommand::EnterOperational),
            2 => Ok(NmtCommand::EnterStopped),
            128 => Ok(NmtCommand::EnterPreOperational),
            129 => Ok(NmtCommand::ResetNode),
            130 => Ok(NmtCommand::ResetCommunication),
            other => Err(other),
        }
    }
}

/// Behaviour flags of the local NMT state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NmtControl(pub u16);

impl NmtControl {
    /// Enter Operational automatically after boot-up instead of waiting for
    /// a master command.
    pub const STARTUP_TO_OPERATIONAL: NmtControl = NmtControl(0x0001);
    /// Leave Operational for Stopped while the error register is non-zero.
    pub const ERR_TO_STOPPED: NmtControl = NmtControl(0x0002);

    pub fn contains(self, other: NmtControl) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for NmtControl {
    type Output = NmtControl;
    fn bitor(self, rhs: NmtControl) -> NmtControl {
        NmtControl(self.0 | rhs.0)
    }
}

/// What the caller of `process` must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRequest {
    None,
    /// Reinitialize the communication services (NMT reset-communication).
    Communication,
    /// Reinitialize the whole application (NMT reset-node).
    Application,
    /// Shut the node down.
    Quit,
}

/// Local NMT state machine, heartbeat producer and command consumer.
pub struct Nmt {
    node_id: NodeId,
    state: NmtState,
    previous: NmtState,
    control: NmtControl,
    pending: Option<NmtCommand>,
    invalid_command: Option<u8>,
    hb_period_us: u32,
    hb_timer_us: u32,
    bootup_pending: bool,
}

impl Nmt {
    pub fn new(node_id: NodeId, control: NmtControl) -> Self {
        Self {
            node_id,
            state: NmtState::Initializing,
            previous: NmtState::Initializing,
            control,
            pending: None,
            invalid_command: None,
            hb_period_us: 0,
            hb_timer_us: 0,
            bootup_pending: true,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn previous_state(&self) -> NmtState {
        self.previous
    }

    /// Reads the heartbeat producer period from OD 1017h.
    pub fn configure_from_od(&mut self, od: &ObjectDictionary) {
        if let Ok(period_ms) = od.u16(0x1017, 0) {
            self.hb_period_us = period_ms as u32 * 1000;
        }
        self.hb_timer_us = 0;
    }

    /// Restarts the state machine after a communication reset: boot-up
    /// heartbeat, then Pre-operational or Operational per the control flags.
    pub fn reset_communication(&mut self) {
        self.state = NmtState::Initializing;
        self.pending = None;
        self.bootup_pending = true;
        self.hb_timer_us = 0;
    }

    /// Queues a command targeted at this node, as the inbound listener does.
    pub fn request(&mut self, command: NmtCommand) {
        self.pending = Some(command);
    }

    /// Puts a master command on the wire at identifier 0. A `target` of zero
    /// addresses every node.
    pub fn send_command(
        bus: &BusManager,
        command: NmtCommand,
        target: u8,
    ) -> Result<(), CanOpenError> {
        bus.send(&CanFrame::new(COB_NMT, &[command as u8, target]))
    }

    /// Applies pending commands, produces the heartbeat, and reports what
    /// reset the caller has to carry out.
    pub fn process(
        &mut self,
        dt_us: u32,
        next_us: &mut u32,
        bus: &BusManager,
        emcy: &Mutex<Emcy>,
        error_register: u8,
    ) -> ResetRequest {
        if let Some(raw) = self.invalid_command.take() {
            emcy.lock().unwrap().error_report(
                errors::EM_NMT_WRONG_COMMAND,
                errors::ERR_PROTOCOL,
                raw as u32,
            );
        }

        if self.bootup_pending {
            self.bootup_pending = false;
            // Boot-up heartbeat carries state 0 regardless of the period.
            let _ = bus.send(&CanFrame::new(
                COB_HEARTBEAT + self.node_id.0 as u16,
                &[NmtState::Initializing as u8],
            ));
            self.enter(NmtState::PreOperational);
            if self.control.contains(NmtControl::STARTUP_TO_OPERATIONAL) {
                self.enter(NmtState::Operational);
            }
        }

        let mut reset = ResetRequest::None;
        if let Some(command) = self.pending.take() {
            match command {
                NmtCommand::EnterOperational => self.enter(NmtState::Operational),
                NmtCommand::EnterStopped => self.enter(NmtState::Stopped),
                NmtCommand::EnterPreOperational => self.enter(NmtState::PreOperational),
                NmtCommand::ResetNode => reset = ResetRequest::Application,
                NmtCommand::ResetCommunication => reset = ResetRequest::Communication,
            }
        }

        if self.state == NmtState::Operational
            && error_register != 0
            && self.control.contains(NmtControl::ERR_TO_STOPPED)
        {
            self.enter(NmtState::Stopped);
        }

        if self.hb_period_us > 0 {
            self.hb_timer_us = self.hb_timer_us.saturating_add(dt_us);
            if self.hb_timer_us >= self.hb_period_us {
                self.hb_timer_us = 0;
                let _ = bus.send(&CanFrame::new(
                    COB_HEARTBEAT + self.node_id.0 as u16,
                    &[self.state as u8],
                ));
            }
            *next_us = (*next_us).min(self.hb_period_us - self.hb_timer_us);
        }

        reset
    }

    fn enter(&mut self, state: NmtState) {
        if state != self.state {
            info!("NMT state change: {:?} -> {:?}", self.state, state);
            self.previous = self.state;
            self.state = state;
        }
    }
}

impl FrameListener for Nmt {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.dlc < 2 {
            return;
        }
        let target = frame.data[1];
        if target != 0 && target != self.node_id.0 {
            return;
        }
        match NmtCommand::try_from(frame.data[0]) {
            Ok(command) => {
                trace!("NMT command {:?} for node {}", command, target);
                self.pending = Some(command);
            }
            Err(raw) => self.invalid_command = Some(raw),
        }
    }
}

/// OD hook for 1017h: writes re-arm the heartbeat producer immediately.
pub struct NmtHook {
    pub nmt: Arc<Mutex<Nmt>>,
}

impl OdExtension for NmtHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let result = entry.default_write(stream, data)?;
        if result.is_complete() && stream.index == 0x1017 {
            let period_ms = entry
                .variable(0)
                .map(|v| u16::from_le_bytes([v.data[0], v.data[1]]))
                .unwrap_or(0);
            let mut nmt = self.nmt.lock().unwrap();
            nmt.hb_period_us = period_ms as u32 * 1000;
            // Fire on the next tick so the new period is observable at once.
            nmt.hb_timer_us = nmt.hb_period_us;
        }
        Ok(result)
    }
}

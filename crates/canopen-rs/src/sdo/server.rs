// crates/canopen-rs/src/sdo/server.rs

use super::crc::crc16_block;
use super::{
    ABORT_BLOCK_SIZE, ABORT_COMMAND, ABORT_CRC, ABORT_DATA_LONG, ABORT_DATA_SHORT,
    ABORT_SEQUENCE, ABORT_TIMEOUT, ABORT_TOGGLE, BLOCK_SIZE_MAX, SDO_TIMEOUT_US,
};
use crate::bus::{BusManager, FrameListener};
use crate::od::{Attribute, ObjectDictionary, Origin};
use crate::types::{CanFrame, COB_SDO_RX, COB_SDO_TX, NodeId};
use log::{trace, warn};
use std::collections::VecDeque;

/// The state of the server side of one SDO channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ServerState {
    #[default]
    Idle,
    DownloadSegment,
    UploadSegment,
    BlockDownload,
    BlockDownloadEnd,
    BlockUploadStart,
    BlockUploadAck,
    BlockUploadEnd,
}

/// SDO server: answers requests on `0x600 + node_id`, replies on
/// `0x580 + node_id`, supporting expedited, segmented and block transfers.
///
/// Inbound frames are deposited by the bus listener and consumed by the
/// periodic `process` call; during a block download the listener queues
/// segments directly so bursts between two ticks are not lost.
pub struct SdoServer {
    cob_rx: u16,
    cob_tx: u16,
    state: ServerState,
    index: u16,
    sub_index: u8,
    toggle: bool,
    /// Upload: the whole value read from the OD. Download: accumulated bytes.
    buf: Vec<u8>,
    buf_offset: usize,
    size_indicated: u32,
    timer_us: u32,
    timeout_us: u32,
    blksize: u8,
    /// Last in-order sequence number seen (download) or base offset of the
    /// running sub-block (upload).
    seq_ack: u8,
    sub_block_base: usize,
    crc_enabled: bool,
    block_last: bool,
    rx: Option<CanFrame>,
    block_rx: VecDeque<CanFrame>,
}

impl SdoServer {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            cob_rx: COB_SDO_RX + node_id.0 as u16,
            cob_tx: COB_SDO_TX + node_id.0 as u16,
            state: ServerState::Idle,
            index: 0,
            sub_index: 0,
            toggle: false,
            buf: Vec::new(),
            buf_offset: 0,
            size_indicated: 0,
            timer_us: 0,
            timeout_us: SDO_TIMEOUT_US,
            blksize: BLOCK_SIZE_MAX,
            seq_ack: 0,
            sub_block_base: 0,
            crc_enabled: false,
            block_last: false,
            rx: None,
            block_rx: VecDeque::new(),
        }
    }

    /// Identifier the server listens on (client-to-server).
    pub fn request_ident(&self) -> u16 {
        self.cob_rx
    }

    pub fn set_timeout_us(&mut self, timeout_us: u32) {
        self.timeout_us = timeout_us;
    }

    /// Drops any in-flight transfer and restores the default identifiers,
    /// as required after an NMT communication reset.
    pub fn reset(&mut self, node_id: NodeId) {
        *self = Self::new(node_id);
    }

    /// Advances timers and consumes deposited frames. `active` is false in
    /// the NMT Stopped state, where SDO traffic is ignored.
    pub fn process(
        &mut self,
        dt_us: u32,
        next_us: &mut u32,
        od: &ObjectDictionary,
        bus: &BusManager,
        active: bool,
    ) {
        if !active {
            self.rx = None;
            self.block_rx.clear();
            if self.state != ServerState::Idle {
                self.state = ServerState::Idle;
            }
            return;
        }

        if let Some(frame) = self.rx.take() {
            self.timer_us = 0;
            self.handle_frame(&frame, od, bus);
        }
        while let Some(frame) = self.block_rx.pop_front() {
            self.timer_us = 0;
            self.handle_block_segment(&frame, bus);
        }

        if self.state != ServerState::Idle {
            self.timer_us = self.timer_us.saturating_add(dt_us);
            if self.timer_us >= self.timeout_us {
                warn!(
                    "SDO server transfer {:#06X}:{} timed out",
                    self.index, self.sub_index
                );
                self.send_abort(bus, ABORT_TIMEOUT);
            } else {
                *next_us = (*next_us).min(self.timeout_us - self.timer_us);
            }
        }
    }

    fn handle_frame(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        if frame.dlc < 8 {
            return;
        }
        let b0 = frame.data[0];
        let ccs = b0 >> 5;

        // An abort from the client ends the transfer silently.
        if ccs == 4 {
            trace!("SDO server: abort received, returning to idle");
            self.state = ServerState::Idle;
            return;
        }

        // A new initiation replaces whatever transfer was running.
        match ccs {
            1 => self.initiate_download(frame, od, bus),
            2 => self.initiate_upload(frame, od, bus),
            6 if b0 & 0x01 == 0 => self.initiate_block_download(frame, od, bus),
            6 => self.block_download_end(frame, od, bus),
            5 if b0 & 0x03 == 0 => self.initiate_block_upload(frame, od, bus),
            5 => self.handle_block_upload_command(frame, bus),
            0 => self.download_segment(frame, od, bus),
            3 => self.upload_segment(frame, bus),
            _ => self.send_abort(bus, ABORT_COMMAND),
        }
    }

    // --- Expedited / segmented download ---

    fn initiate_download(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        self.begin(frame);
        let b0 = frame.data[0];
        let expedited = b0 & 0x02 != 0;
        let size_set = b0 & 0x01 != 0;

        let stream = match od.stream(self.index, self.sub_index, Origin::External) {
            Ok(s) => s,
            Err(e) => return self.send_abort(bus, e.abort_code()),
        };
        if !stream.attribute.contains(Attribute::SDO_W) {
            return self.send_abort(bus, crate::od::OdError::ReadOnly.abort_code());
        }

        if expedited {
            let len = if size_set {
                4 - ((b0 >> 2) & 0x03) as usize
            } else {
                stream.data_len.min(4)
            };
            match od.write_value(self.index, self.sub_index, Origin::External, &frame.data[4..4 + len]) {
                Ok(()) => self.respond_download_ack(bus),
                Err(e) => self.send_abort(bus, e.abort_code()),
            }
            return;
        }

        self.size_indicated = if size_set {
            u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
        } else {
            0
        };
        self.buf.clear();
        self.toggle = false;
        self.state = ServerState::DownloadSegment;
        self.respond_download_ack(bus);
    }

    fn download_segment(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        if self.state != ServerState::DownloadSegment {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        let b0 = frame.data[0];
        let toggle = b0 & 0x10 != 0;
        if toggle != self.toggle {
            return self.send_abort(bus, ABORT_TOGGLE);
        }
        let unused = ((b0 >> 1) & 0x07) as usize;
        let last = b0 & 0x01 != 0;
        self.buf.extend_from_slice(&frame.data[1..8 - unused]);

        if self.size_indicated != 0 && self.buf.len() as u32 > self.size_indicated {
            return self.send_abort(bus, ABORT_DATA_LONG);
        }

        let reply = CanFrame::new(self.cob_tx, &[0x20 | ((toggle as u8) << 4), 0, 0, 0, 0, 0, 0, 0]);
        self.toggle = !self.toggle;

        if last {
            if self.size_indicated != 0 && (self.buf.len() as u32) < self.size_indicated {
                return self.send_abort(bus, ABORT_DATA_SHORT);
            }
            let data = core::mem::take(&mut self.buf);
            match od.write_value(self.index, self.sub_index, Origin::External, &data) {
                Ok(()) => {
                    self.state = ServerState::Idle;
                    let _ = bus.send(&reply);
                }
                Err(e) => self.send_abort(bus, e.abort_code()),
            }
        } else {
            let _ = bus.send(&reply);
        }
    }

    fn respond_download_ack(&mut self, bus: &BusManager) {
        let frame = CanFrame::new(
            self.cob_tx,
            &[
                0x60,
                (self.index & 0xFF) as u8,
                (self.index >> 8) as u8,
                self.sub_index,
                0,
                0,
                0,
                0,
            ],
        );
        let _ = bus.send(&frame);
    }

    // --- Expedited / segmented upload ---

    fn initiate_upload(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        self.begin(frame);
        match od.read_value(self.index, self.sub_index, Origin::External) {
            Ok(value) => self.respond_upload_init(value, bus),
            Err(e) => self.send_abort(bus, e.abort_code()),
        }
    }

    fn respond_upload_init(&mut self, value: Vec<u8>, bus: &BusManager) {
        let idx_lo = (self.index & 0xFF) as u8;
        let idx_hi = (self.index >> 8) as u8;
        if value.len() <= 4 {
            let n = (4 - value.len()) as u8;
            let mut data = [0x43 | (n << 2), idx_lo, idx_hi, self.sub_index, 0, 0, 0, 0];
            data[4..4 + value.len()].copy_from_slice(&value);
            self.state = ServerState::Idle;
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
        } else {
            let size = (value.len() as u32).to_le_bytes();
            let data = [0x41, idx_lo, idx_hi, self.sub_index, size[0], size[1], size[2], size[3]];
            self.buf = value;
            self.buf_offset = 0;
            self.toggle = false;
            self.state = ServerState::UploadSegment;
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
        }
    }

    fn upload_segment(&mut self, frame: &CanFrame, bus: &BusManager) {
        if self.state != ServerState::UploadSegment {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        let toggle = frame.data[0] & 0x10 != 0;
        if toggle != self.toggle {
            return self.send_abort(bus, ABORT_TOGGLE);
        }
        let remaining = self.buf.len() - self.buf_offset;
        let count = remaining.min(7);
        let last = count == remaining;
        let unused = (7 - count) as u8;
        let mut data = [0u8; 8];
        data[0] = ((toggle as u8) << 4) | (unused << 1) | last as u8;
        data[1..1 + count].copy_from_slice(&self.buf[self.buf_offset..self.buf_offset + count]);
        self.buf_offset += count;
        self.toggle = !self.toggle;
        if last {
            self.state = ServerState::Idle;
        }
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    // --- Block download ---

    fn initiate_block_download(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        self.begin(frame);
        let b0 = frame.data[0];
        self.crc_enabled = b0 & 0x04 != 0;
        self.size_indicated = if b0 & 0x02 != 0 {
            u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
        } else {
            0
        };

        let stream = match od.stream(self.index, self.sub_index, Origin::External) {
            Ok(s) => s,
            Err(e) => return self.send_abort(bus, e.abort_code()),
        };
        if !stream.attribute.contains(Attribute::SDO_W) {
            return self.send_abort(bus, crate::od::OdError::ReadOnly.abort_code());
        }

        self.buf.clear();
        self.blksize = BLOCK_SIZE_MAX;
        self.seq_ack = 0;
        self.block_last = false;
        self.state = ServerState::BlockDownload;

        let sc = (self.crc_enabled as u8) << 2;
        let data = [
            0xA0 | sc,
            (self.index & 0xFF) as u8,
            (self.index >> 8) as u8,
            self.sub_index,
            self.blksize,
            0,
            0,
            0,
        ];
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    fn handle_block_segment(&mut self, frame: &CanFrame, bus: &BusManager) {
        if self.state != ServerState::BlockDownload {
            return;
        }
        let b0 = frame.data[0];
        if b0 == 0x80 {
            // Client abort arriving inside the segment stream.
            self.state = ServerState::Idle;
            self.block_rx.clear();
            return;
        }
        let seq = b0 & 0x7F;
        let last = b0 & 0x80 != 0;
        if seq == 0 || seq > self.blksize {
            self.block_rx.clear();
            return self.send_abort(bus, ABORT_SEQUENCE);
        }
        if seq == self.seq_ack + 1 {
            self.buf.extend_from_slice(&frame.data[1..8]);
            self.seq_ack = seq;
            if last {
                self.block_last = true;
            }
        }
        // Out-of-order segments are dropped; the confirmation below makes the
        // client retransmit from the last acknowledged sequence number.

        if seq == self.blksize || last {
            let data = [0xA2, self.seq_ack, self.blksize, 0, 0, 0, 0, 0];
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
            self.seq_ack = 0;
            if self.block_last {
                self.state = ServerState::BlockDownloadEnd;
                self.block_rx.clear();
            }
        }
    }

    fn block_download_end(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        if self.state != ServerState::BlockDownloadEnd {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        let unused = ((frame.data[0] >> 2) & 0x07) as usize;
        self.buf.truncate(self.buf.len().saturating_sub(unused));

        if self.size_indicated != 0 {
            if (self.buf.len() as u32) > self.size_indicated {
                return self.send_abort(bus, ABORT_DATA_LONG);
            }
            if (self.buf.len() as u32) < self.size_indicated {
                return self.send_abort(bus, ABORT_DATA_SHORT);
            }
        }
        if self.crc_enabled {
            let received = u16::from_le_bytes([frame.data[1], frame.data[2]]);
            if received != !crc16_block(&self.buf) {
                return self.send_abort(bus, ABORT_CRC);
            }
        }
        let data = core::mem::take(&mut self.buf);
        match od.write_value(self.index, self.sub_index, Origin::External, &data) {
            Ok(()) => {
                self.state = ServerState::Idle;
                let _ = bus.send(&CanFrame::new(self.cob_tx, &[0xA1, 0, 0, 0, 0, 0, 0, 0]));
            }
            Err(e) => self.send_abort(bus, e.abort_code()),
        }
    }

    // --- Block upload ---

    fn handle_block_upload_command(&mut self, frame: &CanFrame, bus: &BusManager) {
        match frame.data[0] & 0x03 {
            3 => self.block_upload_start(bus),
            2 => self.block_upload_ack(frame, bus),
            1 => self.block_upload_finish(bus),
            _ => self.send_abort(bus, ABORT_COMMAND),
        }
    }

    fn initiate_block_upload(&mut self, frame: &CanFrame, od: &ObjectDictionary, bus: &BusManager) {
        self.begin(frame);
        self.crc_enabled = frame.data[0] & 0x04 != 0;
        let blksize = frame.data[4];
        let pst = frame.data[5];

        let value = match od.read_value(self.index, self.sub_index, Origin::External) {
            Ok(v) => v,
            Err(e) => return self.send_abort(bus, e.abort_code()),
        };

        // Protocol switch threshold: small values fall back to the plain
        // upload protocol.
        if pst != 0 && value.len() <= pst as usize {
            return self.respond_upload_init(value, bus);
        }
        if blksize == 0 || blksize > BLOCK_SIZE_MAX {
            return self.send_abort(bus, ABORT_BLOCK_SIZE);
        }

        self.blksize = blksize;
        self.buf = value;
        self.buf_offset = 0;
        self.sub_block_base = 0;
        self.state = ServerState::BlockUploadStart;

        let size = (self.buf.len() as u32).to_le_bytes();
        let sc = (self.crc_enabled as u8) << 2;
        let data = [
            0xC0 | sc | 0x02,
            (self.index & 0xFF) as u8,
            (self.index >> 8) as u8,
            self.sub_index,
            size[0],
            size[1],
            size[2],
            size[3],
        ];
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    fn block_upload_start(&mut self, bus: &BusManager) {
        if self.state != ServerState::BlockUploadStart {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        self.send_sub_block(bus);
    }

    fn block_upload_ack(&mut self, frame: &CanFrame, bus: &BusManager) {
        if self.state != ServerState::BlockUploadAck {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        let ackseq = frame.data[1] as usize;
        let new_blksize = frame.data[2];
        if new_blksize == 0 || new_blksize > BLOCK_SIZE_MAX {
            return self.send_abort(bus, ABORT_BLOCK_SIZE);
        }
        self.buf_offset = (self.sub_block_base + ackseq * 7).min(self.buf.len());
        self.blksize = new_blksize;

        if self.buf_offset >= self.buf.len() {
            let unused = ((7 - self.buf.len() % 7) % 7) as u8;
            let crc = if self.crc_enabled {
                !crc16_block(&self.buf)
            } else {
                0
            };
            let data = [
                0xC1 | (unused << 2),
                (crc & 0xFF) as u8,
                (crc >> 8) as u8,
                0,
                0,
                0,
                0,
                0,
            ];
            self.state = ServerState::BlockUploadEnd;
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
        } else {
            self.send_sub_block(bus);
        }
    }

    fn send_sub_block(&mut self, bus: &BusManager) {
        self.sub_block_base = self.buf_offset;
        let mut offset = self.buf_offset;
        for seq in 1..=self.blksize {
            let remaining = self.buf.len() - offset;
            let count = remaining.min(7);
            let last = count == remaining;
            let mut data = [0u8; 8];
            data[0] = seq | ((last as u8) << 7);
            data[1..1 + count].copy_from_slice(&self.buf[offset..offset + count]);
            offset += count;
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
            if last {
                break;
            }
        }
        self.state = ServerState::BlockUploadAck;
    }

    fn block_upload_finish(&mut self, bus: &BusManager) {
        if self.state != ServerState::BlockUploadEnd {
            return self.send_abort(bus, ABORT_COMMAND);
        }
        self.state = ServerState::Idle;
        self.buf.clear();
    }

    // --- Helpers ---

    fn begin(&mut self, frame: &CanFrame) {
        // A new initiation replaces whatever transfer was running.
        self.state = ServerState::Idle;
        self.index = u16::from_le_bytes([frame.data[1], frame.data[2]]);
        self.sub_index = frame.data[3];
        self.timer_us = 0;
        self.block_rx.clear();
    }

    fn send_abort(&mut self, bus: &BusManager, code: u32) {
        let code_bytes = code.to_le_bytes();
        let data = [
            0x80,
            (self.index & 0xFF) as u8,
            (self.index >> 8) as u8,
            self.sub_index,
            code_bytes[0],
            code_bytes[1],
            code_bytes[2],
            code_bytes[3],
        ];
        self.state = ServerState::Idle;
        self.block_rx.clear();
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }
}

impl FrameListener for SdoServer {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr {
            return;
        }
        if self.state == ServerState::BlockDownload {
            // Segments arrive back to back; queue them so none is lost
            // between two process ticks.
            if self.block_rx.len() <= BLOCK_SIZE_MAX as usize + 2 {
                self.block_rx.push_back(*frame);
            }
        } else {
            self.rx = Some(*frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{CanInterface, CanOpenError};
    use crate::od::{Object, ObjectEntry, Variable};
    use std::sync::{Arc, Mutex};

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

    fn harness() -> (SdoServer, ObjectDictionary, BusManager, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = BusManager::new(Box::new(CaptureDriver { frames: frames.clone() }));
        let mut od = ObjectDictionary::new();
        od.insert(
            0x2000,
            ObjectEntry::new(
                "Value_I16",
                Object::Variable(Variable::new(
                    crate::od::DataType::Integer16,
                    Attribute::SDO_RW | Attribute::MULTI_BYTE,
                    0x1234_i16.to_le_bytes().to_vec(),
                )),
            ),
        );
        od.insert(
            0x2001,
            ObjectEntry::new(
                "Name_VS",
                Object::Variable(Variable::visible_string(Attribute::SDO_RW, "hello canopen")),
            ),
        );
        (SdoServer::new(NodeId(0x10)), od, bus, frames)
    }

    fn step(server: &mut SdoServer, od: &ObjectDictionary, bus: &BusManager, frame: CanFrame) {
        server.on_frame(&frame);
        let mut next = u32::MAX;
        server.process(1000, &mut next, od, bus, true);
    }

    #[test]
    fn test_expedited_upload_frame_flow() {
        let (mut server, od, bus, frames) = harness();
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x40, 0x00, 0x20, 0x00, 0, 0, 0, 0]));

        let sent = frames.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ident, 0x590);
        assert_eq!(sent[0].data, [0x4B, 0x00, 0x20, 0x00, 0x34, 0x12, 0, 0]);
    }

    #[test]
    fn test_expedited_download_writes_od() {
        let (mut server, od, bus, frames) = harness();
        // Write 0xBEEF into 0x2000:0 (2 bytes, n = 2).
        step(
            &mut server,
            &od,
            &bus,
            CanFrame::new(0x610, &[0x2B, 0x00, 0x20, 0x00, 0xEF, 0xBE, 0, 0]),
        );

        assert_eq!(od.u16(0x2000, 0).unwrap(), 0xBEEF);
        assert_eq!(frames.lock().unwrap()[0].data[0], 0x60);
    }

    #[test]
    fn test_segmented_upload_with_toggle() {
        let (mut server, od, bus, frames) = harness();
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x40, 0x01, 0x20, 0x00, 0, 0, 0, 0]));
        {
            let sent = frames.lock().unwrap();
            assert_eq!(sent[0].data[0], 0x41);
            assert_eq!(
                u32::from_le_bytes([sent[0].data[4], sent[0].data[5], sent[0].data[6], sent[0].data[7]]),
                13
            );
        }

        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x60, 0, 0, 0, 0, 0, 0, 0]));
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x70, 0, 0, 0, 0, 0, 0, 0]));

        let sent = frames.lock().unwrap();
        assert_eq!(&sent[1].data[1..8], b"hello c");
        assert_eq!(sent[1].data[0] & 0x11, 0x00);
        // Second segment: toggle set, 6 payload bytes, last flag.
        assert_eq!(sent[2].data[0] & 0x10, 0x10);
        assert_eq!(sent[2].data[0] & 0x01, 0x01);
        assert_eq!(&sent[2].data[1..7], b"anopen");
    }

    #[test]
    fn test_segmented_download_toggle_violation_aborts() {
        let (mut server, od, bus, frames) = harness();
        step(
            &mut server,
            &od,
            &bus,
            CanFrame::new(0x610, &[0x21, 0x01, 0x20, 0x00, 13, 0, 0, 0]),
        );
        // First segment must carry toggle 0; send toggle 1 instead.
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x10, 0, 0, 0, 0, 0, 0, 0]));

        let sent = frames.lock().unwrap();
        assert_eq!(sent[1].data[0], 0x80);
        let code = u32::from_le_bytes([sent[1].data[4], sent[1].data[5], sent[1].data[6], sent[1].data[7]]);
        assert_eq!(code, ABORT_TOGGLE);
    }

    #[test]
    fn test_unknown_index_aborts() {
        let (mut server, od, bus, frames) = harness();
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x40, 0xFF, 0x7F, 0x00, 0, 0, 0, 0]));
        let sent = frames.lock().unwrap();
        assert_eq!(sent[0].data[0], 0x80);
        let code = u32::from_le_bytes([sent[0].data[4], sent[0].data[5], sent[0].data[6], sent[0].data[7]]);
        assert_eq!(code, 0x0602_0000);
    }

    #[test]
    fn test_invalid_command_in_idle_aborts() {
        let (mut server, od, bus, frames) = harness();
        // Upload-segment request without a transfer running.
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x60, 0, 0, 0, 0, 0, 0, 0]));
        let sent = frames.lock().unwrap();
        assert_eq!(sent[0].data[0], 0x80);
        let code = u32::from_le_bytes([sent[0].data[4], sent[0].data[5], sent[0].data[6], sent[0].data[7]]);
        assert_eq!(code, ABORT_COMMAND);
    }

    #[test]
    fn test_transfer_timeout_aborts() {
        let (mut server, od, bus, frames) = harness();
        step(
            &mut server,
            &od,
            &bus,
            CanFrame::new(0x610, &[0x21, 0x01, 0x20, 0x00, 13, 0, 0, 0]),
        );
        let mut next = u32::MAX;
        server.process(SDO_TIMEOUT_US, &mut next, &od, &bus, true);

        let sent = frames.lock().unwrap();
        let abort = sent.last().unwrap();
        assert_eq!(abort.data[0], 0x80);
        let code = u32::from_le_bytes([abort.data[4], abort.data[5], abort.data[6], abort.data[7]]);
        assert_eq!(code, ABORT_TIMEOUT);
    }

    #[test]
    fn test_oversized_segmented_download_aborts_data_long() {
        let (mut server, od, bus, frames) = harness();
        // Announce 4 bytes for a 2-byte entry, then pour in segments.
        step(
            &mut server,
            &od,
            &bus,
            CanFrame::new(0x610, &[0x21, 0x00, 0x20, 0x00, 4, 0, 0, 0]),
        );
        step(&mut server, &od, &bus, CanFrame::new(0x610, &[0x07, 1, 2, 3, 4, 0, 0, 0]));

        let sent = frames.lock().unwrap();
        let abort = sent.last().unwrap();
        assert_eq!(abort.data[0], 0x80);
        let code = u32::from_le_bytes([abort.data[4], abort.data[5], abort.data[6], abort.data[7]]);
        assert_eq!(code, ABORT_DATA_LONG);
    }
}

// crates/canopen-rs/src/sdo/client.rs

use super::crc::crc16_block;
use super::{
    ABORT_BLOCK_SIZE, ABORT_CRC, ABORT_GENERAL, ABORT_SEQUENCE, ABORT_TIMEOUT, ABORT_TOGGLE,
    BLOCK_SIZE_MAX, BLOCK_THRESHOLD, SDO_TIMEOUT_US, SdoError,
};
use crate::bus::{BusManager, FrameListener, SubscriptionToken};
use crate::hal::CanOpenError;
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Stream, Transfer};
use crate::types::{CAN_ID_MASK, CanFrame, COB_SDO_RX, COB_SDO_TX};
use log::{trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Protocol-switch threshold sent in block upload initiations: values at or
/// below this size make the server fall back to the plain upload protocol.
const BLOCK_UPLOAD_PST: u8 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ClientState {
    #[default]
    Idle,
    InitDownloadRsp,
    DownloadSegmentRsp,
    InitUploadRsp,
    UploadSegmentRsp,
    BlockDownInitRsp,
    BlockDownAckRsp,
    BlockDownEndRsp,
    BlockUpInitRsp,
    BlockUpSegments,
    BlockUpEndRsp,
}

/// Progress of the client as seen by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoClientStatus {
    Idle,
    Busy,
    Done,
}

/// SDO client: runs one confirmed transfer at a time against a remote
/// server, selected with [`SdoClient::configure`]. Requests go out on
/// `0x600 + server`, responses are matched on `0x580 + server`; frames for
/// an identifier with no active transfer are dropped.
pub struct SdoClient {
    server_node: u8,
    cob_tx: u16,
    cob_rx: u16,
    state: ClientState,
    index: u16,
    sub_index: u8,
    expedited: bool,
    buf: Vec<u8>,
    buf_offset: usize,
    size_indicated: u32,
    toggle: bool,
    timer_us: u32,
    timeout_us: u32,
    blksize: u8,
    seq_ack: u8,
    sub_block_base: usize,
    crc_enabled: bool,
    block_last: bool,
    rx: Option<CanFrame>,
    block_rx: VecDeque<CanFrame>,
    result: Option<Result<Vec<u8>, SdoError>>,
    sub_token: Option<SubscriptionToken>,
}

impl Default for SdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient {
    pub fn new() -> Self {
        Self {
            server_node: 0,
            cob_tx: 0,
            cob_rx: 0,
            state: ClientState::Idle,
            index: 0,
            sub_index: 0,
            expedited: false,
            buf: Vec::new(),
            buf_offset: 0,
            size_indicated: 0,
            toggle: false,
            timer_us: 0,
            timeout_us: SDO_TIMEOUT_US,
            blksize: 0,
            seq_ack: 0,
            sub_block_base: 0,
            crc_enabled: false,
            block_last: false,
            rx: None,
            block_rx: VecDeque::new(),
            result: None,
            sub_token: None,
        }
    }

    /// Selects the remote server this client talks to, using the default
    /// identifier pair for its node id. Call [`SdoClient::attach`] afterwards
    /// to move the bus subscription along.
    pub fn configure(&mut self, server_node: u8) {
        self.configure_ids(
            COB_SDO_RX + server_node as u16,
            COB_SDO_TX + server_node as u16,
            server_node,
        );
    }

    /// Selects explicit identifiers, as configured through OD 1280h.
    pub fn configure_ids(&mut self, request_ident: u16, response_ident: u16, server_node: u8) {
        self.server_node = server_node;
        self.cob_tx = request_ident;
        self.cob_rx = response_ident;
    }

    pub(crate) fn take_subscription(&mut self) -> Option<SubscriptionToken> {
        self.sub_token.take()
    }

    /// (Re)registers the bus subscription on the response identifier.
    pub fn attach(client: &Arc<Mutex<SdoClient>>, bus: &BusManager) {
        let (old, ident) = {
            let mut c = client.lock().unwrap();
            (c.sub_token.take(), c.cob_rx)
        };
        if let Some(token) = old {
            bus.unsubscribe(token);
        }
        if ident == 0 {
            return;
        }
        let listener: Arc<Mutex<dyn FrameListener>> = client.clone();
        match bus.subscribe(ident, CAN_ID_MASK, false, listener) {
            Ok(token) => client.lock().unwrap().sub_token = Some(token),
            Err(e) => warn!("SDO client subscribe on {:#05X} failed: {}", ident, e),
        }
    }

    pub fn server_node(&self) -> u8 {
        self.server_node
    }

    /// Identifier responses arrive on (server-to-client).
    pub fn response_ident(&self) -> u16 {
        self.cob_rx
    }

    pub fn set_timeout_us(&mut self, timeout_us: u32) {
        self.timeout_us = timeout_us;
    }

    pub fn status(&self) -> SdoClientStatus {
        if self.result.is_some() {
            SdoClientStatus::Done
        } else if self.state != ClientState::Idle {
            SdoClientStatus::Busy
        } else {
            SdoClientStatus::Idle
        }
    }

    /// Takes the outcome of the finished transfer: uploaded bytes, an empty
    /// vector for downloads, or the error.
    pub fn take_result(&mut self) -> Option<Result<Vec<u8>, SdoError>> {
        self.result.take()
    }

    /// Starts writing `data` to `index:sub_index` on the configured server.
    /// Expedited when four bytes or fewer (unless forced segmented), block
    /// transfer above [`BLOCK_THRESHOLD`].
    pub fn start_download(
        &mut self,
        bus: &BusManager,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
        force_segmented: bool,
    ) -> Result<(), CanOpenError> {
        self.start(index, sub_index)?;
        let idx_lo = (index & 0xFF) as u8;
        let idx_hi = (index >> 8) as u8;
        let size = (data.len() as u32).to_le_bytes();

        if data.len() <= 4 && !force_segmented {
            self.expedited = true;
            let n = (4 - data.len()) as u8;
            let mut payload = [0x23 | (n << 2), idx_lo, idx_hi, sub_index, 0, 0, 0, 0];
            payload[4..4 + data.len()].copy_from_slice(&data);
            self.state = ClientState::InitDownloadRsp;
            bus.send(&CanFrame::new(self.cob_tx, &payload))?;
        } else if data.len() > BLOCK_THRESHOLD && !force_segmented {
            self.buf = data;
            self.state = ClientState::BlockDownInitRsp;
            let payload = [0xC6, idx_lo, idx_hi, sub_index, size[0], size[1], size[2], size[3]];
            bus.send(&CanFrame::new(self.cob_tx, &payload))?;
        } else {
            self.buf = data;
            self.state = ClientState::InitDownloadRsp;
            let payload = [0x21, idx_lo, idx_hi, sub_index, size[0], size[1], size[2], size[3]];
            bus.send(&CanFrame::new(self.cob_tx, &payload))?;
        }
        Ok(())
    }

    /// Starts reading `index:sub_index` from the configured server. With
    /// `block` set the transfer is initiated in block mode (the server may
    /// still fall back to segmented below the protocol-switch threshold).
    pub fn start_upload(
        &mut self,
        bus: &BusManager,
        index: u16,
        sub_index: u8,
        block: bool,
    ) -> Result<(), CanOpenError> {
        self.start(index, sub_index)?;
        let idx_lo = (index & 0xFF) as u8;
        let idx_hi = (index >> 8) as u8;

        if block {
            self.state = ClientState::BlockUpInitRsp;
            let payload = [
                0xA4,
                idx_lo,
                idx_hi,
                sub_index,
                BLOCK_SIZE_MAX,
                BLOCK_UPLOAD_PST,
                0,
                0,
            ];
            bus.send(&CanFrame::new(self.cob_tx, &payload))?;
        } else {
            self.state = ClientState::InitUploadRsp;
            let payload = [0x40, idx_lo, idx_hi, sub_index, 0, 0, 0, 0];
            bus.send(&CanFrame::new(self.cob_tx, &payload))?;
        }
        Ok(())
    }

    /// Discards the in-flight transfer and tells the peer.
    pub fn cancel(&mut self, bus: &BusManager) {
        if self.state != ClientState::Idle {
            self.send_abort_frame(bus, ABORT_GENERAL);
            self.state = ClientState::Idle;
        }
        self.result = None;
        self.buf.clear();
        self.block_rx.clear();
    }

    /// Advances the transfer: consumes deposited response frames and the
    /// timeout timer.
    pub fn process(&mut self, dt_us: u32, next_us: &mut u32, bus: &BusManager) {
        if let Some(frame) = self.rx.take() {
            self.timer_us = 0;
            self.handle_frame(&frame, bus);
        }
        while let Some(frame) = self.block_rx.pop_front() {
            self.timer_us = 0;
            self.handle_upload_segment(&frame, bus);
        }

        if self.state != ClientState::Idle {
            self.timer_us = self.timer_us.saturating_add(dt_us);
            if self.timer_us >= self.timeout_us {
                warn!(
                    "SDO client transfer {:#06X}:{} to node {} timed out",
                    self.index, self.sub_index, self.server_node
                );
                self.send_abort_frame(bus, ABORT_TIMEOUT);
                self.finish(Err(SdoError::Abort(ABORT_TIMEOUT)));
            } else {
                *next_us = (*next_us).min(self.timeout_us - self.timer_us);
            }
        }
    }

    fn start(&mut self, index: u16, sub_index: u8) -> Result<(), CanOpenError> {
        if self.server_node == 0 {
            return Err(CanOpenError::TxUnconfigured);
        }
        if self.state != ClientState::Idle || self.result.is_some() {
            return Err(CanOpenError::TxBusy);
        }
        self.index = index;
        self.sub_index = sub_index;
        self.expedited = false;
        self.buf.clear();
        self.buf_offset = 0;
        self.size_indicated = 0;
        self.toggle = false;
        self.timer_us = 0;
        self.seq_ack = 0;
        self.block_last = false;
        self.crc_enabled = false;
        self.block_rx.clear();
        self.rx = None;
        Ok(())
    }

    fn handle_frame(&mut self, frame: &CanFrame, bus: &BusManager) {
        if frame.dlc < 8 {
            return;
        }
        let b0 = frame.data[0];
        if b0 == 0x80 {
            let code =
                u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
            trace!("SDO client: peer aborted with {:#010X}", code);
            self.finish(Err(SdoError::Abort(code)));
            return;
        }
        match self.state {
            ClientState::InitDownloadRsp => self.on_download_ack(frame, bus),
            ClientState::DownloadSegmentRsp => self.on_segment_ack(frame, bus),
            ClientState::InitUploadRsp => self.on_upload_init(frame, bus),
            ClientState::UploadSegmentRsp => self.on_upload_segment(frame, bus),
            ClientState::BlockDownInitRsp => self.on_block_down_init(frame, bus),
            ClientState::BlockDownAckRsp => self.on_block_down_ack(frame, bus),
            ClientState::BlockDownEndRsp => self.on_block_down_end(frame, bus),
            ClientState::BlockUpInitRsp => self.on_block_up_init(frame, bus),
            ClientState::BlockUpEndRsp => self.on_block_up_end(frame, bus),
            ClientState::BlockUpSegments | ClientState::Idle => {
                // No active transfer for this frame: drop it.
            }
        }
    }

    // --- Expedited / segmented download ---

    fn on_download_ack(&mut self, frame: &CanFrame, bus: &BusManager) {
        if frame.data[0] >> 5 != 3 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        if self.expedited {
            return self.finish(Ok(Vec::new()));
        }
        self.state = ClientState::DownloadSegmentRsp;
        self.send_download_segment(bus);
    }

    fn on_segment_ack(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 >> 5 != 1 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        // The echoed toggle belongs to the segment we just sent.
        if (b0 & 0x10 != 0) == self.toggle {
            return self.protocol_error(bus, ABORT_TOGGLE);
        }
        if self.buf_offset >= self.buf.len() {
            return self.finish(Ok(Vec::new()));
        }
        self.send_download_segment(bus);
    }

    fn send_download_segment(&mut self, bus: &BusManager) {
        let remaining = self.buf.len() - self.buf_offset;
        let count = remaining.min(7);
        let last = count == remaining;
        let unused = (7 - count) as u8;
        let mut data = [0u8; 8];
        data[0] = ((self.toggle as u8) << 4) | (unused << 1) | last as u8;
        data[1..1 + count].copy_from_slice(&self.buf[self.buf_offset..self.buf_offset + count]);
        self.buf_offset += count;
        self.toggle = !self.toggle;
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    // --- Expedited / segmented upload ---

    fn on_upload_init(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 >> 5 != 2 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        if b0 & 0x02 != 0 {
            // Expedited response.
            let len = if b0 & 0x01 != 0 {
                4 - ((b0 >> 2) & 0x03) as usize
            } else {
                4
            };
            return self.finish(Ok(frame.data[4..4 + len].to_vec()));
        }
        self.size_indicated = if b0 & 0x01 != 0 {
            u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
        } else {
            0
        };
        self.state = ClientState::UploadSegmentRsp;
        self.request_upload_segment(bus);
    }

    fn request_upload_segment(&mut self, bus: &BusManager) {
        let data = [0x60 | ((self.toggle as u8) << 4), 0, 0, 0, 0, 0, 0, 0];
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    fn on_upload_segment(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 >> 5 != 0 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        if (b0 & 0x10 != 0) != self.toggle {
            return self.protocol_error(bus, ABORT_TOGGLE);
        }
        let unused = ((b0 >> 1) & 0x07) as usize;
        let last = b0 & 0x01 != 0;
        self.buf.extend_from_slice(&frame.data[1..8 - unused]);
        self.toggle = !self.toggle;

        if last {
            if self.size_indicated != 0 && self.buf.len() as u32 != self.size_indicated {
                let code = if (self.buf.len() as u32) < self.size_indicated {
                    super::ABORT_DATA_SHORT
                } else {
                    super::ABORT_DATA_LONG
                };
                return self.protocol_error(bus, code);
            }
            let value = core::mem::take(&mut self.buf);
            self.finish(Ok(value));
        } else {
            self.request_upload_segment(bus);
        }
    }

    // --- Block download ---

    fn on_block_down_init(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 & 0xE3 != 0xA0 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        self.crc_enabled = b0 & 0x04 != 0;
        let blksize = frame.data[4];
        if blksize == 0 || blksize > BLOCK_SIZE_MAX {
            return self.protocol_error(bus, ABORT_BLOCK_SIZE);
        }
        self.blksize = blksize;
        self.send_down_sub_block(bus);
    }

    fn send_down_sub_block(&mut self, bus: &BusManager) {
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
        self.state = ClientState::BlockDownAckRsp;
    }

    fn on_block_down_ack(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 != 0xA2 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        let ackseq = frame.data[1] as usize;
        let blksize = frame.data[2];
        if blksize == 0 || blksize > BLOCK_SIZE_MAX {
            return self.protocol_error(bus, ABORT_BLOCK_SIZE);
        }
        self.blksize = blksize;
        self.buf_offset = (self.sub_block_base + ackseq * 7).min(self.buf.len());

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
            self.state = ClientState::BlockDownEndRsp;
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
        } else {
            self.send_down_sub_block(bus);
        }
    }

    fn on_block_down_end(&mut self, frame: &CanFrame, bus: &BusManager) {
        if frame.data[0] != 0xA1 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        self.finish(Ok(Vec::new()));
    }

    // --- Block upload ---

    fn on_block_up_init(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 >> 5 == 2 {
            // Server switched to the plain upload protocol below the
            // protocol-switch threshold.
            self.state = ClientState::InitUploadRsp;
            return self.on_upload_init(frame, bus);
        }
        if b0 & 0xE1 != 0xC0 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        self.crc_enabled = b0 & 0x04 != 0;
        self.size_indicated = if b0 & 0x02 != 0 {
            u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]])
        } else {
            0
        };
        self.blksize = BLOCK_SIZE_MAX;
        self.seq_ack = 0;
        self.state = ClientState::BlockUpSegments;
        let _ = bus.send(&CanFrame::new(self.cob_tx, &[0xA3, 0, 0, 0, 0, 0, 0, 0]));
    }

    fn handle_upload_segment(&mut self, frame: &CanFrame, bus: &BusManager) {
        if self.state != ClientState::BlockUpSegments {
            return;
        }
        let b0 = frame.data[0];
        if b0 == 0x80 {
            let code =
                u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
            return self.finish(Err(SdoError::Abort(code)));
        }
        let seq = b0 & 0x7F;
        let last = b0 & 0x80 != 0;
        if seq == 0 || seq > self.blksize {
            return self.protocol_error(bus, ABORT_SEQUENCE);
        }
        if seq == self.seq_ack + 1 {
            self.buf.extend_from_slice(&frame.data[1..8]);
            self.seq_ack = seq;
            if last {
                self.block_last = true;
            }
        }

        if seq == self.blksize || last {
            let data = [0xA2, self.seq_ack, self.blksize, 0, 0, 0, 0, 0];
            let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
            self.seq_ack = 0;
            if self.block_last {
                self.state = ClientState::BlockUpEndRsp;
                self.block_rx.clear();
            }
        }
    }

    fn on_block_up_end(&mut self, frame: &CanFrame, bus: &BusManager) {
        let b0 = frame.data[0];
        if b0 & 0xE3 != 0xC1 {
            return self.protocol_error(bus, super::ABORT_COMMAND);
        }
        let unused = ((b0 >> 2) & 0x07) as usize;
        self.buf.truncate(self.buf.len().saturating_sub(unused));
        if self.crc_enabled {
            let received = u16::from_le_bytes([frame.data[1], frame.data[2]]);
            if received != !crc16_block(&self.buf) {
                return self.protocol_error(bus, ABORT_CRC);
            }
        }
        let _ = bus.send(&CanFrame::new(self.cob_tx, &[0xA1, 0, 0, 0, 0, 0, 0, 0]));
        let value = core::mem::take(&mut self.buf);
        self.finish(Ok(value));
    }

    // --- Helpers ---

    fn protocol_error(&mut self, bus: &BusManager, code: u32) {
        self.send_abort_frame(bus, code);
        self.finish(Err(SdoError::Abort(code)));
    }

    fn send_abort_frame(&mut self, bus: &BusManager, code: u32) {
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
        let _ = bus.send(&CanFrame::new(self.cob_tx, &data));
    }

    fn finish(&mut self, result: Result<Vec<u8>, SdoError>) {
        self.state = ClientState::Idle;
        self.block_rx.clear();
        self.result = Some(result);
    }
}

impl FrameListener for SdoClient {
    fn on_frame(&mut self, frame: &CanFrame) {
        if frame.rtr || frame.ident != self.cob_rx {
            return;
        }
        if self.state == ClientState::BlockUpSegments {
            if self.block_rx.len() <= BLOCK_SIZE_MAX as usize + 2 {
                self.block_rx.push_back(*frame);
            }
        } else {
            self.rx = Some(*frame);
        }
    }
}

/// OD hook for the SDO client parameter record (1280h): writes to the
/// identifier pair or the server node id reconfigure the client and move
/// its bus subscription.
pub struct SdoClientHook {
    pub client: Arc<Mutex<SdoClient>>,
    pub bus: Arc<BusManager>,
}

impl OdExtension for SdoClientHook {
    fn write(
        &mut self,
        _od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        if self.client.lock().unwrap().status() == SdoClientStatus::Busy {
            return Err(OdError::DataDevState);
        }
        let result = entry.default_write(stream, data)?;
        if result.is_complete() {
            let read_u32 = |sub: u8| {
                entry.variable(sub).and_then(|v| {
                    v.data
                        .as_slice()
                        .try_into()
                        .ok()
                        .map(u32::from_le_bytes)
                })
            };
            let request = read_u32(1).unwrap_or(0x8000_0000);
            let response = read_u32(2).unwrap_or(0x8000_0000);
            let server_node = entry
                .variable(3)
                .and_then(|v| v.data.first().copied())
                .unwrap_or(0);

            let enabled = request & 0x8000_0000 == 0 && response & 0x8000_0000 == 0;
            {
                let mut client = self.client.lock().unwrap();
                if enabled {
                    client.configure_ids(
                        (request & 0x7FF) as u16,
                        (response & 0x7FF) as u16,
                        server_node,
                    );
                } else {
                    client.configure_ids(0, 0, 0);
                }
            }
            SdoClient::attach(&self.client, &self.bus);
        }
        Ok(result)
    }
}

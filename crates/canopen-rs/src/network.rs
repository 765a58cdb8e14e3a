// crates/canopen-rs/src/network.rs

use crate::bus::BusManager;
use crate::hal::CanOpenError;
use crate::nmt::{Nmt, NmtCommand};
use crate::od::ObjectDictionary;
use crate::sdo::{SdoClient, SdoClientStatus, SdoError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Process-loop tick of the background thread.
const TICK_US: u32 = 1000;
/// Poll interval of blocking callers spinning on transfer completion.
const WAIT_POLL: Duration = Duration::from_micros(500);

/// Master-side aggregate: one SDO client for confirmed access to remote
/// nodes, an NMT command sender, and a registry of remote Object
/// Dictionaries (typically loaded from EDS files).
///
/// `connect` starts a background process loop; the blocking `read`/`write`
/// wrappers then spin on the transfer's completion flag while that loop
/// advances the client. Without the loop running they tick the client
/// themselves, which keeps single-threaded tests deterministic.
pub struct Network {
    bus: Arc<BusManager>,
    client: Arc<Mutex<SdoClient>>,
    remote_ods: Mutex<BTreeMap<u8, Arc<ObjectDictionary>>>,
    /// Serializes blocking operations: the client allows one in-flight
    /// transfer.
    op_lock: Mutex<()>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    pub fn new(bus: Arc<BusManager>) -> Self {
        Self {
            bus,
            client: Arc::new(Mutex::new(SdoClient::new())),
            remote_ods: Mutex::new(BTreeMap::new()),
            op_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<BusManager> {
        &self.bus
    }

    /// Brings the driver up and starts the background process loop.
    pub fn connect(network: &Arc<Network>) -> Result<(), CanOpenError> {
        network.bus.connect()?;
        if network.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let worker = network.clone();
        let handle = std::thread::spawn(move || {
            while worker.running.load(Ordering::SeqCst) {
                worker.process(TICK_US);
                std::thread::sleep(Duration::from_micros(TICK_US as u64));
            }
        });
        *network.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the process loop. The bus subscriptions stay in place so a
    /// later `connect` resumes where it left off.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// One tick of the master services; public so tests and embedders can
    /// drive the network without the background thread.
    pub fn process(&self, dt_us: u32) {
        let mut next = u32::MAX;
        self.client.lock().unwrap().process(dt_us, &mut next, &self.bus);
    }

    /// Registers the Object Dictionary describing a remote node.
    pub fn add_node(&self, node_id: u8, od: ObjectDictionary) {
        self.remote_ods.lock().unwrap().insert(node_id, Arc::new(od));
    }

    pub fn remove_node(&self, node_id: u8) {
        self.remote_ods.lock().unwrap().remove(&node_id);
    }

    /// The registered dictionary of a remote node, if any.
    pub fn node_od(&self, node_id: u8) -> Option<Arc<ObjectDictionary>> {
        self.remote_ods.lock().unwrap().get(&node_id).cloned()
    }

    pub fn known_nodes(&self) -> Vec<u8> {
        self.remote_ods.lock().unwrap().keys().copied().collect()
    }

    /// Sends an NMT command to `target` (0 = all nodes).
    pub fn nmt_command(&self, command: NmtCommand, target: u8) -> Result<(), CanOpenError> {
        Nmt::send_command(&self.bus, command, target)
    }

    /// Reads `index:sub_index` from a remote node, blocking until the
    /// transfer finishes or times out.
    pub fn read(&self, node_id: u8, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoError> {
        let _guard = self.op_lock.lock().unwrap();
        self.select(node_id);
        self.client
            .lock()
            .unwrap()
            .start_upload(&self.bus, index, sub_index, false)?;
        self.wait()
    }

    /// Reads a value of unknown size using block upload.
    pub fn read_all(&self, node_id: u8, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoError> {
        let _guard = self.op_lock.lock().unwrap();
        self.select(node_id);
        self.client
            .lock()
            .unwrap()
            .start_upload(&self.bus, index, sub_index, true)?;
        self.wait()
    }

    /// Writes `data` to `index:sub_index` on a remote node, blocking until
    /// the transfer finishes or times out.
    pub fn write(
        &self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
        force_segmented: bool,
    ) -> Result<(), SdoError> {
        let _guard = self.op_lock.lock().unwrap();
        self.select(node_id);
        self.client.lock().unwrap().start_download(
            &self.bus,
            index,
            sub_index,
            data.to_vec(),
            force_segmented,
        )?;
        self.wait().map(|_| ())
    }

    pub fn read_u32(&self, node_id: u8, index: u16, sub_index: u8) -> Result<u32, SdoError> {
        let raw = self.read(node_id, index, sub_index)?;
        raw.try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| SdoError::Error(CanOpenError::DataCorrupt))
    }

    pub fn write_u32(
        &self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        value: u32,
    ) -> Result<(), SdoError> {
        self.write(node_id, index, sub_index, &value.to_le_bytes(), false)
    }

    fn select(&self, node_id: u8) {
        let resubscribe = {
            let mut client = self.client.lock().unwrap();
            if client.server_node() == node_id {
                false
            } else {
                client.configure(node_id);
                true
            }
        };
        if resubscribe {
            SdoClient::attach(&self.client, &self.bus);
        }
    }

    fn wait(&self) -> Result<Vec<u8>, SdoError> {
        loop {
            {
                let mut client = self.client.lock().unwrap();
                if let Some(result) = client.take_result() {
                    return result;
                }
                if client.status() == SdoClientStatus::Idle {
                    return Err(SdoError::Error(CanOpenError::InvalidState));
                }
            }
            if self.running.load(Ordering::SeqCst) {
                std::thread::sleep(WAIT_POLL);
            } else {
                // No background loop: advance the client ourselves so
                // timeouts still fire.
                self.process(TICK_US);
            }
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::CanInterface;
    use crate::types::CanFrame;

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

    fn harness() -> (Arc<Network>, Arc<Mutex<Vec<CanFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let bus = Arc::new(BusManager::new(Box::new(CaptureDriver {
            frames: frames.clone(),
        })));
        (Arc::new(Network::new(bus)), frames)
    }

    #[test]
    fn test_nmt_command_on_wire() {
        let (network, frames) = harness();
        network.nmt_command(NmtCommand::EnterOperational, 0x10).unwrap();
        let sent = frames.lock().unwrap();
        assert_eq!(sent[0].ident, 0x000);
        assert_eq!(sent[0].payload(), &[1, 0x10]);
    }

    #[test]
    fn test_read_times_out_without_peer() {
        let (network, frames) = harness();
        let result = network.read(0x10, 0x1000, 0);
        assert_eq!(result, Err(SdoError::Abort(crate::sdo::ABORT_TIMEOUT)));
        // The request itself went out on the client channel.
        assert_eq!(frames.lock().unwrap()[0].ident, 0x610);
    }

    #[test]
    fn test_node_registry() {
        let (network, _frames) = harness();
        network.add_node(5, ObjectDictionary::new());
        assert!(network.node_od(5).is_some());
        assert_eq!(network.known_nodes(), vec![5]);
        network.remove_node(5);
        assert!(network.node_od(5).is_none());
    }
}

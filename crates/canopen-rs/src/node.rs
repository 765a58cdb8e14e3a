// crates/canopen-rs/src/node.rs

use crate::bus::BusManager;
use crate::emcy::{Emcy, EmcyCallback, EmcyHook, errors};
use crate::hal::{CanOpenError, OdStorage};
use crate::heartbeat::{HeartbeatConsumer, HeartbeatHook};
use crate::nmt::{Nmt, NmtCommand, NmtControl, NmtHook, NmtState, ResetRequest};
use crate::od::{ObjectDictionary, OdError, validate_mandatory_objects};
use crate::pdo::rpdo::RpdoCommHook;
use crate::pdo::tpdo::TpdoCommHook;
use crate::pdo::{PdoMapHook, Rpdo, Tpdo};
use crate::sdo::client::SdoClientHook;
use crate::sdo::{SdoClient, SdoServer};
use crate::storage::{StorageHook, load_parameters};
use crate::sync::{SyncHook, SyncObject};
use crate::time::{TimeHook, TimeObject};
use crate::types::{CAN_ID_MASK, COB_EMCY, COB_HEARTBEAT, COB_NMT, COB_RPDO, COB_TPDO, NodeId};
use log::{info, warn};
use std::sync::{Arc, Mutex};

/// Upper bound on the number of RPDO/TPDO sets a node scans for.
const PDO_SCAN_MAX: u16 = 512;

/// Construction-time options of a [`Node`].
pub struct NodeConfig {
    pub node_id: NodeId,
    pub nmt_control: NmtControl,
    /// Optional backend for the 1010h/1011h store/restore commands.
    pub storage: Option<Box<dyn OdStorage>>,
}

impl NodeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            nmt_control: NmtControl::default(),
            storage: None,
        }
    }
}

/// A complete CANopen slave node: owns the Object Dictionary and all
/// standard services, wired to one [`BusManager`].
///
/// All protocol work happens in [`Node::process`], which the owner calls
/// periodically with the elapsed microseconds; it returns the shortest
/// pending timer deadline so the caller can sleep efficiently. Frame
/// listeners installed on the bus manager only deposit data and never block.
pub struct Node {
    node_id: NodeId,
    od: Arc<ObjectDictionary>,
    bus: Arc<BusManager>,
    nmt: Arc<Mutex<Nmt>>,
    emcy: Arc<Mutex<Emcy>>,
    sdo_server: Arc<Mutex<SdoServer>>,
    sdo_client: Option<Arc<Mutex<SdoClient>>>,
    heartbeat: Arc<Mutex<HeartbeatConsumer>>,
    sync: Arc<Mutex<SyncObject>>,
    time: Arc<Mutex<TimeObject>>,
    rpdos: Vec<Arc<Mutex<Rpdo>>>,
    tpdos: Vec<Arc<Mutex<Tpdo>>>,
    fixed_subscriptions: Vec<crate::bus::SubscriptionToken>,
    tx_errors_seen: u32,
}

impl Node {
    /// Builds the node from a populated Object Dictionary, installs every
    /// service extension and bus subscription, and leaves the NMT machine
    /// ready to emit its boot-up heartbeat on the first `process` call.
    pub fn new(
        config: NodeConfig,
        od: ObjectDictionary,
        bus: Arc<BusManager>,
    ) -> Result<Self, CanOpenError> {
        let node_id = config.node_id;
        validate_mandatory_objects(&od).map_err(|_| CanOpenError::OdParameters)?;

        let storage = match config.storage {
            Some(mut backend) => {
                load_parameters(&od, backend.as_mut())?;
                Some(Arc::new(Mutex::new(backend)))
            }
            None => None,
        };
        let od = Arc::new(od);

        // --- EMCY ---
        let fifo_size = od.sub_count(0x1003).unwrap_or(8) as usize;
        let emcy = Arc::new(Mutex::new(Emcy::new(node_id, fifo_size, bus.clone())));
        emcy.lock().unwrap().configure_from_od(&od);
        let emcy_hook = Arc::new(Mutex::new(EmcyHook { emcy: emcy.clone() }));
        for index in [0x1003, 0x1014, 0x1015] {
            if od.contains(index) {
                let _ = od.attach_extension(index, emcy_hook.clone());
            }
        }
        let mut fixed_subscriptions = Vec::new();
        fixed_subscriptions.push(bus.subscribe(COB_EMCY, 0x780, false, emcy.clone())?);

        // --- NMT ---
        let nmt = Arc::new(Mutex::new(Nmt::new(node_id, config.nmt_control)));
        nmt.lock().unwrap().configure_from_od(&od);
        if od.contains(0x1017) {
            let _ = od.attach_extension(0x1017, Arc::new(Mutex::new(NmtHook { nmt: nmt.clone() })));
        }
        fixed_subscriptions.push(bus.subscribe(COB_NMT, CAN_ID_MASK, false, nmt.clone())?);

        // --- SDO server ---
        let sdo_server = Arc::new(Mutex::new(SdoServer::new(node_id)));
        let request_ident = sdo_server.lock().unwrap().request_ident();
        fixed_subscriptions.push(bus.subscribe(
            request_ident,
            CAN_ID_MASK,
            false,
            sdo_server.clone(),
        )?);

        // --- SDO client (only when 1280h is populated) ---
        let sdo_client = if od.contains(0x1280) {
            let client = Arc::new(Mutex::new(SdoClient::new()));
            Self::configure_client_from_od(&client, &od, &bus);
            let hook = SdoClientHook {
                client: client.clone(),
                bus: bus.clone(),
            };
            let _ = od.attach_extension(0x1280, Arc::new(Mutex::new(hook)));
            Some(client)
        } else {
            None
        };

        // --- Heartbeat consumer ---
        let heartbeat = Arc::new(Mutex::new(HeartbeatConsumer::new(emcy.clone())));
        heartbeat.lock().unwrap().configure_from_od(&od);
        if od.contains(0x1016) {
            let hook = HeartbeatHook {
                consumer: heartbeat.clone(),
            };
            let _ = od.attach_extension(0x1016, Arc::new(Mutex::new(hook)));
        }
        fixed_subscriptions.push(bus.subscribe(COB_HEARTBEAT, 0x780, false, heartbeat.clone())?);

        // --- SYNC ---
        let sync = Arc::new(Mutex::new(SyncObject::new(bus.clone(), emcy.clone())));
        sync.lock().unwrap().configure_from_od(&od);
        let sync_hook = Arc::new(Mutex::new(SyncHook {
            sync: sync.clone(),
            bus: bus.clone(),
        }));
        for index in [0x1005, 0x1006, 0x1007, 0x1019] {
            if od.contains(index) {
                let _ = od.attach_extension(index, sync_hook.clone());
            }
        }
        SyncObject::attach(&sync, &bus);

        // --- TIME ---
        let time = Arc::new(Mutex::new(TimeObject::new(bus.clone())));
        time.lock().unwrap().configure_from_od(&od);
        if od.contains(0x1012) {
            let hook = TimeHook {
                time: time.clone(),
                bus: bus.clone(),
            };
            let _ = od.attach_extension(0x1012, Arc::new(Mutex::new(hook)));
        }
        TimeObject::attach(&time, &bus);

        // --- Store / restore parameters ---
        if let Some(storage) = &storage {
            let hook = Arc::new(Mutex::new(StorageHook {
                storage: storage.clone(),
            }));
            for index in [0x1010, 0x1011] {
                if od.contains(index) {
                    let _ = od.attach_extension(index, hook.clone());
                }
            }
        }

        // --- PDOs ---
        let sync_toggle = sync.lock().unwrap().toggle_handle();
        let mut rpdos = Vec::new();
        for number in 0..PDO_SCAN_MAX {
            if !od.contains(0x1400 + number) {
                break;
            }
            let predefined = if (number as usize) < COB_RPDO.len() {
                COB_RPDO[number as usize] + node_id.0 as u16
            } else {
                0
            };
            let rpdo = Arc::new(Mutex::new(Rpdo::new(
                number,
                predefined,
                bus.clone(),
                emcy.clone(),
                sync_toggle.clone(),
            )));
            if let Err(e) = rpdo.lock().unwrap().configure_from_od(&od) {
                Self::report_wrong_mapping(&emcy, 0x1400 + number, e);
            }
            let _ = od.attach_extension(
                0x1400 + number,
                Arc::new(Mutex::new(RpdoCommHook {
                    rpdo: rpdo.clone(),
                    bus: bus.clone(),
                })),
            );
            if od.contains(0x1600 + number) {
                let _ = od.attach_extension(
                    0x1600 + number,
                    Arc::new(Mutex::new(PdoMapHook { pdo: rpdo.clone() })),
                );
            }
            Rpdo::attach(&rpdo, &bus);
            rpdos.push(rpdo);
        }

        let mut tpdos = Vec::new();
        for number in 0..PDO_SCAN_MAX {
            if !od.contains(0x1800 + number) {
                break;
            }
            let predefined = if (number as usize) < COB_TPDO.len() {
                COB_TPDO[number as usize] + node_id.0 as u16
            } else {
                0
            };
            let tpdo = Arc::new(Mutex::new(Tpdo::new(number, predefined, bus.clone())));
            if let Err(e) = tpdo.lock().unwrap().configure_from_od(&od) {
                Self::report_wrong_mapping(&emcy, 0x1800 + number, e);
            }
            let _ = od.attach_extension(
                0x1800 + number,
                Arc::new(Mutex::new(TpdoCommHook { tpdo: tpdo.clone() })),
            );
            if od.contains(0x1A00 + number) {
                let _ = od.attach_extension(
                    0x1A00 + number,
                    Arc::new(Mutex::new(PdoMapHook { pdo: tpdo.clone() })),
                );
            }
            tpdos.push(tpdo);
        }

        info!(
            "node {} initialised: {} RPDOs, {} TPDOs",
            node_id,
            rpdos.len(),
            tpdos.len()
        );

        Ok(Self {
            node_id,
            od,
            bus,
            nmt,
            emcy,
            sdo_server,
            sdo_client,
            heartbeat,
            sync,
            time,
            rpdos,
            tpdos,
            fixed_subscriptions,
            tx_errors_seen: 0,
        })
    }

    fn configure_client_from_od(
        client: &Arc<Mutex<SdoClient>>,
        od: &ObjectDictionary,
        bus: &BusManager,
    ) {
        let request = od.u32(0x1280, 1).unwrap_or(0x8000_0000);
        let response = od.u32(0x1280, 2).unwrap_or(0x8000_0000);
        let server_node = od.u8(0x1280, 3).unwrap_or(0);
        let enabled = request & 0x8000_0000 == 0 && response & 0x8000_0000 == 0;
        {
            let mut c = client.lock().unwrap();
            if enabled {
                c.configure_ids((request & 0x7FF) as u16, (response & 0x7FF) as u16, server_node);
            } else {
                c.configure_ids(0, 0, 0);
            }
        }
        SdoClient::attach(client, bus);
    }

    fn report_wrong_mapping(emcy: &Arc<Mutex<Emcy>>, comm_index: u16, e: OdError) {
        warn!("PDO {:#06X} has a wrong mapping: {}", comm_index, e);
        emcy.lock().unwrap().error_report(
            errors::EM_PDO_WRONG_MAPPING,
            errors::ERR_PDO_LENGTH_EXCEEDED,
            comm_index as u32,
        );
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn od(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt.lock().unwrap().state()
    }

    pub fn set_emcy_callback(&self, callback: EmcyCallback) {
        self.emcy.lock().unwrap().set_callback(callback);
    }

    /// The embedded SDO client, present when OD 1280h exists.
    pub fn sdo_client(&self) -> Option<&Arc<Mutex<SdoClient>>> {
        self.sdo_client.as_ref()
    }

    /// Application request to transmit an event-driven TPDO.
    pub fn request_tpdo(&self, number: usize) -> Result<(), CanOpenError> {
        let tpdo = self.tpdos.get(number).ok_or(CanOpenError::IllegalArgument)?;
        tpdo.lock().unwrap().request_send();
        Ok(())
    }

    /// Sends an NMT master command, applying it locally when this node is
    /// addressed (directly or by broadcast).
    pub fn nmt_command(&self, command: NmtCommand, target: u8) -> Result<(), CanOpenError> {
        Nmt::send_command(&self.bus, command, target)?;
        if target == 0 || target == self.node_id.0 {
            self.nmt.lock().unwrap().request(command);
        }
        Ok(())
    }

    /// Advances every service by `dt_us` microseconds in the canonical
    /// order (bus manager, EMCY, NMT, SDO, heartbeat consumer, TIME, SYNC,
    /// RPDO, TPDO), lowers `next_us` to the nearest timer deadline, and
    /// reports any reset requested over NMT. Communication resets are
    /// carried out internally before returning.
    pub fn process(&mut self, dt_us: u32, next_us: &mut u32) -> ResetRequest {
        let tx_errors = self.bus.tx_error_count();
        if tx_errors != self.tx_errors_seen {
            self.tx_errors_seen = tx_errors;
            self.emcy.lock().unwrap().error_report(
                errors::EM_CAN_TX_OVERFLOW,
                errors::ERR_CAN_OVERRUN,
                tx_errors,
            );
        }

        let error_register = {
            let mut emcy = self.emcy.lock().unwrap();
            emcy.process(dt_us, next_us, &self.od);
            emcy.error_register()
        };

        let reset =
            self.nmt
                .lock()
                .unwrap()
                .process(dt_us, next_us, &self.bus, &self.emcy, error_register);
        let state = self.nmt.lock().unwrap().state();
        let operational = state == NmtState::Operational;
        let communicating = state != NmtState::Stopped;

        self.sdo_server
            .lock()
            .unwrap()
            .process(dt_us, next_us, &self.od, &self.bus, communicating);
        if let Some(client) = &self.sdo_client {
            client.lock().unwrap().process(dt_us, next_us, &self.bus);
        }
        self.heartbeat.lock().unwrap().process(dt_us, next_us);
        self.time.lock().unwrap().process(dt_us, next_us);
        let sync_tick = self
            .sync
            .lock()
            .unwrap()
            .process(dt_us, next_us, communicating);
        for rpdo in &self.rpdos {
            rpdo.lock()
                .unwrap()
                .process(dt_us, next_us, &self.od, operational);
        }
        for tpdo in &self.tpdos {
            tpdo.lock()
                .unwrap()
                .process(dt_us, next_us, &self.od, operational, &sync_tick);
        }

        if reset == ResetRequest::Communication {
            self.reset_communication();
        }
        reset
    }

    /// Reinitializes every service from the OD and the default identifiers,
    /// as mandated after an NMT reset-communication. The OD itself is left
    /// untouched.
    pub fn reset_communication(&mut self) {
        info!("node {}: communication reset", self.node_id);
        self.emcy.lock().unwrap().configure_from_od(&self.od);
        self.sdo_server.lock().unwrap().reset(self.node_id);
        if let Some(client) = &self.sdo_client {
            Self::configure_client_from_od(client, &self.od, &self.bus);
        }
        self.heartbeat.lock().unwrap().configure_from_od(&self.od);
        self.sync.lock().unwrap().configure_from_od(&self.od);
        SyncObject::attach(&self.sync, &self.bus);
        self.time.lock().unwrap().configure_from_od(&self.od);
        TimeObject::attach(&self.time, &self.bus);
        for (number, rpdo) in self.rpdos.iter().enumerate() {
            if let Err(e) = rpdo.lock().unwrap().configure_from_od(&self.od) {
                Self::report_wrong_mapping(&self.emcy, 0x1400 + number as u16, e);
            }
            Rpdo::attach(rpdo, &self.bus);
        }
        for (number, tpdo) in self.tpdos.iter().enumerate() {
            if let Err(e) = tpdo.lock().unwrap().configure_from_od(&self.od) {
                Self::report_wrong_mapping(&self.emcy, 0x1800 + number as u16, e);
            }
        }
        let mut nmt = self.nmt.lock().unwrap();
        nmt.reset_communication();
        nmt.configure_from_od(&self.od);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for token in self.fixed_subscriptions.drain(..) {
            self.bus.unsubscribe(token);
        }
        if let Some(token) = self.sync.lock().unwrap().take_subscription() {
            self.bus.unsubscribe(token);
        }
        if let Some(token) = self.time.lock().unwrap().take_subscription() {
            self.bus.unsubscribe(token);
        }
        if let Some(client) = &self.sdo_client {
            if let Some(token) = client.lock().unwrap().take_subscription() {
                self.bus.unsubscribe(token);
            }
        }
        for rpdo in &self.rpdos {
            if let Some(token) = rpdo.lock().unwrap().take_subscription() {
                self.bus.unsubscribe(token);
            }
        }
    }
}

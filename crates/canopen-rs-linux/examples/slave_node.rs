//! Minimal CANopen slave on SocketCAN.
//!
//! Usage: `slave_node [CAN_INTERFACE] [NODE_ID]` (defaults: vcan0, 10).
//! The node exposes a writable process variable at 0x2000:0, maps it into
//! TPDO1, and answers SDO requests on the default identifiers.

#[cfg(target_os = "linux")]
fn main() {
    use canopen_rs::nmt::NmtControl;
    use canopen_rs::od::{Attribute, Object, ObjectEntry, Variable, populate_communication_profile};
    use canopen_rs::{BusManager, Node, NodeConfig, NodeId, ObjectDictionary};
    use canopen_rs_linux::{RxPump, SocketCanInterface};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    env_logger::init();

    let mut args = std::env::args().skip(1);
    let interface = args.next().unwrap_or_else(|| "vcan0".to_string());
    let node_id = args
        .next()
        .and_then(|s| s.parse().ok())
        .and_then(|raw: u8| NodeId::try_from(raw).ok())
        .unwrap_or(NodeId(10));

    let mut od = ObjectDictionary::new();
    populate_communication_profile(&mut od, node_id);
    od.insert(
        0x2000,
        ObjectEntry::new(
            "Process value",
            Object::Variable(Variable::unsigned16(
                Attribute::SDO_RW | Attribute::TPDO | Attribute::RPDO,
                0,
            )),
        ),
    );
    // Map the process value into TPDO1, event driven with a 500 ms timer.
    od.set_u32(0x1A00, 1, 0x2000_0010).unwrap();
    od.set_u8(0x1A00, 0, 1).unwrap();
    od.set_u16(0x1800, 5, 500).unwrap();
    // Produce a heartbeat every second.
    od.set_u16(0x1017, 0, 1000).unwrap();

    let bus = Arc::new(BusManager::new(Box::new(SocketCanInterface::new(
        &interface,
    ))));
    bus.connect().expect("CAN interface unavailable");
    let _pump = RxPump::start(&interface, bus.clone()).expect("receive socket unavailable");

    let mut config = NodeConfig::new(node_id);
    config.nmt_control = NmtControl::STARTUP_TO_OPERATIONAL;
    let mut node = Node::new(config, od, bus).expect("object dictionary incomplete");

    println!("node {} up on {}", node_id, interface);
    let mut last = Instant::now();
    loop {
        let now = Instant::now();
        let dt_us = now.duration_since(last).as_micros() as u32;
        last = now;

        let mut next_us = 10_000;
        node.process(dt_us, &mut next_us);
        std::thread::sleep(Duration::from_micros(next_us.clamp(500, 10_000) as u64));
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("slave_node requires SocketCAN and only runs on Linux");
}

// crates/canopen-rs/tests/pdo_test.rs
//
// PDO behaviour through a whole node: synchronous RPDO double buffering,
// the TPDO event timer, and producer/consumer value propagation.

mod simulator;

use canopen_rs::nmt::NmtCommand;
use canopen_rs::od::{Attribute, Object, ObjectEntry, Variable};
use canopen_rs::{CanFrame, Node, NodeConfig, NodeId, ObjectDictionary};
use simulator::{VirtualWire, station};

fn od_with_app_entry(node_id: NodeId) -> ObjectDictionary {
    let mut od = ObjectDictionary::new();
    canopen_rs::od::populate_communication_profile(&mut od, node_id);
    od.insert(
        0x2001,
        ObjectEntry::new(
            "Process_U8",
            Object::Variable(Variable::unsigned8(
                Attribute::SDO_RW | Attribute::RPDO | Attribute::TPDO,
                0,
            )),
        ),
    );
    od
}

fn run(node: &mut Node, wire: &std::sync::Arc<VirtualWire>, steps: u32, dt_us: u32) {
    for _ in 0..steps {
        wire.deliver();
        let mut next = u32::MAX;
        node.process(dt_us, &mut next);
        wire.deliver();
    }
}

#[test]
fn test_rpdo_delivery_under_sync() {
    let wire = VirtualWire::new();
    let bus = station(&wire);
    let injector = station(&wire);

    let mut od = od_with_app_entry(NodeId(0x10));
    // RPDO1 at its default 0x210, mapped to 0x2001:0, synchronous type 1.
    od.set_u32(0x1600, 1, 0x2001_0008).unwrap();
    od.set_u8(0x1600, 0, 1).unwrap();
    od.set_u8(0x1400, 2, 1).unwrap();

    let mut node = Node::new(NodeConfig::new(NodeId(0x10)), od, bus).unwrap();
    node.nmt_command(NmtCommand::EnterOperational, 0x10).unwrap();
    run(&mut node, &wire, 2, 1000);

    // Frame before the SYNC: no OD update yet.
    injector.send(&CanFrame::new(0x210, &[0xAB])).unwrap();
    run(&mut node, &wire, 1, 1000);
    assert_eq!(node.od().u8(0x2001, 0).unwrap(), 0);

    // SYNC, then the following tick delivers the buffered value.
    injector.send(&CanFrame::new(0x080, &[])).unwrap();
    run(&mut node, &wire, 1, 1000);
    assert_eq!(node.od().u8(0x2001, 0).unwrap(), 0xAB);
}

#[test]
fn test_tpdo_event_timer_cadence() {
    let wire = VirtualWire::new();
    let bus = station(&wire);

    let mut od = od_with_app_entry(NodeId(0x10));
    od.set_u32(0x1A00, 1, 0x2001_0008).unwrap();
    od.set_u8(0x1A00, 0, 1).unwrap();
    // Event-driven (device profile), 100 ms event timer, no inhibit.
    od.set_u8(0x1800, 2, 255).unwrap();
    od.set_u16(0x1800, 5, 100).unwrap();

    let mut node = Node::new(NodeConfig::new(NodeId(0x10)), od, bus).unwrap();
    node.nmt_command(NmtCommand::EnterOperational, 0x10).unwrap();
    run(&mut node, &wire, 1, 1000);
    wire.clear_history();

    // One second of quiet operation: the event timer alone paces traffic.
    run(&mut node, &wire, 1000, 1000);
    let frames = wire.history_for(0x190);
    assert_eq!(frames.len(), 10);
    assert_eq!(frames[0].dlc, 1);
}

#[test]
fn test_tpdo_to_rpdo_value_propagation() {
    // Producer node 0x21 sends TPDO1; consumer node 0x22 maps the same
    // payload through an RPDO configured to the producer's identifier.
    let wire = VirtualWire::new();
    let producer_bus = station(&wire);
    let consumer_bus = station(&wire);

    let mut producer_od = od_with_app_entry(NodeId(0x21));
    producer_od.set_u32(0x1A00, 1, 0x2001_0008).unwrap();
    producer_od.set_u8(0x1A00, 0, 1).unwrap();
    producer_od.set_u8(0x1800, 2, 255).unwrap();

    let mut consumer_od = od_with_app_entry(NodeId(0x22));
    consumer_od.set_u32(0x1600, 1, 0x2001_0008).unwrap();
    consumer_od.set_u8(0x1600, 0, 1).unwrap();
    // Listen to the producer's TPDO1 identifier.
    consumer_od.set_u32(0x1400, 1, 0x180 + 0x21).unwrap();

    let mut producer = Node::new(NodeConfig::new(NodeId(0x21)), producer_od, producer_bus).unwrap();
    let mut consumer = Node::new(NodeConfig::new(NodeId(0x22)), consumer_od, consumer_bus).unwrap();
    producer.nmt_command(NmtCommand::EnterOperational, 0).unwrap();

    let mut next = u32::MAX;
    producer.process(1000, &mut next);
    consumer.process(1000, &mut next);
    wire.deliver();
    // Broadcast start also reached the consumer.
    producer.process(1000, &mut next);
    consumer.process(1000, &mut next);

    producer.od().set_u8(0x2001, 0, 0x77).unwrap();
    producer.request_tpdo(0).unwrap();
    producer.process(1000, &mut next);
    wire.deliver();
    consumer.process(1000, &mut next);

    assert_eq!(consumer.od().u8(0x2001, 0).unwrap(), 0x77);
}

#[test]
fn test_cob_id_write_rejections_via_od() {
    use canopen_rs::od::{Origin, OdError};
    let wire = VirtualWire::new();
    let bus = station(&wire);

    let mut od = od_with_app_entry(NodeId(0x10));
    od.set_u32(0x1A00, 1, 0x2001_0008).unwrap();
    od.set_u8(0x1A00, 0, 1).unwrap();
    let node = Node::new(NodeConfig::new(NodeId(0x10)), od, bus).unwrap();
    let od = node.od();

    // Bits 11..30 must be zero.
    assert_eq!(
        od.write_value(0x1800, 1, Origin::Internal, &0x0010_0190_u32.to_le_bytes()).err(),
        Some(OdError::InvalidValue)
    );
    // Restricted identifier.
    assert_eq!(
        od.write_value(0x1800, 1, Origin::Internal, &0x0000_0601_u32.to_le_bytes()).err(),
        Some(OdError::InvalidValue)
    );
    // While valid, the identifier cannot change.
    assert_eq!(
        od.write_value(0x1800, 1, Origin::Internal, &0x0000_0211_u32.to_le_bytes()).err(),
        Some(OdError::InvalidValue)
    );
    // Invalidate, move, revalidate.
    od.write_value(0x1800, 1, Origin::Internal, &0x8000_0190_u32.to_le_bytes()).unwrap();
    od.write_value(0x1800, 1, Origin::Internal, &0x0000_0191_u32.to_le_bytes()).unwrap();

    // Mapping writes are rejected while the PDO is valid...
    assert_eq!(
        od.write_value(0x1A00, 1, Origin::Internal, &0x2001_0008_u32.to_le_bytes()).err(),
        Some(OdError::UnsuppAccess)
    );
    // ...except count-to-zero.
    od.write_value(0x1A00, 0, Origin::Internal, &[0]).unwrap();
}

#[test]
fn test_transmission_type_bounds() {
    use canopen_rs::od::{Origin, OdError};
    let wire = VirtualWire::new();
    let bus = station(&wire);
    let od = od_with_app_entry(NodeId(0x10));
    let node = Node::new(NodeConfig::new(NodeId(0x10)), od, bus).unwrap();

    for reserved in [241u8, 247, 253] {
        assert_eq!(
            node.od().write_value(0x1800, 2, Origin::Internal, &[reserved]).err(),
            Some(OdError::InvalidValue)
        );
    }
    for valid in [0u8, 1, 240, 254, 255] {
        node.od().write_value(0x1800, 2, Origin::Internal, &[valid]).unwrap();
    }
}

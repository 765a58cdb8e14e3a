// crates/canopen-rs/tests/nmt_heartbeat_test.rs
//
// Heartbeat supervision and NMT reset behaviour through a whole node.

mod simulator;

use canopen_rs::emcy::errors;
use canopen_rs::nmt::{NmtCommand, NmtControl, ResetRequest};
use canopen_rs::{CanFrame, Node, NodeConfig, NodeId, NmtState, ObjectDictionary};
use simulator::{VirtualWire, station};

fn make_node(node_id: u8, control: NmtControl) -> (Node, std::sync::Arc<VirtualWire>, std::sync::Arc<canopen_rs::BusManager>) {
    let wire = VirtualWire::new();
    let bus = station(&wire);
    let injector = station(&wire);
    let mut od = ObjectDictionary::new();
    canopen_rs::od::populate_communication_profile(&mut od, NodeId(node_id));
    let mut config = NodeConfig::new(NodeId(node_id));
    config.nmt_control = control;
    let node = Node::new(config, od, bus).unwrap();
    (node, wire, injector)
}

fn run(node: &mut Node, wire: &std::sync::Arc<VirtualWire>, steps: u32, dt_us: u32) -> ResetRequest {
    let mut last = ResetRequest::None;
    for _ in 0..steps {
        wire.deliver();
        let mut next = u32::MAX;
        let reset = node.process(dt_us, &mut next);
        if reset != ResetRequest::None {
            last = reset;
        }
        wire.deliver();
    }
    last
}

#[test]
fn test_heartbeat_timeout_then_remote_reset_detection() {
    let (mut node, wire, injector) = make_node(0x0A, NmtControl::default());
    // Monitor node 0x11 with a 500 ms period.
    node.od().set_u32(0x1016, 1, (0x11 << 16) | 500).unwrap();
    run(&mut node, &wire, 1, 1000);
    wire.clear_history();

    // Three healthy Operational heartbeats, 100 ms apart.
    for _ in 0..3 {
        injector.send(&CanFrame::new(0x711, &[5])).unwrap();
        run(&mut node, &wire, 100, 1000);
    }
    assert!(wire.history_for(0x08A).is_empty());

    // 600 ms of silence: the consumer escalates to EMCY.
    run(&mut node, &wire, 600, 1000);
    let emcys = wire.history_for(0x08A);
    assert_eq!(emcys.len(), 1);
    assert_eq!(u16::from_le_bytes([emcys[0].data[0], emcys[0].data[1]]), errors::ERR_HEARTBEAT);
    assert_eq!(emcys[0].data[3], errors::EM_HEARTBEAT_CONSUMER);
    assert_eq!(emcys[0].data[4], 0x11);

    // The remote comes back with a boot-up frame: reset detection fires.
    injector.send(&CanFrame::new(0x711, &[0])).unwrap();
    run(&mut node, &wire, 2, 1000);
    let emcys = wire.history_for(0x08A);
    let reset_emcy = emcys
        .iter()
        .find(|f| f.data[3] == errors::EM_HB_CONSUMER_REMOTE_RESET)
        .expect("remote-reset emergency");
    assert_eq!(reset_emcy.data[4], 0x11);
}

#[test]
fn test_nmt_reset_node_sequence() {
    let (mut node, wire, injector) = make_node(0x10, NmtControl::default());
    run(&mut node, &wire, 1, 1000);
    injector.send(&CanFrame::new(0x000, &[1, 0x10])).unwrap();
    run(&mut node, &wire, 1, 1000);
    assert_eq!(node.nmt_state(), NmtState::Operational);
    wire.clear_history();

    // Master resets the node.
    injector.send(&CanFrame::new(0x000, &[0x81, 0x10])).unwrap();
    let reset = run(&mut node, &wire, 1, 1000);
    assert_eq!(reset, ResetRequest::Application);

    // The embedder acts on it; reinitialising communication brings the node
    // back through Initializing with a fresh boot-up heartbeat.
    node.reset_communication();
    run(&mut node, &wire, 2, 1000);
    let heartbeats = wire.history_for(0x710);
    assert_eq!(heartbeats[0].payload(), &[0]);
    assert_eq!(node.nmt_state(), NmtState::PreOperational);
}

#[test]
fn test_startup_to_operational_flag() {
    let (mut node, wire, _injector) =
        make_node(0x10, NmtControl::STARTUP_TO_OPERATIONAL);
    run(&mut node, &wire, 1, 1000);
    assert_eq!(node.nmt_state(), NmtState::Operational);
}

#[test]
fn test_heartbeat_producer_runs_in_stopped_state() {
    let (mut node, wire, injector) = make_node(0x10, NmtControl::default());
    node.od().set_u16(0x1017, 0, 50).unwrap();
    run(&mut node, &wire, 1, 1000);
    injector.send(&CanFrame::new(0x000, &[2, 0x10])).unwrap();
    run(&mut node, &wire, 1, 1000);
    assert_eq!(node.nmt_state(), NmtState::Stopped);
    wire.clear_history();

    run(&mut node, &wire, 200, 1000);
    let heartbeats = wire.history_for(0x710);
    assert!(heartbeats.len() >= 3);
    assert!(heartbeats.iter().all(|f| f.payload() == [4]));
}

#[test]
fn test_sdo_ignored_while_stopped() {
    let (mut node, wire, injector) = make_node(0x10, NmtControl::default());
    run(&mut node, &wire, 1, 1000);
    injector.send(&CanFrame::new(0x000, &[2, 0x10])).unwrap();
    run(&mut node, &wire, 1, 1000);
    wire.clear_history();

    injector
        .send(&CanFrame::new(0x610, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]))
        .unwrap();
    run(&mut node, &wire, 5, 1000);
    assert!(wire.history_for(0x590).is_empty());
}

// crates/canopen-rs/src/od/predefined.rs

use super::entry::{Attribute, Object, ObjectEntry, Variable};
use super::{ObjectDictionary, OdError};
use crate::types::{COB_EMCY, COB_RPDO, COB_SDO_RX, COB_SDO_TX, COB_SYNC, COB_TIME, COB_TPDO, NodeId};
use std::collections::BTreeMap;

const PDO_SET_COUNT: u16 = 4;

fn collection(subs: Vec<(u8, Variable)>) -> BTreeMap<u8, Variable> {
    subs.into_iter().collect()
}

/// Populates the OD with the communication-profile objects that the standard
/// services require, using the CiA 301 default values for `node_id`.
/// Device-specific identification values and application objects are left to
/// the user (or the EDS loader) to insert.
pub fn populate_communication_profile(od: &mut ObjectDictionary, node_id: NodeId) {
    let id = node_id.0 as u32;

    od.insert(
        0x1000,
        ObjectEntry::new(
            "Device type",
            Object::Variable(Variable::unsigned32(Attribute::SDO_R, 0)),
        ),
    );
    od.insert(
        0x1001,
        ObjectEntry::new(
            "Error register",
            Object::Variable(Variable::unsigned8(Attribute::SDO_R | Attribute::TPDO, 0)),
        ),
    );
    // Pre-defined error field: eight history slots.
    let mut history = vec![(0u8, Variable::unsigned8(Attribute::SDO_RW, 0))];
    for sub in 1..=8 {
        history.push((sub, Variable::unsigned32(Attribute::SDO_R, 0)));
    }
    od.insert(
        0x1003,
        ObjectEntry::new("Pre-defined error field", Object::Array(collection(history))),
    );
    od.insert(
        0x1005,
        ObjectEntry::new(
            "COB-ID SYNC message",
            Object::Variable(Variable::unsigned32(Attribute::SDO_RW, COB_SYNC as u32)),
        ),
    );
    od.insert(
        0x1006,
        ObjectEntry::new(
            "Communication cycle period",
            Object::Variable(Variable::unsigned32(Attribute::SDO_RW, 0)),
        ),
    );
    od.insert(
        0x1007,
        ObjectEntry::new(
            "Synchronous window length",
            Object::Variable(Variable::unsigned32(Attribute::SDO_RW, 0)),
        ),
    );
    od.insert(
        0x1008,
        ObjectEntry::new(
            "Manufacturer device name",
            Object::Variable(Variable::visible_string(Attribute::SDO_R, "canopen-rs")),
        ),
    );
    od.insert(
        0x1009,
        ObjectEntry::new(
            "Manufacturer hardware version",
            Object::Variable(Variable::visible_string(Attribute::SDO_R, "1.0")),
        ),
    );
    od.insert(
        0x100A,
        ObjectEntry::new(
            "Manufacturer software version",
            Object::Variable(Variable::visible_string(Attribute::SDO_R, "1.0")),
        ),
    );
    od.insert(
        0x1010,
        ObjectEntry::new(
            "Store parameters",
            Object::Array(collection(vec![
                (0, Variable::unsigned8(Attribute::SDO_R, 3)),
                (1, Variable::unsigned32(Attribute::SDO_RW, 1)),
                (2, Variable::unsigned32(Attribute::SDO_RW, 1)),
                (3, Variable::unsigned32(Attribute::SDO_RW, 1)),
            ])),
        ),
    );
    od.insert(
        0x1011,
        ObjectEntry::new(
            "Restore default parameters",
            Object::Array(collection(vec![
                (0, Variable::unsigned8(Attribute::SDO_R, 3)),
                (1, Variable::unsigned32(Attribute::SDO_RW, 1)),
                (2, Variable::unsigned32(Attribute::SDO_RW, 1)),
                (3, Variable::unsigned32(Attribute::SDO_RW, 1)),
            ])),
        ),
    );
    od.insert(
        0x1012,
        ObjectEntry::new(
            "COB-ID time stamp object",
            Object::Variable(Variable::unsigned32(Attribute::SDO_RW, COB_TIME as u32)),
        ),
    );
    od.insert(
        0x1014,
        ObjectEntry::new(
            "COB-ID EMCY",
            Object::Variable(Variable::unsigned32(Attribute::SDO_RW, COB_EMCY as u32 + id)),
        ),
    );
    od.insert(
        0x1015,
        ObjectEntry::new(
            "Inhibit time EMCY",
            Object::Variable(Variable::unsigned16(Attribute::SDO_RW, 0)),
        ),
    );
    let mut consumers = vec![(0u8, Variable::unsigned8(Attribute::SDO_R, 8))];
    for sub in 1..=8 {
        consumers.push((sub, Variable::unsigned32(Attribute::SDO_RW, 0)));
    }
    od.insert(
        0x1016,
        ObjectEntry::new(
            "Consumer heartbeat time",
            Object::Array(collection(consumers)),
        ),
    );
    od.insert(
        0x1017,
        ObjectEntry::new(
            "Producer heartbeat time",
            Object::Variable(Variable::unsigned16(Attribute::SDO_RW, 0)),
        ),
    );
    od.insert(
        0x1018,
        ObjectEntry::new(
            "Identity object",
            Object::Record(collection(vec![
                (0, Variable::unsigned8(Attribute::SDO_R, 4)),
                (1, Variable::unsigned32(Attribute::SDO_R, 0)),
                (2, Variable::unsigned32(Attribute::SDO_R, 0)),
                (3, Variable::unsigned32(Attribute::SDO_R, 0)),
                (4, Variable::unsigned32(Attribute::SDO_R, 0)),
            ])),
        ),
    );
    od.insert(
        0x1019,
        ObjectEntry::new(
            "Synchronous counter overflow value",
            Object::Variable(Variable::unsigned8(Attribute::SDO_RW, 0)),
        ),
    );
    od.insert(
        0x1200,
        ObjectEntry::new(
            "SDO server parameter",
            Object::Record(collection(vec![
                (0, Variable::unsigned8(Attribute::SDO_R, 2)),
                (1, Variable::unsigned32(Attribute::SDO_R, COB_SDO_RX as u32 + id)),
                (2, Variable::unsigned32(Attribute::SDO_R, COB_SDO_TX as u32 + id)),
            ])),
        ),
    );
    od.insert(
        0x1280,
        ObjectEntry::new(
            "SDO client parameter",
            Object::Record(collection(vec![
                (0, Variable::unsigned8(Attribute::SDO_R, 3)),
                (1, Variable::unsigned32(Attribute::SDO_RW, 0x8000_0000)),
                (2, Variable::unsigned32(Attribute::SDO_RW, 0x8000_0000)),
                (3, Variable::unsigned8(Attribute::SDO_RW, 0)),
            ])),
        ),
    );

    for i in 0..PDO_SET_COUNT {
        let rpdo_cob = COB_RPDO[i as usize] as u32 + id;
        let tpdo_cob = COB_TPDO[i as usize] as u32 + id;
        od.insert(
            0x1400 + i,
            ObjectEntry::new(
                "RPDO communication parameter",
                Object::Record(collection(vec![
                    (0, Variable::unsigned8(Attribute::SDO_R, 5)),
                    (1, Variable::unsigned32(Attribute::SDO_RW, rpdo_cob)),
                    (2, Variable::unsigned8(Attribute::SDO_RW, 255)),
                    (3, Variable::unsigned16(Attribute::SDO_RW, 0)),
                    (5, Variable::unsigned16(Attribute::SDO_RW, 0)),
                ])),
            ),
        );
        od.insert(0x1600 + i, mapping_entry("RPDO mapping parameter"));
        od.insert(
            0x1800 + i,
            ObjectEntry::new(
                "TPDO communication parameter",
                Object::Record(collection(vec![
                    (0, Variable::unsigned8(Attribute::SDO_R, 6)),
                    (1, Variable::unsigned32(Attribute::SDO_RW, tpdo_cob)),
                    (2, Variable::unsigned8(Attribute::SDO_RW, 255)),
                    (3, Variable::unsigned16(Attribute::SDO_RW, 0)),
                    (5, Variable::unsigned16(Attribute::SDO_RW, 0)),
                    (6, Variable::unsigned8(Attribute::SDO_RW, 0)),
                ])),
            ),
        );
        od.insert(0x1A00 + i, mapping_entry("TPDO mapping parameter"));
    }
}

fn mapping_entry(name: &str) -> ObjectEntry {
    let mut subs = vec![(0u8, Variable::unsigned8(Attribute::SDO_RW, 0))];
    for sub in 1..=8 {
        subs.push((sub, Variable::unsigned32(Attribute::SDO_RW, 0)));
    }
    ObjectEntry::new(name, Object::Array(collection(subs)))
}

/// Validates that the OD contains all objects a node cannot run without.
pub fn validate_mandatory_objects(od: &ObjectDictionary) -> Result<(), OdError> {
    const MANDATORY_OBJECTS: &[u16] = &[
        0x1000, // Device type
        0x1001, // Error register
        0x1017, // Producer heartbeat time
        0x1018, // Identity object
    ];
    for &index in MANDATORY_OBJECTS {
        if !od.contains(index) {
            return Err(OdError::OdMissing);
        }
    }
    Ok(())
}

// crates/canopen-rs-eds/src/writer.rs

//! Serializes an Object Dictionary back into EDS text, the inverse of the
//! parser for the object-describing fields (name, object type, data type,
//! access, mapping flag, value and limits).

use canopen_rs::od::{Attribute, DataType, Object, ObjectDictionary, ObjectEntry, Variable};
use std::fmt::Write as _;

/// Renders the dictionary as EDS text.
pub fn serialize_od(od: &ObjectDictionary) -> String {
    let mut out = String::new();
    out.push_str("[FileInfo]\n");
    out.push_str("FileName=generated.eds\n");
    out.push_str("Description=Generated by canopen-rs-eds\n\n");

    for index in od.indices() {
        od.with_entry(index, |entry| write_entry(&mut out, index, entry));
    }
    out
}

fn write_entry(out: &mut String, index: u16, entry: &ObjectEntry) {
    match &entry.object {
        Object::Variable(var) => {
            let _ = writeln!(out, "[{:04X}]", index);
            let _ = writeln!(out, "ParameterName={}", entry.name);
            let object_type = if var.data_type == DataType::Domain { 2 } else { 7 };
            let _ = writeln!(out, "ObjectType={}", object_type);
            write_variable(out, var);
            out.push('\n');
        }
        Object::Array(subs) | Object::Record(subs) => {
            let object_type = if matches!(entry.object, Object::Array(_)) { 8 } else { 9 };
            let _ = writeln!(out, "[{:04X}]", index);
            let _ = writeln!(out, "ParameterName={}", entry.name);
            let _ = writeln!(out, "ObjectType={}", object_type);
            let _ = writeln!(out, "SubNumber={}", subs.len());
            out.push('\n');
            for (sub, var) in subs {
                let _ = writeln!(out, "[{:04X}sub{:X}]", index, sub);
                let _ = writeln!(out, "ParameterName={} sub{:X}", entry.name, sub);
                write_variable(out, var);
                out.push('\n');
            }
        }
    }
}

fn write_variable(out: &mut String, var: &Variable) {
    let _ = writeln!(out, "DataType=0x{:04X}", var.data_type.code());
    let _ = writeln!(out, "AccessType={}", access_string(var.attribute));
    let _ = writeln!(
        out,
        "PDOMapping={}",
        if var.attribute.contains(Attribute::TPDO) || var.attribute.contains(Attribute::RPDO) {
            1
        } else {
            0
        }
    );
    if !var.data.is_empty() || var.data_type.fixed_len().is_none() {
        let _ = writeln!(out, "DefaultValue={}", format_value(var.data_type, &var.data));
    }
    if let Some(limit) = &var.high_limit {
        let _ = writeln!(out, "HighLimit={}", format_value(var.data_type, limit));
    }
    if let Some(limit) = &var.low_limit {
        let _ = writeln!(out, "LowLimit={}", format_value(var.data_type, limit));
    }
}

fn access_string(attribute: Attribute) -> &'static str {
    if attribute.contains(Attribute::SDO_RW) {
        "rw"
    } else if attribute.contains(Attribute::SDO_W) {
        "wo"
    } else {
        "ro"
    }
}

/// Formats a little-endian buffer in the textual form the parser accepts:
/// signed types as decimal, unsigned as hex, strings verbatim, binary data
/// as a hex string.
pub(crate) fn format_value(data_type: DataType, data: &[u8]) -> String {
    match data_type {
        DataType::VisibleString => String::from_utf8_lossy(data).into_owned(),
        DataType::OctetString | DataType::Domain | DataType::UnicodeString => {
            let mut out = String::from("0x");
            for byte in data {
                let _ = write!(out, "{:02x}", byte);
            }
            out
        }
        DataType::Real32 => {
            let value = data
                .try_into()
                .map(f32::from_le_bytes)
                .unwrap_or_default();
            format!("{}", value)
        }
        DataType::Real64 => {
            let value = data
                .try_into()
                .map(f64::from_le_bytes)
                .unwrap_or_default();
            format!("{}", value)
        }
        DataType::Integer8 | DataType::Integer16 | DataType::Integer32 | DataType::Integer64 => {
            let mut buf = if data.last().is_some_and(|b| b & 0x80 != 0) {
                [0xFFu8; 16]
            } else {
                [0u8; 16]
            };
            buf[..data.len()].copy_from_slice(data);
            format!("{}", i128::from_le_bytes(buf))
        }
        _ => {
            let mut buf = [0u8; 16];
            buf[..data.len().min(16)].copy_from_slice(&data[..data.len().min(16)]);
            format!("0x{:X}", u128::from_le_bytes(buf))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::load_eds_from_str;
    use canopen_rs::od::populate_communication_profile;
    use canopen_rs::types::NodeId;

    #[test]
    fn test_format_values() {
        assert_eq!(format_value(DataType::Unsigned16, &[0x34, 0x12]), "0x1234");
        assert_eq!(format_value(DataType::Integer16, &[0xF6, 0xFF]), "-10");
        assert_eq!(format_value(DataType::VisibleString, b"abc"), "abc");
        assert_eq!(format_value(DataType::OctetString, &[0xDE, 0xAD]), "0xdead");
    }

    #[test]
    fn test_roundtrip_communication_profile() {
        // parse(serialize(od)) preserves names, object kinds, data types,
        // access attributes and values.
        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId(0x10));

        let text = serialize_od(&od);
        let reparsed = load_eds_from_str(&text, NodeId(0x10)).unwrap();

        for index in od.indices() {
            assert!(reparsed.contains(index), "entry {:#06X} lost", index);
            od.with_entry(index, |original| {
                reparsed.with_entry(index, |copy| {
                    assert_eq!(original.name, copy.name, "name of {:#06X}", index);
                    assert_eq!(
                        original.sub_count(),
                        copy.sub_count(),
                        "sub count of {:#06X}",
                        index
                    );
                    for sub in 0..=original.sub_count() {
                        let Some(var) = original.variable(sub) else { continue };
                        let var_copy = copy.variable(sub).unwrap();
                        assert_eq!(var.data_type, var_copy.data_type, "{:#06X}:{}", index, sub);
                        assert_eq!(var.data, var_copy.data, "{:#06X}:{}", index, sub);
                        assert_eq!(
                            var.attribute.contains(Attribute::SDO_R),
                            var_copy.attribute.contains(Attribute::SDO_R)
                        );
                        assert_eq!(
                            var.attribute.contains(Attribute::SDO_W),
                            var_copy.attribute.contains(Attribute::SDO_W)
                        );
                    }
                })
                .unwrap();
            })
            .unwrap();
        }
    }

    #[test]
    fn test_roundtrip_keeps_string_entries() {
        let mut od = ObjectDictionary::new();
        populate_communication_profile(&mut od, NodeId(1));
        let text = serialize_od(&od);
        let reparsed = load_eds_from_str(&text, NodeId(1)).unwrap();
        assert_eq!(
            reparsed
                .read_value(0x1008, 0, canopen_rs::od::Origin::Internal)
                .unwrap(),
            b"canopen-rs".to_vec()
        );
    }
}

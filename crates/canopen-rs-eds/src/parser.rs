// crates/canopen-rs-eds/src/parser.rs

//! Line-based reader for the INI-shaped EDS format. Object sections are
//! `[<4-hex-index>]` with sub-entries in `[<index>sub<hex-sub>]`; all other
//! sections (FileInfo, DeviceInfo, ...) are carried along untouched.

use crate::error::{EdsError, hex_error, number_error};
use canopen_rs::od::{Attribute, DataType, Object, ObjectDictionary, ObjectEntry, Variable};
use canopen_rs::types::NodeId;
use log::warn;
use std::collections::BTreeMap;

pub(crate) type Section = BTreeMap<String, String>;

/// Loads an EDS file from disk, expanding `$NODEID` tokens with `node_id`.
pub fn load_eds_file(
    path: impl AsRef<std::path::Path>,
    node_id: NodeId,
) -> Result<ObjectDictionary, EdsError> {
    let text = std::fs::read_to_string(path)?;
    load_eds_from_str(&text, node_id)
}

/// Parses EDS text into an Object Dictionary.
pub fn load_eds_from_str(text: &str, node_id: NodeId) -> Result<ObjectDictionary, EdsError> {
    let sections = split_sections(text)?;
    let mut od = ObjectDictionary::new();

    for (name, keys) in &sections {
        let Some(index) = object_index(name) else {
            continue;
        };
        let object_type = match keys.get("objecttype") {
            Some(raw) => parse_u16(raw).map_err(number_error(name, "ObjectType"))? as u8,
            None => 0x07,
        };
        let parameter_name = keys
            .get("parametername")
            .cloned()
            .ok_or(EdsError::MissingKey {
                section: name.clone(),
                key: "ParameterName",
            })?;

        let object = match object_type {
            // VAR and DOMAIN: the section itself describes the variable.
            0x07 | 0x02 => Object::Variable(build_variable(name, keys, node_id)?),
            // ARRAY and RECORD: sub-entries live in their own sections.
            0x08 | 0x09 => {
                let mut subs = BTreeMap::new();
                for sub in 0..=255u8 {
                    let sub_name = format!("{}sub{:x}", name, sub);
                    if let Some(sub_keys) = sections.get(&sub_name) {
                        subs.insert(sub, build_variable(&sub_name, sub_keys, node_id)?);
                    }
                }
                if let Some(raw) = keys.get("subnumber") {
                    let declared = parse_u16(raw).map_err(number_error(name, "SubNumber"))?;
                    if declared as usize != subs.len() {
                        warn!(
                            "[{}]: SubNumber says {} sub-entries, found {}",
                            name,
                            declared,
                            subs.len()
                        );
                    }
                }
                if object_type == 0x08 {
                    Object::Array(subs)
                } else {
                    Object::Record(subs)
                }
            }
            other => {
                return Err(EdsError::UnknownObjectType {
                    section: name.clone(),
                    code: other,
                });
            }
        };
        od.insert(index, ObjectEntry::new(&parameter_name, object));
    }

    Ok(od)
}

/// Splits the text into sections of lowercase key/value pairs. Keys are
/// case-insensitive in EDS files; values keep their spelling.
pub(crate) fn split_sections(text: &str) -> Result<BTreeMap<String, Section>, EdsError> {
    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    let mut current: Option<String> = None;

    for (number, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or(EdsError::MalformedSection { line: number + 1 })?;
            let name = name.trim().to_ascii_lowercase();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        let Some(section) = &current else {
            // Junk before the first section is tolerated.
            continue;
        };
        let (key, value) = line
            .split_once('=')
            .ok_or(EdsError::MalformedLine { line: number + 1 })?;
        sections
            .get_mut(section)
            .unwrap()
            .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(sections)
}

/// `[1a00]` -> 0x1A00; anything that is not exactly four hex digits is not
/// an object section.
fn object_index(section: &str) -> Option<u16> {
    if section.len() == 4 {
        u16::from_str_radix(section, 16).ok()
    } else {
        None
    }
}

fn parse_u16(s: &str) -> Result<u16, core::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn build_variable(section: &str, keys: &Section, node_id: NodeId) -> Result<Variable, EdsError> {
    let data_type_code = keys
        .get("datatype")
        .map(|raw| parse_u16(raw).map_err(number_error(section, "DataType")))
        .transpose()?
        .unwrap_or(DataType::Domain.code());
    let data_type = DataType::from_code(data_type_code).ok_or(EdsError::UnknownDataType {
        section: section.to_string(),
        code: data_type_code,
    })?;

    let access = keys.get("accesstype").map(String::as_str).unwrap_or("rw");
    let mappable = keys
        .get("pdomapping")
        .map(|v| v.trim() == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let attribute = access_attribute(section, access, mappable, data_type)?;

    let data = match keys.get("defaultvalue") {
        Some(raw) => value_bytes(section, "DefaultValue", raw, data_type, node_id)?,
        None => vec![0; data_type.fixed_len().unwrap_or(0)],
    };

    let mut variable = Variable::new(data_type, attribute, data.clone());
    variable.default_value = Some(data);
    if let Some(raw) = keys.get("highlimit") {
        variable.high_limit = Some(value_bytes(section, "HighLimit", raw, data_type, node_id)?);
    }
    if let Some(raw) = keys.get("lowlimit") {
        variable.low_limit = Some(value_bytes(section, "LowLimit", raw, data_type, node_id)?);
    }
    Ok(variable)
}

fn access_attribute(
    section: &str,
    access: &str,
    mappable: bool,
    data_type: DataType,
) -> Result<Attribute, EdsError> {
    let mut attribute = match access.to_ascii_lowercase().as_str() {
        "ro" | "const" => Attribute::SDO_R,
        "wo" => Attribute::SDO_W,
        "rw" | "rww" | "rwr" => Attribute::SDO_RW,
        other => {
            return Err(EdsError::UnknownAccessType {
                section: section.to_string(),
                value: other.to_string(),
            });
        }
    };
    if mappable {
        // Mapping direction follows the access: what the network can write
        // maps into RPDOs, what it can read maps into TPDOs.
        match access.to_ascii_lowercase().as_str() {
            "rww" => attribute = attribute | Attribute::RPDO,
            "rwr" => attribute = attribute | Attribute::TPDO,
            _ => {
                if attribute.contains(Attribute::SDO_W) {
                    attribute = attribute | Attribute::RPDO;
                }
                if attribute.contains(Attribute::SDO_R) {
                    attribute = attribute | Attribute::TPDO;
                }
            }
        }
    }
    if data_type.fixed_len().is_some_and(|len| len > 1) {
        attribute = attribute | Attribute::MULTI_BYTE;
    }
    if matches!(
        data_type,
        DataType::VisibleString | DataType::UnicodeString | DataType::OctetString
    ) {
        attribute = attribute | Attribute::STR_SHORTER;
    }
    Ok(attribute)
}

/// Converts a textual EDS value into the canonical little-endian buffer.
/// `$NODEID+<n>` (either operand order) expands to the concrete node id.
pub(crate) fn value_bytes(
    section: &str,
    key: &'static str,
    raw: &str,
    data_type: DataType,
    node_id: NodeId,
) -> Result<Vec<u8>, EdsError> {
    let raw = raw.trim();
    match data_type {
        DataType::VisibleString => Ok(raw.as_bytes().to_vec()),
        DataType::UnicodeString => {
            if let Some(hex) = raw.strip_prefix("0x") {
                hex::decode(hex).map_err(hex_error(section, key))
            } else {
                Ok(raw
                    .encode_utf16()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect())
            }
        }
        DataType::OctetString | DataType::Domain => {
            if raw.is_empty() {
                return Ok(Vec::new());
            }
            let hex = raw.strip_prefix("0x").unwrap_or(raw);
            hex::decode(hex).map_err(hex_error(section, key))
        }
        DataType::Real32 => raw
            .parse::<f32>()
            .map(|v| v.to_le_bytes().to_vec())
            .map_err(|_| EdsError::InvalidValue {
                section: section.to_string(),
                key,
            }),
        DataType::Real64 => raw
            .parse::<f64>()
            .map(|v| v.to_le_bytes().to_vec())
            .map_err(|_| EdsError::InvalidValue {
                section: section.to_string(),
                key,
            }),
        _ => {
            let value = parse_scalar(raw, node_id).ok_or(EdsError::InvalidValue {
                section: section.to_string(),
                key,
            })?;
            let width = data_type.fixed_len().unwrap_or(4);
            Ok(value.to_le_bytes()[..width].to_vec())
        }
    }
}

/// Parses an integer expression, summing `$NODEID` and numeric operands.
fn parse_scalar(raw: &str, node_id: NodeId) -> Option<i128> {
    let mut total: i128 = 0;
    for part in raw.split('+') {
        let part = part.trim();
        if part.eq_ignore_ascii_case("$nodeid") {
            total += node_id.0 as i128;
        } else if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
            total += i128::from_str_radix(hex, 16).ok()?;
        } else if let Some(rest) = part.strip_prefix('-') {
            if let Some(hex) = rest.strip_prefix("0x") {
                total -= i128::from_str_radix(hex, 16).ok()?;
            } else {
                total -= rest.parse::<i128>().ok()?;
            }
        } else {
            total += part.parse::<i128>().ok()?;
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[FileInfo]
FileName=sample.eds
Description=Parser test device

[1000]
ParameterName=Device type
ObjectType=7
DataType=0x0007
AccessType=ro
DefaultValue=0x000F0191
PDOMapping=0

[1017]
ParameterName=Producer heartbeat time
DataType=0x0006
AccessType=rw
DefaultValue=0
PDOMapping=0

[1200]
ParameterName=SDO server parameter
ObjectType=9
SubNumber=3

[1200sub0]
ParameterName=Highest sub-index supported
DataType=0x0005
AccessType=ro
DefaultValue=2

[1200sub1]
ParameterName=COB-ID client to server
DataType=0x0007
AccessType=ro
DefaultValue=$NODEID+0x600

[1200sub2]
ParameterName=COB-ID server to client
DataType=0x0007
AccessType=ro
DefaultValue=0x580+$NODEID

[6000]
ParameterName=Process value
DataType=0x0003
AccessType=rw
PDOMapping=1
DefaultValue=-10
HighLimit=100
LowLimit=-100
"#;

    #[test]
    fn test_parse_simple_variable() {
        let od = load_eds_from_str(SAMPLE, NodeId(0x10)).unwrap();
        assert_eq!(od.u32(0x1000, 0).unwrap(), 0x000F_0191);
        assert_eq!(od.u16(0x1017, 0).unwrap(), 0);
        od.with_entry(0x1000, |entry| {
            assert_eq!(entry.name, "Device type");
        })
        .unwrap();
    }

    #[test]
    fn test_nodeid_expansion_both_orders() {
        let od = load_eds_from_str(SAMPLE, NodeId(0x10)).unwrap();
        assert_eq!(od.u32(0x1200, 1).unwrap(), 0x610);
        assert_eq!(od.u32(0x1200, 2).unwrap(), 0x590);
    }

    #[test]
    fn test_record_sub_entries_and_count() {
        let od = load_eds_from_str(SAMPLE, NodeId(1)).unwrap();
        assert_eq!(od.u8(0x1200, 0).unwrap(), 2);
        assert_eq!(od.sub_count(0x1200).unwrap(), 2);
    }

    #[test]
    fn test_signed_default_and_limits() {
        let od = load_eds_from_str(SAMPLE, NodeId(1)).unwrap();
        od.with_entry(0x6000, |entry| {
            let var = entry.variable(0).unwrap();
            assert_eq!(var.data_type, DataType::Integer16);
            assert_eq!(var.data, (-10i16).to_le_bytes().to_vec());
            assert_eq!(var.high_limit, Some(100i16.to_le_bytes().to_vec()));
            assert_eq!(var.low_limit, Some((-100i16).to_le_bytes().to_vec()));
            assert!(var.attribute.contains(Attribute::RPDO));
            assert!(var.attribute.contains(Attribute::TPDO));
        })
        .unwrap();
    }

    #[test]
    fn test_missing_parameter_name_fails() {
        let result = load_eds_from_str("[2000]\nDataType=0x0005\n", NodeId(1));
        assert!(matches!(result, Err(EdsError::MissingKey { .. })));
    }

    #[test]
    fn test_unknown_data_type_fails() {
        let result =
            load_eds_from_str("[2000]\nParameterName=X\nDataType=0x00FF\n", NodeId(1));
        assert!(matches!(result, Err(EdsError::UnknownDataType { .. })));
    }

    #[test]
    fn test_malformed_section_reports_line() {
        let result = load_eds_from_str("[2000\nParameterName=X\n", NodeId(1));
        assert!(matches!(
            result,
            Err(EdsError::MalformedSection { line: 1 })
        ));
    }
}

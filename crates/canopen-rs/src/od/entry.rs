// crates/canopen-rs/src/od/entry.rs

use super::stream::{Stream, Transfer, default_read, default_write};
use super::{Extension, OdError};
use std::collections::BTreeMap;

/// CANopen data types of Object Dictionary variables.
/// (CiA 301, Section 7.1; numeric codes from CiA 306)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Integer8,
    Integer16,
    Integer32,
    Integer64,
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Real32,
    Real64,
    VisibleString,
    OctetString,
    UnicodeString,
    Domain,
}

impl DataType {
    /// The exact byte length of fixed-width types; `None` for strings and
    /// DOMAIN data.
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Integer8 | DataType::Unsigned8 => Some(1),
            DataType::Integer16 | DataType::Unsigned16 => Some(2),
            DataType::Integer32 | DataType::Unsigned32 | DataType::Real32 => Some(4),
            DataType::Integer64 | DataType::Unsigned64 | DataType::Real64 => Some(8),
            DataType::VisibleString
            | DataType::OctetString
            | DataType::UnicodeString
            | DataType::Domain => None,
        }
    }

    /// The numeric data-type code used by EDS files.
    pub fn code(&self) -> u16 {
        match self {
            DataType::Boolean => 0x0001,
            DataType::Integer8 => 0x0002,
            DataType::Integer16 => 0x0003,
            DataType::Integer32 => 0x0004,
            DataType::Unsigned8 => 0x0005,
            DataType::Unsigned16 => 0x0006,
            DataType::Unsigned32 => 0x0007,
            DataType::Real32 => 0x0008,
            DataType::VisibleString => 0x0009,
            DataType::OctetString => 0x000A,
            DataType::UnicodeString => 0x000B,
            DataType::Domain => 0x000F,
            DataType::Real64 => 0x0011,
            DataType::Integer64 => 0x0015,
            DataType::Unsigned64 => 0x001B,
        }
    }

    pub fn from_code(code: u16) -> Option<DataType> {
        match code {
            0x0001 => Some(DataType::Boolean),
            0x0002 => Some(DataType::Integer8),
            0x0003 => Some(DataType::Integer16),
            0x0004 => Some(DataType::Integer32),
            0x0005 => Some(DataType::Unsigned8),
            0x0006 => Some(DataType::Unsigned16),
            0x0007 => Some(DataType::Unsigned32),
            0x0008 => Some(DataType::Real32),
            0x0009 => Some(DataType::VisibleString),
            0x000A => Some(DataType::OctetString),
            0x000B => Some(DataType::UnicodeString),
            0x000F => Some(DataType::Domain),
            0x0011 => Some(DataType::Real64),
            0x0015 => Some(DataType::Integer64),
            0x001B => Some(DataType::Unsigned64),
            _ => None,
        }
    }
}

/// Access attributes of an Object Dictionary variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attribute(pub u8);

impl Attribute {
    /// Readable over SDO.
    pub const SDO_R: Attribute = Attribute(0x01);
    /// Writable over SDO.
    pub const SDO_W: Attribute = Attribute(0x02);
    /// Readable and writable over SDO.
    pub const SDO_RW: Attribute = Attribute(0x03);
    /// Mappable into a TPDO.
    pub const TPDO: Attribute = Attribute(0x04);
    /// Mappable into an RPDO.
    pub const RPDO: Attribute = Attribute(0x08);
    /// Multi-byte numeric value (stored little-endian).
    pub const MULTI_BYTE: Attribute = Attribute(0x10);
    /// String entry that accepts shorter writes (zero padded).
    pub const STR_SHORTER: Attribute = Attribute(0x20);

    pub fn contains(self, other: Attribute) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Attribute {
    type Output = Attribute;
    fn bitor(self, rhs: Attribute) -> Attribute {
        Attribute(self.0 | rhs.0)
    }
}

/// A single typed sub-entry: the canonical little-endian value buffer plus
/// its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub data_type: DataType,
    pub attribute: Attribute,
    /// Canonical little-endian value bytes. For fixed-width types the length
    /// always matches the declared type.
    pub data: Vec<u8>,
    pub default_value: Option<Vec<u8>>,
    pub low_limit: Option<Vec<u8>>,
    pub high_limit: Option<Vec<u8>>,
}

impl Variable {
    pub fn new(data_type: DataType, attribute: Attribute, data: Vec<u8>) -> Self {
        Self {
            data_type,
            attribute,
            data,
            default_value: None,
            low_limit: None,
            high_limit: None,
        }
    }

    pub fn unsigned8(attribute: Attribute, value: u8) -> Self {
        Self::new(
            DataType::Unsigned8,
            attribute,
            value.to_le_bytes().to_vec(),
        )
    }

    pub fn unsigned16(attribute: Attribute, value: u16) -> Self {
        Self::new(
            DataType::Unsigned16,
            attribute | Attribute::MULTI_BYTE,
            value.to_le_bytes().to_vec(),
        )
    }

    pub fn unsigned32(attribute: Attribute, value: u32) -> Self {
        Self::new(
            DataType::Unsigned32,
            attribute | Attribute::MULTI_BYTE,
            value.to_le_bytes().to_vec(),
        )
    }

    pub fn visible_string(attribute: Attribute, value: &str) -> Self {
        Self::new(
            DataType::VisibleString,
            attribute | Attribute::STR_SHORTER,
            value.as_bytes().to_vec(),
        )
    }

    pub fn domain(attribute: Attribute) -> Self {
        Self::new(DataType::Domain, attribute, Vec::new())
    }
}

/// The structural part of an Object Dictionary entry.
///
/// Arrays and records keep their sub-entries in a map keyed by sub-index so
/// reserved gaps (common in the communication profile records) need no
/// placeholder values. Sub-index 0 conventionally holds the highest
/// populated sub-index.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Variable(Variable),
    Array(BTreeMap<u8, Variable>),
    Record(BTreeMap<u8, Variable>),
}

/// A complete entry in the Object Dictionary.
pub struct ObjectEntry {
    /// A descriptive name for the object.
    pub name: String,
    pub object: Object,
    /// Optional read/write hooks installed by a service that owns this entry.
    pub extension: Option<Extension>,
    /// One event-detection flag bit per sub-index, consumed by TPDOs.
    pdo_flags: [u8; 32],
}

impl ObjectEntry {
    pub fn new(name: &str, object: Object) -> Self {
        Self {
            name: name.to_string(),
            object,
            extension: None,
            pdo_flags: [0u8; 32],
        }
    }

    pub fn variable(&self, sub_index: u8) -> Option<&Variable> {
        match &self.object {
            Object::Variable(v) => (sub_index == 0).then_some(v),
            Object::Array(subs) | Object::Record(subs) => subs.get(&sub_index),
        }
    }

    pub fn variable_mut(&mut self, sub_index: u8) -> Option<&mut Variable> {
        match &mut self.object {
            Object::Variable(v) => (sub_index == 0).then_some(v),
            Object::Array(subs) | Object::Record(subs) => subs.get_mut(&sub_index),
        }
    }

    /// Number of sub-entries above sub-index 0.
    pub fn sub_count(&self) -> u8 {
        match &self.object {
            Object::Variable(_) => 1,
            Object::Array(subs) | Object::Record(subs) => {
                subs.keys().filter(|&&s| s > 0).count() as u8
            }
        }
    }

    /// The default read: copies from the entry buffer honouring the stream
    /// cursor. Available for extension hooks to delegate to.
    pub fn default_read(
        &self,
        stream: &mut Stream,
        buf: &mut [u8],
    ) -> Result<Transfer, OdError> {
        let var = self.variable(stream.sub_index).ok_or(OdError::SubNotExist)?;
        default_read(var, stream, buf)
    }

    /// The default write counterpart of [`ObjectEntry::default_read`].
    pub fn default_write(
        &mut self,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let var = self
            .variable_mut(stream.sub_index)
            .ok_or(OdError::SubNotExist)?;
        default_write(var, stream, data)
    }

    pub(crate) fn pdo_flag(&self, sub_index: u8) -> bool {
        self.pdo_flags[(sub_index >> 3) as usize] & (1 << (sub_index & 7)) != 0
    }

    pub(crate) fn set_pdo_flag(&mut self, sub_index: u8) {
        self.pdo_flags[(sub_index >> 3) as usize] |= 1 << (sub_index & 7);
    }

    pub(crate) fn clear_pdo_flag(&mut self, sub_index: u8) {
        self.pdo_flags[(sub_index >> 3) as usize] &= !(1 << (sub_index & 7));
    }
}

impl core::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("name", &self.name)
            .field("object", &self.object)
            .field(
                "extension",
                &if self.extension.is_some() {
                    "Some(<hooks>)"
                } else {
                    "None"
                },
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_lengths_match_types() {
        assert_eq!(DataType::Unsigned8.fixed_len(), Some(1));
        assert_eq!(DataType::Integer16.fixed_len(), Some(2));
        assert_eq!(DataType::Real64.fixed_len(), Some(8));
        assert_eq!(DataType::Domain.fixed_len(), None);
    }

    #[test]
    fn test_data_type_code_roundtrip() {
        for dt in [
            DataType::Boolean,
            DataType::Integer64,
            DataType::Unsigned32,
            DataType::VisibleString,
            DataType::Domain,
            DataType::Unsigned64,
        ] {
            assert_eq!(DataType::from_code(dt.code()), Some(dt));
        }
        assert_eq!(DataType::from_code(0x0C), None);
    }

    #[test]
    fn test_sub_count_ignores_sub_zero_and_gaps() {
        let mut subs = BTreeMap::new();
        subs.insert(0, Variable::unsigned8(Attribute::SDO_R, 6));
        subs.insert(1, Variable::unsigned32(Attribute::SDO_RW, 0));
        subs.insert(2, Variable::unsigned8(Attribute::SDO_RW, 0));
        // Sub-index 4 reserved: gap.
        subs.insert(5, Variable::unsigned16(Attribute::SDO_RW, 0));
        let entry = ObjectEntry::new("PDO_Comm", Object::Record(subs));
        assert_eq!(entry.sub_count(), 3);
    }

    #[test]
    fn test_pdo_flags_per_sub_index() {
        let entry_obj = Object::Variable(Variable::unsigned8(Attribute::SDO_RW, 0));
        let mut entry = ObjectEntry::new("Flags", entry_obj);
        assert!(!entry.pdo_flag(0));
        entry.set_pdo_flag(0);
        entry.set_pdo_flag(9);
        assert!(entry.pdo_flag(0));
        assert!(entry.pdo_flag(9));
        entry.clear_pdo_flag(9);
        assert!(!entry.pdo_flag(9));
        assert!(entry.pdo_flag(0));
    }
}

// crates/canopen-rs/src/pdo/mod.rs

pub mod rpdo;
pub mod tpdo;

pub use rpdo::Rpdo;
pub use tpdo::Tpdo;

use crate::od::{
    Attribute, ObjectDictionary, ObjectEntry, OdError, OdExtension, Origin, Stream, Transfer,
};
use crate::types::is_restricted_ident;
use log::warn;
use std::sync::{Arc, Mutex};

/// Largest payload a PDO can carry.
pub const PDO_PAYLOAD_MAX: usize = 8;

/// Mapping slots per PDO.
pub const PDO_MAP_MAX: usize = 8;

/// One 32-bit mapping word from a 16xxh/1Axxh entry:
/// `index << 16 | sub_index << 8 | length_bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub index: u16,
    pub sub_index: u8,
    pub length_bits: u8,
}

impl MappingEntry {
    pub fn from_u32(value: u32) -> Self {
        Self {
            index: (value >> 16) as u16,
            sub_index: ((value >> 8) & 0xFF) as u8,
            length_bits: (value & 0xFF) as u8,
        }
    }

    pub fn to_u32(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub_index as u32) << 8) | self.length_bits as u32
    }
}

/// State shared by RPDOs and TPDOs: validity, identifiers and the mapped
/// streams. Each stream's `offset` holds its mapped byte count, which may be
/// shorter than the full sub-entry.
pub(crate) struct PdoBase {
    pub valid: bool,
    pub mapped_count: u8,
    pub data_len: usize,
    pub predefined_ident: u16,
    pub configured_ident: u16,
    pub is_rpdo: bool,
    pub streams: [Stream; PDO_MAP_MAX],
    pub flag_refs: [Option<(u16, u8)>; PDO_MAP_MAX],
    /// First faulty mapping word, zero when the mapping is sound.
    pub erroneous_map: u32,
    /// Index of the communication parameter entry (1400h+/1800h+).
    pub comm_index: u16,
}

impl PdoBase {
    pub(crate) fn new(comm_index: u16, predefined_ident: u16, is_rpdo: bool) -> Self {
        Self {
            valid: false,
            mapped_count: 0,
            data_len: 0,
            predefined_ident,
            configured_ident: 0,
            is_rpdo,
            streams: core::array::from_fn(|_| Stream::invalid()),
            flag_refs: [None; PDO_MAP_MAX],
            erroneous_map: 0,
            comm_index,
        }
    }

    /// Derives validity and the configured identifier from a raw COB-ID
    /// value as stored in the OD. A stored base identifier (low seven bits
    /// clear) matching the pre-defined set expands to `base + node_id`.
    pub(crate) fn apply_cob_id(&mut self, value: u32) {
        let mut ident = (value & 0x7FF) as u16;
        if ident & 0x7F == 0 && self.predefined_ident != 0 && ident == self.predefined_ident & 0x780
        {
            ident = self.predefined_ident;
        }
        self.configured_ident = ident;
        self.valid = value & 0x8000_0000 == 0
            && ident != 0
            && self.mapped_count > 0
            && self.erroneous_map == 0;
    }

    /// Resolves one mapping word into the stream slot at `pos`.
    /// (Spec behaviour of the shared mapping engine: dummy entries below
    /// index 0x20, `NO_MAP` on attribute/alignment/length violations.)
    pub(crate) fn configure_map(
        &mut self,
        od: &ObjectDictionary,
        word: u32,
        pos: usize,
    ) -> Result<(), OdError> {
        let entry = MappingEntry::from_u32(word);
        if entry.length_bits as usize / 8 > PDO_PAYLOAD_MAX {
            return Err(OdError::MapLen);
        }
        let mapped_len = entry.length_bits as usize / 8;

        if entry.index < 0x20 && entry.sub_index == 0 {
            self.streams[pos] = Stream::dummy(mapped_len);
            self.flag_refs[pos] = None;
            return Ok(());
        }

        let mut stream = od.stream(entry.index, entry.sub_index, Origin::Internal)?;
        let wanted = if self.is_rpdo {
            Attribute::RPDO
        } else {
            Attribute::TPDO
        };
        if !stream.attribute.contains(wanted)
            || entry.length_bits % 8 != 0
            || stream.data_len < mapped_len
        {
            return Err(OdError::NoMap);
        }
        stream.offset = mapped_len;
        self.streams[pos] = stream;

        self.flag_refs[pos] = if !self.is_rpdo
            && od
                .with_entry(entry.index, |e| e.extension.is_some())
                .unwrap_or(false)
        {
            Some((entry.index, entry.sub_index))
        } else {
            None
        };
        Ok(())
    }

    /// Rebuilds all stream slots from the given mapping words and object
    /// count. Faulty slots are marked invalid, the first faulty word is
    /// latched in `erroneous_map`, and the caller escalates the returned
    /// error to EMCY.
    pub(crate) fn init_mapping(
        &mut self,
        od: &ObjectDictionary,
        words: &[u32; PDO_MAP_MAX],
        count: u8,
    ) -> Result<(), OdError> {
        let count = count.min(PDO_MAP_MAX as u8);
        self.erroneous_map = 0;
        let mut first_error = None;

        for (pos, &word) in words.iter().enumerate() {
            if let Err(e) = self.configure_map(od, word, pos) {
                self.streams[pos] = Stream::invalid();
                if (pos as u8) < count && first_error.is_none() {
                    self.erroneous_map = word;
                    first_error = Some(e);
                }
            }
        }

        let mut total = 0usize;
        for pos in 0..count as usize {
            if self.streams[pos].is_invalid() {
                total = 0;
                break;
            }
            total += self.streams[pos].offset;
        }
        if first_error.is_none() {
            if total > PDO_PAYLOAD_MAX {
                self.erroneous_map = 0xFFFF_FFFF;
                first_error = Some(OdError::MapLen);
            } else if count > 0 && total == 0 {
                self.erroneous_map = 0xFFFF_FFFF;
                first_error = Some(OdError::NoMap);
            }
        }

        self.mapped_count = count;
        self.data_len = total.min(PDO_PAYLOAD_MAX);
        match first_error {
            None => Ok(()),
            Some(e) => {
                warn!(
                    "PDO {:#06X}: wrong mapping (word {:#010X}): {}",
                    self.comm_index, self.erroneous_map, e
                );
                Err(e)
            }
        }
    }
}

/// Reads the eight mapping words and the object count out of a mapping
/// entry (16xxh/1Axxh).
pub(crate) fn read_mapping_entry(entry: &ObjectEntry) -> ([u32; PDO_MAP_MAX], u8) {
    let mut words = [0u32; PDO_MAP_MAX];
    let mut count = 0u8;
    if let Some(var) = entry.variable(0) {
        if let Some(&c) = var.data.first() {
            count = c;
        }
    }
    for (pos, word) in words.iter_mut().enumerate() {
        if let Some(var) = entry.variable(pos as u8 + 1) {
            if var.data.len() == 4 {
                *word = u32::from_le_bytes([var.data[0], var.data[1], var.data[2], var.data[3]]);
            }
        }
    }
    (words, count)
}

/// Validates a single mapping word without touching any PDO state; used by
/// the mapping hook for writes to sub-indices 1..8.
pub(crate) fn validate_mapping_word(
    od: &ObjectDictionary,
    word: u32,
    is_rpdo: bool,
) -> Result<(), OdError> {
    if word == 0 {
        return Ok(());
    }
    let entry = MappingEntry::from_u32(word);
    if entry.length_bits as usize / 8 > PDO_PAYLOAD_MAX {
        return Err(OdError::MapLen);
    }
    if entry.index < 0x20 && entry.sub_index == 0 {
        return Ok(());
    }
    let stream = od.stream(entry.index, entry.sub_index, Origin::Internal)?;
    let wanted = if is_rpdo { Attribute::RPDO } else { Attribute::TPDO };
    if !stream.attribute.contains(wanted)
        || entry.length_bits % 8 != 0
        || stream.data_len < entry.length_bits as usize / 8
    {
        return Err(OdError::NoMap);
    }
    Ok(())
}

/// Validates a COB-ID write against the CiA 301 transition rules and
/// returns the value to store (the pre-defined identifier is stored as its
/// base).
pub(crate) fn check_cob_id_write(
    base: &PdoBase,
    value: u32,
) -> Result<u32, OdError> {
    if value & 0x7FFF_F800 != 0 {
        return Err(OdError::InvalidValue);
    }
    let ident = (value & 0x7FF) as u16;
    let becomes_valid = value & 0x8000_0000 == 0;

    if becomes_valid && (ident == 0 || is_restricted_ident(ident)) {
        return Err(OdError::InvalidValue);
    }
    if base.valid && becomes_valid && ident != base.configured_ident {
        // While valid, the identifier cannot change.
        return Err(OdError::InvalidValue);
    }
    if becomes_valid && !base.valid {
        if base.mapped_count == 0 {
            return Err(OdError::MapLen);
        }
        if base.erroneous_map != 0 {
            return Err(OdError::MapLen);
        }
    }
    if ident != 0 && ident == base.predefined_ident {
        Ok(value & !0x7F)
    } else {
        Ok(value)
    }
}

/// Access to the shared PDO state, implemented by both directions so the
/// mapping hook can serve 16xxh and 1Axxh entries alike.
pub(crate) trait PdoObject: Send {
    fn base(&self) -> &PdoBase;
    fn base_mut(&mut self) -> &mut PdoBase;
}

/// OD hook for the mapping entries (1600h+/1A00h+): writes are rejected
/// while the PDO is valid, except setting the object count to zero.
pub struct PdoMapHook {
    pub(crate) pdo: Arc<Mutex<dyn PdoObject>>,
}

impl OdExtension for PdoMapHook {
    fn write(
        &mut self,
        od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let mut pdo = self.pdo.lock().unwrap();
        let base = pdo.base_mut();

        if stream.sub_index == 0 {
            let count = *data.first().ok_or(OdError::TypeMismatch)?;
            if count as usize > PDO_MAP_MAX {
                return Err(OdError::MapLen);
            }
            if base.valid && count != 0 {
                return Err(OdError::UnsuppAccess);
            }
            // Validate against the words already written before committing.
            let (words, _) = read_mapping_entry(entry);
            base.init_mapping(od, &words, count)?;
            entry.default_write(stream, data)
        } else {
            if base.valid {
                return Err(OdError::UnsuppAccess);
            }
            let word = u32::from_le_bytes(
                data.try_into().map_err(|_| OdError::TypeMismatch)?,
            );
            validate_mapping_word(od, word, base.is_rpdo)?;
            entry.default_write(stream, data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Object, ObjectEntry, Variable};

    fn test_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x6000,
            ObjectEntry::new(
                "Mappable_U8",
                Object::Variable(Variable::unsigned8(
                    Attribute::SDO_RW | Attribute::RPDO | Attribute::TPDO,
                    0,
                )),
            ),
        );
        od.insert(
            0x6001,
            ObjectEntry::new(
                "Mappable_U32",
                Object::Variable(Variable::unsigned32(
                    Attribute::SDO_RW | Attribute::RPDO | Attribute::TPDO,
                    0,
                )),
            ),
        );
        od.insert(
            0x6002,
            ObjectEntry::new(
                "NotMappable_U16",
                Object::Variable(Variable::unsigned16(Attribute::SDO_RW, 0)),
            ),
        );
        od
    }

    #[test]
    fn test_mapping_word_roundtrip() {
        let entry = MappingEntry {
            index: 0x6001,
            sub_index: 0x02,
            length_bits: 16,
        };
        assert_eq!(entry.to_u32(), 0x6001_0210);
        assert_eq!(MappingEntry::from_u32(0x6001_0210), entry);
    }

    #[test]
    fn test_init_mapping_sums_lengths() {
        let od = test_od();
        let mut base = PdoBase::new(0x1400, 0x201, true);
        let mut words = [0u32; PDO_MAP_MAX];
        words[0] = 0x6000_0008; // u8, 8 bits
        words[1] = 0x6001_0020; // u32, 32 bits
        base.init_mapping(&od, &words, 2).unwrap();
        assert_eq!(base.data_len, 5);
        assert_eq!(base.mapped_count, 2);
        assert_eq!(base.erroneous_map, 0);
    }

    #[test]
    fn test_init_mapping_rejects_unmappable_entry() {
        let od = test_od();
        let mut base = PdoBase::new(0x1400, 0x201, true);
        let mut words = [0u32; PDO_MAP_MAX];
        words[0] = 0x6002_0010;
        let err = base.init_mapping(&od, &words, 1);
        assert_eq!(err.err(), Some(OdError::NoMap));
        assert_eq!(base.erroneous_map, 0x6002_0010);
        assert!(base.streams[0].is_invalid());
    }

    #[test]
    fn test_init_mapping_rejects_overlong_total() {
        let od = test_od();
        let mut base = PdoBase::new(0x1400, 0x201, true);
        let mut words = [0u32; PDO_MAP_MAX];
        words[0] = 0x6001_0020;
        words[1] = 0x6001_0020;
        words[2] = 0x6000_0008;
        let err = base.init_mapping(&od, &words, 3);
        assert_eq!(err.err(), Some(OdError::MapLen));
    }

    #[test]
    fn test_dummy_mapping_below_0x20() {
        let od = test_od();
        let mut base = PdoBase::new(0x1400, 0x201, true);
        let mut words = [0u32; PDO_MAP_MAX];
        words[0] = 0x0005_0010; // dummy u16: 2 bytes skipped
        words[1] = 0x6000_0008;
        base.init_mapping(&od, &words, 2).unwrap();
        assert_eq!(base.data_len, 3);
        assert!(base.streams[0].dummy);
    }

    #[test]
    fn test_misaligned_length_rejected() {
        let od = test_od();
        assert_eq!(
            validate_mapping_word(&od, 0x6000_0004, true).err(),
            Some(OdError::NoMap)
        );
    }

    #[test]
    fn test_cob_id_write_rules() {
        let mut base = PdoBase::new(0x1400, 0x201, true);
        base.mapped_count = 1;

        // Upper bits must be clear.
        assert_eq!(check_cob_id_write(&base, 0x4000_0201).err(), Some(OdError::InvalidValue));
        // Restricted identifier.
        assert_eq!(check_cob_id_write(&base, 0x0000_0601).err(), Some(OdError::InvalidValue));
        // Zero identifier cannot become valid.
        assert_eq!(check_cob_id_write(&base, 0x0000_0000).err(), Some(OdError::InvalidValue));
        // Pre-defined identifier is stored as its base.
        assert_eq!(check_cob_id_write(&base, 0x0000_0201).unwrap(), 0x0000_0200);

        base.apply_cob_id(0x0000_0201);
        assert!(base.valid);
        // While valid the identifier cannot change.
        assert_eq!(check_cob_id_write(&base, 0x0000_0301).err(), Some(OdError::InvalidValue));
        // Going invalid is always permitted.
        assert!(check_cob_id_write(&base, 0x8000_0201).is_ok());
    }

    #[test]
    fn test_cob_id_valid_requires_mapping() {
        let base = PdoBase::new(0x1400, 0x201, true);
        assert_eq!(check_cob_id_write(&base, 0x0000_0201).err(), Some(OdError::MapLen));
    }
}

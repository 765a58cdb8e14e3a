// crates/canopen-rs/src/od/mod.rs

mod entry;
mod predefined;
mod stream;

pub use entry::{Attribute, DataType, Object, ObjectEntry, Variable};
pub use predefined::{populate_communication_profile, validate_mandatory_objects};
pub use stream::{Origin, Stream, Transfer, default_read, default_write};

use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Fatal Object Dictionary result kinds. Progress ("partial") and success
/// are expressed through [`Transfer`]; everything here is an error that a
/// caller must handle, and each kind maps 1:1 onto an SDO abort code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdError {
    OutOfMem,
    UnsuppAccess,
    WriteOnly,
    ReadOnly,
    IdxNotExist,
    NoMap,
    MapLen,
    ParIncompat,
    DevIncompat,
    Hw,
    TypeMismatch,
    DataLong,
    DataShort,
    SubNotExist,
    InvalidValue,
    ValueHigh,
    ValueLow,
    MaxLessMin,
    NoResource,
    General,
    DataTransf,
    DataLocCtrl,
    DataDevState,
    OdMissing,
    NoData,
}

impl OdError {
    /// The SDO abort code published when an SDO response must report this
    /// result. (CiA 301, Table 50)
    pub fn abort_code(&self) -> u32 {
        match self {
            OdError::OutOfMem => 0x0504_0005,
            OdError::UnsuppAccess => 0x0601_0000,
            OdError::WriteOnly => 0x0601_0001,
            OdError::ReadOnly => 0x0601_0002,
            OdError::IdxNotExist => 0x0602_0000,
            OdError::NoMap => 0x0604_0041,
            OdError::MapLen => 0x0604_0042,
            OdError::ParIncompat => 0x0604_0043,
            OdError::DevIncompat => 0x0604_0047,
            OdError::Hw => 0x0606_0000,
            OdError::TypeMismatch => 0x0607_0010,
            OdError::DataLong => 0x0607_0012,
            OdError::DataShort => 0x0607_0013,
            OdError::SubNotExist => 0x0609_0011,
            OdError::InvalidValue => 0x0609_0030,
            OdError::ValueHigh => 0x0609_0031,
            OdError::ValueLow => 0x0609_0032,
            OdError::MaxLessMin => 0x0609_0036,
            OdError::NoResource => 0x060A_0023,
            OdError::General => 0x0800_0000,
            OdError::DataTransf => 0x0800_0020,
            OdError::DataLocCtrl => 0x0800_0021,
            OdError::DataDevState => 0x0800_0022,
            OdError::OdMissing => 0x0800_0023,
            OdError::NoData => 0x0800_0024,
        }
    }
}

impl fmt::Display for OdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (abort {:#010X})", self, self.abort_code())
    }
}

impl std::error::Error for OdError {}

/// Read/write hooks replacing the default access to an entry.
///
/// Hooks are installed by the service that owns the entry; `self` is that
/// service's shared state. A hook receives the dictionary for access to
/// *other* entries and its own entry directly (already locked) — it must not
/// reach its own entry back through the dictionary.
pub trait OdExtension: Send {
    fn read(
        &mut self,
        od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        buf: &mut [u8],
    ) -> Result<Transfer, OdError> {
        let _ = od;
        entry.default_read(stream, buf)
    }

    fn write(
        &mut self,
        od: &ObjectDictionary,
        entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        let _ = od;
        entry.default_write(stream, data)
    }
}

/// An extension slot on an entry: the hook pair plus the owning service.
#[derive(Clone)]
pub struct Extension {
    pub hook: Arc<Mutex<dyn OdExtension>>,
}

/// The Object Dictionary: the typed, indexed key-value store of CiA 301.
///
/// Entries sit behind individual mutexes so that extension hooks — invoked
/// mid-access with their entry locked — can still resolve other entries
/// (PDO mapping validation needs exactly that). Hooks must not re-enter
/// their own entry.
pub struct ObjectDictionary {
    entries: BTreeMap<u16, Mutex<ObjectEntry>>,
}

impl Default for ObjectDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Inserts a new object entry into the dictionary at a given index.
    pub fn insert(&mut self, index: u16, entry: ObjectEntry) {
        self.entries.insert(index, Mutex::new(entry));
    }

    pub fn contains(&self, index: u16) -> bool {
        self.entries.contains_key(&index)
    }

    /// All populated indices in ascending order.
    pub fn indices(&self) -> Vec<u16> {
        self.entries.keys().copied().collect()
    }

    /// Runs `f` with the entry at `index` locked.
    pub fn with_entry<R>(&self, index: u16, f: impl FnOnce(&mut ObjectEntry) -> R) -> Option<R> {
        self.entries
            .get(&index)
            .map(|m| f(&mut m.lock().unwrap()))
    }

    /// Installs an extension hook on an entry. Fails if the entry does not
    /// exist.
    pub fn attach_extension(
        &self,
        index: u16,
        hook: Arc<Mutex<dyn OdExtension>>,
    ) -> Result<(), OdError> {
        self.with_entry(index, |entry| {
            entry.extension = Some(Extension { hook });
        })
        .ok_or(OdError::IdxNotExist)
    }

    pub fn detach_extension(&self, index: u16) {
        self.with_entry(index, |entry| entry.extension = None);
    }

    /// Number of sub-entries above sub-index 0 (used e.g. to size the EMCY
    /// history FIFO from entry 1003h).
    pub fn sub_count(&self, index: u16) -> Result<u8, OdError> {
        self.with_entry(index, |entry| entry.sub_count())
            .ok_or(OdError::IdxNotExist)
    }

    /// Resolves a streamer over `index:sub_index`, or the matching ODR error.
    pub fn stream(&self, index: u16, sub_index: u8, origin: Origin) -> Result<Stream, OdError> {
        self.with_entry(index, |entry| {
            entry
                .variable(sub_index)
                .map(|var| Stream {
                    index,
                    sub_index,
                    attribute: var.attribute,
                    data_len: var.data.len(),
                    offset: 0,
                    origin,
                    dummy: false,
                })
                .ok_or(OdError::SubNotExist)
        })
        .ok_or(OdError::IdxNotExist)?
    }

    /// Reads through the streamer, dispatching to the entry's extension hook
    /// when one is installed.
    pub fn read(&self, stream: &mut Stream, buf: &mut [u8]) -> Result<Transfer, OdError> {
        if stream.origin == Origin::External && !stream.attribute.contains(Attribute::SDO_R) {
            return Err(OdError::WriteOnly);
        }
        if stream.dummy {
            let var = Variable::unsigned8(Attribute::default(), 0);
            return default_read(&var, stream, buf);
        }
        let entry_mutex = self.entries.get(&stream.index).ok_or(OdError::IdxNotExist)?;
        let mut entry = entry_mutex.lock().unwrap();
        match entry.extension.as_ref().map(|e| e.hook.clone()) {
            Some(hook) => hook.lock().unwrap().read(self, &mut entry, stream, buf),
            None => entry.default_read(stream, buf),
        }
    }

    /// Writes through the streamer. A completed write clears the sub-index's
    /// PDO event flag so event-driven TPDOs mapping the sub-entry fire.
    pub fn write(&self, stream: &mut Stream, data: &[u8]) -> Result<Transfer, OdError> {
        if stream.origin == Origin::External && !stream.attribute.contains(Attribute::SDO_W) {
            return Err(OdError::ReadOnly);
        }
        if stream.dummy {
            let mut var = Variable::unsigned8(Attribute::default(), 0);
            return default_write(&mut var, stream, data);
        }
        let entry_mutex = self.entries.get(&stream.index).ok_or(OdError::IdxNotExist)?;
        let mut entry = entry_mutex.lock().unwrap();
        let result = match entry.extension.as_ref().map(|e| e.hook.clone()) {
            Some(hook) => hook.lock().unwrap().write(self, &mut entry, stream, data),
            None => entry.default_write(stream, data),
        };
        if matches!(result, Ok(Transfer::Complete(_))) {
            entry.clear_pdo_flag(stream.sub_index);
        }
        result
    }

    /// Reads a whole value, looping on partial transfers (extension-backed
    /// entries may produce data incrementally).
    pub fn read_value(
        &self,
        index: u16,
        sub_index: u8,
        origin: Origin,
    ) -> Result<Vec<u8>, OdError> {
        let mut stream = self.stream(index, sub_index, origin)?;
        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            match self.read(&mut stream, &mut chunk)? {
                Transfer::Complete(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    return Ok(out);
                }
                Transfer::Partial(n) => {
                    if n == 0 {
                        return Err(OdError::NoData);
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    /// One-shot write of a complete value with length validation: longer
    /// data fails with `DataLong`; shorter data is zero padded on
    /// string-shorter entries, resizes DOMAIN entries, and fails with
    /// `DataShort` everywhere else.
    pub fn write_value(
        &self,
        index: u16,
        sub_index: u8,
        origin: Origin,
        data: &[u8],
    ) -> Result<(), OdError> {
        let mut stream = self.stream(index, sub_index, origin)?;

        if stream.data_len != data.len() {
            let resizable = self
                .with_entry(index, |entry| {
                    entry
                        .variable(sub_index)
                        .is_some_and(|v| v.data_type == DataType::Domain)
                })
                .unwrap_or(false);
            if resizable {
                self.with_entry(index, |entry| {
                    if let Some(var) = entry.variable_mut(sub_index) {
                        var.data = vec![0; data.len()];
                    }
                });
                stream.data_len = data.len();
            } else if data.len() > stream.data_len {
                return Err(OdError::DataLong);
            } else if stream.attribute.contains(Attribute::STR_SHORTER) {
                let mut padded = data.to_vec();
                padded.resize(stream.data_len, 0);
                self.write(&mut stream, &padded)?;
                return Ok(());
            } else {
                return Err(OdError::DataShort);
            }
        }
        self.write(&mut stream, data)?;
        Ok(())
    }

    // --- Start of typed accessors (internal origin, little-endian) ---

    pub fn get_raw(&self, index: u16, sub_index: u8, len: usize) -> Result<Vec<u8>, OdError> {
        let value = self.read_value(index, sub_index, Origin::Internal)?;
        if value.len() != len {
            return Err(OdError::TypeMismatch);
        }
        Ok(value)
    }

    pub fn u8(&self, index: u16, sub_index: u8) -> Result<u8, OdError> {
        Ok(self.get_raw(index, sub_index, 1)?[0])
    }

    pub fn u16(&self, index: u16, sub_index: u8) -> Result<u16, OdError> {
        let raw = self.get_raw(index, sub_index, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn u32(&self, index: u16, sub_index: u8) -> Result<u32, OdError> {
        let raw = self.get_raw(index, sub_index, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn set_u8(&self, index: u16, sub_index: u8, value: u8) -> Result<(), OdError> {
        self.write_value(index, sub_index, Origin::Internal, &[value])
    }

    pub fn set_u16(&self, index: u16, sub_index: u8, value: u16) -> Result<(), OdError> {
        self.write_value(index, sub_index, Origin::Internal, &value.to_le_bytes())
    }

    pub fn set_u32(&self, index: u16, sub_index: u8, value: u32) -> Result<(), OdError> {
        self.write_value(index, sub_index, Origin::Internal, &value.to_le_bytes())
    }

    // --- End of typed accessors ---

    pub(crate) fn pdo_flag(&self, index: u16, sub_index: u8) -> bool {
        self.with_entry(index, |entry| entry.pdo_flag(sub_index))
            .unwrap_or(true)
    }

    pub(crate) fn set_pdo_flag(&self, index: u16, sub_index: u8) {
        self.with_entry(index, |entry| entry.set_pdo_flag(sub_index));
    }

    /// Application request for an event-driven TPDO mapping this sub-entry:
    /// clearing the flag makes the next TPDO scan treat the value as changed.
    pub fn request_tpdo(&self, index: u16, sub_index: u8) -> Result<(), OdError> {
        self.with_entry(index, |entry| entry.clear_pdo_flag(sub_index))
            .ok_or(OdError::IdxNotExist)
    }
}

impl fmt::Debug for ObjectDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDictionary")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(
            0x2000,
            ObjectEntry::new(
                "TestVar_U32",
                Object::Variable(Variable::unsigned32(Attribute::SDO_RW, 0x12345678)),
            ),
        );
        od.insert(
            0x2001,
            ObjectEntry::new(
                "WriteOnly_U8",
                Object::Variable(Variable::unsigned8(Attribute::SDO_W, 0)),
            ),
        );
        od.insert(
            0x2002,
            ObjectEntry::new(
                "Name_VS",
                Object::Variable(Variable::visible_string(Attribute::SDO_RW, "abcdef")),
            ),
        );
        od.insert(
            0x2003,
            ObjectEntry::new(
                "Blob_DOMAIN",
                Object::Variable(Variable::domain(Attribute::SDO_RW)),
            ),
        );
        od
    }

    #[test]
    fn test_read_value_little_endian() {
        let od = test_od();
        assert_eq!(od.u32(0x2000, 0).unwrap(), 0x12345678);
        assert_eq!(
            od.read_value(0x2000, 0, Origin::Internal).unwrap(),
            vec![0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_missing_entry_and_sub() {
        let od = test_od();
        assert_eq!(od.stream(0x5000, 0, Origin::Internal).err(), Some(OdError::IdxNotExist));
        assert_eq!(od.stream(0x2000, 1, Origin::Internal).err(), Some(OdError::SubNotExist));
    }

    #[test]
    fn test_external_access_checks() {
        let od = test_od();
        let mut stream = od.stream(0x2001, 0, Origin::External).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(od.read(&mut stream, &mut buf).err(), Some(OdError::WriteOnly));
        // Internal origin bypasses the attribute check.
        let mut stream = od.stream(0x2001, 0, Origin::Internal).unwrap();
        assert!(od.read(&mut stream, &mut buf).is_ok());
    }

    #[test]
    fn test_write_value_length_rules() {
        let od = test_od();
        // Numeric entry: wrong lengths rejected.
        assert_eq!(
            od.write_value(0x2000, 0, Origin::Internal, &[1, 2, 3, 4, 5]).err(),
            Some(OdError::DataLong)
        );
        assert_eq!(
            od.write_value(0x2000, 0, Origin::Internal, &[1, 2]).err(),
            Some(OdError::DataShort)
        );
        // String entry: shorter write pads with zeros.
        od.write_value(0x2002, 0, Origin::Internal, b"xy").unwrap();
        assert_eq!(
            od.read_value(0x2002, 0, Origin::Internal).unwrap(),
            b"xy\0\0\0\0".to_vec()
        );
        // Domain entry: resizes.
        od.write_value(0x2003, 0, Origin::Internal, &[9; 100]).unwrap();
        assert_eq!(od.read_value(0x2003, 0, Origin::Internal).unwrap().len(), 100);
    }

    #[test]
    fn test_typed_accessor_length_mismatch() {
        let od = test_od();
        assert_eq!(od.u16(0x2000, 0).err(), Some(OdError::TypeMismatch));
    }

    #[test]
    fn test_write_clears_pdo_flag() {
        let od = test_od();
        od.set_pdo_flag(0x2000, 0);
        assert!(od.pdo_flag(0x2000, 0));
        od.set_u32(0x2000, 0, 7).unwrap();
        assert!(!od.pdo_flag(0x2000, 0));
    }

    struct CountingHook {
        reads: u32,
        writes: u32,
    }
    impl OdExtension for CountingHook {
        fn read(
            &mut self,
            _od: &ObjectDictionary,
            entry: &mut ObjectEntry,
            stream: &mut Stream,
            buf: &mut [u8],
        ) -> Result<Transfer, OdError> {
            self.reads += 1;
            entry.default_read(stream, buf)
        }
        fn write(
            &mut self,
            _od: &ObjectDictionary,
            entry: &mut ObjectEntry,
            stream: &mut Stream,
            data: &[u8],
        ) -> Result<Transfer, OdError> {
            self.writes += 1;
            entry.default_write(stream, data)
        }
    }

    #[test]
    fn test_extension_hooks_wrap_default_access() {
        let od = test_od();
        let hook = Arc::new(Mutex::new(CountingHook { reads: 0, writes: 0 }));
        od.attach_extension(0x2000, hook.clone()).unwrap();

        assert_eq!(od.u32(0x2000, 0).unwrap(), 0x12345678);
        od.set_u32(0x2000, 0, 0xAABBCCDD).unwrap();
        assert_eq!(od.u32(0x2000, 0).unwrap(), 0xAABBCCDD);

        let hook = hook.lock().unwrap();
        assert_eq!(hook.reads, 2);
        assert_eq!(hook.writes, 1);
    }
}

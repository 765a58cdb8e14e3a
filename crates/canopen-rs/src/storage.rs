// crates/canopen-rs/src/storage.rs

use crate::hal::{CanOpenError, OdStorage};
use crate::od::{ObjectDictionary, ObjectEntry, OdError, OdExtension, Origin, Stream, Transfer};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// ASCII "save", little-endian, as written to 1010h.
const SIGNATURE_SAVE: u32 = 0x6576_6173;
/// ASCII "load", little-endian, as written to 1011h.
const SIGNATURE_LOAD: u32 = 0x6461_6F6C;

fn in_group(index: u16, group: u8) -> bool {
    match group {
        1 => true,
        2 => (0x1000..=0x1FFF).contains(&index),
        3 => index >= 0x2000,
        _ => false,
    }
}

/// Collects the values of every storable entry in `group`
/// (1 = all, 2 = communication, 3 = application).
fn collect_parameters(od: &ObjectDictionary, group: u8) -> BTreeMap<(u16, u8), Vec<u8>> {
    let mut parameters = BTreeMap::new();
    for index in od.indices() {
        // The command objects themselves are not persisted.
        if index == 0x1010 || index == 0x1011 || !in_group(index, group) {
            continue;
        }
        od.with_entry(index, |entry| {
            for sub in 0..=255u8 {
                if let Some(var) = entry.variable(sub) {
                    if var.attribute.contains(crate::od::Attribute::SDO_W) {
                        parameters.insert((index, sub), var.data.clone());
                    }
                }
            }
        });
    }
    parameters
}

/// Applies previously stored parameters to the dictionary, skipping entries
/// that no longer exist in the current firmware.
pub fn load_parameters(
    od: &ObjectDictionary,
    storage: &mut dyn OdStorage,
) -> Result<(), CanOpenError> {
    if storage.restore_defaults_requested() {
        info!("restore-defaults flag set: clearing stored parameters");
        storage.clear_restore_defaults_flag()?;
        storage.clear()?;
        return Ok(());
    }
    for ((index, sub), value) in storage.load()? {
        let _ = od.write_value(index, sub, Origin::Internal, &value);
    }
    Ok(())
}

/// OD hook for 1010h ("save") and 1011h ("load"), signature guarded.
pub struct StorageHook {
    pub storage: Arc<Mutex<Box<dyn OdStorage>>>,
}

impl OdExtension for StorageHook {
    fn write(
        &mut self,
        od: &ObjectDictionary,
        _entry: &mut ObjectEntry,
        stream: &mut Stream,
        data: &[u8],
    ) -> Result<Transfer, OdError> {
        if stream.sub_index == 0 {
            return Err(OdError::ReadOnly);
        }
        let value = u32::from_le_bytes(data.try_into().map_err(|_| OdError::TypeMismatch)?);
        match stream.index {
            0x1010 => {
                if value != SIGNATURE_SAVE {
                    return Err(OdError::DataTransf);
                }
                let parameters = collect_parameters(od, stream.sub_index);
                self.storage
                    .lock()
                    .unwrap()
                    .save(&parameters)
                    .map_err(|e| {
                        warn!("storing parameters failed: {}", e);
                        OdError::Hw
                    })?;
                info!("stored {} parameters (group {})", parameters.len(), stream.sub_index);
            }
            0x1011 => {
                if value != SIGNATURE_LOAD {
                    return Err(OdError::DataTransf);
                }
                self.storage
                    .lock()
                    .unwrap()
                    .request_restore_defaults()
                    .map_err(|_| OdError::Hw)?;
                info!("defaults will be restored on the next communication reset");
            }
            _ => return Err(OdError::UnsuppAccess),
        }
        stream.offset = data.len();
        stream.data_len = data.len();
        Ok(Transfer::Complete(data.len()))
    }
}

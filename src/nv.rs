//! Opaque blob persistence over owner-defined NV indices.
//!
//! A slot is sized to exactly its content when it is defined. Writing a
//! payload therefore always undefines the slot first and defines it again at
//! the new length; there is no in-place resize and no length prefix.

use tracing::{debug, error, instrument, trace};

use crate::error::{Error, Result};
use crate::handles::NvSlot;
use crate::module::{ModuleChannel, SecurityModule};

/// Writes `bytes` to `slot`, replacing whatever was there.
#[instrument(level = "debug", skip(module, bytes), fields(len = bytes.len()))]
pub fn store<M: SecurityModule>(module: &M, slot: NvSlot, bytes: &[u8]) -> Result<()> {
    let size = u16::try_from(bytes.len()).map_err(|_| {
        Error::Format(format!(
            "{} bytes do not fit in an NV index (max {})",
            bytes.len(),
            u16::MAX
        ))
    })?;

    let mut channel = module.open()?;

    // Absent on first use; nothing to report.
    if let Err(e) = channel.nv_undefine(slot) {
        debug!(%slot, error = %e, "NV undefine failed");
    }

    channel.nv_define(slot, size).inspect_err(|e| {
        error!(%slot, error = %e, "NV define failed");
    })?;

    if let Err(e) = write_chunked(&mut channel, slot, bytes) {
        error!(%slot, error = %e, "NV write failed");
        // a defined but unwritten index would read as a module error forever
        if let Err(undefine) = channel.nv_undefine(slot) {
            error!(%slot, error = %undefine, "NV undefine after failed write failed");
        }
        return Err(e);
    }
    Ok(())
}

fn write_chunked<C: ModuleChannel>(channel: &mut C, slot: NvSlot, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return channel.nv_write(slot, bytes, 0);
    }
    let chunk_size = channel.nv_max_buffer().max(1);
    let mut offset = 0;
    while offset < bytes.len() {
        let end = core::cmp::min(offset + chunk_size, bytes.len());
        trace!(%slot, offset, end, "writing NV chunk");
        // offset < bytes.len() <= u16::MAX, checked by the caller
        channel.nv_write(slot, &bytes[offset..end], offset as u16)?;
        offset = end;
    }
    Ok(())
}

/// Reads the full content of `slot`.
#[instrument(level = "debug", skip(module))]
pub fn load<M: SecurityModule>(module: &M, slot: NvSlot) -> Result<Vec<u8>> {
    let mut channel = module.open()?;
    channel.nv_read(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFault, SimModule};

    #[test]
    fn round_trips_empty_one_and_256_bytes() {
        let module = SimModule::new();
        for len in [0usize, 1, 256] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            store(&module, NvSlot::DeviceCert, &payload).unwrap();
            assert_eq!(load(&module, NvSlot::DeviceCert).unwrap(), payload, "len {len}");
        }
    }

    #[test]
    fn load_of_undefined_slot_is_slot_absent() {
        let module = SimModule::new();
        assert!(matches!(
            load(&module, NvSlot::VaultKey),
            Err(Error::SlotAbsent(NvSlot::VaultKey))
        ));
    }

    #[test]
    fn rewrite_with_different_length_redefines() {
        let module = SimModule::new();
        store(&module, NvSlot::OwnerCredential, b"a much longer first value").unwrap();
        store(&module, NvSlot::OwnerCredential, b"short").unwrap();
        assert_eq!(load(&module, NvSlot::OwnerCredential).unwrap(), b"short");
        assert_eq!(module.nv_capacity(NvSlot::OwnerCredential), Some(5));
    }

    #[test]
    fn failed_write_leaves_the_slot_undefined() {
        let module = SimModule::new();
        module.inject_fault(SimFault::NvWrite);
        assert!(matches!(
            store(&module, NvSlot::VaultKey, &[9; 32]),
            Err(Error::Module(_))
        ));
        assert_eq!(module.nv_capacity(NvSlot::VaultKey), None);
        assert!(matches!(
            load(&module, NvSlot::VaultKey),
            Err(Error::SlotAbsent(NvSlot::VaultKey))
        ));
    }

    #[test]
    fn large_payloads_are_written_in_chunks() {
        let module = SimModule::new();
        let payload = vec![0x5A; 3000];
        store(&module, NvSlot::DeviceCert, &payload).unwrap();
        assert_eq!(load(&module, NvSlot::DeviceCert).unwrap(), payload);
        assert!(module.stats().nv_writes > 1);
    }

    #[test]
    fn oversized_payload_is_rejected_before_opening() {
        let module = SimModule::new();
        let payload = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            store(&module, NvSlot::DeviceCert, &payload),
            Err(Error::Format(_))
        ));
        assert_eq!(module.stats().opens, 0);
    }

    #[test]
    fn slots_are_independent() {
        let module = SimModule::new();
        store(&module, NvSlot::DeviceCert, b"cert").unwrap();
        store(&module, NvSlot::VaultKey, &[7; 32]).unwrap();
        assert_eq!(load(&module, NvSlot::DeviceCert).unwrap(), b"cert");
        assert_eq!(load(&module, NvSlot::VaultKey).unwrap(), vec![7; 32]);
        assert!(load(&module, NvSlot::OwnerCredential).is_err());
    }
}

//! The owner credential: one random identifier per device.
//!
//! The NV slot is the durable copy; the cache file is a fast path that can be
//! rebuilt from it at any time.

use std::io::ErrorKind;
use std::path::Path;

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handles::NvSlot;
use crate::module::SecurityModule;
use crate::nv;

/// Longest authorization value the module is given.
pub const MAX_AUTH_LEN: usize = 7;

#[derive(Debug)]
pub struct OwnerCredential {
    value: SecretSlice<u8>,
}

impl OwnerCredential {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            value: SecretSlice::from(bytes.to_vec()),
        }
    }

    /// A fresh identifier, laid out the way `uuidgen` prints one.
    pub fn generate() -> Self {
        Self::from_bytes(format!("{}\n", Uuid::new_v4()).as_bytes())
    }

    /// The full stored value.
    pub fn as_bytes(&self) -> &[u8] {
        self.value.expose_secret()
    }

    /// The value handed to the module as an auth value.
    ///
    /// Everything that authorizes against the device key goes through here.
    pub fn authorization(&self) -> &[u8] {
        let value = self.value.expose_secret();
        &value[..value.len().min(MAX_AUTH_LEN)]
    }
}

fn write_cache(path: &Path, credential: &OwnerCredential) -> Result<()> {
    std::fs::write(path, credential.as_bytes()).map_err(|e| Error::io(path, e))
}

/// Loads the credential from the module and mirrors it into `cache`.
#[instrument(level = "debug", skip(module))]
pub fn read_credentials<M: SecurityModule>(module: &M, cache: &Path) -> Result<OwnerCredential> {
    let credential = OwnerCredential::from_bytes(&nv::load(module, NvSlot::OwnerCredential)?);
    write_cache(cache, &credential)?;
    Ok(credential)
}

/// Returns the device's credential, creating it on first use.
#[instrument(level = "debug", skip(module))]
pub fn generate_credentials<M: SecurityModule>(
    module: &M,
    cache: &Path,
) -> Result<OwnerCredential> {
    match read_credentials(module, cache) {
        Err(Error::SlotAbsent(_)) => {
            info!("no owner credential in the module, generating one");
            let credential = OwnerCredential::generate();
            write_cache(cache, &credential)?;
            nv::store(module, NvSlot::OwnerCredential, credential.as_bytes())?;
            Ok(credential)
        }
        other => other,
    }
}

/// The credential from the cache file, rebuilding the file from the module
/// if it is missing.
pub fn current<M: SecurityModule>(module: &M, cache: &Path) -> Result<OwnerCredential> {
    match std::fs::read(cache) {
        Ok(bytes) => Ok(OwnerCredential::from_bytes(&bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(?cache, "credential cache missing, reading from module");
            read_credentials(module, cache)
        }
        Err(e) => Err(Error::io(cache, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimModule;

    #[test]
    fn authorization_is_truncated_to_seven_bytes() {
        let long = OwnerCredential::from_bytes(b"0123456789abcdef");
        assert_eq!(long.authorization(), b"0123456");
        let short = OwnerCredential::from_bytes(b"abc");
        assert_eq!(short.authorization(), b"abc");
        let exact = OwnerCredential::from_bytes(b"1234567");
        assert_eq!(exact.authorization(), b"1234567");
    }

    #[test]
    fn generated_credential_looks_like_uuidgen_output() {
        let credential = OwnerCredential::generate();
        let text = std::str::from_utf8(credential.as_bytes()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(Uuid::parse_str(text.trim_end()).is_ok());
    }

    #[test]
    fn generation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("tpm_credential");
        let module = SimModule::new();

        let first = generate_credentials(&module, &cache).unwrap();
        let second = generate_credentials(&module, &cache).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(module.stats().nv_defines, 1);
        assert_eq!(std::fs::read(&cache).unwrap(), first.as_bytes());
    }

    #[test]
    fn cache_is_rebuilt_from_module() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("tpm_credential");
        let module = SimModule::new();

        let original = generate_credentials(&module, &cache).unwrap();
        std::fs::remove_file(&cache).unwrap();

        let recovered = current(&module, &cache).unwrap();
        assert_eq!(recovered.as_bytes(), original.as_bytes());
        assert!(cache.exists());
    }

    #[test]
    fn cache_mirrors_module_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("tpm_credential");
        let module = SimModule::new();
        nv::store(&module, NvSlot::OwnerCredential, b"stored-in-nv").unwrap();
        std::fs::write(&cache, b"stale").unwrap();

        let credential = generate_credentials(&module, &cache).unwrap();
        assert_eq!(credential.as_bytes(), b"stored-in-nv");
        assert_eq!(std::fs::read(&cache).unwrap(), b"stored-in-nv");
    }

    #[test]
    fn read_without_slot_reports_absence() {
        let dir = tempfile::tempdir().unwrap();
        let module = SimModule::new();
        assert!(matches!(
            read_credentials(&module, &dir.path().join("c")),
            Err(Error::SlotAbsent(NvSlot::OwnerCredential))
        ));
    }

    #[test]
    fn cleared_module_gets_a_new_credential() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("tpm_credential");
        let module = SimModule::new();
        let before = generate_credentials(&module, &cache).unwrap();
        module.clear();
        let after = generate_credentials(&module, &cache).unwrap();
        assert_ne!(before.as_bytes(), after.as_bytes());
    }
}

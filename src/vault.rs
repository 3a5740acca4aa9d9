//! The vault key: root of the device's disk encryption.
//!
//! Generated once from the module RNG and kept in its NV slot. If that slot is
//! ever cleared outside this agent a new key is generated on the next fetch,
//! and anything encrypted under the previous key can no longer be opened.

use secrecy::{ExposeSecret, SecretSlice};
use tracing::{instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::handles::NvSlot;
use crate::module::{ModuleChannel, SecurityModule};
use crate::nv;

pub const VAULT_KEY_LEN: usize = 32;

/// 32 bytes of key material, wiped on drop.
pub struct VaultKey {
    key: SecretSlice<u8>,
}

impl VaultKey {
    fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != VAULT_KEY_LEN {
            return Err(Error::Format(format!(
                "vault key is {} bytes, expected {VAULT_KEY_LEN}",
                key.len()
            )));
        }
        Ok(Self {
            key: SecretSlice::from(key.to_vec()),
        })
    }

    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }
}

impl Zeroize for VaultKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for VaultKey {}

/// Reads `len` bytes from the module RNG, which may return fewer per call.
fn random_bytes<C: ModuleChannel>(channel: &mut C, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = channel.get_random(len - out.len())?;
        if chunk.is_empty() {
            return Err(Error::Module("module RNG returned no bytes".into()));
        }
        let take = chunk.len().min(len - out.len());
        out.extend_from_slice(&chunk[..take]);
    }
    Ok(out)
}

/// Returns the vault key, generating and persisting it if the slot is empty.
#[instrument(level = "debug", skip(module))]
pub fn fetch_vault_key<M: SecurityModule>(module: &M) -> Result<VaultKey> {
    match nv::load(module, NvSlot::VaultKey) {
        Ok(bytes) => VaultKey::from_slice(&bytes),
        Err(Error::SlotAbsent(_)) => {
            warn!(
                "vault key slot is empty, generating a new key; data sealed under any earlier key is unrecoverable"
            );
            let bytes = {
                let mut channel = module.open()?;
                random_bytes(&mut channel, VAULT_KEY_LEN)?
            };
            let key = VaultKey::from_slice(&bytes)?;
            nv::store(module, NvSlot::VaultKey, key.key().expose_secret())?;
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

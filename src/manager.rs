//! Process-wide state and the operations the agent exposes.

use std::cell::{Cell, OnceCell};

use tracing::{debug, info, instrument};

use crate::config::{Config, ConfigSnapshot};
use crate::credential::{self, OwnerCredential};
use crate::ecdh;
use crate::error::{Error, Result};
use crate::handles::NvSlot;
use crate::introspect::{self, ModuleStatus, NOT_AVAILABLE, PcrValue, PlatformQuote};
use crate::module::{EccPoint, EccSignature, SecurityModule};
use crate::nv;
use crate::provision;
use crate::sign;
use crate::vault::{self, VaultKey};

type DebugHook = Box<dyn Fn(bool)>;

/// Owns the module handle, the configuration and the little state that
/// outlives a single command.
pub struct TpmManager<M: SecurityModule> {
    module: M,
    config: Config,
    hardware_info: OnceCell<String>,
    debug: Cell<bool>,
    debug_hook: Option<DebugHook>,
}

impl<M: SecurityModule> TpmManager<M> {
    pub fn new(module: M, config: Config) -> Self {
        let debug = Cell::new(config.debug_override);
        Self {
            module,
            config,
            hardware_info: OnceCell::new(),
            debug,
            debug_hook: None,
        }
    }

    /// Called with the new value whenever the debug flag flips.
    pub fn with_debug_hook(mut self, hook: impl Fn(bool) + 'static) -> Self {
        self.debug_hook = Some(Box::new(hook));
        self
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.get()
    }

    fn set_debug(&self, enabled: bool) {
        if self.debug.replace(enabled) != enabled {
            info!(enabled, "debug logging changed");
            if let Some(hook) = &self.debug_hook {
                hook(enabled);
            }
        }
    }

    /// Applies a global config snapshot; the command line can only force
    /// debug on.
    pub fn apply_config(&self, snapshot: &ConfigSnapshot) {
        let from_config = snapshot.debug_enabled().unwrap_or(false);
        self.set_debug(self.config.debug_override || from_config);
    }

    /// Global config went away.
    pub fn reset_config(&self) {
        self.set_debug(self.config.debug_override);
    }

    pub fn status(&self) -> ModuleStatus {
        let paths = &self.config.paths;
        introspect::module_status(self.module.is_present(), &paths.device_cert, &paths.device_key)
    }

    /// Vendor, model and firmware, read once per process.
    pub fn hardware_info(&self) -> Result<String> {
        if let Some(info) = self.hardware_info.get() {
            return Ok(info.clone());
        }
        let info = if self.module.is_present() {
            introspect::read_hardware_info(&self.module)?.to_string()
        } else {
            NOT_AVAILABLE.to_owned()
        };
        Ok(self.hardware_info.get_or_init(|| info).clone())
    }

    pub fn pcrs(&self) -> Result<Vec<PcrValue>> {
        introspect::read_pcrs(&self.module)
    }

    pub fn quote(&self, nonce: &[u8]) -> Result<PlatformQuote> {
        introspect::quote(&self.module, nonce)
    }

    /// Replaces every key; the device key is bound to the cached credential.
    #[instrument(level = "info", skip(self))]
    pub fn provision_all(&self) -> Result<()> {
        let credential = self.credential()?;
        provision::provision_all(&self.module, &credential, &self.config.paths.ecc_public_key)
    }

    pub fn provision_identity(&self) -> Result<()> {
        provision::provision_identity(&self.module)
    }

    /// Copies the device certificate from NV to its file.
    pub fn read_device_cert(&self) -> Result<()> {
        let path = &self.config.paths.device_cert;
        let cert = nv::load(&self.module, NvSlot::DeviceCert)?;
        std::fs::write(path, cert).map_err(|e| Error::io(path, e))?;
        debug!(?path, "device certificate restored from NV");
        Ok(())
    }

    /// Copies the device certificate file into NV.
    pub fn write_device_cert(&self) -> Result<()> {
        let path = &self.config.paths.device_cert;
        let cert = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        nv::store(&self.module, NvSlot::DeviceCert, &cert)
    }

    pub fn read_credentials(&self) -> Result<OwnerCredential> {
        credential::read_credentials(&self.module, &self.config.paths.credential_cache)
    }

    pub fn generate_credentials(&self) -> Result<OwnerCredential> {
        credential::generate_credentials(&self.module, &self.config.paths.credential_cache)
    }

    pub fn credential(&self) -> Result<OwnerCredential> {
        credential::current(&self.module, &self.config.paths.credential_cache)
    }

    pub fn sign(&self, digest: &[u8]) -> Result<EccSignature> {
        sign::sign_digest(&self.module, &self.credential()?, digest)
    }

    /// Opens a payload sealed to the device key. Every failure, including an
    /// unreadable credential, is [`Error::Decrypt`].
    pub fn decrypt_with_ecdh(
        &self,
        peer_point: &EccPoint,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let credential = self.credential().map_err(|e| {
            debug!(error = %e, "credential unavailable for ECDH");
            Error::Decrypt
        })?;
        ecdh::decrypt_with_ecdh(&self.module, &credential, peer_point, iv, ciphertext)
    }

    pub fn fetch_vault_key(&self) -> Result<VaultKey> {
        vault::fetch_vault_key(&self.module)
    }

    /// Module and software agree on the ECDH shared point.
    pub fn test_ecdh_support(&self) -> Result<bool> {
        ecdh::self_test_shared_secret(&self.module, &self.credential()?)
    }

    /// Seals a message to the key in the device certificate and opens it
    /// through the module.
    pub fn test_ecdh_exchange(&self) -> Result<bool> {
        let path = &self.config.paths.device_cert;
        let pem = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let device_public = ecdh::device_public_from_cert(&pem)?;
        ecdh::self_test_exchange(&self.module, &self.credential()?, &device_public)
    }
}

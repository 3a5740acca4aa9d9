//! A software stand-in for the TPM.
//!
//! Implements the same [`SecurityModule`] surface with P-256 arithmetic done
//! in software. RSA objects (EK, SRK, AK) are modelled as opaque random
//! material: they can be persisted, read back and used for quotes, but the
//! quote signature is a SHA-256 binding rather than RSASSA.
//!
//! State can optionally be kept in a file so that separate runs of the agent
//! see the same persistent objects and NV indices, the way a real module
//! would across reboots.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bincode::{Decode, Encode};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, trace};

use crate::ecdh::scalar_mult;
use crate::error::{Error, Result};
use crate::handles::{Hierarchy, KeyRole, NvSlot};
use crate::module::{
    Attestation, EccPoint, EccSignature, ModuleChannel, Property, PublicArea, SecurityModule,
    TransientObject,
};
use crate::template::{KeyAlgorithm, KeyTemplate, KeyUsage};

const PCR_COUNT: usize = 24;
const MAX_NV_BUFFER: usize = 1024;
const MAX_RANDOM: usize = 32;
const TRANSIENT_BASE: u32 = 0x8000_0000;

/// Default property words: "IBM", model "SW   TPM", firmware 1.59.0.0
const DEFAULT_PROPERTIES: [u32; 5] = [0x4942_4D00, 0x5357_2020, 0x2054_504D, 0x0001_003B, 0];

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
enum SimKey {
    Ecc { secret: Vec<u8> },
    Rsa { modulus: Vec<u8>, seed: Vec<u8> },
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
struct SimObject {
    key: SimKey,
    auth: Vec<u8>,
    restricted_signing: bool,
    owner_hierarchy: bool,
}

impl SimObject {
    fn public(&self) -> Result<PublicArea> {
        match &self.key {
            SimKey::Ecc { secret } => {
                let secret = ecc_secret(secret)?;
                Ok(PublicArea::Ecc(EccPoint::from_public_key(&secret.public_key())?))
            }
            SimKey::Rsa { modulus, .. } => Ok(PublicArea::Rsa {
                modulus: modulus.clone(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
struct NvArea {
    data: Vec<u8>,
    written: bool,
}

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone)]
struct SimState {
    persistent: BTreeMap<u32, SimObject>,
    nv: BTreeMap<u32, NvArea>,
    pcrs: Vec<Vec<u8>>,
    properties: [u32; 5],
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            persistent: BTreeMap::new(),
            nv: BTreeMap::new(),
            pcrs: vec![vec![0u8; 32]; PCR_COUNT],
            properties: DEFAULT_PROPERTIES,
        }
    }
}

/// Counters for asserting how the module was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub opens: u32,
    pub creations: u32,
    pub evictions: u32,
    pub nv_defines: u32,
    pub nv_writes: u32,
    pub random_calls: u32,
    pub signs: u32,
    pub ecdh_recoveries: u32,
    pub quotes: u32,
}

/// A command that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    CreatePrimary,
    Evict,
    Persist,
    NvDefine,
    NvWrite,
}

#[derive(Debug, Default)]
struct SimInner {
    state: SimState,
    stats: SimStats,
    transient: HashMap<u32, SimObject>,
    next_transient: u32,
    faults: Vec<SimFault>,
    present: bool,
    state_file: Option<PathBuf>,
}

pub struct SimModule {
    inner: Mutex<SimInner>,
}

impl Default for SimModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SimModule {
    /// An empty, present module held in memory.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                present: true,
                ..Default::default()
            }),
        }
    }

    /// A module whose device node does not exist.
    pub fn absent() -> Self {
        let module = Self::new();
        module.lock().present = false;
        module
    }

    /// A module whose state is loaded from and saved to `path`.
    pub fn with_state_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let state = match std::fs::read(path) {
            Ok(bytes) => {
                let (state, _): (SimState, usize) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard()).map_err(
                        |e| Error::Module(format!("corrupt simulator state {path:?}: {e}")),
                    )?;
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SimState::default(),
            Err(e) => return Err(Error::io(path, e)),
        };
        debug!(?path, "simulated module state loaded");
        Ok(Self {
            inner: Mutex::new(SimInner {
                state,
                present: true,
                state_file: Some(path.to_path_buf()),
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats
    }

    /// Makes the next matching command fail.
    pub fn inject_fault(&self, fault: SimFault) {
        self.lock().faults.push(fault);
    }

    pub fn set_properties(&self, words: [u32; 5]) {
        self.lock().state.properties = words;
    }

    /// `TPM2_PCR_Extend` on the SHA-256 bank.
    pub fn extend_pcr(&self, index: usize, data: &[u8]) {
        let mut inner = self.lock();
        let measurement = Sha256::digest(data);
        let pcr = &mut inner.state.pcrs[index];
        let extended = Sha256::new()
            .chain_update(&pcr[..])
            .chain_update(measurement)
            .finalize();
        *pcr = extended.to_vec();
    }

    /// Capacity of a defined slot.
    pub fn nv_capacity(&self, slot: NvSlot) -> Option<usize> {
        self.lock().state.nv.get(&slot.index()).map(|a| a.data.len())
    }

    /// Public area persisted for `role`, bypassing the channel.
    pub fn persisted_public(&self, role: KeyRole) -> Option<PublicArea> {
        self.lock()
            .state
            .persistent
            .get(&role.handle().value())
            .and_then(|o| o.public().ok())
    }

    /// `TPM2_Clear`: drops owner-hierarchy objects and every NV index.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.state.persistent.retain(|_, o| !o.owner_hierarchy);
        inner.state.nv.clear();
    }
}

impl SecurityModule for SimModule {
    type Channel<'a> = SimChannel<'a>;

    fn is_present(&self) -> bool {
        self.lock().present
    }

    fn open(&self) -> Result<SimChannel<'_>> {
        let mut inner = self.lock();
        if !inner.present {
            return Err(Error::HardwareUnavailable("simulated module".into()));
        }
        inner.stats.opens += 1;
        trace!(opens = inner.stats.opens, "simulated channel opened");
        Ok(SimChannel { inner })
    }
}

/// An open channel; holds the module lock until dropped.
pub struct SimChannel<'a> {
    inner: MutexGuard<'a, SimInner>,
}

impl Drop for SimChannel<'_> {
    fn drop(&mut self) {
        // The resource manager flushes transient objects when a connection closes.
        self.inner.transient.clear();
        if let Some(path) = self.inner.state_file.clone() {
            match bincode::encode_to_vec(&self.inner.state, bincode::config::standard()) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&path, bytes) {
                        error!(?path, error = %e, "failed to save simulator state");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode simulator state"),
            }
        }
    }
}

impl SimChannel<'_> {
    fn take_fault(&mut self, fault: SimFault) -> Result<()> {
        if let Some(pos) = self.inner.faults.iter().position(|f| *f == fault) {
            self.inner.faults.remove(pos);
            return Err(Error::Module(format!("injected {fault:?} failure")));
        }
        Ok(())
    }

    fn authorized_object(&self, role: KeyRole, auth: &[u8]) -> Result<&SimObject> {
        let object = self
            .inner
            .state
            .persistent
            .get(&role.handle().value())
            .ok_or_else(|| Error::Module(format!("TPM_RC_HANDLE: nothing at {}", role.handle())))?;
        if object.auth != auth {
            return Err(Error::Authorization);
        }
        Ok(object)
    }
}

fn ecc_secret(bytes: &[u8]) -> Result<p256::SecretKey> {
    p256::SecretKey::from_slice(bytes)
        .map_err(|e| Error::Module(format!("corrupt simulated key: {e}")))
}

fn random_vec(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::rng().fill_bytes(&mut out);
    out
}

fn generate(template: &KeyTemplate) -> SimKey {
    match template.algorithm {
        KeyAlgorithm::EccNistP256 => SimKey::Ecc {
            secret: p256::SecretKey::random(&mut rand_core::OsRng)
                .to_bytes()
                .to_vec(),
        },
        KeyAlgorithm::Rsa { bits } => {
            let mut modulus = random_vec(usize::from(bits / 8));
            modulus[0] |= 0x80;
            SimKey::Rsa {
                modulus,
                seed: random_vec(32),
            }
        }
    }
}

impl ModuleChannel for SimChannel<'_> {
    fn read_public(&mut self, role: KeyRole) -> Result<Option<PublicArea>> {
        self.inner
            .state
            .persistent
            .get(&role.handle().value())
            .map(SimObject::public)
            .transpose()
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        auth: &[u8],
    ) -> Result<(TransientObject, PublicArea)> {
        self.take_fault(SimFault::CreatePrimary)?;
        let object = SimObject {
            key: generate(template),
            auth: auth.to_vec(),
            restricted_signing: template.usage == KeyUsage::RestrictedSigning,
            owner_hierarchy: hierarchy == Hierarchy::Owner,
        };
        let public = object.public()?;
        let handle = TRANSIENT_BASE + self.inner.next_transient;
        self.inner.next_transient += 1;
        self.inner.transient.insert(handle, object);
        self.inner.stats.creations += 1;
        Ok((TransientObject(handle), public))
    }

    fn evict(&mut self, role: KeyRole) -> Result<()> {
        self.take_fault(SimFault::Evict)?;
        self.inner
            .state
            .persistent
            .remove(&role.handle().value())
            .ok_or_else(|| Error::Module(format!("TPM_RC_HANDLE: nothing at {}", role.handle())))?;
        self.inner.stats.evictions += 1;
        Ok(())
    }

    fn persist(&mut self, object: TransientObject, role: KeyRole) -> Result<()> {
        self.take_fault(SimFault::Persist)?;
        let handle = role.handle().value();
        if self.inner.state.persistent.contains_key(&handle) {
            return Err(Error::Module(format!(
                "TPM_RC_NV_DEFINED: {} is occupied",
                role.handle()
            )));
        }
        let object = self
            .inner
            .transient
            .remove(&object.0)
            .ok_or_else(|| Error::Module(format!("TPM_RC_HANDLE: no transient {:#x}", object.0)))?;
        self.inner.state.persistent.insert(handle, object);
        Ok(())
    }

    fn nv_define(&mut self, slot: NvSlot, size: u16) -> Result<()> {
        self.take_fault(SimFault::NvDefine)?;
        if self.inner.state.nv.contains_key(&slot.index()) {
            return Err(Error::Module(format!("TPM_RC_NV_DEFINED: {slot}")));
        }
        self.inner.state.nv.insert(
            slot.index(),
            NvArea {
                data: vec![0u8; usize::from(size)],
                written: false,
            },
        );
        self.inner.stats.nv_defines += 1;
        Ok(())
    }

    fn nv_undefine(&mut self, slot: NvSlot) -> Result<()> {
        self.inner
            .state
            .nv
            .remove(&slot.index())
            .map(|_| ())
            .ok_or(Error::SlotAbsent(slot))
    }

    fn nv_write(&mut self, slot: NvSlot, data: &[u8], offset: u16) -> Result<()> {
        self.take_fault(SimFault::NvWrite)?;
        if data.len() > MAX_NV_BUFFER {
            return Err(Error::Module("TPM_RC_SIZE: NV buffer too large".into()));
        }
        let area = self
            .inner
            .state
            .nv
            .get_mut(&slot.index())
            .ok_or(Error::SlotAbsent(slot))?;
        let start = usize::from(offset);
        let end = start + data.len();
        if end > area.data.len() {
            return Err(Error::Module(format!("TPM_RC_NV_RANGE: {slot}")));
        }
        area.data[start..end].copy_from_slice(data);
        area.written = true;
        self.inner.stats.nv_writes += 1;
        Ok(())
    }

    fn nv_read(&mut self, slot: NvSlot) -> Result<Vec<u8>> {
        let area = self
            .inner
            .state
            .nv
            .get(&slot.index())
            .ok_or(Error::SlotAbsent(slot))?;
        if !area.written {
            return Err(Error::Module(format!("TPM_RC_NV_UNINITIALIZED: {slot}")));
        }
        Ok(area.data.clone())
    }

    fn nv_max_buffer(&mut self) -> usize {
        MAX_NV_BUFFER
    }

    fn sign(&mut self, role: KeyRole, auth: &[u8], digest: &[u8]) -> Result<EccSignature> {
        if digest.len() > 32 {
            return Err(Error::Module("TPM_RC_SIZE: digest too large".into()));
        }
        let SimKey::Ecc { secret } = &self.authorized_object(role, auth)?.key else {
            return Err(Error::Module("TPM_RC_KEY: not an ECC key".into()));
        };
        let signing = SigningKey::from(ecc_secret(secret)?);
        let signature: Signature = signing
            .sign_prehash(digest)
            .map_err(|e| Error::Module(format!("TPM_RC_VALUE: {e}")))?;
        self.inner.stats.signs += 1;
        let (r, s) = signature.split_bytes();
        Ok(EccSignature {
            r: r.to_vec(),
            s: s.to_vec(),
        })
    }

    fn ecdh_recover(&mut self, role: KeyRole, auth: &[u8], point: &EccPoint) -> Result<EccPoint> {
        let SimKey::Ecc { secret } = &self.authorized_object(role, auth)?.key else {
            return Err(Error::Module("TPM_RC_KEY: not an ECC key".into()));
        };
        let secret = ecc_secret(secret)?;
        let peer = point
            .to_public_key()
            .map_err(|_| Error::Module("TPM_RC_ECC_POINT".into()))?;
        self.inner.stats.ecdh_recoveries += 1;
        scalar_mult(&peer, &secret)
    }

    fn get_random(&mut self, len: usize) -> Result<Vec<u8>> {
        self.inner.stats.random_calls += 1;
        Ok(random_vec(len.min(MAX_RANDOM)))
    }

    fn get_capability(&mut self, property: Property) -> Result<u32> {
        let words = self.inner.state.properties;
        Ok(match property {
            Property::Manufacturer => words[0],
            Property::VendorString1 => words[1],
            Property::VendorString2 => words[2],
            Property::FirmwareVersion1 => words[3],
            Property::FirmwareVersion2 => words[4],
        })
    }

    fn pcr_read(&mut self, index: u8) -> Result<Vec<u8>> {
        self.inner
            .state
            .pcrs
            .get(usize::from(index))
            .cloned()
            .ok_or_else(|| Error::Module(format!("TPM_RC_VALUE: no PCR {index}")))
    }

    fn quote(&mut self, role: KeyRole, nonce: &[u8], pcrs: &[u8]) -> Result<Attestation> {
        let mut composite = Sha256::new();
        for index in pcrs {
            composite.update(self.pcr_read(*index)?);
        }
        let composite = composite.finalize();

        let object = self.authorized_object(role, &[])?;
        let SimKey::Rsa { seed, .. } = &object.key else {
            return Err(Error::Module("TPM_RC_KEY: not a signing key".into()));
        };
        if !object.restricted_signing {
            return Err(Error::Module("TPM_RC_ATTRIBUTES: not a restricted signing key".into()));
        }

        let mut attest = b"SIMQ".to_vec();
        attest.extend_from_slice(&composite);
        attest.extend_from_slice(nonce);
        let signature = Sha256::new()
            .chain_update(seed)
            .chain_update(&attest)
            .finalize()
            .to_vec();
        self.inner.stats.quotes += 1;
        Ok(Attestation { attest, signature })
    }
}

//! The hardware backend: a TSS ESAPI context per open channel.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, error, instrument, trace};
use tss_esapi::Context;
use tss_esapi::abstraction::nv as tss_nv;
use tss_esapi::attributes::{NvIndexAttributesBuilder, ObjectAttributesBuilder};
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::constants::response_code::Tss2ResponseCodeKind;
use tss_esapi::constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK};
use tss_esapi::handles::{
    KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle, PersistentTpmHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm, RsaSchemeAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{
    Hierarchy as TssHierarchy, NvAuth, Provision,
};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    Auth, Data, Digest, EccParameter, EccPoint as TssEccPoint, EccScheme, HashScheme,
    HashcheckTicket, KeyDerivationFunctionScheme, MaxNvBuffer, NvPublicBuilder, PcrSelectionList,
    PcrSlot, Public, PublicBuilder, PublicEccParametersBuilder, PublicKeyRsa,
    PublicRsaParametersBuilder, RsaExponent, RsaScheme, Signature, SignatureScheme,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::Marshall;
use tss_esapi::tss2_esys::TPMT_TK_HASHCHECK;

use crate::error::{Error, Result};
use crate::handles::{Hierarchy, KeyRole, NvSlot};
use crate::module::{
    Attestation, EccPoint, EccSignature, ModuleChannel, Property, PublicArea, SecurityModule,
    TransientObject,
};
use crate::template::{KeyAlgorithm, KeyTemplate, KeyUsage};

/// Largest request the module reliably honours for `TPM2_GetRandom`.
const MAX_TPM_RANDOM_BUF: usize = 48;

/// TCTI from `TPM2TOOLS_TCTI`/`TCTI`, falling back to the resource manager
/// device node.
pub fn default_tcti_handle(device_node: &Path) -> Result<TctiNameConf> {
    if let Ok(tcti) = TctiNameConf::from_environment_variable() {
        return Ok(tcti);
    }
    device_tcti(device_node)
}

pub fn device_tcti(device_node: &Path) -> Result<TctiNameConf> {
    let path = device_node.to_string_lossy();
    Ok(TctiNameConf::Device(DeviceConfig::from_str(&path)?))
}

/// Kind of a TPM-generated response code, or `None` for errors raised
/// by the wrapper itself.
fn tpm_rc(err: &tss_esapi::Error) -> Option<Tss2ResponseCodeKind> {
    match err {
        tss_esapi::Error::Tss2Error(code) => code.kind(),
        tss_esapi::Error::WrapperError(_) => None,
    }
}

fn is_missing_handle(err: &tss_esapi::Error) -> bool {
    tpm_rc(err) == Some(Tss2ResponseCodeKind::Handle)
}

fn auth_checked(err: tss_esapi::Error) -> Error {
    match tpm_rc(&err) {
        Some(Tss2ResponseCodeKind::AuthFail | Tss2ResponseCodeKind::BadAuth) => {
            Error::Authorization
        }
        _ => Error::Tss(err),
    }
}

pub struct TssModule {
    tcti: TctiNameConf,
    device_node: PathBuf,
}

impl TssModule {
    pub fn new(tcti: TctiNameConf, device_node: impl Into<PathBuf>) -> Self {
        Self {
            tcti,
            device_node: device_node.into(),
        }
    }

    /// `tcti` in tpm2-tools syntax; without one the environment and then the
    /// device node are tried.
    pub fn from_tcti_name(tcti: Option<&str>, device_node: impl Into<PathBuf>) -> Result<Self> {
        let device_node = device_node.into();
        let tcti = match tcti {
            Some(name) => TctiNameConf::from_str(name)?,
            None => default_tcti_handle(&device_node)?,
        };
        Ok(Self::new(tcti, device_node))
    }
}

impl SecurityModule for TssModule {
    type Channel<'a> = TssChannel;

    fn is_present(&self) -> bool {
        match self.tcti {
            TctiNameConf::Device(_) => self.device_node.exists(),
            _ => true,
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn open(&self) -> Result<TssChannel> {
        if !self.is_present() {
            return Err(Error::HardwareUnavailable(self.device_node.display().to_string()));
        }
        let ctx = Context::new(self.tcti.clone()).map_err(|e| {
            error!(error = %e, "failed to open TSS context");
            Error::HardwareUnavailable(format!("{}: {e}", self.device_node.display()))
        })?;
        Ok(TssChannel { ctx })
    }
}

/// One ESAPI context. Transient objects are flushed by the resource manager
/// when it is dropped.
pub struct TssChannel {
    ctx: Context,
}

fn persistent(role: KeyRole) -> Result<PersistentTpmHandle> {
    Ok(PersistentTpmHandle::new(role.handle().value())?)
}

fn nv_index(slot: NvSlot) -> Result<NvIndexTpmHandle> {
    Ok(NvIndexTpmHandle::new(slot.index())?)
}

fn rsa_bits(bits: u16) -> Result<RsaKeyBits> {
    Ok(RsaKeyBits::try_from(bits)?)
}

/// Builds the `TPMT_PUBLIC` template for a key descriptor.
fn public_template(template: &KeyTemplate) -> Result<Public> {
    let a = template.attributes;
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(a.fixed_tpm)
        .with_fixed_parent(a.fixed_parent)
        .with_sensitive_data_origin(a.sensitive_data_origin)
        .with_user_with_auth(a.user_with_auth)
        .with_admin_with_policy(a.admin_with_policy)
        .with_no_da(a.no_da)
        .with_restricted(template.is_restricted())
        .with_decrypt(template.can_decrypt())
        .with_sign_encrypt(template.can_sign())
        .build()?;

    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_auth_policy(Digest::try_from(template.auth_policy.to_vec())?);

    let public = match (template.algorithm, template.usage) {
        (KeyAlgorithm::Rsa { bits }, KeyUsage::StorageParent) => {
            let params = PublicRsaParametersBuilder::new_restricted_decryption_key(
                SymmetricDefinitionObject::AES_128_CFB,
                rsa_bits(bits)?,
                RsaExponent::default(),
            )
            .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(params)
                .with_rsa_unique_identifier(PublicKeyRsa::new_empty_with_size(rsa_bits(bits)?))
                .build()?
        }
        (KeyAlgorithm::Rsa { bits }, KeyUsage::RestrictedSigning) => {
            let params = PublicRsaParametersBuilder::new()
                .with_scheme(RsaScheme::create(
                    RsaSchemeAlgorithm::RsaSsa,
                    Some(HashingAlgorithm::Sha256),
                )?)
                .with_key_bits(rsa_bits(bits)?)
                .with_exponent(RsaExponent::default())
                .with_symmetric(SymmetricDefinitionObject::Null)
                .with_is_signing_key(true)
                .with_is_decryption_key(false)
                .with_restricted(true)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(params)
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build()?
        }
        (KeyAlgorithm::EccNistP256, KeyUsage::SignAndDecrypt) => {
            let params = PublicEccParametersBuilder::new()
                .with_ecc_scheme(EccScheme::Null)
                .with_curve(EccCurve::NistP256)
                .with_is_signing_key(true)
                .with_is_decryption_key(true)
                .with_restricted(false)
                .with_symmetric(SymmetricDefinitionObject::Null)
                .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_ecc_parameters(params)
                .with_ecc_unique_identifier(TssEccPoint::default())
                .build()?
        }
        (algorithm, usage) => {
            return Err(Error::Module(format!(
                "no template for {algorithm:?} used as {usage:?}"
            )));
        }
    };
    trace!(?public, "key template built");
    Ok(public)
}

fn public_area(public: &Public) -> Result<PublicArea> {
    match public {
        Public::Ecc { unique, .. } => Ok(PublicArea::Ecc(EccPoint::from_coordinates(
            unique.x().value(),
            unique.y().value(),
        )?)),
        Public::Rsa { unique, .. } => Ok(PublicArea::Rsa {
            modulus: unique.value().to_vec(),
        }),
        other => Err(Error::Module(format!(
            "unexpected public area type: {other:?}"
        ))),
    }
}

fn pcr_selection(indices: &[u8]) -> Result<PcrSelectionList> {
    let slots = indices
        .iter()
        .map(|i| PcrSlot::try_from(1u32 << i))
        .collect::<core::result::Result<Vec<_>, _>>()?;
    Ok(PcrSelectionList::builder()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()?)
}

fn null_hashcheck() -> Result<HashcheckTicket> {
    Ok(HashcheckTicket::try_from(TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    })?)
}

impl TssChannel {
    /// ESYS handle for whatever is persisted at the role's handle.
    fn persistent_object(&mut self, role: KeyRole) -> Result<ObjectHandle> {
        let handle = persistent(role)?;
        Ok(self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))?)
    }

    /// The persisted key with `auth` attached for a password session.
    fn authorized_key(&mut self, role: KeyRole, auth: &[u8]) -> Result<KeyHandle> {
        let object = self.persistent_object(role)?;
        self.ctx
            .tr_set_auth(object, Auth::try_from(auth.to_vec())?)?;
        Ok(KeyHandle::from(object))
    }

    fn nv_handle(&mut self, slot: NvSlot) -> Result<NvIndexHandle> {
        let index = nv_index(slot)?;
        self.ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(index)))
            .map(NvIndexHandle::from)
            .map_err(|e| {
                if is_missing_handle(&e) {
                    Error::SlotAbsent(slot)
                } else {
                    Error::Tss(e)
                }
            })
    }
}

impl ModuleChannel for TssChannel {
    fn read_public(&mut self, role: KeyRole) -> Result<Option<PublicArea>> {
        let object = match self.persistent_object(role) {
            Ok(object) => object,
            Err(Error::Tss(e)) if is_missing_handle(&e) => {
                debug!(%role, "nothing persisted");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let (public, _, _) = self
            .ctx
            .execute_without_session(|ctx| ctx.read_public(KeyHandle::from(object)))?;
        public_area(&public).map(Some)
    }

    #[instrument(level = "debug", skip(self, template, auth))]
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        auth: &[u8],
    ) -> Result<(TransientObject, PublicArea)> {
        let public = public_template(template)?;
        let hierarchy = match hierarchy {
            Hierarchy::Owner => TssHierarchy::Owner,
            Hierarchy::Endorsement => TssHierarchy::Endorsement,
        };
        let auth = if auth.is_empty() {
            None
        } else {
            Some(Auth::try_from(auth.to_vec())?)
        };
        let created = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(hierarchy, public, auth, None, None, None)
        })?;
        let area = public_area(&created.out_public)?;
        Ok((TransientObject(created.key_handle.value()), area))
    }

    fn evict(&mut self, role: KeyRole) -> Result<()> {
        let object = self.persistent_object(role)?;
        let handle = persistent(role)?;
        self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(Provision::Owner, object, Persistent::from(handle))
        })?;
        Ok(())
    }

    fn persist(&mut self, object: TransientObject, role: KeyRole) -> Result<()> {
        let handle = persistent(role)?;
        self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(
                Provision::Owner,
                ObjectHandle::from(object.0),
                Persistent::from(handle),
            )
        })?;
        Ok(())
    }

    fn nv_define(&mut self, slot: NvSlot, size: u16) -> Result<()> {
        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_owner_read(true)
            .build()?;
        let public = NvPublicBuilder::new()
            .with_nv_index(nv_index(slot)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(usize::from(size))
            .build()?;
        self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.nv_define_space(Provision::Owner, None, public)
        })?;
        Ok(())
    }

    fn nv_undefine(&mut self, slot: NvSlot) -> Result<()> {
        let handle = self.nv_handle(slot)?;
        self.ctx
            .execute_with_nullauth_session(|ctx| ctx.nv_undefine_space(Provision::Owner, handle))?;
        Ok(())
    }

    fn nv_write(&mut self, slot: NvSlot, data: &[u8], offset: u16) -> Result<()> {
        let handle = self.nv_handle(slot)?;
        let buffer = MaxNvBuffer::try_from(data.to_vec())?;
        self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.nv_write(NvAuth::Owner, handle, buffer, offset)
        })?;
        Ok(())
    }

    fn nv_read(&mut self, slot: NvSlot) -> Result<Vec<u8>> {
        // resolves the index first so absence is reported as such
        self.nv_handle(slot)?;
        let index = nv_index(slot)?;
        Ok(self
            .ctx
            .execute_with_nullauth_session(|ctx| tss_nv::read_full(ctx, NvAuth::Owner, index))?)
    }

    fn nv_max_buffer(&mut self) -> usize {
        match self.ctx.get_tpm_property(PropertyTag::NvBufferMax) {
            Ok(Some(max)) => (max as usize).min(MaxNvBuffer::MAX_SIZE),
            _ => MaxNvBuffer::MAX_SIZE,
        }
    }

    #[instrument(level = "debug", skip(self, auth, digest))]
    fn sign(&mut self, role: KeyRole, auth: &[u8], digest: &[u8]) -> Result<EccSignature> {
        let key = self.authorized_key(role, auth)?;
        let digest = Digest::try_from(digest.to_vec())?;
        let scheme = SignatureScheme::EcDsa {
            hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
        };
        let ticket = null_hashcheck()?;
        let signature = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.sign(key, digest, scheme, ticket)
            })
            .map_err(auth_checked)?;
        match signature {
            Signature::EcDsa(sig) => Ok(EccSignature {
                r: sig.signature_r().value().to_vec(),
                s: sig.signature_s().value().to_vec(),
            }),
            other => Err(Error::Module(format!("unexpected signature: {other:?}"))),
        }
    }

    fn ecdh_recover(&mut self, role: KeyRole, auth: &[u8], point: &EccPoint) -> Result<EccPoint> {
        let key = self.authorized_key(role, auth)?;
        let input = TssEccPoint::new(
            EccParameter::try_from(point.x().to_vec())?,
            EccParameter::try_from(point.y().to_vec())?,
        );
        let shared = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.ecdh_z_gen(key, input)
            })
            .map_err(auth_checked)?;
        EccPoint::from_coordinates(shared.x().value(), shared.y().value())
    }

    fn get_random(&mut self, len: usize) -> Result<Vec<u8>> {
        let random = self.ctx.get_random(len.min(MAX_TPM_RANDOM_BUF))?;
        Ok(random.value().to_vec())
    }

    fn get_capability(&mut self, property: Property) -> Result<u32> {
        let tag = match property {
            Property::Manufacturer => PropertyTag::Manufacturer,
            Property::VendorString1 => PropertyTag::VendorString1,
            Property::VendorString2 => PropertyTag::VendorString2,
            Property::FirmwareVersion1 => PropertyTag::FirmwareVersion1,
            Property::FirmwareVersion2 => PropertyTag::FirmwareVersion2,
        };
        self.ctx
            .get_tpm_property(tag)?
            .ok_or_else(|| Error::Module(format!("property {:#x} not reported", property.code())))
    }

    fn pcr_read(&mut self, index: u8) -> Result<Vec<u8>> {
        let selection = pcr_selection(&[index])?;
        let (_, _, digests) = self
            .ctx
            .execute_without_session(|ctx| ctx.pcr_read(selection))?;
        digests
            .value()
            .first()
            .map(|d| d.value().to_vec())
            .ok_or_else(|| Error::Module(format!("PCR {index} not in SHA-256 bank")))
    }

    #[instrument(level = "debug", skip(self, nonce))]
    fn quote(&mut self, role: KeyRole, nonce: &[u8], pcrs: &[u8]) -> Result<Attestation> {
        let key = KeyHandle::from(self.persistent_object(role)?);
        let selection = pcr_selection(pcrs)?;
        let qualifying = Data::try_from(nonce.to_vec())?;
        let (attest, signature) = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.quote(key, qualifying, SignatureScheme::Null, selection)
        })?;
        Ok(Attestation {
            attest: attest.marshall()?,
            signature: signature.marshall()?,
        })
    }
}

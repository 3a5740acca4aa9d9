//! Creates the primary keys and pins them at their persistent handles.

use std::path::Path;

use p256::pkcs8::EncodePublicKey;
use tracing::{error, info, instrument};

use crate::credential::OwnerCredential;
use crate::error::{Error, Result};
use crate::handles::KeyRole;
use crate::module::{ModuleChannel, PublicArea, SecurityModule};

/// Roles making up the platform identity, in provisioning order.
pub const IDENTITY_ROLES: [KeyRole; 3] = [KeyRole::Ek, KeyRole::Srk, KeyRole::Ak];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    AlreadyPresent,
}

fn failed(role: KeyRole, cause: Error) -> Error {
    let err = Error::provisioning(role, cause);
    error!(%role, "{err}");
    err
}

/// Create, evict the previous occupant if any, persist.
fn install<C: ModuleChannel>(
    channel: &mut C,
    role: KeyRole,
    auth: &[u8],
    occupied: bool,
) -> Result<PublicArea> {
    let (object, public) = channel
        .create_primary(role.hierarchy(), role.template(), auth)
        .map_err(|e| failed(role, e))?;
    if occupied {
        channel.evict(role).map_err(|e| failed(role, e))?;
    }
    channel.persist(object, role).map_err(|e| failed(role, e))?;
    info!(%role, "key provisioned");
    Ok(public)
}

/// Makes sure `role` has a key at its handle.
///
/// With `overwrite` unset an existing key is left alone; otherwise it is
/// replaced by a freshly created one. Keys bound to the owner credential go
/// through [`provision_device_key`] instead.
#[instrument(level = "debug", skip(module))]
pub fn provision<M: SecurityModule>(
    module: &M,
    role: KeyRole,
    overwrite: bool,
) -> Result<Provisioned> {
    if role.uses_owner_credential() {
        return Err(Error::Module(format!(
            "{role} is authorized by the owner credential and has no empty-auth form"
        )));
    }
    let mut channel = module.open()?;
    let occupied = channel.read_public(role)?.is_some();
    if occupied && !overwrite {
        info!(%role, "key already present");
        return Ok(Provisioned::AlreadyPresent);
    }
    install(&mut channel, role, &[], occupied)?;
    Ok(Provisioned::Created)
}

/// Replaces the device key, authorized by `credential`, and writes its public
/// half as DER SubjectPublicKeyInfo to `pubkey_path`.
#[instrument(level = "debug", skip(module, credential))]
pub fn provision_device_key<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
    pubkey_path: &Path,
) -> Result<p256::PublicKey> {
    let role = KeyRole::Device;
    let public = {
        let mut channel = module.open()?;
        let occupied = channel.read_public(role)?.is_some();
        install(&mut channel, role, credential.authorization(), occupied)?
    };

    let public = public
        .as_ecc()
        .ok_or_else(|| Error::Module(format!("{role} is not an ECC key")))?
        .to_public_key()?;
    let der = public
        .to_public_key_der()
        .map_err(|e| Error::Format(format!("cannot encode device public key: {e}")))?;
    std::fs::write(pubkey_path, der.as_bytes()).map_err(|e| Error::io(pubkey_path, e))?;
    Ok(public)
}

/// Identity keys, kept if already present.
pub fn provision_identity<M: SecurityModule>(module: &M) -> Result<()> {
    for role in IDENTITY_ROLES {
        provision(module, role, false)?;
    }
    Ok(())
}

/// Every key, replacing whatever is there.
pub fn provision_all<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
    pubkey_path: &Path,
) -> Result<()> {
    provision_device_key(module, credential, pubkey_path)?;
    for role in IDENTITY_ROLES {
        provision(module, role, true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFault, SimModule};
    use p256::pkcs8::DecodePublicKey;
    use tracing_test::traced_test;

    #[test]
    fn second_provision_is_a_no_op() {
        let module = SimModule::new();
        assert_eq!(provision(&module, KeyRole::Srk, false).unwrap(), Provisioned::Created);
        let before = module.persisted_public(KeyRole::Srk);
        assert_eq!(
            provision(&module, KeyRole::Srk, false).unwrap(),
            Provisioned::AlreadyPresent
        );
        assert_eq!(module.stats().creations, 1);
        assert_eq!(module.persisted_public(KeyRole::Srk), before);
    }

    #[test]
    fn overwrite_replaces_the_key() {
        let module = SimModule::new();
        provision(&module, KeyRole::Ak, true).unwrap();
        let before = module.persisted_public(KeyRole::Ak);
        provision(&module, KeyRole::Ak, true).unwrap();
        let stats = module.stats();
        assert_eq!(stats.creations, 2);
        assert_eq!(stats.evictions, 1);
        assert_ne!(module.persisted_public(KeyRole::Ak), before);
    }

    #[test]
    fn device_key_needs_the_owner_credential() {
        let module = SimModule::new();
        assert!(matches!(
            provision(&module, KeyRole::Device, false),
            Err(Error::Module(_))
        ));
        assert_eq!(module.stats().opens, 0);
        assert!(module.persisted_public(KeyRole::Device).is_none());
    }

    #[test]
    fn empty_handle_is_not_evicted() {
        let module = SimModule::new();
        provision(&module, KeyRole::Ek, true).unwrap();
        assert_eq!(module.stats().evictions, 0);
    }

    #[test]
    #[traced_test]
    fn failure_carries_reset_hint() {
        let module = SimModule::new();
        module.inject_fault(SimFault::CreatePrimary);
        let err = provision(&module, KeyRole::Srk, false).unwrap_err();
        assert!(matches!(err, Error::Provisioning { role: KeyRole::Srk, .. }));
        assert!(err.to_string().contains("TPM reset"));
        assert!(logs_contain("failed to provision storage root key"));
    }

    #[test]
    fn persist_failure_is_a_provisioning_error() {
        let module = SimModule::new();
        module.inject_fault(SimFault::Persist);
        assert!(matches!(
            provision(&module, KeyRole::Ek, false),
            Err(Error::Provisioning { role: KeyRole::Ek, .. })
        ));
        assert!(module.persisted_public(KeyRole::Ek).is_none());
    }

    #[test]
    fn identity_uses_one_channel_per_key() {
        let module = SimModule::new();
        provision_identity(&module).unwrap();
        assert_eq!(module.stats().opens, 3);
        for role in IDENTITY_ROLES {
            assert!(module.persisted_public(role).is_some(), "{role}");
        }
        assert!(module.persisted_public(KeyRole::Device).is_none());

        provision_identity(&module).unwrap();
        assert_eq!(module.stats().creations, 3);
    }

    #[test]
    fn device_key_public_half_is_written_as_der() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpm.eccpubk.der");
        let module = SimModule::new();
        let credential = OwnerCredential::from_bytes(b"credential");

        let public = provision_device_key(&module, &credential, &path).unwrap();
        let written = p256::PublicKey::from_public_key_der(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, public);
    }

    #[test]
    fn provision_all_replaces_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub.der");
        let module = SimModule::new();
        let credential = OwnerCredential::from_bytes(b"credential");

        provision_identity(&module).unwrap();
        provision_all(&module, &credential, &path).unwrap();
        for role in KeyRole::ALL {
            assert!(module.persisted_public(role).is_some(), "{role}");
        }
        let stats = module.stats();
        assert_eq!(stats.creations, 7);
        assert_eq!(stats.evictions, 3);
    }
}

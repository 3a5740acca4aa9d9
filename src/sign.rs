//! Device-key signatures over caller-supplied digests.

use tracing::{error, instrument};

use crate::credential::OwnerCredential;
use crate::error::{Error, Result};
use crate::handles::KeyRole;
use crate::module::{EccSignature, ModuleChannel, SecurityModule};

/// Largest digest the device key signs; longer input is cut to this.
pub const MAX_DIGEST_LEN: usize = 32;

/// ECDSA-SHA256 over a precomputed digest with the device key.
///
/// Only the first 32 bytes of `digest` are signed.
#[instrument(level = "debug", skip_all, fields(len = digest.len()))]
pub fn sign_digest<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
    digest: &[u8],
) -> Result<EccSignature> {
    if digest.is_empty() {
        return Err(Error::Format("cannot sign an empty digest".into()));
    }
    let digest = &digest[..digest.len().min(MAX_DIGEST_LEN)];

    let mut channel = module.open()?;
    channel
        .sign(KeyRole::Device, credential.authorization(), digest)
        .inspect_err(|e| error!(error = %e, "device key signing failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::provision_device_key;
    use crate::sim::SimModule;
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use sha2::{Digest, Sha256};

    fn setup() -> (SimModule, OwnerCredential, VerifyingKey) {
        let dir = tempfile::tempdir().unwrap();
        let module = SimModule::new();
        let credential = OwnerCredential::from_bytes(b"0f1e2d3c-aaaa-bbbb-cccc-000000000000\n");
        provision_device_key(&module, &credential, &dir.path().join("ecc.der")).unwrap();
        let public = crate::ecdh::device_public_from_module(&module).unwrap();
        (module, credential, VerifyingKey::from(&public))
    }

    fn to_signature(sig: &EccSignature) -> Signature {
        Signature::from_scalars(
            *p256::FieldBytes::from_slice(&sig.r),
            *p256::FieldBytes::from_slice(&sig.s),
        )
        .unwrap()
    }

    #[test]
    fn signature_verifies_against_device_key() {
        let (module, credential, verifying) = setup();
        let digest = Sha256::digest(b"hello");
        let sig = sign_digest(&module, &credential, &digest).unwrap();
        verifying
            .verify_prehash(&digest, &to_signature(&sig))
            .unwrap();
    }

    #[test]
    fn long_digest_is_truncated() {
        let (module, credential, verifying) = setup();
        let long: Vec<u8> = (0..48).collect();
        let sig = sign_digest(&module, &credential, &long).unwrap();
        verifying
            .verify_prehash(&long[..32], &to_signature(&sig))
            .unwrap();
    }

    #[test]
    fn empty_digest_is_rejected() {
        let (module, credential, _) = setup();
        let opens = module.stats().opens;
        assert!(matches!(
            sign_digest(&module, &credential, &[]),
            Err(Error::Format(_))
        ));
        assert_eq!(module.stats().opens, opens);
    }

    #[test]
    fn only_the_first_seven_credential_bytes_matter() {
        let (module, _, verifying) = setup();
        // same 7-byte prefix, different tail
        let other = OwnerCredential::from_bytes(b"0f1e2d3-something-else");
        let digest = [9u8; 32];
        let sig = sign_digest(&module, &other, &digest).unwrap();
        verifying.verify_prehash(&digest, &to_signature(&sig)).unwrap();
    }

    #[test]
    fn wrong_credential_is_rejected() {
        let (module, _, _) = setup();
        let wrong = OwnerCredential::from_bytes(b"ffffffff-0000");
        assert!(matches!(
            sign_digest(&module, &wrong, &[1; 32]),
            Err(Error::Authorization)
        ));
    }
}

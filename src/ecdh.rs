//! ECDH payload delivery to the device.
//!
//! A remote peer holding the device public key `B` picks an ephemeral pair
//! `(a, A)`, computes `S = a·B`, derives `K = SHA-256(x(S) ‖ y(S))` and sends
//! `(A, iv, AES-256-CFB_K(plaintext))`. The device asks the module for
//! `S' = d·A` without ever seeing `d`, derives the same key and decrypts.
//!
//! Both coordinates go into the hash at their full 32-byte width. A side that
//! strips leading zero bytes derives a different key for roughly one exchange
//! in 128 and the payload decrypts to garbage without any error.
//!
//! The channel only provides confidentiality; it assumes the transport that
//! carries `(A, iv, ciphertext)` is authenticated.

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use x509_cert::Certificate;
use x509_cert::der::DecodePem;

use crate::credential::OwnerCredential;
use crate::error::{Error, Result};
use crate::handles::KeyRole;
use crate::module::{EccPoint, ModuleChannel, SecurityModule};

pub const IV_LEN: usize = 16;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// What the peer sends to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub peer_point: EccPoint,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// `secret · public`, the point both sides must agree on.
pub fn scalar_mult(public: &p256::PublicKey, secret: &p256::SecretKey) -> Result<EccPoint> {
    let shared = (public.to_projective() * *secret.to_nonzero_scalar()).to_affine();
    let encoded = shared.to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => EccPoint::from_coordinates(x, y),
        _ => Err(Error::Format("shared point is the identity".into())),
    }
}

/// `SHA-256(x ‖ y)` over the fixed-width coordinates.
pub fn derive_key(point: &EccPoint) -> [u8; 32] {
    Sha256::digest(point.to_bytes()).into()
}

fn cfb_encrypt(key: &[u8; 32], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut buf = plaintext.to_vec();
    Aes256CfbEnc::new(key.into(), iv.into()).encrypt(&mut buf);
    buf
}

fn cfb_decrypt(key: &[u8; 32], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = ciphertext.to_vec();
    Aes256CfbDec::new(key.into(), iv.into()).decrypt(&mut buf);
    buf
}

/// Peer side: encrypts `plaintext` so only the holder of `device_public`'s
/// private key can read it. A fresh ephemeral key and IV are drawn per call.
pub fn seal_for_device(device_public: &p256::PublicKey, plaintext: &[u8]) -> Result<SealedPayload> {
    let ephemeral = p256::SecretKey::random(&mut rand_core::OsRng);
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    seal_with(device_public, &ephemeral, iv, plaintext)
}

pub(crate) fn seal_with(
    device_public: &p256::PublicKey,
    ephemeral: &p256::SecretKey,
    iv: [u8; IV_LEN],
    plaintext: &[u8],
) -> Result<SealedPayload> {
    let shared = scalar_mult(device_public, ephemeral)?;
    let key = derive_key(&shared);
    Ok(SealedPayload {
        peer_point: EccPoint::from_public_key(&ephemeral.public_key())?,
        iv,
        ciphertext: cfb_encrypt(&key, &iv, plaintext),
    })
}

/// Device side: recovers the shared point through the module and decrypts.
///
/// Every failure is reported as [`Error::Decrypt`].
#[instrument(level = "debug", skip_all, fields(len = ciphertext.len()))]
pub fn decrypt_with_ecdh<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
    peer_point: &EccPoint,
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| {
        debug!(iv_len = iv.len(), "bad IV length");
        Error::Decrypt
    })?;

    let shared = module
        .open()
        .and_then(|mut channel| {
            channel.ecdh_recover(KeyRole::Device, credential.authorization(), peer_point)
        })
        .map_err(|e| {
            debug!(error = %e, "shared secret recovery failed");
            Error::Decrypt
        })?;

    Ok(cfb_decrypt(&derive_key(&shared), iv, ciphertext))
}

/// Extracts the P-256 public key from a PEM device certificate.
pub fn device_public_from_cert(pem: &[u8]) -> Result<p256::PublicKey> {
    let cert = Certificate::from_pem(pem)
        .map_err(|e| Error::Format(format!("cannot parse device certificate: {e}")))?;
    let spki = &cert.tbs_certificate.subject_public_key_info;
    p256::PublicKey::from_sec1_bytes(spki.subject_public_key.raw_bytes())
        .map_err(|e| Error::Format(format!("device certificate key is not P-256: {e}")))
}

/// The device key's public point as persisted in the module.
pub fn device_public_from_module<M: SecurityModule>(module: &M) -> Result<p256::PublicKey> {
    let public = module.open()?.read_public(KeyRole::Device)?;
    public
        .as_ref()
        .and_then(|p| p.as_ecc())
        .ok_or_else(|| Error::Module(format!("no ECC key at {}", KeyRole::Device)))?
        .to_public_key()
}

/// Checks that the module derives the same shared point as a software peer.
pub fn self_test_shared_secret<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
) -> Result<bool> {
    let device_public = device_public_from_module(module)?;
    let ephemeral = p256::SecretKey::random(&mut rand_core::OsRng);
    let expected = scalar_mult(&device_public, &ephemeral)?;

    let peer_point = EccPoint::from_public_key(&ephemeral.public_key())?;
    let recovered = module.open()?.ecdh_recover(
        KeyRole::Device,
        credential.authorization(),
        &peer_point,
    )?;
    Ok(recovered == expected)
}

/// Full exchange: seals a fixed message to `device_public` and opens it
/// through the module.
pub fn self_test_exchange<M: SecurityModule>(
    module: &M,
    credential: &OwnerCredential,
    device_public: &p256::PublicKey,
) -> Result<bool> {
    let message = b"this is the secret";
    let sealed = seal_for_device(device_public, message)?;
    let recovered = decrypt_with_ecdh(
        module,
        credential,
        &sealed.peer_point,
        &sealed.iv,
        &sealed.ciphertext,
    )?;
    Ok(recovered == message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::provision_device_key;
    use crate::sim::SimModule;

    fn random_pair() -> (p256::SecretKey, p256::PublicKey) {
        let secret = p256::SecretKey::random(&mut rand_core::OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    fn provisioned() -> (SimModule, OwnerCredential, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let module = SimModule::new();
        let credential = OwnerCredential::from_bytes(b"1c2d3e4f-aaaa-bbbb-cccc-000000000000\n");
        provision_device_key(&module, &credential, &dir.path().join("pub.der")).unwrap();
        (module, credential, dir)
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let (a, big_a) = random_pair();
        let (d, big_b) = random_pair();
        let peer = scalar_mult(&big_b, &a).unwrap();
        let device = scalar_mult(&big_a, &d).unwrap();
        assert_eq!(peer, device);
        assert_eq!(derive_key(&peer), derive_key(&device));
    }

    #[test]
    fn leading_zero_coordinates_keep_full_width() {
        let (d, big_b) = random_pair();
        // About one in 256 ephemeral keys gives a shared x with a zero top byte.
        let (a, shared) = (0..20_000)
            .map(|_| random_pair().0)
            .find_map(|a| {
                let s = scalar_mult(&big_b, &a).unwrap();
                (s.x()[0] == 0).then_some((a, s))
            })
            .expect("no leading-zero shared point found");

        let mut stripped = shared.x()[1..].to_vec();
        stripped.extend_from_slice(shared.y());
        let stripped_key: [u8; 32] = Sha256::digest(&stripped).into();
        assert_ne!(derive_key(&shared), stripped_key);

        // Reconstructing the point from stripped big-endian coordinates
        // must land on the same key.
        let rebuilt = EccPoint::from_coordinates(&shared.x()[1..], shared.y()).unwrap();
        assert_eq!(derive_key(&rebuilt), derive_key(&shared));

        let device_side = scalar_mult(&a.public_key(), &d).unwrap();
        assert_eq!(derive_key(&device_side), derive_key(&shared));

        let sealed = seal_with(&big_b, &a, [9; IV_LEN], b"payload").unwrap();
        let key = derive_key(&device_side);
        assert_eq!(cfb_decrypt(&key, &sealed.iv, &sealed.ciphertext), b"payload");
    }

    #[test]
    fn round_trips_through_the_module() {
        let (module, credential, _dir) = provisioned();
        let device_public = device_public_from_module(&module).unwrap();

        let mut seen_ivs = Vec::new();
        for len in [0usize, 1, 19, 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let sealed = seal_for_device(&device_public, &plaintext).unwrap();
            assert_eq!(sealed.ciphertext.len(), len);
            assert!(!seen_ivs.contains(&sealed.iv));
            seen_ivs.push(sealed.iv);

            let opened = decrypt_with_ecdh(
                &module,
                &credential,
                &sealed.peer_point,
                &sealed.iv,
                &sealed.ciphertext,
            )
            .unwrap();
            assert_eq!(opened, plaintext, "len {len}");
        }
    }

    #[test]
    fn wrong_credential_is_opaque_failure() {
        let (module, _credential, _dir) = provisioned();
        let device_public = device_public_from_module(&module).unwrap();
        let sealed = seal_for_device(&device_public, b"secret").unwrap();
        let wrong = OwnerCredential::from_bytes(b"ffffffff-0000");
        let err = decrypt_with_ecdh(&module, &wrong, &sealed.peer_point, &sealed.iv, &sealed.ciphertext)
            .unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn off_curve_point_is_opaque_failure() {
        let (module, credential, _dir) = provisioned();
        let bogus = EccPoint::from_coordinates(&[1; 32], &[2; 32]).unwrap();
        let err = decrypt_with_ecdh(&module, &credential, &bogus, &[0; IV_LEN], b"x").unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn bad_iv_length_is_opaque_failure() {
        let (module, credential, _dir) = provisioned();
        let device_public = device_public_from_module(&module).unwrap();
        let sealed = seal_for_device(&device_public, b"secret").unwrap();
        let err = decrypt_with_ecdh(&module, &credential, &sealed.peer_point, &sealed.iv[..8], &sealed.ciphertext)
            .unwrap_err();
        assert!(matches!(err, Error::Decrypt));
    }

    #[test]
    fn corrupted_iv_yields_different_plaintext() {
        let (module, credential, _dir) = provisioned();
        let device_public = device_public_from_module(&module).unwrap();
        let sealed = seal_for_device(&device_public, b"a message longer than one block").unwrap();
        let mut iv = sealed.iv;
        iv[0] ^= 0xFF;
        let opened =
            decrypt_with_ecdh(&module, &credential, &sealed.peer_point, &iv, &sealed.ciphertext)
                .unwrap();
        assert_ne!(opened, b"a message longer than one block");
    }

    #[test]
    fn self_tests_pass_against_simulator() {
        let (module, credential, _dir) = provisioned();
        assert!(self_test_shared_secret(&module, &credential).unwrap());
        let device_public = device_public_from_module(&module).unwrap();
        assert!(self_test_exchange(&module, &credential, &device_public).unwrap());
    }

    #[test]
    fn garbage_certificate_is_a_format_error() {
        assert!(matches!(
            device_public_from_cert(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(Error::Format(_))
        ));
    }
}

//! The narrow capability surface this crate needs from a security module.
//!
//! [`SecurityModule`] is the device; [`ModuleChannel`] is one open command
//! channel to it. Callers open a channel per operation and drop it as soon as
//! the operation is over, so a failure half-way through a sequence never
//! leaves a session behind.

use std::fmt;

use bincode::{Decode, Encode};
use p256::EncodedPoint;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handles::{Hierarchy, KeyRole, NvSlot};
use crate::template::KeyTemplate;

/// Width of a NIST P-256 coordinate.
pub const COORDINATE_LEN: usize = 32;

/// A P-256 point with coordinates held at their fixed 32-byte width.
///
/// Coordinates coming from big-integer encodings may have had leading zero
/// bytes stripped; [`EccPoint::from_coordinates`] puts them back so every
/// serialization of the same point is byte-identical.
#[derive(Serialize, Deserialize, Encode, Decode, Clone, Copy, PartialEq, Eq)]
pub struct EccPoint {
    x: [u8; COORDINATE_LEN],
    y: [u8; COORDINATE_LEN],
}

impl EccPoint {
    pub fn from_coordinates(x: &[u8], y: &[u8]) -> Result<Self> {
        Ok(Self {
            x: fixed_width(x)?,
            y: fixed_width(y)?,
        })
    }

    pub fn x(&self) -> &[u8; COORDINATE_LEN] {
        &self.x
    }

    pub fn y(&self) -> &[u8; COORDINATE_LEN] {
        &self.y
    }

    /// `x ‖ y`, both big-endian and full width.
    pub fn to_bytes(&self) -> [u8; 2 * COORDINATE_LEN] {
        let mut out = [0u8; 2 * COORDINATE_LEN];
        out[..COORDINATE_LEN].copy_from_slice(&self.x);
        out[COORDINATE_LEN..].copy_from_slice(&self.y);
        out
    }

    pub fn from_public_key(key: &p256::PublicKey) -> Result<Self> {
        let encoded = key.to_encoded_point(false);
        let (Some(x), Some(y)) = (encoded.x(), encoded.y()) else {
            return Err(Error::Format("public key has no affine coordinates".into()));
        };
        Self::from_coordinates(x, y)
    }

    /// Fails if the point is not on the curve.
    pub fn to_public_key(&self) -> Result<p256::PublicKey> {
        let encoded = EncodedPoint::from_affine_coordinates(&self.x.into(), &self.y.into(), false);
        Option::from(p256::PublicKey::from_encoded_point(&encoded))
            .ok_or_else(|| Error::Format("point is not on the P-256 curve".into()))
    }
}

impl fmt::Debug for EccPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EccPoint")
            .field("x", &hex(&self.x))
            .field("y", &hex(&self.y))
            .finish()
    }
}

fn fixed_width(value: &[u8]) -> Result<[u8; COORDINATE_LEN]> {
    let first_nonzero = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let significant = &value[first_nonzero..];
    if significant.len() > COORDINATE_LEN {
        return Err(Error::Format(format!(
            "coordinate is {} bytes, expected at most {COORDINATE_LEN}",
            significant.len()
        )));
    }
    let mut out = [0u8; COORDINATE_LEN];
    out[COORDINATE_LEN - significant.len()..].copy_from_slice(significant);
    Ok(out)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// The public part of a persisted object.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum PublicArea {
    Ecc(EccPoint),
    Rsa { modulus: Vec<u8> },
}

impl PublicArea {
    pub fn as_ecc(&self) -> Option<&EccPoint> {
        match self {
            PublicArea::Ecc(point) => Some(point),
            PublicArea::Rsa { .. } => None,
        }
    }
}

/// Handle of a freshly created, not yet persisted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientObject(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccSignature {
    /// Big-endian
    pub r: Vec<u8>,
    /// Big-endian
    pub s: Vec<u8>,
}

/// Fixed TPM properties read through `TPM2_GetCapability(TPM_CAP_TPM_PROPERTIES)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Manufacturer,
    VendorString1,
    VendorString2,
    FirmwareVersion1,
    FirmwareVersion2,
}

impl Property {
    pub fn code(self) -> u32 {
        match self {
            Property::Manufacturer => 0x105,
            Property::VendorString1 => 0x106,
            Property::VendorString2 => 0x107,
            Property::FirmwareVersion1 => 0x10B,
            Property::FirmwareVersion2 => 0x10C,
        }
    }
}

/// A module-signed quote over a set of SHA-256 PCRs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Marshalled `TPMS_ATTEST`
    pub attest: Vec<u8>,
    /// Marshalled `TPMT_SIGNATURE`
    pub signature: Vec<u8>,
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Quote: {}", hex(&self.attest))?;
        write!(f, "Signature: {}", hex(&self.signature))
    }
}

/// A security module that can be opened for commands.
pub trait SecurityModule {
    type Channel<'a>: ModuleChannel
    where
        Self: 'a;

    /// Whether the module's device node exists.
    fn is_present(&self) -> bool;

    /// Acquires a command channel. Dropping it releases the channel.
    fn open(&self) -> Result<Self::Channel<'_>>;
}

/// The primitives available on an open channel.
///
/// `auth` arguments are the raw authorization value for the object, already
/// truncated by the caller.
pub trait ModuleChannel {
    /// `None` if nothing is persisted at the role's handle.
    fn read_public(&mut self, role: KeyRole) -> Result<Option<PublicArea>>;

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        auth: &[u8],
    ) -> Result<(TransientObject, PublicArea)>;

    /// Removes whatever is persisted at the role's handle.
    fn evict(&mut self, role: KeyRole) -> Result<()>;

    /// Moves a transient object to the role's (free) persistent handle.
    fn persist(&mut self, object: TransientObject, role: KeyRole) -> Result<()>;

    fn nv_define(&mut self, slot: NvSlot, size: u16) -> Result<()>;
    fn nv_undefine(&mut self, slot: NvSlot) -> Result<()>;
    fn nv_write(&mut self, slot: NvSlot, data: &[u8], offset: u16) -> Result<()>;
    /// Reads the whole slot; [`Error::SlotAbsent`] if it is not defined.
    fn nv_read(&mut self, slot: NvSlot) -> Result<Vec<u8>>;
    /// Largest chunk a single `nv_write` accepts.
    fn nv_max_buffer(&mut self) -> usize;

    /// ECDSA-SHA256 over an already-hashed digest.
    fn sign(&mut self, role: KeyRole, auth: &[u8], digest: &[u8]) -> Result<EccSignature>;

    /// `TPM2_ECDH_ZGen`: multiplies `point` by the key's private scalar.
    fn ecdh_recover(&mut self, role: KeyRole, auth: &[u8], point: &EccPoint) -> Result<EccPoint>;

    fn get_random(&mut self, len: usize) -> Result<Vec<u8>>;
    fn get_capability(&mut self, property: Property) -> Result<u32>;

    /// One PCR of the SHA-256 bank.
    fn pcr_read(&mut self, index: u8) -> Result<Vec<u8>>;

    fn quote(&mut self, role: KeyRole, nonce: &[u8], pcrs: &[u8]) -> Result<Attestation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_coordinates_are_left_padded() {
        let point = EccPoint::from_coordinates(&[0x01, 0x02], &[0xFF; 32]).unwrap();
        assert_eq!(point.x()[..30], [0u8; 30]);
        assert_eq!(point.x()[30..], [0x01, 0x02]);
        assert_eq!(point.to_bytes().len(), 64);
    }

    #[test]
    fn sign_extended_coordinates_are_accepted() {
        let mut x = vec![0u8];
        x.extend_from_slice(&[0x80; 32]);
        let point = EccPoint::from_coordinates(&x, &[1; 32]).unwrap();
        assert_eq!(point.x(), &[0x80; 32]);
    }

    #[test]
    fn oversized_coordinates_are_rejected() {
        assert!(matches!(
            EccPoint::from_coordinates(&[1; 33], &[1; 32]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn off_curve_point_is_rejected() {
        let point = EccPoint::from_coordinates(&[1; 32], &[2; 32]).unwrap();
        assert!(point.to_public_key().is_err());
    }

    #[test]
    fn public_key_round_trips() {
        let secret = p256::SecretKey::random(&mut rand_core::OsRng);
        let public = secret.public_key();
        let point = EccPoint::from_public_key(&public).unwrap();
        assert_eq!(point.to_public_key().unwrap(), public);
    }
}

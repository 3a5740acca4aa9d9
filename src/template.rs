//! Key templates for the four provisioned roles.
//!
//! These are plain descriptors; the `tpm` backend turns them into
//! `TPMT_PUBLIC` areas and the simulator interprets them directly.

/// TCG default EK policy (PolicySecret(TPM_RH_ENDORSEMENT)), from the
/// TCG EK Credential Profile.
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7, 0x24,
    0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14, 0x69, 0xAA,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa { bits: u16 },
    EccNistP256,
}

/// What the key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// Restricted decryption key that parents other objects (EK, SRK).
    StorageParent,
    /// Restricted RSASSA-SHA256 signing key (AK).
    RestrictedSigning,
    /// Unrestricted sign + decrypt with a null scheme (device key).
    SignAndDecrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TemplateAttributes {
    pub fixed_tpm: bool,
    pub fixed_parent: bool,
    pub sensitive_data_origin: bool,
    pub user_with_auth: bool,
    pub admin_with_policy: bool,
    pub no_da: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    pub algorithm: KeyAlgorithm,
    pub usage: KeyUsage,
    pub attributes: TemplateAttributes,
    pub auth_policy: &'static [u8],
}

impl KeyTemplate {
    pub fn is_restricted(&self) -> bool {
        match self.usage {
            KeyUsage::StorageParent | KeyUsage::RestrictedSigning => true,
            KeyUsage::SignAndDecrypt => false,
        }
    }

    pub fn can_sign(&self) -> bool {
        matches!(self.usage, KeyUsage::RestrictedSigning | KeyUsage::SignAndDecrypt)
    }

    pub fn can_decrypt(&self) -> bool {
        matches!(self.usage, KeyUsage::StorageParent | KeyUsage::SignAndDecrypt)
    }
}

pub static EK_TEMPLATE: KeyTemplate = KeyTemplate {
    algorithm: KeyAlgorithm::Rsa { bits: 2048 },
    usage: KeyUsage::StorageParent,
    attributes: TemplateAttributes {
        fixed_tpm: true,
        fixed_parent: true,
        sensitive_data_origin: true,
        user_with_auth: false,
        admin_with_policy: true,
        no_da: false,
    },
    auth_policy: &EK_AUTH_POLICY,
};

pub static SRK_TEMPLATE: KeyTemplate = KeyTemplate {
    algorithm: KeyAlgorithm::Rsa { bits: 2048 },
    usage: KeyUsage::StorageParent,
    attributes: TemplateAttributes {
        fixed_tpm: true,
        fixed_parent: true,
        sensitive_data_origin: true,
        user_with_auth: true,
        admin_with_policy: false,
        no_da: true,
    },
    auth_policy: &[],
};

pub static AK_TEMPLATE: KeyTemplate = KeyTemplate {
    algorithm: KeyAlgorithm::Rsa { bits: 2048 },
    usage: KeyUsage::RestrictedSigning,
    attributes: TemplateAttributes {
        fixed_tpm: true,
        fixed_parent: true,
        sensitive_data_origin: true,
        user_with_auth: true,
        admin_with_policy: false,
        no_da: true,
    },
    auth_policy: &[],
};

// Not fixedTPM/fixedParent: matches what already-provisioned devices carry.
pub static DEVICE_KEY_TEMPLATE: KeyTemplate = KeyTemplate {
    algorithm: KeyAlgorithm::EccNistP256,
    usage: KeyUsage::SignAndDecrypt,
    attributes: TemplateAttributes {
        fixed_tpm: false,
        fixed_parent: false,
        sensitive_data_origin: true,
        user_with_auth: true,
        admin_with_policy: false,
        no_da: true,
    },
    auth_policy: &[],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::KeyRole;

    #[test]
    fn ek_is_policy_only() {
        let ek = KeyRole::Ek.template();
        assert!(ek.attributes.admin_with_policy);
        assert!(!ek.attributes.user_with_auth);
        assert_eq!(ek.auth_policy.len(), 32);
    }

    #[test]
    fn device_key_is_unrestricted_ecc() {
        let dk = KeyRole::Device.template();
        assert_eq!(dk.algorithm, KeyAlgorithm::EccNistP256);
        assert!(!dk.is_restricted());
        assert!(dk.can_sign() && dk.can_decrypt());
    }

    #[test]
    fn ak_signs_but_does_not_decrypt() {
        let ak = KeyRole::Ak.template();
        assert!(ak.is_restricted());
        assert!(ak.can_sign());
        assert!(!ak.can_decrypt());
    }
}

//! Well-known persistent handles and NV indices.
//!
//! These numbers are a contract with state already written into the TPMs of
//! provisioned devices. They are defined here and nowhere else; every consumer
//! goes through [`KeyRole`] or [`NvSlot`].

use std::fmt;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::template::{self, KeyTemplate};

/// A handle in the persistent object range (`0x81xxxxxx`).
///
/// Only obtainable from [`KeyRole::handle`], so no code path can address an
/// arbitrary persistent slot.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Authorization namespace a primary key is created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    Owner,
    Endorsement,
}

/// The four keys this agent keeps at fixed persistent handles.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Endorsement Key, manufacturing-rooted identity
    Ek,
    /// Storage Root Key
    Srk,
    /// Attestation Key, signs quotes
    Ak,
    /// ECC P-256 key used for device signing and ECDH
    Device,
}

impl KeyRole {
    pub const ALL: [KeyRole; 4] = [KeyRole::Ek, KeyRole::Srk, KeyRole::Ak, KeyRole::Device];

    pub fn handle(self) -> PersistentHandle {
        match self {
            KeyRole::Ek => PersistentHandle(0x8100_0001),
            KeyRole::Srk => PersistentHandle(0x8100_0002),
            KeyRole::Ak => PersistentHandle(0x8100_0003),
            KeyRole::Device => PersistentHandle(0x817F_FFFF),
        }
    }

    pub fn hierarchy(self) -> Hierarchy {
        match self {
            KeyRole::Ek => Hierarchy::Endorsement,
            KeyRole::Srk | KeyRole::Ak | KeyRole::Device => Hierarchy::Owner,
        }
    }

    pub fn template(self) -> &'static KeyTemplate {
        match self {
            KeyRole::Ek => &template::EK_TEMPLATE,
            KeyRole::Srk => &template::SRK_TEMPLATE,
            KeyRole::Ak => &template::AK_TEMPLATE,
            KeyRole::Device => &template::DEVICE_KEY_TEMPLATE,
        }
    }

    /// Whether the key is created with the owner credential as its auth value.
    pub fn uses_owner_credential(self) -> bool {
        match self {
            KeyRole::Device => true,
            KeyRole::Ek | KeyRole::Srk | KeyRole::Ak => false,
        }
    }

    pub fn from_handle(value: u32) -> Option<Self> {
        KeyRole::ALL.into_iter().find(|r| r.handle().value() == value)
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyRole::Ek => "endorsement key",
            KeyRole::Srk => "storage root key",
            KeyRole::Ak => "attestation key",
            KeyRole::Device => "device key",
        };
        write!(f, "{name} ({})", self.handle())
    }
}

/// Owner-defined NV indices holding opaque secrets.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NvSlot {
    DeviceCert,
    OwnerCredential,
    VaultKey,
}

impl NvSlot {
    pub const ALL: [NvSlot; 3] = [NvSlot::DeviceCert, NvSlot::OwnerCredential, NvSlot::VaultKey];

    pub fn index(self) -> u32 {
        match self {
            NvSlot::DeviceCert => 0x0150_0000,
            NvSlot::OwnerCredential => 0x0160_0000,
            NvSlot::VaultKey => 0x0170_0000,
        }
    }
}

impl fmt::Display for NvSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NvSlot::DeviceCert => "device certificate",
            NvSlot::OwnerCredential => "owner credential",
            NvSlot::VaultKey => "vault key",
        };
        write!(f, "{name} ({:#010x})", self.index())
    }
}

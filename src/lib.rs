//! Hardware-rooted device identity and secrets on top of a TPM 2.0.
//!
//! Keys live at fixed persistent handles, small secrets in owner NV indices.
//! Everything talks to the module through [`module::SecurityModule`], backed
//! either by the TSS ([`tpm::TssModule`]) or by the software stand-in in
//! [`sim`].

pub mod config;
pub mod credential;
pub mod ecdh;
pub mod error;
pub mod handles;
pub mod introspect;
pub mod manager;
pub mod module;
pub mod nv;
pub mod provision;
pub mod service;
pub mod sign;
pub mod sim;
pub mod template;
pub mod tpm;
pub mod vault;

pub use config::Config;
pub use credential::OwnerCredential;
pub use error::{Error, Result};
pub use handles::{KeyRole, NvSlot};
pub use manager::TpmManager;
pub use module::SecurityModule;
pub use vault::VaultKey;

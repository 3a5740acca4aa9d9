//! Error taxonomy for every module-facing operation.

use std::path::PathBuf;

use thiserror::Error;

use crate::handles::{KeyRole, NvSlot};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The module's device node is missing or a command channel could not be opened.
    #[error("security module unavailable at {0}")]
    HardwareUnavailable(String),

    /// Creating, evicting or persisting a primary object failed.
    #[error(
        "failed to provision {role}: {reason}; a TPM reset from firmware setup may be required"
    )]
    Provisioning { role: KeyRole, reason: String },

    /// The module rejected the owner credential.
    #[error("owner authorization rejected by the module")]
    Authorization,

    /// The NV index has never been defined (or was cleared).
    #[error("NV slot {0} is not defined")]
    SlotAbsent(NvSlot),

    #[error("malformed input: {0}")]
    Format(String),

    /// Deliberately carries no detail.
    #[error("failed to decrypt ECDH payload")]
    Decrypt,

    #[error("module command failed: {0}")]
    Module(String),

    #[error("another instance holds the lock at {0}")]
    LockHeld(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tss(#[from] tss_esapi::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Rewraps a failure from a provisioning step, keeping its description.
    pub(crate) fn provisioning(role: KeyRole, cause: impl std::fmt::Display) -> Self {
        Error::Provisioning {
            role,
            reason: cause.to_string(),
        }
    }
}

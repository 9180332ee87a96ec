use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::header::HeaderError;

/// Errors returned by the volume header engine.
///
/// None of the variants carry passphrase, keyfile or key bytes.
#[derive(Debug, Error)]
pub enum Error {
    /// Decrypted bytes are not a valid header. Expected during the search,
    /// only surfaced when a caller decodes a buffer directly.
    #[error("invalid volume header: {0}")]
    InvalidHeader(#[from] HeaderError),

    #[error("wrong passphrase or unsupported volume parameters")]
    SearchExhausted,

    #[error("unsupported cipher chain '{0}'")]
    UnsupportedChain(String),

    #[error("unsupported PBKDF2 PRF '{0}'")]
    UnsupportedPrf(String),

    #[error("could not read {len} bytes at device offset {offset}")]
    DeviceRead {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not write {len} bytes at device offset {offset}")]
    DeviceWrite {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("volume geometry conflict: {0}")]
    GeometryConflict(String),

    #[error("passphrase longer than {max} bytes")]
    PassphraseTooLong { max: usize },

    #[error("could not read keyfile {path}")]
    Keyfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("volume master key has identical XTS data and tweak keys")]
    VulnerableMasterKey,

    #[error("header search cancelled")]
    Cancelled,

    #[error("invalid options: {0}")]
    Config(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("key material has wrong length: expected {expected}, got {actual}")]
    KeyLength { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

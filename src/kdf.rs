//! PBKDF2 PRF catalogs and header key derivation.

use std::fmt;

use blake2::Blake2s256;
use hmac::{Hmac, SimpleHmac};
use pbkdf2::pbkdf2;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use streebog::Streebog512;
use whirlpool::Whirlpool;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Header format family. Decides the magic, the PRF catalog and which
/// cipher chains are candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    TrueCrypt,
    VeraCrypt,
}

impl Family {
    pub fn magic(self) -> &'static [u8; 4] {
        match self {
            Family::TrueCrypt => b"TRUE",
            Family::VeraCrypt => b"VERA",
        }
    }

    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        match magic {
            b"TRUE" => Some(Family::TrueCrypt),
            b"VERA" => Some(Family::VeraCrypt),
            _ => None,
        }
    }

    /// PRFs in the order a header search tries them.
    pub fn prfs(self) -> &'static [Prf] {
        match self {
            Family::TrueCrypt => TRUECRYPT_PRFS,
            Family::VeraCrypt => VERACRYPT_PRFS,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Family::TrueCrypt => write!(f, "TrueCrypt"),
            Family::VeraCrypt => write!(f, "VeraCrypt"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Ripemd160,
    Sha512,
    Whirlpool,
    Sha256,
    Blake2s256,
    Streebog512,
}

/// One PBKDF2 PRF entry of a family catalog.
#[derive(Debug, PartialEq, Eq)]
pub struct Prf {
    pub name: &'static str,
    pub hash: HashAlgorithm,
    pub family: Family,
    /// Iterations for volumes that are not system encryption.
    pub iterations: u32,
    /// Iterations for system encryption, `None` if the boot loader of this
    /// family cannot use the PRF.
    pub system_iterations: Option<u32>,
}

pub static TRUECRYPT_PRFS: &[Prf] = &[
    Prf {
        name: "RIPEMD-160",
        hash: HashAlgorithm::Ripemd160,
        family: Family::TrueCrypt,
        iterations: 2000,
        system_iterations: Some(1000),
    },
    Prf {
        name: "SHA-512",
        hash: HashAlgorithm::Sha512,
        family: Family::TrueCrypt,
        iterations: 1000,
        system_iterations: None,
    },
    Prf {
        name: "Whirlpool",
        hash: HashAlgorithm::Whirlpool,
        family: Family::TrueCrypt,
        iterations: 1000,
        system_iterations: None,
    },
];

pub static VERACRYPT_PRFS: &[Prf] = &[
    Prf {
        name: "SHA-512",
        hash: HashAlgorithm::Sha512,
        family: Family::VeraCrypt,
        iterations: 500_000,
        system_iterations: Some(500_000),
    },
    Prf {
        name: "Whirlpool",
        hash: HashAlgorithm::Whirlpool,
        family: Family::VeraCrypt,
        iterations: 500_000,
        system_iterations: Some(500_000),
    },
    Prf {
        name: "SHA-256",
        hash: HashAlgorithm::Sha256,
        family: Family::VeraCrypt,
        iterations: 500_000,
        system_iterations: Some(200_000),
    },
    Prf {
        name: "BLAKE2s-256",
        hash: HashAlgorithm::Blake2s256,
        family: Family::VeraCrypt,
        iterations: 500_000,
        system_iterations: Some(200_000),
    },
    Prf {
        name: "RIPEMD-160",
        hash: HashAlgorithm::Ripemd160,
        family: Family::VeraCrypt,
        iterations: 655_331,
        system_iterations: Some(327_661),
    },
    Prf {
        name: "Streebog",
        hash: HashAlgorithm::Streebog512,
        family: Family::VeraCrypt,
        iterations: 500_000,
        system_iterations: Some(200_000),
    },
];

/// Where the iteration count of a derivation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KdfParams {
    pub system_encryption: bool,
    /// VeraCrypt personal iterations multiplier. Zero means default.
    pub pim: u32,
    /// Exact iteration count, overrides catalog defaults and PIM.
    pub iterations: Option<u32>,
}

impl Prf {
    /// Iteration count for this PRF under `params`, or `None` if the PRF is
    /// not usable in that context.
    pub fn iterations_for(&self, params: &KdfParams) -> Option<u32> {
        // Boot loaders only implement some PRFs.
        if params.system_encryption && self.system_iterations.is_none() {
            return None;
        }
        if let Some(exact) = params.iterations {
            return Some(exact);
        }
        if self.family == Family::VeraCrypt && params.pim > 0 {
            return Some(if params.system_encryption {
                params.pim.saturating_mul(2048)
            } else {
                15_000u32.saturating_add(params.pim.saturating_mul(1000))
            });
        }
        if params.system_encryption {
            self.system_iterations
        } else {
            Some(self.iterations)
        }
    }
}

impl fmt::Display for Prf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Looks up a PRF of `family` by name, ignoring case and dashes.
pub fn find_prf(family: Family, name: &str) -> Result<&'static Prf> {
    let wanted = normalize_name(name);
    family
        .prfs()
        .iter()
        .find(|prf| normalize_name(prf.name) == wanted)
        .ok_or_else(|| Error::UnsupportedPrf(name.to_string()))
}

/// Derived header key bytes. Wiped when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        KeyMaterial(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// Runs PBKDF2 with the PRF's HMAC and returns exactly `len` bytes.
pub fn derive(
    prf: &Prf,
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    len: usize,
) -> Result<KeyMaterial> {
    let mut out = KeyMaterial(vec![0u8; len]);
    let buf = &mut out.0[..];

    let res = match prf.hash {
        HashAlgorithm::Ripemd160 => pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, buf),
        HashAlgorithm::Sha512 => pbkdf2::<Hmac<Sha512>>(password, salt, iterations, buf),
        HashAlgorithm::Whirlpool => pbkdf2::<Hmac<Whirlpool>>(password, salt, iterations, buf),
        HashAlgorithm::Sha256 => pbkdf2::<Hmac<Sha256>>(password, salt, iterations, buf),
        // Lazy-buffered cores only work with SimpleHmac.
        HashAlgorithm::Blake2s256 => {
            pbkdf2::<SimpleHmac<Blake2s256>>(password, salt, iterations, buf)
        }
        HashAlgorithm::Streebog512 => {
            pbkdf2::<SimpleHmac<Streebog512>>(password, salt, iterations, buf)
        }
    };

    res.map_err(|e| Error::Kdf(format!("{} PBKDF2: {}", prf.name, e)))?;
    Ok(out)
}

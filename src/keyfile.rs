//! Keyfile pool: mixes keyfile contents into the passphrase before PBKDF2.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of the keyfile pool, which is also the longest accepted passphrase.
pub const KEYFILE_POOL_SIZE: usize = 64;

/// Only the first 1 MiB of a keyfile contributes to the pool.
pub const KEYFILE_MAX_READ: u64 = 1024 * 1024;

/// Passphrase buffer with keyfile material mixed in.
///
/// The pool starts as the zero-padded passphrase. Every keyfile byte advances
/// a CRC-32 register and the four register bytes are added into the pool at
/// a write position that wraps around the pool. Each keyfile starts writing
/// at the front of the pool again; only the pool contents accumulate. Zero
/// padding does not change the PBKDF2 result since HMAC pads short keys with
/// zeros anyway.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyfilePool {
    bytes: [u8; KEYFILE_POOL_SIZE],
}

impl KeyfilePool {
    pub fn new(passphrase: &[u8]) -> Result<Self> {
        if passphrase.len() > KEYFILE_POOL_SIZE {
            return Err(Error::PassphraseTooLong {
                max: KEYFILE_POOL_SIZE,
            });
        }

        let mut bytes = [0u8; KEYFILE_POOL_SIZE];
        bytes[..passphrase.len()].copy_from_slice(passphrase);
        Ok(Self { bytes })
    }

    /// Mixes one keyfile read from `reader`.
    pub fn mix<R: Read>(&mut self, reader: R) -> io::Result<()> {
        let mut limited = reader.take(KEYFILE_MAX_READ);
        let mut crc = crc32fast::Hasher::new();
        let mut pos = 0;
        let mut chunk = [0u8; 4096];

        loop {
            let n = match limited.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    chunk.zeroize();
                    return Err(e);
                }
            };
            self.absorb(&mut crc, &mut pos, &chunk[..n]);
        }

        chunk.zeroize();
        Ok(())
    }

    /// Mixes one in-memory keyfile.
    pub fn mix_bytes(&mut self, keyfile: &[u8]) {
        let len = keyfile.len().min(KEYFILE_MAX_READ as usize);
        let mut crc = crc32fast::Hasher::new();
        self.absorb(&mut crc, &mut 0, &keyfile[..len]);
    }

    pub fn mix_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let keyfile_err = |source| Error::Keyfile {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(keyfile_err)?;
        self.mix(file).map_err(keyfile_err)?;
        log::debug!("mixed keyfile {}", path.display());
        Ok(())
    }

    /// Builds a pool from a passphrase and an ordered list of keyfile paths.
    pub fn from_files<P: AsRef<Path>>(passphrase: &[u8], keyfiles: &[P]) -> Result<Self> {
        let mut pool = Self::new(passphrase)?;
        for keyfile in keyfiles {
            pool.mix_file(keyfile)?;
        }
        Ok(pool)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Feeds `data` through the keyfile's CRC register. `pos` is the write
    /// position within the current keyfile.
    fn absorb(&mut self, crc: &mut crc32fast::Hasher, pos: &mut usize, data: &[u8]) {
        for &byte in data {
            crc.update(&[byte]);
            // crc32fast keeps the finalised (inverted) register.
            let register = !crc.clone().finalize();
            for shift in [24u32, 16, 8, 0] {
                self.bytes[*pos] = self.bytes[*pos].wrapping_add((register >> shift) as u8);
                *pos = (*pos + 1) % KEYFILE_POOL_SIZE;
            }
        }
    }
}

impl std::fmt::Debug for KeyfilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyfilePool").finish_non_exhaustive()
    }
}

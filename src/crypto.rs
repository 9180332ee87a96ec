use std::fmt;

use aes::Aes256;
use camellia::Camellia256;
use cipher::{BlockCipher, BlockDecrypt, BlockEncrypt, KeyInit};
use kuznyechik::Kuznyechik;
use serpent::Serpent;
use twofish::Twofish;
use xts_mode::{get_tweak_default, Xts128};

use crate::error::{Error, Result};
use crate::kdf::Family;

/// XTS data unit size used for volume data.
pub const DATA_UNIT_SIZE: usize = 512;

/// Size of the encrypted part of a header (the sector minus its salt).
pub const HEADER_ENCRYPTED_SIZE: usize = 448;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cipher {
    Aes,
    Serpent,
    Twofish,
    Camellia,
    Kuznyechik,
}

impl Cipher {
    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes => "AES",
            Cipher::Serpent => "Serpent",
            Cipher::Twofish => "Twofish",
            Cipher::Camellia => "Camellia",
            Cipher::Kuznyechik => "Kuznyechik",
        }
    }

    /// Cipher name as understood by dm-crypt.
    pub fn dm_name(self) -> &'static str {
        match self {
            Cipher::Aes => "aes",
            Cipher::Serpent => "serpent",
            Cipher::Twofish => "twofish",
            Cipher::Camellia => "camellia",
            Cipher::Kuznyechik => "kuznyechik",
        }
    }

    pub fn key_size(self) -> usize {
        32
    }

    pub fn block_size(self) -> usize {
        16
    }
}

/// A closed catalog entry: one to three ciphers applied in cascade.
///
/// `stages` is in encryption order, the innermost cipher first. The display
/// name lists them the other way round, so "AES-Twofish" encrypts with
/// Twofish and then with AES.
#[derive(Debug, PartialEq, Eq)]
pub struct CipherChain {
    pub name: &'static str,
    pub stages: &'static [Cipher],
    /// Only VeraCrypt headers may use this chain.
    pub veracrypt_only: bool,
}

impl CipherChain {
    /// Length of the data key area (all stages).
    pub fn data_key_len(&self) -> usize {
        self.stages.iter().map(|c| c.key_size()).sum()
    }

    /// Data keys plus XTS tweak keys.
    pub fn key_len(&self) -> usize {
        self.data_key_len() * 2
    }

    pub fn is_member_of(&self, family: Family) -> bool {
        family == Family::VeraCrypt || !self.veracrypt_only
    }

    /// Splits `key` into (data key, tweak key) per stage, in stage order.
    pub fn stage_keys<'k>(&self, key: &'k [u8]) -> Result<Vec<(&'k [u8], &'k [u8])>> {
        if key.len() < self.key_len() {
            return Err(Error::KeyLength {
                expected: self.key_len(),
                actual: key.len(),
            });
        }

        // Tweak keys start after every stage's data key.
        let tweak_base = self.data_key_len();
        let mut offset = 0;
        let mut out = Vec::with_capacity(self.stages.len());
        for cipher in self.stages {
            let len = cipher.key_size();
            out.push((
                &key[offset..offset + len],
                &key[tweak_base + offset..tweak_base + offset + len],
            ));
            offset += len;
        }
        Ok(out)
    }
}

impl fmt::Display for CipherChain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

const fn chain(name: &'static str, stages: &'static [Cipher], veracrypt_only: bool) -> CipherChain {
    CipherChain {
        name,
        stages,
        veracrypt_only,
    }
}

/// Every supported chain, in the order a header search tries them.
pub static CIPHER_CHAINS: &[CipherChain] = &[
    chain("AES", &[Cipher::Aes], false),
    chain("Serpent", &[Cipher::Serpent], false),
    chain("Twofish", &[Cipher::Twofish], false),
    chain("Camellia", &[Cipher::Camellia], true),
    chain("Kuznyechik", &[Cipher::Kuznyechik], true),
    chain("AES-Twofish", &[Cipher::Twofish, Cipher::Aes], false),
    chain(
        "AES-Twofish-Serpent",
        &[Cipher::Serpent, Cipher::Twofish, Cipher::Aes],
        false,
    ),
    chain("Serpent-AES", &[Cipher::Aes, Cipher::Serpent], false),
    chain(
        "Serpent-Twofish-AES",
        &[Cipher::Aes, Cipher::Twofish, Cipher::Serpent],
        false,
    ),
    chain("Twofish-Serpent", &[Cipher::Serpent, Cipher::Twofish], false),
    chain(
        "Camellia-Kuznyechik",
        &[Cipher::Kuznyechik, Cipher::Camellia],
        true,
    ),
    chain(
        "Kuznyechik-Twofish",
        &[Cipher::Twofish, Cipher::Kuznyechik],
        true,
    ),
    chain("Camellia-Serpent", &[Cipher::Serpent, Cipher::Camellia], true),
    chain("Kuznyechik-AES", &[Cipher::Aes, Cipher::Kuznyechik], true),
    chain(
        "Kuznyechik-Serpent-Camellia",
        &[Cipher::Camellia, Cipher::Serpent, Cipher::Kuznyechik],
        true,
    ),
];

/// Chains a `family` header may use, in search order.
pub fn chains_for(family: Family) -> impl Iterator<Item = &'static CipherChain> {
    CIPHER_CHAINS.iter().filter(move |c| c.is_member_of(family))
}

/// Looks up a chain by display name (case-insensitive).
pub fn find_chain(family: Family, name: &str) -> Result<&'static CipherChain> {
    chains_for(family)
        .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| Error::UnsupportedChain(name.to_string()))
}

enum XtsStage {
    Aes(Xts128<Aes256>),
    Serpent(Xts128<Serpent>),
    Twofish(Xts128<Twofish>),
    Camellia(Xts128<Camellia256>),
    Kuznyechik(Xts128<Kuznyechik>),
}

fn xts<C>(data_key: &[u8], tweak_key: &[u8]) -> Result<Xts128<C>>
where
    C: KeyInit + BlockCipher + BlockEncrypt + BlockDecrypt,
{
    let bad_len = |_| Error::KeyLength {
        expected: 32,
        actual: data_key.len(),
    };
    let c1 = C::new_from_slice(data_key).map_err(bad_len)?;
    let c2 = C::new_from_slice(tweak_key).map_err(bad_len)?;
    Ok(Xts128::new(c1, c2))
}

impl XtsStage {
    fn new(cipher: Cipher, data_key: &[u8], tweak_key: &[u8]) -> Result<Self> {
        Ok(match cipher {
            Cipher::Aes => XtsStage::Aes(xts(data_key, tweak_key)?),
            Cipher::Serpent => XtsStage::Serpent(xts(data_key, tweak_key)?),
            Cipher::Twofish => XtsStage::Twofish(xts(data_key, tweak_key)?),
            Cipher::Camellia => XtsStage::Camellia(xts(data_key, tweak_key)?),
            Cipher::Kuznyechik => XtsStage::Kuznyechik(xts(data_key, tweak_key)?),
        })
    }

    fn decrypt_unit(&self, data: &mut [u8], unit: u128) {
        // Tweak is the data unit number, little endian.
        let tweak = get_tweak_default(unit);
        match self {
            XtsStage::Aes(x) => x.decrypt_sector(data, tweak),
            XtsStage::Serpent(x) => x.decrypt_sector(data, tweak),
            XtsStage::Twofish(x) => x.decrypt_sector(data, tweak),
            XtsStage::Camellia(x) => x.decrypt_sector(data, tweak),
            XtsStage::Kuznyechik(x) => x.decrypt_sector(data, tweak),
        }
    }

    fn encrypt_unit(&self, data: &mut [u8], unit: u128) {
        let tweak = get_tweak_default(unit);
        match self {
            XtsStage::Aes(x) => x.encrypt_sector(data, tweak),
            XtsStage::Serpent(x) => x.encrypt_sector(data, tweak),
            XtsStage::Twofish(x) => x.encrypt_sector(data, tweak),
            XtsStage::Camellia(x) => x.encrypt_sector(data, tweak),
            XtsStage::Kuznyechik(x) => x.encrypt_sector(data, tweak),
        }
    }
}

/// XTS cascade built from a chain and its key material.
pub struct CascadeCipher {
    chain: &'static CipherChain,
    stages: Vec<XtsStage>,
}

impl CascadeCipher {
    pub fn new(chain: &'static CipherChain, key: &[u8]) -> Result<Self> {
        let stages = chain
            .stage_keys(key)?
            .into_iter()
            .zip(chain.stages)
            .map(|((data_key, tweak_key), cipher)| XtsStage::new(*cipher, data_key, tweak_key))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chain, stages })
    }

    pub fn chain(&self) -> &'static CipherChain {
        self.chain
    }

    /// Decrypts the 448-byte encrypted header region, which is data unit 0.
    pub fn decrypt_header(&self, data: &mut [u8; HEADER_ENCRYPTED_SIZE]) {
        // Last stage applied is the first one removed.
        for stage in self.stages.iter().rev() {
            stage.decrypt_unit(data, 0);
        }
    }

    pub fn encrypt_header(&self, data: &mut [u8; HEADER_ENCRYPTED_SIZE]) {
        for stage in &self.stages {
            stage.encrypt_unit(data, 0);
        }
    }

    /// Decrypts whole 512-byte data units in place. `first_unit` is the
    /// unit number of `data[0..512]`, counted from the start of the host.
    /// A trailing partial unit is left untouched.
    pub fn decrypt_sectors(&self, data: &mut [u8], first_unit: u64) {
        for (i, unit) in data.chunks_exact_mut(DATA_UNIT_SIZE).enumerate() {
            let n = first_unit as u128 + i as u128;
            for stage in self.stages.iter().rev() {
                stage.decrypt_unit(unit, n);
            }
        }
    }

    pub fn encrypt_sectors(&self, data: &mut [u8], first_unit: u64) {
        for (i, unit) in data.chunks_exact_mut(DATA_UNIT_SIZE).enumerate() {
            let n = first_unit as u128 + i as u128;
            for stage in &self.stages {
                stage.encrypt_unit(unit, n);
            }
        }
    }
}

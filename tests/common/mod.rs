#![allow(dead_code)]

use tcvol::volume::{HEADER_GROUP_SIZE, HEADER_SIZE, SALT_SIZE};
use tcvol::{
    find_chain, find_prf, seal_header, CascadeCipher, Family, HeaderGeometry, KeyfilePool,
    OpenOptions, VolumeHeader,
};

pub const MIB: u64 = 1024 * 1024;
pub const HOST_SIZE: u64 = 10 * MIB;

pub const OUTER_START: u64 = HEADER_GROUP_SIZE;
pub const OUTER_LEN: u64 = HOST_SIZE - 2 * HEADER_GROUP_SIZE;

/// Hidden volume filling the tail of the outer encrypted area.
pub const HIDDEN_LEN: u64 = 2 * MIB;
pub const HIDDEN_START: u64 = OUTER_START + OUTER_LEN - HIDDEN_LEN;

/// Small iteration count so searches stay quick.
pub const ITERATIONS: u32 = 10;

pub fn options(family: Family) -> OpenOptions {
    OpenOptions::new(family).with_iterations(ITERATIONS)
}

pub fn pool(passphrase: &[u8]) -> KeyfilePool {
    KeyfilePool::new(passphrase).unwrap()
}

/// Master key with distinct data and tweak halves.
pub fn master_key(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed))
        .collect()
}

pub fn outer_geometry() -> HeaderGeometry {
    HeaderGeometry {
        volume_data_size: OUTER_LEN,
        encrypted_area_start: OUTER_START,
        encrypted_area_length: OUTER_LEN,
        sector_size: 512,
        ..HeaderGeometry::default()
    }
}

pub fn hidden_geometry() -> HeaderGeometry {
    HeaderGeometry {
        hidden_volume_size: HIDDEN_LEN,
        volume_data_size: HIDDEN_LEN,
        encrypted_area_start: HIDDEN_START,
        encrypted_area_length: HIDDEN_LEN,
        sector_size: 512,
        ..HeaderGeometry::default()
    }
}

/// One header to place in an image.
pub struct TestHeader<'a> {
    pub family: Family,
    pub prf: &'a str,
    pub chain: &'a str,
    pub pool: KeyfilePool,
    pub geometry: HeaderGeometry,
    pub key_seed: u8,
    pub iterations: u32,
}

impl<'a> TestHeader<'a> {
    pub fn new(family: Family, prf: &'a str, chain: &'a str, passphrase: &[u8]) -> Self {
        Self {
            family,
            prf,
            chain,
            pool: pool(passphrase),
            geometry: outer_geometry(),
            key_seed: 1,
            iterations: ITERATIONS,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.geometry = hidden_geometry();
        self.key_seed = 99;
        self
    }

    pub fn master_key(&self) -> Vec<u8> {
        let chain = find_chain(self.family, self.chain).unwrap();
        master_key(chain.key_len(), self.key_seed)
    }

    pub fn seal(&self) -> [u8; HEADER_SIZE] {
        let prf = find_prf(self.family, self.prf).unwrap();
        let chain = find_chain(self.family, self.chain).unwrap();
        let header = VolumeHeader::new(self.family, self.geometry, &self.master_key()).unwrap();
        let salt = [self.key_seed.wrapping_add(0x5a); SALT_SIZE];
        seal_header(&header, chain, prf, self.iterations, &self.pool, &salt).unwrap()
    }

    /// Cipher for the data area, keyed with this header's master key.
    pub fn data_cipher(&self) -> CascadeCipher {
        let chain = find_chain(self.family, self.chain).unwrap();
        CascadeCipher::new(chain, &self.master_key()).unwrap()
    }
}

/// Zero-filled 10 MiB host.
pub fn blank_image() -> Vec<u8> {
    vec![0u8; HOST_SIZE as usize]
}

pub fn put(image: &mut [u8], offset: u64, bytes: &[u8]) {
    let offset = offset as usize;
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Offset of the backup copy of the header at `primary`.
pub fn backup_offset(primary: u64) -> u64 {
    HOST_SIZE - HEADER_GROUP_SIZE + primary
}

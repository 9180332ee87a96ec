//! Creating new volumes: geometry, fresh key material and all four header
//! slots.

use std::io::{Seek, SeekFrom, Write};

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::config::OpenOptions;
use crate::crypto::{chains_for, CipherChain};
use crate::error::{Error, Result};
use crate::header::{HeaderGeometry, VolumeHeader, KEY_AREA_SIZE};
use crate::kdf::{Family, Prf};
use crate::keyfile::KeyfilePool;
use crate::mapping::SECTOR_SIZE;
use crate::volume::{
    device_size, seal_header, HEADER_GROUP_SIZE, HEADER_SIZE, HIDDEN_HEADER_OFFSET, SALT_SIZE,
};

/// A hidden volume to place at the end of the outer volume's data area.
#[derive(Clone, Copy)]
pub struct HiddenVolume<'p> {
    pub pool: &'p KeyfilePool,
    /// Size of the hidden data area in bytes, a multiple of 512.
    pub size: u64,
}

/// Encrypted areas of a freshly created volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedVolume {
    pub outer: HeaderGeometry,
    pub hidden: Option<HeaderGeometry>,
}

/// Writes new volume headers onto a device.
///
/// The PRF and cipher chain come from the options' pinned names and fall
/// back to the first catalog entry of the family.
#[derive(Debug)]
pub struct VolumeCreator {
    family: Family,
    prf: &'static Prf,
    iterations: u32,
    chain: &'static CipherChain,
}

impl VolumeCreator {
    pub fn new(options: &OpenOptions) -> Result<Self> {
        options.validate()?;
        if options.system_encryption {
            return Err(Error::Config("system encryption volumes cannot be created".into()));
        }

        let prf = match options.pinned_prf()? {
            Some(prf) => prf,
            None => options
                .family
                .prfs()
                .first()
                .ok_or_else(|| Error::Config(format!("no {} PRF", options.family)))?,
        };
        let chain = match options.pinned_chain()? {
            Some(chain) => chain,
            None => chains_for(options.family)
                .next()
                .ok_or_else(|| Error::Config(format!("no {} cipher chain", options.family)))?,
        };
        let iterations = prf
            .iterations_for(&options.kdf_params())
            .ok_or_else(|| Error::Config(format!("{} unusable with these options", prf.name)))?;

        Ok(Self {
            family: options.family,
            prf,
            iterations,
            chain,
        })
    }

    pub fn prf(&self) -> &'static Prf {
        self.prf
    }

    pub fn chain(&self) -> &'static CipherChain {
        self.chain
    }

    /// Creates a volume spanning the whole device using the OS random
    /// source for salts and master keys.
    pub fn create<D: Write + Seek>(
        &self,
        device: &mut D,
        pool: &KeyfilePool,
        hidden: Option<HiddenVolume<'_>>,
    ) -> Result<CreatedVolume> {
        self.create_with_rng(device, pool, hidden, &mut OsRng)
    }

    pub fn create_with_rng<D, R>(
        &self,
        device: &mut D,
        pool: &KeyfilePool,
        hidden: Option<HiddenVolume<'_>>,
        rng: &mut R,
    ) -> Result<CreatedVolume>
    where
        D: Write + Seek,
        R: RngCore + CryptoRng,
    {
        let host_size = device_size(device)?;
        let layout = plan_layout(host_size, hidden.map(|h| h.size))?;
        let backup = host_size - HEADER_GROUP_SIZE;

        // Outer header, primary and backup, each under its own salt.
        let outer = self.new_header(layout.outer, rng)?;
        for offset in [0, backup] {
            let sector = self.seal(&outer, pool, rng)?;
            write_sector(device, offset, &sector)?;
        }

        // The hidden slots always hold either a header or random bytes, so
        // the presence of a hidden volume cannot be told from the outside.
        match (hidden, layout.hidden) {
            (Some(hidden), Some(geometry)) => {
                let header = self.new_header(geometry, rng)?;
                for offset in [HIDDEN_HEADER_OFFSET, backup + HIDDEN_HEADER_OFFSET] {
                    let sector = self.seal(&header, hidden.pool, rng)?;
                    write_sector(device, offset, &sector)?;
                }
            }
            _ => {
                for offset in [HIDDEN_HEADER_OFFSET, backup + HIDDEN_HEADER_OFFSET] {
                    let mut sector = [0u8; HEADER_SIZE];
                    rng.fill_bytes(&mut sector);
                    write_sector(device, offset, &sector)?;
                }
            }
        }

        log::info!(
            "created {} volume ({}, {}), {} data bytes{}",
            self.family,
            self.prf.name,
            self.chain.name,
            layout.outer.encrypted_area_length,
            if layout.hidden.is_some() { " with hidden volume" } else { "" }
        );
        Ok(layout)
    }

    fn new_header<R: RngCore + CryptoRng>(
        &self,
        geometry: HeaderGeometry,
        rng: &mut R,
    ) -> Result<VolumeHeader> {
        let mut master_key = Zeroizing::new([0u8; KEY_AREA_SIZE]);
        loop {
            rng.fill_bytes(&mut master_key[..]);
            let header = VolumeHeader::new(self.family, geometry, &master_key[..])?;
            if !header.weak_xts_keys(self.chain) {
                return Ok(header);
            }
        }
    }

    fn seal<R: RngCore + CryptoRng>(
        &self,
        header: &VolumeHeader,
        pool: &KeyfilePool,
        rng: &mut R,
    ) -> Result<[u8; HEADER_SIZE]> {
        let mut salt = [0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);
        seal_header(header, self.chain, self.prf, self.iterations, pool, &salt)
    }
}

/// Outer and hidden geometry for a host of `host_size` bytes.
///
/// The outer data area sits between the primary and backup header groups.
/// A hidden volume takes the tail of that area.
pub fn plan_layout(host_size: u64, hidden_size: Option<u64>) -> Result<CreatedVolume> {
    if host_size % SECTOR_SIZE != 0 {
        return Err(Error::GeometryConflict(format!(
            "device size {} is not a multiple of {}",
            host_size, SECTOR_SIZE
        )));
    }
    if host_size <= 2 * HEADER_GROUP_SIZE {
        return Err(Error::GeometryConflict(format!(
            "device of {} bytes has no room for data",
            host_size
        )));
    }

    let outer_len = host_size - 2 * HEADER_GROUP_SIZE;
    let outer = HeaderGeometry {
        volume_data_size: outer_len,
        encrypted_area_start: HEADER_GROUP_SIZE,
        encrypted_area_length: outer_len,
        sector_size: SECTOR_SIZE as u32,
        ..HeaderGeometry::default()
    };

    let hidden = match hidden_size {
        None => None,
        Some(size) => {
            if size == 0 || size % SECTOR_SIZE != 0 || size >= outer_len {
                return Err(Error::GeometryConflict(format!(
                    "hidden volume of {} bytes does not fit an outer area of {} bytes",
                    size, outer_len
                )));
            }
            Some(HeaderGeometry {
                hidden_volume_size: size,
                volume_data_size: size,
                encrypted_area_start: HEADER_GROUP_SIZE + outer_len - size,
                encrypted_area_length: size,
                sector_size: SECTOR_SIZE as u32,
                ..HeaderGeometry::default()
            })
        }
    };

    Ok(CreatedVolume { outer, hidden })
}

fn write_sector<D: Write + Seek>(device: &mut D, offset: u64, sector: &[u8]) -> Result<()> {
    device
        .seek(SeekFrom::Start(offset))
        .and_then(|_| device.write_all(sector))
        .map_err(|source| Error::DeviceWrite {
            offset,
            len: sector.len(),
            source,
        })
}

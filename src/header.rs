//! Binary layout of the decrypted volume header.
//!
//! All integers are big endian. Offsets are relative to the start of the
//! 448-byte region that follows the 64-byte salt.
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{CipherChain, HEADER_ENCRYPTED_SIZE};
use crate::kdf::Family;

/// Highest header format version this reader understands.
pub const MAX_HEADER_VERSION: u16 = 5;

/// Version written by `VolumeHeader::new`.
pub const CURRENT_HEADER_VERSION: u16 = 5;

/// Header flag: the volume is a system (boot) encryption volume.
pub const FLAG_SYSTEM_ENCRYPTION: u32 = 0x1;

/// Header flag: non-system volume encrypted in place.
pub const FLAG_NONSYS_INPLACE_ENCRYPTION: u32 = 0x2;

pub const HEADER_CRC_OFFSET: usize = 188;
pub const KEY_AREA_OFFSET: usize = 192;
pub const KEY_AREA_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header buffer too short")]
    TooShort,
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported header version")]
    UnsupportedVersion,
    #[error("unsupported minimum program version")]
    UnsupportedProgramVersion,
    #[error("header CRC mismatch")]
    HeaderCrcMismatch,
    #[error("key area CRC mismatch")]
    KeyAreaCrcMismatch,
    #[error("invalid sector size")]
    InvalidSectorSize,
    #[error("master key does not fit the key area")]
    InvalidKeySize,
}

/// Newest program version a header of `family` may demand.
fn max_program_version(family: Family) -> u16 {
    match family {
        // TrueCrypt 7.1a
        Family::TrueCrypt => 0x071a,
        // VeraCrypt 1.26
        Family::VeraCrypt => 0x011a,
    }
}

fn written_program_version(family: Family) -> u16 {
    match family {
        Family::TrueCrypt => 0x0700,
        Family::VeraCrypt => 0x010b,
    }
}

/// Plain fields for building a new header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderGeometry {
    pub volume_creation_time: u64,
    pub header_creation_time: u64,
    pub hidden_volume_size: u64,
    pub volume_data_size: u64,
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
}

/// Decrypted volume header. The key area is wiped on drop and left out of
/// `Debug` output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct VolumeHeader {
    #[zeroize(skip)]
    pub family: Family,
    pub version: u16,
    pub min_program_version: u16,
    #[zeroize(skip)]
    pub key_area_crc32: u32,
    pub volume_creation_time: u64,
    pub header_creation_time: u64,
    /// Non-zero only in the header of a hidden volume.
    pub hidden_volume_size: u64,
    pub volume_data_size: u64,
    /// Byte offset of the encrypted area from the start of the host.
    pub encrypted_area_start: u64,
    pub encrypted_area_length: u64,
    pub flags: u32,
    pub sector_size: u32,
    #[zeroize(skip)]
    pub header_crc32: u32,
    pub master_key_data: [u8; KEY_AREA_SIZE],
}

impl VolumeHeader {
    /// Builds a header and fills in both checksums.
    pub fn new(
        family: Family,
        geometry: HeaderGeometry,
        master_key: &[u8],
    ) -> Result<Self, HeaderError> {
        if master_key.len() > KEY_AREA_SIZE {
            return Err(HeaderError::InvalidKeySize);
        }
        if !valid_sector_size(geometry.sector_size) {
            return Err(HeaderError::InvalidSectorSize);
        }

        let mut master_key_data = [0u8; KEY_AREA_SIZE];
        master_key_data[..master_key.len()].copy_from_slice(master_key);

        let mut header = VolumeHeader {
            family,
            version: CURRENT_HEADER_VERSION,
            min_program_version: written_program_version(family),
            key_area_crc32: crc32fast::hash(&master_key_data),
            volume_creation_time: geometry.volume_creation_time,
            header_creation_time: geometry.header_creation_time,
            hidden_volume_size: geometry.hidden_volume_size,
            volume_data_size: geometry.volume_data_size,
            encrypted_area_start: geometry.encrypted_area_start,
            encrypted_area_length: geometry.encrypted_area_length,
            flags: geometry.flags,
            sector_size: geometry.sector_size,
            header_crc32: 0,
            master_key_data,
        };

        // The header CRC covers the encoded bytes in front of it.
        let mut encoded = header.encode();
        header.header_crc32 = crc32fast::hash(&encoded[..HEADER_CRC_OFFSET]);
        encoded.zeroize();
        Ok(header)
    }

    /// Parses and validates a decrypted header region.
    ///
    /// Magic, version and both CRCs must check out. Headers older than
    /// version 4 carry no header CRC, and below version 5 the sector size
    /// is always 512.
    pub fn decode(decrypted: &[u8]) -> Result<Self, HeaderError> {
        if decrypted.len() < HEADER_ENCRYPTED_SIZE {
            return Err(HeaderError::TooShort);
        }

        // "TRUE" or "VERA"; anything else means the wrong key or chain.
        let family = Family::from_magic(&decrypted[0..4]).ok_or(HeaderError::InvalidMagic)?;

        let version = BigEndian::read_u16(&decrypted[4..6]);
        if version == 0 || version > MAX_HEADER_VERSION {
            return Err(HeaderError::UnsupportedVersion);
        }

        // The header CRC covers bytes 0..188 and only exists from version 4.
        let header_crc32 = BigEndian::read_u32(&decrypted[HEADER_CRC_OFFSET..KEY_AREA_OFFSET]);
        if version >= 4 && header_crc32 != crc32fast::hash(&decrypted[..HEADER_CRC_OFFSET]) {
            return Err(HeaderError::HeaderCrcMismatch);
        }

        // The key area CRC is stored at offset 8, ahead of the fields it follows.
        let key_area = &decrypted[KEY_AREA_OFFSET..KEY_AREA_OFFSET + KEY_AREA_SIZE];
        let key_area_crc32 = BigEndian::read_u32(&decrypted[8..12]);
        if key_area_crc32 != crc32fast::hash(key_area) {
            return Err(HeaderError::KeyAreaCrcMismatch);
        }

        let min_program_version = BigEndian::read_u16(&decrypted[6..8]);
        if min_program_version > max_program_version(family) {
            return Err(HeaderError::UnsupportedProgramVersion);
        }

        // Version 5 introduced the sector size field.
        let sector_size = if version < 5 {
            512
        } else {
            BigEndian::read_u32(&decrypted[64..68])
        };
        if !valid_sector_size(sector_size) {
            return Err(HeaderError::InvalidSectorSize);
        }

        let mut master_key_data = [0u8; KEY_AREA_SIZE];
        master_key_data.copy_from_slice(key_area);

        Ok(VolumeHeader {
            family,
            version,
            min_program_version,
            key_area_crc32,
            volume_creation_time: BigEndian::read_u64(&decrypted[12..20]),
            header_creation_time: BigEndian::read_u64(&decrypted[20..28]),
            hidden_volume_size: BigEndian::read_u64(&decrypted[28..36]),
            volume_data_size: BigEndian::read_u64(&decrypted[36..44]),
            encrypted_area_start: BigEndian::read_u64(&decrypted[44..52]),
            encrypted_area_length: BigEndian::read_u64(&decrypted[52..60]),
            flags: BigEndian::read_u32(&decrypted[60..64]),
            sector_size,
            header_crc32,
            master_key_data,
        })
    }

    /// Serializes the stored fields. The caller wipes the result.
    pub fn encode(&self) -> [u8; HEADER_ENCRYPTED_SIZE] {
        let mut out = [0u8; HEADER_ENCRYPTED_SIZE];
        out[0..4].copy_from_slice(self.family.magic());
        BigEndian::write_u16(&mut out[4..6], self.version);
        BigEndian::write_u16(&mut out[6..8], self.min_program_version);
        BigEndian::write_u32(&mut out[8..12], self.key_area_crc32);
        BigEndian::write_u64(&mut out[12..20], self.volume_creation_time);
        BigEndian::write_u64(&mut out[20..28], self.header_creation_time);
        BigEndian::write_u64(&mut out[28..36], self.hidden_volume_size);
        BigEndian::write_u64(&mut out[36..44], self.volume_data_size);
        BigEndian::write_u64(&mut out[44..52], self.encrypted_area_start);
        BigEndian::write_u64(&mut out[52..60], self.encrypted_area_length);
        BigEndian::write_u32(&mut out[60..64], self.flags);
        BigEndian::write_u32(&mut out[64..68], self.sector_size);
        // 68..188 reserved, zero
        BigEndian::write_u32(&mut out[HEADER_CRC_OFFSET..KEY_AREA_OFFSET], self.header_crc32);
        out[KEY_AREA_OFFSET..].copy_from_slice(&self.master_key_data);
        out
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden_volume_size != 0
    }

    pub fn is_system_encryption(&self) -> bool {
        self.flags & FLAG_SYSTEM_ENCRYPTION != 0
    }

    /// Master key bytes used by `chain`.
    pub fn master_key(&self, chain: &CipherChain) -> &[u8] {
        &self.master_key_data[..chain.key_len().min(KEY_AREA_SIZE)]
    }

    /// True if any XTS stage of `chain` has a data key equal to its tweak
    /// key. Such volumes are refused.
    pub fn weak_xts_keys(&self, chain: &CipherChain) -> bool {
        match chain.stage_keys(&self.master_key_data) {
            Ok(stages) => stages.iter().any(|(data, tweak)| data == tweak),
            Err(_) => true,
        }
    }
}

impl fmt::Debug for VolumeHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VolumeHeader")
            .field("family", &self.family)
            .field("version", &self.version)
            .field("min_program_version", &self.min_program_version)
            .field("key_area_crc32", &self.key_area_crc32)
            .field("hidden_volume_size", &self.hidden_volume_size)
            .field("volume_data_size", &self.volume_data_size)
            .field("encrypted_area_start", &self.encrypted_area_start)
            .field("encrypted_area_length", &self.encrypted_area_length)
            .field("flags", &self.flags)
            .field("sector_size", &self.sector_size)
            .finish_non_exhaustive()
    }
}

fn valid_sector_size(size: u32) -> bool {
    (512..=4096).contains(&size) && size % 512 == 0
}

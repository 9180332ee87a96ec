//! Mapping plans: how the decrypted volumes are laid over the backing device.
//!
//! The planner only describes mappings. Creating the block devices and
//! refusing writes to protected ranges is up to whoever consumes the plan.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::crypto::CipherChain;
use crate::error::{Error, Result};
use crate::volume::OpenedVolume;

/// Device-mapper sector size; all plan offsets are multiples of it.
pub const SECTOR_SIZE: u64 = 512;

/// Where a system-encrypted partition sits on its boot drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPartition {
    /// Byte offset of the partition from the start of the drive.
    pub offset: u64,
    pub size: u64,
}

/// Contiguous logical range of a mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub length: u64,
    pub write_protected: bool,
}

/// One decrypted block device.
pub struct MappingEntry<'a> {
    pub name: String,
    pub device: PathBuf,
    /// Byte offset of the first mapped byte on `device`.
    pub device_offset: u64,
    /// Mapped length in bytes.
    pub length: u64,
    /// XTS data unit number of the first mapped sector.
    pub iv_offset: u64,
    pub chain: &'static CipherChain,
    key: &'a [u8],
    /// Logical byte ranges (relative to the start of this mapping) that
    /// must not be written.
    pub protected: Vec<Range<u64>>,
}

impl<'a> MappingEntry<'a> {
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    pub fn is_write_protected(&self, offset: u64) -> bool {
        self.protected.iter().any(|r| r.contains(&offset))
    }

    /// True if a write of `len` bytes at `offset` touches a protected range.
    pub fn write_hits_protected(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        self.protected
            .iter()
            .any(|r| offset < r.end && r.start < end)
    }

    /// Splits the entry into crypt and protected regions, in order.
    pub fn regions(&self) -> Vec<Region> {
        let mut protected = self.protected.clone();
        protected.sort_by_key(|r| r.start);

        // Walk the sorted ranges, filling the gaps with crypt regions.
        let mut regions = Vec::new();
        let mut pos = 0;
        for range in protected {
            let start = range.start.max(pos);
            let end = range.end.min(self.length);
            if start >= end {
                continue;
            }
            if start > pos {
                regions.push(Region {
                    start: pos,
                    length: start - pos,
                    write_protected: false,
                });
            }
            regions.push(Region {
                start,
                length: end - start,
                write_protected: true,
            });
            pos = end;
        }
        if pos < self.length {
            regions.push(Region {
                start: pos,
                length: self.length - pos,
                write_protected: false,
            });
        }
        regions
    }

    /// Device-mapper tables, one stacked `crypt` layer per cipher stage.
    ///
    /// The first table reads the backing device and removes the outermost
    /// cipher; the last one carries the entry's name. Protected regions
    /// become `error` targets in every layer, so no intermediate device
    /// exposes them either.
    pub fn dm_tables(&self) -> Result<Vec<DmTable>> {
        let stages = self.chain.stage_keys(self.key)?;
        let layers = stages.len();
        let regions = self.regions();
        let mut tables = Vec::with_capacity(layers);

        for layer in 0..layers {
            // Layer 0 undoes the last encryption stage.
            let stage = layers - 1 - layer;
            let cipher = self.chain.stages[stage];
            let (data_key, tweak_key) = stages[stage];

            let mut key = Zeroizing::new(Vec::with_capacity(data_key.len() + tweak_key.len()));
            key.extend_from_slice(data_key);
            key.extend_from_slice(tweak_key);
            let key_hex = Zeroizing::new(hex::encode(&*key));

            let name = if layer + 1 == layers {
                self.name.clone()
            } else {
                format!("{}.{}", self.name, layer)
            };
            let (device, base) = if layer == 0 {
                (self.device.display().to_string(), self.device_offset / SECTOR_SIZE)
            } else {
                (format!("/dev/mapper/{}.{}", self.name, layer - 1), 0)
            };

            // Key-free parts of each line, so the table is allocated once.
            let lines: Vec<(String, Option<String>)> = regions
                .iter()
                .map(|region| {
                    let start = region.start / SECTOR_SIZE;
                    let sectors = region.length / SECTOR_SIZE;
                    if region.write_protected {
                        (format!("{} {} error\n", start, sectors), None)
                    } else {
                        (
                            format!("{} {} crypt {}-xts-plain64 ", start, sectors, cipher.dm_name()),
                            Some(format!(" {} {} {}\n", self.iv_offset + start, device, base + start)),
                        )
                    }
                })
                .collect();

            let capacity = lines
                .iter()
                .map(|(head, tail)| match tail {
                    Some(tail) => head.len() + key_hex.len() + tail.len(),
                    None => head.len(),
                })
                .sum();

            let mut table = Zeroizing::new(String::with_capacity(capacity));
            for (head, tail) in &lines {
                table.push_str(head);
                if let Some(tail) = tail {
                    table.push_str(&key_hex);
                    table.push_str(tail);
                }
            }

            tables.push(DmTable { name, table });
        }

        Ok(tables)
    }
}

impl fmt::Debug for MappingEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappingEntry")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("device_offset", &self.device_offset)
            .field("length", &self.length)
            .field("iv_offset", &self.iv_offset)
            .field("chain", &self.chain.name)
            .field("protected", &self.protected)
            .finish_non_exhaustive()
    }
}

/// A device-mapper table. The text holds key material.
pub struct DmTable {
    pub name: String,
    pub table: Zeroizing<String>,
}

impl fmt::Debug for DmTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmTable")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MappingPlan<'a> {
    pub entries: Vec<MappingEntry<'a>>,
}

impl<'a> MappingPlan<'a> {
    pub fn entry(&self, name: &str) -> Option<&MappingEntry<'a>> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Computes mapping plans for opened volumes on one backing device.
#[derive(Debug, Clone)]
pub struct MappingPlanner {
    name: String,
    device: PathBuf,
    system_partition: Option<SystemPartition>,
}

impl MappingPlanner {
    pub fn new(name: &str, device: &Path) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_path_buf(),
            system_partition: None,
        }
    }

    /// Maps a system-encrypted partition instead of the whole encrypted area.
    pub fn with_system_partition(mut self, partition: SystemPartition) -> Self {
        self.system_partition = Some(partition);
        self
    }

    pub fn hidden_name(&self) -> String {
        format!("{}_hidden", self.name)
    }

    pub fn plan<'a>(
        &self,
        outer: &'a OpenedVolume,
        hidden: Option<&'a OpenedVolume>,
        protect_hidden: bool,
    ) -> Result<MappingPlan<'a>> {
        // The outer entry always exists; the hidden volume either gets its
        // own entry or becomes a protected range of the outer one.
        let mut outer_entry = self.entry_for(self.name.clone(), outer)?;

        let entries = match hidden {
            None => {
                if protect_hidden {
                    log::warn!("hidden volume protection requested without a hidden volume");
                }
                vec![outer_entry]
            }
            Some(hidden) => {
                let range = hidden_range(outer, hidden)?;
                if protect_hidden {
                    log::info!(
                        "protecting hidden volume bytes {}..{} of {}",
                        range.start,
                        range.end,
                        self.name
                    );
                    outer_entry.protected.push(range);
                    vec![outer_entry]
                } else {
                    let hidden_entry = self.entry_for(self.hidden_name(), hidden)?;
                    vec![outer_entry, hidden_entry]
                }
            }
        };

        Ok(MappingPlan { entries })
    }

    fn entry_for<'a>(&self, name: String, volume: &'a OpenedVolume) -> Result<MappingEntry<'a>> {
        let start = volume.data_offset();
        let length = volume.data_size();

        if length == 0 {
            return Err(Error::GeometryConflict(format!("{} has an empty encrypted area", name)));
        }
        if start % SECTOR_SIZE != 0 || length % SECTOR_SIZE != 0 {
            return Err(Error::GeometryConflict(format!(
                "{} encrypted area is not sector aligned",
                name
            )));
        }
        let end = start
            .checked_add(length)
            .ok_or_else(|| Error::GeometryConflict(format!("{} encrypted area overflows", name)))?;

        let (device_offset, length, iv_offset) = match self.system_partition {
            Some(part) if volume.header().is_system_encryption() => {
                let part_end = part.offset.checked_add(part.size).unwrap_or(u64::MAX);
                if part.offset < start || part_end > end || part.size == 0 {
                    return Err(Error::GeometryConflict(format!(
                        "system partition at {} is outside the encrypted area",
                        part.offset
                    )));
                }
                (0, part.size, part.offset / SECTOR_SIZE)
            }
            _ => (start, length, start / SECTOR_SIZE),
        };

        Ok(MappingEntry {
            name,
            device: self.device.clone(),
            device_offset,
            length,
            iv_offset,
            chain: volume.chain(),
            key: volume.master_key(),
            protected: Vec::new(),
        })
    }
}

/// Hidden volume byte range relative to the start of the outer mapping.
fn hidden_range(outer: &OpenedVolume, hidden: &OpenedVolume) -> Result<Range<u64>> {
    let outer_start = outer.data_offset();
    let outer_end = outer_start.saturating_add(outer.data_size());
    let hidden_start = hidden.data_offset();
    let hidden_end = hidden_start
        .checked_add(hidden.data_size())
        .ok_or_else(|| Error::GeometryConflict("hidden volume area overflows".into()))?;

    if hidden_start >= hidden_end {
        return Err(Error::GeometryConflict("hidden volume is empty".into()));
    }
    // Partial sectors cannot be expressed as dm targets.
    if hidden_start % SECTOR_SIZE != 0 || (hidden_end - hidden_start) % SECTOR_SIZE != 0 {
        return Err(Error::GeometryConflict(format!(
            "hidden volume {}..{} is not sector aligned",
            hidden_start, hidden_end
        )));
    }
    if hidden_start < outer_start || hidden_end > outer_end {
        return Err(Error::GeometryConflict(format!(
            "hidden volume {}..{} exceeds outer volume {}..{}",
            hidden_start, hidden_end, outer_start, outer_end
        )));
    }

    Ok(hidden_start - outer_start..hidden_end - outer_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::find_chain;
    use crate::header::{HeaderGeometry, VolumeHeader, FLAG_SYSTEM_ENCRYPTION};
    use crate::kdf::{Family, KeyMaterial, TRUECRYPT_PRFS};
    use crate::volume::{FoundHeader, VolumeKind};

    const OUTER_START: u64 = 131_072;
    const OUTER_LEN: u64 = 10_223_616;
    const HIDDEN_START: u64 = 8_257_536;
    const HIDDEN_LEN: u64 = 1_048_576;

    fn opened(start: u64, len: u64, chain: &str, flags: u32, kind: VolumeKind) -> OpenedVolume {
        let chain = find_chain(Family::TrueCrypt, chain).unwrap();
        let master: Vec<u8> = (0..chain.key_len()).map(|i| i as u8).collect();
        let header = VolumeHeader::new(
            Family::TrueCrypt,
            HeaderGeometry {
                encrypted_area_start: start,
                encrypted_area_length: len,
                volume_data_size: len,
                flags,
                sector_size: 512,
                ..HeaderGeometry::default()
            },
            &master,
        )
        .unwrap();
        let found = FoundHeader {
            header,
            prf: &TRUECRYPT_PRFS[0],
            iterations: 1,
            chain,
            header_key: KeyMaterial::from_bytes(&[0u8; 64]),
        };
        OpenedVolume::from_found(found, 0, kind, false)
    }

    fn outer() -> OpenedVolume {
        opened(OUTER_START, OUTER_LEN, "AES", 0, VolumeKind::Normal)
    }

    fn hidden() -> OpenedVolume {
        opened(HIDDEN_START, HIDDEN_LEN, "Serpent", 0, VolumeKind::Hidden)
    }

    fn planner() -> MappingPlanner {
        MappingPlanner::new("vol", Path::new("/dev/sdz"))
    }

    #[test]
    fn test_single_volume() {
        let outer = outer();
        let plan = planner().plan(&outer, None, false).unwrap();
        assert_eq!(plan.entries.len(), 1);

        let entry = &plan.entries[0];
        assert_eq!(entry.name, "vol");
        assert_eq!(entry.device_offset, OUTER_START);
        assert_eq!(entry.length, OUTER_LEN);
        assert_eq!(entry.iv_offset, 256);
        assert_eq!(entry.key(), outer.master_key());
        assert!(!entry.is_write_protected(0));

        let tables = entry.dm_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "vol");
        let key: Vec<u8> = (0..64).collect();
        let expected = format!(
            "0 19968 crypt aes-xts-plain64 {} 256 /dev/sdz 256\n",
            hex::encode(key)
        );
        assert_eq!(tables[0].table.as_str(), expected);
    }

    #[test]
    fn test_protected_hidden_volume() {
        let outer = outer();
        let hidden = hidden();
        let plan = planner().plan(&outer, Some(&hidden), true).unwrap();
        assert_eq!(plan.entries.len(), 1);

        let entry = plan.entry("vol").unwrap();
        let lo = HIDDEN_START - OUTER_START;
        let hi = lo + HIDDEN_LEN;
        assert_eq!(entry.protected, vec![lo..hi]);

        assert!(!entry.is_write_protected(lo - 1));
        assert!(entry.is_write_protected(lo));
        assert!(entry.is_write_protected(hi - 1));
        assert!(!entry.is_write_protected(hi));
        assert!(entry.write_hits_protected(lo - 512, 1024));
        assert!(!entry.write_hits_protected(hi, 4096));

        assert_eq!(
            entry.regions(),
            vec![
                Region {
                    start: 0,
                    length: lo,
                    write_protected: false
                },
                Region {
                    start: lo,
                    length: HIDDEN_LEN,
                    write_protected: true
                },
                Region {
                    start: hi,
                    length: OUTER_LEN - hi,
                    write_protected: false
                },
            ]
        );

        let tables = entry.dm_tables().unwrap();
        let lines: Vec<&str> = tables[0].table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], format!("{} {} error", lo / 512, HIDDEN_LEN / 512));
        assert!(lines[2].ends_with(&format!(
            " {} /dev/sdz {}",
            256 + hi / 512,
            256 + hi / 512
        )));
    }

    #[test]
    fn test_unprotected_hidden_gets_own_entry() {
        let outer = outer();
        let hidden = hidden();
        let plan = planner().plan(&outer, Some(&hidden), false).unwrap();
        assert_eq!(plan.entries.len(), 2);

        let outer_entry = plan.entry("vol").unwrap();
        assert!(outer_entry.protected.is_empty());

        let hidden_entry = plan.entry("vol_hidden").unwrap();
        assert_eq!(hidden_entry.device_offset, HIDDEN_START);
        assert_eq!(hidden_entry.iv_offset, HIDDEN_START / 512);
        assert_eq!(hidden_entry.chain.name, "Serpent");
    }

    #[test]
    fn test_hidden_outside_outer_conflicts() {
        let outer = outer();
        let past_end = opened(
            OUTER_START + OUTER_LEN - 512,
            1024,
            "AES",
            0,
            VolumeKind::Hidden,
        );
        assert!(matches!(
            planner().plan(&outer, Some(&past_end), true),
            Err(Error::GeometryConflict(_))
        ));

        let before_start = opened(512, 4096, "AES", 0, VolumeKind::Hidden);
        assert!(matches!(
            planner().plan(&outer, Some(&before_start), false),
            Err(Error::GeometryConflict(_))
        ));
    }

    #[test]
    fn test_empty_or_unaligned_area_conflicts() {
        let empty = opened(OUTER_START, 0, "AES", 0, VolumeKind::Normal);
        assert!(matches!(
            planner().plan(&empty, None, false),
            Err(Error::GeometryConflict(_))
        ));

        let unaligned = opened(OUTER_START + 1, 4096, "AES", 0, VolumeKind::Normal);
        assert!(matches!(
            planner().plan(&unaligned, None, false),
            Err(Error::GeometryConflict(_))
        ));
    }

    #[test]
    fn test_cascade_layers() {
        let outer = opened(OUTER_START, OUTER_LEN, "AES-Twofish-Serpent", 0, VolumeKind::Normal);
        let plan = planner().plan(&outer, None, false).unwrap();
        let tables = plan.entries[0].dm_tables().unwrap();

        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["vol.0", "vol.1", "vol"]);

        assert!(tables[0].table.contains(" crypt aes-xts-plain64 "));
        assert!(tables[0].table.ends_with(" 256 /dev/sdz 256\n"));
        assert!(tables[1].table.contains(" crypt twofish-xts-plain64 "));
        assert!(tables[1].table.ends_with(" 256 /dev/mapper/vol.0 0\n"));
        assert!(tables[2].table.contains(" crypt serpent-xts-plain64 "));
        assert!(tables[2].table.ends_with(" 256 /dev/mapper/vol.1 0\n"));

        // AES is the last encryption stage: data key 64..96, tweak 160..192.
        let mut key: Vec<u8> = (64..96).collect();
        key.extend(160..192u8);
        assert!(tables[0].table.contains(&hex::encode(key)));
    }

    #[test]
    fn test_unaligned_hidden_volume_conflicts() {
        let outer = outer();
        let hidden = opened(HIDDEN_START + 100, HIDDEN_LEN, "AES", 0, VolumeKind::Hidden);
        assert!(matches!(
            planner().plan(&outer, Some(&hidden), true),
            Err(Error::GeometryConflict(_))
        ));

        let short = opened(HIDDEN_START, HIDDEN_LEN - 100, "AES", 0, VolumeKind::Hidden);
        assert!(matches!(
            planner().plan(&outer, Some(&short), true),
            Err(Error::GeometryConflict(_))
        ));
    }

    #[test]
    fn test_protected_range_in_every_cascade_layer() {
        let outer = opened(OUTER_START, OUTER_LEN, "Serpent-Twofish-AES", 0, VolumeKind::Normal);
        let hidden = hidden();
        let plan = planner().plan(&outer, Some(&hidden), true).unwrap();
        let tables = plan.entries[0].dm_tables().unwrap();
        assert_eq!(tables.len(), 3);

        let lo = (HIDDEN_START - OUTER_START) / 512;
        let error_line = format!("{} {} error", lo, HIDDEN_LEN / 512);
        for table in &tables {
            let lines: Vec<&str> = table.table.lines().collect();
            assert_eq!(lines.len(), 3, "{}", table.name);
            assert_eq!(lines[1], error_line, "{}", table.name);

            let total: u64 = lines
                .iter()
                .map(|l| l.split(' ').nth(1).unwrap().parse::<u64>().unwrap())
                .sum();
            assert_eq!(total, OUTER_LEN / 512, "{}", table.name);
        }
    }

    #[test]
    fn test_table_allocated_exactly() {
        let outer = outer();
        let hidden = hidden();
        let long_device = format!("/dev/disk/by-id/{}", "x".repeat(300));
        let plan = MappingPlanner::new("vol", Path::new(&long_device))
            .plan(&outer, Some(&hidden), true)
            .unwrap();
        for table in plan.entries[0].dm_tables().unwrap() {
            assert_eq!(table.table.capacity(), table.table.len());
            assert!(table.table.contains(&long_device));
        }
    }

    #[test]
    fn test_system_partition() {
        let system = opened(
            OUTER_START,
            OUTER_LEN,
            "AES",
            FLAG_SYSTEM_ENCRYPTION,
            VolumeKind::Normal,
        );
        let partition = SystemPartition {
            offset: 1_048_576,
            size: 2_097_152,
        };
        let plan = MappingPlanner::new("sys", Path::new("/dev/sdz1"))
            .with_system_partition(partition)
            .plan(&system, None, false)
            .unwrap();

        let entry = &plan.entries[0];
        assert_eq!(entry.device_offset, 0);
        assert_eq!(entry.length, 2_097_152);
        assert_eq!(entry.iv_offset, 2048);

        let outside = SystemPartition {
            offset: OUTER_START + OUTER_LEN,
            size: 4096,
        };
        assert!(matches!(
            planner().with_system_partition(outside).plan(&system, None, false),
            Err(Error::GeometryConflict(_))
        ));
    }

    #[test]
    fn test_system_partition_ignored_for_regular_volume() {
        let outer = outer();
        let partition = SystemPartition {
            offset: 1_048_576,
            size: 2_097_152,
        };
        let plan = planner()
            .with_system_partition(partition)
            .plan(&outer, None, false)
            .unwrap();
        assert_eq!(plan.entries[0].device_offset, OUTER_START);
    }
}

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use zeroize::Zeroize;

use crate::config::OpenOptions;
use crate::crypto::{chains_for, CascadeCipher, CipherChain, HEADER_ENCRYPTED_SIZE};
use crate::error::{Error, Result};
use crate::header::VolumeHeader;
use crate::kdf::{derive, Family, KdfParams, KeyMaterial, Prf};
use crate::keyfile::KeyfilePool;

/// One header sector: salt followed by the encrypted header.
pub const HEADER_SIZE: usize = 512;
pub const SALT_SIZE: usize = 64;

pub const HEADER_OFFSET: u64 = 0;
pub const HIDDEN_HEADER_OFFSET: u64 = 65_536;
/// Primary header group size; the backup group sits in the last 128 KiB.
pub const HEADER_GROUP_SIZE: u64 = 131_072;
/// System encryption keeps its header in sector 62 of the boot drive.
pub const SYSTEM_HEADER_OFFSET: u64 = 31_744;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Normal,
    Hidden,
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VolumeKind::Normal => write!(f, "normal"),
            VolumeKind::Hidden => write!(f, "hidden"),
        }
    }
}

/// The (PRF, cipher chain) product a header search walks through.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    prfs: Vec<(&'static Prf, u32)>,
    chains: Vec<&'static CipherChain>,
    parallel: bool,
}

impl SearchSpace {
    /// Builds the search space for `options`. Pinned names are checked here,
    /// before any derivation work.
    pub fn resolve(options: &OpenOptions) -> Result<Self> {
        options.validate()?;
        let params = options.kdf_params();

        let prfs: Vec<&'static Prf> = match options.pinned_prf()? {
            Some(prf) => vec![prf],
            None => options.family.prfs().iter().collect(),
        };
        let chains = match options.pinned_chain()? {
            Some(chain) => vec![chain],
            None => chains_for(options.family).collect(),
        };

        let mut space = Self::new(&prfs, &chains, &params);
        space.parallel = options.parallel_kdf;
        Ok(space)
    }

    /// Search space over exactly these PRFs and chains, in the given order.
    pub fn new(prfs: &[&'static Prf], chains: &[&'static CipherChain], params: &KdfParams) -> Self {
        let prfs = prfs
            .iter()
            .filter_map(|prf| prf.iterations_for(params).map(|n| (*prf, n)))
            .collect();
        Self {
            prfs,
            chains: chains.to_vec(),
            parallel: false,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prfs.is_empty() || self.chains.is_empty()
    }

    /// Distinct key lengths in first-use order.
    fn key_lengths(&self) -> Vec<usize> {
        let mut lengths = Vec::new();
        for chain in &self.chains {
            if !lengths.contains(&chain.key_len()) {
                lengths.push(chain.key_len());
            }
        }
        lengths
    }
}

/// Header keys derived so far, one per (PRF, length). Wiped on drop.
struct KeyCache {
    entries: Vec<(usize, usize, KeyMaterial)>,
}

impl KeyCache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Derives every key of `space` up front on scoped threads.
    fn prefill(space: &SearchSpace, password: &[u8], salt: &[u8]) -> Result<Self> {
        let lengths = space.key_lengths();
        let jobs: Vec<(usize, usize)> = (0..space.prfs.len())
            .flat_map(|p| lengths.iter().map(move |len| (p, *len)))
            .collect();

        let results: Vec<Result<KeyMaterial>> = thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|&(p, len)| {
                    let (prf, iterations) = space.prfs[p];
                    s.spawn(move || derive(prf, password, salt, iterations, len))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::Kdf("derivation worker panicked".into())))
                })
                .collect()
        });

        let mut cache = Self::new();
        for ((p, len), key) in jobs.into_iter().zip(results) {
            cache.entries.push((p, len, key?));
        }
        Ok(cache)
    }

    fn get_or_derive(
        &mut self,
        space: &SearchSpace,
        prf_index: usize,
        len: usize,
        password: &[u8],
        salt: &[u8],
    ) -> Result<&KeyMaterial> {
        let pos = match self
            .entries
            .iter()
            .position(|(p, l, _)| *p == prf_index && *l == len)
        {
            Some(pos) => pos,
            None => {
                let (prf, iterations) = space.prfs[prf_index];
                let key = derive(prf, password, salt, iterations, len)?;
                self.entries.push((prf_index, len, key));
                self.entries.len() - 1
            }
        };
        Ok(&self.entries[pos].2)
    }
}

/// A header that decrypted and validated.
#[derive(Debug)]
pub struct FoundHeader {
    pub header: VolumeHeader,
    pub prf: &'static Prf,
    pub iterations: u32,
    pub chain: &'static CipherChain,
    pub header_key: KeyMaterial,
}

/// End state of a header search.
#[derive(Debug)]
pub enum SearchOutcome {
    Found(Box<FoundHeader>),
    Exhausted,
}

fn try_chain(
    chain: &'static CipherChain,
    key: &KeyMaterial,
    encrypted: &[u8],
) -> Result<Option<VolumeHeader>> {
    let cascade = CascadeCipher::new(chain, key.as_bytes())?;
    let mut buf = [0u8; HEADER_ENCRYPTED_SIZE];
    buf.copy_from_slice(encrypted);
    cascade.decrypt_header(&mut buf);
    let decoded = VolumeHeader::decode(&buf);
    buf.zeroize();
    Ok(decoded.ok())
}

/// Searches `space` for the (PRF, chain) pair that opens `sector`.
///
/// PRFs are tried in order; each derives one key per distinct key length,
/// reused by every chain of that length. The first pair whose plaintext
/// decodes, with the magic of the PRF's family, wins; identical inputs
/// always give the same winner.
pub fn search_header(
    sector: &[u8; HEADER_SIZE],
    pool: &KeyfilePool,
    space: &SearchSpace,
    cancel: Option<&AtomicBool>,
) -> Result<SearchOutcome> {
    // The salt is stored in the clear in front of the encrypted header.
    let salt = &sector[..SALT_SIZE];
    let encrypted = &sector[SALT_SIZE..];
    let password = pool.as_bytes();

    let mut cache = if space.parallel {
        KeyCache::prefill(space, password, salt)?
    } else {
        KeyCache::new()
    };

    for (prf_index, &(prf, iterations)) in space.prfs.iter().enumerate() {
        for &chain in &space.chains {
            // Checked per candidate; a derivation in flight is not interrupted.
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled);
            }

            // Chains of equal key length share one derivation.
            let key = cache.get_or_derive(space, prf_index, chain.key_len(), password, salt)?;
            let header = try_chain(chain, key, encrypted)?.filter(|h| h.family == prf.family);
            if let Some(header) = header {
                return Ok(SearchOutcome::Found(Box::new(FoundHeader {
                    header,
                    prf,
                    iterations,
                    chain,
                    header_key: key.clone(),
                })));
            }
        }
    }

    Ok(SearchOutcome::Exhausted)
}

/// Encrypts `header` under a fresh header key and prepends `salt`.
pub fn seal_header(
    header: &VolumeHeader,
    chain: &'static CipherChain,
    prf: &Prf,
    iterations: u32,
    pool: &KeyfilePool,
    salt: &[u8; SALT_SIZE],
) -> Result<[u8; HEADER_SIZE]> {
    let key = derive(prf, pool.as_bytes(), salt, iterations, chain.key_len())?;
    let cascade = CascadeCipher::new(chain, key.as_bytes())?;

    let mut plain = header.encode();
    cascade.encrypt_header(&mut plain);

    let mut sector = [0u8; HEADER_SIZE];
    sector[..SALT_SIZE].copy_from_slice(salt);
    sector[SALT_SIZE..].copy_from_slice(&plain);
    Ok(sector)
}

/// A volume whose header was found and validated.
#[derive(Debug)]
pub struct OpenedVolume {
    header: VolumeHeader,
    prf: &'static Prf,
    iterations: u32,
    chain: &'static CipherChain,
    header_key: KeyMaterial,
    header_offset: u64,
    kind: VolumeKind,
    from_backup: bool,
}

impl OpenedVolume {
    pub(crate) fn from_found(found: FoundHeader, header_offset: u64, kind: VolumeKind, from_backup: bool) -> Self {
        let FoundHeader {
            header,
            prf,
            iterations,
            chain,
            header_key,
        } = found;
        Self {
            header,
            prf,
            iterations,
            chain,
            header_key,
            header_offset,
            kind,
            from_backup,
        }
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn family(&self) -> Family {
        self.header.family
    }

    pub fn prf(&self) -> &'static Prf {
        self.prf
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn chain(&self) -> &'static CipherChain {
        self.chain
    }

    pub fn header_key(&self) -> &KeyMaterial {
        &self.header_key
    }

    pub fn master_key(&self) -> &[u8] {
        self.header.master_key(self.chain)
    }

    /// Byte offset of the header sector this volume was opened from.
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn from_backup(&self) -> bool {
        self.from_backup
    }

    /// Start of the encrypted area, in bytes from the start of the host.
    pub fn data_offset(&self) -> u64 {
        self.header.encrypted_area_start
    }

    /// Length of the encrypted area in bytes.
    pub fn data_size(&self) -> u64 {
        self.header.encrypted_area_length
    }

    /// Cipher for reading and writing the volume data.
    pub fn cipher(&self) -> Result<CascadeCipher> {
        CascadeCipher::new(self.chain, self.master_key())
    }

    /// Re-encrypts this header under new credentials, e.g. to change the
    /// passphrase. The master key and geometry stay the same.
    pub fn reseal(
        &self,
        pool: &KeyfilePool,
        salt: &[u8; SALT_SIZE],
        prf: &Prf,
        iterations: u32,
    ) -> Result<[u8; HEADER_SIZE]> {
        seal_header(&self.header, self.chain, prf, iterations, pool, salt)
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            family: self.header.family,
            kind: self.kind,
            prf: self.prf.name,
            iterations: self.iterations,
            cipher: self.chain.name,
            key_bits: self.chain.key_len() * 8,
            key_area_crc32: self.header.key_area_crc32,
            sector_size: self.header.sector_size,
            volume_sectors: self.header.encrypted_area_length / 512,
            iv_offset: self.header.encrypted_area_start / 512,
            block_offset: self.header.encrypted_area_start / 512,
            from_backup: self.from_backup,
        }
    }
}

/// Non-secret summary of an opened volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub family: Family,
    pub kind: VolumeKind,
    pub prf: &'static str,
    pub iterations: u32,
    pub cipher: &'static str,
    pub key_bits: usize,
    pub key_area_crc32: u32,
    pub sector_size: u32,
    /// Size in 512-byte sectors.
    pub volume_sectors: u64,
    pub iv_offset: u64,
    pub block_offset: u64,
    pub from_backup: bool,
}

impl fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Format:\t\t\t{} ({})", self.family, self.kind)?;
        writeln!(f, "PBKDF2 PRF:\t\t{}", self.prf)?;
        writeln!(f, "PBKDF2 iterations:\t{}", self.iterations)?;
        writeln!(f, "Cipher:\t\t\t{}", self.cipher)?;
        writeln!(f, "Key Length:\t\t{} bits", self.key_bits)?;
        writeln!(f, "CRC Key Data:\t\t{:#x}", self.key_area_crc32)?;
        writeln!(f, "Sector size:\t\t{}", self.sector_size)?;
        writeln!(f, "Volume size:\t\t{} sectors", self.volume_sectors)?;
        writeln!(f, "IV offset:\t\t{}", self.iv_offset)?;
        write!(f, "Block offset:\t\t{}", self.block_offset)?;
        if self.from_backup {
            write!(f, "\n(opened from backup header)")?;
        }
        Ok(())
    }
}

/// Whether to look for a hidden volume after the outer one opens.
#[derive(Clone, Copy)]
pub enum HiddenRequest<'p> {
    None,
    /// Search with this pool, a miss is not an error.
    Optional(&'p KeyfilePool),
    /// Search with this pool, a miss is `SearchExhausted`.
    Required(&'p KeyfilePool),
}

/// Result of `VolumeOpener::open`.
#[derive(Debug)]
pub struct OpenedVolumes {
    pub outer: OpenedVolume,
    pub hidden: Option<OpenedVolume>,
}

/// Drives header searches against a device.
///
/// One call to `open` is one catalog search per header location; passphrase
/// retries are up to the caller.
pub struct VolumeOpener<'a> {
    options: &'a OpenOptions,
    space: SearchSpace,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> VolumeOpener<'a> {
    pub fn new(options: &'a OpenOptions) -> Result<Self> {
        let space = SearchSpace::resolve(options)?;
        if space.is_empty() {
            return Err(Error::Config(format!(
                "no {} PRF usable with these options",
                options.family
            )));
        }
        Ok(Self {
            options,
            space,
            cancel: None,
        })
    }

    /// Aborts the search between candidates once `flag` is set.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn open<D: Read + Seek>(
        &self,
        device: &mut D,
        pool: &KeyfilePool,
        hidden: HiddenRequest<'_>,
    ) -> Result<OpenedVolumes> {
        let outer = match self.search_kind(device, pool, VolumeKind::Normal, false)? {
            Some(volume) => volume,
            // Same passphrase at the hidden header: the user is opening the
            // hidden volume itself.
            None if matches!(hidden, HiddenRequest::None) => self
                .search_kind(device, pool, VolumeKind::Hidden, true)?
                .ok_or(Error::SearchExhausted)?,
            None => return Err(Error::SearchExhausted),
        };

        let hidden_volume = match hidden {
            HiddenRequest::None => None,
            HiddenRequest::Optional(hidden_pool) => {
                self.search_kind(device, hidden_pool, VolumeKind::Hidden, true)?
            }
            HiddenRequest::Required(hidden_pool) => Some(
                self.search_kind(device, hidden_pool, VolumeKind::Hidden, false)?
                    .ok_or(Error::SearchExhausted)?,
            ),
        };

        if hidden_volume.is_none() && !matches!(hidden, HiddenRequest::None) {
            log::info!("no hidden volume header found");
        }

        Ok(OpenedVolumes {
            outer,
            hidden: hidden_volume,
        })
    }

    /// Header sector offsets for `kind`, primary first.
    fn header_locations<D: Seek>(&self, device: &mut D, kind: VolumeKind) -> Result<Vec<(u64, bool)>> {
        // System encryption has one header in the boot track and no hidden
        // or backup copies we can reach.
        if self.options.system_encryption {
            return Ok(match kind {
                VolumeKind::Normal => vec![(SYSTEM_HEADER_OFFSET, false)],
                VolumeKind::Hidden => Vec::new(),
            });
        }

        let primary = match kind {
            VolumeKind::Normal => HEADER_OFFSET,
            VolumeKind::Hidden => HIDDEN_HEADER_OFFSET,
        };
        let mut locations = vec![(primary, false)];

        // Backups live in the last header group of the host.
        if self.options.backup_headers {
            let size = device_size(device)?;
            if size >= 2 * HEADER_GROUP_SIZE {
                let backup = size - HEADER_GROUP_SIZE + primary;
                locations.push((backup, true));
            }
        }
        Ok(locations)
    }

    fn search_kind<D: Read + Seek>(
        &self,
        device: &mut D,
        pool: &KeyfilePool,
        kind: VolumeKind,
        skip_short_device: bool,
    ) -> Result<Option<OpenedVolume>> {
        for (offset, from_backup) in self.header_locations(device, kind)? {
            let mut sector = match read_sector(device, offset) {
                Ok(sector) => sector,
                Err(Error::DeviceRead { ref source, .. })
                    if skip_short_device && source.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    log::debug!("device too small for a {} header at {}", kind, offset);
                    continue;
                }
                Err(e) => return Err(e),
            };

            log::debug!("searching {} header at offset {}", kind, offset);
            let outcome = search_header(&sector, pool, &self.space, self.cancel);
            // Wipe the raw sector before looking at the outcome.
            sector.zeroize();

            match outcome? {
                SearchOutcome::Found(found) => {
                    if found.header.weak_xts_keys(found.chain) {
                        return Err(Error::VulnerableMasterKey);
                    }
                    log::info!(
                        "opened {} volume header at offset {} ({}, {})",
                        kind,
                        offset,
                        found.prf.name,
                        found.chain.name
                    );
                    if from_backup {
                        log::warn!("primary {} header unusable, using backup", kind);
                    }
                    return Ok(Some(OpenedVolume::from_found(*found, offset, kind, from_backup)));
                }
                SearchOutcome::Exhausted => {
                    log::debug!("no {} header at offset {}", kind, offset);
                }
            }
        }
        Ok(None)
    }
}

/// Reads one header sector at `offset`.
pub fn read_sector<D: Read + Seek>(device: &mut D, offset: u64) -> Result<[u8; HEADER_SIZE]> {
    let mut sector = [0u8; HEADER_SIZE];
    device
        .seek(SeekFrom::Start(offset))
        .and_then(|_| device.read_exact(&mut sector))
        .map_err(|source| Error::DeviceRead {
            offset,
            len: HEADER_SIZE,
            source,
        })?;
    Ok(sector)
}

pub(crate) fn device_size<D: Seek>(device: &mut D) -> Result<u64> {
    device
        .seek(SeekFrom::End(0))
        .map_err(|source| Error::DeviceRead {
            offset: 0,
            len: 0,
            source,
        })
}

//! TrueCrypt and VeraCrypt volume headers.
//!
//! Opening a volume is a search: the passphrase and keyfiles are folded
//! into a pool, every PRF of the volume's family turns pool and salt into a
//! header key, and every cipher chain tries to decrypt the header with it.
//! The first combination that yields a valid header wins.
//!
//! ```no_run
//! use std::fs::File;
//! use tcvol::{HiddenRequest, KeyfilePool, MappingPlanner, OpenOptions, VolumeOpener};
//!
//! # fn main() -> tcvol::Result<()> {
//! let options = OpenOptions::default();
//! let pool = KeyfilePool::new(b"correct horse")?;
//! let mut device = File::open("/dev/sdb1").map_err(|source| tcvol::Error::DeviceRead {
//!     offset: 0,
//!     len: 0,
//!     source,
//! })?;
//!
//! let opened = VolumeOpener::new(&options)?.open(&mut device, &pool, HiddenRequest::None)?;
//! println!("{}", opened.outer.info());
//!
//! let plan = MappingPlanner::new("tc", "/dev/sdb1".as_ref()).plan(&opened.outer, None, false)?;
//! for table in plan.entries[0].dm_tables()? {
//!     // hand table.table to device-mapper
//!     let _ = table.name;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod create;
pub mod crypto;
pub mod error;
pub mod header;
pub mod kdf;
pub mod keyfile;
pub mod mapping;
pub mod volume;

pub use config::OpenOptions;
pub use create::{plan_layout, CreatedVolume, HiddenVolume, VolumeCreator};
pub use crypto::{find_chain, CascadeCipher, Cipher, CipherChain, CIPHER_CHAINS};
pub use error::{Error, Result};
pub use header::{HeaderError, HeaderGeometry, VolumeHeader};
pub use kdf::{derive, find_prf, Family, KdfParams, KeyMaterial, Prf};
pub use keyfile::KeyfilePool;
pub use mapping::{MappingEntry, MappingPlan, MappingPlanner, SystemPartition};
pub use volume::{
    search_header, seal_header, HiddenRequest, OpenedVolume, OpenedVolumes, SearchOutcome,
    SearchSpace, VolumeInfo, VolumeKind, VolumeOpener,
};

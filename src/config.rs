use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::{find_chain, CipherChain};
use crate::error::{Error, Result};
use crate::kdf::{find_prf, Family, KdfParams, Prf};

/// Passphrase attempts a caller should allow before giving up.
pub const DEFAULT_RETRIES: u32 = 3;

/// Options for opening a volume.
///
/// Everything has a default, so `OpenOptions::default()` opens a plain
/// TrueCrypt container by searching the whole catalog. The same fields can
/// be loaded from TOML:
///
/// ```toml
/// family = "veracrypt"
/// prf = "SHA-512"
/// cipher = "AES-Twofish"
/// pim = 485
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenOptions {
    pub family: Family,

    /// Restricts the search to one PRF, by name.
    pub prf: Option<String>,

    /// Restricts the search to one cipher chain, by name.
    pub cipher: Option<String>,

    /// The header lives in the boot track of a system drive.
    pub system_encryption: bool,

    /// VeraCrypt PIM, 0 for the default iteration counts.
    pub pim: u32,

    /// Exact PBKDF2 iteration count for every PRF. Overrides `pim`.
    pub iterations: Option<u32>,

    /// Fall back to the backup headers at the end of the host.
    pub backup_headers: bool,

    /// Derive all header keys on worker threads before trying ciphers.
    pub parallel_kdf: bool,

    /// Passphrase attempts the caller allows. The core never loops.
    pub retries: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            family: Family::TrueCrypt,
            prf: None,
            cipher: None,
            system_encryption: false,
            pim: 0,
            iterations: None,
            backup_headers: false,
            parallel_kdf: false,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl OpenOptions {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn with_prf(mut self, name: &str) -> Self {
        self.prf = Some(name.to_string());
        self
    }

    pub fn with_cipher(mut self, name: &str) -> Self {
        self.cipher = Some(name.to_string());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Checks names and combinations without doing any key derivation.
    pub fn validate(&self) -> Result<()> {
        self.pinned_prf()?;
        self.pinned_chain()?;
        if self.pim > 0 && self.family != Family::VeraCrypt {
            return Err(Error::Config("PIM requires a VeraCrypt volume".into()));
        }
        if self.iterations == Some(0) {
            return Err(Error::Config("iteration count must be positive".into()));
        }
        if let (true, Some(prf)) = (self.system_encryption, self.pinned_prf()?) {
            if prf.system_iterations.is_none() {
                return Err(Error::Config(format!(
                    "{} {} cannot be used for system encryption",
                    self.family, prf.name
                )));
            }
        }
        Ok(())
    }

    pub fn pinned_prf(&self) -> Result<Option<&'static Prf>> {
        self.prf
            .as_deref()
            .map(|name| find_prf(self.family, name))
            .transpose()
    }

    pub fn pinned_chain(&self) -> Result<Option<&'static CipherChain>> {
        self.cipher
            .as_deref()
            .map(|name| find_chain(self.family, name))
            .transpose()
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            system_encryption: self.system_encryption,
            pim: self.pim,
            iterations: self.iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = OpenOptions::default();
        assert_eq!(options.family, Family::TrueCrypt);
        assert_eq!(options.retries, 3);
        assert!(options.validate().is_ok());
        assert_eq!(OpenOptions::from_toml_str("").unwrap(), options);
    }

    #[test]
    fn test_from_toml() {
        let options = OpenOptions::from_toml_str(
            r#"
            family = "veracrypt"
            prf = "sha-256"
            cipher = "Kuznyechik-AES"
            pim = 12
            backup_headers = true
            "#,
        )
        .unwrap();
        assert_eq!(options.family, Family::VeraCrypt);
        assert_eq!(options.pinned_prf().unwrap().unwrap().name, "SHA-256");
        assert_eq!(
            options.pinned_chain().unwrap().unwrap().name,
            "Kuznyechik-AES"
        );
        assert_eq!(options.kdf_params().pim, 12);
        assert!(options.backup_headers);
    }

    #[test]
    fn test_unknown_names_rejected() {
        assert!(matches!(
            OpenOptions::from_toml_str(r#"cipher = "Camellia""#),
            Err(Error::UnsupportedChain(_))
        ));
        assert!(matches!(
            OpenOptions::from_toml_str(r#"prf = "md5""#),
            Err(Error::UnsupportedPrf(_))
        ));
        assert!(matches!(
            OpenOptions::from_toml_str("colour = 1"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(matches!(
            OpenOptions::from_toml_str("pim = 3"),
            Err(Error::Config(_))
        ));
        let system_sha = OpenOptions {
            system_encryption: true,
            ..OpenOptions::default()
        }
        .with_prf("SHA-512");
        assert!(matches!(system_sha.validate(), Err(Error::Config(_))));
    }
}

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::enroll::efivarfs::DEFAULT_EFIVARS_DIR;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sb-install/config.toml";
const DEFAULT_ESP: &str = "/boot";
const DEFAULT_STORE_DIR: &str = "/nix/store";
const DEFAULT_PROFILES_DIR: &str = "/nix/var/nix/profiles";

/// Resolved installer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where this configuration was read from, if anywhere. Used in error messages.
    pub source: Option<PathBuf>,
    pub enable: bool,
    pub enroll_keys: bool,
    pub pki_bundle: Option<PathBuf>,
    pub configuration_limit: Option<NonZeroUsize>,
    pub esp: PathBuf,
    pub stub: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub efivars_dir: PathBuf,
    pub bootloader: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            enable: true,
            enroll_keys: true,
            pki_bundle: None,
            configuration_limit: None,
            esp: PathBuf::from(DEFAULT_ESP),
            stub: None,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            profiles_dir: PathBuf::from(DEFAULT_PROFILES_DIR),
            efivars_dir: PathBuf::from(DEFAULT_EFIVARS_DIR),
            bootloader: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    enable: Option<bool>,
    enroll_keys: Option<bool>,
    pki_bundle: Option<PathBuf>,
    configuration_limit: Option<usize>,
    esp: Option<PathBuf>,
    stub: Option<PathBuf>,
    store_dir: Option<PathBuf>,
    profiles_dir: Option<PathBuf>,
    efivars_dir: Option<PathBuf>,
    bootloader: Option<PathBuf>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub esp: Option<PathBuf>,
    pub stub: Option<PathBuf>,
    pub pki_bundle: Option<PathBuf>,
    pub configuration_limit: Option<NonZeroUsize>,
    pub enroll_keys: Option<bool>,
    pub efivars_dir: Option<PathBuf>,
}

impl Config {
    /// Load `path`, or the default location when `path` is `None`.
    ///
    /// An explicitly named file must exist. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let raw: ConfigToml =
            toml::from_str(text).with_context(|| format!("parsing config '{}'", path.display()))?;

        let configuration_limit = match raw.configuration_limit {
            None => None,
            Some(n) => Some(NonZeroUsize::new(n).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid config '{}': configuration_limit must be at least 1",
                    path.display()
                )
            })?),
        };

        let defaults = Self::default();
        Ok(Self {
            source: Some(path.to_path_buf()),
            enable: raw.enable.unwrap_or(defaults.enable),
            enroll_keys: raw.enroll_keys.unwrap_or(defaults.enroll_keys),
            pki_bundle: raw.pki_bundle,
            configuration_limit,
            esp: raw.esp.unwrap_or(defaults.esp),
            stub: raw.stub,
            store_dir: raw.store_dir.unwrap_or(defaults.store_dir),
            profiles_dir: raw.profiles_dir.unwrap_or(defaults.profiles_dir),
            efivars_dir: raw.efivars_dir.unwrap_or(defaults.efivars_dir),
            bootloader: raw.bootloader,
        })
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(esp) = overrides.esp {
            self.esp = esp;
        }
        if let Some(stub) = overrides.stub {
            self.stub = Some(stub);
        }
        if let Some(pki_bundle) = overrides.pki_bundle {
            self.pki_bundle = Some(pki_bundle);
        }
        if let Some(limit) = overrides.configuration_limit {
            self.configuration_limit = Some(limit);
        }
        if let Some(enroll_keys) = overrides.enroll_keys {
            self.enroll_keys = enroll_keys;
        }
        if let Some(efivars_dir) = overrides.efivars_dir {
            self.efivars_dir = efivars_dir;
        }
        self
    }

    pub fn require_stub(&self) -> Result<&Path> {
        self.required(self.stub.as_deref(), "stub")
    }

    pub fn require_pki_bundle(&self) -> Result<&Path> {
        self.required(self.pki_bundle.as_deref(), "pki_bundle")
    }

    fn required<'a>(&self, value: Option<&'a Path>, field: &str) -> Result<&'a Path> {
        match value {
            Some(value) => Ok(value),
            None => match &self.source {
                Some(source) => bail!(
                    "invalid config '{}': {field} is required (set it there or pass --{})",
                    source.display(),
                    field.replace('_', "-")
                ),
                None => bail!("{field} is not configured (pass --{})", field.replace('_', "-")),
            },
        }
    }
}

//! EFI System Partition layout.
//!
//! ```text
//! <esp>/EFI/nixos/<store-path>.efi                             staged kernels and initrds
//! <esp>/EFI/Linux/nixos-generation-<id>[-specialisation-<n>].efi   signed boot entries
//! <esp>/EFI/systemd/systemd-bootx64.efi                        signed boot manager
//! <esp>/EFI/BOOT/BOOTX64.EFI                                   removable-media fallback
//! ```

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use crate::error::InstallError;

pub const ENTRY_PREFIX: &str = "nixos-generation-";
const SPECIALISATION_INFIX: &str = "-specialisation-";
const EFI_EXTENSION: &str = "efi";

/// Prefix of in-flight files; never matched by the boot manager's `*.efi` scan.
pub const TMP_PREFIX: &str = ".sb-install-tmp-";

#[derive(Debug, Clone)]
pub struct EspPaths {
    pub esp: PathBuf,
    pub efi: PathBuf,
    pub nixos: PathBuf,
    pub linux: PathBuf,
    pub systemd: PathBuf,
    pub systemd_boot: PathBuf,
    pub efi_fallback_dir: PathBuf,
    pub efi_fallback: PathBuf,
}

impl EspPaths {
    pub fn new(esp: impl AsRef<Path>) -> Self {
        let esp = esp.as_ref();
        let efi = esp.join("EFI");
        let systemd = efi.join("systemd");
        let efi_fallback_dir = efi.join("BOOT");
        Self {
            esp: esp.to_path_buf(),
            nixos: efi.join("nixos"),
            linux: efi.join("Linux"),
            systemd_boot: systemd.join("systemd-bootx64.efi"),
            systemd,
            efi_fallback: efi_fallback_dir.join("BOOTX64.EFI"),
            efi_fallback_dir,
            efi,
        }
    }

    /// Path of the boot entry for a generation or one of its specialisations.
    pub fn entry_path(&self, generation: u64, specialisation: Option<&str>) -> PathBuf {
        self.linux.join(entry_file_name(generation, specialisation))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.nixos.join(".sb-install.lock")
    }

    /// Boot entries in `EFI/Linux` written by this installer, ordered by generation.
    pub fn boot_entries(&self) -> Result<Vec<EntryFile>> {
        if !self.linux.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.linux).min_depth(1).max_depth(1) {
            let entry =
                entry.with_context(|| format!("scanning '{}'", self.linux.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some((generation, specialisation)) = entry
                .file_name()
                .to_str()
                .and_then(parse_entry_file_name)
            else {
                continue;
            };
            out.push(EntryFile {
                path: entry.into_path(),
                generation,
                specialisation,
            });
        }
        out.sort_by(|a, b| {
            (a.generation, &a.specialisation).cmp(&(b.generation, &b.specialisation))
        });
        Ok(out)
    }

    /// Convert an absolute path on the ESP to the `\EFI\...` form the firmware uses.
    pub fn to_uefi_path(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.esp).map_err(|_| {
            InstallError::Build(format!(
                "'{}' is not on the ESP '{}'",
                path.display(),
                self.esp.display()
            ))
        })?;
        let mut out = String::new();
        for component in relative.components() {
            let Component::Normal(part) = component else {
                bail!(InstallError::Build(format!(
                    "'{}' is not a plain ESP path",
                    path.display()
                )));
            };
            out.push('\\');
            out.push_str(&part.to_string_lossy());
        }
        Ok(out)
    }

    /// Inverse of [`EspPaths::to_uefi_path`].
    pub fn from_uefi_path(&self, uefi_path: &str) -> PathBuf {
        uefi_path
            .split('\\')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.esp.clone(), |acc, part| acc.join(part))
    }
}

/// A boot entry found on the ESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFile {
    pub path: PathBuf,
    pub generation: u64,
    pub specialisation: Option<String>,
}

pub fn entry_file_name(generation: u64, specialisation: Option<&str>) -> String {
    match specialisation {
        Some(name) => {
            format!("{ENTRY_PREFIX}{generation}{SPECIALISATION_INFIX}{name}.{EFI_EXTENSION}")
        }
        None => format!("{ENTRY_PREFIX}{generation}.{EFI_EXTENSION}"),
    }
}

/// Recover `(generation, specialisation)` from an entry file name.
pub fn parse_entry_file_name(name: &str) -> Option<(u64, Option<String>)> {
    let stem = name
        .strip_prefix(ENTRY_PREFIX)?
        .strip_suffix(&format!(".{EFI_EXTENSION}"))?;
    match stem.split_once(SPECIALISATION_INFIX) {
        Some((id, specialisation)) if !specialisation.is_empty() => {
            Some((id.parse().ok()?, Some(specialisation.to_string())))
        }
        Some(_) => None,
        None => Some((stem.parse().ok()?, None)),
    }
}

/// Content-addressed file name for a store path.
///
/// Every component below the store directory is kept and joined with `-`, so
/// `<store>/abc-x/lib/initrd` maps to `abc-x-lib-initrd.efi` and a direct
/// store entry maps to `<entry>.efi`.
pub fn artifact_file_name(store_dir: &Path, source: &Path) -> Result<String> {
    let relative = source.strip_prefix(store_dir).map_err(|_| {
        InstallError::io(
            source,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not inside store directory '{}'", store_dir.display()),
            ),
        )
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        bail!(InstallError::io(
            source,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path names the store itself"),
        ));
    }
    Ok(format!("{}.{EFI_EXTENSION}", parts.join("-")))
}

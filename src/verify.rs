//! The stub's boot-time integrity check, run from userspace.
//!
//! At boot the stub hashes the kernel and initrd it is about to load and
//! refuses to continue if either differs from the digest embedded when the
//! entry was signed. [`verify_entry`] performs the same comparison against the
//! files currently on the ESP.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::error::{InstallError, IoResultExt};
use crate::esp::EspPaths;
use crate::stage::{hex, sha256_file};
use crate::stub::{self, StubParameters};

pub const KERNEL_MISMATCH: &str = "Hash mismatch for kernel!";
pub const INITRD_MISMATCH: &str = "Hash mismatch for initrd!";

/// Check that the kernel and initrd referenced by `entry` still match its embedded digests.
pub fn verify_entry(esp: &EspPaths, entry: &Path) -> Result<StubParameters> {
    let image = fs::read(entry)
        .at_path(entry)
        .with_context(|| format!("reading boot entry '{}'", entry.display()))?;
    let params = stub::read_parameters(&image)
        .with_context(|| format!("parsing boot entry '{}'", entry.display()))?;

    check(esp, &params.kernel_path, &params.kernel_hash, KERNEL_MISMATCH)?;
    check(esp, &params.initrd_path, &params.initrd_hash, INITRD_MISMATCH)?;
    Ok(params)
}

/// Verify every installer entry on the ESP; one result per entry.
pub fn verify_all(esp: &EspPaths) -> Result<Vec<(PathBuf, Result<StubParameters>)>> {
    Ok(esp
        .boot_entries()?
        .into_iter()
        .map(|entry| {
            let result = verify_entry(esp, &entry.path);
            (entry.path, result)
        })
        .collect())
}

fn check(esp: &EspPaths, uefi_path: &str, expected: &[u8; 32], diagnostic: &str) -> Result<()> {
    let path = esp.from_uefi_path(uefi_path);
    let (actual, _) = sha256_file(&path)?;
    if &actual != expected {
        bail!(InstallError::IntegrityMismatch {
            diagnostic: diagnostic.to_string(),
            path,
            expected: hex(expected),
            actual: hex(&actual),
        });
    }
    Ok(())
}

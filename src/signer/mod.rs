//! Authenticode signing of boot entries and the boot manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::error::{InstallError, IoResultExt};
use crate::stage::tmp_name;

/// Produces images the firmware accepts under the enrolled `db` key.
pub trait Signer {
    /// Sign `image`. `subject` names it in errors.
    fn sign(&self, subject: &str, image: &[u8]) -> Result<Vec<u8>>;

    /// Whether `image` carries a valid signature from this signer's certificate.
    fn verify(&self, image: &[u8]) -> Result<bool>;
}

/// Signs with `sbsign` and checks with `sbverify`.
#[derive(Debug, Clone)]
pub struct SbsignSigner {
    key: PathBuf,
    cert: PathBuf,
}

impl SbsignSigner {
    pub fn new(key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
        }
    }
}

impl Signer for SbsignSigner {
    fn sign(&self, subject: &str, image: &[u8]) -> Result<Vec<u8>> {
        let scratch = Scratch::new("sign")?;
        let input = scratch.path().join("unsigned.efi");
        let output = scratch.path().join("signed.efi");
        fs::write(&input, image).at_path(&input)?;

        let result = Command::new("sbsign")
            .arg("--key")
            .arg(&self.key)
            .arg("--cert")
            .arg(&self.cert)
            .arg("--output")
            .arg(&output)
            .arg(&input)
            .output()
            .map_err(|err| signing_failure(subject, format!("could not run sbsign: {err}")))?;
        check(subject, "sbsign", &result)?;

        let signed = fs::read(&output)
            .at_path(&output)
            .with_context(|| format!("reading signed {subject}"))?;
        debug!(subject, bytes = signed.len(), "signed image");
        Ok(signed)
    }

    fn verify(&self, image: &[u8]) -> Result<bool> {
        let scratch = Scratch::new("verify")?;
        let input = scratch.path().join("image.efi");
        fs::write(&input, image).at_path(&input)?;

        let result = Command::new("sbverify")
            .arg("--cert")
            .arg(&self.cert)
            .arg(&input)
            .output()
            .map_err(|err| signing_failure("image", format!("could not run sbverify: {err}")))?;
        Ok(result.status.success())
    }
}

fn signing_failure(subject: &str, reason: String) -> InstallError {
    InstallError::Signing {
        subject: subject.to_string(),
        reason,
    }
}

fn check(subject: &str, tool: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(signing_failure(
        subject,
        format!("{tool} failed ({}): {}", output.status, stderr.trim())
    ))
}

/// Private directory for one signing round trip; removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn new(prefix: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(tmp_name(prefix));
        fs::create_dir_all(&dir).at_path(&dir)?;
        Ok(Self(dir))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

//! [`TrustStore`] over Linux efivarfs.
//!
//! Each variable is a file named `<Name>-<vendor-guid>` whose contents are a
//! little-endian `u32` attribute mask followed by the variable data. Writes must
//! hand the kernel attributes and payload in a single `write(2)`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::{SecureBootVariable, TrustStore};
use crate::error::{InstallError, IoResultExt};

pub const DEFAULT_EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";

const EFI_GLOBAL_VARIABLE: &str = "8be4df61-93ca-11d2-aa0d-00e098032b8c";
const EFI_IMAGE_SECURITY_DATABASE: &str = "d719b2cb-3d3a-4596-a3bc-dad00e67656f";

const NON_VOLATILE: u32 = 0x0000_0001;
const BOOTSERVICE_ACCESS: u32 = 0x0000_0002;
const RUNTIME_ACCESS: u32 = 0x0000_0004;
const TIME_BASED_AUTHENTICATED_WRITE_ACCESS: u32 = 0x0000_0020;

const AUTHENTICATED_WRITE: u32 =
    NON_VOLATILE | BOOTSERVICE_ACCESS | RUNTIME_ACCESS | TIME_BASED_AUTHENTICATED_WRITE_ACCESS;

// linux/fs.h; efivarfs marks most variables immutable to guard against stray writes.
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

#[derive(Debug, Clone)]
pub struct EfivarfsStore {
    dir: PathBuf,
}

impl EfivarfsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn variable_path(&self, name: &str, vendor: &str) -> PathBuf {
        self.dir.join(format!("{name}-{vendor}"))
    }

    fn key_path(&self, var: SecureBootVariable) -> PathBuf {
        let vendor = match var {
            SecureBootVariable::Pk | SecureBootVariable::Kek => EFI_GLOBAL_VARIABLE,
            SecureBootVariable::Db => EFI_IMAGE_SECURITY_DATABASE,
        };
        self.variable_path(var.name(), vendor)
    }

    /// Variable data without the attribute prefix, or `None` if the variable is unset.
    fn read_data(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(InstallError::io(path, err).into()),
        };
        if bytes.len() < 4 {
            bail!(InstallError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "efivarfs file shorter than its attribute header",
                ),
            ));
        }
        Ok(Some(bytes[4..].to_vec()))
    }
}

impl Default for EfivarfsStore {
    fn default() -> Self {
        Self::new(DEFAULT_EFIVARS_DIR)
    }
}

impl TrustStore for EfivarfsStore {
    fn setup_mode(&self) -> Result<bool> {
        let path = self.variable_path("SetupMode", EFI_GLOBAL_VARIABLE);
        let data = self
            .read_data(&path)?
            .with_context(|| format!("{} is missing; is this a UEFI system?", path.display()))?;
        Ok(data.first() == Some(&1))
    }

    fn read(&self, var: SecureBootVariable) -> Result<Option<Vec<u8>>> {
        self.read_data(&self.key_path(var))
    }

    fn write(&mut self, var: SecureBootVariable, authenticated: &[u8]) -> Result<()> {
        let path = self.key_path(var);
        if path.exists() {
            clear_immutable(&path);
        }

        let mut buf = Vec::with_capacity(4 + authenticated.len());
        buf.extend_from_slice(&AUTHENTICATED_WRITE.to_le_bytes());
        buf.extend_from_slice(authenticated);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .at_path(&path)?;
        file.write_all(&buf)
            .at_path(&path)
            .with_context(|| format!("firmware rejected the {var} update"))?;
        debug!(variable = %var, path = %path.display(), "wrote EFI variable");
        Ok(())
    }
}

/// Best effort: a failure here surfaces as a permission error on the write that follows.
fn clear_immutable(path: &Path) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot open variable to clear immutable flag");
            return;
        }
    };
    let fd = file.as_raw_fd();
    let mut flags: libc::c_int = 0;
    // SAFETY: fd is valid for the lifetime of `file`, and both ioctls take a
    // pointer to an int the kernel reads or writes.
    unsafe {
        if libc::ioctl(fd, FS_IOC_GETFLAGS as _, &mut flags as *mut libc::c_int) != 0 {
            return;
        }
        if flags & FS_IMMUTABLE_FL == 0 {
            return;
        }
        flags &= !FS_IMMUTABLE_FL;
        if libc::ioctl(fd, FS_IOC_SETFLAGS as _, &flags as *const libc::c_int) != 0 {
            warn!(
                path = %path.display(),
                err = %std::io::Error::last_os_error(),
                "failed to clear immutable flag"
            );
        }
    }
}

//! Content-addressed staging of kernels and initrds onto the ESP.
//!
//! Goals:
//! - Copy each store path to `EFI/nixos/<store-path>.efi` exactly once
//! - Hash the bytes as staged so entries can bind to them
//! - Never expose a partially written file at a name the boot manager or a
//!   stub could read: data goes to a hidden tmp file, is synced, then renamed
//!
//! Staging is idempotent. A destination that already holds the same bytes is
//! left alone. Within one run a destination is claimed by the first content
//! staged to it; staging different bytes to a claimed name fails instead of
//! replacing the artifact an earlier entry already binds to.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{InstallError, IoResultExt};
use crate::esp::{self, EspPaths};

/// A store path copied onto the ESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub sha256: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    AlreadyPresent,
    Written,
}

#[derive(Debug, Clone)]
pub struct Stager {
    esp: EspPaths,
    store_dir: PathBuf,
    claimed: RefCell<HashMap<PathBuf, [u8; 32]>>,
}

impl Stager {
    pub fn new(esp: EspPaths, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            esp,
            store_dir: store_dir.into(),
            claimed: RefCell::new(HashMap::new()),
        }
    }

    /// Start a new run: destinations staged so far may be replaced again.
    pub fn reset_claims(&self) {
        self.claimed.borrow_mut().clear();
    }

    /// Stage `source` (a store path) under its content-addressed name.
    pub fn stage(&self, source: &Path) -> Result<(StagedArtifact, StageOutcome)> {
        let resolved = resolve_link(source);
        let name = esp::artifact_file_name(&self.store_dir, &resolved)?;
        let destination = self.esp.nixos.join(name);

        let (sha256, _size) = sha256_file(&resolved)?;
        self.claim(&resolved, &destination, &sha256)?;
        let outcome = self.place(&resolved, &destination, &sha256)?;
        Ok((
            StagedArtifact {
                source: source.to_path_buf(),
                destination,
                sha256,
            },
            outcome,
        ))
    }

    /// Stage an initrd after running the generation's secrets appender on a copy of it.
    ///
    /// The appender receives the path of a private copy and appends a cpio archive
    /// with the secrets. The result is hashed as staged, and its name carries a
    /// digest suffix so secret-bearing initrds of different generations never
    /// share a file.
    pub fn stage_with_secrets(
        &self,
        initrd: &Path,
        appender: &Path,
    ) -> Result<(StagedArtifact, StageOutcome)> {
        let resolved = resolve_link(initrd);
        let base = esp::artifact_file_name(&self.store_dir, &resolved)?;

        fs::create_dir_all(&self.esp.nixos).at_path(&self.esp.nixos)?;
        let scratch = self.esp.nixos.join(tmp_name("initrd-secrets"));
        let result = (|| -> Result<(StagedArtifact, StageOutcome)> {
            fs::copy(&resolved, &scratch).at_path(&scratch).with_context(|| {
                format!("copying {} for secret injection", resolved.display())
            })?;
            run_secrets_appender(appender, &scratch)?;

            let (sha256, _size) = sha256_file(&scratch)?;
            let stem = base.strip_suffix(".efi").unwrap_or(&base);
            let destination = self
                .esp
                .nixos
                .join(format!("{stem}-{}.efi", &hex(&sha256)[..16]));
            self.claim(&resolved, &destination, &sha256)?;

            let outcome = if digest_matches(&destination, &sha256)? {
                StageOutcome::AlreadyPresent
            } else {
                sync_file(&scratch)?;
                atomic_rename(&scratch, &destination)?;
                info!(destination = %destination.display(), "staged initrd with secrets");
                StageOutcome::Written
            };
            Ok((
                StagedArtifact {
                    source: initrd.to_path_buf(),
                    destination,
                    sha256,
                },
                outcome,
            ))
        })();
        if scratch.exists() {
            let _ = fs::remove_file(&scratch);
        }
        result
    }

    /// Record that `destination` holds `sha256` for the rest of the run.
    fn claim(&self, source: &Path, destination: &Path, sha256: &[u8; 32]) -> Result<()> {
        let mut claimed = self.claimed.borrow_mut();
        match claimed.get(destination) {
            Some(existing) if existing != sha256 => bail!(InstallError::io(
                source,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "{} was already staged from different content in this run",
                        destination.display()
                    ),
                ),
            )),
            Some(_) => {}
            None => {
                claimed.insert(destination.to_path_buf(), *sha256);
            }
        }
        Ok(())
    }

    fn place(&self, source: &Path, destination: &Path, sha256: &[u8; 32]) -> Result<StageOutcome> {
        if digest_matches(destination, sha256)? {
            debug!(destination = %destination.display(), "artifact already staged");
            return Ok(StageOutcome::AlreadyPresent);
        }

        let parent = destination
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{} has no parent", destination.display()))?;
        fs::create_dir_all(parent).at_path(parent)?;

        let tmp = parent.join(tmp_name("stage"));
        let copied = fs::copy(source, &tmp)
            .at_path(&tmp)
            .with_context(|| format!("copying {} to {}", source.display(), tmp.display()))
            .and_then(|_| sync_file(&tmp));
        if let Err(err) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }

        // Re-hash what actually landed on disk before making it visible.
        let (landed, _) = sha256_file(&tmp)?;
        if &landed != sha256 {
            let _ = fs::remove_file(&tmp);
            bail!(InstallError::io(
                source,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "source changed while it was being staged",
                ),
            ));
        }

        if let Err(err) = atomic_rename(&tmp, destination) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        info!(
            source = %source.display(),
            destination = %destination.display(),
            "staged artifact"
        );
        Ok(StageOutcome::Written)
    }
}

fn run_secrets_appender(appender: &Path, target: &Path) -> Result<()> {
    let output = Command::new(appender)
        .arg(target)
        .output()
        .at_path(appender)
        .with_context(|| format!("running initrd secrets appender '{}'", appender.display()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(InstallError::io(
        appender,
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "initrd secrets appender failed ({}): {}",
                output.status,
                stderr.trim()
            ),
        ),
    ))
}

/// Nix store paths in a bootspec are often symlinks; stage what they point at.
fn resolve_link(path: &Path) -> PathBuf {
    match fs::read_link(path) {
        Ok(target) if target.is_absolute() => target,
        Ok(target) => path
            .parent()
            .map(|parent| parent.join(&target))
            .unwrap_or(target),
        Err(_) => path.to_path_buf(),
    }
}

fn digest_matches(path: &Path, expected: &[u8; 32]) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let (actual, _) = sha256_file(path)?;
    Ok(&actual == expected)
}

pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}{prefix}-{}-{n}", esp::TMP_PREFIX, std::process::id())
}

pub(crate) fn sync_file(path: &Path) -> Result<()> {
    File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.sync_all())
        .at_path(path)?;
    Ok(())
}

/// Rename within one directory; the destination is replaced atomically.
pub(crate) fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst)
        .at_path(dst)
        .with_context(|| format!("renaming {} to {}", src.display(), dst.display()))?;
    if let Some(parent) = dst.parent() {
        // Persist the rename itself; not every filesystem supports syncing directories.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Write `bytes` to `dst` through a synced tmp file in the same directory.
pub(crate) fn atomic_write(dst: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dst
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent", dst.display()))?;
    fs::create_dir_all(parent).at_path(parent)?;
    let tmp = parent.join(tmp_name("write"));
    let written = File::create(&tmp)
        .and_then(|mut f| {
            f.write_all(bytes)?;
            f.sync_all()
        })
        .at_path(&tmp);
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    atomic_rename(&tmp, dst).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        err
    })
}

pub fn sha256_file(path: &Path) -> Result<([u8; 32], u64)> {
    let f = File::open(path)
        .at_path(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf).at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize().into(), size))
}

pub fn sha256_bytes(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: PathBuf,
        stager: Stager,
        esp: EspPaths,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("store");
        fs::create_dir_all(&store).unwrap();
        let esp = EspPaths::new(tmp.path().join("boot"));
        Fixture {
            stager: Stager::new(esp.clone(), &store),
            store,
            esp,
            _tmp: tmp,
        }
    }

    #[test]
    fn stages_to_content_addressed_name() {
        let fx = fixture();
        let kernel = fx.store.join("abc-kernel");
        fs::write(&kernel, b"kernel bytes").unwrap();

        let (artifact, outcome) = fx.stager.stage(&kernel).unwrap();
        assert_eq!(outcome, StageOutcome::Written);
        assert_eq!(artifact.destination, fx.esp.nixos.join("abc-kernel.efi"));
        assert_eq!(artifact.sha256, sha256_bytes(b"kernel bytes"));
        assert_eq!(fs::read(&artifact.destination).unwrap(), b"kernel bytes");
    }

    #[test]
    fn restaging_identical_content_is_a_no_op() {
        let fx = fixture();
        let dir = fx.store.join("abc-linux");
        fs::create_dir_all(&dir).unwrap();
        let kernel = dir.join("bzImage");
        fs::write(&kernel, b"kernel bytes").unwrap();

        let (first, _) = fx.stager.stage(&kernel).unwrap();
        let before = fs::metadata(&first.destination).unwrap().modified().unwrap();

        let (second, outcome) = fx.stager.stage(&kernel).unwrap();
        assert_eq!(outcome, StageOutcome::AlreadyPresent);
        assert_eq!(first, second);
        assert_eq!(
            fs::metadata(&second.destination).unwrap().modified().unwrap(),
            before
        );
        assert_eq!(
            second.destination.file_name().unwrap(),
            "abc-linux-bzImage.efi"
        );
    }

    #[test]
    fn tampered_destination_is_replaced() {
        let fx = fixture();
        let initrd = fx.store.join("def-initrd");
        fs::write(&initrd, b"initrd").unwrap();
        let (artifact, _) = fx.stager.stage(&initrd).unwrap();

        fs::write(&artifact.destination, b"initrd plus evil").unwrap();
        let (_, outcome) = fx.stager.stage(&initrd).unwrap();
        assert_eq!(outcome, StageOutcome::Written);
        assert_eq!(fs::read(&artifact.destination).unwrap(), b"initrd");
    }

    #[test]
    fn files_in_different_subdirectories_get_distinct_names() {
        let fx = fixture();
        let a = fx.store.join("abc-x/a/initrd");
        let b = fx.store.join("abc-x/b/initrd");
        for (path, contents) in [(&a, b"initrd a"), (&b, b"initrd b")] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        let (first, _) = fx.stager.stage(&a).unwrap();
        let (second, _) = fx.stager.stage(&b).unwrap();
        assert_eq!(first.destination, fx.esp.nixos.join("abc-x-a-initrd.efi"));
        assert_eq!(second.destination, fx.esp.nixos.join("abc-x-b-initrd.efi"));
        assert_eq!(fs::read(&first.destination).unwrap(), b"initrd a");
        assert_eq!(fs::read(&second.destination).unwrap(), b"initrd b");
    }

    #[test]
    fn colliding_name_in_one_run_keeps_the_first_artifact() {
        let fx = fixture();
        // Both map to abc-x-a-b-initrd.efi.
        let a = fx.store.join("abc-x/a-b/initrd");
        let b = fx.store.join("abc-x/a/b-initrd");
        for (path, contents) in [(&a, b"initrd a"), (&b, b"initrd b")] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }

        let (first, _) = fx.stager.stage(&a).unwrap();
        let err = fx.stager.stage(&b).unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Io { .. })));
        assert_eq!(fs::read(&first.destination).unwrap(), b"initrd a");

        // Restaging the first source is still fine, and a new run may reuse the name.
        fx.stager.stage(&a).unwrap();
        fx.stager.reset_claims();
        let (replaced, outcome) = fx.stager.stage(&b).unwrap();
        assert_eq!(outcome, StageOutcome::Written);
        assert_eq!(replaced.destination, first.destination);
    }

    #[test]
    fn missing_source_is_an_io_failure() {
        let fx = fixture();
        let err = fx.stager.stage(&fx.store.join("nope-kernel")).unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Io { .. })));
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let fx = fixture();
        let kernel = fx.store.join("abc-kernel");
        fs::write(&kernel, b"k").unwrap();
        fx.stager.stage(&kernel).unwrap();

        let leftovers: Vec<_> = fs::read_dir(&fx.esp.nixos)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(esp::TMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn secrets_are_appended_before_hashing() {
        let fx = fixture();
        let initrd = fx.store.join("def-initrd");
        fs::write(&initrd, b"initrd").unwrap();
        let appender = fx.store.join("append-initrd-secrets");
        fs::write(&appender, "#!/bin/sh\nprintf 'SECRETS' >> \"$1\"\n").unwrap();
        fs::set_permissions(&appender, fs::Permissions::from_mode(0o755)).unwrap();

        let (artifact, outcome) = fx.stager.stage_with_secrets(&initrd, &appender).unwrap();
        assert_eq!(outcome, StageOutcome::Written);
        assert_eq!(fs::read(&artifact.destination).unwrap(), b"initrdSECRETS");
        assert_eq!(artifact.sha256, sha256_bytes(b"initrdSECRETS"));
        assert!(artifact
            .destination
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("def-initrd-"));

        // The plain store initrd is untouched.
        assert_eq!(fs::read(&initrd).unwrap(), b"initrd");

        let (again, outcome) = fx.stager.stage_with_secrets(&initrd, &appender).unwrap();
        assert_eq!(outcome, StageOutcome::AlreadyPresent);
        assert_eq!(again.destination, artifact.destination);
    }

    #[test]
    fn failing_appender_is_an_io_failure() {
        let fx = fixture();
        let initrd = fx.store.join("def-initrd");
        fs::write(&initrd, b"initrd").unwrap();
        let appender = fx.store.join("broken-appender");
        fs::write(&appender, "#!/bin/sh\nexit 3\n").unwrap();
        fs::set_permissions(&appender, fs::Permissions::from_mode(0o755)).unwrap();

        let err = fx
            .stager
            .stage_with_secrets(&initrd, &appender)
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Io { .. })));
    }
}

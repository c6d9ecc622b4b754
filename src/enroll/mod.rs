//! Secure Boot key enrollment.
//!
//! The trust chain is written bottom-up: `db` first, then `KEK`, then `PK`.
//! Writing `PK` takes the firmware out of setup mode, after which the other
//! variables only accept updates signed by the new keys.

pub mod efivarfs;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::error::{InstallError, IoResultExt};

pub use efivarfs::EfivarfsStore;

/// The three variables that make up the Secure Boot trust chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureBootVariable {
    Pk,
    Kek,
    Db,
}

impl SecureBootVariable {
    /// Order in which enrollment writes the variables.
    pub const ENROLL_ORDER: [SecureBootVariable; 3] = [Self::Db, Self::Kek, Self::Pk];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pk => "PK",
            Self::Kek => "KEK",
            Self::Db => "db",
        }
    }
}

impl fmt::Display for SecureBootVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access to the firmware's key variables.
pub trait TrustStore {
    /// Whether the firmware currently accepts unauthenticated key enrollment.
    fn setup_mode(&self) -> Result<bool>;

    /// Current contents of `var` as an EFI signature list, or `None` when unset.
    fn read(&self, var: SecureBootVariable) -> Result<Option<Vec<u8>>>;

    /// Write an authenticated variable payload.
    fn write(&mut self, var: SecureBootVariable, authenticated: &[u8]) -> Result<()>;
}

/// Files for one level of the trust chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFiles {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub esl: PathBuf,
    pub auth: PathBuf,
}

impl KeyFiles {
    fn under(root: &Path, var: SecureBootVariable) -> Self {
        let dir = root.join("keys").join(var.name());
        let file = |ext: &str| dir.join(format!("{}.{ext}", var.name()));
        Self {
            key: file("key"),
            cert: file("pem"),
            esl: file("esl"),
            auth: file("auth"),
        }
    }
}

/// A PKI bundle as laid out on disk:
///
/// ```text
/// <bundle>/keys/PK/PK.{key,pem,esl,auth}
/// <bundle>/keys/KEK/KEK.{key,pem,esl,auth}
/// <bundle>/keys/db/db.{key,pem,esl,auth}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    pub root: PathBuf,
    pub pk: KeyFiles,
    pub kek: KeyFiles,
    pub db: KeyFiles,
}

impl TrustBundle {
    /// Open the bundle at `root`. The `db` signing key and certificate must exist.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            bail!(InstallError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "PKI bundle directory not found"),
            ));
        }
        let bundle = Self {
            root: root.to_path_buf(),
            pk: KeyFiles::under(root, SecureBootVariable::Pk),
            kek: KeyFiles::under(root, SecureBootVariable::Kek),
            db: KeyFiles::under(root, SecureBootVariable::Db),
        };
        for required in [&bundle.db.key, &bundle.db.cert] {
            fs::metadata(required)
                .at_path(required)
                .with_context(|| format!("opening PKI bundle '{}'", root.display()))?;
        }
        Ok(bundle)
    }

    pub fn files(&self, var: SecureBootVariable) -> &KeyFiles {
        match var {
            SecureBootVariable::Pk => &self.pk,
            SecureBootVariable::Kek => &self.kek,
            SecureBootVariable::Db => &self.db,
        }
    }

    /// Key and certificate entries are signed with.
    pub fn signing_key(&self) -> (&Path, &Path) {
        (&self.db.key, &self.db.cert)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// Enrollment is disabled in configuration.
    Skipped,
    AlreadyEnrolled,
    Enrolled,
}

/// Enroll `bundle` into `store`, if enabled and needed.
pub fn enroll(
    store: &mut dyn TrustStore,
    bundle: &TrustBundle,
    enroll_keys: bool,
) -> Result<EnrollOutcome> {
    if !enroll_keys {
        debug!("key enrollment disabled");
        return Ok(EnrollOutcome::Skipped);
    }

    if is_enrolled(store, bundle)? {
        info!(bundle = %bundle.root.display(), "keys already enrolled");
        return Ok(EnrollOutcome::AlreadyEnrolled);
    }

    if !store.setup_mode().context("reading SetupMode")? {
        bail!(InstallError::EnrollmentRefused(
            "firmware is not in setup mode; clear the platform key in firmware setup first"
                .to_string()
        ));
    }

    // Read every payload before the first write so a missing file cannot
    // leave the chain partially enrolled.
    let mut payloads = Vec::with_capacity(SecureBootVariable::ENROLL_ORDER.len());
    for var in SecureBootVariable::ENROLL_ORDER {
        let auth = &bundle.files(var).auth;
        let payload = fs::read(auth)
            .at_path(auth)
            .with_context(|| format!("reading authenticated {var} payload"))?;
        payloads.push((var, payload));
    }

    for (var, payload) in payloads {
        store
            .write(var, &payload)
            .with_context(|| format!("enrolling {var}"))?;
        info!(variable = %var, "enrolled key");
    }
    Ok(EnrollOutcome::Enrolled)
}

fn is_enrolled(store: &dyn TrustStore, bundle: &TrustBundle) -> Result<bool> {
    for var in SecureBootVariable::ENROLL_ORDER {
        let Some(current) = store.read(var).with_context(|| format!("reading {var}"))? else {
            return Ok(false);
        };
        let esl = &bundle.files(var).esl;
        let expected = match fs::read(esl) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(InstallError::io(esl, err).into()),
        };
        if current != expected {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use crate::test_support::{write_pki_bundle, MemoryTrustStore};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn disabled_enrollment_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let bundle = TrustBundle::open(write_pki_bundle(tmp.path())).unwrap();
        let mut store = MemoryTrustStore::in_setup_mode();

        let outcome = enroll(&mut store, &bundle, false).unwrap();
        assert_eq!(outcome, EnrollOutcome::Skipped);
        assert!(store.writes.is_empty());
        assert_eq!(store.reads.get(), 0);
    }

    #[test]
    fn enrolls_db_then_kek_then_pk() {
        let tmp = TempDir::new().unwrap();
        let bundle = TrustBundle::open(write_pki_bundle(tmp.path())).unwrap();
        let mut store = MemoryTrustStore::in_setup_mode();

        let outcome = enroll(&mut store, &bundle, true).unwrap();
        assert_eq!(outcome, EnrollOutcome::Enrolled);
        let order: Vec<_> = store.writes.iter().map(|(var, _)| *var).collect();
        assert_eq!(
            order,
            vec![
                SecureBootVariable::Db,
                SecureBootVariable::Kek,
                SecureBootVariable::Pk
            ]
        );
        assert!(!store.setup_mode);
    }

    #[test]
    fn second_enrollment_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let bundle = TrustBundle::open(write_pki_bundle(tmp.path())).unwrap();
        let mut store = MemoryTrustStore::in_setup_mode();
        enroll(&mut store, &bundle, true).unwrap();
        let writes = store.writes.len();

        let outcome = enroll(&mut store, &bundle, true).unwrap();
        assert_eq!(outcome, EnrollOutcome::AlreadyEnrolled);
        assert_eq!(store.writes.len(), writes);
    }

    #[test]
    fn user_mode_refuses_enrollment() {
        let tmp = TempDir::new().unwrap();
        let bundle = TrustBundle::open(write_pki_bundle(tmp.path())).unwrap();
        let mut store = MemoryTrustStore::in_user_mode();

        let err = enroll(&mut store, &bundle, true).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::EnrollmentRefused(_))
        ));
        assert!(store.writes.is_empty());
    }

    #[test]
    fn bundle_without_signing_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = TrustBundle::open(tmp.path()).unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Io { .. })));
    }

    #[test]
    fn bundle_paths_follow_layout() {
        let tmp = TempDir::new().unwrap();
        let root = write_pki_bundle(tmp.path());
        let bundle = TrustBundle::open(&root).unwrap();
        assert_eq!(bundle.kek.esl, root.join("keys/KEK/KEK.esl"));
        assert_eq!(bundle.signing_key().1, root.join("keys/db/db.pem"));
    }
}

//! Bootspec reader.
//!
//! A generation describes how to boot it in `boot.json`:
//!
//! ```json
//! {
//!   "v1": {
//!     "label": "NixOS 23.05 (Linux 6.1.30)",
//!     "kernel": "/nix/store/...-linux-6.1.30/bzImage",
//!     "initrd": "/nix/store/...-initrd-linux-6.1.30/initrd",
//!     "init": "/nix/store/...-nixos-system/init",
//!     "kernelParams": ["loglevel=4"],
//!     "toplevel": "/nix/store/...-nixos-system",
//!     "specialisation": { "debug": { "kernel": "...", ... } }
//!   }
//! }
//! ```
//!
//! The version key is the single point where forward compatibility is
//! enforced: a document without `v1` is rejected, never guessed at.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::error::{InstallError, IoResultExt};

/// File name of the bootspec document inside a generation's toplevel.
pub const BOOTSPEC_FILENAME: &str = "boot.json";

const SCHEMA_V1_KEY: &str = "v1";
const DEFAULT_LABEL: &str = "NixOS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
}

/// Parsed, validated description of one bootable configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSpec {
    pub schema: SchemaVersion,
    pub label: String,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub initrd_secrets: Option<PathBuf>,
    pub init: PathBuf,
    pub kernel_params: Vec<String>,
    pub toplevel: Option<PathBuf>,
    pub system: Option<String>,
    pub specialisations: BTreeMap<String, BootSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootSpecV1Json {
    #[serde(default)]
    label: Option<String>,
    kernel: PathBuf,
    #[serde(default)]
    initrd: Option<PathBuf>,
    #[serde(default)]
    initrd_secrets: Option<PathBuf>,
    init: PathBuf,
    #[serde(default)]
    kernel_params: Vec<String>,
    #[serde(default)]
    toplevel: Option<PathBuf>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    specialisation: BTreeMap<String, BootSpecV1Json>,
}

/// Read and parse the bootspec document at `path`.
pub fn read(path: &Path) -> Result<BootSpec> {
    let bytes = fs::read(path)
        .at_path(path)
        .with_context(|| format!("reading bootspec '{}'", path.display()))?;
    parse(&bytes, path)
}

/// Parse a bootspec document. `origin` is only used in error messages.
pub fn parse(bytes: &[u8], origin: &Path) -> Result<BootSpec> {
    let malformed = |reason: String| InstallError::MalformedSpec {
        path: origin.to_path_buf(),
        reason,
    };

    let document: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|err| malformed(err.to_string()))?;
    let serde_json::Value::Object(mut top) = document else {
        return Err(malformed("document is not a JSON object".to_string()).into());
    };

    let Some(v1) = top.remove(SCHEMA_V1_KEY) else {
        let found = top
            .keys()
            .find(|key| is_version_key(key))
            .map(|key| format!("version '{key}'"))
            .unwrap_or_else(|| "no version field".to_string());
        return Err(InstallError::UnsupportedSchema {
            path: origin.to_path_buf(),
            found,
        }
        .into());
    };

    let raw: BootSpecV1Json =
        serde_json::from_value(v1).map_err(|err| malformed(err.to_string()))?;
    convert(raw, origin)
}

fn convert(raw: BootSpecV1Json, origin: &Path) -> Result<BootSpec> {
    let mut specialisations = BTreeMap::new();
    for (name, mut nested) in raw.specialisation {
        validate_specialisation_name(&name).map_err(|reason| InstallError::MalformedSpec {
            path: origin.to_path_buf(),
            reason,
        })?;
        // Only one level gets boot entries.
        if !nested.specialisation.is_empty() {
            warn!(
                path = %origin.display(),
                specialisation = %name,
                ignored = nested.specialisation.len(),
                "ignoring specialisations nested inside a specialisation"
            );
            nested.specialisation.clear();
        }
        specialisations.insert(name, convert(nested, origin)?);
    }

    Ok(BootSpec {
        schema: SchemaVersion::V1,
        label: raw.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
        kernel: raw.kernel,
        initrd: raw.initrd,
        initrd_secrets: raw.initrd_secrets,
        init: raw.init,
        kernel_params: raw.kernel_params,
        toplevel: raw.toplevel,
        system: raw.system,
        specialisations,
    })
}

fn is_version_key(key: &str) -> bool {
    key.len() > 1 && key.starts_with('v') && key[1..].chars().all(|c| c.is_ascii_digit())
}

fn validate_specialisation_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("specialisation name must not be empty".to_string());
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(format!(
            "specialisation name '{name}' is not a safe file name segment"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use pretty_assertions::assert_eq;

    fn origin() -> &'static Path {
        Path::new("/nix/var/nix/profiles/system-1-link/boot.json")
    }

    #[test]
    fn parses_v1_with_specialisations() {
        let doc = br#"{
            "v1": {
                "label": "NixOS 23.05",
                "kernel": "/nix/store/abc-linux/bzImage",
                "initrd": "/nix/store/def-initrd/initrd",
                "init": "/nix/store/ghi-system/init",
                "kernelParams": ["loglevel=4", "quiet"],
                "toplevel": "/nix/store/ghi-system",
                "extensions": { "whatever": 1 },
                "specialisation": {
                    "debug": {
                        "kernel": "/nix/store/abc-linux/bzImage",
                        "initrd": "/nix/store/jkl-initrd/initrd",
                        "init": "/nix/store/mno-system/init",
                        "kernelParams": ["debug"]
                    }
                }
            }
        }"#;

        let spec = parse(doc, origin()).unwrap();
        assert_eq!(spec.schema, SchemaVersion::V1);
        assert_eq!(spec.label, "NixOS 23.05");
        assert_eq!(spec.kernel_params, vec!["loglevel=4", "quiet"]);
        assert_eq!(spec.specialisations.len(), 1);

        let debug = &spec.specialisations["debug"];
        assert_eq!(debug.label, DEFAULT_LABEL);
        assert_eq!(debug.initrd, Some(PathBuf::from("/nix/store/jkl-initrd/initrd")));
        assert!(debug.specialisations.is_empty());
    }

    #[test]
    fn unknown_version_fails_closed() {
        let doc = br#"{ "v2": { "kernel": "/k", "init": "/i" } }"#;
        let err = parse(doc, origin()).unwrap_err();
        match kind_of(&err) {
            Some(InstallError::UnsupportedSchema { found, .. }) => {
                assert_eq!(found, "version 'v2'")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn absent_version_fails_closed() {
        let doc = br#"{ "kernel": "/k", "init": "/i" }"#;
        let err = parse(doc, origin()).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::UnsupportedSchema { .. })
        ));
    }

    #[test]
    fn missing_kernel_is_malformed() {
        let doc = br#"{ "v1": { "init": "/i", "kernelParams": [] } }"#;
        let err = parse(doc, origin()).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::MalformedSpec { .. })
        ));
    }

    #[test]
    fn non_object_is_malformed() {
        let err = parse(b"[1, 2]", origin()).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::MalformedSpec { .. })
        ));
        let err = parse(b"{ not json", origin()).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::MalformedSpec { .. })
        ));
    }

    #[test]
    fn rejects_path_like_specialisation_names() {
        let doc = br#"{ "v1": { "kernel": "/k", "init": "/i",
            "specialisation": { "../evil": { "kernel": "/k", "init": "/i" } } } }"#;
        let err = parse(doc, origin()).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(InstallError::MalformedSpec { .. })
        ));
    }

    #[test]
    fn nested_specialisations_are_ignored() {
        let doc = br#"{ "v1": { "kernel": "/k", "init": "/i",
            "specialisation": { "outer": { "kernel": "/k", "init": "/i2",
                "specialisation": { "inner": { "kernel": "/k", "init": "/i3" } } } } } }"#;
        let spec = parse(doc, origin()).unwrap();
        let outer = &spec.specialisations["outer"];
        assert_eq!(outer.init, PathBuf::from("/i2"));
        assert!(outer.specialisations.is_empty());
    }

    #[test]
    fn read_reports_missing_file_as_io() {
        let err = read(Path::new("/definitely/missing/boot.json")).unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Io { .. })));
    }
}

//! Unified boot stub assembly.
//!
//! The firmware only checks the signature of the stub. The stub in turn binds,
//! by SHA-256, to the exact kernel and initrd it loads from the ESP, so an
//! initrd swapped after signing is caught before control reaches the kernel.
//! Everything the stub needs at boot is embedded as PE sections:
//!
//! | section    | contents                                    |
//! |------------|---------------------------------------------|
//! | `.osrel`   | os-release text shown by the boot manager   |
//! | `.cmdline` | `init=<init> <kernelParams...>`             |
//! | `.kernelp` | `\EFI\nixos\...` path of the staged kernel  |
//! | `.initrdp` | `\EFI\nixos\...` path of the staged initrd  |
//! | `.kernelh` | raw SHA-256 of the staged kernel            |
//! | `.initrdh` | raw SHA-256 of the staged initrd            |

pub mod pe;

use anyhow::{bail, Context, Result};

use crate::error::InstallError;
use crate::esp::EspPaths;
use crate::generation::Generation;
use crate::stage::{hex, StagedArtifact};

use pe::PeImage;

pub const OSREL_SECTION: &str = ".osrel";
pub const CMDLINE_SECTION: &str = ".cmdline";
pub const KERNEL_PATH_SECTION: &str = ".kernelp";
pub const INITRD_PATH_SECTION: &str = ".initrdp";
pub const KERNEL_HASH_SECTION: &str = ".kernelh";
pub const INITRD_HASH_SECTION: &str = ".initrdh";

/// Everything a boot entry embeds. Two entries with equal parameters boot identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubParameters {
    pub os_release: String,
    pub cmdline: String,
    pub kernel_path: String,
    pub initrd_path: String,
    pub kernel_hash: [u8; 32],
    pub initrd_hash: [u8; 32],
}

impl StubParameters {
    pub fn new(
        esp: &EspPaths,
        generation: &Generation,
        kernel: &StagedArtifact,
        initrd: Option<&StagedArtifact>,
    ) -> Result<Self> {
        let Some(initrd) = initrd else {
            bail!(InstallError::Build(format!(
                "generation {generation} has no initrd; entries without one are not supported"
            )));
        };
        Ok(Self {
            os_release: os_release(generation),
            cmdline: kernel_cmdline(generation),
            kernel_path: esp.to_uefi_path(&kernel.destination)?,
            initrd_path: esp.to_uefi_path(&initrd.destination)?,
            kernel_hash: kernel.sha256,
            initrd_hash: initrd.sha256,
        })
    }
}

/// The command line handed to the kernel: the generation's init, then its parameters.
pub fn kernel_cmdline(generation: &Generation) -> String {
    let mut parts = vec![format!("init={}", generation.spec.init.display())];
    parts.extend(generation.spec.kernel_params.iter().cloned());
    parts.join(" ")
}

pub fn os_release(generation: &Generation) -> String {
    let version = match &generation.specialisation {
        Some(name) => format!("Generation {}, Specialisation {name}", generation.id),
        None => format!("Generation {}", generation.id),
    };
    format!(
        "ID=nixos\nPRETTY_NAME=\"{}\"\nVERSION_ID=\"{}\"\n",
        escape_os_release(&generation.spec.label),
        version
    )
}

fn escape_os_release(value: &str) -> String {
    value
        .chars()
        .flat_map(|c| match c {
            '"' | '\\' | '`' | '$' => vec!['\\', c],
            '\n' => vec![' '],
            c => vec![c],
        })
        .collect()
}

/// Assemble an unsigned boot entry image from the base stub and `params`.
pub fn build(base_stub: &[u8], params: &StubParameters) -> Result<Vec<u8>> {
    let mut image = PeImage::parse(base_stub.to_vec()).context("parsing base stub")?;
    if image.is_signed()? {
        bail!(InstallError::Build(
            "base stub already carries a signature; provide the unsigned stub".to_string()
        ));
    }

    let sections: [(&str, &[u8]); 6] = [
        (OSREL_SECTION, params.os_release.as_bytes()),
        (CMDLINE_SECTION, params.cmdline.as_bytes()),
        (KERNEL_PATH_SECTION, params.kernel_path.as_bytes()),
        (INITRD_PATH_SECTION, params.initrd_path.as_bytes()),
        (KERNEL_HASH_SECTION, &params.kernel_hash),
        (INITRD_HASH_SECTION, &params.initrd_hash),
    ];
    for (name, data) in sections {
        image
            .add_section(name, data)
            .with_context(|| format!("embedding {name}"))?;
    }
    Ok(image.into_bytes())
}

/// Read the embedded parameters back out of a (signed or unsigned) entry.
pub fn read_parameters(image: &[u8]) -> Result<StubParameters> {
    let image = PeImage::parse(image.to_vec())?;

    let text = |name: &str| -> Result<String> {
        let data = required_section(&image, name)?;
        String::from_utf8(data.to_vec())
            .map_err(|_| InstallError::Build(format!("{name} is not UTF-8")).into())
    };
    let hash = |name: &str| -> Result<[u8; 32]> {
        let data = required_section(&image, name)?;
        data.try_into().map_err(|_| {
            InstallError::Build(format!(
                "{name} holds {} bytes, expected a SHA-256 digest",
                data.len()
            ))
            .into()
        })
    };

    Ok(StubParameters {
        os_release: text(OSREL_SECTION)?,
        cmdline: text(CMDLINE_SECTION)?,
        kernel_path: text(KERNEL_PATH_SECTION)?,
        initrd_path: text(INITRD_PATH_SECTION)?,
        kernel_hash: hash(KERNEL_HASH_SECTION)?,
        initrd_hash: hash(INITRD_HASH_SECTION)?,
    })
}

fn required_section<'a>(image: &'a PeImage, name: &str) -> Result<&'a [u8]> {
    image
        .section_data(name)?
        .ok_or_else(|| InstallError::Build(format!("entry has no {name} section")).into())
}

impl std::fmt::Display for StubParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kernel {} ({}) initrd {} ({})",
            self.kernel_path,
            hex(&self.kernel_hash),
            self.initrd_path,
            hex(&self.initrd_hash)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootspec::{BootSpec, SchemaVersion};
    use crate::error::kind_of;
    use crate::test_support::minimal_pe;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn generation(specialisation: Option<&str>) -> Generation {
        Generation {
            id: 4,
            toplevel: PathBuf::from("/nix/var/nix/profiles/system-4-link"),
            specialisation: specialisation.map(str::to_string),
            spec: BootSpec {
                schema: SchemaVersion::V1,
                label: "NixOS \"Tapir\"".to_string(),
                kernel: PathBuf::from("/nix/store/abc-linux/bzImage"),
                initrd: Some(PathBuf::from("/nix/store/def-initrd/initrd")),
                initrd_secrets: None,
                init: PathBuf::from("/nix/store/ghi-system/init"),
                kernel_params: vec!["quiet".into(), "loglevel=4".into()],
                toplevel: None,
                system: None,
                specialisations: BTreeMap::new(),
            },
        }
    }

    fn staged(esp: &EspPaths, name: &str, byte: u8) -> StagedArtifact {
        StagedArtifact {
            source: PathBuf::from("/nix/store").join(name),
            destination: esp.nixos.join(name),
            sha256: [byte; 32],
        }
    }

    #[test]
    fn cmdline_starts_with_init() {
        assert_eq!(
            kernel_cmdline(&generation(None)),
            "init=/nix/store/ghi-system/init quiet loglevel=4"
        );
    }

    #[test]
    fn os_release_names_generation_and_specialisation() {
        let text = os_release(&generation(Some("debug")));
        assert!(text.contains("PRETTY_NAME=\"NixOS \\\"Tapir\\\"\""));
        assert!(text.contains("VERSION_ID=\"Generation 4, Specialisation debug\""));
    }

    #[test]
    fn built_stub_embeds_parameters() {
        let esp = EspPaths::new("/boot");
        let params = StubParameters::new(
            &esp,
            &generation(None),
            &staged(&esp, "abc-linux-bzImage.efi", 1),
            Some(&staged(&esp, "def-initrd-initrd.efi", 2)),
        )
        .unwrap();
        assert_eq!(params.kernel_path, "\\EFI\\nixos\\abc-linux-bzImage.efi");

        let image = build(&minimal_pe(), &params).unwrap();
        assert_eq!(read_parameters(&image).unwrap(), params);
    }

    #[test]
    fn missing_initrd_is_a_build_failure() {
        let esp = EspPaths::new("/boot");
        let err = StubParameters::new(
            &esp,
            &generation(None),
            &staged(&esp, "abc-linux-bzImage.efi", 1),
            None,
        )
        .unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Build(_))));
    }

    #[test]
    fn garbage_base_stub_is_a_build_failure() {
        let esp = EspPaths::new("/boot");
        let params = StubParameters::new(
            &esp,
            &generation(None),
            &staged(&esp, "k.efi", 1),
            Some(&staged(&esp, "i.efi", 2)),
        )
        .unwrap();
        let err = build(b"not a pe image at all", &params).unwrap_err();
        assert!(matches!(kind_of(&err), Some(InstallError::Build(_))));
    }

    #[test]
    fn reading_a_plain_pe_reports_missing_sections() {
        let err = read_parameters(&minimal_pe()).unwrap_err();
        assert!(err.to_string().contains(".osrel"));
    }
}

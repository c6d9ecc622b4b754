//! Installs NixOS generations as signed, hash-bound UEFI Secure Boot entries.
//!
//! Each generation's kernel and initrd are copied onto the ESP under
//! content-addressed names. A small boot stub is then built per generation
//! that embeds the SHA-256 of both files, and only the stub is signed. The
//! firmware checks the stub's signature and the stub checks the hashes, so
//! the large, unsigned kernel and initrd cannot be swapped after install.
//!
//! - **Bootspec** - reading `boot.json` of each generation
//! - **Staging** - content-addressed copies on the ESP
//! - **Stub builder** - PE section embedding of paths, hashes and cmdline
//! - **Signing and enrollment** - `sbsign`, efivarfs key enrollment
//! - **Garbage collection** - retention plan and unreferenced artifact sweep
//!
//! # Architecture
//!
//! ```text
//! boot.json ──► bootspec ──► stage ──► stub ──► signer ──► ESP (EFI/Linux)
//!                              │                              │
//!                              └──► ESP (EFI/nixos) ◄── gc ◄──┘
//!
//! enroll ──► TrustStore (efivarfs)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sb_install::esp::EspPaths;
//! use sb_install::install::Installer;
//! use sb_install::signer::SbsignSigner;
//!
//! let signer = SbsignSigner::new("/etc/secureboot/keys/db/db.key", "/etc/secureboot/keys/db/db.pem");
//! let stub = std::fs::read("/run/current-system/sw/lib/lanzaboote/stub.efi")?;
//! let report = Installer::new(EspPaths::new("/boot"), "/nix/store", "/nix/var/nix/profiles", stub, &signer)
//!     .run(&[])?;
//! assert!(report.is_success());
//! ```

pub mod bootspec;
pub mod config;
pub mod enroll;
pub mod error;
pub mod esp;
pub mod gc;
pub mod generation;
pub mod install;
pub mod lock;
pub mod preflight;
pub mod signer;
pub mod stage;
pub mod stub;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::InstallError;

//! Fixtures shared by the unit tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::bootspec::BOOTSPEC_FILENAME;
use crate::enroll::{SecureBootVariable, TrustStore};
use crate::error::InstallError;
use crate::esp::EspPaths;
use crate::stage::sha256_bytes;
use crate::stub::{self, StubParameters};

/// Smallest PE32+ image the stub builder accepts: one `.text` section holding `ret`.
pub fn minimal_pe() -> Vec<u8> {
    let mut pe = vec![0u8; 0x600];
    let put16 = |pe: &mut Vec<u8>, at: usize, v: u16| pe[at..at + 2].copy_from_slice(&v.to_le_bytes());
    let put32 = |pe: &mut Vec<u8>, at: usize, v: u32| pe[at..at + 4].copy_from_slice(&v.to_le_bytes());

    pe[0..2].copy_from_slice(b"MZ");
    put32(&mut pe, 0x3c, 0x80);
    pe[0x80..0x84].copy_from_slice(b"PE\0\0");

    // COFF header
    put16(&mut pe, 0x84, 0x8664);
    put16(&mut pe, 0x86, 1);
    put16(&mut pe, 0x94, 0xf0);
    put16(&mut pe, 0x96, 0x2022);

    // Optional header (PE32+)
    let opt = 0x98;
    put16(&mut pe, opt, 0x20b);
    put32(&mut pe, opt + 16, 0x1000);
    put32(&mut pe, opt + 32, 0x1000);
    put32(&mut pe, opt + 36, 0x200);
    put32(&mut pe, opt + 56, 0x2000);
    put32(&mut pe, opt + 60, 0x400);
    put16(&mut pe, opt + 68, 10);
    put32(&mut pe, opt + 108, 16);

    // Section table
    let text = 0x188;
    pe[text..text + 5].copy_from_slice(b".text");
    put32(&mut pe, text + 8, 0x10);
    put32(&mut pe, text + 12, 0x1000);
    put32(&mut pe, text + 16, 0x200);
    put32(&mut pe, text + 20, 0x400);
    put32(&mut pe, text + 36, 0x6000_0020);

    pe[0x400] = 0xc3;
    pe
}

/// Marks images as signed by appending a trailer.
#[derive(Debug, Default)]
pub struct FakeSigner {
    pub signed: Cell<usize>,
    pub fail: bool,
    /// Put a per-call counter before the trailer, like a timestamped signature.
    pub nonce: bool,
}

pub const FAKE_SIGNATURE: &[u8] = b"--fake-authenticode--";

impl FakeSigner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn nondeterministic() -> Self {
        Self {
            nonce: true,
            ..Self::default()
        }
    }
}

impl crate::signer::Signer for FakeSigner {
    fn sign(&self, subject: &str, image: &[u8]) -> Result<Vec<u8>> {
        if self.fail {
            bail!(InstallError::Signing {
                subject: subject.to_string(),
                reason: "key rejected".to_string(),
            });
        }
        self.signed.set(self.signed.get() + 1);
        let mut out = image.to_vec();
        if self.nonce {
            out.extend_from_slice(&(self.signed.get() as u64).to_le_bytes());
        }
        out.extend_from_slice(FAKE_SIGNATURE);
        Ok(out)
    }

    fn verify(&self, image: &[u8]) -> Result<bool> {
        Ok(image.ends_with(FAKE_SIGNATURE))
    }
}

/// Header prepended to ESL contents in fixture `.auth` files.
pub const FAKE_AUTH_HEADER: &[u8] = b"AUTH2:";

#[derive(Debug)]
pub struct MemoryTrustStore {
    pub setup_mode: bool,
    pub vars: HashMap<SecureBootVariable, Vec<u8>>,
    pub writes: Vec<(SecureBootVariable, Vec<u8>)>,
    pub reads: Cell<usize>,
}

impl MemoryTrustStore {
    pub fn in_setup_mode() -> Self {
        Self {
            setup_mode: true,
            vars: HashMap::new(),
            writes: Vec::new(),
            reads: Cell::new(0),
        }
    }

    pub fn in_user_mode() -> Self {
        Self {
            setup_mode: false,
            ..Self::in_setup_mode()
        }
    }
}

impl TrustStore for MemoryTrustStore {
    fn setup_mode(&self) -> Result<bool> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.setup_mode)
    }

    fn read(&self, var: SecureBootVariable) -> Result<Option<Vec<u8>>> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.vars.get(&var).cloned())
    }

    fn write(&mut self, var: SecureBootVariable, authenticated: &[u8]) -> Result<()> {
        let Some(esl) = authenticated.strip_prefix(FAKE_AUTH_HEADER) else {
            bail!("{var}: payload is not authenticated");
        };
        self.writes.push((var, authenticated.to_vec()));
        self.vars.insert(var, esl.to_vec());
        if var == SecureBootVariable::Pk {
            self.setup_mode = false;
        }
        Ok(())
    }
}

/// Write a PKI bundle under `root/pki` and return its path.
pub fn write_pki_bundle(root: &Path) -> PathBuf {
    let bundle = root.join("pki");
    for var in [
        SecureBootVariable::Pk,
        SecureBootVariable::Kek,
        SecureBootVariable::Db,
    ] {
        let name = var.name();
        let dir = bundle.join("keys").join(name);
        fs::create_dir_all(&dir).unwrap();
        let esl = format!("{name} signature list").into_bytes();
        let mut auth = FAKE_AUTH_HEADER.to_vec();
        auth.extend_from_slice(&esl);
        fs::write(dir.join(format!("{name}.key")), format!("{name} key")).unwrap();
        fs::write(dir.join(format!("{name}.pem")), format!("{name} cert")).unwrap();
        fs::write(dir.join(format!("{name}.esl")), esl).unwrap();
        fs::write(dir.join(format!("{name}.auth")), auth).unwrap();
    }
    bundle
}

pub fn store_dir(root: &Path) -> PathBuf {
    root.join("store")
}

pub fn profiles_dir(root: &Path) -> PathBuf {
    root.join("profiles")
}

/// Write a file into the fixture store and return its path.
pub fn write_store_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = store_dir(root).join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

/// Write `boot.json` into `profiles/system-<id>-link` and return the link directory.
pub fn write_bootspec(root: &Path, id: u64, document: &serde_json::Value) -> PathBuf {
    let link = profiles_dir(root).join(format!("system-{id}-link"));
    fs::create_dir_all(&link).unwrap();
    fs::write(
        link.join(BOOTSPEC_FILENAME),
        serde_json::to_vec_pretty(document).unwrap(),
    )
    .unwrap();
    link
}

/// Write generation `id` with one specialisation per name.
///
/// All generations share one kernel; each generation and each specialisation
/// gets its own initrd.
pub fn write_generation(root: &Path, id: u64, specialisations: &[&str]) -> PathBuf {
    let kernel = write_store_file(root, "aaa-linux/bzImage", b"shared kernel");
    let initrd = write_store_file(
        root,
        &format!("bbb{id}-initrd/initrd"),
        format!("initrd of generation {id}").as_bytes(),
    );
    let init = store_dir(root).join(format!("ccc{id}-system/init"));

    let mut specs = serde_json::Map::new();
    for name in specialisations {
        let spec_initrd = write_store_file(
            root,
            &format!("ddd{id}-{name}-initrd/initrd"),
            format!("initrd of generation {id} specialisation {name}").as_bytes(),
        );
        specs.insert(
            name.to_string(),
            serde_json::json!({
                "label": format!("NixOS ({name})"),
                "kernel": kernel,
                "initrd": spec_initrd,
                "init": init,
                "kernelParams": [format!("specialisation={name}")],
            }),
        );
    }

    write_bootspec(
        root,
        id,
        &serde_json::json!({
            "v1": {
                "label": "NixOS",
                "kernel": kernel,
                "initrd": initrd,
                "init": init,
                "kernelParams": ["loglevel=4"],
                "specialisation": specs,
            }
        }),
    )
}

/// Place a staged artifact directly on the ESP.
pub fn write_staged(esp: &EspPaths, name: &str, contents: &[u8]) -> PathBuf {
    fs::create_dir_all(&esp.nixos).unwrap();
    let path = esp.nixos.join(name);
    fs::write(&path, contents).unwrap();
    path
}

/// Write an unsigned boot entry binding `kernel` and `initrd` as they are now.
pub fn write_entry(
    esp: &EspPaths,
    generation: u64,
    specialisation: Option<&str>,
    kernel: &Path,
    initrd: &Path,
) -> PathBuf {
    let params = StubParameters {
        os_release: format!("ID=nixos\nVERSION_ID=\"Generation {generation}\"\n"),
        cmdline: "init=/init".to_string(),
        kernel_path: esp.to_uefi_path(kernel).unwrap(),
        initrd_path: esp.to_uefi_path(initrd).unwrap(),
        kernel_hash: sha256_bytes(&fs::read(kernel).unwrap()),
        initrd_hash: sha256_bytes(&fs::read(initrd).unwrap()),
    };
    let path = esp.entry_path(generation, specialisation);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, stub::build(&minimal_pe(), &params).unwrap()).unwrap();
    path
}

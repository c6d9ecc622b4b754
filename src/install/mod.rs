//! Install orchestration.
//!
//! Each generation moves through an explicit pipeline:
//!
//! ```text
//! Pending -> Read -> Staged -> Built -> Signed -> Written
//! ```
//!
//! Every step before `Written` only adds content-addressed files to the ESP
//! or works in memory, so a generation that fails early leaves no entry
//! behind. The final step writes all of a generation's entries (base and
//! specialisations) and undoes its own writes if one of them fails.
//!
//! Generations are independent: one failing does not stop the others, but
//! garbage collection only runs when all of them succeeded.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::enroll::{self, EnrollOutcome, TrustBundle, TrustStore};
use crate::error::{IoResultExt, Stage};
use crate::esp::EspPaths;
use crate::gc::{self, RetentionPlan, RetentionPolicy, SweepReport};
use crate::generation::{self, Generation, GenerationLink};
use crate::lock::EspLock;
use crate::signer::Signer;
use crate::stage::{atomic_write, StagedArtifact, Stager};
use crate::stub::pe::PeImage;
use crate::stub::{self, StubParameters};

/// Key enrollment to perform before installing.
pub struct Enrollment<'a> {
    pub store: &'a mut dyn TrustStore,
    pub bundle: &'a TrustBundle,
    pub enroll_keys: bool,
}

pub struct Installer<'a> {
    esp: EspPaths,
    stager: Stager,
    profiles_dir: PathBuf,
    base_stub: Vec<u8>,
    signer: &'a dyn Signer,
    policy: RetentionPolicy,
    bootloader: Option<PathBuf>,
    enrollment: Option<Enrollment<'a>>,
}

/// A generation that could not be installed.
#[derive(Debug)]
pub struct GenerationFailure {
    pub generation: u64,
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation {} failed at {} stage: {:#}",
            self.generation, self.stage, self.error
        )
    }
}

#[derive(Debug)]
pub enum GenerationOutcome {
    /// `changed` is false when every entry was already up to date.
    Installed { changed: bool },
    Failed(GenerationFailure),
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub enrollment: Option<EnrollOutcome>,
    /// `Some(changed)` when a boot manager was configured.
    pub bootloader: Option<bool>,
    pub generations: Vec<(u64, GenerationOutcome)>,
    /// `None` when collection did not run.
    pub sweep: Option<SweepReport>,
}

impl InstallReport {
    pub fn failures(&self) -> impl Iterator<Item = &GenerationFailure> {
        self.generations.iter().filter_map(|(_, outcome)| match outcome {
            GenerationOutcome::Failed(failure) => Some(failure),
            GenerationOutcome::Installed { .. } => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn changed(&self) -> bool {
        self.bootloader == Some(true)
            || self
                .generations
                .iter()
                .any(|(_, o)| matches!(o, GenerationOutcome::Installed { changed: true }))
            || self.sweep.as_ref().is_some_and(|s| {
                !s.removed_entries.is_empty() || !s.removed_artifacts.is_empty()
            })
    }
}

/// A generation variant with its artifacts on the ESP.
struct StagedVariant {
    generation: Generation,
    kernel: StagedArtifact,
    initrd: Option<StagedArtifact>,
}

/// An entry ready to be written. `image` is `None` when the ESP already holds it.
struct PlannedEntry {
    label: String,
    path: PathBuf,
    image: Option<Vec<u8>>,
}

enum Pipeline {
    Pending(GenerationLink),
    Read(Vec<Generation>),
    Staged(Vec<StagedVariant>),
    Built(Vec<PlannedEntry>),
    Signed(Vec<PlannedEntry>),
    Written { changed: bool },
}

impl Pipeline {
    /// The stage the next transition performs.
    fn next_stage(&self) -> Stage {
        match self {
            Pipeline::Pending(_) => Stage::Read,
            Pipeline::Read(_) => Stage::Stage,
            Pipeline::Staged(_) => Stage::Build,
            Pipeline::Built(_) => Stage::Sign,
            Pipeline::Signed(_) | Pipeline::Written { .. } => Stage::Write,
        }
    }
}

impl<'a> Installer<'a> {
    pub fn new(
        esp: EspPaths,
        store_dir: impl Into<PathBuf>,
        profiles_dir: impl Into<PathBuf>,
        base_stub: Vec<u8>,
        signer: &'a dyn Signer,
    ) -> Self {
        Self {
            stager: Stager::new(esp.clone(), store_dir),
            esp,
            profiles_dir: profiles_dir.into(),
            base_stub,
            signer,
            policy: RetentionPolicy::default(),
            bootloader: None,
            enrollment: None,
        }
    }

    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Also sign and install this (unsigned) boot manager.
    pub fn with_bootloader(mut self, bootloader: impl Into<PathBuf>) -> Self {
        self.bootloader = Some(bootloader.into());
        self
    }

    pub fn with_enrollment(mut self, enrollment: Enrollment<'a>) -> Self {
        self.enrollment = Some(enrollment);
        self
    }

    /// Install `links`, or every generation in the profile when `links` is empty.
    pub fn run(&mut self, links: &[PathBuf]) -> Result<InstallReport> {
        let _lock = EspLock::acquire(&self.esp.lock_path())?;
        let mut report = InstallReport::default();
        self.stager.reset_claims();

        if let Some(enrollment) = self.enrollment.as_mut() {
            let outcome = enroll::enroll(
                &mut *enrollment.store,
                enrollment.bundle,
                enrollment.enroll_keys,
            )?;
            report.enrollment = Some(outcome);
        }

        if let Some(bootloader) = self.bootloader.clone() {
            report.bootloader = Some(self.install_bootloader(&bootloader)?);
        }

        let (selected, plan) = self.select(links)?;
        for link in selected {
            let id = link.id;
            let outcome = self.install_generation(link);
            match &outcome {
                GenerationOutcome::Installed { changed } => {
                    info!(generation = id, changed = *changed, "generation installed")
                }
                GenerationOutcome::Failed(failure) => error!("{failure}"),
            }
            report.generations.push((id, outcome));
        }

        match plan {
            _ if !report.is_success() => {
                warn!("skipping garbage collection because some generations failed to install")
            }
            None => warn!(
                profiles = %self.profiles_dir.display(),
                "profile directory is not readable; skipping garbage collection"
            ),
            Some(plan) if plan.keep.is_empty() => {
                debug!("no generations found; nothing to collect")
            }
            Some(plan) => {
                report.sweep = Some(gc::sweep(&self.esp, &plan).context("collecting garbage")?)
            }
        }
        Ok(report)
    }

    /// Generations to install, and the retention plan garbage collection applies.
    ///
    /// The plan covers every generation in the profile plus any explicitly
    /// named link, so installing a single generation never collects the rest.
    /// Without a readable profile there is no plan to collect with: the
    /// explicit links alone say nothing about which other entries are live.
    fn select(&self, links: &[PathBuf]) -> Result<(Vec<GenerationLink>, Option<RetentionPlan>)> {
        let profile_readable = self.profiles_dir.is_dir();
        let mut known = if profile_readable {
            generation::discover_links(&self.profiles_dir)?
        } else {
            Vec::new()
        };
        let requested = if links.is_empty() {
            known.clone()
        } else {
            let mut requested = links
                .iter()
                .map(GenerationLink::from_path)
                .collect::<Result<Vec<_>>>()?;
            requested.sort();
            requested.dedup();
            requested
        };
        known.extend(requested.iter().cloned());
        known.sort();
        known.dedup();

        let ids: Vec<u64> = known.iter().map(|l| l.id).collect();
        let active = generation::active_generation(&self.profiles_dir)?;
        let plan = self.policy.plan(&ids, active)?;

        let (selected, skipped): (Vec<_>, Vec<_>) =
            requested.into_iter().partition(|link| plan.keeps(link.id));
        for link in skipped {
            debug!(generation = link.id, "outside the configuration limit; not installing");
        }
        Ok((selected, profile_readable.then_some(plan)))
    }

    fn install_generation(&self, link: GenerationLink) -> GenerationOutcome {
        let id = link.id;
        let mut state = Pipeline::Pending(link);
        loop {
            if let Pipeline::Written { changed } = state {
                return GenerationOutcome::Installed { changed };
            }
            let stage = state.next_stage();
            state = match self.advance(state) {
                Ok(next) => next,
                Err(error) => {
                    return GenerationOutcome::Failed(GenerationFailure {
                        generation: id,
                        stage,
                        error,
                    })
                }
            };
        }
    }

    fn advance(&self, state: Pipeline) -> Result<Pipeline> {
        Ok(match state {
            Pipeline::Pending(link) => {
                let generation = Generation::from_link(&link)?;
                Pipeline::Read(generation.variants())
            }
            Pipeline::Read(variants) => Pipeline::Staged(
                variants
                    .into_iter()
                    .map(|generation| self.stage_variant(generation))
                    .collect::<Result<_>>()?,
            ),
            Pipeline::Staged(variants) => Pipeline::Built(
                variants
                    .into_iter()
                    .map(|variant| self.build_entry(variant))
                    .collect::<Result<_>>()?,
            ),
            Pipeline::Built(entries) => Pipeline::Signed(
                entries
                    .into_iter()
                    .map(|entry| self.sign_entry(entry))
                    .collect::<Result<_>>()?,
            ),
            Pipeline::Signed(entries) => Pipeline::Written {
                changed: write_entries(&entries)?,
            },
            written @ Pipeline::Written { .. } => written,
        })
    }

    fn stage_variant(&self, generation: Generation) -> Result<StagedVariant> {
        let (kernel, _) = self
            .stager
            .stage(&generation.spec.kernel)
            .with_context(|| format!("staging kernel of generation {generation}"))?;
        let initrd = match (&generation.spec.initrd, &generation.spec.initrd_secrets) {
            (None, _) => None,
            (Some(initrd), None) => Some(self.stager.stage(initrd)),
            (Some(initrd), Some(appender)) => {
                Some(self.stager.stage_with_secrets(initrd, appender))
            }
        }
        .transpose()
        .with_context(|| format!("staging initrd of generation {generation}"))?
        .map(|(artifact, _)| artifact);

        Ok(StagedVariant {
            generation,
            kernel,
            initrd,
        })
    }

    fn build_entry(&self, variant: StagedVariant) -> Result<PlannedEntry> {
        let generation = &variant.generation;
        let label = generation.to_string();
        let path = self
            .esp
            .entry_path(generation.id, generation.specialisation.as_deref());
        let params = StubParameters::new(
            &self.esp,
            generation,
            &variant.kernel,
            variant.initrd.as_ref(),
        )?;

        let image = stub::build(&self.base_stub, &params)
            .with_context(|| format!("building boot entry for generation {label}"))?;
        let digest = unsigned_digest(&image)?;
        if self.is_current(&path, &digest) {
            debug!(entry = %path.display(), "boot entry already up to date");
            return Ok(PlannedEntry {
                label,
                path,
                image: None,
            });
        }
        Ok(PlannedEntry {
            label,
            path,
            image: Some(image),
        })
    }

    fn sign_entry(&self, entry: PlannedEntry) -> Result<PlannedEntry> {
        let Some(image) = entry.image else {
            return Ok(entry);
        };
        let subject = entry
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.label.clone());
        let signed = self.signer.sign(&subject, &image)?;
        Ok(PlannedEntry {
            image: Some(signed),
            ..entry
        })
    }

    /// Whether `path` already holds a validly signed copy of the unsigned image
    /// with `digest`. Comparing unsigned content keeps reuse independent of
    /// whether the signer's output is deterministic, and catches a changed base
    /// stub as well as changed parameters.
    fn is_current(&self, path: &Path, digest: &[u8; 32]) -> bool {
        let Ok(existing) = fs::read(path) else {
            return false;
        };
        match unsigned_digest(&existing) {
            Ok(current) if &current == digest => {}
            _ => return false,
        }
        match self.signer.verify(&existing) {
            Ok(valid) => valid,
            Err(err) => {
                warn!(entry = %path.display(), "could not verify existing entry: {err:#}");
                false
            }
        }
    }

    /// Returns whether anything was written.
    fn install_bootloader(&self, bootloader: &Path) -> Result<bool> {
        let unsigned = fs::read(bootloader)
            .at_path(bootloader)
            .with_context(|| format!("reading boot manager '{}'", bootloader.display()))?;
        let digest = unsigned_digest(&unsigned)
            .with_context(|| format!("reading boot manager '{}'", bootloader.display()))?;

        // Signed at most once, and only if some destination is stale.
        let mut signed: Option<Vec<u8>> = None;
        let mut changed = false;
        for destination in [&self.esp.systemd_boot, &self.esp.efi_fallback] {
            if self.is_current(destination, &digest) {
                debug!(destination = %destination.display(), "boot manager up to date");
                continue;
            }
            let image = match signed.take() {
                Some(image) => image,
                None => self.signer.sign("systemd-boot", &unsigned)?,
            };
            atomic_write(destination, &image)
                .with_context(|| format!("installing boot manager to '{}'", destination.display()))?;
            info!(destination = %destination.display(), "installed signed boot manager");
            signed = Some(image);
            changed = true;
        }
        Ok(changed)
    }
}

fn unsigned_digest(image: &[u8]) -> Result<[u8; 32]> {
    PeImage::parse(image.to_vec())?.unsigned_digest()
}

/// Write all entries of one generation, or none of them.
fn write_entries(entries: &[PlannedEntry]) -> Result<bool> {
    // Previous contents of every path written so far, for rollback.
    let mut written: Vec<(&Path, Option<Vec<u8>>)> = Vec::new();

    for entry in entries {
        let Some(image) = &entry.image else {
            continue;
        };
        let previous = fs::read(&entry.path).ok();
        if let Err(err) = atomic_write(&entry.path, image) {
            rollback(&written);
            return Err(err.context(format!("writing boot entry for generation {}", entry.label)));
        }
        info!(entry = %entry.path.display(), "wrote boot entry");
        written.push((entry.path.as_path(), previous));
    }
    Ok(!written.is_empty())
}

fn rollback(written: &[(&Path, Option<Vec<u8>>)]) {
    for (path, previous) in written.iter().rev() {
        let result = match previous {
            Some(bytes) => atomic_write(path, bytes),
            None => fs::remove_file(path).at_path(*path).map_err(Into::into),
        };
        if let Err(err) = result {
            warn!(entry = %path.display(), "rollback failed: {err:#}");
        }
    }
}

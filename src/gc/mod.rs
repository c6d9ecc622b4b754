//! Generation garbage collection.
//!
//! Collection runs in two phases so an interruption never leaves an entry
//! pointing at a deleted artifact:
//!
//! 1. unlink the boot entries of generations the retention plan drops;
//! 2. rebuild the reference index from the entries still on disk, then delete
//!    staged artifacts nobody references.
//!
//! Re-running after a crash between the phases finishes the job.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{InstallError, IoResultExt};
use crate::esp::{EntryFile, EspPaths, TMP_PREFIX};
use crate::generation;
use crate::lock::EspLock;
use crate::stub::{self, StubParameters};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of generations to keep. `None` keeps everything.
    pub configuration_limit: Option<NonZeroUsize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Ascending.
    pub keep: Vec<u64>,
    /// Ascending.
    pub remove: Vec<u64>,
}

impl RetentionPlan {
    pub fn keeps(&self, generation: u64) -> bool {
        self.keep.binary_search(&generation).is_ok()
    }
}

impl RetentionPolicy {
    pub fn new(configuration_limit: Option<NonZeroUsize>) -> Self {
        Self {
            configuration_limit,
        }
    }

    /// Decide which of `generations` survive.
    ///
    /// The active generation always survives when it is among them. It then
    /// takes one of the `limit` slots and the remaining slots go to the newest
    /// other generations.
    pub fn plan(&self, generations: &[u64], active: Option<u64>) -> Result<RetentionPlan> {
        let mut ids: Vec<u64> = generations.to_vec();
        ids.sort_by_key(|id| Reverse(*id));
        ids.dedup();

        let Some(limit) = self.configuration_limit else {
            ids.reverse();
            return Ok(RetentionPlan {
                keep: ids,
                remove: Vec::new(),
            });
        };

        let active = active.filter(|id| ids.contains(id));
        let mut keep: Vec<u64> = active.into_iter().collect();
        keep.extend(
            ids.iter()
                .copied()
                .filter(|id| Some(*id) != active)
                .take(limit.get() - keep.len()),
        );
        let mut remove: Vec<u64> = ids.into_iter().filter(|id| !keep.contains(id)).collect();
        keep.sort_unstable();
        remove.sort_unstable();

        if let Some(active) = active {
            if remove.contains(&active) {
                bail!(InstallError::RetentionViolation(active));
            }
        }
        Ok(RetentionPlan { keep, remove })
    }
}

/// Index of an entry in [`EspIndex::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryId(usize);

#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub file: EntryFile,
    /// `None` when the entry could not be parsed.
    pub params: Option<StubParameters>,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactRecord {
    /// Digests the referring entries expect. More than one means they disagree.
    pub sha256s: BTreeSet<[u8; 32]>,
    pub referrers: Vec<EntryId>,
}

/// Which staged artifacts the boot entries on the ESP reference.
#[derive(Debug, Default)]
pub struct EspIndex {
    entries: Vec<EntryRecord>,
    artifacts: BTreeMap<PathBuf, ArtifactRecord>,
}

impl EspIndex {
    pub fn scan(esp: &EspPaths) -> Result<Self> {
        let mut index = Self::default();
        for file in esp.boot_entries()? {
            let params = match fs::read(&file.path)
                .at_path(&file.path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| stub::read_parameters(&bytes))
            {
                Ok(params) => Some(params),
                Err(err) => {
                    warn!(entry = %file.path.display(), "unreadable boot entry: {err:#}");
                    None
                }
            };

            let id = EntryId(index.entries.len());
            if let Some(params) = &params {
                for (uefi_path, sha256) in [
                    (&params.kernel_path, params.kernel_hash),
                    (&params.initrd_path, params.initrd_hash),
                ] {
                    let record = index
                        .artifacts
                        .entry(esp.from_uefi_path(uefi_path))
                        .or_default();
                    record.sha256s.insert(sha256);
                    record.referrers.push(id);
                }
            }
            index.entries.push(EntryRecord { file, params });
        }
        Ok(index)
    }

    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    pub fn entry(&self, id: EntryId) -> &EntryRecord {
        &self.entries[id.0]
    }

    pub fn artifact(&self, path: &Path) -> Option<&ArtifactRecord> {
        self.artifacts.get(path)
    }

    pub fn is_referenced(&self, path: &Path) -> bool {
        self.artifacts
            .get(path)
            .is_some_and(|record| !record.referrers.is_empty())
    }

    /// Generations with at least one entry on the ESP.
    pub fn generations(&self) -> BTreeSet<u64> {
        self.entries.iter().map(|e| e.file.generation).collect()
    }

    fn has_unreadable_entries(&self) -> bool {
        self.entries.iter().any(|e| e.params.is_none())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_entries: Vec<PathBuf>,
    pub removed_artifacts: Vec<PathBuf>,
}

/// Remove every entry whose generation `plan` does not keep, then every
/// artifact left unreferenced.
pub fn sweep(esp: &EspPaths, plan: &RetentionPlan) -> Result<SweepReport> {
    if plan.keep.is_empty() {
        bail!("refusing to collect: the retention plan keeps no generation");
    }
    let mut report = SweepReport::default();

    let index = EspIndex::scan(esp)?;
    for record in index.entries() {
        if plan.keeps(record.file.generation) {
            continue;
        }
        let path = &record.file.path;
        fs::remove_file(path)
            .at_path(path)
            .with_context(|| format!("removing boot entry of generation {}", record.file.generation))?;
        info!(entry = %path.display(), "removed boot entry");
        report.removed_entries.push(path.clone());
    }

    let index = EspIndex::scan(esp)?;
    remove_stale_tmp_files(&esp.linux, &mut report)?;
    if index.has_unreadable_entries() {
        warn!("skipping artifact collection: some boot entries could not be read");
        return Ok(report);
    }
    if !esp.nixos.is_dir() {
        return Ok(report);
    }

    let lock = esp.lock_path();
    for entry in WalkDir::new(&esp.nixos).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("scanning '{}'", esp.nixos.display()))?;
        if !entry.file_type().is_file() || entry.path() == lock {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let stale_tmp = name.starts_with(TMP_PREFIX);
        if !stale_tmp && (!name.ends_with(".efi") || index.is_referenced(entry.path())) {
            continue;
        }
        fs::remove_file(entry.path())
            .at_path(entry.path())
            .context("removing unreferenced artifact")?;
        debug!(artifact = %entry.path().display(), "removed unreferenced artifact");
        report.removed_artifacts.push(entry.into_path());
    }
    if !report.removed_artifacts.is_empty() {
        info!(count = report.removed_artifacts.len(), "removed unreferenced artifacts");
    }
    Ok(report)
}

/// Apply `policy` to the generations in `profiles_dir` without installing anything.
pub fn collect(esp: &EspPaths, profiles_dir: &Path, policy: &RetentionPolicy) -> Result<SweepReport> {
    let _lock = EspLock::acquire(&esp.lock_path())?;
    let ids: Vec<u64> = generation::discover_links(profiles_dir)?
        .iter()
        .map(|link| link.id)
        .collect();
    let active = generation::active_generation(profiles_dir)?;
    let plan = policy.plan(&ids, active)?;
    info!(keep = ?plan.keep, remove = ?plan.remove, "retention plan");
    sweep(esp, &plan)
}

fn remove_stale_tmp_files(dir: &Path, report: &mut SweepReport) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("scanning '{}'", dir.display()))?;
        if entry.file_type().is_file() && entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
        {
            fs::remove_file(entry.path()).at_path(entry.path())?;
            report.removed_artifacts.push(entry.into_path());
        }
    }
    Ok(())
}

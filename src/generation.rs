use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::bootspec::{self, BootSpec, BOOTSPEC_FILENAME};

/// Name of the symlink pointing at the currently active system generation.
pub const ACTIVE_PROFILE_LINK: &str = "system";

/// A `system-<id>-link` entry of the system profile.
#[derive(Debug, Clone)]
pub struct GenerationLink {
    pub id: u64,
    pub path: PathBuf,
}

impl GenerationLink {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let id = parse_link_id(path)
            .with_context(|| format!("parsing generation link '{}'", path.display()))?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
        })
    }
}

// Ordered by id only so links can be sorted to honour the configuration limit.
impl PartialEq for GenerationLink {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GenerationLink {}

impl PartialOrd for GenerationLink {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GenerationLink {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// One installable boot configuration: a generation, or one of its specialisations.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    pub toplevel: PathBuf,
    pub specialisation: Option<String>,
    pub spec: BootSpec,
}

impl Generation {
    pub fn from_link(link: &GenerationLink) -> Result<Self> {
        let bootspec_path = link.path.join(BOOTSPEC_FILENAME);
        let spec = bootspec::read(&bootspec_path)
            .with_context(|| format!("loading generation {}", link.id))?;
        Ok(Self {
            id: link.id,
            toplevel: link.path.clone(),
            specialisation: None,
            spec,
        })
    }

    /// The base configuration followed by every specialisation, in name order.
    pub fn variants(&self) -> Vec<Generation> {
        let mut out = vec![Generation {
            specialisation: None,
            ..self.clone()
        }];
        for (name, spec) in &self.spec.specialisations {
            out.push(Generation {
                id: self.id,
                toplevel: self.toplevel.clone(),
                specialisation: Some(name.clone()),
                spec: spec.clone(),
            });
        }
        out
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specialisation {
            Some(name) => write!(f, "{} ({name})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// List all `system-<id>-link` entries in `profiles_dir`, oldest first.
pub fn discover_links(profiles_dir: &Path) -> Result<Vec<GenerationLink>> {
    let entries = fs::read_dir(profiles_dir)
        .with_context(|| format!("reading profiles directory '{}'", profiles_dir.display()))?;

    let mut links = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| {
            format!("iterating profiles directory '{}'", profiles_dir.display())
        })?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if !(name.starts_with("system-") && name.ends_with("-link")) {
            continue;
        }
        links.push(GenerationLink::from_path(&path)?);
    }
    links.sort();
    Ok(links)
}

/// Id of the generation the `system` profile link currently points at.
///
/// Returns `Ok(None)` when there is no such link.
pub fn active_generation(profiles_dir: &Path) -> Result<Option<u64>> {
    let link = profiles_dir.join(ACTIVE_PROFILE_LINK);
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading profile link '{}'", link.display()))
        }
    };
    let id = parse_link_id(&target)
        .with_context(|| format!("resolving active generation from '{}'", link.display()))?;
    Ok(Some(id))
}

fn parse_link_id(path: &Path) -> Result<u64> {
    let Some(name) = path.file_name().and_then(|part| part.to_str()) else {
        bail!("generation link has no UTF-8 file name: {}", path.display());
    };
    let Some(id) = name
        .strip_prefix("system-")
        .and_then(|rest| rest.strip_suffix("-link"))
    else {
        bail!("'{name}' is not of the form system-<id>-link");
    };
    id.parse()
        .with_context(|| format!("parsing generation id '{id}' from '{name}'"))
}

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wslkit::DesiredState;
use wslkit::desired::{FileSpec, InstanceSpec, PackageSpec, ServiceSpec, UserSpec};
use wslkit::fetch::ArtifactFetcher;

/// Environment variable overriding the staging root
pub const STAGING_DIR_ENV: &str = "WSLCTL_STAGING_DIR";

const DEFAULT_JOBS: usize = 4;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("wslctl"))
}

/// Locate the manifest: explicit path, else `manifest.toml` or
/// `manifest.json` in the config directory
pub fn find_manifest(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
        return Ok(PathBuf::from(expanded));
    }

    let dir = config_dir()?;
    for name in ["manifest.toml", "manifest.json"] {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "No manifest found. Pass one with --manifest or create {}",
        dir.join("manifest.toml").display()
    )
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Per-command timeout
    pub timeout_secs: Option<u64>,
    /// Timeout for artifact downloads
    pub download_timeout_secs: Option<u64>,
    pub staging_dir: Option<String>,
    pub jobs: Option<usize>,
}

/// Desired state for a whole machine
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub instance: Vec<InstanceSpec>,
    #[serde(default)]
    pub file: Vec<FileSpec>,
    #[serde(default)]
    pub package: Vec<PackageSpec>,
    #[serde(default)]
    pub service: Vec<ServiceSpec>,
    #[serde(default)]
    pub user: Vec<UserSpec>,
}

impl Manifest {
    /// Load a manifest, choosing the format from the extension (TOML unless `.json`)
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read manifest: {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let manifest: Self = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate every entity up front so a bad entry fails before anything runs
    pub fn validate(&self) -> Result<()> {
        for spec in &self.instance {
            spec.validate()
                .with_context(|| format!("Invalid instance '{}'", spec.name))?;
        }
        for spec in &self.file {
            spec.validate()
                .with_context(|| format!("Invalid file '{}' in {}", spec.path, spec.distribution))?;
        }
        for spec in &self.package {
            spec.validate()
                .with_context(|| {
                    format!("Invalid package '{}' in {}", spec.name, spec.distribution)
                })?;
        }
        for spec in &self.service {
            spec.validate()
                .with_context(|| {
                    format!("Invalid service '{}' in {}", spec.name, spec.distribution)
                })?;
        }
        for spec in &self.user {
            spec.validate()
                .with_context(|| format!("Invalid user '{}' in {}", spec.name, spec.distribution))?;
        }
        Ok(())
    }

    /// All entities in apply order: instances, packages, users, files, services.
    ///
    /// Packages come before services they provide; users before files they own.
    pub fn entities(&self) -> Vec<DesiredState> {
        let mut entities: Vec<DesiredState> = Vec::new();
        entities.extend(self.instance.iter().cloned().map(DesiredState::from));
        entities.extend(self.package.iter().cloned().map(DesiredState::from));
        entities.extend(self.user.iter().cloned().map(DesiredState::from));
        entities.extend(self.file.iter().cloned().map(DesiredState::from));
        entities.extend(self.service.iter().cloned().map(DesiredState::from));
        entities
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_empty()
            && self.file.is_empty()
            && self.package.is_empty()
            && self.service.is_empty()
            && self.user.is_empty()
    }
}

impl Settings {
    /// Staging root: env override, then `staging_dir`, then the system temp default
    pub fn staging_root(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STAGING_DIR_ENV)
            && !dir.is_empty()
        {
            return expand(&dir);
        }
        self.staging_dir
            .as_deref()
            .map(expand)
            .unwrap_or_else(ArtifactFetcher::default_staging_root)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }

    /// Worker count: CLI flag wins over the manifest, never below one
    pub fn jobs(&self, flag: Option<usize>) -> usize {
        flag.or(self.jobs).unwrap_or(DEFAULT_JOBS).max(1)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

// ============================================================================
// Tests
// ============================================================================

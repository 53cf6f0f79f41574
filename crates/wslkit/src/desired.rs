//! Desired-state specifications.
//!
//! One struct per entity type, wrapped in the [`DesiredState`] tagged union.
//! A specification is borrowed immutably for the whole reconciliation pass.

use std::path::PathBuf;

use serde::Deserialize;

use crate::checksum::ChecksumAlgorithm;
use crate::driver::{
    FileDriver, InstanceDriver, PackageDriver, ResourceDriver, ServiceDriver, UserDriver,
};
use crate::error::{Error, Result};
use crate::fetch::SourceFormat;
use crate::observed::{InitSystem, parse_mode};
use crate::secret::Secret;
use crate::target::TargetEnvironment;

fn default_true() -> bool {
    true
}

fn default_runlevel() -> String {
    "3".to_string()
}

/// Whether an entity should exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

/// Desired lifecycle of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceEnsure {
    /// Registered; run state left alone.
    #[default]
    Present,
    /// Registered and running.
    Run,
    /// Registered and stopped.
    Stop,
    Absent,
}

/// How a missing distribution is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMethod {
    /// `wsl --install` from the store or the web.
    #[default]
    Install,
    /// `wsl --import` from a rootfs, VHD or bundle.
    Import,
}

/// A WSL distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(default)]
    pub state: InstanceEnsure,
    #[serde(default)]
    pub method: AcquisitionMethod,
    /// Rootfs, VHD or bundle path or URL (import only).
    pub source: Option<String>,
    /// Expected digest of the source.
    pub checksum: Option<String>,
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
    /// Source format; detected from the extension when omitted.
    pub format: Option<SourceFormat>,
    /// Directory that will hold the distribution's disk (import only).
    pub install_dir: Option<String>,
    /// WSL architecture version. Applied on creation (default 2) and
    /// converted with `--set-version` when it differs.
    pub version: Option<u8>,
    #[serde(default)]
    pub web_download: bool,
    #[serde(default)]
    pub no_launch: bool,
    /// Remove staged downloads after a successful import.
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

impl InstanceSpec {
    /// A distribution installed from the store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: InstanceEnsure::default(),
            method: AcquisitionMethod::default(),
            source: None,
            checksum: None,
            algorithm: ChecksumAlgorithm::default(),
            format: None,
            install_dir: None,
            version: None,
            web_download: false,
            no_launch: false,
            cleanup: true,
        }
    }

    /// A distribution imported from `source` into `install_dir`.
    pub fn import(
        name: impl Into<String>,
        source: impl Into<String>,
        install_dir: impl Into<String>,
    ) -> Self {
        Self {
            method: AcquisitionMethod::Import,
            source: Some(source.into()),
            install_dir: Some(install_dir.into()),
            ..Self::new(name)
        }
    }

    pub fn state(mut self, state: InstanceEnsure) -> Self {
        self.state = state;
        self
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = Some(version);
        self
    }

    pub fn checksum(mut self, checksum: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum = Some(checksum.into());
        self.algorithm = algorithm;
        self
    }

    /// Source format, explicit or detected.
    pub fn source_format(&self) -> SourceFormat {
        self.format
            .or_else(|| self.source.as_deref().map(SourceFormat::detect))
            .unwrap_or(SourceFormat::Tar)
    }

    pub fn validate(&self) -> Result<()> {
        TargetEnvironment::distribution(&self.name)?;
        if let Some(version) = self.version
            && !(1..=2).contains(&version)
        {
            return Err(Error::spec(format!("WSL version must be 1 or 2, got {version}")));
        }
        if self.method == AcquisitionMethod::Import && self.state != InstanceEnsure::Absent {
            if self.source.as_deref().is_none_or(str::is_empty) {
                return Err(Error::spec(format!(
                    "instance '{}': import requires a source",
                    self.name
                )));
            }
            if self.install_dir.as_deref().is_none_or(str::is_empty) {
                return Err(Error::spec(format!(
                    "instance '{}': import requires an install_dir",
                    self.name
                )));
            }
        }
        if self.checksum.is_some() && self.source.is_none() {
            return Err(Error::spec(format!("instance '{}': checksum without a source", self.name)));
        }
        Ok(())
    }
}

/// What should be at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEnsure {
    #[default]
    File,
    Directory,
    Absent,
}

/// A file or directory inside a distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSpec {
    pub distribution: String,
    pub path: String,
    pub content: Option<String>,
    /// Append `content` instead of replacing the file.
    #[serde(default)]
    pub append: bool,
    /// Create missing parents; remove directories with their contents.
    #[serde(default)]
    pub recursive: bool,
    /// Ignore errors on removal.
    #[serde(default)]
    pub force: bool,
    /// `user` or `user:group`.
    pub owner: Option<String>,
    /// Octal permission bits such as `644`.
    pub mode: Option<String>,
    #[serde(default)]
    pub state: FileEnsure,
}

impl FileSpec {
    pub fn new(distribution: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            path: path.into(),
            content: None,
            append: false,
            recursive: false,
            force: false,
            owner: None,
            mode: None,
            state: FileEnsure::default(),
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn state(mut self, state: FileEnsure) -> Self {
        self.state = state;
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Owner split into user and optional group.
    pub fn owner_parts(&self) -> Option<(&str, Option<&str>)> {
        self.owner.as_deref().map(|owner| match owner.split_once(':') {
            Some((user, group)) => (user, Some(group).filter(|g| !g.is_empty())),
            None => (owner, None),
        })
    }

    pub fn validate(&self) -> Result<()> {
        TargetEnvironment::distribution(&self.distribution)?;
        if !self.path.starts_with('/') {
            return Err(Error::spec(format!("path '{}' must be absolute", self.path)));
        }
        if self.path.trim_end_matches('/').is_empty() {
            return Err(Error::spec("refusing to manage '/'"));
        }
        if let Some(mode) = &self.mode {
            parse_mode(mode)?;
        }
        if self.content.is_some() && self.state != FileEnsure::File {
            return Err(Error::spec(format!(
                "'{}': content is only valid with state=file",
                self.path
            )));
        }
        if self.append && self.content.is_none() {
            return Err(Error::spec(format!("'{}': append requires content", self.path)));
        }
        Ok(())
    }
}

/// A package inside a distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageSpec {
    pub distribution: String,
    pub name: String,
    /// Exact version; any installed version satisfies `present` when omitted.
    pub version: Option<String>,
    /// Allow downgrades and replacements.
    #[serde(default)]
    pub force: bool,
    /// Refresh package metadata first.
    #[serde(default)]
    pub update_cache: bool,
    #[serde(default)]
    pub state: Presence,
}

impl PackageSpec {
    pub fn new(distribution: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            name: name.into(),
            version: None,
            force: false,
            update_cache: false,
            state: Presence::default(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn state(mut self, state: Presence) -> Self {
        self.state = state;
        self
    }

    pub fn validate(&self) -> Result<()> {
        TargetEnvironment::distribution(&self.distribution)?;
        if self.name.trim().is_empty() || self.name.starts_with('-') {
            return Err(Error::spec(format!("invalid package name '{}'", self.name)));
        }
        Ok(())
    }
}

/// Whether a service should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEnsure {
    Started,
    Stopped,
}

/// A systemd or sysvinit service inside a distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    pub distribution: String,
    pub name: String,
    #[serde(default)]
    pub init: InitSystem,
    /// Run state; untouched when omitted.
    pub state: Option<ServiceEnsure>,
    /// Boot enablement; untouched when omitted.
    pub enabled: Option<bool>,
    /// Run `systemctl daemon-reload` first (systemd only).
    #[serde(default)]
    pub daemon_reload: bool,
    /// Runlevel whose links decide enablement (sysvinit only).
    #[serde(default = "default_runlevel")]
    pub runlevel: String,
}

impl ServiceSpec {
    pub fn new(distribution: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            name: name.into(),
            init: InitSystem::default(),
            state: None,
            enabled: None,
            daemon_reload: false,
            runlevel: default_runlevel(),
        }
    }

    pub fn init(mut self, init: InitSystem) -> Self {
        self.init = init;
        self
    }

    pub fn state(mut self, state: ServiceEnsure) -> Self {
        self.state = Some(state);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn validate(&self) -> Result<()> {
        TargetEnvironment::distribution(&self.distribution)?;
        if self.name.trim().is_empty() || self.name.contains('/') {
            return Err(Error::spec(format!("invalid service name '{}'", self.name)));
        }
        if self.init == InitSystem::Sysvinit
            && !(self.runlevel.len() == 1
                && self.runlevel.chars().all(|c| c.is_ascii_digit() || c == 'S'))
        {
            return Err(Error::spec(format!("invalid runlevel '{}'", self.runlevel)));
        }
        Ok(())
    }
}

/// A user account inside a distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSpec {
    pub distribution: String,
    pub name: String,
    /// Ignored for `root`.
    pub uid: Option<u32>,
    pub home: Option<String>,
    pub shell: Option<String>,
    /// Primary group.
    pub group: Option<String>,
    /// Supplementary groups; untouched when omitted.
    pub groups: Option<Vec<String>>,
    /// Add missing groups without removing others.
    #[serde(default)]
    pub append_groups: bool,
    /// Passwordless sudo drop-in; untouched when omitted, ignored for `root`.
    pub sudo: Option<bool>,
    /// Hashed password, written on every run.
    pub password: Option<Secret>,
    /// Hashed password set only when the account is created.
    pub initial_password: Option<Secret>,
    /// Unlock an account created without a password.
    #[serde(default = "default_true")]
    pub unlock_no_password: bool,
    /// Public key written to `authorized_keys` on every run.
    pub ssh_key: Option<Secret>,
    /// Host path of a public key file, used when `ssh_key` is absent.
    pub ssh_key_file: Option<PathBuf>,
    /// Remove the home directory with the account.
    #[serde(default)]
    pub remove_home: bool,
    #[serde(default)]
    pub state: Presence,
}

impl UserSpec {
    pub fn new(distribution: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            distribution: distribution.into(),
            name: name.into(),
            uid: None,
            home: None,
            shell: None,
            group: None,
            groups: None,
            append_groups: false,
            sudo: None,
            password: None,
            initial_password: None,
            unlock_no_password: true,
            ssh_key: None,
            ssh_key_file: None,
            remove_home: false,
            state: Presence::default(),
        }
    }

    pub fn state(mut self, state: Presence) -> Self {
        self.state = state;
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = Some(sudo);
        self
    }

    pub fn is_root(&self) -> bool {
        self.name == "root"
    }

    pub fn validate(&self) -> Result<()> {
        TargetEnvironment::distribution(&self.distribution)?;
        let valid = !self.name.is_empty()
            && !self.name.starts_with('-')
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'));
        if !valid {
            return Err(Error::spec(format!("invalid user name '{}'", self.name)));
        }
        if let Some(home) = &self.home
            && !home.starts_with('/')
        {
            return Err(Error::spec(format!("home '{home}' must be absolute")));
        }
        if self.is_root() && self.state == Presence::Absent {
            return Err(Error::spec("refusing to remove root"));
        }
        Ok(())
    }
}

/// Desired state of one entity.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DesiredState {
    Instance(InstanceSpec),
    File(FileSpec),
    Package(PackageSpec),
    Service(ServiceSpec),
    User(UserSpec),
}

impl DesiredState {
    /// The driver responsible for this entity.
    pub fn driver(&self) -> Box<dyn ResourceDriver + '_> {
        match self {
            Self::Instance(spec) => Box::new(InstanceDriver::new(spec)),
            Self::File(spec) => Box::new(FileDriver::new(spec)),
            Self::Package(spec) => Box::new(PackageDriver::new(spec)),
            Self::Service(spec) => Box::new(ServiceDriver::new(spec)),
            Self::User(spec) => Box::new(UserDriver::new(spec)),
        }
    }

    /// Distribution the entity is, or lives in.
    pub fn distribution(&self) -> &str {
        match self {
            Self::Instance(spec) => &spec.name,
            Self::File(spec) => &spec.distribution,
            Self::Package(spec) => &spec.distribution,
            Self::Service(spec) => &spec.distribution,
            Self::User(spec) => &spec.distribution,
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Self::Instance(_))
    }
}

impl From<InstanceSpec> for DesiredState {
    fn from(spec: InstanceSpec) -> Self {
        Self::Instance(spec)
    }
}

impl From<FileSpec> for DesiredState {
    fn from(spec: FileSpec) -> Self {
        Self::File(spec)
    }
}

impl From<PackageSpec> for DesiredState {
    fn from(spec: PackageSpec) -> Self {
        Self::Package(spec)
    }
}

impl From<ServiceSpec> for DesiredState {
    fn from(spec: ServiceSpec) -> Self {
        Self::Service(spec)
    }
}

impl From<UserSpec> for DesiredState {
    fn from(spec: UserSpec) -> Self {
        Self::User(spec)
    }
}

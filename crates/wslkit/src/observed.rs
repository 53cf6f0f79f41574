//! Observed-state snapshots.
//!
//! A snapshot is produced fresh by every inspection and never cached. None of
//! these types carry secret material, so all of them serialize.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Kind of filesystem object at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Link,
    Other,
}

impl FileKind {
    /// Map `stat -c %F` output to a kind.
    pub fn from_stat(description: &str) -> Self {
        let description = description.trim();
        if description.contains("directory") {
            Self::Directory
        } else if description.contains("regular") {
            Self::File
        } else if description.contains("symbolic link") {
            Self::Link
        } else {
            Self::Other
        }
    }
}

/// Package manager found inside a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
}

impl PackageManager {
    /// Probe order: first binary found wins.
    pub const PRIORITY: [PackageManager; 6] = [
        Self::Apt,
        Self::Dnf,
        Self::Yum,
        Self::Zypper,
        Self::Pacman,
        Self::Apk,
    ];

    /// Binary probed for and used to install.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Pacman => "pacman",
            Self::Apk => "apk",
        }
    }

    /// Whether the manager can install an exact version.
    pub fn supports_version_pinning(&self) -> bool {
        !matches!(self, Self::Pacman)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Pacman => "pacman",
            Self::Apk => "apk",
        };
        f.write_str(name)
    }
}

/// Init system a service is managed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystem {
    #[default]
    Systemd,
    Sysvinit,
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Systemd => f.write_str("systemd"),
            Self::Sysvinit => f.write_str("sysvinit"),
        }
    }
}

/// Registered distribution as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub name: String,
    pub exists: bool,
    pub running: bool,
    /// WSL architecture version (1 or 2).
    pub version: Option<u8>,
    /// Whether this is the host's default distribution.
    pub default: bool,
}

impl InstanceState {
    /// Snapshot of a distribution that is not registered.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            running: false,
            version: None,
            default: false,
        }
    }
}

/// File or directory inside a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub exists: bool,
    pub kind: Option<FileKind>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Permission bits, normalized to four octal digits.
    pub mode: Option<String>,
    pub size: Option<u64>,
    /// Text content of small regular files.
    pub content: Option<String>,
    /// SHA-256 of the content of regular files.
    pub checksum: Option<String>,
}

impl FileState {
    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            kind: None,
            owner: None,
            group: None,
            mode: None,
            size: None,
            content: None,
            checksum: None,
        }
    }
}

/// Package inside a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageState {
    pub name: String,
    pub installed: bool,
    pub version: Option<String>,
    pub manager: Option<PackageManager>,
}

impl PackageState {
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installed: false,
            version: None,
            manager: None,
        }
    }
}

/// Service inside a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub name: String,
    pub init: InitSystem,
    pub exists: bool,
    pub running: bool,
    pub enabled: bool,
}

/// User account inside a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub name: String,
    pub exists: bool,
    pub uid: Option<u32>,
    pub home: Option<String>,
    pub shell: Option<String>,
    pub primary_group: Option<String>,
    /// Supplementary groups, sorted.
    pub groups: Vec<String>,
    /// Whether the sudoers drop-in exists.
    pub sudo: bool,
}

impl UserState {
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            uid: None,
            home: None,
            shell: None,
            primary_group: None,
            groups: Vec::new(),
            sudo: false,
        }
    }
}

/// Snapshot of one managed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservedState {
    Instance(InstanceState),
    File(FileState),
    Package(PackageState),
    Service(ServiceState),
    User(UserState),
}

impl ObservedState {
    /// Whether the entity exists (installed, for packages).
    pub fn exists(&self) -> bool {
        match self {
            Self::Instance(s) => s.exists,
            Self::File(s) => s.exists,
            Self::Package(s) => s.installed,
            Self::Service(s) => s.exists,
            Self::User(s) => s.exists,
        }
    }

    /// Entity type tag.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::Instance(_) => "instance",
            Self::File(_) => "file",
            Self::Package(_) => "package",
            Self::Service(_) => "service",
            Self::User(_) => "user",
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceState> {
        match self {
            Self::Instance(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileState> {
        match self {
            Self::File(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_package(&self) -> Option<&PackageState> {
        match self {
            Self::Package(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceState> {
        match self {
            Self::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserState> {
        match self {
            Self::User(s) => Some(s),
            _ => None,
        }
    }
}

/// Parse an octal mode such as `644`, `0755` or `0o600`.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let trimmed = mode.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 5 {
        return Err(Error::spec(format!("invalid mode '{mode}'")));
    }
    let value = u32::from_str_radix(digits, 8)
        .map_err(|_| Error::spec(format!("invalid mode '{mode}'")))?;
    if value > 0o7777 {
        return Err(Error::spec(format!("invalid mode '{mode}'")));
    }
    Ok(value)
}

/// Format permission bits as four octal digits.
pub fn format_mode(mode: u32) -> String {
    format!("{mode:04o}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("0o4755").unwrap(), 0o4755);
        assert!(parse_mode("rwx").is_err());
        assert!(parse_mode("888").is_err());
        assert!(parse_mode("").is_err());
        assert_eq!(format_mode(0o644), "0644");
    }

    #[test]
    fn test_file_kind_from_stat() {
        assert_eq!(FileKind::from_stat("regular file"), FileKind::File);
        assert_eq!(FileKind::from_stat("regular empty file"), FileKind::File);
        assert_eq!(FileKind::from_stat("directory\n"), FileKind::Directory);
        assert_eq!(FileKind::from_stat("symbolic link"), FileKind::Link);
        assert_eq!(FileKind::from_stat("socket"), FileKind::Other);
    }

    #[test]
    fn test_observed_state_serializes_with_type_tag() {
        let state = ObservedState::Package(PackageState {
            name: "curl".into(),
            installed: true,
            version: Some("7.81.0-1".into()),
            manager: Some(PackageManager::Apt),
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["type"], "package");
        assert_eq!(json["manager"], "apt");
        assert!(state.exists());
    }
}

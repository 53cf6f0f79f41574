//! State inspection.
//!
//! Every query goes through the [`CommandExecutor`] and produces a fresh
//! snapshot. The only thing remembered between calls is the package manager
//! detected for each distribution, and the inspector itself lives for a
//! single reconciliation pass.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::driver::script;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec, DEFAULT_TIMEOUT};
use crate::observed::{
    FileKind, FileState, InitSystem, InstanceState, ObservedState, PackageManager, PackageState,
    ServiceState, UserState, format_mode,
};
use crate::target::TargetEnvironment;

/// Largest file whose content is read into a snapshot.
pub const MAX_CONTENT_BYTES: u64 = 64 * 1024;

/// Binary used to talk to the WSL service.
pub const WSL_EXE: &str = "wsl.exe";

/// Path of the sudoers drop-in for a user. Dots are not allowed in
/// sudoers.d file names.
pub fn sudoers_path(user: &str) -> String {
    format!("/etc/sudoers.d/{}", user.replace('.', "_"))
}

/// A distribution as listed by `wsl.exe --list --verbose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributionInfo {
    pub name: String,
    /// Raw state column (`Running`, `Stopped`, `Installing`...).
    pub state: String,
    pub version: Option<u8>,
    pub default: bool,
}

impl DistributionInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Raw file read back from a distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlurpResult {
    pub path: String,
    /// Base64-encoded content.
    pub content: String,
    pub encoding: &'static str,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<String>,
    pub size: u64,
}

impl SlurpResult {
    /// Decode the content.
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.content)
            .map_err(|e| Error::inspection(&self.path, e.to_string()))
    }
}

/// Reference to an entity to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Instance {
        name: String,
    },
    File {
        distribution: String,
        path: String,
    },
    Package {
        distribution: String,
        name: String,
    },
    Service {
        distribution: String,
        name: String,
        init: InitSystem,
        runlevel: String,
    },
    User {
        distribution: String,
        name: String,
    },
}

/// Queries observed state through a command executor.
pub struct StateInspector<'a> {
    executor: &'a dyn CommandExecutor,
    timeout: Duration,
    managers: Mutex<HashMap<String, PackageManager>>,
}

impl<'a> StateInspector<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            executor,
            timeout: DEFAULT_TIMEOUT,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Inspect any entity.
    pub fn inspect(&self, entity: &EntityRef) -> Result<ObservedState> {
        match entity {
            EntityRef::Instance { name } => self.instance(name).map(ObservedState::Instance),
            EntityRef::File { distribution, path } => {
                self.file(distribution, path).map(ObservedState::File)
            }
            EntityRef::Package { distribution, name } => {
                self.package(distribution, name).map(ObservedState::Package)
            }
            EntityRef::Service {
                distribution,
                name,
                init,
                runlevel,
            } => self
                .service(distribution, name, *init, runlevel)
                .map(ObservedState::Service),
            EntityRef::User { distribution, name } => {
                self.user(distribution, name).map(ObservedState::User)
            }
        }
    }

    /// All registered distributions.
    pub fn distributions(&self) -> Result<Vec<DistributionInfo>> {
        let command = CommandSpec::new(WSL_EXE)
            .args(["--list", "--verbose"])
            .timeout(self.timeout);
        let output = self
            .executor
            .spawn(&TargetEnvironment::Host, &command)
            .map_err(|e| Error::inspection("distributions", e.to_string()))?;
        let stdout = output.stdout_str();

        if !output.success() {
            // wsl.exe exits non-zero when nothing is registered
            if stdout.to_ascii_lowercase().contains("no installed distributions") {
                return Ok(Vec::new());
            }
            let message = match output.stderr_excerpt() {
                s if s.is_empty() => stdout.trim().to_string(),
                s => s,
            };
            return Err(Error::inspection("distributions", message));
        }

        Ok(parse_distribution_list(&stdout))
    }

    /// State of one distribution.
    pub fn instance(&self, name: &str) -> Result<InstanceState> {
        let found = self
            .distributions()?
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name));
        Ok(match found {
            Some(info) => InstanceState {
                name: info.name.clone(),
                exists: true,
                running: info.is_running(),
                version: info.version,
                default: info.default,
            },
            None => InstanceState::absent(name),
        })
    }

    /// State of a file or directory.
    pub fn file(&self, distribution: &str, path: &str) -> Result<FileState> {
        let target = self.guest(distribution)?;
        let stat = self.probe(
            &target,
            path,
            CommandSpec::new("stat")
                .args(["-L", "-c", "%F|%U|%G|%a|%s", "--", path])
                .allow_exit_codes(&[0, 1]),
        )?;
        if !stat.success() {
            return Ok(FileState::absent(path));
        }

        let line = stat.stdout_str();
        let fields: Vec<&str> = line.trim().splitn(5, '|').collect();
        let [kind, owner, group, mode, size] = fields[..] else {
            return Err(Error::inspection(
                path,
                format!("unexpected stat output '{}'", line.trim()),
            ));
        };
        let kind = FileKind::from_stat(kind);
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|_| Error::inspection(path, format!("unexpected mode '{mode}'")))?;
        let size: u64 = size
            .parse()
            .map_err(|_| Error::inspection(path, format!("unexpected size '{size}'")))?;

        let mut state = FileState {
            path: path.to_string(),
            exists: true,
            kind: Some(kind),
            owner: Some(owner.to_string()),
            group: Some(group.to_string()),
            mode: Some(format_mode(mode)),
            size: Some(size),
            content: None,
            checksum: None,
        };

        if kind == FileKind::File {
            if size <= MAX_CONTENT_BYTES {
                let bytes = self.read_bytes(&target, path)?;
                state.checksum = Some(checksum::compute_bytes(&bytes, ChecksumAlgorithm::Sha256));
                state.content = String::from_utf8(bytes).ok();
            } else {
                let sum = self.probe(
                    &target,
                    path,
                    CommandSpec::new("sha256sum").args(["--", path]),
                )?;
                state.checksum = sum
                    .stdout_str()
                    .split_whitespace()
                    .next()
                    .map(str::to_ascii_lowercase);
            }
        }

        Ok(state)
    }

    /// Raw bytes of a regular file, whatever its size or encoding.
    pub fn read_file(&self, distribution: &str, path: &str) -> Result<Vec<u8>> {
        let target = self.guest(distribution)?;
        self.read_bytes(&target, path)
    }

    /// Whether anything exists at `path`.
    pub fn path_exists(&self, distribution: &str, path: &str) -> Result<bool> {
        let target = self.guest(distribution)?;
        let output = self.probe(
            &target,
            path,
            CommandSpec::new("test").args(["-e", path]).allow_exit_codes(&[0, 1]),
        )?;
        Ok(output.success())
    }

    /// Read a regular file back, base64-encoded, with its ownership.
    pub fn slurp(&self, distribution: &str, path: &str) -> Result<SlurpResult> {
        let state = self.file(distribution, path)?;
        if !state.exists {
            return Err(Error::inspection(path, "no such file"));
        }
        if state.kind != Some(FileKind::File) {
            return Err(Error::inspection(path, "not a regular file"));
        }
        let target = self.guest(distribution)?;
        let bytes = self.read_bytes(&target, path)?;
        Ok(SlurpResult {
            path: path.to_string(),
            content: BASE64.encode(&bytes),
            encoding: "base64",
            owner: state.owner,
            group: state.group,
            mode: state.mode,
            size: bytes.len() as u64,
        })
    }

    /// Package manager of a distribution, detected once per inspector.
    pub fn package_manager(&self, distribution: &str) -> Result<PackageManager> {
        let mut cache = self.managers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(manager) = cache.get(distribution) {
            return Ok(*manager);
        }

        let target = self.guest(distribution)?;
        for manager in PackageManager::PRIORITY {
            let output = self.probe(
                &target,
                manager.binary(),
                CommandSpec::new("sh")
                    .args(["-c", script::COMMAND_EXISTS, "sh", manager.binary()])
                    .allow_exit_codes(&[0, 1, 127]),
            )?;
            if output.success() {
                log::debug!("[{}] package manager is {}", distribution, manager);
                cache.insert(distribution.to_string(), manager);
                return Ok(manager);
            }
        }

        Err(Error::inspection(
            format!("packages in {distribution}"),
            "no supported package manager found",
        ))
    }

    /// Installed version of a package.
    pub fn package(&self, distribution: &str, name: &str) -> Result<PackageState> {
        let manager = self.package_manager(distribution)?;
        let target = self.guest(distribution)?;

        let version = match manager {
            PackageManager::Apt => {
                let output = self.probe(
                    &target,
                    name,
                    CommandSpec::new("dpkg-query")
                        .args(["-W", "-f", "${Status}|${Version}", name])
                        .allow_exit_codes(&[0, 1]),
                )?;
                let stdout = output.stdout_str();
                match stdout.trim().split_once('|') {
                    Some((status, version))
                        if output.success() && status.ends_with(" installed") =>
                    {
                        Some(version.to_string())
                    }
                    _ => None,
                }
            }
            PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper => {
                let output = self.probe(
                    &target,
                    name,
                    CommandSpec::new("rpm")
                        .args(["-q", "--qf", "%{VERSION}-%{RELEASE}", name])
                        .allow_exit_codes(&[0, 1]),
                )?;
                output
                    .success()
                    .then(|| output.stdout_str().trim().to_string())
            }
            PackageManager::Pacman => {
                let output = self.probe(
                    &target,
                    name,
                    CommandSpec::new("pacman")
                        .args(["-Q", name])
                        .allow_exit_codes(&[0, 1]),
                )?;
                let stdout = output.stdout_str();
                output
                    .success()
                    .then(|| stdout.split_whitespace().nth(1).map(str::to_string))
                    .flatten()
            }
            PackageManager::Apk => {
                let output = self.probe(
                    &target,
                    name,
                    CommandSpec::new("apk")
                        .args(["list", "--installed", name])
                        .allow_exit_codes(&[0, 1]),
                )?;
                parse_apk_version(&output.stdout_str(), name)
            }
        };

        Ok(PackageState {
            name: name.to_string(),
            installed: version.is_some(),
            version: version.filter(|v| !v.is_empty()),
            manager: Some(manager),
        })
    }

    /// Running and enabled state of a service.
    pub fn service(
        &self,
        distribution: &str,
        name: &str,
        init: InitSystem,
        runlevel: &str,
    ) -> Result<ServiceState> {
        let target = self.guest(distribution)?;
        match init {
            InitSystem::Systemd => {
                let active = self.probe(
                    &target,
                    name,
                    CommandSpec::new("systemctl")
                        .args(["is-active", name])
                        .allow_exit_codes(&[0, 1, 2, 3, 4]),
                )?;
                let enabled = self.probe(
                    &target,
                    name,
                    CommandSpec::new("systemctl")
                        .args(["is-enabled", name])
                        .allow_exit_codes(&[0, 1, 2, 3, 4]),
                )?;
                let enabled_state = enabled.stdout_str().trim().to_string();
                let exists = enabled.exit_code != Some(4)
                    && enabled_state != "not-found"
                    && !enabled.stderr_str().contains("No such file");
                Ok(ServiceState {
                    name: name.to_string(),
                    init,
                    exists,
                    running: active.stdout_str().trim() == "active",
                    enabled: matches!(
                        enabled_state.as_str(),
                        "enabled" | "enabled-runtime" | "alias"
                    ),
                })
            }
            InitSystem::Sysvinit => {
                let script = format!("/etc/init.d/{name}");
                let exists = self
                    .probe(
                        &target,
                        name,
                        CommandSpec::new("test")
                            .args(["-x", script.as_str()])
                            .allow_exit_codes(&[0, 1]),
                    )?
                    .success();
                let running = exists
                    && self
                        .probe(
                            &target,
                            name,
                            CommandSpec::new("service")
                                .args([name, "status"])
                                .allow_exit_codes(&[0, 1, 2, 3, 4]),
                        )?
                        .success();
                let links = self.probe(
                    &target,
                    name,
                    CommandSpec::new("find")
                        .args([
                            format!("/etc/rc{runlevel}.d"),
                            "-name".into(),
                            format!("S??{name}"),
                        ])
                        .allow_exit_codes(&[0, 1]),
                )?;
                Ok(ServiceState {
                    name: name.to_string(),
                    init,
                    exists,
                    running,
                    enabled: !links.stdout_str().trim().is_empty(),
                })
            }
        }
    }

    /// Account details of a user.
    pub fn user(&self, distribution: &str, name: &str) -> Result<UserState> {
        let target = self.guest(distribution)?;
        let passwd = self.probe(
            &target,
            name,
            CommandSpec::new("getent")
                .args(["passwd", name])
                .allow_exit_codes(&[0, 2]),
        )?;
        if !passwd.success() {
            return Ok(UserState::absent(name));
        }

        let line = passwd.stdout_str();
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 7 {
            return Err(Error::inspection(
                name,
                format!("unexpected passwd entry '{}'", line.trim()),
            ));
        }
        let uid = fields[2]
            .parse()
            .map_err(|_| Error::inspection(name, format!("unexpected uid '{}'", fields[2])))?;

        let primary = self
            .probe(&target, name, CommandSpec::new("id").args(["-gn", name]))?
            .stdout_str()
            .trim()
            .to_string();
        let all = self
            .probe(&target, name, CommandSpec::new("id").args(["-Gn", name]))?
            .stdout_str();
        let mut groups: Vec<String> = all
            .split_whitespace()
            .filter(|g| *g != primary)
            .map(str::to_string)
            .collect();
        groups.sort();
        groups.dedup();

        let sudo = self
            .probe(
                &target,
                name,
                CommandSpec::new("test")
                    .args(["-f", sudoers_path(name).as_str()])
                    .allow_exit_codes(&[0, 1]),
            )?
            .success();

        Ok(UserState {
            name: name.to_string(),
            exists: true,
            uid: Some(uid),
            home: Some(fields[5].to_string()),
            shell: Some(fields[6].to_string()),
            primary_group: Some(primary).filter(|g| !g.is_empty()),
            groups,
            sudo,
        })
    }

    fn guest(&self, distribution: &str) -> Result<TargetEnvironment> {
        TargetEnvironment::distribution(distribution)
    }

    fn read_bytes(&self, target: &TargetEnvironment, path: &str) -> Result<Vec<u8>> {
        Ok(self
            .probe(target, path, CommandSpec::new("cat").args(["--", path]))?
            .stdout)
    }

    /// Run a query, reporting any failure as an inspection error.
    fn probe(
        &self,
        target: &TargetEnvironment,
        entity: &str,
        command: CommandSpec,
    ) -> Result<CommandOutput> {
        let command = command.timeout(self.timeout);
        self.executor
            .execute(target, &command)
            .map_err(|e| match e {
                Error::Inspection { .. } => e,
                other => Error::inspection(format!("{entity} in {target}"), other.to_string()),
            })
    }
}

/// Parse `wsl.exe --list --verbose` output.
pub fn parse_distribution_list(output: &str) -> Vec<DistributionInfo> {
    output
        .lines()
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (default, rest) = match line.strip_prefix('*') {
                Some(rest) => (true, rest.trim_start()),
                None => (false, line),
            };
            let mut columns: Vec<&str> = rest.split_whitespace().collect();
            if columns.len() < 3 || columns[0] == "NAME" {
                return None;
            }
            let version = columns.pop().and_then(|v| v.parse().ok());
            let state = columns.pop()?.to_string();
            Some(DistributionInfo {
                name: columns.join(" "),
                state,
                version,
                default,
            })
        })
        .collect()
}

fn parse_apk_version(output: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}-");
    output.lines().find_map(|line| {
        let token = line.split_whitespace().next()?;
        let version = token.strip_prefix(&prefix)?;
        version
            .starts_with(|c: char| c.is_ascii_digit())
            .then(|| version.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeHost;

    #[test]
    fn test_parse_distribution_list() {
        let output = "  NAME            STATE           VERSION\r\n\
                      * Ubuntu          Running         2\r\n  \
                      Debian          Stopped         1\r\n";
        let list = parse_distribution_list(output);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Ubuntu");
        assert!(list[0].default);
        assert!(list[0].is_running());
        assert_eq!(list[1].version, Some(1));
        assert!(!list[1].default);
    }

    #[test]
    fn test_parse_apk_version() {
        let output = "curl-dev-8.5.0-r0 x86_64 {curl} (curl) [installed]\ncurl-8.5.0-r0 x86_64 {curl} (curl) [installed]\n";
        assert_eq!(parse_apk_version(output, "curl"), Some("8.5.0-r0".into()));
        assert_eq!(parse_apk_version("", "curl"), None);
    }

    #[test]
    fn test_distributions_from_fake_host() {
        let host = FakeHost::new().with_distribution("Ubuntu", 2, true);
        let inspector = StateInspector::new(&host);
        let list = inspector.distributions().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_running());

        let empty = FakeHost::new();
        assert!(StateInspector::new(&empty).distributions().unwrap().is_empty());
    }

    #[test]
    fn test_file_snapshot() {
        let host = FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_file("Ubuntu", "/etc/motd", "hello\n");
        let inspector = StateInspector::new(&host);

        let state = inspector.file("Ubuntu", "/etc/motd").unwrap();
        assert!(state.exists);
        assert_eq!(state.kind, Some(FileKind::File));
        assert_eq!(state.content.as_deref(), Some("hello\n"));
        assert_eq!(state.mode.as_deref(), Some("0644"));
        assert_eq!(state.owner.as_deref(), Some("root"));
        assert_eq!(
            state.checksum.unwrap(),
            checksum::compute_bytes(b"hello\n", ChecksumAlgorithm::Sha256)
        );

        let missing = inspector.file("Ubuntu", "/etc/nope").unwrap();
        assert!(!missing.exists);
        assert!(inspector.path_exists("Ubuntu", "/etc").unwrap());
        assert!(!inspector.path_exists("Ubuntu", "/etc/nope").unwrap());
    }

    #[test]
    fn test_unreachable_distribution_is_inspection_error() {
        let host = FakeHost::new();
        let inspector = StateInspector::new(&host);
        let err = inspector.file("Ghost", "/etc/motd").unwrap_err();
        assert!(matches!(err, Error::Inspection { .. }));
    }

    #[test]
    fn test_package_manager_detected_once() {
        let host = FakeHost::new()
            .with_distribution("Fedora", 2, true)
            .with_package_manager("Fedora", PackageManager::Dnf);
        let inspector = StateInspector::new(&host);

        assert_eq!(inspector.package_manager("Fedora").unwrap(), PackageManager::Dnf);
        let probes = host.count_invocations(|inv| inv.program == "sh");
        inspector.package("Fedora", "git").unwrap();
        inspector.package("Fedora", "curl").unwrap();
        assert_eq!(host.count_invocations(|inv| inv.program == "sh"), probes);
        // apt-get and dnf were probed, in that order
        assert_eq!(probes, 2);
    }

    #[test]
    fn test_no_package_manager() {
        let host = FakeHost::new().with_distribution("Minimal", 2, true);
        let inspector = StateInspector::new(&host);
        assert!(matches!(
            inspector.package_manager("Minimal"),
            Err(Error::Inspection { .. })
        ));
    }

    #[test]
    fn test_user_snapshot() {
        let host = FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_user("Ubuntu", "alice", 1000, &["sudo", "docker"]);
        let inspector = StateInspector::new(&host);

        let alice = inspector.user("Ubuntu", "alice").unwrap();
        assert!(alice.exists);
        assert_eq!(alice.uid, Some(1000));
        assert_eq!(alice.home.as_deref(), Some("/home/alice"));
        assert_eq!(alice.primary_group.as_deref(), Some("alice"));
        assert_eq!(alice.groups, vec!["docker".to_string(), "sudo".to_string()]);
        assert!(!alice.sudo);

        assert!(!inspector.user("Ubuntu", "bob").unwrap().exists);
    }

    #[test]
    fn test_slurp() {
        let host = FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_file("Ubuntu", "/etc/hostname", "devbox\n");
        let inspector = StateInspector::new(&host);

        let slurp = inspector.slurp("Ubuntu", "/etc/hostname").unwrap();
        assert_eq!(slurp.encoding, "base64");
        assert_eq!(slurp.decode().unwrap(), b"devbox\n");
        assert_eq!(slurp.content, "ZGV2Ym94Cg==");
        assert!(inspector.slurp("Ubuntu", "/etc").is_err());
    }

    #[test]
    fn test_sudoers_path() {
        assert_eq!(sudoers_path("first.last"), "/etc/sudoers.d/first_last");
    }
}

//! In-memory WSL host.
//!
//! [`FakeHost`] interprets the commands the inspector and the drivers emit
//! against a simulated set of distributions, so a whole reconciliation can
//! run without Windows. Each program understands only the flags the engine
//! passes to it; anything else exits 127 like a missing binary.
//!
//! ```
//! use wslkit::exec::FakeHost;
//!
//! let host = FakeHost::new()
//!     .with_distribution("Ubuntu", 2, true)
//!     .with_file("Ubuntu", "/etc/motd", "hello\n");
//! assert!(host.is_running("Ubuntu"));
//! assert_eq!(host.file_content("Ubuntu", "/etc/motd").as_deref(), Some(&b"hello\n"[..]));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::driver::script;
use crate::error::Result;
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec, Input};
use crate::inspect::WSL_EXE;
use crate::observed::{PackageManager, format_mode, parse_mode};
use crate::target::TargetEnvironment;

const NO_SUCH_DISTRIBUTION: &str = "There is no distribution with the supplied name.";
const ALREADY_EXISTS: &str = "A distribution with the supplied name already exists.";

/// A command the fake host received.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub target: TargetEnvironment,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Input>,
}

impl Invocation {
    /// Program and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Standard input as text, secrets included.
    pub fn stdin_str(&self) -> Option<String> {
        self.stdin
            .as_ref()
            .map(|input| String::from_utf8_lossy(input.as_bytes()).to_string())
    }
}

#[derive(Debug, Clone)]
struct Failure {
    prefix: String,
    code: i32,
    stderr: String,
    once: bool,
}

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
struct Node {
    content: Content,
    owner: String,
    group: String,
    mode: u32,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            content: Content::Dir,
            owner: "root".into(),
            group: "root".into(),
            mode,
        }
    }

    fn file(bytes: Vec<u8>) -> Self {
        Self {
            content: Content::File(bytes),
            owner: "root".into(),
            group: "root".into(),
            mode: 0o644,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir)
    }
}

#[derive(Debug, Clone, Default)]
struct Service {
    running: bool,
    enabled: bool,
    runlevels: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Account {
    uid: u32,
    home: String,
    shell: String,
    primary: String,
    groups: BTreeSet<String>,
    password: Option<String>,
    locked: bool,
}

#[derive(Debug, Clone)]
struct Distribution {
    version: u8,
    running: bool,
    install_dir: Option<String>,
    nodes: BTreeMap<String, Node>,
    /// Symbolic links, path to absolute target.
    links: BTreeMap<String, String>,
    manager: Option<PackageManager>,
    installed: BTreeMap<String, String>,
    available: BTreeMap<String, String>,
    services: BTreeMap<String, Service>,
    users: BTreeMap<String, Account>,
    groups: BTreeMap<String, u32>,
    daemon_reloads: usize,
    cache_updates: usize,
}

#[derive(Debug, Default)]
struct HostState {
    distributions: BTreeMap<String, Distribution>,
    default: Option<String>,
    invocations: Vec<Invocation>,
    failures: Vec<Failure>,
}

/// A simulated WSL host.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

fn respond(code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn not_found(program: &str) -> CommandOutput {
    respond(127, "", format!("sh: 1: {program}: not found\n"))
}

fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        _ if path == "/" => None,
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn is_within(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

/// Split arguments into flags and operands. Everything after `--` is an
/// operand.
fn operands<'a>(args: &[&'a str]) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut flags = Vec::new();
    let mut words = Vec::new();
    let mut literal = false;
    for arg in args {
        if literal {
            words.push(*arg);
        } else if *arg == "--" {
            literal = true;
        } else if arg.starts_with('-') && arg.len() > 1 {
            flags.push(*arg);
        } else {
            words.push(*arg);
        }
    }
    (flags, words)
}

fn has_flag(flags: &[&str], short: char) -> bool {
    flags
        .iter()
        .any(|f| !f.starts_with("--") && f.chars().skip(1).any(|c| c == short))
}

/// Options shared by useradd, usermod and userdel.
#[derive(Debug, Default)]
struct UserFlags<'a> {
    name: Option<&'a str>,
    uid: Option<&'a str>,
    home: Option<&'a str>,
    shell: Option<&'a str>,
    group: Option<&'a str>,
    groups: Option<&'a str>,
    append: bool,
    move_home: bool,
    remove: bool,
}

fn parse_user_flags<'a>(args: &[&'a str]) -> std::result::Result<UserFlags<'a>, String> {
    let mut flags = UserFlags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "-m" => flags.move_home = true,
            "-a" => flags.append = true,
            "-r" => flags.remove = true,
            "-u" | "-d" | "-s" | "-g" | "-G" => {
                let value = *iter
                    .next()
                    .ok_or_else(|| format!("option requires an argument -- '{}'", &arg[1..]))?;
                match *arg {
                    "-u" => flags.uid = Some(value),
                    "-d" => flags.home = Some(value),
                    "-s" => flags.shell = Some(value),
                    "-g" => flags.group = Some(value),
                    _ => flags.groups = Some(value),
                }
            }
            other if other.starts_with('-') => return Err(format!("invalid option -- '{other}'")),
            other => flags.name = Some(other),
        }
    }
    Ok(flags)
}

impl Distribution {
    fn new(version: u8, running: bool) -> Self {
        let mut nodes = BTreeMap::new();
        for (path, mode) in [
            ("/", 0o755),
            ("/etc", 0o755),
            ("/etc/sudoers.d", 0o750),
            ("/etc/init.d", 0o755),
            ("/home", 0o755),
            ("/root", 0o700),
            ("/tmp", 0o1777),
        ] {
            nodes.insert(path.to_string(), Node::dir(mode));
        }
        let mut users = BTreeMap::new();
        users.insert(
            "root".to_string(),
            Account {
                uid: 0,
                home: "/root".into(),
                shell: "/bin/bash".into(),
                primary: "root".into(),
                groups: BTreeSet::new(),
                password: None,
                locked: true,
            },
        );
        let groups = [("root", 0), ("adm", 4), ("sudo", 27), ("users", 100)]
            .into_iter()
            .map(|(name, gid)| (name.to_string(), gid))
            .collect();
        Self {
            version,
            running,
            install_dir: None,
            nodes,
            links: BTreeMap::new(),
            manager: None,
            installed: BTreeMap::new(),
            available: BTreeMap::new(),
            services: BTreeMap::new(),
            users,
            groups,
            daemon_reloads: 0,
            cache_updates: 0,
        }
    }

    fn next_uid(&self) -> u32 {
        self.users
            .values()
            .map(|u| u.uid)
            .filter(|uid| *uid >= 1000)
            .max()
            .map_or(1000, |uid| uid + 1)
    }

    fn next_gid(&self) -> u32 {
        self.groups
            .values()
            .copied()
            .filter(|gid| *gid >= 1000)
            .max()
            .map_or(1000, |gid| gid + 1)
    }

    fn add_group(&mut self, name: &str, gid: Option<u32>) {
        if self.groups.contains_key(name) {
            return;
        }
        let gid = gid
            .filter(|gid| !self.groups.values().any(|g| g == gid))
            .unwrap_or_else(|| self.next_gid());
        self.groups.insert(name.to_string(), gid);
    }

    /// Follow symbolic links on the whole path.
    fn resolve(&self, path: &str) -> String {
        let mut path = normalize(path);
        for _ in 0..8 {
            match self.links.get(&path) {
                Some(target) => path = normalize(target),
                None => break,
            }
        }
        path
    }

    fn make_dirs(&mut self, path: &str) -> std::result::Result<(), String> {
        let mut current = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.nodes.get(&current) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(format!("cannot create directory '{path}': Not a directory")),
                None => {
                    self.nodes.insert(current.clone(), Node::dir(0o755));
                }
            }
        }
        Ok(())
    }

    fn write(
        &mut self,
        path: &str,
        bytes: &[u8],
        append: bool,
    ) -> std::result::Result<(), String> {
        let path = self.resolve(path);
        let parent = parent_of(&path).unwrap_or("/");
        if !self.nodes.get(parent).is_some_and(Node::is_dir) {
            return Err(format!("sh: 1: cannot create {path}: No such file or directory"));
        }
        match self.nodes.get_mut(&path) {
            Some(Node {
                content: Content::Dir, ..
            }) => Err(format!("sh: 1: cannot create {path}: Is a directory")),
            Some(Node {
                content: Content::File(existing),
                ..
            }) => {
                if !append {
                    existing.clear();
                }
                existing.extend_from_slice(bytes);
                Ok(())
            }
            None => {
                self.nodes.insert(path, Node::file(bytes.to_vec()));
                Ok(())
            }
        }
    }

    fn has_children(&self, path: &str) -> bool {
        self.nodes.keys().any(|k| k != path && is_within(k, path))
    }

    fn remove_tree(&mut self, path: &str) {
        self.nodes.retain(|k, _| !is_within(k, path));
    }

    fn move_tree(&mut self, from: &str, to: &str) {
        let moved: Vec<(String, Node)> = self
            .nodes
            .iter()
            .filter(|(k, _)| is_within(k, from))
            .map(|(k, n)| (format!("{to}{}", &k[from.len()..]), n.clone()))
            .collect();
        self.remove_tree(from);
        self.nodes.extend(moved);
    }

    fn run(&mut self, program: &str, args: &[String], stdin: &[u8]) -> CommandOutput {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match program {
            "true" => respond(0, "", ""),
            "stat" => self.stat(&args),
            "cat" => self.cat(&args),
            "sha256sum" => self.sha256sum(&args),
            "test" => self.test(&args),
            "sh" => self.shell(&args, stdin),
            "mkdir" => self.mkdir(&args),
            "rm" => self.rm(&args),
            "rmdir" => self.rmdir(&args),
            "chmod" => self.chmod(&args),
            "chown" => self.chown(&args),
            "dpkg-query" | "rpm" | "pacman" | "apk" | "apt-get" | "dnf" | "yum" | "zypper" => {
                self.packages(program, &args)
            }
            "systemctl" => self.systemctl(&args),
            "service" => self.service(&args),
            "find" => self.find(&args),
            "update-rc.d" => self.update_rc(&args),
            "getent" => self.getent(&args),
            "id" => self.id(&args),
            "useradd" => self.useradd(&args),
            "usermod" => self.usermod(&args),
            "userdel" => self.userdel(&args),
            "chpasswd" => self.chpasswd(stdin),
            "passwd" => self.passwd(&args),
            _ => not_found(program),
        }
    }

    fn stat(&self, args: &[&str]) -> CommandOutput {
        let (flags, words) = operands(args);
        let Some(path) = words.last() else {
            return respond(1, "", "stat: missing operand\n");
        };
        let dereference = has_flag(&flags, 'L');
        if !dereference && let Some(target) = self.links.get(&normalize(path)) {
            return respond(0, format!("symbolic link|root|root|777|{}\n", target.len()), "");
        }
        match self.nodes.get(&self.resolve(path)) {
            None => respond(
                1,
                "",
                format!("stat: cannot statx '{path}': No such file or directory\n"),
            ),
            Some(node) => {
                let (kind, size) = match &node.content {
                    Content::Dir => ("directory", 4096),
                    Content::File(bytes) if bytes.is_empty() => ("regular empty file", 0),
                    Content::File(bytes) => ("regular file", bytes.len()),
                };
                respond(
                    0,
                    format!("{kind}|{}|{}|{:o}|{size}\n", node.owner, node.group, node.mode),
                    "",
                )
            }
        }
    }

    fn file_bytes(&self, path: &str) -> std::result::Result<&[u8], String> {
        match self.nodes.get(&self.resolve(path)).map(|n| &n.content) {
            Some(Content::File(bytes)) => Ok(bytes),
            Some(Content::Dir) => Err(format!("{path}: Is a directory\n")),
            None => Err(format!("{path}: No such file or directory\n")),
        }
    }

    fn cat(&self, args: &[&str]) -> CommandOutput {
        let (_, words) = operands(args);
        let path = words.last().copied().unwrap_or_default();
        match self.file_bytes(path) {
            Ok(bytes) => respond(0, bytes.to_vec(), ""),
            Err(e) => respond(1, "", format!("cat: {e}")),
        }
    }

    fn sha256sum(&self, args: &[&str]) -> CommandOutput {
        let (_, words) = operands(args);
        let path = words.last().copied().unwrap_or_default();
        match self.file_bytes(path) {
            Ok(bytes) => {
                let digest = checksum::compute_bytes(bytes, ChecksumAlgorithm::Sha256);
                respond(0, format!("{digest}  {path}\n"), "")
            }
            Err(e) => respond(1, "", format!("sha256sum: {e}")),
        }
    }

    fn test(&self, args: &[&str]) -> CommandOutput {
        let [op, path] = args else {
            return respond(2, "", "test: unexpected operator\n");
        };
        let node = self.nodes.get(&self.resolve(path));
        let result = match *op {
            "-e" => node.is_some(),
            "-f" => node.is_some_and(|n| !n.is_dir()),
            "-d" => node.is_some_and(Node::is_dir),
            "-x" => node.is_some_and(|n| n.mode & 0o111 != 0),
            _ => return respond(2, "", "test: unexpected operator\n"),
        };
        respond(if result { 0 } else { 1 }, "", "")
    }

    fn shell(&mut self, args: &[&str], stdin: &[u8]) -> CommandOutput {
        let ["-c", body, _, rest @ ..] = args else {
            return respond(2, "", "sh: unsupported invocation\n");
        };
        let first = rest.first().copied().unwrap_or_default();
        let written = |result: std::result::Result<(), String>| match result {
            Ok(()) => respond(0, "", ""),
            Err(e) => respond(2, "", format!("{e}\n")),
        };
        match *body {
            script::COMMAND_EXISTS => {
                if self.manager.is_some_and(|m| m.binary() == first) {
                    respond(0, format!("/usr/bin/{first}\n"), "")
                } else {
                    respond(1, "", "")
                }
            }
            script::WRITE => written(self.write(first, stdin, false)),
            script::APPEND => written(self.write(first, stdin, true)),
            script::SUDOERS => {
                let result = self.write(first, stdin, false);
                let resolved = self.resolve(first);
                if let Some(node) = self.nodes.get_mut(&resolved) {
                    node.mode = 0o440;
                }
                written(result)
            }
            script::AUTHORIZED_KEYS => self.authorized_keys(rest, stdin),
            _ => respond(2, "", "sh: unsupported script\n"),
        }
    }

    fn authorized_keys(&mut self, rest: &[&str], stdin: &[u8]) -> CommandOutput {
        let [user, home, ..] = rest else {
            return respond(2, "", "sh: missing arguments\n");
        };
        let ssh = format!("{}/.ssh", normalize(home).trim_end_matches('/'));
        let keys = format!("{ssh}/authorized_keys");
        if let Err(e) = self.make_dirs(&ssh).and_then(|()| self.write(&keys, stdin, false)) {
            return respond(1, "", format!("{e}\n"));
        }
        let Some(primary) = self.users.get(*user).map(|u| u.primary.clone()) else {
            return respond(1, "", format!("chown: invalid user: '{user}:'\n"));
        };
        for path in [&ssh, &keys] {
            if let Some(node) = self.nodes.get_mut(path.as_str()) {
                node.owner = (*user).to_string();
                node.group = primary.clone();
                node.mode = if node.is_dir() { 0o700 } else { 0o600 };
            }
        }
        respond(0, "", "")
    }

    fn mkdir(&mut self, args: &[&str]) -> CommandOutput {
        let (flags, words) = operands(args);
        let parents = has_flag(&flags, 'p');
        for path in words {
            let path = normalize(path);
            match self.nodes.get(&path) {
                Some(node) if parents && node.is_dir() => continue,
                Some(_) => {
                    return respond(
                        1,
                        "",
                        format!("mkdir: cannot create directory '{path}': File exists\n"),
                    );
                }
                None => {}
            }
            if parents {
                if let Err(e) = self.make_dirs(&path) {
                    return respond(1, "", format!("mkdir: {e}\n"));
                }
            } else if parent_of(&path)
                .is_some_and(|p| self.nodes.get(p).is_some_and(Node::is_dir))
            {
                self.nodes.insert(path, Node::dir(0o755));
            } else {
                return respond(
                    1,
                    "",
                    format!("mkdir: cannot create directory '{path}': No such file or directory\n"),
                );
            }
        }
        respond(0, "", "")
    }

    fn rm(&mut self, args: &[&str]) -> CommandOutput {
        let (flags, words) = operands(args);
        let recursive = has_flag(&flags, 'r');
        let force = has_flag(&flags, 'f');
        for path in words {
            let path = normalize(path);
            if self.links.remove(&path).is_some() {
                continue;
            }
            match self.nodes.get(&path) {
                None if force => {}
                None => {
                    return respond(
                        1,
                        "",
                        format!("rm: cannot remove '{path}': No such file or directory\n"),
                    );
                }
                Some(node) if node.is_dir() && !recursive => {
                    return respond(1, "", format!("rm: cannot remove '{path}': Is a directory\n"));
                }
                Some(_) => self.remove_tree(&path),
            }
        }
        respond(0, "", "")
    }

    fn rmdir(&mut self, args: &[&str]) -> CommandOutput {
        let (_, words) = operands(args);
        for path in words {
            let path = normalize(path);
            match self.nodes.get(&path) {
                None => {
                    return respond(
                        1,
                        "",
                        format!("rmdir: failed to remove '{path}': No such file or directory\n"),
                    );
                }
                Some(node) if !node.is_dir() => {
                    return respond(
                        1,
                        "",
                        format!("rmdir: failed to remove '{path}': Not a directory\n"),
                    );
                }
                Some(_) if self.has_children(&path) => {
                    return respond(
                        1,
                        "",
                        format!("rmdir: failed to remove '{path}': Directory not empty\n"),
                    );
                }
                Some(_) => {
                    self.nodes.remove(&path);
                }
            }
        }
        respond(0, "", "")
    }

    fn chmod(&mut self, args: &[&str]) -> CommandOutput {
        let (_, words) = operands(args);
        let [mode, paths @ ..] = words.as_slice() else {
            return respond(1, "", "chmod: missing operand\n");
        };
        let Ok(mode) = parse_mode(mode) else {
            return respond(1, "", format!("chmod: invalid mode: '{mode}'\n"));
        };
        for path in paths {
            let resolved = self.resolve(path);
            match self.nodes.get_mut(&resolved) {
                Some(node) => node.mode = mode,
                None => {
                    return respond(
                        1,
                        "",
                        format!("chmod: cannot access '{path}': No such file or directory\n"),
                    );
                }
            }
        }
        respond(0, "", "")
    }

    fn chown(&mut self, args: &[&str]) -> CommandOutput {
        let (flags, words) = operands(args);
        let recursive = has_flag(&flags, 'R');
        let [owner, paths @ ..] = words.as_slice() else {
            return respond(1, "", "chown: missing operand\n");
        };
        let (user, group) = match owner.split_once(':') {
            Some((user, "")) => (user, self.users.get(user).map(|u| u.primary.clone())),
            Some((user, group)) => (user, Some(group.to_string())),
            None => (*owner, None),
        };
        if !self.users.contains_key(user) {
            return respond(1, "", format!("chown: invalid user: '{owner}'\n"));
        }
        if let Some(group) = &group
            && !self.groups.contains_key(group)
        {
            return respond(1, "", format!("chown: invalid group: '{owner}'\n"));
        }
        for path in paths {
            let path = self.resolve(path);
            if !self.nodes.contains_key(&path) {
                return respond(
                    1,
                    "",
                    format!("chown: cannot access '{path}': No such file or directory\n"),
                );
            }
            for (key, node) in self.nodes.iter_mut() {
                if *key == path || (recursive && is_within(key, &path)) {
                    node.owner = user.to_string();
                    if let Some(group) = &group {
                        node.group = group.clone();
                    }
                }
            }
        }
        respond(0, "", "")
    }

    fn split_package(&self, spec: &str, manager: PackageManager) -> (String, Option<String>) {
        match manager {
            PackageManager::Pacman => (spec.to_string(), None),
            PackageManager::Dnf | PackageManager::Yum => {
                if self.available.contains_key(spec) || self.installed.contains_key(spec) {
                    return (spec.to_string(), None);
                }
                self.available
                    .keys()
                    .chain(self.installed.keys())
                    .find_map(|name| {
                        let version = spec.strip_prefix(name.as_str())?.strip_prefix('-')?;
                        (!version.is_empty()).then(|| (name.clone(), Some(version.to_string())))
                    })
                    .unwrap_or_else(|| (spec.to_string(), None))
            }
            _ => match spec.split_once('=') {
                Some((name, version)) => (name.to_string(), Some(version.to_string())),
                None => (spec.to_string(), None),
            },
        }
    }

    fn install(&mut self, manager: PackageManager, specs: &[&str]) -> CommandOutput {
        for spec in specs {
            let (name, version) = self.split_package(spec, manager);
            let Some(version) = version.or_else(|| self.available.get(&name).cloned()) else {
                let (code, message) = match manager {
                    PackageManager::Apt => (100, format!("E: Unable to locate package {name}")),
                    PackageManager::Dnf | PackageManager::Yum => {
                        (1, format!("No match for argument: {name}"))
                    }
                    PackageManager::Zypper => (104, format!("No provider of '{name}' found.")),
                    PackageManager::Pacman => (1, format!("error: target not found: {name}")),
                    PackageManager::Apk => (
                        1,
                        format!("ERROR: unable to select packages:\n  {name} (no such package)"),
                    ),
                };
                return respond(code, "", format!("{message}\n"));
            };
            self.installed.insert(name, version);
        }
        respond(0, "", "")
    }

    fn uninstall(&mut self, names: &[&str]) -> CommandOutput {
        for name in names {
            self.installed.remove(*name);
        }
        respond(0, "", "")
    }

    fn refresh(&mut self) -> CommandOutput {
        self.cache_updates += 1;
        respond(0, "", "")
    }

    fn packages(&mut self, program: &str, args: &[&str]) -> CommandOutput {
        let Some(manager) = self.manager else {
            return not_found(program);
        };
        let (flags, words) = operands(args);
        let last = words.last().copied().unwrap_or_default();
        match (program, manager) {
            ("dpkg-query", PackageManager::Apt) => match self.installed.get(last) {
                Some(version) => respond(0, format!("install ok installed|{version}"), ""),
                None => respond(1, "", format!("dpkg-query: no packages found matching {last}\n")),
            },
            ("rpm", PackageManager::Dnf | PackageManager::Yum | PackageManager::Zypper) => {
                match self.installed.get(last) {
                    Some(version) => respond(0, version.clone(), ""),
                    None => respond(1, format!("package {last} is not installed\n"), ""),
                }
            }
            ("pacman", PackageManager::Pacman) => {
                if flags.contains(&"-Q") {
                    return match self.installed.get(last) {
                        Some(version) => respond(0, format!("{last} {version}\n"), ""),
                        None => respond(1, "", format!("error: package '{last}' was not found\n")),
                    };
                }
                if flags.contains(&"-Sy") {
                    self.cache_updates += 1;
                }
                if flags.contains(&"-R") {
                    self.uninstall(&words)
                } else if words.is_empty() {
                    respond(0, "", "")
                } else {
                    self.install(manager, &words)
                }
            }
            ("apk", PackageManager::Apk) => match words.split_first() {
                Some((&"list", _)) => match self.installed.get(last) {
                    Some(version) => respond(
                        0,
                        format!("{last}-{version} x86_64 {{{last}}} (MIT) [installed]\n"),
                        "",
                    ),
                    None => respond(0, "", ""),
                },
                Some((&"update", _)) => self.refresh(),
                Some((&"add", names)) => self.install(manager, names),
                Some((&"del", names)) => self.uninstall(names),
                _ => respond(1, "", "apk: unsupported command\n"),
            },
            (binary, _) if binary == manager.binary() => match words.split_first() {
                Some((&("update" | "makecache" | "refresh"), _)) => self.refresh(),
                Some((&"install", names)) => self.install(manager, names),
                Some((&"remove", names)) => self.uninstall(names),
                _ => respond(1, "", format!("{binary}: unsupported command\n")),
            },
            _ => not_found(program),
        }
    }

    fn systemctl(&mut self, args: &[&str]) -> CommandOutput {
        let (_, words) = operands(args);
        match words.as_slice() {
            ["daemon-reload"] => {
                self.daemon_reloads += 1;
                respond(0, "", "")
            }
            ["is-active", name] => match self.services.get(*name) {
                Some(s) if s.running => respond(0, "active\n", ""),
                Some(_) => respond(3, "inactive\n", ""),
                None => respond(4, "inactive\n", ""),
            },
            ["is-enabled", name] => match self.services.get(*name) {
                Some(s) if s.enabled => respond(0, "enabled\n", ""),
                Some(_) => respond(1, "disabled\n", ""),
                None => respond(
                    4,
                    "",
                    format!("Failed to get unit file state for {name}.service: No such file or directory\n"),
                ),
            },
            [action @ ("start" | "stop" | "enable" | "disable"), name] => {
                let Some(service) = self.services.get_mut(*name) else {
                    return respond(
                        5,
                        "",
                        format!("Failed to {action} {name}.service: Unit {name}.service not found.\n"),
                    );
                };
                match *action {
                    "start" => service.running = true,
                    "stop" => service.running = false,
                    "enable" => service.enabled = true,
                    _ => service.enabled = false,
                }
                respond(0, "", "")
            }
            _ => respond(1, "", "Unknown command verb.\n"),
        }
    }

    fn service(&mut self, args: &[&str]) -> CommandOutput {
        let [name, action] = args else {
            return respond(
                1,
                "",
                "Usage: service < option > | --status-all | [ service_name [ command | --full-restart ] ]\n",
            );
        };
        let Some(service) = self.services.get_mut(*name) else {
            return respond(1, "", format!("{name}: unrecognized service\n"));
        };
        match *action {
            "status" if service.running => respond(0, format!(" * {name} is running\n"), ""),
            "status" => respond(3, format!(" * {name} is not running\n"), ""),
            "start" => {
                service.running = true;
                respond(0, "", "")
            }
            "stop" => {
                service.running = false;
                respond(0, "", "")
            }
            _ => respond(1, "", format!("{name}: unsupported action {action}\n")),
        }
    }

    fn find(&self, args: &[&str]) -> CommandOutput {
        let [dir, "-name", pattern] = args else {
            return respond(1, "", "find: unsupported expression\n");
        };
        let runlevel = dir.strip_prefix("/etc/rc").and_then(|r| r.strip_suffix(".d"));
        let name = pattern.strip_prefix("S??");
        match (runlevel, name) {
            (Some(runlevel), Some(name)) => {
                let linked = self
                    .services
                    .get(name)
                    .is_some_and(|s| s.runlevels.contains(runlevel));
                if linked {
                    respond(0, format!("{dir}/S01{name}\n"), "")
                } else {
                    respond(0, "", "")
                }
            }
            _ => respond(1, "", format!("find: '{dir}': No such file or directory\n")),
        }
    }

    fn update_rc(&mut self, args: &[&str]) -> CommandOutput {
        let [name, action, runlevel] = args else {
            return respond(1, "", "update-rc.d: error: usage\n");
        };
        let Some(service) = self.services.get_mut(*name) else {
            return respond(
                1,
                "",
                format!("update-rc.d: error: cannot find a LSB script for {name}\n"),
            );
        };
        match *action {
            "enable" => {
                service.runlevels.insert((*runlevel).to_string());
            }
            "disable" => {
                service.runlevels.remove(*runlevel);
            }
            _ => return respond(1, "", format!("update-rc.d: error: unknown action {action}\n")),
        }
        respond(0, "", "")
    }

    fn getent(&self, args: &[&str]) -> CommandOutput {
        let ["passwd", name] = args else {
            return respond(1, "", "Unknown database\n");
        };
        match self.users.get(*name) {
            Some(u) => {
                let gid = self.groups.get(&u.primary).copied().unwrap_or(u.uid);
                respond(0, format!("{name}:x:{}:{gid}::{}:{}\n", u.uid, u.home, u.shell), "")
            }
            None => respond(2, "", ""),
        }
    }

    fn id(&self, args: &[&str]) -> CommandOutput {
        let [flag, name] = args else {
            return respond(1, "", "id: extra operand\n");
        };
        let Some(user) = self.users.get(*name) else {
            return respond(1, "", format!("id: '{name}': no such user\n"));
        };
        match *flag {
            "-gn" => respond(0, format!("{}\n", user.primary), ""),
            "-Gn" => {
                let mut names = vec![user.primary.as_str()];
                names.extend(user.groups.iter().map(String::as_str).filter(|g| *g != user.primary));
                respond(0, format!("{}\n", names.join(" ")), "")
            }
            _ => respond(1, "", format!("id: invalid option -- '{flag}'\n")),
        }
    }

    fn check_groups(&self, list: &str) -> std::result::Result<BTreeSet<String>, String> {
        list.split(',')
            .filter(|g| !g.is_empty())
            .map(|g| {
                if self.groups.contains_key(g) {
                    Ok(g.to_string())
                } else {
                    Err(format!("group '{g}' does not exist"))
                }
            })
            .collect()
    }

    fn useradd(&mut self, args: &[&str]) -> CommandOutput {
        let flags = match parse_user_flags(args) {
            Ok(flags) => flags,
            Err(e) => return respond(2, "", format!("useradd: {e}\n")),
        };
        let Some(name) = flags.name else {
            return respond(2, "", "useradd: missing user name\n");
        };
        if self.users.contains_key(name) {
            return respond(9, "", format!("useradd: user '{name}' already exists\n"));
        }
        let uid = match flags.uid.map(str::parse::<u32>) {
            None => self.next_uid(),
            Some(Ok(uid)) if self.users.values().any(|u| u.uid == uid) => {
                return respond(4, "", format!("useradd: UID {uid} is not unique\n"));
            }
            Some(Ok(uid)) => uid,
            Some(Err(_)) => return respond(3, "", "useradd: invalid user ID\n"),
        };
        let groups = match flags.groups.map(|list| self.check_groups(list)).transpose() {
            Ok(groups) => groups.unwrap_or_default(),
            Err(e) => return respond(6, "", format!("useradd: {e}\n")),
        };
        let primary = match flags.group {
            Some(group) if !self.groups.contains_key(group) => {
                return respond(6, "", format!("useradd: group '{group}' does not exist\n"));
            }
            Some(group) => group.to_string(),
            None => {
                if self.groups.contains_key(name) {
                    return respond(9, "", format!("useradd: group {name} exists - use -g\n"));
                }
                self.add_group(name, Some(uid));
                name.to_string()
            }
        };
        let home = flags.home.map_or_else(|| format!("/home/{name}"), normalize);
        if flags.move_home && !self.nodes.contains_key(&home) {
            if let Err(e) = self.make_dirs(&home) {
                return respond(12, "", format!("useradd: {e}\n"));
            }
            if let Some(node) = self.nodes.get_mut(&home) {
                node.owner = name.to_string();
                node.group = primary.clone();
                node.mode = 0o750;
            }
        }
        self.users.insert(
            name.to_string(),
            Account {
                uid,
                home,
                shell: flags.shell.unwrap_or("/bin/sh").to_string(),
                primary,
                groups,
                password: None,
                locked: true,
            },
        );
        respond(0, "", "")
    }

    fn usermod(&mut self, args: &[&str]) -> CommandOutput {
        let flags = match parse_user_flags(args) {
            Ok(flags) => flags,
            Err(e) => return respond(2, "", format!("usermod: {e}\n")),
        };
        let Some(name) = flags.name else {
            return respond(2, "", "usermod: missing user name\n");
        };
        let Some(mut account) = self.users.get(name).cloned() else {
            return respond(6, "", format!("usermod: user '{name}' does not exist\n"));
        };

        if let Some(uid) = flags.uid {
            match uid.parse::<u32>() {
                Ok(uid) if self.users.iter().any(|(n, u)| n != name && u.uid == uid) => {
                    return respond(4, "", format!("usermod: UID '{uid}' already exists\n"));
                }
                Ok(uid) => account.uid = uid,
                Err(_) => return respond(3, "", format!("usermod: invalid user ID '{uid}'\n")),
            }
        }
        if let Some(group) = flags.group {
            if !self.groups.contains_key(group) {
                return respond(6, "", format!("usermod: group '{group}' does not exist\n"));
            }
            account.primary = group.to_string();
        }
        if let Some(list) = flags.groups {
            match self.check_groups(list) {
                Ok(groups) if flags.append => account.groups.extend(groups),
                Ok(groups) => account.groups = groups,
                Err(e) => return respond(6, "", format!("usermod: {e}\n")),
            }
        }
        if let Some(shell) = flags.shell {
            account.shell = shell.to_string();
        }
        if let Some(home) = flags.home {
            let home = normalize(home);
            if flags.move_home && home != account.home && self.nodes.contains_key(&account.home) {
                if self.nodes.contains_key(&home) {
                    return respond(12, "", format!("usermod: directory {home} exists\n"));
                }
                let old = account.home.clone();
                self.move_tree(&old, &home);
            }
            account.home = home;
        }
        self.users.insert(name.to_string(), account);
        respond(0, "", "")
    }

    fn userdel(&mut self, args: &[&str]) -> CommandOutput {
        let flags = match parse_user_flags(args) {
            Ok(flags) => flags,
            Err(e) => return respond(2, "", format!("userdel: {e}\n")),
        };
        let Some(name) = flags.name else {
            return respond(2, "", "userdel: missing user name\n");
        };
        let Some(account) = self.users.remove(name) else {
            return respond(6, "", format!("userdel: user '{name}' does not exist\n"));
        };
        if flags.remove {
            self.remove_tree(&account.home);
        }
        if account.primary == name && !self.users.values().any(|u| u.primary == name) {
            self.groups.remove(name);
        }
        respond(0, "", "")
    }

    fn chpasswd(&mut self, stdin: &[u8]) -> CommandOutput {
        let text = String::from_utf8_lossy(stdin);
        for (number, line) in text.lines().filter(|l| !l.is_empty()).enumerate() {
            let Some((name, hash)) = line.split_once(':') else {
                return respond(
                    1,
                    "",
                    format!("chpasswd: line {}: missing new password\n", number + 1),
                );
            };
            let Some(account) = self.users.get_mut(name) else {
                return respond(
                    1,
                    "",
                    format!("chpasswd: line {}: user '{name}' does not exist\n", number + 1),
                );
            };
            account.password = Some(hash.to_string());
            account.locked = false;
        }
        respond(0, "", "")
    }

    fn passwd(&mut self, args: &[&str]) -> CommandOutput {
        let ["-d", name] = args else {
            return respond(2, "", "passwd: unsupported options\n");
        };
        let Some(account) = self.users.get_mut(*name) else {
            return respond(1, "", format!("passwd: user '{name}' does not exist\n"));
        };
        account.password = None;
        account.locked = false;
        respond(0, format!("passwd: password changed for {name}\n"), "")
    }
}

impl HostState {
    fn key(&self, name: &str) -> Option<String> {
        self.distributions
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn find(&self, name: &str) -> Option<&Distribution> {
        self.key(name).and_then(|k| self.distributions.get(&k))
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Distribution> {
        let key = self.key(name)?;
        self.distributions.get_mut(&key)
    }

    fn register(&mut self, name: &str, distribution: Distribution) {
        self.distributions.insert(name.to_string(), distribution);
        if self.default.is_none() {
            self.default = Some(name.to_string());
        }
    }

    fn run_host(&mut self, program: &str, args: &[String]) -> CommandOutput {
        if program != WSL_EXE {
            return not_found(program);
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--list", "--verbose"] => self.list(),
            ["--install", "--distribution", name, rest @ ..] => {
                if self.key(name).is_some() {
                    return respond(-1, "", ALREADY_EXISTS);
                }
                let running = !rest.contains(&"--no-launch");
                let mut distribution = Distribution::new(2, running);
                distribution.manager = Some(PackageManager::Apt);
                self.register(name, distribution);
                respond(0, utf16(&format!("{name} has been installed.\r\n")), "")
            }
            ["--import", name, dir, source, rest @ ..] => self.import(name, dir, source, rest),
            ["--unregister", name] => {
                let Some(key) = self.key(name) else {
                    return respond(-1, "", NO_SUCH_DISTRIBUTION);
                };
                self.distributions.remove(&key);
                if self.default.as_deref() == Some(key.as_str()) {
                    self.default = self.distributions.keys().next().cloned();
                }
                respond(0, utf16("Unregistering.\r\n"), "")
            }
            ["--terminate", name] => match self.find_mut(name) {
                Some(d) => {
                    d.running = false;
                    respond(0, "", "")
                }
                None => respond(-1, "", NO_SUCH_DISTRIBUTION),
            },
            ["--set-version", name, version] => {
                let Ok(version @ (1 | 2)) = version.parse::<u8>() else {
                    return respond(-1, "", "Invalid command line argument.");
                };
                match self.find_mut(name) {
                    Some(d) if d.version == version => {
                        respond(-1, "", "The distribution is already the requested version.")
                    }
                    Some(d) => {
                        d.version = version;
                        d.running = false;
                        respond(0, utf16("The conversion is complete.\r\n"), "")
                    }
                    None => respond(-1, "", NO_SUCH_DISTRIBUTION),
                }
            }
            _ => respond(-1, "", "Invalid command line argument."),
        }
    }

    fn list(&self) -> CommandOutput {
        if self.distributions.is_empty() {
            return respond(
                -1,
                utf16("Windows Subsystem for Linux has no installed distributions.\r\n"),
                "",
            );
        }
        let mut text = String::from("  NAME            STATE           VERSION\r\n");
        for (name, d) in &self.distributions {
            let marker = if self.default.as_deref() == Some(name.as_str()) { '*' } else { ' ' };
            let state = if d.running { "Running" } else { "Stopped" };
            text.push_str(&format!("{marker} {name:<15} {state:<15} {}\r\n", d.version));
        }
        respond(0, utf16(&text), "")
    }

    fn import(&mut self, name: &str, dir: &str, source: &str, rest: &[&str]) -> CommandOutput {
        if self.key(name).is_some() {
            return respond(-1, "", ALREADY_EXISTS);
        }
        if !Path::new(source).is_file() {
            return respond(-1, "", "The system cannot find the file specified.");
        }
        let version = rest
            .iter()
            .position(|a| *a == "--version")
            .and_then(|i| rest.get(i + 1))
            .map_or(Ok(2), |v| v.parse::<u8>());
        let Ok(version @ (1 | 2)) = version else {
            return respond(-1, "", "Invalid command line argument.");
        };
        let mut distribution = Distribution::new(version, false);
        distribution.install_dir = Some(dir.to_string());
        distribution.manager = Some(PackageManager::Apt);
        self.register(name, distribution);
        respond(0, utf16("The operation completed successfully.\r\n"), "")
    }
}

impl FakeHost {
    /// A host with no distributions.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a registered distribution; no-op otherwise.
    fn edit(self, distribution: &str, f: impl FnOnce(&mut Distribution)) -> Self {
        if let Some(d) = self.lock().find_mut(distribution) {
            f(d);
        }
        self
    }

    fn read<T>(&self, distribution: &str, f: impl FnOnce(&Distribution) -> Option<T>) -> Option<T> {
        self.lock().find(distribution).and_then(f)
    }

    /// Register a distribution. The first one registered is the default.
    pub fn with_distribution(self, name: &str, version: u8, running: bool) -> Self {
        self.lock().register(name, Distribution::new(version, running));
        self
    }

    /// Add a root-owned file, creating its parent directories.
    pub fn with_file(self, distribution: &str, path: &str, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        self.edit(distribution, |d| {
            let path = normalize(path);
            if let Some(parent) = parent_of(&path) {
                let _ = d.make_dirs(parent);
            }
            d.nodes.insert(path, Node::file(content));
        })
    }

    /// Add a symbolic link at `path` pointing to the absolute `target`.
    pub fn with_symlink(self, distribution: &str, path: &str, target: &str) -> Self {
        self.edit(distribution, |d| {
            d.links.insert(normalize(path), normalize(target));
        })
    }

    pub fn with_directory(self, distribution: &str, path: &str) -> Self {
        self.edit(distribution, |d| {
            let _ = d.make_dirs(&normalize(path));
        })
    }

    pub fn with_package_manager(self, distribution: &str, manager: PackageManager) -> Self {
        self.edit(distribution, |d| d.manager = Some(manager))
    }

    /// Mark a package installed at `version`.
    pub fn with_package(self, distribution: &str, name: &str, version: &str) -> Self {
        self.edit(distribution, |d| {
            d.installed.insert(name.to_string(), version.to_string());
            d.available
                .entry(name.to_string())
                .or_insert_with(|| version.to_string());
        })
    }

    /// Make a package installable; `version` is what an unpinned install gets.
    pub fn with_available_package(self, distribution: &str, name: &str, version: &str) -> Self {
        self.edit(distribution, |d| {
            d.available.insert(name.to_string(), version.to_string());
        })
    }

    /// Add a systemd unit.
    pub fn with_service(
        self,
        distribution: &str,
        name: &str,
        running: bool,
        enabled: bool,
    ) -> Self {
        self.edit(distribution, |d| {
            d.services.insert(
                name.to_string(),
                Service {
                    running,
                    enabled,
                    runlevels: BTreeSet::new(),
                },
            );
        })
    }

    /// Add a sysvinit script linked into `runlevels`.
    pub fn with_sysv_service(
        self,
        distribution: &str,
        name: &str,
        running: bool,
        runlevels: &[&str],
    ) -> Self {
        self.edit(distribution, |d| {
            let mut script = Node::file(b"#!/bin/sh\n".to_vec());
            script.mode = 0o755;
            d.nodes.insert(format!("/etc/init.d/{name}"), script);
            d.services.insert(
                name.to_string(),
                Service {
                    running,
                    enabled: false,
                    runlevels: runlevels.iter().map(|r| (*r).to_string()).collect(),
                },
            );
        })
    }

    /// Add a user with a personal group and a home under `/home`.
    /// Supplementary groups are created when missing.
    pub fn with_user(self, distribution: &str, name: &str, uid: u32, groups: &[&str]) -> Self {
        self.edit(distribution, |d| {
            d.add_group(name, Some(uid));
            for group in groups {
                d.add_group(group, None);
            }
            let home = format!("/home/{name}");
            let _ = d.make_dirs(&home);
            if let Some(node) = d.nodes.get_mut(&home) {
                node.owner = name.to_string();
                node.group = name.to_string();
                node.mode = 0o750;
            }
            d.users.insert(
                name.to_string(),
                Account {
                    uid,
                    home,
                    shell: "/bin/bash".into(),
                    primary: name.to_string(),
                    groups: groups.iter().map(|g| (*g).to_string()).collect(),
                    password: None,
                    locked: true,
                },
            );
        })
    }

    pub fn with_group(self, distribution: &str, name: &str) -> Self {
        self.edit(distribution, |d| d.add_group(name, None))
    }

    /// Fail every command whose command line starts with `prefix`.
    pub fn fail_on(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.inject(prefix, code, stderr, false);
        self
    }

    /// Fail the next command whose command line starts with `prefix`.
    pub fn fail_once(self, prefix: &str, code: i32, stderr: &str) -> Self {
        self.inject(prefix, code, stderr, true);
        self
    }

    /// Inject a failure into an already shared host.
    pub fn inject(&self, prefix: &str, code: i32, stderr: &str, once: bool) {
        self.lock().failures.push(Failure {
            prefix: prefix.to_string(),
            code,
            stderr: stderr.to_string(),
            once,
        });
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn count_invocations(&self, predicate: impl Fn(&Invocation) -> bool) -> usize {
        self.lock().invocations.iter().filter(|&inv| predicate(inv)).count()
    }

    pub fn clear_invocations(&self) {
        self.lock().invocations.clear();
    }

    pub fn distribution_names(&self) -> Vec<String> {
        self.lock().distributions.keys().cloned().collect()
    }

    pub fn default_distribution(&self) -> Option<String> {
        self.lock().default.clone()
    }

    pub fn is_registered(&self, distribution: &str) -> bool {
        self.lock().find(distribution).is_some()
    }

    pub fn is_running(&self, distribution: &str) -> bool {
        self.read(distribution, |d| Some(d.running)).unwrap_or(false)
    }

    pub fn set_running(&self, distribution: &str, running: bool) {
        if let Some(d) = self.lock().find_mut(distribution) {
            d.running = running;
        }
    }

    pub fn version_of(&self, distribution: &str) -> Option<u8> {
        self.read(distribution, |d| Some(d.version))
    }

    pub fn install_dir(&self, distribution: &str) -> Option<String> {
        self.read(distribution, |d| d.install_dir.clone())
    }

    pub fn path_exists(&self, distribution: &str, path: &str) -> bool {
        self.read(distribution, |d| Some(d.nodes.contains_key(&d.resolve(path))))
            .unwrap_or(false)
    }

    pub fn is_symlink(&self, distribution: &str, path: &str) -> bool {
        self.read(distribution, |d| Some(d.links.contains_key(&normalize(path))))
            .unwrap_or(false)
    }

    pub fn file_content(&self, distribution: &str, path: &str) -> Option<Vec<u8>> {
        self.read(distribution, |d| match &d.nodes.get(&d.resolve(path))?.content {
            Content::File(bytes) => Some(bytes.clone()),
            Content::Dir => None,
        })
    }

    /// Permission bits as four octal digits.
    pub fn file_mode(&self, distribution: &str, path: &str) -> Option<String> {
        self.read(distribution, |d| {
            d.nodes.get(&d.resolve(path)).map(|n| format_mode(n.mode))
        })
    }

    /// Owner and group.
    pub fn file_owner(&self, distribution: &str, path: &str) -> Option<(String, String)> {
        self.read(distribution, |d| {
            d.nodes
                .get(&d.resolve(path))
                .map(|n| (n.owner.clone(), n.group.clone()))
        })
    }

    /// Overwrite or create a file, keeping existing attributes.
    pub fn write_file(&self, distribution: &str, path: &str, content: impl Into<Vec<u8>>) {
        let content = content.into();
        if let Some(d) = self.lock().find_mut(distribution) {
            let _ = d.write(path, &content, false);
        }
    }

    pub fn package_version(&self, distribution: &str, name: &str) -> Option<String> {
        self.read(distribution, |d| d.installed.get(name).cloned())
    }

    pub fn service_running(&self, distribution: &str, name: &str) -> Option<bool> {
        self.read(distribution, |d| d.services.get(name).map(|s| s.running))
    }

    pub fn service_enabled(&self, distribution: &str, name: &str) -> Option<bool> {
        self.read(distribution, |d| d.services.get(name).map(|s| s.enabled))
    }

    /// Runlevels a sysvinit service is linked into.
    pub fn service_runlevels(&self, distribution: &str, name: &str) -> Vec<String> {
        self.read(distribution, |d| {
            d.services.get(name).map(|s| s.runlevels.iter().cloned().collect())
        })
        .unwrap_or_default()
    }

    pub fn user_exists(&self, distribution: &str, name: &str) -> bool {
        self.read(distribution, |d| Some(d.users.contains_key(name)))
            .unwrap_or(false)
    }

    pub fn user_uid(&self, distribution: &str, name: &str) -> Option<u32> {
        self.read(distribution, |d| d.users.get(name).map(|u| u.uid))
    }

    pub fn user_shell(&self, distribution: &str, name: &str) -> Option<String> {
        self.read(distribution, |d| d.users.get(name).map(|u| u.shell.clone()))
    }

    pub fn user_home(&self, distribution: &str, name: &str) -> Option<String> {
        self.read(distribution, |d| d.users.get(name).map(|u| u.home.clone()))
    }

    /// Supplementary groups, sorted.
    pub fn user_groups(&self, distribution: &str, name: &str) -> Vec<String> {
        self.read(distribution, |d| {
            d.users.get(name).map(|u| u.groups.iter().cloned().collect())
        })
        .unwrap_or_default()
    }

    /// Password hash set through `chpasswd -e`.
    pub fn user_password(&self, distribution: &str, name: &str) -> Option<String> {
        self.read(distribution, |d| d.users.get(name)?.password.clone())
    }

    /// Whether the account still has the locked password `useradd` gives it.
    pub fn user_locked(&self, distribution: &str, name: &str) -> bool {
        self.read(distribution, |d| d.users.get(name).map(|u| u.locked))
            .unwrap_or(false)
    }

    pub fn group_exists(&self, distribution: &str, name: &str) -> bool {
        self.read(distribution, |d| Some(d.groups.contains_key(name)))
            .unwrap_or(false)
    }

    pub fn daemon_reloads(&self, distribution: &str) -> usize {
        self.read(distribution, |d| Some(d.daemon_reloads)).unwrap_or(0)
    }

    pub fn cache_updates(&self, distribution: &str) -> usize {
        self.read(distribution, |d| Some(d.cache_updates)).unwrap_or(0)
    }
}

impl CommandExecutor for FakeHost {
    fn spawn(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.invocations.push(Invocation {
            target: target.clone(),
            program: command.program.clone(),
            args: command.args.clone(),
            env: command.env.clone(),
            stdin: command.stdin.clone(),
        });

        let line = command.display();
        if let Some(index) = state.failures.iter().position(|f| line.starts_with(&f.prefix)) {
            let failure = if state.failures[index].once {
                state.failures.remove(index)
            } else {
                state.failures[index].clone()
            };
            return Ok(respond(failure.code, "", failure.stderr));
        }

        let stdin = command.stdin.as_ref().map(Input::as_bytes).unwrap_or_default();
        Ok(match target {
            TargetEnvironment::Host => state.run_host(&command.program, &command.args),
            TargetEnvironment::Distribution(name) => match state.find_mut(name) {
                None => respond(-1, "", NO_SUCH_DISTRIBUTION),
                Some(distribution) => {
                    // Any command starts a stopped distribution
                    distribution.running = true;
                    distribution.run(&command.program, &command.args, stdin)
                }
            },
        })
    }
}

//! Files and directories inside a distribution.

use std::borrow::Cow;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::desired::{FileEnsure, FileSpec};
use crate::driver::{DriverContext, ResourceDriver, guest, script, snapshot_mismatch};
use crate::error::{Error, Result};
use crate::observed::{FileKind, FileState, ObservedState, format_mode, parse_mode};
use crate::plan::{Operation, Plan};
use crate::target::TargetEnvironment;

#[derive(Debug)]
pub struct FileDriver<'a> {
    spec: &'a FileSpec,
}

impl<'a> FileDriver<'a> {
    pub fn new(spec: &'a FileSpec) -> Self {
        Self { spec }
    }

    fn path(&self) -> &str {
        &self.spec.path
    }

    fn plan_removal(&self, ctx: &DriverContext<'_>, current: &FileState, plan: &mut Plan) {
        if !current.exists {
            return;
        }
        let path = self.path();
        let target = guest(&self.spec.distribution);

        let command = if current.kind == Some(FileKind::Directory) && !self.spec.recursive {
            ctx.command("rmdir").args(["--", path])
        } else {
            let mut command = ctx.command("rm");
            if current.kind == Some(FileKind::Directory) {
                command = command.arg("-r");
            }
            if self.spec.force {
                command = command.arg("-f");
            }
            command.args(["--", path])
        };
        plan.push(Operation::command(format!("remove {path}"), &target, command));
    }

    fn plan_directory(
        &self,
        ctx: &DriverContext<'_>,
        current: &FileState,
        plan: &mut Plan,
    ) -> Result<()> {
        let path = self.path();
        let target = guest(&self.spec.distribution);

        if current.exists && current.kind != Some(FileKind::Directory) {
            return Err(Error::spec(format!("{path} exists and is not a directory")));
        }
        if !current.exists {
            let mut command = ctx.command("mkdir");
            if self.spec.recursive {
                command = command.arg("-p");
            }
            plan.push(Operation::command(
                format!("create directory {path}"),
                &target,
                command.args(["--", path]),
            ));
        }
        self.plan_attributes(ctx, current, &target, plan)
    }

    fn plan_file(
        &self,
        ctx: &DriverContext<'_>,
        current: &FileState,
        plan: &mut Plan,
    ) -> Result<()> {
        let path = self.path();
        let target = guest(&self.spec.distribution);

        if current.kind == Some(FileKind::Directory) {
            return Err(Error::spec(format!("{path} is a directory")));
        }

        if !current.exists {
            if self.spec.recursive
                && let Some(parent) = parent_dir(path)
            {
                plan.push(Operation::command(
                    format!("create directory {parent}"),
                    &target,
                    ctx.command("mkdir").args(["-p", "--", parent]),
                ));
            }
            let content = self.spec.content.clone().unwrap_or_default();
            plan.push(Operation::command(
                format!("create {path}"),
                &target,
                ctx.script(script::WRITE, [path]).stdin(content),
            ));
        } else if let Some(content) = &self.spec.content {
            if self.spec.append {
                // Large or non-UTF-8 files are not in the snapshot
                let existing: Cow<'_, [u8]> = match &current.content {
                    Some(text) => Cow::Borrowed(text.as_bytes()),
                    None => Cow::Owned(ctx.inspector.read_file(&self.spec.distribution, path)?),
                };
                if !contains_bytes(&existing, content.as_bytes()) {
                    plan.push(Operation::command(
                        format!("append to {path}"),
                        &target,
                        ctx.script(script::APPEND, [path]).stdin(content.clone()),
                    ));
                }
            } else {
                let wanted = checksum::compute_bytes(content.as_bytes(), ChecksumAlgorithm::Sha256);
                if current.checksum.as_deref() != Some(wanted.as_str()) {
                    plan.push(Operation::command(
                        format!("write content of {path}"),
                        &target,
                        ctx.script(script::WRITE, [path]).stdin(content.clone()),
                    ));
                }
            }
        }

        self.plan_attributes(ctx, current, &target, plan)
    }

    /// Mode and ownership, each compared on its own.
    fn plan_attributes(
        &self,
        ctx: &DriverContext<'_>,
        current: &FileState,
        target: &TargetEnvironment,
        plan: &mut Plan,
    ) -> Result<()> {
        let path = self.path();
        let created = !current.exists;

        if let Some(mode) = &self.spec.mode {
            let wanted = parse_mode(mode)?;
            let actual = current.mode.as_deref().and_then(|m| parse_mode(m).ok());
            if created || actual != Some(wanted) {
                let mode = format_mode(wanted);
                plan.push(Operation::command(
                    format!("set mode of {path} to {mode}"),
                    target,
                    ctx.command("chmod").args([mode.as_str(), "--", path]),
                ));
            }
        }

        if let Some((user, group)) = self.spec.owner_parts() {
            let user_differs = current.owner.as_deref() != Some(user);
            let group_differs = group.is_some_and(|g| current.group.as_deref() != Some(g));
            if created || user_differs || group_differs {
                let owner = match group {
                    Some(group) => format!("{user}:{group}"),
                    None => user.to_string(),
                };
                plan.push(Operation::command(
                    format!("set owner of {path} to {owner}"),
                    target,
                    ctx.command("chown").args([owner.as_str(), "--", path]),
                ));
            }
        }
        Ok(())
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

/// Parent directory, or `None` for top-level paths.
fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

impl ResourceDriver for FileDriver<'_> {
    fn id(&self) -> String {
        format!("file:{}:{}", self.spec.distribution, self.spec.path)
    }

    fn description(&self) -> String {
        match self.spec.state {
            FileEnsure::File => format!("file {} in {}", self.spec.path, self.spec.distribution),
            FileEnsure::Directory => {
                format!("directory {} in {}", self.spec.path, self.spec.distribution)
            }
            FileEnsure::Absent => format!("no {} in {}", self.spec.path, self.spec.distribution),
        }
    }

    fn resource_type(&self) -> &'static str {
        "file"
    }

    fn distribution(&self) -> &str {
        &self.spec.distribution
    }

    fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState> {
        ctx.inspector
            .file(&self.spec.distribution, &self.spec.path)
            .map(ObservedState::File)
    }

    fn default_state(&self) -> ObservedState {
        ObservedState::File(FileState::absent(&self.spec.path))
    }

    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan> {
        let current = observed
            .as_file()
            .ok_or_else(|| snapshot_mismatch(&self.id(), observed))?;
        let mut plan = Plan::new();
        match self.spec.state {
            FileEnsure::Absent => self.plan_removal(ctx, current, &mut plan),
            FileEnsure::Directory => self.plan_directory(ctx, current, &mut plan)?,
            FileEnsure::File => self.plan_file(ctx, current, &mut plan)?,
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeHost;

    fn existing_file(content: &str, mode: &str, owner: &str) -> FileState {
        FileState {
            path: "/etc/motd".into(),
            exists: true,
            kind: Some(FileKind::File),
            owner: Some(owner.into()),
            group: Some(owner.into()),
            mode: Some(mode.into()),
            size: Some(content.len() as u64),
            content: Some(content.into()),
            checksum: Some(checksum::compute_bytes(content.as_bytes(), ChecksumAlgorithm::Sha256)),
        }
    }

    fn plan_for(spec: &FileSpec, current: FileState) -> Result<Plan> {
        let host = FakeHost::new();
        let ctx = DriverContext::new(&host);
        FileDriver::new(spec).plan(&ctx, &ObservedState::File(current))
    }

    #[test]
    fn test_matching_file_needs_nothing() {
        let spec = FileSpec::new("Ubuntu", "/etc/motd")
            .content("hi\n")
            .mode("644")
            .owner("root");
        let plan = plan_for(&spec, existing_file("hi\n", "0644", "root")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_attributes_compared_field_by_field() {
        let spec = FileSpec::new("Ubuntu", "/etc/motd").content("hi\n").mode("0600");
        let plan = plan_for(&spec, existing_file("hi\n", "0644", "root")).unwrap();
        assert_eq!(plan.descriptions(), vec!["set mode of /etc/motd to 0600"]);

        let spec = FileSpec::new("Ubuntu", "/etc/motd").owner("root:adm");
        let plan = plan_for(&spec, existing_file("hi\n", "0644", "root")).unwrap();
        assert_eq!(plan.descriptions(), vec!["set owner of /etc/motd to root:adm"]);
    }

    #[test]
    fn test_content_change_rewrites() {
        let spec = FileSpec::new("Ubuntu", "/etc/motd").content("X");
        let plan = plan_for(&spec, existing_file("Y", "0644", "root")).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.operations()[0].command_line().unwrap(), "sh -c cat > \"$1\" sh /etc/motd");
    }

    #[test]
    fn test_append_skipped_when_present() {
        let mut spec = FileSpec::new("Ubuntu", "/etc/motd").content("line two\n");
        spec.append = true;
        let plan = plan_for(&spec, existing_file("line one\nline two\n", "0644", "root")).unwrap();
        assert!(plan.is_empty());

        let plan = plan_for(&spec, existing_file("line one\n", "0644", "root")).unwrap();
        assert_eq!(plan.descriptions(), vec!["append to /etc/motd"]);
    }

    #[test]
    fn test_new_file_with_parents_and_attributes() {
        let mut spec = FileSpec::new("Ubuntu", "/opt/app/config.toml")
            .content("x = 1\n")
            .mode("600");
        spec.recursive = true;
        let plan = plan_for(&spec, FileState::absent("/opt/app/config.toml")).unwrap();
        assert_eq!(
            plan.descriptions(),
            vec![
                "create directory /opt/app",
                "create /opt/app/config.toml",
                "set mode of /opt/app/config.toml to 0600"
            ]
        );
    }

    #[test]
    fn test_removal_variants() {
        let spec = FileSpec::new("Ubuntu", "/srv/data").state(FileEnsure::Absent);
        assert!(plan_for(&spec, FileState::absent("/srv/data")).unwrap().is_empty());

        let mut dir = FileState::absent("/srv/data");
        dir.exists = true;
        dir.kind = Some(FileKind::Directory);
        let plan = plan_for(&spec, dir.clone()).unwrap();
        assert_eq!(plan.operations()[0].command_line().unwrap(), "rmdir -- /srv/data");

        let mut spec = spec;
        spec.recursive = true;
        spec.force = true;
        let plan = plan_for(&spec, dir).unwrap();
        assert_eq!(plan.operations()[0].command_line().unwrap(), "rm -r -f -- /srv/data");
    }

    #[test]
    fn test_kind_conflicts_are_errors() {
        let spec = FileSpec::new("Ubuntu", "/etc/motd").state(FileEnsure::Directory);
        assert!(plan_for(&spec, existing_file("x", "0644", "root")).is_err());
    }

    #[test]
    fn test_append_reads_bytes_missing_from_snapshot() {
        let host = FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_file("Ubuntu", "/etc/motd", &b"\xff\xfeline\n"[..]);
        let ctx = DriverContext::new(&host);
        let mut current = existing_file("", "0644", "root");
        current.content = None;

        let mut spec = FileSpec::new("Ubuntu", "/etc/motd").content("line\n");
        spec.append = true;
        let plan = FileDriver::new(&spec).plan(&ctx, &ObservedState::File(current.clone()));
        assert!(plan.unwrap().is_empty());

        spec.content = Some("other\n".into());
        let plan = FileDriver::new(&spec).plan(&ctx, &ObservedState::File(current)).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_contains_bytes() {
        assert!(contains_bytes(b"\xffabc", b"abc"));
        assert!(contains_bytes(b"abc", b""));
        assert!(!contains_bytes(b"ab", b"abc"));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/opt/app/config"), Some("/opt/app"));
        assert_eq!(parent_dir("/etc"), None);
    }
}

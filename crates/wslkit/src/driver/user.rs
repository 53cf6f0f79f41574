//! User accounts.
//!
//! Passwords and SSH keys cannot be read back, so they are written on every
//! pass and always count as a change. They only ever reach the target on
//! stdin.

use std::collections::BTreeSet;

use crate::desired::{Presence, UserSpec};
use crate::driver::{DriverContext, ResourceDriver, guest, script, snapshot_mismatch};
use crate::error::{Error, Result};
use crate::inspect::sudoers_path;
use crate::observed::{ObservedState, UserState};
use crate::plan::{Operation, Plan};
use crate::secret::Secret;
use crate::target::TargetEnvironment;

#[derive(Debug)]
pub struct UserDriver<'a> {
    spec: &'a UserSpec,
}

impl<'a> UserDriver<'a> {
    pub fn new(spec: &'a UserSpec) -> Self {
        Self { spec }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    /// Home directory after the plan runs.
    fn home(&self, current: &UserState) -> String {
        self.spec
            .home
            .clone()
            .or_else(|| current.home.clone())
            .unwrap_or_else(|| {
                if self.spec.is_root() {
                    "/root".to_string()
                } else {
                    format!("/home/{}", self.spec.name)
                }
            })
    }

    fn ssh_key(&self) -> Result<Option<Secret>> {
        if let Some(key) = &self.spec.ssh_key {
            return Ok(Some(key.clone()));
        }
        match &self.spec.ssh_key_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|key| Some(Secret::new(key)))
                .map_err(|e| Error::io(path, e)),
            None => Ok(None),
        }
    }

    fn plan_create(&self, ctx: &DriverContext<'_>, target: &TargetEnvironment, plan: &mut Plan) {
        let name = self.name();
        let mut command = ctx.command("useradd").arg("-m");
        if let Some(uid) = self.spec.uid
            && !self.spec.is_root()
        {
            command = command.args(["-u".to_string(), uid.to_string()]);
        }
        if let Some(home) = &self.spec.home {
            command = command.args(["-d", home.as_str()]);
        }
        if let Some(shell) = &self.spec.shell {
            command = command.args(["-s", shell.as_str()]);
        }
        if let Some(group) = &self.spec.group {
            command = command.args(["-g", group.as_str()]);
        }
        if let Some(groups) = self.spec.groups.as_ref().filter(|g| !g.is_empty()) {
            command = command.args(["-G".to_string(), groups.join(",")]);
        }
        plan.push(Operation::command(format!("create user {name}"), target, command.arg(name)));

        // An explicit password wins over the creation-only one
        let password = self.spec.password.as_ref().or(self.spec.initial_password.as_ref());
        match password {
            Some(password) => plan.push(self.set_password(ctx, target, password)),
            None if self.spec.unlock_no_password => plan.push(Operation::command(
                format!("unlock {name}"),
                target,
                ctx.command("passwd").args(["-d", name]),
            )),
            None => {}
        }
    }

    fn plan_modify(
        &self,
        ctx: &DriverContext<'_>,
        current: &UserState,
        target: &TargetEnvironment,
        plan: &mut Plan,
    ) {
        let name = self.name();
        let mut args: Vec<String> = Vec::new();
        let mut changed: Vec<&str> = Vec::new();

        if let Some(uid) = self.spec.uid
            && !self.spec.is_root()
            && current.uid != Some(uid)
        {
            args.extend(["-u".to_string(), uid.to_string()]);
            changed.push("uid");
        }
        if let Some(home) = &self.spec.home
            && current.home.as_deref() != Some(home.as_str())
        {
            args.extend(["-d".to_string(), home.clone(), "-m".to_string()]);
            changed.push("home");
        }
        if let Some(shell) = &self.spec.shell
            && current.shell.as_deref() != Some(shell.as_str())
        {
            args.extend(["-s".to_string(), shell.clone()]);
            changed.push("shell");
        }
        if let Some(group) = &self.spec.group
            && current.primary_group.as_deref() != Some(group.as_str())
        {
            args.extend(["-g".to_string(), group.clone()]);
            changed.push("primary group");
        }
        if !args.is_empty() {
            plan.push(Operation::command(
                format!("update {} of {name}", changed.join(", ")),
                target,
                ctx.command("usermod").args(args).arg(name),
            ));
        }

        if let Some(groups) = &self.spec.groups {
            self.plan_groups(ctx, current, groups, target, plan);
        }

        if let Some(password) = &self.spec.password {
            plan.push(self.set_password(ctx, target, password));
        }
    }

    fn plan_groups(
        &self,
        ctx: &DriverContext<'_>,
        current: &UserState,
        groups: &[String],
        target: &TargetEnvironment,
        plan: &mut Plan,
    ) {
        let name = self.name();
        let primary = current.primary_group.as_deref();
        let have: BTreeSet<&str> = current.groups.iter().map(String::as_str).collect();
        let want: BTreeSet<&str> = groups
            .iter()
            .map(String::as_str)
            .filter(|g| Some(*g) != primary)
            .collect();

        if self.spec.append_groups {
            let missing: Vec<&str> = want.difference(&have).copied().collect();
            if !missing.is_empty() {
                let list = missing.join(",");
                plan.push(Operation::command(
                    format!("add {name} to {list}"),
                    target,
                    ctx.command("usermod").args(["-a", "-G", list.as_str(), name]),
                ));
            }
        } else if want != have {
            let list = want.iter().copied().collect::<Vec<_>>().join(",");
            plan.push(Operation::command(
                format!("set groups of {name} to [{list}]"),
                target,
                ctx.command("usermod").args(["-G", list.as_str(), name]),
            ));
        }
    }

    fn set_password(
        &self,
        ctx: &DriverContext<'_>,
        target: &TargetEnvironment,
        hash: &Secret,
    ) -> Operation {
        let name = self.name();
        let line = Secret::new(format!("{name}:{}\n", hash.expose()));
        Operation::command(
            format!("set password of {name}"),
            target,
            ctx.command("chpasswd").arg("-e").secret_stdin(line),
        )
    }

    fn plan_sudo(
        &self,
        ctx: &DriverContext<'_>,
        current: &UserState,
        target: &TargetEnvironment,
        plan: &mut Plan,
    ) {
        if self.spec.is_root() {
            return;
        }
        let name = self.name();
        let path = sudoers_path(name);
        match self.spec.sudo {
            Some(true) if !current.sudo => plan.push(Operation::command(
                format!("grant sudo to {name}"),
                target,
                ctx.script(script::SUDOERS, [path])
                    .stdin(format!("{name} ALL=(ALL) NOPASSWD:ALL\n")),
            )),
            Some(false) if current.sudo => plan.push(Operation::command(
                format!("revoke sudo from {name}"),
                target,
                ctx.command("rm").args(["-f", "--", path.as_str()]),
            )),
            _ => {}
        }
    }
}

impl ResourceDriver for UserDriver<'_> {
    fn id(&self) -> String {
        format!("user:{}:{}", self.spec.distribution, self.spec.name)
    }

    fn description(&self) -> String {
        format!("user {} in {}", self.spec.name, self.spec.distribution)
    }

    fn resource_type(&self) -> &'static str {
        "user"
    }

    fn distribution(&self) -> &str {
        &self.spec.distribution
    }

    fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState> {
        ctx.inspector
            .user(&self.spec.distribution, &self.spec.name)
            .map(ObservedState::User)
    }

    fn default_state(&self) -> ObservedState {
        ObservedState::User(UserState::absent(&self.spec.name))
    }

    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan> {
        let current = observed
            .as_user()
            .ok_or_else(|| snapshot_mismatch(&self.id(), observed))?;
        let name = self.name();
        let target = guest(&self.spec.distribution);
        let mut plan = Plan::new();

        if self.spec.state == Presence::Absent {
            if current.exists {
                if current.sudo {
                    plan.push(Operation::command(
                        format!("revoke sudo from {name}"),
                        &target,
                        ctx.command("rm").args(["-f", "--", sudoers_path(name).as_str()]),
                    ));
                }
                let mut command = ctx.command("userdel");
                if self.spec.remove_home {
                    command = command.arg("-r");
                }
                plan.push(Operation::command(
                    format!("remove user {name}"),
                    &target,
                    command.arg(name),
                ));
            }
            return Ok(plan);
        }

        if current.exists {
            self.plan_modify(ctx, current, &target, &mut plan);
        } else {
            self.plan_create(ctx, &target, &mut plan);
        }
        self.plan_sudo(ctx, current, &target, &mut plan);

        if let Some(key) = self.ssh_key()? {
            let home = self.home(current);
            plan.push(Operation::command(
                format!("install SSH key for {name}"),
                &target,
                ctx.script(script::AUTHORIZED_KEYS, [name, home.as_str()])
                    .secret_stdin(key),
            ));
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeHost;
    use crate::exec::Input;

    fn alice(groups: &[&str], sudo: bool) -> UserState {
        UserState {
            name: "alice".into(),
            exists: true,
            uid: Some(1000),
            home: Some("/home/alice".into()),
            shell: Some("/bin/bash".into()),
            primary_group: Some("alice".into()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            sudo,
        }
    }

    fn plan_for(spec: &UserSpec, current: UserState) -> Plan {
        let host = FakeHost::new();
        let ctx = DriverContext::new(&host);
        UserDriver::new(spec)
            .plan(&ctx, &ObservedState::User(current))
            .unwrap()
    }

    #[test]
    fn test_create_with_attributes() {
        let mut spec = UserSpec::new("Ubuntu", "alice").groups(["docker"]).sudo(true);
        spec.uid = Some(1500);
        spec.shell = Some("/bin/zsh".into());
        let plan = plan_for(&spec, UserState::absent("alice"));

        assert_eq!(
            plan.operations()[0].command_line().unwrap(),
            "useradd -m -u 1500 -s /bin/zsh -G docker alice"
        );
        assert_eq!(
            plan.descriptions(),
            vec!["create user alice", "unlock alice", "grant sudo to alice"]
        );
    }

    #[test]
    fn test_matching_user_needs_nothing() {
        let spec = UserSpec::new("Ubuntu", "alice").groups(["docker", "sudo"]).sudo(false);
        let plan = plan_for(&spec, alice(&["docker", "sudo"], false));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_append_vs_exact_groups() {
        let mut spec = UserSpec::new("Ubuntu", "alice").groups(["docker"]);
        spec.append_groups = true;
        assert!(plan_for(&spec, alice(&["docker", "video"], false)).is_empty());

        spec.append_groups = false;
        let plan = plan_for(&spec, alice(&["docker", "video"], false));
        assert_eq!(plan.operations()[0].command_line().unwrap(), "usermod -G docker alice");
    }

    #[test]
    fn test_password_is_write_always_and_secret() {
        let mut spec = UserSpec::new("Ubuntu", "alice");
        spec.password = Some(Secret::new("$6$salt$hash"));
        let plan = plan_for(&spec, alice(&[], false));

        assert_eq!(plan.descriptions(), vec!["set password of alice"]);
        let op = &plan.operations()[0];
        assert!(!format!("{op:?}").contains("$6$salt$hash"));
        match &op.kind {
            crate::plan::OperationKind::Command(command) => {
                assert!(matches!(command.stdin, Some(Input::Secret(_))));
                assert_eq!(command.stdin.as_ref().unwrap().as_bytes(), b"alice:$6$salt$hash\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_initial_password_only_on_creation() {
        let mut spec = UserSpec::new("Ubuntu", "alice");
        spec.initial_password = Some(Secret::new("$6$x"));
        assert!(plan_for(&spec, alice(&[], false)).is_empty());
        let plan = plan_for(&spec, UserState::absent("alice"));
        assert_eq!(plan.descriptions(), vec!["create user alice", "set password of alice"]);
    }

    #[test]
    fn test_root_ignores_uid_and_sudo() {
        let mut spec = UserSpec::new("Ubuntu", "root").sudo(true);
        spec.uid = Some(1234);
        let mut root = alice(&[], false);
        root.name = "root".into();
        root.uid = Some(0);
        root.primary_group = Some("root".into());
        assert!(plan_for(&spec, root).is_empty());
    }

    #[test]
    fn test_absent_removes_sudo_then_user() {
        let mut spec = UserSpec::new("Ubuntu", "alice").state(Presence::Absent);
        spec.remove_home = true;
        let plan = plan_for(&spec, alice(&[], true));
        let commands: Vec<String> = plan.iter().filter_map(|op| op.command_line()).collect();
        assert_eq!(commands, vec!["rm -f -- /etc/sudoers.d/alice", "userdel -r alice"]);
    }

    #[test]
    fn test_ssh_key_file_is_read_from_host() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519.pub");
        std::fs::write(&key, "ssh-ed25519 AAAATEST alice@host\n").unwrap();
        let mut spec = UserSpec::new("Ubuntu", "alice");
        spec.ssh_key_file = Some(key);

        let plan = plan_for(&spec, alice(&[], false));
        assert_eq!(plan.descriptions(), vec!["install SSH key for alice"]);
        assert!(!format!("{:?}", plan.operations()[0]).contains("AAAATEST"));

        spec.ssh_key_file = Some(dir.path().join("missing.pub"));
        let host = FakeHost::new();
        let ctx = DriverContext::new(&host);
        let result = UserDriver::new(&spec).plan(&ctx, &ObservedState::User(alice(&[], false)));
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}

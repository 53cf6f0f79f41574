//! Packages, through whichever package manager the distribution has.

use crate::desired::{PackageSpec, Presence};
use crate::driver::{DriverContext, ResourceDriver, guest, snapshot_mismatch};
use crate::error::{Error, Result};
use crate::exec::CommandSpec;
use crate::observed::{ObservedState, PackageManager, PackageState};
use crate::plan::{Operation, Plan};

#[derive(Debug)]
pub struct PackageDriver<'a> {
    spec: &'a PackageSpec,
}

impl<'a> PackageDriver<'a> {
    pub fn new(spec: &'a PackageSpec) -> Self {
        Self { spec }
    }
}

/// Command builders per package manager.
struct Commands<'c> {
    ctx: &'c DriverContext<'c>,
    manager: PackageManager,
}

impl Commands<'_> {
    fn base(&self) -> CommandSpec {
        let command = self.ctx.long_command(self.manager.binary());
        match self.manager {
            PackageManager::Apt => command.env("DEBIAN_FRONTEND", "noninteractive"),
            PackageManager::Zypper => command.arg("--non-interactive"),
            _ => command,
        }
    }

    fn update_cache(&self) -> CommandSpec {
        let command = self.base();
        match self.manager {
            PackageManager::Apt | PackageManager::Apk => command.arg("update"),
            PackageManager::Dnf | PackageManager::Yum => command.arg("makecache"),
            PackageManager::Zypper => command.arg("refresh"),
            PackageManager::Pacman => command.args(["-Sy", "--noconfirm"]),
        }
    }

    fn install(&self, name: &str, version: Option<&str>, force: bool) -> CommandSpec {
        let pinned = |separator: char| match version {
            Some(version) => format!("{name}{separator}{version}"),
            None => name.to_string(),
        };
        let command = self.base();
        match self.manager {
            PackageManager::Apt => {
                let command = command.args(["install", "-y"]);
                let command = if force {
                    command.args(["--allow-downgrades", "--allow-change-held-packages"])
                } else {
                    command
                };
                command.arg(pinned('='))
            }
            PackageManager::Dnf | PackageManager::Yum => {
                let command = command.args(["install", "-y"]);
                let command = if force && self.manager == PackageManager::Dnf {
                    command.arg("--allowerasing")
                } else {
                    command
                };
                command.arg(pinned('-'))
            }
            PackageManager::Zypper => {
                let command = command.arg("install");
                let command = if force { command.arg("--oldpackage") } else { command };
                command.arg(pinned('='))
            }
            PackageManager::Pacman => command.args(["-S", "--noconfirm", name]),
            PackageManager::Apk => command.arg("add").arg(pinned('=')),
        }
    }

    fn remove(&self, name: &str) -> CommandSpec {
        let command = self.base();
        match self.manager {
            PackageManager::Apt | PackageManager::Dnf | PackageManager::Yum => {
                command.args(["remove", "-y", name])
            }
            PackageManager::Zypper => command.args(["remove", name]),
            PackageManager::Pacman => command.args(["-R", "--noconfirm", name]),
            PackageManager::Apk => command.args(["del", name]),
        }
    }
}

impl ResourceDriver for PackageDriver<'_> {
    fn id(&self) -> String {
        format!("package:{}:{}", self.spec.distribution, self.spec.name)
    }

    fn description(&self) -> String {
        match (&self.spec.state, &self.spec.version) {
            (Presence::Absent, _) => {
                format!("package {} absent from {}", self.spec.name, self.spec.distribution)
            }
            (Presence::Present, Some(version)) => format!(
                "package {} {} in {}",
                self.spec.name, version, self.spec.distribution
            ),
            (Presence::Present, None) => {
                format!("package {} in {}", self.spec.name, self.spec.distribution)
            }
        }
    }

    fn resource_type(&self) -> &'static str {
        "package"
    }

    fn distribution(&self) -> &str {
        &self.spec.distribution
    }

    fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState> {
        ctx.inspector
            .package(&self.spec.distribution, &self.spec.name)
            .map(ObservedState::Package)
    }

    fn default_state(&self) -> ObservedState {
        ObservedState::Package(PackageState::absent(&self.spec.name))
    }

    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan> {
        let current = observed
            .as_package()
            .ok_or_else(|| snapshot_mismatch(&self.id(), observed))?;
        let name = &self.spec.name;
        let target = guest(&self.spec.distribution);
        let mut plan = Plan::new();

        if self.spec.state == Presence::Absent {
            if current.installed {
                let manager = resolve_manager(ctx, current, &self.spec.distribution)?;
                let commands = Commands { ctx, manager };
                plan.push(Operation::command(
                    format!("remove {name}"),
                    &target,
                    commands.remove(name),
                ));
            }
            return Ok(plan);
        }

        let manager = resolve_manager(ctx, current, &self.spec.distribution)?;
        let wanted = self.spec.version.as_deref();
        if wanted.is_some() && !manager.supports_version_pinning() {
            return Err(Error::spec(format!(
                "{manager} cannot install a specific version of {name}"
            )));
        }

        let commands = Commands { ctx, manager };
        if self.spec.update_cache {
            plan.push(Operation::preparation(
                format!("refresh {manager} package cache"),
                &target,
                commands.update_cache(),
            ));
        }

        let version_differs = wanted.is_some_and(|v| current.version.as_deref() != Some(v));
        if !current.installed || version_differs {
            let description = match (current.version.as_deref(), wanted) {
                (Some(from), Some(to)) if current.installed => {
                    format!("change {name} from {from} to {to}")
                }
                (_, Some(to)) => format!("install {name} {to}"),
                (_, None) => format!("install {name}"),
            };
            plan.push(Operation::command(
                description,
                &target,
                commands.install(name, wanted, self.spec.force),
            ));
        }

        Ok(plan)
    }
}

fn resolve_manager(
    ctx: &DriverContext<'_>,
    current: &PackageState,
    distribution: &str,
) -> Result<PackageManager> {
    match current.manager {
        Some(manager) => Ok(manager),
        None => ctx.inspector.package_manager(distribution),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeHost;

    fn plan_with(
        manager: PackageManager,
        spec: &PackageSpec,
        current: PackageState,
    ) -> Result<Plan> {
        let host = FakeHost::new();
        let ctx = DriverContext::new(&host);
        let current = PackageState {
            manager: Some(manager),
            ..current
        };
        PackageDriver::new(spec).plan(&ctx, &ObservedState::Package(current))
    }

    fn installed(version: &str) -> PackageState {
        PackageState {
            name: "curl".into(),
            installed: true,
            version: Some(version.into()),
            manager: None,
        }
    }

    #[test]
    fn test_absent_when_not_installed_is_noop() {
        let spec = PackageSpec::new("Ubuntu", "curl").state(Presence::Absent);
        let plan = plan_with(PackageManager::Apt, &spec, PackageState::absent("curl")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_any_version_satisfies_present() {
        let spec = PackageSpec::new("Ubuntu", "curl");
        let plan = plan_with(PackageManager::Apt, &spec, installed("7.81.0-1")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_exact_version_required_when_specified() {
        let spec = PackageSpec::new("Ubuntu", "curl").version("8.5.0-2");
        let plan = plan_with(PackageManager::Apt, &spec, installed("7.81.0-1")).unwrap();
        assert_eq!(plan.descriptions(), vec!["change curl from 7.81.0-1 to 8.5.0-2"]);
        let op = &plan.operations()[0];
        assert_eq!(op.command_line().unwrap(), "apt-get install -y curl=8.5.0-2");
    }

    #[test]
    fn test_cache_update_is_preparation() {
        let mut spec = PackageSpec::new("Fedora", "git");
        spec.update_cache = true;
        let plan = plan_with(PackageManager::Dnf, &spec, installed("2.43.0-1.fc39")).unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.operations()[0].command_line().unwrap(), "dnf makecache");

        let plan = plan_with(PackageManager::Dnf, &spec, PackageState::absent("git")).unwrap();
        assert_eq!(
            plan.iter().map(|op| op.command_line().unwrap()).collect::<Vec<_>>(),
            vec!["dnf makecache", "dnf install -y git"]
        );
    }

    #[test]
    fn test_pacman_rejects_version_pin() {
        let spec = PackageSpec::new("Arch", "git").version("2.43.0-1");
        let err =
            plan_with(PackageManager::Pacman, &spec, PackageState::absent("git")).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_manager_specific_commands() {
        let spec = PackageSpec::new("Alpine", "curl").version("8.5.0-r0");
        let plan = plan_with(PackageManager::Apk, &spec, PackageState::absent("curl")).unwrap();
        assert_eq!(plan.operations()[0].command_line().unwrap(), "apk add curl=8.5.0-r0");

        let spec = PackageSpec::new("Tumbleweed", "curl").state(Presence::Absent);
        let plan = plan_with(PackageManager::Zypper, &spec, installed("8.5.0")).unwrap();
        assert_eq!(
            plan.operations()[0].command_line().unwrap(),
            "zypper --non-interactive remove curl"
        );
    }
}

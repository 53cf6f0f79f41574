//! systemd and sysvinit services.
//!
//! Run state and boot enablement are independent dimensions. Each one is
//! compared on its own and left alone when unspecified. Run-state changes
//! are ordered before enablement changes.

use crate::desired::{ServiceEnsure, ServiceSpec};
use crate::driver::{DriverContext, ResourceDriver, guest, snapshot_mismatch};
use crate::error::Result;
use crate::exec::CommandSpec;
use crate::observed::{InitSystem, ObservedState, ServiceState};
use crate::plan::{Operation, Plan};

#[derive(Debug)]
pub struct ServiceDriver<'a> {
    spec: &'a ServiceSpec,
}

impl<'a> ServiceDriver<'a> {
    pub fn new(spec: &'a ServiceSpec) -> Self {
        Self { spec }
    }

    fn run_command(&self, ctx: &DriverContext<'_>, action: &str) -> CommandSpec {
        let name = self.spec.name.as_str();
        match self.spec.init {
            InitSystem::Systemd => ctx.command("systemctl").args([action, name]),
            InitSystem::Sysvinit => ctx.command("service").args([name, action]),
        }
    }

    fn enable_command(&self, ctx: &DriverContext<'_>, enable: bool) -> CommandSpec {
        let name = self.spec.name.as_str();
        let action = if enable { "enable" } else { "disable" };
        match self.spec.init {
            InitSystem::Systemd => ctx.command("systemctl").args([action, name]),
            InitSystem::Sysvinit => ctx
                .command("update-rc.d")
                .args([name, action, self.spec.runlevel.as_str()]),
        }
    }
}

impl ResourceDriver for ServiceDriver<'_> {
    fn id(&self) -> String {
        format!("service:{}:{}", self.spec.distribution, self.spec.name)
    }

    fn description(&self) -> String {
        format!(
            "{} service {} in {}",
            self.spec.init, self.spec.name, self.spec.distribution
        )
    }

    fn resource_type(&self) -> &'static str {
        match self.spec.init {
            InitSystem::Systemd => "systemd",
            InitSystem::Sysvinit => "sysvinit",
        }
    }

    fn distribution(&self) -> &str {
        &self.spec.distribution
    }

    fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState> {
        ctx.inspector
            .service(
                &self.spec.distribution,
                &self.spec.name,
                self.spec.init,
                &self.spec.runlevel,
            )
            .map(ObservedState::Service)
    }

    fn default_state(&self) -> ObservedState {
        ObservedState::Service(ServiceState {
            name: self.spec.name.clone(),
            init: self.spec.init,
            exists: false,
            running: false,
            enabled: false,
        })
    }

    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan> {
        let current = observed
            .as_service()
            .ok_or_else(|| snapshot_mismatch(&self.id(), observed))?;
        let name = &self.spec.name;
        let target = guest(&self.spec.distribution);
        let mut plan = Plan::new();

        if self.spec.daemon_reload && self.spec.init == InitSystem::Systemd {
            plan.push(Operation::preparation(
                "reload systemd units",
                &target,
                ctx.command("systemctl").arg("daemon-reload"),
            ));
        }

        match self.spec.state {
            Some(ServiceEnsure::Started) if !current.running => {
                plan.push(Operation::command(
                    format!("start {name}"),
                    &target,
                    self.run_command(ctx, "start"),
                ));
            }
            Some(ServiceEnsure::Stopped) if current.running => {
                plan.push(Operation::command(
                    format!("stop {name}"),
                    &target,
                    self.run_command(ctx, "stop"),
                ));
            }
            _ => {}
        }

        match self.spec.enabled {
            Some(true) if !current.enabled => {
                plan.push(Operation::command(
                    format!("enable {name}"),
                    &target,
                    self.enable_command(ctx, true),
                ));
            }
            Some(false) if current.enabled => {
                plan.push(Operation::command(
                    format!("disable {name}"),
                    &target,
                    self.enable_command(ctx, false),
                ));
            }
            _ => {}
        }

        Ok(plan)
    }
}

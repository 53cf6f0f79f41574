//! Distribution lifecycle: install or import, start, stop, convert, remove.

use crate::desired::{AcquisitionMethod, InstanceEnsure, InstanceSpec};
use crate::driver::{DriverContext, ResourceDriver, guest, snapshot_mismatch};
use crate::error::Result;
use crate::fetch::{FetchRequest, Source, SourceFormat};
use crate::inspect::WSL_EXE;
use crate::observed::{InstanceState, ObservedState};
use crate::plan::{Operation, Plan};
use crate::target::TargetEnvironment;

/// Version used for new distributions when none is requested.
const DEFAULT_VERSION: u8 = 2;

#[derive(Debug)]
pub struct InstanceDriver<'a> {
    spec: &'a InstanceSpec,
}

impl<'a> InstanceDriver<'a> {
    pub fn new(spec: &'a InstanceSpec) -> Self {
        Self { spec }
    }

    /// Operations that create the distribution. Returns whether it will be
    /// running afterwards.
    fn plan_create(&self, ctx: &DriverContext<'_>, plan: &mut Plan) -> Result<bool> {
        let name = &self.spec.name;
        let host = TargetEnvironment::Host;

        match self.spec.method {
            AcquisitionMethod::Install => {
                let mut command = ctx
                    .long_command(WSL_EXE)
                    .args(["--install", "--distribution", name.as_str()]);
                if self.spec.web_download {
                    command = command.arg("--web-download");
                }
                if self.spec.no_launch {
                    command = command.arg("--no-launch");
                }
                plan.push(Operation::command(
                    format!("install distribution {name}"),
                    &host,
                    command,
                ));

                let mut running = !self.spec.no_launch;
                let version = self.spec.version.unwrap_or(DEFAULT_VERSION);
                if version != DEFAULT_VERSION {
                    plan.push(self.set_version(ctx, version));
                    running = false;
                }
                Ok(running)
            }
            AcquisitionMethod::Import => {
                // validate() guarantees both are present for imports
                let source = self.spec.source.clone().unwrap_or_default();
                let install_dir = self.spec.install_dir.clone().unwrap_or_default();
                let format = self.spec.source_format();
                let version = self.spec.version.unwrap_or(DEFAULT_VERSION);

                let mut request =
                    FetchRequest::new(source.clone()).extract(format == SourceFormat::Bundle);
                request.algorithm = self.spec.algorithm;
                request.checksum = self.spec.checksum.clone();
                request.retain_on_failure = !self.spec.cleanup;

                let description = match &self.spec.checksum {
                    Some(_) => format!("fetch and verify {source} ({})", self.spec.algorithm),
                    None => format!("fetch {source}"),
                };
                plan.push(Operation::fetch(description, request));
                plan.push(Operation::import(
                    name.clone(),
                    install_dir,
                    version,
                    format == SourceFormat::Vhd,
                ));

                let staged = Source::parse(&source).is_remote() || format == SourceFormat::Bundle;
                if self.spec.cleanup && staged {
                    plan.push(Operation::cleanup());
                }
                Ok(false)
            }
        }
    }

    fn set_version(&self, ctx: &DriverContext<'_>, version: u8) -> Operation {
        let name = &self.spec.name;
        Operation::command(
            format!("convert distribution {name} to WSL {version}"),
            &TargetEnvironment::Host,
            ctx.long_command(WSL_EXE)
                .args(["--set-version", name.as_str(), version.to_string().as_str()]),
        )
    }
}

impl ResourceDriver for InstanceDriver<'_> {
    fn id(&self) -> String {
        format!("instance:{}", self.spec.name)
    }

    fn description(&self) -> String {
        format!("WSL distribution {}", self.spec.name)
    }

    fn resource_type(&self) -> &'static str {
        "instance"
    }

    fn distribution(&self) -> &str {
        &self.spec.name
    }

    fn requires_distribution(&self) -> bool {
        false
    }

    fn validate(&self) -> Result<()> {
        self.spec.validate()
    }

    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState> {
        ctx.inspector.instance(&self.spec.name).map(ObservedState::Instance)
    }

    fn default_state(&self) -> ObservedState {
        ObservedState::Instance(InstanceState::absent(&self.spec.name))
    }

    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan> {
        let current = observed
            .as_instance()
            .ok_or_else(|| snapshot_mismatch(&self.id(), observed))?;
        let name = &self.spec.name;
        let host = TargetEnvironment::Host;
        let mut plan = Plan::new();

        if self.spec.state == InstanceEnsure::Absent {
            if current.exists {
                plan.push(Operation::command(
                    format!("unregister distribution {name}"),
                    &host,
                    ctx.long_command(WSL_EXE).args(["--unregister", name.as_str()]),
                ));
            }
            return Ok(plan);
        }

        let mut running = if current.exists {
            let mut running = current.running;
            if let Some(version) = self.spec.version
                && current.version != Some(version)
            {
                plan.push(self.set_version(ctx, version));
                running = false;
            }
            running
        } else {
            self.plan_create(ctx, &mut plan)?
        };

        match self.spec.state {
            InstanceEnsure::Run if !running => {
                plan.push(Operation::command(
                    format!("start distribution {name}"),
                    &guest(name),
                    ctx.command("true"),
                ));
                running = true;
            }
            InstanceEnsure::Stop if running => {
                plan.push(Operation::command(
                    format!("terminate distribution {name}"),
                    &host,
                    ctx.command(WSL_EXE).args(["--terminate", name.as_str()]),
                ));
                running = false;
            }
            _ => {}
        }
        log::debug!(
            "{}: planned {} operation(s), running afterwards: {}",
            self.id(),
            plan.len(),
            running
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeHost;
    use crate::plan::OperationKind;

    fn plan_for(spec: &InstanceSpec, observed: InstanceState) -> Plan {
        let host = FakeHost::new();
        let ctx = DriverContext::new(&host);
        InstanceDriver::new(spec)
            .plan(&ctx, &ObservedState::Instance(observed))
            .unwrap()
    }

    fn existing(running: bool, version: u8) -> InstanceState {
        InstanceState {
            name: "Ubuntu".into(),
            exists: true,
            running,
            version: Some(version),
            default: true,
        }
    }

    #[test]
    fn test_absent_is_noop_when_missing() {
        let spec = InstanceSpec::new("Ubuntu").state(InstanceEnsure::Absent);
        assert!(plan_for(&spec, InstanceState::absent("Ubuntu")).is_empty());

        let plan = plan_for(&spec, existing(true, 2));
        assert_eq!(plan.descriptions(), vec!["unregister distribution Ubuntu"]);
    }

    #[test]
    fn test_run_and_stop_only_when_state_differs() {
        let run = InstanceSpec::new("Ubuntu").state(InstanceEnsure::Run);
        assert!(plan_for(&run, existing(true, 2)).is_empty());
        assert_eq!(
            plan_for(&run, existing(false, 2)).descriptions(),
            vec!["start distribution Ubuntu"]
        );

        let stop = InstanceSpec::new("Ubuntu").state(InstanceEnsure::Stop);
        assert!(plan_for(&stop, existing(false, 2)).is_empty());
        assert_eq!(
            plan_for(&stop, existing(true, 2)).descriptions(),
            vec!["terminate distribution Ubuntu"]
        );
    }

    #[test]
    fn test_install_with_flags() {
        let mut spec = InstanceSpec::new("Ubuntu").state(InstanceEnsure::Stop);
        spec.web_download = true;
        let plan = plan_for(&spec, InstanceState::absent("Ubuntu"));

        assert_eq!(
            plan.operations()[0].command_line().unwrap(),
            "wsl.exe --install --distribution Ubuntu --web-download"
        );
        // Launched after install, so stopping is needed
        assert_eq!(plan.descriptions()[1], "terminate distribution Ubuntu");
    }

    #[test]
    fn test_import_plan_order() {
        let spec = InstanceSpec::import("Dev", "https://example.com/rootfs.tar.gz", "C:\\WSL\\Dev")
            .version(1)
            .state(InstanceEnsure::Run);
        let plan = plan_for(&spec, InstanceState::absent("Dev"));

        let kinds: Vec<&OperationKind> = plan.iter().map(|op| &op.kind).collect();
        assert!(matches!(kinds[0], OperationKind::Fetch(_)));
        assert!(matches!(
            kinds[1],
            OperationKind::Import { version: 1, vhd: false, .. }
        ));
        assert!(matches!(kinds[2], OperationKind::Cleanup));
        assert_eq!(plan.descriptions()[3], "start distribution Dev");
    }

    #[test]
    fn test_import_local_tar_needs_no_cleanup() {
        let spec = InstanceSpec::import("Dev", "C:\\images\\rootfs.tar", "C:\\WSL\\Dev");
        let plan = plan_for(&spec, InstanceState::absent("Dev"));
        assert_eq!(plan.len(), 2);
        assert!(!plan.iter().any(|op| matches!(op.kind, OperationKind::Cleanup)));
    }

    #[test]
    fn test_version_conversion_for_existing() {
        let spec = InstanceSpec::new("Ubuntu").version(1).state(InstanceEnsure::Run);
        let plan = plan_for(&spec, existing(true, 2));
        // Conversion stops the distribution, so it is started again
        assert_eq!(
            plan.descriptions(),
            vec!["convert distribution Ubuntu to WSL 1", "start distribution Ubuntu"]
        );
    }
}

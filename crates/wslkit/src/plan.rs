//! Plans: ordered operations computed from desired and observed state.
//!
//! A plan is computed from scratch for every pass and never edited after
//! the driver returns it.

use serde::Serialize;

use crate::exec::CommandSpec;
use crate::fetch::FetchRequest;
use crate::target::TargetEnvironment;

/// What an operation does.
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// Run a command through the executor.
    Command(CommandSpec),
    /// Fetch and validate an artifact into staging.
    Fetch(FetchRequest),
    /// `wsl --import` the artifact fetched earlier in the same plan.
    Import {
        distribution: String,
        install_dir: String,
        version: u8,
        vhd: bool,
    },
    /// Remove the staging directory of the fetched artifact.
    Cleanup,
}

/// One atomic step of a plan.
#[derive(Debug, Clone)]
pub struct Operation {
    pub description: String,
    pub target: TargetEnvironment,
    pub kind: OperationKind,
    /// Preparation steps (daemon-reload, cache refresh) do not count as
    /// changes by themselves.
    pub converging: bool,
}

impl Operation {
    /// A converging command.
    pub fn command(
        description: impl Into<String>,
        target: &TargetEnvironment,
        command: CommandSpec,
    ) -> Self {
        Self {
            description: description.into(),
            target: target.clone(),
            kind: OperationKind::Command(command),
            converging: true,
        }
    }

    /// A preparation command that never makes a plan "changed" alone.
    pub fn preparation(
        description: impl Into<String>,
        target: &TargetEnvironment,
        command: CommandSpec,
    ) -> Self {
        Self {
            converging: false,
            ..Self::command(description, target, command)
        }
    }

    pub fn fetch(description: impl Into<String>, request: FetchRequest) -> Self {
        Self {
            description: description.into(),
            target: TargetEnvironment::Host,
            kind: OperationKind::Fetch(request),
            converging: true,
        }
    }

    pub fn import(
        distribution: impl Into<String>,
        install_dir: impl Into<String>,
        version: u8,
        vhd: bool,
    ) -> Self {
        let distribution = distribution.into();
        Self {
            description: format!("import distribution {distribution}"),
            target: TargetEnvironment::Host,
            kind: OperationKind::Import {
                distribution,
                install_dir: install_dir.into(),
                version,
                vhd,
            },
            converging: true,
        }
    }

    pub fn cleanup() -> Self {
        Self {
            description: "remove staged artifact".to_string(),
            target: TargetEnvironment::Host,
            kind: OperationKind::Cleanup,
            converging: false,
        }
    }

    /// Command line for display, if this runs a command.
    pub fn command_line(&self) -> Option<String> {
        match &self.kind {
            OperationKind::Command(command) => Some(command.display()),
            _ => None,
        }
    }

    /// Serializable summary for reports.
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            description: self.description.clone(),
            target: self.target.to_string(),
            command: self.command_line(),
            converging: self.converging,
        }
    }
}

/// Display form of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationSummary {
    pub description: String,
    pub target: String,
    pub command: Option<String>,
    pub converging: bool,
}

/// Ordered operations for one entity.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    operations: Vec<Operation>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn extend(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.operations.extend(operations);
    }

    /// Whether any operation converges the entity.
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.converging)
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }

    /// Descriptions in order.
    pub fn descriptions(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.description.as_str()).collect()
    }

    pub fn summaries(&self) -> Vec<OperationSummary> {
        self.operations.iter().map(Operation::summary).collect()
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

//! Resource drivers.
//!
//! One driver per entity type. A driver inspects observed state and turns
//! the difference to its specification into a [`Plan`]; the reconciler owns
//! applying it. Adding an entity type means adding a driver and a
//! [`DesiredState`](crate::desired::DesiredState) variant, nothing else.

mod file;
mod instance;
mod package;
mod service;
mod user;

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, CommandSpec, DEFAULT_TIMEOUT};
use crate::inspect::StateInspector;
use crate::observed::ObservedState;
use crate::plan::Plan;
use crate::target::TargetEnvironment;

pub use file::FileDriver;
pub use instance::InstanceDriver;
pub use package::PackageDriver;
pub use service::ServiceDriver;
pub use user::UserDriver;

/// Default timeout for installs, imports and version conversions.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Shell snippets the drivers run. Arguments are always passed as
/// positional parameters, never interpolated.
pub mod script {
    /// Replace `$1` with stdin.
    pub const WRITE: &str = "cat > \"$1\"";
    /// Append stdin to `$1`.
    pub const APPEND: &str = "cat >> \"$1\"";
    /// Write a sudoers drop-in `$1` from stdin.
    pub const SUDOERS: &str = "cat > \"$1\" && chmod 0440 \"$1\"";
    /// Install stdin as the authorized keys of user `$1` with home `$2`.
    pub const AUTHORIZED_KEYS: &str = "umask 077 && mkdir -p \"$2/.ssh\" && cat > \"$2/.ssh/authorized_keys\" && chown -R \"$1:\" \"$2/.ssh\"";
    /// Succeeds when binary `$1` is on PATH.
    pub const COMMAND_EXISTS: &str = "command -v \"$1\"";
}

/// Everything a driver may use while inspecting and planning.
pub struct DriverContext<'a> {
    pub executor: &'a dyn CommandExecutor,
    pub inspector: StateInspector<'a>,
    /// Timeout for ordinary commands.
    pub timeout: Duration,
    /// Timeout for installs, imports and conversions.
    pub install_timeout: Duration,
}

impl<'a> DriverContext<'a> {
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self {
            executor,
            inspector: StateInspector::new(executor),
            timeout: DEFAULT_TIMEOUT,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, install_timeout: Duration) -> Self {
        self.inspector = self.inspector.with_timeout(timeout);
        self.timeout = timeout;
        self.install_timeout = install_timeout;
        self
    }

    /// A command with the ordinary timeout.
    pub fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.timeout)
    }

    /// A command with the install timeout.
    pub fn long_command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.install_timeout)
    }

    /// `sh -c <script> sh <args...>`.
    pub fn script<I, S>(&self, script: &str, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command("sh").args(["-c", script, "sh"]).args(args)
    }
}

/// Inspect/plan strategy for one entity type.
pub trait ResourceDriver: Send + Sync + fmt::Debug {
    /// Stable identifier, e.g. `file:Ubuntu:/etc/motd`.
    fn id(&self) -> String;

    /// Human-readable description.
    fn description(&self) -> String;

    /// Entity type tag.
    fn resource_type(&self) -> &'static str;

    /// Distribution the entity is, or lives in.
    fn distribution(&self) -> &str;

    /// Whether the distribution must be running before inspection.
    ///
    /// False only for the instance driver, which manages the distribution
    /// itself.
    fn requires_distribution(&self) -> bool {
        true
    }

    /// Reject inconsistent specifications before touching anything.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Query the current state.
    fn inspect(&self, ctx: &DriverContext<'_>) -> Result<ObservedState>;

    /// Snapshot used when the entity cannot be inspected.
    fn default_state(&self) -> ObservedState;

    /// Compute the ordered operations that converge `observed` to the
    /// specification.
    fn plan(&self, ctx: &DriverContext<'_>, observed: &ObservedState) -> Result<Plan>;
}

/// Target for commands inside a distribution.
pub(crate) fn guest(distribution: &str) -> TargetEnvironment {
    TargetEnvironment::Distribution(distribution.to_string())
}

/// A driver was handed a snapshot of the wrong entity type.
pub(crate) fn snapshot_mismatch(id: &str, observed: &ObservedState) -> Error {
    Error::inspection(
        id,
        format!("unexpected {} snapshot", observed.entity_type()),
    )
}

//! # wslkit
//!
//! Idempotent reconciliation of WSL distributions and of the files,
//! packages, services and users inside them.
//!
//! Every entity follows the same cycle: inspect current state, compute an
//! ordered plan of operations from the difference to the desired state,
//! apply the plan (unless dry-running), and inspect again. Applying the same
//! desired state twice in a row reports no change the second time.
//!
//! ## Example
//!
//! ```no_run
//! use wslkit::{DesiredState, ReconcileOptions, Reconciler};
//! use wslkit::desired::{FileSpec, PackageSpec};
//! use wslkit::exec::ProcessExecutor;
//! use wslkit::fetch::ArtifactFetcher;
//!
//! let reconciler = Reconciler::new(
//!     Box::new(ProcessExecutor::new()),
//!     ArtifactFetcher::new(ArtifactFetcher::default_staging_root()),
//! );
//!
//! let motd = DesiredState::from(
//!     FileSpec::new("Ubuntu", "/etc/motd").content("hello\n").mode("644"),
//! );
//! let result = reconciler
//!     .reconcile(&motd, &ReconcileOptions::default())
//!     .expect("reconcile failed");
//! println!("changed: {}", result.changed);
//!
//! // Dry run: plan only
//! let curl = DesiredState::from(PackageSpec::new("Ubuntu", "curl"));
//! let plan = reconciler.plan(&curl, &ReconcileOptions::default()).expect("plan failed");
//! for op in &plan.plan {
//!     println!("would {}", op.description);
//! }
//! ```
//!
//! ## Testing
//!
//! All command execution goes through [`exec::CommandExecutor`].
//! [`exec::FakeHost`] implements it against an in-memory host, so a whole
//! reconciliation can be exercised without Windows.

#![warn(clippy::all)]

pub mod checksum;
pub mod desired;
pub mod driver;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod inspect;
pub mod observed;
pub mod plan;
pub mod reconciler;
pub mod retry;
pub mod secret;
pub mod target;

pub use desired::DesiredState;
pub use error::{Error, ErrorCategory, Result};
pub use exec::{CommandExecutor, CommandOutput, CommandSpec};
pub use inspect::StateInspector;
pub use observed::ObservedState;
pub use reconciler::{CancelToken, ReconcileOptions, ReconciliationResult, Reconciler};
pub use retry::RetryConfig;
pub use secret::Secret;
pub use target::TargetEnvironment;

//! The reconciler: inspect, plan, apply, re-inspect.
//!
//! One call reconciles exactly one entity and applies its operations
//! strictly in order. A failing operation stops the pass; nothing is rolled
//! back, and the diagnostics say how far it got. Re-running is the recovery
//! path, since every plan is recomputed from fresh observed state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checksum::ChecksumAlgorithm;
use crate::desired::DesiredState;
use crate::driver::{DEFAULT_INSTALL_TIMEOUT, DriverContext, ResourceDriver};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, CommandSpec, DEFAULT_TIMEOUT};
use crate::fetch::{Artifact, ArtifactFetcher};
use crate::inspect::WSL_EXE;
use crate::observed::ObservedState;
use crate::plan::{Operation, OperationKind, OperationSummary, Plan};
use crate::retry::{self, RetryConfig};
use crate::target::TargetEnvironment;

/// Cooperative cancellation, checked between operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Running operations finish first.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for one reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Plan only; nothing is applied.
    pub dry_run: bool,
    pub cancel: CancelToken,
    /// Attempts to reach a stopped distribution before inspecting it.
    pub start_retry: RetryConfig,
    /// Timeout for ordinary commands.
    pub timeout: Duration,
    /// Timeout for installs, imports and conversions.
    pub install_timeout: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            cancel: CancelToken::default(),
            start_retry: RetryConfig::start_once(),
            timeout: DEFAULT_TIMEOUT,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

impl ReconcileOptions {
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { exit_code: Option<i32> },
    Failed { exit_code: Option<i32>, error: String },
    /// Would run, but this was a dry run.
    Planned,
}

/// Record of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub operation: String,
    pub target: String,
    pub command: Option<String>,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
}

impl Diagnostic {
    fn new(operation: &Operation, outcome: Outcome, started_at: DateTime<Utc>) -> Self {
        Self {
            operation: operation.description.clone(),
            target: operation.target.to_string(),
            command: operation.command_line(),
            outcome,
            started_at,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// A field that differs between the before and after snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// A staged artifact used by an instance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    #[serde(flatten)]
    pub artifact: Artifact,
    /// Whether staging was removed.
    pub cleaned_up: bool,
    /// Why removal failed; never fatal.
    pub cleanup_error: Option<String>,
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub id: String,
    pub changed: bool,
    pub dry_run: bool,
    pub before: ObservedState,
    pub after: ObservedState,
    /// Planned operations, in order.
    pub plan: Vec<OperationSummary>,
    pub diagnostics: Vec<Diagnostic>,
    pub diff: Vec<FieldChange>,
    pub artifacts: Vec<ArtifactReport>,
}

/// Top-level fields that differ between two snapshots.
pub fn diff_states(before: &ObservedState, after: &ObservedState) -> Vec<FieldChange> {
    let (Ok(serde_json::Value::Object(before)), Ok(serde_json::Value::Object(after))) =
        (serde_json::to_value(before), serde_json::to_value(after))
    else {
        return Vec::new();
    };

    let mut changes: Vec<FieldChange> = after
        .iter()
        .filter(|(field, _)| field.as_str() != "type")
        .filter_map(|(field, value)| {
            let old = before.get(field).cloned().unwrap_or(serde_json::Value::Null);
            (old != *value).then(|| FieldChange {
                field: field.clone(),
                before: old,
                after: value.clone(),
            })
        })
        .collect();
    changes.sort_by(|a, b| a.field.cmp(&b.field));
    changes
}

/// State shared by the operations of one apply.
#[derive(Default)]
struct ApplyScope {
    artifact: Option<Artifact>,
    reports: Vec<ArtifactReport>,
}

/// Drives desired state to convergence through a command executor.
pub struct Reconciler {
    executor: Box<dyn CommandExecutor>,
    fetcher: ArtifactFetcher,
}

impl Reconciler {
    pub fn new(executor: Box<dyn CommandExecutor>, fetcher: ArtifactFetcher) -> Self {
        Self { executor, fetcher }
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    pub fn fetcher(&self) -> &ArtifactFetcher {
        &self.fetcher
    }

    /// Reconcile one entity with its built-in driver.
    pub fn reconcile(
        &self,
        desired: &DesiredState,
        options: &ReconcileOptions,
    ) -> Result<ReconciliationResult> {
        let driver = desired.driver();
        self.reconcile_with(driver.as_ref(), options)
    }

    /// Compute the plan for one entity without applying it.
    pub fn plan(
        &self,
        desired: &DesiredState,
        options: &ReconcileOptions,
    ) -> Result<ReconciliationResult> {
        let options = options.clone().dry_run(true);
        self.reconcile(desired, &options)
    }

    /// Reconcile one entity with any driver.
    pub fn reconcile_with(
        &self,
        driver: &dyn ResourceDriver,
        options: &ReconcileOptions,
    ) -> Result<ReconciliationResult> {
        driver.validate()?;
        let id = driver.id();
        let ctx = DriverContext::new(self.executor.as_ref())
            .with_timeouts(options.timeout, options.install_timeout);

        let registered = if driver.requires_distribution() {
            self.ensure_distribution(&ctx, driver.distribution(), options)?
        } else {
            true
        };

        let before = if registered {
            self.inspect(driver, &ctx)?
        } else {
            driver.default_state()
        };

        let plan = driver.plan(&ctx, &before).map_err(|e| match e {
            Error::Inspection { message, .. } if !registered => Error::EnvironmentUnavailable {
                distribution: driver.distribution().to_string(),
                message,
            },
            other => other,
        })?;
        let summaries = plan.summaries();
        let changed = plan.has_changes();
        log::debug!("{}: {} operation(s) planned", id, plan.len());

        if options.dry_run {
            let now = Utc::now();
            let diagnostics = plan
                .iter()
                .map(|op| Diagnostic::new(op, Outcome::Planned, now))
                .collect();
            return Ok(ReconciliationResult {
                id,
                changed,
                dry_run: true,
                after: before.clone(),
                before,
                plan: summaries,
                diagnostics,
                diff: Vec::new(),
                artifacts: Vec::new(),
            });
        }

        if plan.is_empty() {
            log::debug!("{}: already converged", id);
            return Ok(ReconciliationResult {
                id,
                changed: false,
                dry_run: false,
                after: before.clone(),
                before,
                plan: summaries,
                diagnostics: Vec::new(),
                diff: Vec::new(),
                artifacts: Vec::new(),
            });
        }

        let (diagnostics, artifacts) = self.apply(&plan, options)?;

        // Preparation steps alone leave the entity as it was
        let after = if changed {
            self.inspect(driver, &ctx)?
        } else {
            before.clone()
        };
        let diff = diff_states(&before, &after);
        if changed {
            log::info!("{}: changed ({} operation(s))", id, diagnostics.len());
        }

        Ok(ReconciliationResult {
            id,
            changed,
            dry_run: false,
            before,
            after,
            plan: summaries,
            diagnostics,
            diff,
            artifacts,
        })
    }

    /// Inspect, treating an unreachable entity as absent.
    fn inspect(
        &self,
        driver: &dyn ResourceDriver,
        ctx: &DriverContext<'_>,
    ) -> Result<ObservedState> {
        match driver.inspect(ctx) {
            Ok(state) => Ok(state),
            Err(Error::Inspection { entity, message }) => {
                log::debug!(
                    "{}: cannot inspect {} ({}), assuming default state",
                    driver.id(),
                    entity,
                    message
                );
                Ok(driver.default_state())
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure the distribution is registered and running.
    ///
    /// Returns false only in dry-run mode when it is not registered, in
    /// which case inspection is skipped.
    fn ensure_distribution(
        &self,
        ctx: &DriverContext<'_>,
        distribution: &str,
        options: &ReconcileOptions,
    ) -> Result<bool> {
        let unavailable = |message: String| Error::EnvironmentUnavailable {
            distribution: distribution.to_string(),
            message,
        };
        let lookup = || -> Result<Option<bool>> {
            let list = ctx
                .inspector
                .distributions()
                .map_err(|e| unavailable(e.to_string()))?;
            Ok(list
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(distribution))
                .map(|d| d.is_running()))
        };

        match lookup()? {
            Some(true) => return Ok(true),
            Some(false) if options.dry_run => return Ok(true),
            None if options.dry_run => return Ok(false),
            None => return Err(unavailable("not registered".to_string())),
            Some(false) => {}
        }

        log::info!("starting distribution {}", distribution);
        let target = TargetEnvironment::distribution(distribution)?;
        let start = CommandSpec::new("true").timeout(options.timeout);
        retry::with_retry(&options.start_retry, "start distribution", || {
            self.executor
                .execute(&target, &start)
                .map_err(|e| unavailable(e.to_string()))?;
            match lookup()? {
                Some(true) => Ok(()),
                Some(false) => Err(unavailable("still not running".to_string())),
                None => Err(unavailable("not registered".to_string())),
            }
        })?;
        Ok(true)
    }

    fn apply(
        &self,
        plan: &Plan,
        options: &ReconcileOptions,
    ) -> Result<(Vec<Diagnostic>, Vec<ArtifactReport>)> {
        let mut scope = ApplyScope::default();
        let mut diagnostics = Vec::with_capacity(plan.len());
        let cleanup_requested = plan.iter().any(|op| matches!(op.kind, OperationKind::Cleanup));

        for operation in plan {
            if options.cancel.is_cancelled() {
                log::warn!("cancelled before '{}'", operation.description);
                self.discard_staging(&mut scope, cleanup_requested);
                return Err(Error::Cancelled { diagnostics });
            }

            let started_at = Utc::now();
            log::info!("[{}] {}", operation.target, operation.description);
            match self.apply_one(operation, &mut scope, options) {
                Ok(exit_code) => {
                    diagnostics.push(Diagnostic::new(
                        operation,
                        Outcome::Success { exit_code },
                        started_at,
                    ));
                }
                Err(error) => {
                    let exit_code = match &error {
                        Error::Execution { exit_code, .. } => *exit_code,
                        _ => None,
                    };
                    diagnostics.push(Diagnostic::new(
                        operation,
                        Outcome::Failed {
                            exit_code,
                            error: error.to_string(),
                        },
                        started_at,
                    ));
                    self.discard_staging(&mut scope, cleanup_requested);
                    return Err(Error::Reconciliation {
                        operation: operation.description.clone(),
                        diagnostics,
                        source: Box::new(error),
                    });
                }
            }
        }

        if let Some(artifact) = scope.artifact.take() {
            scope.reports.push(ArtifactReport {
                artifact,
                cleaned_up: false,
                cleanup_error: None,
            });
        }
        Ok((diagnostics, scope.reports))
    }

    fn apply_one(
        &self,
        operation: &Operation,
        scope: &mut ApplyScope,
        options: &ReconcileOptions,
    ) -> Result<Option<i32>> {
        match &operation.kind {
            OperationKind::Command(command) => {
                let output = self.executor.execute(&operation.target, command)?;
                Ok(output.exit_code)
            }
            OperationKind::Fetch(request) => {
                scope.artifact = Some(self.fetcher.fetch(request)?);
                Ok(None)
            }
            OperationKind::Import {
                distribution,
                install_dir,
                version,
                vhd,
            } => {
                let artifact = scope
                    .artifact
                    .as_ref()
                    .ok_or_else(|| Error::spec("import planned without a fetched artifact"))?;
                let payload = artifact.payload_path().to_string_lossy().to_string();
                let mut command = CommandSpec::new(WSL_EXE)
                    .args([
                        "--import",
                        distribution.as_str(),
                        install_dir.as_str(),
                        payload.as_str(),
                    ])
                    .args(["--version".to_string(), version.to_string()])
                    .timeout(options.install_timeout);
                if *vhd {
                    command = command.arg("--vhd");
                }
                let output = self.executor.execute(&TargetEnvironment::Host, &command)?;
                Ok(output.exit_code)
            }
            OperationKind::Cleanup => {
                if let Some(artifact) = scope.artifact.take() {
                    scope.reports.push(self.cleanup(artifact));
                }
                Ok(None)
            }
        }
    }

    fn cleanup(&self, artifact: Artifact) -> ArtifactReport {
        match self.fetcher.cleanup(&artifact) {
            Ok(()) => ArtifactReport {
                artifact,
                cleaned_up: true,
                cleanup_error: None,
            },
            Err(e) => {
                log::warn!("could not clean up staging for {}: {}", artifact.source, e);
                ArtifactReport {
                    artifact,
                    cleaned_up: false,
                    cleanup_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Remove staging after a failed or cancelled apply when cleanup was
    /// part of the plan.
    fn discard_staging(&self, scope: &mut ApplyScope, cleanup_requested: bool) {
        if let Some(artifact) = scope.artifact.take() {
            if cleanup_requested {
                let report = self.cleanup(artifact);
                scope.reports.push(report);
            } else {
                log::info!("keeping staged artifact {}", artifact.local_path.display());
            }
        }
    }
}

/// Checksum details of an artifact for display.
pub fn describe_artifact(report: &ArtifactReport) -> String {
    let artifact = &report.artifact;
    let digest = match (&artifact.checksum, artifact.algorithm) {
        (Some(sum), Some(algorithm)) => format!(" {}:{}", algorithm, short(sum)),
        (Some(sum), None) => format!(" {}:{}", ChecksumAlgorithm::default(), short(sum)),
        _ => String::new(),
    };
    let staging = if report.cleaned_up { "removed" } else { "kept" };
    format!("{}{} (staging {})", artifact.source, digest, staging)
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

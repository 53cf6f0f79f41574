//! `apply` and `plan`: reconcile every manifest entity.
//!
//! Instances run first, one at a time, since everything else lives inside
//! them. The remaining entities are grouped by distribution; groups run in
//! parallel and entities within a group run in manifest order.

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use wslkit::desired::FileSpec;
use wslkit::observed::ObservedState;
use wslkit::reconciler::{Diagnostic, Outcome, describe_artifact};
use wslkit::{DesiredState, ReconcileOptions, ReconciliationResult, Reconciler};

use crate::Context;
use crate::cli::{ApplyArgs, ManifestArgs, PlanArgs};
use crate::config::{self, Manifest};
use crate::ui;

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Reconciled {
        result: ReconciliationResult,
    },
    Failed {
        error: String,
        category: String,
        advice: String,
        diagnostics: Vec<Diagnostic>,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Serialize)]
pub struct EntityReport {
    pub id: String,
    pub distribution: String,
    #[serde(flatten)]
    pub status: EntityStatus,
    /// Content the file would have afterwards, for plan diffs
    #[serde(skip)]
    pub proposed: Option<String>,
}

impl EntityReport {
    fn skipped(entity: &DesiredState, reason: impl Into<String>) -> Self {
        Self {
            id: entity.driver().id(),
            distribution: entity.distribution().to_string(),
            status: EntityStatus::Skipped {
                reason: reason.into(),
            },
            proposed: None,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(&self.status, EntityStatus::Reconciled { result } if result.changed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, EntityStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, EntityStatus::Skipped { .. })
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub entities: Vec<EntityReport>,
}

impl RunReport {
    fn count(&self, predicate: impl Fn(&EntityReport) -> bool) -> usize {
        self.entities.iter().filter(|&e| predicate(e)).count()
    }
}

// ============================================================================
// Commands
// ============================================================================

pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    run(ctx, &args.manifest, args.dry_run, args.fail_fast, false)
}

pub fn plan(ctx: &Context, args: &PlanArgs) -> Result<()> {
    run(ctx, &args.manifest, true, false, args.diff)
}

fn run(
    ctx: &Context,
    args: &ManifestArgs,
    dry_run: bool,
    fail_fast: bool,
    show_diff: bool,
) -> Result<()> {
    let path = config::find_manifest(args.manifest.as_deref())?;
    let manifest = Manifest::load(&path)?;
    log::info!("Loaded manifest {}", path.display());
    if manifest.is_empty() {
        log::warn!("Manifest {} declares no entities", path.display());
    }

    let entities: Vec<DesiredState> = manifest
        .entities()
        .into_iter()
        .filter(|e| {
            args.distribution
                .as_deref()
                .is_none_or(|d| e.distribution() == d)
        })
        .collect();

    if !ctx.json && !ctx.quiet {
        ui::header(if dry_run { "Plan" } else { "Applying manifest" });
        ui::kv("Manifest", &path.display().to_string());
        if dry_run {
            ui::warn("Dry run - no changes will be made");
        }
    }

    let reconciler = super::reconciler(&manifest.settings);
    let mut options = ReconcileOptions::default().dry_run(dry_run);
    if let Some(timeout) = manifest.settings.timeout() {
        options.timeout = timeout;
    }
    let jobs = manifest.settings.jobs(args.jobs);

    let report = RunReport {
        dry_run,
        entities: run_entities(&reconciler, &entities, &options, jobs, fail_fast)?,
    };

    if ctx.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(ctx, &report, show_diff);
    }

    let failed = report.count(EntityReport::is_failure);
    if failed > 0 {
        bail!(
            "{} of {} entities failed",
            failed,
            report.entities.len()
        );
    }
    Ok(())
}

// ============================================================================
// Orchestration
// ============================================================================

/// Reconcile entities: instances sequentially, then one parallel group per distribution.
///
/// A failed instance skips every entity of its distribution. A failure inside a
/// group skips the rest of that group. With `fail_fast`, the first failure
/// cancels everything still running.
pub fn run_entities(
    reconciler: &Reconciler,
    entities: &[DesiredState],
    options: &ReconcileOptions,
    jobs: usize,
    fail_fast: bool,
) -> Result<Vec<EntityReport>> {
    let (instances, rest): (Vec<&DesiredState>, Vec<&DesiredState>) =
        entities.iter().partition(|e| e.is_instance());

    let mut reports = Vec::with_capacity(entities.len());
    let mut broken: HashSet<String> = HashSet::new();

    for entity in instances {
        if options.cancel.is_cancelled() {
            reports.push(EntityReport::skipped(entity, "cancelled"));
            continue;
        }
        let report = reconcile_one(reconciler, entity, options);
        if report.is_failure() {
            broken.insert(entity.distribution().to_string());
            if fail_fast {
                options.cancel.cancel();
            }
        }
        reports.push(report);
    }

    let groups = group_by_distribution(rest);
    if groups.is_empty() {
        return Ok(reports);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.min(groups.len()))
        .build()
        .context("Failed to build thread pool")?;

    let grouped: Vec<Vec<EntityReport>> = pool.install(|| {
        groups
            .par_iter()
            .map(|(distribution, group)| {
                if broken.contains(distribution) {
                    let reason = format!("instance '{distribution}' failed");
                    return group
                        .iter()
                        .map(|e| EntityReport::skipped(e, reason.as_str()))
                        .collect();
                }
                run_group(reconciler, distribution, group, options, fail_fast)
            })
            .collect()
    });

    reports.extend(grouped.into_iter().flatten());
    Ok(reports)
}

fn run_group(
    reconciler: &Reconciler,
    distribution: &str,
    group: &[&DesiredState],
    options: &ReconcileOptions,
    fail_fast: bool,
) -> Vec<EntityReport> {
    log::info!("Reconciling {} entities in {}", group.len(), distribution);

    let mut reports = Vec::with_capacity(group.len());
    let mut failed: Option<String> = None;

    for entity in group {
        if let Some(id) = &failed {
            reports.push(EntityReport::skipped(entity, format!("'{id}' failed")));
            continue;
        }
        if options.cancel.is_cancelled() {
            reports.push(EntityReport::skipped(entity, "cancelled"));
            continue;
        }

        let report = reconcile_one(reconciler, entity, options);
        if report.is_failure() {
            failed = Some(report.id.clone());
            if fail_fast {
                options.cancel.cancel();
            }
        }
        reports.push(report);
    }

    reports
}

fn reconcile_one(
    reconciler: &Reconciler,
    entity: &DesiredState,
    options: &ReconcileOptions,
) -> EntityReport {
    let id = entity.driver().id();

    let (status, proposed) = match reconciler.reconcile(entity, options) {
        Ok(result) => {
            let proposed = match (entity, &result.before) {
                (DesiredState::File(spec), ObservedState::File(before)) => {
                    proposed_content(spec, before.content.as_deref())
                }
                _ => None,
            };
            (EntityStatus::Reconciled { result }, proposed)
        }
        Err(err) => {
            log::warn!("{id}: {err}");
            let category = err.root().category();
            let status = EntityStatus::Failed {
                error: err.to_string(),
                category: category.to_string(),
                advice: category.advice().to_string(),
                diagnostics: err.diagnostics().to_vec(),
            };
            (status, None)
        }
    };

    EntityReport {
        id,
        distribution: entity.distribution().to_string(),
        status,
        proposed,
    }
}

/// Distributions in order of first appearance, each with its entities in manifest order
fn group_by_distribution(entities: Vec<&DesiredState>) -> Vec<(String, Vec<&DesiredState>)> {
    let mut groups: Vec<(String, Vec<&DesiredState>)> = Vec::new();
    for entity in entities {
        match groups
            .iter_mut()
            .find(|(name, _)| name == entity.distribution())
        {
            Some((_, group)) => group.push(entity),
            None => groups.push((entity.distribution().to_string(), vec![entity])),
        }
    }
    groups
}

/// File content after a write, or `None` when content is not managed
fn proposed_content(spec: &FileSpec, current: Option<&str>) -> Option<String> {
    let content = spec.content.as_deref()?;
    let current = current.unwrap_or_default();
    if !spec.append {
        return Some(content.to_string());
    }
    if current.contains(content) {
        return Some(current.to_string());
    }
    Some(format!("{current}{content}"))
}

// ============================================================================
// Output
// ============================================================================

fn print_report(ctx: &Context, report: &RunReport, show_diff: bool) {
    let mut current: Option<&str> = None;

    for entity in &report.entities {
        if current != Some(entity.distribution.as_str()) {
            ui::section(&entity.distribution);
            current = Some(entity.distribution.as_str());
        }
        print_entity(ctx, entity, show_diff);
    }

    let changed = report.count(EntityReport::changed);
    let failed = report.count(EntityReport::is_failure);
    let skipped = report.count(EntityReport::is_skipped);
    let unchanged = report.entities.len() - changed - failed - skipped;

    println!();
    let verb = if report.dry_run { "to change" } else { "changed" };
    let summary = format!("{changed} {verb}, {unchanged} ok, {failed} failed, {skipped} skipped");
    if failed > 0 {
        ui::error(&summary);
    } else if changed > 0 {
        ui::success(&summary);
    } else {
        ui::info(&summary);
    }
}

fn print_entity(ctx: &Context, entity: &EntityReport, show_diff: bool) {
    match &entity.status {
        EntityStatus::Reconciled { result } => {
            let (icon, label) = match (result.changed, result.dry_run) {
                (false, _) => ("✓".green(), "ok".dimmed()),
                (true, true) => ("→".cyan(), "would change".cyan()),
                (true, false) => ("✓".yellow(), "changed".yellow()),
            };
            println!("  {} {} {}", icon, entity.id.bold(), label);

            if result.dry_run {
                for op in result.plan.iter().filter(|op| op.converging || ctx.verbose > 0) {
                    println!("      {} {}", "→".cyan(), op.description);
                }
                if show_diff
                    && let (ObservedState::File(before), Some(after)) =
                        (&result.before, &entity.proposed)
                {
                    let before = before.content.as_deref().unwrap_or_default();
                    if before != after.as_str() {
                        ui::text_diff(before, after);
                    }
                }
            } else if !ctx.quiet {
                for change in &result.diff {
                    ui::dim(&format!(
                        "    {}: {} → {}",
                        change.field, change.before, change.after
                    ));
                }
            }

            for artifact in &result.artifacts {
                ui::dim(&format!("    artifact: {}", describe_artifact(artifact)));
            }

            if ctx.verbose > 0 {
                print_diagnostics(&result.diagnostics);
            }
        }
        EntityStatus::Failed {
            error,
            category,
            advice,
            diagnostics,
        } => {
            println!("  {} {} {}", "✗".red(), entity.id.bold(), category.red());
            println!("    {}", error.red());
            ui::dim(&format!("  {advice}"));
            print_diagnostics(diagnostics);
        }
        EntityStatus::Skipped { reason } => {
            println!(
                "  {} {} {}",
                "-".dimmed(),
                entity.id,
                format!("skipped: {reason}").dimmed()
            );
        }
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let time = diagnostic
            .started_at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S");
        let status = match &diagnostic.outcome {
            Outcome::Success { .. } => "ok".green(),
            Outcome::Failed { exit_code, error } => match exit_code {
                Some(code) => format!("exit {code}: {error}").red(),
                None => error.red(),
            },
            Outcome::Planned => "planned".cyan(),
        };
        println!(
            "      {} {} {}",
            format!("[{time}]").dimmed(),
            diagnostic.operation,
            status
        );
        if let Some(command) = &diagnostic.command {
            ui::dim(&format!("        $ {command}"));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wslkit::desired::{InstanceSpec, PackageSpec, UserSpec};
    use wslkit::exec::FakeHost;
    use wslkit::fetch::ArtifactFetcher;
    use wslkit::observed::PackageManager;

    fn setup(host: FakeHost) -> (Arc<FakeHost>, Reconciler, tempfile::TempDir) {
        let host = Arc::new(host);
        let staging = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(
            Box::new(Arc::clone(&host)),
            ArtifactFetcher::new(staging.path()),
        );
        (host, reconciler, staging)
    }

    fn two_distributions() -> FakeHost {
        FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_distribution("Debian", 2, true)
            .with_package_manager("Ubuntu", PackageManager::Apt)
            .with_package_manager("Debian", PackageManager::Apt)
    }

    fn motd(distribution: &str) -> DesiredState {
        FileSpec::new(distribution, "/etc/motd")
            .content("welcome\n")
            .into()
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let entities = [
            motd("Ubuntu"),
            motd("Debian"),
            UserSpec::new("Ubuntu", "dev").into(),
        ];
        let groups = group_by_distribution(entities.iter().collect());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "Ubuntu");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "Debian");
    }

    #[test]
    fn test_run_converges_across_distributions() {
        let (host, reconciler, _staging) = setup(two_distributions());
        let entities = [
            motd("Ubuntu"),
            motd("Debian"),
            UserSpec::new("Ubuntu", "dev").into(),
        ];
        let options = ReconcileOptions::default();

        let first = run_entities(&reconciler, &entities, &options, 2, false).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(EntityReport::changed));
        assert_eq!(
            host.file_content("Debian", "/etc/motd").as_deref(),
            Some(&b"welcome\n"[..])
        );
        assert!(host.user_exists("Ubuntu", "dev"));

        let second = run_entities(&reconciler, &entities, &options, 2, false).unwrap();
        assert!(second.iter().all(|r| !r.changed() && !r.is_failure()));
    }

    #[test]
    fn test_failure_skips_rest_of_group_only() {
        let (host, reconciler, _staging) =
            setup(two_distributions().fail_on("useradd", 1, "useradd: cannot lock /etc/passwd"));
        let entities = [
            UserSpec::new("Ubuntu", "dev").into(),
            motd("Ubuntu"),
            motd("Debian"),
        ];

        let reports =
            run_entities(&reconciler, &entities, &ReconcileOptions::default(), 2, false).unwrap();

        assert!(reports[0].is_failure());
        assert!(reports[1].is_skipped());
        assert!(reports[2].changed());
        assert!(host.file_content("Ubuntu", "/etc/motd").is_none());
    }

    #[test]
    fn test_failed_instance_skips_its_distribution() {
        let (host, reconciler, _staging) = setup(two_distributions());
        let entities = [
            InstanceSpec::import("Dev", "/nonexistent/rootfs.tar", "C:\\WSL\\Dev").into(),
            motd("Dev"),
            motd("Ubuntu"),
        ];

        let reports =
            run_entities(&reconciler, &entities, &ReconcileOptions::default(), 4, false).unwrap();

        assert!(reports[0].is_failure());
        assert!(matches!(
            &reports[1].status,
            EntityStatus::Skipped { reason } if reason.contains("Dev")
        ));
        assert!(reports[2].changed());
        assert!(!host.is_registered("Dev"));
    }

    #[test]
    fn test_fail_fast_cancels_remaining_entities() {
        let (_host, reconciler, _staging) = setup(
            two_distributions().fail_on("wsl.exe --import", 1, "import failed"),
        );
        let source = tempfile::NamedTempFile::new().unwrap();
        let entities = [
            InstanceSpec::import(
                "Dev",
                source.path().to_string_lossy(),
                "C:\\WSL\\Dev",
            )
            .into(),
            motd("Ubuntu"),
        ];

        let reports =
            run_entities(&reconciler, &entities, &ReconcileOptions::default(), 1, true).unwrap();

        assert!(reports[0].is_failure());
        assert!(matches!(
            &reports[1].status,
            EntityStatus::Skipped { reason } if reason == "cancelled"
        ));
    }

    #[test]
    fn test_dry_run_reports_without_changing() {
        let (host, reconciler, _staging) = setup(two_distributions());
        let entities = [
            motd("Ubuntu"),
            PackageSpec::new("Debian", "curl").into(),
        ];
        let options = ReconcileOptions::default().dry_run(true);

        let reports = run_entities(&reconciler, &entities, &options, 2, false).unwrap();

        assert!(reports.iter().all(EntityReport::changed));
        assert_eq!(reports[0].proposed.as_deref(), Some("welcome\n"));
        assert!(host.file_content("Ubuntu", "/etc/motd").is_none());
        assert!(host.package_version("Debian", "curl").is_none());
    }

    #[test]
    fn test_proposed_content_for_append() {
        let mut spec = FileSpec::new("Ubuntu", "/etc/hosts").content("10.0.0.1 db\n");
        spec.append = true;

        assert_eq!(
            proposed_content(&spec, Some("127.0.0.1 localhost\n")).as_deref(),
            Some("127.0.0.1 localhost\n10.0.0.1 db\n")
        );
        assert_eq!(
            proposed_content(&spec, Some("10.0.0.1 db\n")).as_deref(),
            Some("10.0.0.1 db\n")
        );
        spec.content = None;
        assert!(proposed_content(&spec, None).is_none());
    }

    #[test]
    fn test_report_json_shape() {
        let (_host, reconciler, _staging) = setup(two_distributions());
        let entities = [motd("Ubuntu"), motd("Nowhere")];

        let report = RunReport {
            dry_run: false,
            entities: run_entities(&reconciler, &entities, &ReconcileOptions::default(), 2, false)
                .unwrap(),
        };
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["entities"][0]["status"], "reconciled");
        assert_eq!(json["entities"][0]["result"]["changed"], true);
        assert_eq!(json["entities"][1]["status"], "failed");
        assert!(json["entities"][1].get("proposed").is_none());
    }
}
